//! Continuous checks of the allocator's two load-bearing invariants — no cell is ever
//! owned by two allocations at once, and the used/free accounting always sums to the
//! soup size — over random sequences of allocate/free calls rather than hand-picked
//! examples.

use proptest::prelude::*;
use tierra_core::allocator::Allocator;

const SOUP_SIZE: usize = 300;

#[derive(Debug, Clone, Copy)]
enum Op {
    Allocate(usize),
    FreeOldest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..=40).prop_map(Op::Allocate),
        Just(Op::FreeOldest),
    ]
}

proptest! {
    #[test]
    fn ownership_and_accounting_stay_consistent(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let mut allocator = Allocator::new(SOUP_SIZE);
        let mut live: Vec<(usize, usize, u64)> = Vec::new(); // (addr, size, alloc_id), oldest first

        for op in ops {
            match op {
                Op::Allocate(size) => {
                    if let Some((addr, alloc_id)) = allocator.allocate(size) {
                        live.push((addr, size, alloc_id));
                    }
                }
                Op::FreeOldest => {
                    if !live.is_empty() {
                        let (addr, size, alloc_id) = live.remove(0);
                        prop_assert!(allocator.free_if_owned(addr, size, alloc_id));
                    }
                }
            }

            // Accounting: used + free always equals the whole soup.
            prop_assert_eq!(allocator.used() + allocator.free_count(), SOUP_SIZE);

            // Ownership disjointness: no two live allocations' ranges overlap, which
            // is the property first-fit is supposed to guarantee by construction.
            for i in 0..live.len() {
                for j in (i + 1)..live.len() {
                    let (addr_a, size_a, _) = live[i];
                    let (addr_b, size_b, _) = live[j];
                    let disjoint = addr_a + size_a <= addr_b || addr_b + size_b <= addr_a;
                    prop_assert!(disjoint, "allocations {:?} and {:?} overlap", live[i], live[j]);
                }
            }
        }

        // Every allocation still outstanding at the end frees cleanly under the
        // exact id it was granted, confirming ownership wasn't silently reassigned.
        for (addr, size, alloc_id) in live {
            prop_assert!(allocator.free_if_owned(addr, size, alloc_id));
        }
        prop_assert_eq!(allocator.used(), 0);
    }
}
