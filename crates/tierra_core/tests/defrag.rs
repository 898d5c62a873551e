//! `ALLOCATE`'s fallback ladder falls through first-fit, then reaping, and only then
//! defrag — exercising that last rung needs a soup fragmented enough that no single
//! free block satisfies the request, but there's enough free space overall that
//! compacting it would. Built here by seeding five organisms, letting two of them
//! fault themselves to death and leave gaps on either side of a third, then having
//! that third organism request more than any single gap holds.

use tierra_core::instruction::{encode, Instruction, RegIdx};
use tierra_core::{SimConfig, Simulator};

fn reg(n: u32) -> RegIdx {
    RegIdx::new(n)
}

fn nop_genome(len: usize) -> Vec<i32> {
    vec![encode(Instruction::Nop); len]
}

/// 19 nops then a jump far outside the soup: by the time the jump lands, the next
/// fetch faults every cycle until `max_errors` is crossed and the organism is killed,
/// freeing its whole block as a gap.
fn self_destructing_genome() -> Vec<i32> {
    let mut genome = nop_genome(19);
    genome.push(encode(Instruction::Jmp { offset: 1000 }));
    genome
}

/// 40 nops (long enough that the two flanking organisms above have already faulted
/// themselves out by the time this reaches the allocate), then `MOVI r4,35;
/// ALLOCATE r4,r3`, then a self-loop so it never faults afterward.
fn allocator_genome() -> Vec<i32> {
    let mut genome = nop_genome(40);
    genome.push(encode(Instruction::Movi { r1: reg(4), imm: 35 }));
    genome.push(encode(Instruction::Allocate { r1: reg(4), r2: reg(3) }));
    genome.push(encode(Instruction::Jmp { offset: -1 }));
    genome
}

fn config(soup_size: usize) -> SimConfig {
    SimConfig {
        soup_size,
        mutation_rate: 0.0,
        max_errors: 5,
        max_organisms: 100,
        max_cycles: 0,
        checkpoint_interval: 0,
        report_interval: 0,
        random_seed: 7,
    }
}

#[test]
fn fragmented_soup_defragments_and_relocates_the_allocating_organism() {
    // a(10) b(20) c(43) d(20) e(10) laid out back to back with no slack, so the
    // fragmentation and total-free-space math below is exact.
    let mut sim = Simulator::new(config(103));
    let a = sim.seed(&nop_genome(10));
    let b = sim.seed(&self_destructing_genome());
    let c = sim.seed(&allocator_genome());
    let d = sim.seed(&self_destructing_genome());
    let e = sim.seed(&nop_genome(10));

    // Cycle 26: b and d have each crossed max_errors and are reaped into gaps,
    // well before c reaches its ALLOCATE at cycle 42.
    sim.run(26, &mut ());
    assert!(!sim.organisms().iter().any(|o| o.id == b), "b should have died from errors");
    assert!(!sim.organisms().iter().any(|o| o.id == d), "d should have died from errors");
    assert_eq!(sim.deaths_by_errors(), 2);

    // Free space: the 20-cell gap b left and the 20-cell gap d left. Largest
    // contiguous block is only 20, but c is about to ask for 35 — satisfiable only
    // by compacting the two gaps together.
    assert_eq!(sim.allocator().free_count(), 40);
    assert_eq!(sim.allocator().largest_free_block(), 20);
    assert!(sim.allocator().fragmentation() >= 0.5);

    sim.run(16, &mut ()); // cycles 27..42: c's ALLOCATE fires on the last one.

    assert_eq!(sim.failed_allocations(), 0, "compaction should have made room for the request");

    let org_a = sim.organisms().iter().find(|o| o.id == a).unwrap();
    let org_c = sim.organisms().iter().find(|o| o.id == c).unwrap();
    let org_e = sim.organisms().iter().find(|o| o.id == e).unwrap();

    // a never had to move; c and e slid down to close the gaps b and d left behind.
    assert_eq!(org_a.start_addr, 0);
    assert_eq!(org_c.start_addr, 10, "c's own code should have been relocated by defrag");
    assert_eq!(org_e.start_addr, 53);

    // The CPU's own view of its address has to agree with the organism table's, or
    // the next fetch reads garbage.
    assert_eq!(org_c.cpu_state.start_addr, org_c.start_addr);

    let pending = org_c.cpu_state.pending_alloc.expect("c's ALLOCATE should have succeeded");
    assert_eq!(pending.size, 35);
    assert_eq!(pending.addr, 63, "the granted block should sit right after the compacted tail");

    assert_eq!(sim.allocator().used(), 10 + 43 + 10 + 35);
    assert_eq!(sim.allocator().free_count(), 5);

    // c loops on itself (JMP -1) after the allocate; if its relocated `start_addr`
    // weren't fixed up, every subsequent fetch would read from the old, now-reused
    // address and fault. A few more cycles of silence proves the relocation stuck.
    let errors_before = org_c.cpu_state.errors;
    sim.run(5, &mut ());
    let org_c = sim.organisms().iter().find(|o| o.id == c).unwrap();
    assert_eq!(org_c.cpu_state.errors, errors_before);
}
