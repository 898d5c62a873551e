//! In-place compaction that consolidates free space without disturbing execution.
//!
//! Genomes are position-independent — every fetch recomputes `start_addr + ip` — so
//! sliding an organism's cells down to a new address and updating only `start_addr`
//! is enough; the relative `ip` (and every register, which never holds an absolute
//! code address by convention) needs no rewriting at all.
//!
//! Operates on bare `Placement` descriptors rather than `Organism` directly: the only
//! caller (the simulator's `ALLOCATE` fallback ladder) has to compact the organism
//! that is itself mid-instruction alongside every other alive organism, and borrowing
//! all of them as one `&mut [Organism]` slice while one is mid-step is not something
//! the borrow checker can be made to agree to. Placements carry plain data in, plain
//! data out, and the caller writes the results back onto whatever storage it uses.

use crate::allocator::Allocator;
use crate::soup::Soup;

#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub start_addr: usize,
    pub size: usize,
    pub alloc_id: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefragStats {
    pub compactions: u64,
    pub organisms_moved: u64,
    pub cells_compacted: u64,
}

/// True iff compaction could plausibly help satisfy a pending allocation of
/// `required_size`: there's fragmentation worth resolving and, crucially, enough
/// total free space that compacting it would actually produce a large-enough block.
pub fn needs_defragmentation(
    allocator: &Allocator,
    required_size: usize,
    frag_threshold: f64,
) -> bool {
    allocator.largest_free_block() < required_size
        && allocator.fragmentation() >= frag_threshold
        && allocator.free_count() >= required_size
}

/// Compact `placements` toward address 0, preserving relative order by current
/// `start_addr`, and mutate each entry's `start_addr` to its new address in place.
pub fn defragment(soup: &mut Soup, allocator: &mut Allocator, placements: &mut [Placement]) -> DefragStats {
    let mut order: Vec<usize> = (0..placements.len()).collect();
    order.sort_by_key(|&i| placements[i].start_addr);

    let mut stats = DefragStats::default();
    let mut next = 0usize;
    for &i in &order {
        let old_addr = placements[i].start_addr;
        let size = placements[i].size;
        if old_addr != next {
            soup.move_range(old_addr, next, size);
            placements[i].start_addr = next;
            stats.organisms_moved += 1;
            stats.cells_compacted += size as u64;
        }
        next += size;
    }

    allocator.rebuild();
    for p in placements.iter() {
        allocator.mark_used_with_alloc_id(p.start_addr, p.size, p.alloc_id);
    }
    stats.compactions = 1;
    debug!(
        "defrag: moved {} organism(s), {} cells compacted",
        stats.organisms_moved, stats.cells_compacted
    );
    stats
}
