//! FIFO age queue with lazy deletion.
//!
//! Organisms are registered in birth order and reaped oldest-first. Death by other
//! means (the error threshold, an overwrite) doesn't need to touch this queue at
//! all — the stale entry is simply skipped the next time it's popped or the queue is
//! compacted, which is what "lazy deletion" buys: O(1) death bookkeeping everywhere
//! except the occasional `cleanup` pass.

use std::collections::VecDeque;

use crate::organism::{DeathCause, OrganismId};

/// What the reaper needs from whatever owns the organism table. Kept minimal and
/// object-safe so the reaper never has to know about the soup, the allocator, or the
/// simulator's own bookkeeping.
pub trait ReaperHost {
    fn is_alive(&self, id: OrganismId) -> bool;
    fn age_of(&self, id: OrganismId) -> u64;
    fn kill(&mut self, id: OrganismId, cause: DeathCause);
    fn free_cells(&self) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReaperStats {
    pub reap_count: u64,
    pub total_age_at_death: u64,
}

pub struct Reaper {
    queue: VecDeque<OrganismId>,
    stats: ReaperStats,
}

impl Reaper {
    pub fn new() -> Self {
        Self { queue: VecDeque::new(), stats: ReaperStats::default() }
    }

    pub fn register(&mut self, id: OrganismId) {
        self.queue.push_back(id);
    }

    /// Lazy: the entry is left in place and skipped once its owner is observed dead.
    pub fn unregister(&mut self, _id: OrganismId) {}

    /// Pop entries until a still-alive organism is found, kill it, and return its id.
    /// `None` once the queue holds no living organism. `exclude`, when set, is never
    /// killed — its entry is rotated to the back instead — so an organism reaping to
    /// satisfy its own `ALLOCATE` can never reap itself out from under its own step.
    /// The scan is bounded to one pass over the queue's starting length so an
    /// all-stale-or-excluded queue can't spin forever.
    pub fn reap(&mut self, host: &mut impl ReaperHost, exclude: Option<OrganismId>) -> Option<OrganismId> {
        let attempts = self.queue.len();
        for _ in 0..attempts {
            let id = self.queue.pop_front()?;
            if Some(id) == exclude {
                self.queue.push_back(id);
                continue;
            }
            if host.is_alive(id) {
                let age = host.age_of(id);
                host.kill(id, DeathCause::Reaped);
                self.stats.reap_count += 1;
                self.stats.total_age_at_death += age;
                debug!("reap: organism {id} (age {age}) reclaimed, {} total", self.stats.reap_count);
                return Some(id);
            }
        }
        None
    }

    /// Reap repeatedly while `host.free_cells() < size`. Stops the moment there's
    /// enough free space even if it's fragmented across multiple blocks — the
    /// defragmenter, not the reaper, is responsible for consolidating it.
    pub fn reap_until_free(&mut self, size: usize, host: &mut impl ReaperHost, exclude: Option<OrganismId>) -> u64 {
        let mut killed = 0;
        while host.free_cells() < size {
            if self.reap(host, exclude).is_none() {
                break;
            }
            killed += 1;
        }
        killed
    }

    /// Drop stale entries in one pass. Returns how many were removed.
    pub fn cleanup(&mut self, host: &impl ReaperHost) -> usize {
        let before = self.queue.len();
        self.queue.retain(|&id| host.is_alive(id));
        before - self.queue.len()
    }

    pub fn reap_count(&self) -> u64 {
        self.stats.reap_count
    }

    pub fn average_age_at_death(&self) -> f64 {
        if self.stats.reap_count == 0 {
            0.0
        } else {
            self.stats.total_age_at_death as f64 / self.stats.reap_count as f64
        }
    }

    pub fn oldest_age(&self, host: &impl ReaperHost) -> Option<u64> {
        self.queue.iter().filter(|&&id| host.is_alive(id)).map(|&id| host.age_of(id)).max()
    }

    /// Live entries only.
    pub fn queue_size(&self, host: &impl ReaperHost) -> usize {
        self.queue.iter().filter(|&&id| host.is_alive(id)).count()
    }

    /// Including stale entries awaiting `cleanup`.
    pub fn raw_queue_size(&self) -> usize {
        self.queue.len()
    }
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new()
    }
}
