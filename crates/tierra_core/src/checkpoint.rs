//! Checkpoint format: enough state to resume a run bit-for-bit.
//!
//! The soup dominates a checkpoint's size and is mostly zeros between organisms, so
//! it's stored as runs of contiguous non-zero cells keyed by start index rather than
//! as one dense `i32` array.

use serde::{Deserialize, Serialize};

use crate::allocator::Allocator;
use crate::error::{CheckpointError, CURRENT_CHECKPOINT_VERSION};
use crate::organism::{CpuState, Organism, PendingAlloc};
use crate::rng::Rng;
use crate::simulator::SimConfig;
use crate::soup::Soup;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganismSnapshot {
    pub id: u64,
    pub start_addr: usize,
    pub size: usize,
    pub parent_id: i64,
    pub birth_cycle: u64,
    pub alloc_id: u64,
    pub name: Option<String>,
    pub ip: i32,
    pub errors: u32,
    pub age: u64,
    pub registers: [i32; 8],
    pub has_pending: bool,
    pub pending_addr: Option<usize>,
    pub pending_size: Option<usize>,
    pub pending_alloc_id: Option<u64>,
}

impl From<&Organism> for OrganismSnapshot {
    fn from(o: &Organism) -> Self {
        let pending = o.cpu_state.pending_alloc;
        Self {
            id: o.id,
            start_addr: o.start_addr,
            size: o.size,
            parent_id: o.parent_id,
            birth_cycle: o.birth_cycle,
            alloc_id: o.alloc_id,
            name: o.name.clone(),
            ip: o.cpu_state.ip,
            errors: o.cpu_state.errors,
            age: o.cpu_state.age,
            registers: o.cpu_state.registers,
            has_pending: pending.is_some(),
            pending_addr: pending.map(|p| p.addr),
            pending_size: pending.map(|p| p.size),
            pending_alloc_id: pending.map(|p| p.alloc_id),
        }
    }
}

impl OrganismSnapshot {
    fn to_organism(&self) -> Organism {
        let mut cpu_state = CpuState::new(self.start_addr);
        cpu_state.ip = self.ip;
        cpu_state.registers = self.registers;
        cpu_state.errors = self.errors;
        cpu_state.age = self.age;
        if self.has_pending {
            if let (Some(addr), Some(size), Some(alloc_id)) =
                (self.pending_addr, self.pending_size, self.pending_alloc_id)
            {
                cpu_state.pending_alloc = Some(PendingAlloc { addr, size, alloc_id });
            }
        }
        Organism {
            id: self.id,
            start_addr: self.start_addr,
            size: self.size,
            parent_id: self.parent_id,
            birth_cycle: self.birth_cycle,
            alloc_id: self.alloc_id,
            name: self.name.clone(),
            cpu_state,
            alive: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    pub version: u32,
    pub total_cycles: u64,
    pub seed: i64,
    pub soup_size: u32,
    /// `(start_index, run)` pairs of contiguous non-zero cells.
    pub soup_runs: Vec<(u32, Vec<i32>)>,
    pub rng_state: Vec<u8>,
    pub total_spawns: u64,
    pub deaths_by_reaper: u64,
    pub deaths_by_errors: u64,
    pub next_org_id: u64,
    pub next_alloc_id: u64,
    pub mutation_rate: f64,
    pub max_errors: u32,
    pub max_organisms: u32,
    pub organisms: Vec<OrganismSnapshot>,
}

/// State handed back to the simulator on restore; kept separate from `Simulator`
/// itself so this module never needs to know about the reaper or the stop flag.
#[derive(Debug)]
pub(crate) struct Restored {
    pub soup: Soup,
    pub allocator: Allocator,
    pub rng: Rng,
    pub organisms: Vec<Organism>,
    pub next_org_id: u64,
    pub total_cycles: u64,
    pub total_spawns: u64,
    pub deaths_by_reaper: u64,
    pub deaths_by_errors: u64,
}

impl CheckpointData {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn capture(
        total_cycles: u64,
        config: &SimConfig,
        soup: &Soup,
        allocator: &Allocator,
        rng: &Rng,
        organisms: &[Organism],
        total_spawns: u64,
        deaths_by_reaper: u64,
        deaths_by_errors: u64,
        next_org_id: u64,
    ) -> Self {
        Self {
            version: CURRENT_CHECKPOINT_VERSION,
            total_cycles,
            seed: rng.initial_seed(),
            soup_size: soup.len() as u32,
            soup_runs: encode_soup(soup),
            rng_state: rng.save_state(),
            total_spawns,
            deaths_by_reaper,
            deaths_by_errors,
            next_org_id,
            next_alloc_id: allocator.next_alloc_id(),
            mutation_rate: config.mutation_rate,
            max_errors: config.max_errors,
            max_organisms: config.max_organisms,
            organisms: organisms.iter().map(OrganismSnapshot::from).collect(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("checkpoint data is always serializable")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub(crate) fn restore(&self, config: &SimConfig) -> Result<Restored, CheckpointError> {
        if self.version != CURRENT_CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: self.version,
                expected: CURRENT_CHECKPOINT_VERSION,
            });
        }
        if self.soup_size as usize != config.soup_size {
            return Err(CheckpointError::SoupSizeMismatch {
                found: self.soup_size as usize,
                expected: config.soup_size,
            });
        }

        let mut soup = Soup::new(self.soup_size as usize);
        for (start, run) in &self.soup_runs {
            soup.write_block(*start as usize, run);
        }

        // One validation pass over every claimed range before touching the real
        // allocator, so a corrupt checkpoint (the same cell claimed twice) is caught
        // as a fatal error rather than silently overwriting ownership.
        let mut owners = vec![0u64; self.soup_size as usize];
        for snap in &self.organisms {
            mark(&mut owners, snap.start_addr, snap.size, snap.alloc_id)?;
            if let (Some(addr), Some(size), Some(alloc_id)) =
                (snap.pending_addr, snap.pending_size, snap.pending_alloc_id)
            {
                mark(&mut owners, addr, size, alloc_id)?;
            }
        }

        let mut allocator = Allocator::new(self.soup_size as usize);
        for snap in &self.organisms {
            allocator.mark_used_with_alloc_id(snap.start_addr, snap.size, snap.alloc_id);
            if let (Some(addr), Some(size), Some(alloc_id)) =
                (snap.pending_addr, snap.pending_size, snap.pending_alloc_id)
            {
                allocator.mark_used_with_alloc_id(addr, size, alloc_id);
            }
        }
        allocator.set_next_alloc_id(self.next_alloc_id);

        let rng = Rng::restore(&self.rng_state)?;
        let organisms = self.organisms.iter().map(OrganismSnapshot::to_organism).collect();

        Ok(Restored {
            soup,
            allocator,
            rng,
            organisms,
            next_org_id: self.next_org_id,
            total_cycles: self.total_cycles,
            total_spawns: self.total_spawns,
            deaths_by_reaper: self.deaths_by_reaper,
            deaths_by_errors: self.deaths_by_errors,
        })
    }
}

fn encode_soup(soup: &Soup) -> Vec<(u32, Vec<i32>)> {
    let cells = soup.as_slice();
    let mut runs = Vec::new();
    let mut i = 0;
    while i < cells.len() {
        if cells[i] == 0 {
            i += 1;
            continue;
        }
        let start = i;
        let mut run = Vec::new();
        while i < cells.len() && cells[i] != 0 {
            run.push(cells[i]);
            i += 1;
        }
        runs.push((start as u32, run));
    }
    runs
}

fn mark(owners: &mut [u64], addr: usize, size: usize, alloc_id: u64) -> Result<(), CheckpointError> {
    let end = (addr + size).min(owners.len());
    for i in addr.min(end)..end {
        if owners[i] != 0 && owners[i] != alloc_id {
            return Err(CheckpointError::OwnershipConflict { addr: i, first: owners[i], second: alloc_id });
        }
        owners[i] = alloc_id;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(soup_size: usize) -> SimConfig {
        SimConfig {
            soup_size,
            mutation_rate: 0.1,
            max_errors: 5,
            max_organisms: 50,
            max_cycles: 0,
            checkpoint_interval: 0,
            report_interval: 0,
            random_seed: 99,
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let soup = {
            let mut s = Soup::new(20);
            s.write_block(5, &[1, 2, 3]);
            s
        };
        let allocator = {
            let mut a = Allocator::new(20);
            a.mark_used_with_alloc_id(5, 3, 7);
            a
        };
        let rng = Rng::new(42);
        let org = Organism::new(1, 5, 3, -1, 0, 7);
        let data = CheckpointData::capture(10, &config(20), &soup, &allocator, &rng, &[org], 0, 0, 0, 2);

        let bytes = data.to_bytes();
        let decoded = CheckpointData::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.total_cycles, 10);
        assert_eq!(decoded.soup_runs, vec![(5, vec![1, 2, 3])]);
        assert_eq!(decoded.organisms.len(), 1);
    }

    #[test]
    fn restore_rejects_wrong_soup_size() {
        let soup = Soup::new(20);
        let allocator = Allocator::new(20);
        let rng = Rng::new(1);
        let data = CheckpointData::capture(0, &config(20), &soup, &allocator, &rng, &[], 0, 0, 0, 1);
        let err = data.restore(&config(30)).unwrap_err();
        assert!(matches!(err, CheckpointError::SoupSizeMismatch { .. }));
    }

    #[test]
    fn restore_rejects_overlapping_ownership() {
        let soup = Soup::new(20);
        let allocator = Allocator::new(20);
        let rng = Rng::new(1);
        let a = Organism::new(1, 0, 10, -1, 0, 5);
        let b = Organism::new(2, 5, 10, -1, 0, 6);
        let data = CheckpointData::capture(0, &config(20), &soup, &allocator, &rng, &[a, b], 0, 0, 0, 3);
        let err = data.restore(&config(20)).unwrap_err();
        assert!(matches!(err, CheckpointError::OwnershipConflict { .. }));
    }

    #[test]
    fn restore_rebuilds_allocator_ownership_and_pending() {
        let soup = Soup::new(20);
        let allocator = Allocator::new(20);
        let rng = Rng::new(1);
        let mut org = Organism::new(1, 0, 5, -1, 0, 9);
        org.cpu_state.pending_alloc = Some(PendingAlloc { addr: 10, size: 3, alloc_id: 11 });
        let data = CheckpointData::capture(0, &config(20), &soup, &allocator, &rng, &[org], 0, 0, 0, 2);

        let restored = data.restore(&config(20)).unwrap();
        assert_eq!(restored.allocator.used(), 8);
        let restored_org = &restored.organisms[0];
        assert_eq!(restored_org.cpu_state.pending_alloc, Some(PendingAlloc { addr: 10, size: 3, alloc_id: 11 }));
    }
}
