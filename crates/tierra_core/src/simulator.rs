//! The round-robin scheduler. Owns every other module and drives one cycle at a time:
//! snapshot who's alive, step each one once, apply deferred kills, run periodic
//! maintenance, and notify observers. Nothing outside this module ever mutates the
//! soup, the allocator, or the organism table directly.

use crate::allocator::{Allocator, MAX_ALLOCATION_SIZE};
use crate::cpu::{self, AllocateResult, Syscalls};
use crate::defrag::{self, Placement};
use crate::organism::{DeathCause, Organism, OrganismId, PendingAlloc};
use crate::reaper::{Reaper, ReaperHost};
use crate::rng::Rng;
use crate::soup::Soup;

/// Compaction is only attempted when it could plausibly help; below this the
/// allocator just gives up, matching the syscall contract's observable −1 return.
const DEFRAG_FRAGMENTATION_THRESHOLD: f64 = 0.5;
const CLEANUP_INTERVAL: u64 = 10_000;
const CLEANUP_SLACK: usize = 10_000;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub soup_size: usize,
    pub mutation_rate: f64,
    pub max_errors: u32,
    pub max_organisms: u32,
    /// `0` means unbounded; only consulted by callers driving `run`, never by
    /// `run_cycle` itself.
    pub max_cycles: u64,
    pub checkpoint_interval: u64,
    pub report_interval: u64,
    pub random_seed: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub cycle: u64,
    pub alive_count: usize,
    pub total_spawns: u64,
    pub deaths_by_errors: u64,
    pub deaths_by_reaper: u64,
    pub used_cells: usize,
    pub fragmentation: f64,
}

/// One-way notifications emitted at cycle boundaries. Implementations must never call
/// back into the `Simulator` — there is no re-entrancy support, by design.
pub trait Observers {
    fn on_spawn(&mut self, _child: OrganismId, _parent: OrganismId, _cycle: u64) {}
    fn on_death(&mut self, _id: OrganismId, _cause: DeathCause, _cycle: u64) {}
    fn on_progress(&mut self, _snapshot: ProgressSnapshot) {}
    fn on_checkpoint(&mut self, _cycle: u64) {}
}

impl Observers for () {}

enum SimEvent {
    Spawn { child: OrganismId, parent: OrganismId, cycle: u64 },
    Death { id: OrganismId, cause: DeathCause, cycle: u64 },
}

pub struct Simulator {
    config: SimConfig,
    soup: Soup,
    allocator: Allocator,
    reaper: Reaper,
    rng: Rng,
    organisms: Vec<Organism>,
    next_org_id: OrganismId,
    total_cycles: u64,
    total_spawns: u64,
    deaths_by_reaper: u64,
    deaths_by_errors: u64,
    failed_allocations: u64,
    rejected_spawns: u64,
    stop_requested: bool,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Self {
        let soup = Soup::new(config.soup_size);
        let allocator = Allocator::new(config.soup_size);
        let rng = Rng::new(config.random_seed);
        Self {
            config,
            soup,
            allocator,
            reaper: Reaper::new(),
            rng,
            organisms: Vec::new(),
            next_org_id: 1,
            total_cycles: 0,
            total_spawns: 0,
            deaths_by_reaper: 0,
            deaths_by_errors: 0,
            failed_allocations: 0,
            rejected_spawns: 0,
            stop_requested: false,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Allocate a block for `genome`, write it in, and enqueue the founding organism
    /// with `parent_id = -1`. The address is whatever the allocator returns, which on
    /// an empty soup is always `0`.
    pub fn seed(&mut self, genome: &[i32]) -> OrganismId {
        let size = genome.len();
        let (addr, alloc_id) = self
            .allocator
            .allocate(size)
            .expect("soup has room for the seed genome");
        self.soup.write_block(addr, genome);

        let id = self.next_org_id;
        self.next_org_id += 1;
        let organism = Organism::new(id, addr, size, -1, self.total_cycles, alloc_id);
        self.reaper.register(id);
        self.organisms.push(organism);
        id
    }

    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn run(&mut self, cycles: u64, observers: &mut impl Observers) {
        for _ in 0..cycles {
            if self.stop_requested {
                break;
            }
            if self.config.max_cycles != 0 && self.total_cycles >= self.config.max_cycles {
                break;
            }
            self.run_cycle(observers);
        }
    }

    /// Advance exactly one cycle: step every organism alive at the start of the cycle
    /// once, apply deferred kills, run periodic maintenance, and notify observers.
    pub fn run_cycle(&mut self, observers: &mut impl Observers) {
        self.total_cycles += 1;
        if !self.organisms.iter().any(|o| o.alive) {
            return;
        }

        let alive_ids: Vec<OrganismId> =
            self.organisms.iter().filter(|o| o.alive).map(|o| o.id).collect();
        let mut pending_spawns: Vec<Organism> = Vec::new();
        let mut events: Vec<SimEvent> = Vec::new();
        let mut kill_list: Vec<OrganismId> = Vec::new();
        let birth_cycle = self.total_cycles;
        let max_organisms = self.config.max_organisms;
        let mutation_rate = self.config.mutation_rate;

        for id in alive_ids {
            let Some(idx) = self.organisms.iter().position(|o| o.id == id) else {
                continue;
            };
            if !self.organisms[idx].alive {
                continue;
            }

            let (before, rest) = self.organisms.split_at_mut(idx);
            let (current_slot, after) = rest.split_at_mut(1);
            let current = &mut current_slot[0];
            let Organism { ref mut start_addr, size, alloc_id, ref mut cpu_state, .. } = *current;

            let mut ctx = SyscallCtx {
                allocator: &mut self.allocator,
                reaper: &mut self.reaper,
                before,
                after,
                pending_spawns: &mut pending_spawns,
                events: &mut events,
                next_org_id: &mut self.next_org_id,
                total_spawns: &mut self.total_spawns,
                rejected_spawns: &mut self.rejected_spawns,
                failed_allocations: &mut self.failed_allocations,
                current_id: id,
                current_start_addr: start_addr,
                current_size: size,
                current_alloc_id: alloc_id,
                max_organisms,
                birth_cycle,
            };

            cpu::step(cpu_state, &mut self.soup, mutation_rate, &mut self.rng, &mut ctx, &mut ());

            if cpu_state.errors > self.config.max_errors {
                kill_list.push(id);
            }
        }

        for id in kill_list {
            self.kill_by_id(id, DeathCause::Errors, &mut events);
        }

        // New spawns are never visible to the cycle that bore them.
        self.organisms.append(&mut pending_spawns);
        self.organisms.retain(|o| o.alive);

        if self.total_cycles % CLEANUP_INTERVAL == 0 {
            let alive = self.organisms.len();
            if self.reaper.raw_queue_size() > 2 * alive + CLEANUP_SLACK {
                let mut reaper = std::mem::take(&mut self.reaper);
                reaper.cleanup(self);
                self.reaper = reaper;
            }
        }

        for event in events {
            match event {
                SimEvent::Spawn { child, parent, cycle } => observers.on_spawn(child, parent, cycle),
                SimEvent::Death { id, cause, cycle } => observers.on_death(id, cause, cycle),
            }
        }

        if self.config.report_interval != 0 && self.total_cycles % self.config.report_interval == 0 {
            observers.on_progress(self.snapshot());
        }
        if self.config.checkpoint_interval > 0 && self.total_cycles % self.config.checkpoint_interval == 0 {
            observers.on_checkpoint(self.total_cycles);
        }
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            cycle: self.total_cycles,
            alive_count: self.organisms.iter().filter(|o| o.alive).count(),
            total_spawns: self.total_spawns,
            deaths_by_errors: self.deaths_by_errors,
            deaths_by_reaper: self.deaths_by_reaper,
            used_cells: self.allocator.used(),
            fragmentation: self.allocator.fragmentation(),
        }
    }

    /// Mark `id` dead, free its memory, and record the cause. A no-op on an already
    /// dead or unknown id.
    fn kill_by_id(&mut self, id: OrganismId, cause: DeathCause, events: &mut Vec<SimEvent>) {
        let Some(idx) = self.organisms.iter().position(|o| o.id == id) else {
            return;
        };
        let org = &mut self.organisms[idx];
        if !org.alive {
            return;
        }
        org.alive = false;
        if let Some(pending) = org.cpu_state.pending_alloc.take() {
            self.allocator.free_if_owned(pending.addr, pending.size, pending.alloc_id);
        }
        self.allocator.free_if_owned(org.start_addr, org.size, org.alloc_id);
        if cause == DeathCause::Errors {
            self.deaths_by_errors += 1;
        }
        events.push(SimEvent::Death { id, cause, cycle: self.total_cycles });
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn alive_count(&self) -> usize {
        self.organisms.iter().filter(|o| o.alive).count()
    }

    pub fn organisms(&self) -> &[Organism] {
        &self.organisms
    }

    pub fn soup(&self) -> &Soup {
        &self.soup
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn total_spawns(&self) -> u64 {
        self.total_spawns
    }

    pub fn deaths_by_errors(&self) -> u64 {
        self.deaths_by_errors
    }

    pub fn deaths_by_reaper(&self) -> u64 {
        self.deaths_by_reaper
    }

    pub fn failed_allocations(&self) -> u64 {
        self.failed_allocations
    }

    pub fn rejected_spawns(&self) -> u64 {
        self.rejected_spawns
    }

    /// Capture everything needed to resume an identical run later.
    pub fn checkpoint(&self) -> crate::checkpoint::CheckpointData {
        crate::checkpoint::CheckpointData::capture(
            self.total_cycles,
            &self.config,
            &self.soup,
            &self.allocator,
            &self.rng,
            &self.organisms,
            self.total_spawns,
            self.deaths_by_reaper,
            self.deaths_by_errors,
            self.next_org_id,
        )
    }

    /// Rebuild a `Simulator` from a checkpoint, using `config` for everything the
    /// checkpoint format doesn't itself carry verbatim (report/checkpoint intervals,
    /// `max_cycles`) but validating it against the checkpoint's own soup size and
    /// per-run parameters.
    pub fn from_checkpoint(
        data: crate::checkpoint::CheckpointData,
        config: SimConfig,
    ) -> Result<Self, crate::error::CheckpointError> {
        let restored = data.restore(&config)?;
        let mut reaper = Reaper::new();
        for org in restored.organisms.iter().filter(|o| o.alive) {
            reaper.register(org.id);
        }
        Ok(Self {
            config,
            soup: restored.soup,
            allocator: restored.allocator,
            reaper,
            rng: restored.rng,
            organisms: restored.organisms,
            next_org_id: restored.next_org_id,
            total_cycles: restored.total_cycles,
            total_spawns: restored.total_spawns,
            deaths_by_reaper: restored.deaths_by_reaper,
            deaths_by_errors: restored.deaths_by_errors,
            failed_allocations: 0,
            rejected_spawns: 0,
            stop_requested: false,
        })
    }
}

impl ReaperHost for Simulator {
    fn is_alive(&self, id: OrganismId) -> bool {
        self.organisms.iter().any(|o| o.id == id && o.alive)
    }

    fn age_of(&self, id: OrganismId) -> u64 {
        self.organisms.iter().find(|o| o.id == id).map_or(0, |o| o.cpu_state.age)
    }

    fn kill(&mut self, id: OrganismId, cause: DeathCause) {
        let mut scratch = Vec::new();
        self.kill_by_id(id, cause, &mut scratch);
    }

    fn free_cells(&self) -> usize {
        self.allocator.free_count()
    }
}

/// Everything an organism's syscalls can touch during its own step: the allocator,
/// the reaper, every other organism (split around the one currently stepping so both
/// can be borrowed at once), and the counters those syscalls update. Built fresh for
/// every organism and dropped at the end of its step.
struct SyscallCtx<'a> {
    allocator: &'a mut Allocator,
    reaper: &'a mut Reaper,
    before: &'a mut [Organism],
    after: &'a mut [Organism],
    pending_spawns: &'a mut Vec<Organism>,
    events: &'a mut Vec<SimEvent>,
    next_org_id: &'a mut OrganismId,
    total_spawns: &'a mut u64,
    rejected_spawns: &'a mut u64,
    failed_allocations: &'a mut u64,
    current_id: OrganismId,
    current_start_addr: &'a mut usize,
    current_size: usize,
    current_alloc_id: u64,
    max_organisms: u32,
    birth_cycle: u64,
}

impl SyscallCtx<'_> {
    fn alive_count(&self) -> usize {
        self.before.iter().chain(self.after.iter()).filter(|o| o.alive).count() + 1
    }
}

impl Syscalls for SyscallCtx<'_> {
    fn allocate(&mut self, size: i32, soup: &mut Soup) -> AllocateResult {
        if size <= 0 {
            return AllocateResult { pending: None, relocated_to: None };
        }
        let size = size as usize;

        if let Some((addr, alloc_id)) = self.allocator.allocate(size) {
            return AllocateResult { pending: Some(PendingAlloc { addr, size, alloc_id }), relocated_to: None };
        }

        // Never lets an organism reap itself out from under its own running step.
        let exclude = Some(self.current_id);
        let mut reaper = std::mem::take(&mut *self.reaper);
        reaper.reap_until_free(size, self, exclude);
        *self.reaper = reaper;
        if let Some((addr, alloc_id)) = self.allocator.allocate(size) {
            return AllocateResult { pending: Some(PendingAlloc { addr, size, alloc_id }), relocated_to: None };
        }

        let mut relocated_to = None;
        if defrag::needs_defragmentation(self.allocator, size, DEFRAG_FRAGMENTATION_THRESHOLD) {
            for org in self.before.iter_mut().chain(self.after.iter_mut()) {
                org.cpu_state.pending_alloc = None;
            }

            let mut placements = Vec::with_capacity(self.before.len() + self.after.len() + 1);
            placements.push(Placement {
                start_addr: *self.current_start_addr,
                size: self.current_size,
                alloc_id: self.current_alloc_id,
            });
            for org in self.before.iter().chain(self.after.iter()).filter(|o| o.alive) {
                placements.push(Placement { start_addr: org.start_addr, size: org.size, alloc_id: org.alloc_id });
            }

            defrag::defragment(soup, self.allocator, &mut placements);

            if placements[0].start_addr != *self.current_start_addr {
                relocated_to = Some(placements[0].start_addr);
            }
            *self.current_start_addr = placements[0].start_addr;

            let mut rest = placements.into_iter().skip(1);
            for org in self.before.iter_mut().chain(self.after.iter_mut()).filter(|o| o.alive) {
                if let Some(p) = rest.next() {
                    org.start_addr = p.start_addr;
                    org.cpu_state.start_addr = p.start_addr;
                }
            }
        }

        match self.allocator.allocate(size) {
            Some((addr, alloc_id)) => {
                AllocateResult { pending: Some(PendingAlloc { addr, size, alloc_id }), relocated_to }
            }
            None => {
                *self.failed_allocations += 1;
                warn!("allocate: organism {} request for {size} cells rejected, soup has no room", self.current_id);
                AllocateResult { pending: None, relocated_to }
            }
        }
    }

    fn spawn(&mut self, address: i32, _size_arg: i32, pending: PendingAlloc) -> bool {
        let address_matches = address >= 0 && address as usize == pending.addr;
        let size_in_range = pending.size >= 1 && pending.size <= MAX_ALLOCATION_SIZE;
        let fits_soup = pending.addr.checked_add(pending.size).map_or(false, |end| end <= self.allocator.soup_size());

        if !address_matches || !size_in_range || !fits_soup {
            self.allocator.free_if_owned(pending.addr, pending.size, pending.alloc_id);
            *self.rejected_spawns += 1;
            warn!("spawn: organism {} rejected, pending allocation {:?} failed validation", self.current_id, pending);
            return false;
        }

        if self.alive_count() >= self.max_organisms as usize {
            let exclude = Some(self.current_id);
            let mut reaper = std::mem::take(&mut *self.reaper);
            reaper.reap(self, exclude);
            *self.reaper = reaper;
            if self.alive_count() >= self.max_organisms as usize {
                self.allocator.free_if_owned(pending.addr, pending.size, pending.alloc_id);
                *self.rejected_spawns += 1;
                warn!("spawn: organism {} rejected, population at max_organisms ({})", self.current_id, self.max_organisms);
                return false;
            }
        }

        let child_id = *self.next_org_id;
        *self.next_org_id += 1;
        let child = Organism::new(
            child_id,
            pending.addr,
            pending.size,
            self.current_id as i64,
            self.birth_cycle,
            pending.alloc_id,
        );
        self.pending_spawns.push(child);
        self.reaper.register(child_id);
        self.events.push(SimEvent::Spawn { child: child_id, parent: self.current_id, cycle: self.birth_cycle });
        *self.total_spawns += 1;
        true
    }
}

impl ReaperHost for SyscallCtx<'_> {
    fn is_alive(&self, id: OrganismId) -> bool {
        self.before.iter().chain(self.after.iter()).any(|o| o.id == id && o.alive)
    }

    fn age_of(&self, id: OrganismId) -> u64 {
        self.before
            .iter()
            .chain(self.after.iter())
            .find(|o| o.id == id)
            .map_or(0, |o| o.cpu_state.age)
    }

    fn kill(&mut self, id: OrganismId, cause: DeathCause) {
        let found = self.before.iter_mut().chain(self.after.iter_mut()).find(|o| o.id == id);
        let Some(org) = found else { return };
        org.alive = false;
        if let Some(pending) = org.cpu_state.pending_alloc.take() {
            self.allocator.free_if_owned(pending.addr, pending.size, pending.alloc_id);
        }
        self.allocator.free_if_owned(org.start_addr, org.size, org.alloc_id);
        self.events.push(SimEvent::Death { id, cause, cycle: self.birth_cycle });
    }

    fn free_cells(&self) -> usize {
        self.allocator.free_count()
    }
}
