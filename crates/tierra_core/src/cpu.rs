//! The one-instruction-per-step interpreter.
//!
//! `step` is the entire contract: fetch one word at the organism's absolute IP,
//! decode it, apply its effect to the organism's registers, the soup, and/or a
//! syscall, then advance `ip` and `age`. Faults never propagate past the organism that
//! caused them — they're recorded on `errors` and returned so the caller can decide
//! whether the organism has crossed `max_errors`.

use crate::instruction::{decode, Instruction, RegIdx};
use crate::organism::{CpuState, PendingAlloc};
use crate::rng::Rng;
use crate::soup::Soup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    IpOutOfBounds,
    UnknownOpcode,
    MemoryOutOfBounds,
    SyscallAllocateFailed,
    SyscallSpawnFailed,
}

/// Observes bit flips applied by a mutated `COPY`. Never consulted for anything that
/// would affect determinism — purely a reporting sink.
pub trait MutationTracker {
    fn on_mutation(&mut self, dest_addr: usize, bit_position: u32);
}

impl MutationTracker for () {
    fn on_mutation(&mut self, _dest_addr: usize, _bit_position: u32) {}
}

/// Outcome of an `ALLOCATE` syscall. Split from a bare `Option<PendingAlloc>` because
/// the fallback ladder may have to run the defragmenter, which can move the *calling*
/// organism's own code out from under it — `relocated_to` is how that gets reported
/// back so `execute` can fix up `cpu.start_addr` itself (the syscall layer never gets
/// a handle on `CpuState`, only on the organism-table bookkeeping around it).
pub struct AllocateResult {
    pub pending: Option<PendingAlloc>,
    pub relocated_to: Option<usize>,
}

/// The two syscalls the CPU can trigger. The CPU never touches the reaper or
/// defragmenter directly — that fallback ladder lives entirely on the other side of
/// this trait, in the simulator.
pub trait Syscalls {
    /// Attempt to reserve `size` cells. `pending == None` means the syscall failed
    /// outright (caller writes -1). Takes `soup` because the fallback ladder may need
    /// to run the defragmenter, which moves cells; everything else about the syscall
    /// is bookkeeping on the allocator and organism table.
    fn allocate(&mut self, size: i32, soup: &mut Soup) -> AllocateResult;

    /// Attempt to commit `pending` as a new organism at `address`. `size_arg` is the
    /// raw register value passed alongside it, kept only so callers can validate it
    /// independently — the actual size committed is always `pending.size`.
    fn spawn(&mut self, address: i32, size_arg: i32, pending: PendingAlloc) -> bool;
}

/// Execute exactly one instruction for `cpu`, returning the fault it raised, if any.
pub fn step(
    cpu: &mut CpuState,
    soup: &mut Soup,
    mutation_rate: f64,
    rng: &mut Rng,
    syscalls: &mut dyn Syscalls,
    mutations: &mut dyn MutationTracker,
) -> Option<Fault> {
    let fetch_addr = cpu.absolute_ip();
    let word = match soup.get(fetch_addr) {
        Some(word) => word,
        None => {
            cpu.errors += 1;
            cpu.age += 1;
            cpu.ip += 1;
            return Some(Fault::IpOutOfBounds);
        }
    };

    let ins = match decode(word) {
        Ok(ins) => ins,
        Err(_) => {
            cpu.errors += 1;
            cpu.age += 1;
            cpu.ip += 1;
            return Some(Fault::UnknownOpcode);
        }
    };

    let fault = execute(cpu, soup, mutation_rate, rng, syscalls, mutations, ins);
    cpu.age += 1;
    if fault.is_some() {
        cpu.errors += 1;
    }
    fault
}

fn execute(
    cpu: &mut CpuState,
    soup: &mut Soup,
    mutation_rate: f64,
    rng: &mut Rng,
    syscalls: &mut dyn Syscalls,
    mutations: &mut dyn MutationTracker,
    ins: Instruction,
) -> Option<Fault> {
    let mut fault = None;
    let mut jumped = false;

    match ins {
        Instruction::Nop => {}
        Instruction::Mov { r1, r2 } => cpu.set_register(r1, cpu.register(r2)),
        Instruction::Movi { r1, imm } => cpu.set_register(r1, imm as i32),
        Instruction::GetAddr { r1 } => cpu.set_register(r1, cpu.start_addr as i32),
        Instruction::Add { r1, r2 } => {
            cpu.set_register(r1, cpu.register(r1).wrapping_add(cpu.register(r2)))
        }
        Instruction::Sub { r1, r2 } => {
            cpu.set_register(r1, cpu.register(r1).wrapping_sub(cpu.register(r2)))
        }
        Instruction::Inc { r1 } => cpu.set_register(r1, cpu.register(r1).wrapping_add(1)),
        Instruction::Dec { r1 } => cpu.set_register(r1, cpu.register(r1).wrapping_sub(1)),
        Instruction::Load { r1, r2 } => {
            let addr = cpu.start_addr as i64 + cpu.register(r2) as i64;
            match soup.get(addr) {
                Some(value) => cpu.set_register(r1, value),
                None => fault = Some(Fault::MemoryOutOfBounds),
            }
        }
        Instruction::Store { r1, r2 } => {
            let addr = cpu.start_addr as i64 + cpu.register(r1) as i64;
            if !soup.set(addr, cpu.register(r2)) {
                fault = Some(Fault::MemoryOutOfBounds);
            }
        }
        Instruction::Jmp { offset } => {
            cpu.ip = cpu.ip.wrapping_add(1).wrapping_add(offset);
            jumped = true;
        }
        Instruction::Jmpz { r1, offset } => {
            cpu.ip = if cpu.register(r1) == 0 {
                cpu.ip.wrapping_add(1).wrapping_add(offset)
            } else {
                cpu.ip.wrapping_add(1)
            };
            jumped = true;
        }
        Instruction::Jlt { r1, r2, offset } => {
            cpu.ip = if cpu.register(r1) < cpu.register(r2) {
                cpu.ip.wrapping_add(1).wrapping_add(offset)
            } else {
                cpu.ip.wrapping_add(1)
            };
            jumped = true;
        }
        Instruction::Copy { r1, r2 } => {
            fault = execute_copy(cpu, soup, mutation_rate, rng, mutations, r1, r2);
        }
        Instruction::Allocate { r1, r2 } => {
            let size = cpu.register(r1);
            let result = syscalls.allocate(size, soup);
            if let Some(new_addr) = result.relocated_to {
                cpu.start_addr = new_addr;
            }
            match result.pending {
                Some(pending) => {
                    cpu.set_register(r2, pending.addr as i32);
                    cpu.pending_alloc = Some(pending);
                }
                None => {
                    cpu.set_register(r2, -1);
                    fault = Some(Fault::SyscallAllocateFailed);
                }
            }
        }
        Instruction::Spawn { r1, r2 } => {
            fault = execute_spawn(cpu, syscalls, r1, r2);
        }
        Instruction::Search { r1, r2, r3, r4 } => {
            fault = execute_search(cpu, soup, r1, r2, r3, r4);
        }
    }

    if !jumped {
        cpu.ip = cpu.ip.wrapping_add(1);
    }
    fault
}

fn execute_copy(
    cpu: &CpuState,
    soup: &mut Soup,
    mutation_rate: f64,
    rng: &mut Rng,
    mutations: &mut dyn MutationTracker,
    r1: RegIdx,
    r2: RegIdx,
) -> Option<Fault> {
    let src_addr = cpu.register(r1) as i64;
    let dst_addr = cpu.register(r2) as i64;
    let Some(source) = soup.get(src_addr) else {
        return Some(Fault::MemoryOutOfBounds);
    };
    if !soup.contains(dst_addr) {
        return Some(Fault::MemoryOutOfBounds);
    }

    // Exactly one uniform draw per COPY regardless of outcome; the bit-position draw
    // only happens when mutation actually triggers. Order matters for determinism.
    let roll = rng.next_f64_unit();
    let written = if roll < mutation_rate {
        let bit = rng.next_bounded(32);
        trace!("mutation: flipped bit {bit} writing cell {dst_addr} (copied from {src_addr})");
        mutations.on_mutation(dst_addr as usize, bit);
        source ^ (1i32 << bit)
    } else {
        source
    };
    soup.set(dst_addr, written);
    None
}

fn execute_spawn(
    cpu: &mut CpuState,
    syscalls: &mut dyn Syscalls,
    r1: RegIdx,
    r2: RegIdx,
) -> Option<Fault> {
    let Some(pending) = cpu.pending_alloc else {
        return Some(Fault::SyscallSpawnFailed);
    };
    let address = cpu.register(r1);
    let size_arg = cpu.register(r2);
    let accepted = syscalls.spawn(address, size_arg, pending);
    // Either way the one-shot capability is consumed: on accept it became the child's
    // memory, on reject the simulator already freed it.
    cpu.pending_alloc = None;
    if accepted { None } else { Some(Fault::SyscallSpawnFailed) }
}

fn execute_search(
    cpu: &mut CpuState,
    soup: &Soup,
    r1: RegIdx,
    r2: RegIdx,
    r3: RegIdx,
    r4: RegIdx,
) -> Option<Fault> {
    let search_start = cpu.register(r1);
    let template_start = cpu.register(r2);
    let template_len = cpu.register(r3);

    let soup_size = soup.len() as i64;
    let invalid = search_start < 0
        || search_start as i64 >= soup_size
        || template_start < 0
        || template_start as i64 >= soup_size
        || template_len <= 0
        || template_len as i64 > soup_size
        || template_start as i64 + template_len as i64 > soup_size;
    if invalid {
        cpu.set_register(r4, -1);
        return Some(Fault::MemoryOutOfBounds);
    }

    let template_start = template_start as usize;
    let template_len = template_len as usize;
    let cells = soup.as_slice();
    let last_start = soup_size as usize - template_len;
    let template = &cells[template_start..template_start + template_len];

    let mut found = None;
    let mut pos = search_start as usize;
    while pos <= last_start {
        if pos != template_start && &cells[pos..pos + template_len] == template {
            found = Some(pos);
            break;
        }
        pos += 1;
    }

    cpu.set_register(r4, found.map_or(-1, |p| p as i32));
    None
}
