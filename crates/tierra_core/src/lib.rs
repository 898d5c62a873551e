#[macro_use]
extern crate log;

pub mod allocator;
pub mod checkpoint;
pub mod cpu;
pub mod defrag;
pub mod error;
pub mod instruction;
pub mod organism;
pub mod reaper;
pub mod rng;
pub mod simulator;
pub mod soup;

pub use checkpoint::{CheckpointData, OrganismSnapshot};
pub use cpu::Fault;
pub use error::CheckpointError;
pub use instruction::Instruction;
pub use organism::{CpuState, DeathCause, Organism, OrganismId, PendingAlloc};
pub use rng::Rng;
pub use simulator::{Observers, ProgressSnapshot, SimConfig, Simulator};
pub use soup::Soup;
