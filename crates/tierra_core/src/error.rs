//! Fatal, host-level errors.
//!
//! In-VM faults (`crate::cpu::Fault`) never reach here — they're data recorded on an
//! organism's error counter. Everything in this module aborts the run: these are
//! programmer/operator errors the engine refuses to paper over.

pub const CURRENT_CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("unrecognized checkpoint version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("checkpoint soup size {found} does not match configured soup size {expected}")]
    SoupSizeMismatch { found: usize, expected: usize },

    #[error("cell {addr} is claimed by both allocation {first} and allocation {second}")]
    OwnershipConflict { addr: usize, first: u64, second: u64 },

    #[error("corrupt rng state: {0}")]
    CorruptRngState(#[from] crate::rng::RestoreError),

    #[error("failed to decode checkpoint: {0}")]
    Decode(#[from] serde_json::Error),
}
