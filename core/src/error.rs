//! Error taxonomy for the execution loop.
//!
//! Most error conditions are encoded as control flow internal to
//! `ExecLoop` (an unwind, or a terminal `ExitCode`), not as a `Result`
//! error. Only RR desync and translator failure are surfaced as `Err`.

use thiserror::Error;

/// A program point: `(guest_instr_count, pc_low, aux_register)`, used by
/// `RRTap` to timestamp every recorded/replayed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgPoint {
    pub guest_instr_count: u64,
    pub pc_low: u32,
    pub aux_register: u32,
}

#[derive(Debug, Error)]
pub enum ExecError {
    /// A replayed callsite observed a program point that does not match
    /// the one recorded at the same tag. Fatal: the loop cannot continue
    /// once recorded and live execution have diverged.
    #[error("RR desync at callsite {tag}: expected {expected:?}, got {actual:?}")]
    RrDesync {
        tag: &'static str,
        expected: ProgPoint,
        actual: ProgPoint,
    },

    /// The external translator could not produce a block for the current
    /// PC (e.g. `code_phys_addr` raised on an unmapped address).
    #[error("translator failed to generate a block at pc={pc:#x}: {reason}")]
    TranslatorFailure { pc: u64, reason: String },
}
