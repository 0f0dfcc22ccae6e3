//! Interrupt and exception arbitration.
//!
//! The uniform rules (single-step masking, debug override, halt) are the
//! same for every guest architecture and live here as a default trait
//! method; `arbitrate_arch` is the per-architecture priority cascade an
//! architecture crate (e.g. `tb-arch-x86`) implements.

use tb_core::env::interrupt_bits;
use tb_core::excp::{EXCP_DEBUG, EXCP_HLT};
use tb_core::{ExecError, GuestEnv};

use crate::rr_tap::RrTap;
use crate::unwind::UnwindReason;

/// Result of running the arbiter for one sample of `interrupt_request`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArbiterOutcome {
    /// Whenever an interrupt was delivered, the caller must force the
    /// next `NextTbWord` chain attempt to be skipped.
    pub break_chain: bool,
    /// Set when the arbiter determined the loop must unwind (debug
    /// override, halt, or INIT).
    pub unwind: Option<UnwindReason>,
}

impl ArbiterOutcome {
    fn delivered() -> Self {
        Self {
            break_chain: true,
            unwind: None,
        }
    }

    fn none() -> Self {
        Self::default()
    }

    fn unwind(reason: UnwindReason) -> Self {
        Self {
            break_chain: true,
            unwind: Some(reason),
        }
    }
}

pub trait InterruptArbiter<E: GuestEnv> {
    /// Bits that remain visible even while single-stepping; every other
    /// bit is masked out of the snapshot before arbitration runs.
    /// Defaults to just the two uniform bits.
    fn singlestep_visible_mask(&self) -> u32 {
        interrupt_bits::DEBUG | interrupt_bits::HALT
    }

    /// Architecture-specific priority cascade, run only when `snapshot`
    /// still has bits set after the uniform rules below have had a
    /// chance to claim DEBUG/HALT. `rr` is threaded through so a
    /// cascade whose hardware-interrupt step reads a vector number
    /// (e.g. `acknowledge_interrupt`) can route that read through
    /// `RRTap::acknowledge_interrupt`.
    fn arbitrate_arch(&self, env: &mut E, snapshot: u32, rr: &mut RrTap) -> Result<ArbiterOutcome, ExecError>;

    /// Entry point the loop calls once per inner-loop iteration with a
    /// non-zero snapshot.
    fn arbitrate(&self, env: &mut E, snapshot_in: u32, rr: &mut RrTap) -> Result<ArbiterOutcome, ExecError> {
        let snapshot = if env.singlestep_enabled() {
            snapshot_in & self.singlestep_visible_mask()
        } else {
            snapshot_in
        };

        if snapshot & interrupt_bits::DEBUG != 0 {
            env.set_exception_index(EXCP_DEBUG);
            return Ok(ArbiterOutcome::unwind(UnwindReason::Exception));
        }
        if snapshot & interrupt_bits::HALT != 0 {
            env.set_interrupt_request(env.interrupt_request() & !interrupt_bits::HALT);
            env.set_halted(true);
            env.set_exception_index(EXCP_HLT);
            return Ok(ArbiterOutcome::unwind(UnwindReason::Exception));
        }
        if snapshot == 0 {
            return Ok(ArbiterOutcome::none());
        }
        self.arbitrate_arch(env, snapshot, rr)
    }
}

/// Architecture crates call this to report "interrupt delivered,
/// break-chain" without constructing the struct literal directly (the
/// `unwind` field may grow more variants over time).
pub fn delivered() -> ArbiterOutcome {
    ArbiterOutcome::delivered()
}

/// Architecture crates call this to report "no interrupt taken at this
/// priority level, fall through to the next one".
pub fn not_taken() -> ArbiterOutcome {
    ArbiterOutcome::none()
}

/// Architecture crates call this for the `INIT` case, which both
/// delivers and unwinds: the highest-priority interrupt in the cascade.
pub fn delivered_and_halted() -> ArbiterOutcome {
    ArbiterOutcome {
        break_chain: true,
        unwind: Some(UnwindReason::Exception),
    }
}
