//! x86-like guest architecture: lazy flags and the interrupt priority
//! cascade, as the one concrete [`tb_exec::CpuFlagsCodec`] /
//! [`tb_exec::InterruptArbiter`] pairing this workspace ships.
//!
//! Reference: `original_source/cpu-exec.c`'s `#ifdef TARGET_I386` arms of
//! `cpu_handle_interrupt` (SMI/NMI/MCE/HARD/VIRQ cascade) and the lazy
//! `CC_SRC`/`CC_DST`/`CC_OP` flag representation described alongside it.

use tb_core::excp::EXCP_HLT;
use tb_core::{ExecError, GuestEnv};
use tb_exec::arbiter::{delivered, delivered_and_halted, not_taken, ArbiterOutcome};
use tb_exec::{CpuFlagsCodec, InterruptArbiter, RrTap};

/// Interrupt-request bits this architecture defines above the two
/// uniform ones (`DEBUG`, `HALT`) in `tb_core::env::interrupt_bits`.
pub mod interrupt_bits {
    pub const INIT: u32 = 1 << 0;
    pub const SIPI: u32 = 1 << 1;
    pub const SMI: u32 = 1 << 2;
    pub const NMI: u32 = 1 << 3;
    pub const MCE: u32 = 1 << 4;
    pub const HARD: u32 = 1 << 5;
    pub const VIRQ: u32 = 1 << 6;
}

/// `EFLAGS.DF`, bit 10.
const EFLAGS_DF: u64 = 1 << 10;

/// The architecture-specific slice of `env` this crate's collaborators
/// need, layered on top of the core [`GuestEnv`] bundle. A concrete x86
/// guest implements both.
pub trait X86Env: GuestEnv {
    fn eflags(&self) -> u64;
    fn set_eflags(&mut self, v: u64);

    /// Lazy condition-code operands, valid between `enter`/`leave`.
    fn cc_src(&self) -> u64;
    fn set_cc_src(&mut self, v: u64);
    fn cc_dst(&self) -> u64;
    fn set_cc_dst(&mut self, v: u64);
    fn cc_op(&self) -> u32;
    fn set_cc_op(&mut self, v: u32);
    fn df(&self) -> i32;
    fn set_df(&mut self, v: i32);

    /// `EFLAGS.IF`, the architectural interrupt-enable flag. Gates only
    /// `HARD` and `VIRQ`; SMI/NMI/MCE are gated by
    /// [`global_interrupt_flag`](Self::global_interrupt_flag) instead.
    fn eflags_if(&self) -> bool;
    /// `HF2_GIF_MASK`-equivalent: the global interrupt flag gating
    /// SMI/NMI/MCE delivery as a group, independent of `EFLAGS.IF`.
    fn global_interrupt_flag(&self) -> bool;
    /// A `STI`-shadow or similar window during which even an enabled
    /// interrupt must not be taken yet.
    fn interrupt_inhibit(&self) -> bool;

    fn in_smm(&self) -> bool;
    fn nmi_masked(&self) -> bool;

    fn service_init(&mut self);
    fn service_sipi(&mut self);
    fn service_smi(&mut self);
    fn service_nmi(&mut self);
    fn service_mce(&mut self);

    /// Reads the pending vector from the external interrupt controller.
    /// Non-deterministic; the arbiter routes this through `RRTap`.
    fn acknowledge_interrupt(&mut self) -> u32;
    /// Reads a vector from the guest-visible virtual-APIC control block,
    /// used for `VIRQ` instead of `acknowledge_interrupt`.
    fn virq_vector(&self) -> u32;
    fn deliver_interrupt(&mut self, vector: u32);
}

/// Converts between canonical `EFLAGS` and the lazy `(CC_SRC, CC_DST,
/// CC_OP, DF)` triple the translator consumes. `compute_all` is the
/// external recomposition routine (`cc_table[cc_op].compute_all`
/// equivalent); this codec only owns the framing, not the arithmetic.
pub struct X86FlagsCodec {
    pub compute_all: fn(cc_src: u64, cc_dst: u64, cc_op: u32) -> u64,
}

/// `CC_OP` value meaning "no lazy computation pending, `cc_dst` already
/// holds fully-formed `EFLAGS` bits" — the sentinel `enter` always
/// produces, since decomposing real condition codes out of `EFLAGS` is
/// the translator's job, not this framing boundary's.
const CC_OP_EFLAGS: u32 = 0;

impl<E: X86Env> CpuFlagsCodec<E> for X86FlagsCodec {
    fn enter(&self, env: &mut E) {
        let eflags = env.eflags();
        env.set_cc_dst(eflags);
        env.set_cc_src(0);
        env.set_cc_op(CC_OP_EFLAGS);
        env.set_df(if eflags & EFLAGS_DF != 0 { -1 } else { 1 });
    }

    fn leave(&self, env: &mut E) {
        let recomposed = (self.compute_all)(env.cc_src(), env.cc_dst(), env.cc_op());
        let df_bit = if env.df() < 0 { EFLAGS_DF } else { 0 };
        env.set_eflags((recomposed & !EFLAGS_DF) | df_bit);
    }
}

/// The x86 priority cascade: `INIT` → `SIPI` → (gated on `EFLAGS.IF`)
/// `SMI` → `NMI` → `MCE` → `HARD` → `VIRQ`.
pub struct X86InterruptArbiter;

impl<E: X86Env> InterruptArbiter<E> for X86InterruptArbiter {
    fn arbitrate_arch(&self, env: &mut E, snapshot: u32, rr: &mut RrTap) -> Result<ArbiterOutcome, ExecError> {
        if snapshot & interrupt_bits::INIT != 0 {
            tracing::debug!("servicing INIT");
            env.set_interrupt_request(env.interrupt_request() & !interrupt_bits::INIT);
            env.service_init();
            env.set_halted(true);
            env.set_exception_index(EXCP_HLT);
            return Ok(delivered_and_halted());
        }

        if snapshot & interrupt_bits::SIPI != 0 {
            env.set_interrupt_request(env.interrupt_request() & !interrupt_bits::SIPI);
            env.service_sipi();
            return Ok(not_taken());
        }

        if env.global_interrupt_flag() {
            if snapshot & interrupt_bits::SMI != 0 && !env.in_smm() {
                env.set_interrupt_request(env.interrupt_request() & !interrupt_bits::SMI);
                env.service_smi();
                return Ok(delivered());
            }
            if snapshot & interrupt_bits::NMI != 0 && !env.nmi_masked() {
                env.set_interrupt_request(env.interrupt_request() & !interrupt_bits::NMI);
                env.service_nmi();
                return Ok(delivered());
            }
            if snapshot & interrupt_bits::MCE != 0 {
                env.set_interrupt_request(env.interrupt_request() & !interrupt_bits::MCE);
                env.service_mce();
                return Ok(delivered());
            }
        }

        if !env.eflags_if() {
            return Ok(not_taken());
        }
        if env.interrupt_inhibit() {
            return Ok(not_taken());
        }
        if snapshot & interrupt_bits::HARD != 0 {
            let point = rr.set_program_point(env.pc(), env.flags());
            let mut vector = env.acknowledge_interrupt();
            rr.acknowledge_interrupt(point, &mut vector)?;
            env.set_interrupt_request(env.interrupt_request() & !interrupt_bits::HARD);
            tracing::trace!("delivering HARD interrupt, vector={vector:#x}");
            env.deliver_interrupt(vector);
            return Ok(delivered());
        }
        if snapshot & interrupt_bits::VIRQ != 0 {
            let vector = env.virq_vector();
            env.set_interrupt_request(env.interrupt_request() & !interrupt_bits::VIRQ);
            env.deliver_interrupt(vector);
            return Ok(delivered());
        }

        Ok(not_taken())
    }
}
