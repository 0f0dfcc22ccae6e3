//! The guest CPU execution environment (`env` in the loop's own
//! vocabulary). This crate never owns a concrete `env`; it only defines
//! the trait surface [`ExecLoop`](../../tb_exec) drives.

/// Bitfield constants for `GuestEnv::interrupt_request`. Only the two
/// uniform-rule bits (`DEBUG`, `HALT`) are named here; architecture
/// crates define their own bits (e.g. `INIT`, `SIPI`, `HARD`) above this
/// range.
pub mod interrupt_bits {
    pub const DEBUG: u32 = 1 << 30;
    pub const HALT: u32 = 1 << 31;
    /// Set by `deliver_interrupt` to request that the current TB chain
    /// be broken even though arbitration already ran, read back by the
    /// loop's post-arbitration re-sample.
    pub const EXITTB: u32 = 1 << 29;
}

/// The mutable state an execution loop reads and writes once per
/// iteration. A concrete guest architecture implements this over its own
/// CPU state struct; the loop and its collaborators never touch fields
/// this trait doesn't expose.
pub trait GuestEnv {
    fn pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);
    fn cs_base(&self) -> u64;
    fn flags(&self) -> u32;

    /// `-1` means no exception pending; `>= EXCP_INTERRUPT` is a terminal
    /// exit code.
    fn exception_index(&self) -> i32;
    fn set_exception_index(&mut self, index: i32);

    /// Bitfield, mutated from signal/async context; every read that
    /// feeds a control decision must go through `RRTap`.
    fn interrupt_request(&self) -> u32;
    fn set_interrupt_request(&mut self, bits: u32);

    fn exit_request(&self) -> bool;
    fn set_exit_request(&mut self, v: bool);

    fn halted(&self) -> bool;
    fn set_halted(&mut self, v: bool);

    /// The block cache slot currently executing, or `None` between
    /// iterations: never stale, and always cleared before the loop does
    /// anything else after an unwind.
    fn current_tb(&self) -> Option<usize>;
    fn set_current_tb(&mut self, tb: Option<usize>);

    fn singlestep_enabled(&self) -> bool;

    /// Instruction-counter decrementer and the "extra" reservoir it may
    /// be refilled from on counter-expiry.
    fn icount_decr(&self) -> i64;
    fn set_icount_decr(&mut self, v: i64);
    fn icount_extra(&self) -> i64;
    fn set_icount_extra(&mut self, v: i64);
}
