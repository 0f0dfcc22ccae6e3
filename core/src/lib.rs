//! Core data model for the guest CPU execution loop.
//!
//! Reference: `~/qemu/accel/tcg/cpu-exec.c`, `~/qemu/include/exec/exec-all.h`.
//!
//! This crate holds the types shared between the translation-block cache
//! and the execution loop: [`tb::TranslatedBlock`], the per-CPU
//! [`tb::JumpCache`], the [`env::GuestEnv`] trait bundle the loop drives,
//! and the crate's [`error::ExecError`] taxonomy. It does not know how to
//! translate guest code or run host-native code; both are external
//! collaborators reached through trait calls.

pub mod env;
pub mod error;
pub mod tb;

pub use env::GuestEnv;
pub use error::ExecError;
pub use tb::{NextTbWord, TranslatedBlock};

/// Sentinel for `TranslatedBlock::page_addr[1]` meaning "does not span a
/// second physical page".
pub const PAGE_ADDR_SENTINEL: u64 = u64::MAX;

/// Loop return codes. Values `>= EXCP_INTERRUPT` are terminal exits of the
/// loop; values below are consumed internally by `deliver_exception` and
/// never returned from `execute()`.
pub mod excp {
    pub const EXCP_INTERRUPT: i32 = 0x1_0000;
    pub const EXCP_HLT: i32 = EXCP_INTERRUPT + 1;
    pub const EXCP_DEBUG: i32 = EXCP_INTERRUPT + 2;
    pub const EXCP_HALTED: i32 = EXCP_INTERRUPT + 3;
}
