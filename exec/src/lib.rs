//! TCG Execution Engine — TB cache and CPU execution loop.
//!
//! Provides the execution loop that drives the
//! lookup → translate → execute cycle, with TB caching via
//! a global hash table plus per-CPU jump cache, record/replay
//! instrumentation of the loop's non-deterministic inputs, and the
//! collaborator traits (translator, executor, flags codec, interrupt
//! arbiter, exception delivery) an architecture crate plugs in.
//!
//! Reference: `~/qemu/accel/tcg/cpu-exec.c`,
//! `~/qemu/accel/tcg/translate-all.c`.

pub mod arbiter;
pub mod block_cache;
pub mod config;
pub mod exec_loop;
pub mod flags;
pub mod rr_tap;
pub mod stats;
pub mod unwind;

pub use arbiter::{ArbiterOutcome, InterruptArbiter};
pub use block_cache::{BlockCache, LookupResult, Translator};
pub use config::ExecConfig;
pub use exec_loop::{execute_mt, BlockExecutor, ExceptionDeliver, ExecLoop, PerCpuState, Shared};
pub use flags::{CpuFlagsCodec, NoopFlagsCodec};
pub use rr_tap::{Callsite, RrMode, RrRecordPublic, RrTap};
pub use stats::ExecStats;
pub use unwind::UnwindReason;
