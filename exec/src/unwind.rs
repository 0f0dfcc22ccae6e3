//! Safe-Rust stand-in for the source's `setjmp`/`longjmp` restart
//! barrier.
//!
//! The source installs one `jmp_env` per call into `cpu_exec` and jumps
//! back to it from arbitrarily deep call frames (`cpu_loop_exit`). This
//! port has no native stack to unwind: every collaborator the loop calls
//! is an ordinary safe function, so "abort back to the loop head" is
//! just returning an [`Unwind`] value up the call stack until
//! [`ExecLoop`](crate::ExecLoop) catches it at the labeled outer loop and
//! `continue`s.

/// The reason an inner-loop iteration is abandoning its current attempt
/// and returning control to the top of the outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindReason {
    /// A synchronous or terminal exception was set on `env`; the outer
    /// loop will inspect `exception_index` on its next pass.
    Exception,
    /// `exit_request` was observed set; the outer loop will terminate
    /// with `EXCP_INTERRUPT` once it re-reads `exception_index`.
    ExitRequest,
}

/// Marker type returned by any collaborator call that can trigger an
/// unwind instead of completing normally. `ExecLoop::execute` is the
/// only place that ever matches on this; everything else just
/// propagates it with `?` or an early return.
pub type Unwind = UnwindReason;
