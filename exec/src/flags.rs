//! Lazy-flags conversion boundary.

/// Per-architecture conversion between the guest's canonical flag
/// register and the "lazy flags" form the (external) translator
/// expects. `enter`/`leave` frame the entire loop; either may be a
/// no-op for architectures without lazy flags.
pub trait CpuFlagsCodec<E> {
    /// Lazy-ify flags on loop entry.
    fn enter(&self, env: &mut E);
    /// Canonicalize flags on loop exit. Must be the exact inverse of
    /// `enter` when no guest instructions ran in between.
    fn leave(&self, env: &mut E);
}

/// A codec that does nothing in either direction, for architectures (or
/// tests) with no lazy-flags representation.
pub struct NoopFlagsCodec;

impl<E> CpuFlagsCodec<E> for NoopFlagsCodec {
    fn enter(&self, _env: &mut E) {}
    fn leave(&self, _env: &mut E) {}
}
