//! Integration tests for the execution loop: end-to-end scenarios and
//! property-style invariants, exercised against the public API of
//! `tb-core` + `tb-exec` (+ `tb-arch-x86` for the one concrete
//! architecture pairing), with a stubbed translator producing identity
//! blocks rather than a real decoder.

mod common;
mod invariants;
