//! Loop configuration, constructed by the embedder: this crate defines
//! the struct and its defaults, not a CLI or file format.

use crate::rr_tap::RrMode;

#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub rr_mode: RrMode,
    /// Whether to trust a live `exit_request` read during replay instead
    /// of the recorded value.
    pub use_live_exit_request: bool,
    /// The source's block-chaining-under-non-replay branch is effectively
    /// dead code upstream; exposed here as a config bit, default off, per
    /// DESIGN.md's resolution.
    pub enable_chaining: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            rr_mode: RrMode::Off,
            use_live_exit_request: false,
            enable_chaining: false,
        }
    }
}
