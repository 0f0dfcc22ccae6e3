//! Execution statistics: a plain counters struct with a `Display` impl
//! computing hit percentages, printed by the embedder on demand.

use std::fmt;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecStats {
    pub loop_iters: u64,
    pub jc_hit: u64,
    pub slow_hit: u64,
    pub translate: u64,
    pub chain_patched: u64,
    pub chain_skipped_replay: u64,
    pub chain_skipped_page_span: u64,
    pub counter_expired: u64,
    pub nocache_exec: u64,
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lookups = self.jc_hit + self.slow_hit + self.translate;
        let pct = |n: u64| {
            if lookups == 0 {
                0.0
            } else {
                100.0 * n as f64 / lookups as f64
            }
        };
        writeln!(f, "exec loop stats:")?;
        writeln!(f, "  iterations:      {}", self.loop_iters)?;
        writeln!(
            f,
            "  jump cache hit:  {} ({:.1}%)",
            self.jc_hit,
            pct(self.jc_hit)
        )?;
        writeln!(
            f,
            "  slow cache hit:  {} ({:.1}%)",
            self.slow_hit,
            pct(self.slow_hit)
        )?;
        writeln!(
            f,
            "  translated:      {} ({:.1}%)",
            self.translate,
            pct(self.translate)
        )?;
        writeln!(f, "  chain patched:   {}", self.chain_patched)?;
        writeln!(f, "  chain skipped (replay): {}", self.chain_skipped_replay)?;
        writeln!(
            f,
            "  chain skipped (page span): {}",
            self.chain_skipped_page_span
        )?;
        writeln!(f, "  counter expired: {}", self.counter_expired)?;
        writeln!(f, "  nocache execs:   {}", self.nocache_exec)
    }
}
