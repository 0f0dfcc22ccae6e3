//! Record/replay instrumentation for the loop's non-deterministic scalar
//! inputs.
//!
//! Reference: `~/qemu-rr/cpu-exec.c`'s `RR_DO_RECORD_OR_REPLAY` /
//! `rr_interrupt_request` / `rr_exit_request` / `rr_input_4` call sites
//! and the `RR_CALLSITE_CPU_EXEC_*` tags. The on-disk log format is out
//! of scope; this is the minimal in-memory realization of the same
//! contract, an ordered list of tagged records played forward in either
//! direction.

use tb_core::error::ProgPoint;
use tb_core::ExecError;

/// One of the five labeled locations in the loop where a
/// non-deterministic scalar is sampled. Order within a run is part of
/// the contract: records are consumed in the same order they were
/// produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callsite {
    /// Sampling `interrupt_request` before running the arbiter.
    CpuExec1,
    /// Sampling `acknowledge_interrupt`'s vector number.
    CpuExec2,
    /// Re-sampling `interrupt_request` after the arbiter, for `EXITTB`.
    CpuExec4,
    /// Sampling `exit_request` mid-iteration.
    CpuExec00,
    /// Re-sampling `exit_request` immediately before dispatch.
    CpuExec000,
}

impl Callsite {
    fn tag(self) -> &'static str {
        match self {
            Callsite::CpuExec1 => "CPU_EXEC_1",
            Callsite::CpuExec2 => "CPU_EXEC_2",
            Callsite::CpuExec4 => "CPU_EXEC_4",
            Callsite::CpuExec00 => "CPU_EXEC_00",
            Callsite::CpuExec000 => "CPU_EXEC_000",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Payload {
    InterruptRequest(u32),
    ExitRequest(u32),
    Vector(u32),
}

#[derive(Debug, Clone, Copy)]
struct RrRecord {
    callsite: Callsite,
    point: ProgPoint,
    payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrMode {
    Off,
    Record,
    Replay,
}

/// Records or replays the loop's non-deterministic inputs, and tracks
/// the guest instruction counter used to form [`ProgPoint`]s.
pub struct RrTap {
    mode: RrMode,
    log: Vec<RrRecord>,
    cursor: usize,
    /// If true, `exit_request` in `REPLAY` uses the live value instead
    /// of the logged one.
    pub use_live_exit_request: bool,
    guest_instr_count: u64,
    flush_pending: bool,
}

impl RrTap {
    pub fn new(mode: RrMode) -> Self {
        Self {
            mode,
            log: Vec::new(),
            cursor: 0,
            use_live_exit_request: false,
            guest_instr_count: 0,
            flush_pending: false,
        }
    }

    pub fn mode(&self) -> RrMode {
        self.mode
    }

    /// Replace the replay source with a previously recorded log. Only
    /// meaningful when constructed with `RrMode::Replay`.
    pub fn load_log(&mut self, log: Vec<RrRecordPublic>) {
        self.log = log
            .into_iter()
            .map(|r| RrRecord {
                callsite: r.callsite,
                point: r.point,
                payload: r.payload,
            })
            .collect();
        self.cursor = 0;
    }

    /// Drain the recorded log, e.g. to hand to a persistent RR log
    /// writer (out of scope here).
    pub fn take_log(&mut self) -> Vec<RrRecordPublic> {
        std::mem::take(&mut self.log)
            .into_iter()
            .map(|r| RrRecordPublic {
                callsite: r.callsite,
                point: r.point,
                payload: r.payload,
            })
            .collect()
    }

    pub fn advance_instr_count(&mut self, n: u64) {
        self.guest_instr_count += n;
    }

    pub fn instr_count(&self) -> u64 {
        self.guest_instr_count
    }

    /// In `REPLAY`, the number of guest instructions remaining before the
    /// next recorded non-zero interrupt-request snapshot, found by
    /// peeking forward in the log. `None` outside replay, or if no
    /// further interrupt is recorded. This is the only guarantee that a
    /// recorded interrupt lands on the same instruction boundary on
    /// replay as it did on record.
    pub fn insns_until_next_interrupt(&self) -> Option<u64> {
        if self.mode != RrMode::Replay {
            return None;
        }
        self.log[self.cursor..]
            .iter()
            .find(|r| matches!(r.payload, Payload::InterruptRequest(v) if v != 0))
            .map(|r| r.point.guest_instr_count.saturating_sub(self.guest_instr_count))
    }

    /// Samples `(instr_count, pc, aux_register)`. `aux_register` is an
    /// architecture-defined extra disambiguator (e.g. CPL); callers that
    /// don't need one pass `0`.
    pub fn set_program_point(&mut self, pc: u64, aux_register: u32) -> ProgPoint {
        ProgPoint {
            guest_instr_count: self.guest_instr_count,
            pc_low: pc as u32,
            aux_register,
        }
    }

    fn record_or_replay_u32(
        &mut self,
        callsite: Callsite,
        point: ProgPoint,
        live: &mut u32,
        wrap: fn(u32) -> Payload,
        unwrap: fn(Payload) -> Option<u32>,
    ) -> Result<(), ExecError> {
        match self.mode {
            RrMode::Off => Ok(()),
            RrMode::Record => {
                self.log.push(RrRecord {
                    callsite,
                    point,
                    payload: wrap(*live),
                });
                Ok(())
            }
            RrMode::Replay => {
                let record = self
                    .log
                    .get(self.cursor)
                    .copied()
                    .expect("RR log exhausted before replay completed");
                if record.point != point {
                    tracing::warn!(
                        "RR desync at {}: expected {:?}, got {:?}",
                        callsite.tag(),
                        record.point,
                        point
                    );
                    return Err(ExecError::RrDesync {
                        tag: callsite.tag(),
                        expected: record.point,
                        actual: point,
                    });
                }
                self.cursor += 1;
                if let Some(v) = unwrap(record.payload) {
                    *live = v;
                }
                Ok(())
            }
        }
    }

    pub fn interrupt_request(&mut self, point: ProgPoint, live: &mut u32) -> Result<(), ExecError> {
        self.record_or_replay_u32(
            Callsite::CpuExec1,
            point,
            live,
            Payload::InterruptRequest,
            |p| match p {
                Payload::InterruptRequest(v) => Some(v),
                _ => None,
            },
        )
    }

    /// `callsite` distinguishes the two places `interrupt_request` is
    /// re-sampled (`CPU_EXEC_4`) from the one-shot read above.
    pub fn interrupt_request_at(
        &mut self,
        callsite: Callsite,
        point: ProgPoint,
        live: &mut u32,
    ) -> Result<(), ExecError> {
        self.record_or_replay_u32(callsite, point, live, Payload::InterruptRequest, |p| match p {
            Payload::InterruptRequest(v) => Some(v),
            _ => None,
        })
    }

    pub fn exit_request(
        &mut self,
        callsite: Callsite,
        point: ProgPoint,
        live: &mut u32,
    ) -> Result<(), ExecError> {
        if self.mode == RrMode::Replay && self.use_live_exit_request {
            // Still advance the cursor so ordering stays intact for any
            // records emitted downstream, but keep the live value.
            if let Some(record) = self.log.get(self.cursor).copied() {
                if matches!(record.payload, Payload::ExitRequest(_)) {
                    self.cursor += 1;
                }
            }
            return Ok(());
        }
        self.record_or_replay_u32(callsite, point, live, Payload::ExitRequest, |p| match p {
            Payload::ExitRequest(v) => Some(v),
            _ => None,
        })
    }

    pub fn acknowledge_interrupt(&mut self, point: ProgPoint, live: &mut u32) -> Result<(), ExecError> {
        self.record_or_replay_u32(Callsite::CpuExec2, point, live, Payload::Vector, |p| match p {
            Payload::Vector(v) => Some(v),
            _ => None,
        })
    }

    /// Diagnostic-only event emitted immediately before an unwind back
    /// to the outer loop. Never consumed by replay and never itself a
    /// source of non-determinism; purely for a human watching the log
    /// to see where execution left a block early.
    pub fn trace_unwind(&self, pc: u64, aux_register: u32) {
        tracing::debug!(
            target: "rr_tap",
            instr_count = self.guest_instr_count,
            pc,
            aux = ?aux_register,
            "unwind"
        );
    }

    /// One-shot flag consumed at the top of the outer loop, not itself
    /// RR-tagged since a full flush is driven by the embedder's device
    /// model rather than a per-instruction input.
    pub fn flush_tb_pending(&mut self) -> bool {
        std::mem::replace(&mut self.flush_pending, false)
    }

    pub fn request_flush(&mut self) {
        self.flush_pending = true;
    }
}

/// Public view of a log record, for embedders that persist/load logs.
#[derive(Debug, Clone, Copy)]
pub struct RrRecordPublic {
    pub callsite: Callsite,
    pub point: ProgPoint,
    payload: Payload,
}

impl RrRecordPublic {
    /// The vector number, if this record came from `acknowledge_interrupt`
    /// (callsite `CPU_EXEC_2`).
    pub fn vector(&self) -> Option<u32> {
        match self.payload {
            Payload::Vector(v) => Some(v),
            _ => None,
        }
    }
}
