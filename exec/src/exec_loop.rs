//! Top-level driver: `ExecLoop::execute`.
//!
//! Reference: `~/qemu-rr/cpu-exec.c`'s `cpu_exec()`, for the overall
//! lookup/dispatch shape. The outer/inner loop protocol below follows
//! `cpu_exec()` line for line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tb_core::env::interrupt_bits;
use tb_core::excp::{EXCP_DEBUG, EXCP_HALTED, EXCP_INTERRUPT};
use tb_core::tb::{cflags, JumpCache, NextTbWord};
use tb_core::GuestEnv;

use crate::arbiter::InterruptArbiter;
use crate::block_cache::{BlockCache, Translator};
use crate::config::ExecConfig;
use crate::flags::CpuFlagsCodec;
use crate::rr_tap::{Callsite, RrTap};
use crate::stats::ExecStats;
use crate::unwind::UnwindReason;

/// Runs host-native code for a translated block. May itself trigger an
/// unwind instead of completing normally.
pub trait BlockExecutor<E> {
    fn execute(&mut self, env: &mut E, code_ptr: usize) -> Result<NextTbWord, UnwindReason>;
}

/// Delivers a pending synchronous exception, and runs the (external)
/// debug handler on `EXCP_DEBUG`.
pub trait ExceptionDeliver<E> {
    fn deliver_exception(&self, env: &mut E);
    fn handle_debug(&self, _env: &mut E) {}
}

/// Process-wide state shared across every CPU's execution loop: the
/// physical-PC block cache and the process-wide exit-request flag.
pub struct Shared {
    pub block_cache: BlockCache,
    pub process_exit_request: AtomicBool,
}

impl Shared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            block_cache: BlockCache::new(),
            process_exit_request: AtomicBool::new(false),
        })
    }
}

/// Per-CPU state: the jump cache (exclusively owned by this CPU's
/// thread) and its execution statistics.
pub struct PerCpuState {
    pub jump_cache: JumpCache,
    pub stats: ExecStats,
}

impl PerCpuState {
    pub fn new() -> Self {
        Self {
            jump_cache: JumpCache::new(),
            stats: ExecStats::default(),
        }
    }
}

impl Default for PerCpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the RR tap and configuration for one guest CPU across repeated
/// calls to `execute`.
pub struct ExecLoop {
    pub shared: Arc<Shared>,
    pub per_cpu: PerCpuState,
    pub config: ExecConfig,
    pub rr: RrTap,
}

impl ExecLoop {
    pub fn new(shared: Arc<Shared>, config: ExecConfig) -> Self {
        let rr = RrTap::new(config.rr_mode);
        Self {
            shared,
            per_cpu: PerCpuState::new(),
            config,
            rr,
        }
    }

    /// One public entry point: runs the guest until a terminal exit
    /// code.
    #[allow(clippy::too_many_arguments)]
    pub fn execute<E, T, X, F, A, D>(
        &mut self,
        env: &mut E,
        translator: &mut T,
        executor: &mut X,
        flags_codec: &F,
        arbiter: &A,
        exception_deliver: &D,
    ) -> Result<i32, tb_core::ExecError>
    where
        E: GuestEnv,
        T: Translator,
        X: BlockExecutor<E>,
        F: CpuFlagsCodec<E>,
        A: InterruptArbiter<E>,
        D: ExceptionDeliver<E>,
    {
        run_loop(
            &self.shared,
            &mut self.per_cpu,
            &self.config,
            &mut self.rr,
            env,
            translator,
            executor,
            flags_codec,
            arbiter,
            exception_deliver,
        )
    }
}

/// Multi-CPU entry point: runs one guest CPU's loop against block
/// storage shared with every other CPU in `shared`, each CPU bringing
/// its own owned `per_cpu`/`rr`/`config`. Safe to call concurrently
/// from multiple threads against the same `Arc<Shared>`, one call per
/// thread; the underlying `BlockCache` is internally synchronized and
/// the jump cache each call consults is never touched by another
/// thread.
#[allow(clippy::too_many_arguments)]
pub fn execute_mt<E, T, X, F, A, D>(
    shared: &Arc<Shared>,
    per_cpu: &mut PerCpuState,
    config: &ExecConfig,
    rr: &mut RrTap,
    env: &mut E,
    translator: &mut T,
    executor: &mut X,
    flags_codec: &F,
    arbiter: &A,
    exception_deliver: &D,
) -> Result<i32, tb_core::ExecError>
where
    E: GuestEnv,
    T: Translator,
    X: BlockExecutor<E>,
    F: CpuFlagsCodec<E>,
    A: InterruptArbiter<E>,
    D: ExceptionDeliver<E>,
{
    run_loop(
        shared,
        per_cpu,
        config,
        rr,
        env,
        translator,
        executor,
        flags_codec,
        arbiter,
        exception_deliver,
    )
}

/// Resolve the current block for `env`, consulting the per-CPU fast
/// cache first and falling back to the shared physical-PC table
/// (`find_or_generate`).
fn find_tb<E: GuestEnv>(
    shared: &Shared,
    per_cpu: &mut PerCpuState,
    translator: &mut dyn Translator,
    env: &E,
) -> Result<(usize, bool), tb_core::ExecError> {
    let pc = env.pc();
    let cs_base = env.cs_base();
    let flags = env.flags();

    if let Some(slot) = per_cpu.jump_cache.lookup(pc) {
        let tb = shared.block_cache.get(slot);
        if tb.matches(pc, cs_base, flags) {
            per_cpu.stats.jc_hit += 1;
            return Ok((slot, false));
        }
    }

    let phys_pc = translator
        .code_phys_addr(pc)
        .map_err(|reason| tb_core::ExecError::TranslatorFailure { pc, reason })?;
    let before = shared.block_cache.len();
    let result = shared
        .block_cache
        .find_or_generate(translator, pc, cs_base, flags, phys_pc);
    if shared.block_cache.len() > before {
        tracing::debug!("translated new block at pc={pc:#x} (slot {})", result.slot);
        per_cpu.stats.translate += 1;
    } else {
        per_cpu.stats.slow_hit += 1;
    }
    per_cpu.jump_cache.insert(pc, result.slot);
    Ok((result.slot, result.invalidated))
}

/// Translate a single-use block capped at `insns_left`, run it, and let
/// it drop (never inserted into the shared cache, so "invalidate/free
/// unconditionally" is simply not keeping it around).
fn cpu_exec_nocache<E: GuestEnv, T: Translator, X: BlockExecutor<E>>(
    per_cpu: &mut PerCpuState,
    translator: &mut T,
    executor: &mut X,
    env: &mut E,
    insns_left: u32,
) -> Result<(), UnwindReason> {
    let max_cycles = insns_left.min(cflags::CF_COUNT_MASK);
    tracing::debug!("cpu_exec_nocache: pc={:#x} insns_left={insns_left}", env.pc());
    let tb = translator.generate(env.pc(), env.cs_base(), env.flags(), max_cycles);
    let tb_pc = tb.pc;
    let result = executor.execute(env, tb.code_ptr)?;
    per_cpu.stats.nocache_exec += 1;
    if result.status() == 2 {
        env.set_pc(tb_pc);
    }
    Ok(())
}

/// Shared body of `ExecLoop::execute` and `execute_mt`: the
/// outer/inner loop protocol, parameterized over the pieces of state
/// a multi-CPU caller keeps separately (`shared` across every CPU,
/// everything else owned by exactly one).
#[allow(clippy::too_many_arguments)]
fn run_loop<E, T, X, F, A, D>(
    shared: &Shared,
    per_cpu: &mut PerCpuState,
    config: &ExecConfig,
    rr: &mut RrTap,
    env: &mut E,
    translator: &mut T,
    executor: &mut X,
    flags_codec: &F,
    arbiter: &A,
    exception_deliver: &D,
) -> Result<i32, tb_core::ExecError>
where
    E: GuestEnv,
    T: Translator,
    X: BlockExecutor<E>,
    F: CpuFlagsCodec<E>,
    A: InterruptArbiter<E>,
    D: ExceptionDeliver<E>,
{
    if rr.flush_tb_pending() {
        tracing::info!("flushing translation block cache (RR request)");
        shared.block_cache.flush();
        per_cpu.jump_cache.invalidate_all();
    }

    if env.halted() && env.interrupt_request() == 0 {
        return Ok(EXCP_HALTED);
    }
    env.set_halted(false);

    // "Publish env as current CPU": a real embedder would expose a
    // process-wide pointer here for signal-handler use. Signal
    // delivery itself is an external collaborator, so this loop
    // only tracks the invariant, not a raw global pointer.

    if shared.process_exit_request.load(Ordering::Acquire) {
        env.set_exit_request(true);
    }

    flags_codec.enter(env);
    env.set_exception_index(-1);

    let mut prev_tb: Option<usize> = None;
    let ret: i32 = 'outer: loop {
        if env.exception_index() >= 0 {
            if env.exception_index() >= EXCP_INTERRUPT {
                let ret = env.exception_index();
                if ret == EXCP_DEBUG {
                    exception_deliver.handle_debug(env);
                }
                break 'outer ret;
            }
            exception_deliver.deliver_exception(env);
            env.set_exception_index(-1);
        }

        let mut next_tb = NextTbWord::none();

        loop {
            per_cpu.stats.loop_iters += 1;
            let point = rr.set_program_point(env.pc(), env.flags());
            let mut snapshot = env.interrupt_request();
            rr.interrupt_request(point, &mut snapshot)?;

            if snapshot != 0 {
                let outcome = arbiter.arbitrate(env, snapshot, rr)?;
                if outcome.break_chain {
                    next_tb = NextTbWord::none();
                }
                if outcome.unwind.is_some() {
                    rr.trace_unwind(env.pc(), env.flags());
                    continue 'outer;
                }

                let point4 = rr.set_program_point(env.pc(), env.flags());
                let mut snapshot4 = env.interrupt_request();
                rr.interrupt_request_at(Callsite::CpuExec4, point4, &mut snapshot4)?;
                if snapshot4 & interrupt_bits::EXITTB != 0 {
                    env.set_interrupt_request(snapshot4 & !interrupt_bits::EXITTB);
                    next_tb = NextTbWord::none();
                }
            }

            let point00 = rr.set_program_point(env.pc(), env.flags());
            let mut exit_req = env.exit_request() as u32;
            rr.exit_request(Callsite::CpuExec00, point00, &mut exit_req)?;
            if exit_req != 0 {
                env.set_exit_request(false);
                env.set_exception_index(EXCP_INTERRUPT);
                rr.trace_unwind(env.pc(), env.flags());
                continue 'outer;
            }

            let (mut slot, mut invalidated) = find_tb(shared, per_cpu, translator, &*env)?;

            if let Some(until) = rr.insns_until_next_interrupt() {
                let num_insns = shared.block_cache.get(slot).num_guest_insns as u64;
                if num_insns > until {
                    shared.block_cache.invalidate(slot);
                    per_cpu.jump_cache.invalidate_slot(slot);
                    let r = find_tb(shared, per_cpu, translator, &*env)?;
                    slot = r.0;
                    invalidated = true;
                }
            }

            if invalidated {
                next_tb = NextTbWord::none();
            }

            if next_tb.0 != 0
                && config.enable_chaining
                && rr.mode() != crate::rr_tap::RrMode::Replay
                && !shared.block_cache.get(slot).spans_pages()
            {
                if let Some(prev) = prev_tb {
                    shared.block_cache.patch_jump(prev, slot);
                    per_cpu.stats.chain_patched += 1;
                    tracing::trace!("chained block {prev} -> {slot}");
                }
            } else if next_tb.0 != 0 {
                if rr.mode() == crate::rr_tap::RrMode::Replay {
                    per_cpu.stats.chain_skipped_replay += 1;
                } else if shared.block_cache.get(slot).spans_pages() {
                    per_cpu.stats.chain_skipped_page_span += 1;
                }
            }

            env.set_current_tb(Some(slot));
            std::sync::atomic::fence(Ordering::SeqCst);

            let point000 = rr.set_program_point(env.pc(), env.flags());
            let mut exit_req2 = env.exit_request() as u32;
            rr.exit_request(Callsite::CpuExec000, point000, &mut exit_req2)?;

            if exit_req2 == 0 {
                let code_ptr = shared.block_cache.get(slot).code_ptr;
                let icount_before = env.icount_decr();
                match executor.execute(env, code_ptr) {
                    Ok(word) => {
                        if word.status() == 2 {
                            per_cpu.stats.counter_expired += 1;
                            env.set_pc(shared.block_cache.get(slot).pc);
                            let extra = env.icount_extra();
                            if extra > 0 {
                                env.set_icount_decr(extra);
                                env.set_icount_extra(0);
                                next_tb = NextTbWord::none();
                            } else {
                                let insns_left = icount_before.max(0) as u32;
                                env.set_current_tb(None);
                                let _ = cpu_exec_nocache(per_cpu, translator, executor, env, insns_left);
                                env.set_exception_index(EXCP_INTERRUPT);
                                rr.trace_unwind(env.pc(), env.flags());
                                continue 'outer;
                            }
                        } else {
                            rr.advance_instr_count(shared.block_cache.get(slot).num_guest_insns as u64);
                            next_tb = word;
                            prev_tb = Some(slot);
                        }
                    }
                    Err(_unwind) => {
                        env.set_current_tb(None);
                        rr.trace_unwind(env.pc(), env.flags());
                        continue 'outer;
                    }
                }
            }

            env.set_current_tb(None);
        }
    };

    flags_codec.leave(env);
    Ok(ret)
}
