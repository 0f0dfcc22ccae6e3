//! Property-style checks for the loop's cross-cutting invariants
//! (`tb-exec/src/exec_loop.rs`, `tb-exec/src/block_cache.rs`), exercised
//! against the public API rather than as unit tests internal to either
//! crate. Move-to-front promotion (the one remaining invariant) has no
//! externally visible hook — `BlockCache`'s bucket chains are private —
//! so it stays covered where it already has direct access: the
//! `move_to_front_after_slow_lookup` unit test alongside `BlockCache`
//! itself.

use std::cell::RefCell;

use tb_arch_x86::{interrupt_bits as x86_bits, X86FlagsCodec, X86InterruptArbiter};
use tb_core::excp::EXCP_INTERRUPT;
use tb_core::tb::NextTbWord;
use tb_core::{ExecError, GuestEnv, TranslatedBlock};
use tb_exec::{
    arbiter::{not_taken, ArbiterOutcome},
    BlockCache, BlockExecutor, ExceptionDeliver, ExecConfig, ExecLoop, InterruptArbiter, NoopFlagsCodec, RrMode,
    RrTap, Shared, Translator, UnwindReason,
};

use crate::common::{IdentityTranslator, TestEnv};

struct NoopArbiter;
impl InterruptArbiter<TestEnv> for NoopArbiter {
    fn arbitrate_arch(
        &self,
        _env: &mut TestEnv,
        _snapshot: u32,
        _rr: &mut RrTap,
    ) -> Result<ArbiterOutcome, ExecError> {
        Ok(not_taken())
    }
}

struct NoopExceptionDeliver;
impl ExceptionDeliver<TestEnv> for NoopExceptionDeliver {
    fn deliver_exception(&self, _env: &mut TestEnv) {}
}

fn new_loop() -> ExecLoop {
    ExecLoop::new(Shared::new(), ExecConfig::default())
}

// Invariant 1: a recorded run and a replay of its log reach the same
// terminal state, even when the replay's live inputs (acknowledge vector,
// the initial interrupt_request snapshot) differ from what was recorded.
#[test]
fn invariant_1_replay_reproduces_record_regardless_of_live_inputs() {
    struct TwoStepExecutor {
        calls: RefCell<u32>,
        seen_pc: RefCell<Vec<u64>>,
    }
    impl BlockExecutor<TestEnv> for TwoStepExecutor {
        fn execute(&mut self, env: &mut TestEnv, _code_ptr: usize) -> Result<NextTbWord, UnwindReason> {
            self.seen_pc.borrow_mut().push(env.pc);
            let mut calls = self.calls.borrow_mut();
            *calls += 1;
            match *calls {
                // First block: services the pending HARD interrupt,
                // then raises NMI for the next pass.
                1 => {
                    env.pc = 0x2000;
                    env.interrupt_request = x86_bits::NMI;
                    Ok(NextTbWord::none())
                }
                // Second block, reached once the arbiter has serviced
                // that NMI: asks the loop to exit.
                2 => {
                    env.exit_request = true;
                    Ok(NextTbWord::none())
                }
                _ => unreachable!(),
            }
        }
    }

    let flags_codec = X86FlagsCodec {
        compute_all: |_src, dst, _op| dst,
    };

    let mut rec_config = ExecConfig::default();
    rec_config.rr_mode = RrMode::Record;
    let mut rec_loop = ExecLoop::new(Shared::new(), rec_config);
    let mut rec_env = TestEnv::new();
    rec_env.pc = 0x1000;
    rec_env.interrupt_request = x86_bits::HARD;
    rec_env.acknowledged_vector = 0x30;
    let mut rec_translator = IdentityTranslator::new(1);
    let mut rec_executor = TwoStepExecutor {
        calls: RefCell::new(0),
        seen_pc: RefCell::new(Vec::new()),
    };

    let rec_ret = rec_loop
        .execute(
            &mut rec_env,
            &mut rec_translator,
            &mut rec_executor,
            &flags_codec,
            &X86InterruptArbiter,
            &NoopExceptionDeliver,
        )
        .unwrap();
    assert_eq!(rec_ret, EXCP_INTERRUPT);
    assert_eq!(rec_env.delivered_vector, Some(0x30));

    let log = rec_loop.rr.take_log();

    let mut replay_config = ExecConfig::default();
    replay_config.rr_mode = RrMode::Replay;
    let mut replay_loop = ExecLoop::new(Shared::new(), replay_config);
    replay_loop.rr.load_log(log);

    // Deliberately different live inputs: no interrupt pending up front,
    // and a different acknowledge value. The logged snapshots must win.
    let mut replay_env = TestEnv::new();
    replay_env.pc = 0x1000;
    replay_env.interrupt_request = 0;
    replay_env.acknowledged_vector = 0x77;
    let mut replay_translator = IdentityTranslator::new(1);
    let mut replay_executor = TwoStepExecutor {
        calls: RefCell::new(0),
        seen_pc: RefCell::new(Vec::new()),
    };

    let replay_ret = replay_loop
        .execute(
            &mut replay_env,
            &mut replay_translator,
            &mut replay_executor,
            &flags_codec,
            &X86InterruptArbiter,
            &NoopExceptionDeliver,
        )
        .unwrap();

    assert_eq!(replay_ret, rec_ret);
    assert_eq!(replay_env.delivered_vector, rec_env.delivered_vector);
    assert_eq!(*replay_executor.calls.borrow(), *rec_executor.calls.borrow());
    assert_eq!(
        *replay_executor.seen_pc.borrow(),
        *rec_executor.seen_pc.borrow()
    );
}

// Invariant 2: the fast jump-cache only answers a lookup when the slot's
// identity tuple still matches; a flags change forces retranslation
// rather than returning the stale hit.
#[test]
fn invariant_2_jump_cache_hit_requires_identity_match() {
    let mut loop_ = new_loop();
    let mut env = TestEnv::new();
    env.pc = 0x4000;
    let mut translator = IdentityTranslator::new(1);

    struct RunOnce;
    impl BlockExecutor<TestEnv> for RunOnce {
        fn execute(&mut self, env: &mut TestEnv, _code_ptr: usize) -> Result<NextTbWord, UnwindReason> {
            env.exit_request = true;
            Ok(NextTbWord::none())
        }
    }
    let mut executor = RunOnce;

    loop_
        .execute(
            &mut env,
            &mut translator,
            &mut executor,
            &NoopFlagsCodec,
            &NoopArbiter,
            &NoopExceptionDeliver,
        )
        .unwrap();
    assert_eq!(loop_.per_cpu.stats.translate, 1);
    assert_eq!(loop_.shared.block_cache.len(), 1);

    // Same pc, same flags: must hit the jump cache, not retranslate.
    env.pc = 0x4000;
    loop_
        .execute(
            &mut env,
            &mut translator,
            &mut executor,
            &NoopFlagsCodec,
            &NoopArbiter,
            &NoopExceptionDeliver,
        )
        .unwrap();
    assert_eq!(loop_.per_cpu.stats.jc_hit, 1);
    assert_eq!(loop_.shared.block_cache.len(), 1);

    // Same pc, different flags: the jump-cache slot's identity no
    // longer matches, so this must retranslate rather than hit.
    env.pc = 0x4000;
    env.flags_val = 1;
    loop_
        .execute(
            &mut env,
            &mut translator,
            &mut executor,
            &NoopFlagsCodec,
            &NoopArbiter,
            &NoopExceptionDeliver,
        )
        .unwrap();
    assert_eq!(loop_.per_cpu.stats.translate, 2);
    assert_eq!(loop_.shared.block_cache.len(), 2);
}

// Invariant 3: an invalidated (tombstoned) block is never handed back
// out by a later lookup for the same identity.
#[test]
fn invariant_3_invalidated_block_never_returned() {
    let cache = BlockCache::new();
    let mut translator = IdentityTranslator::new(1);
    let r1 = cache.find_or_generate(&mut translator, 0x1000, 0, 0, 0x1000);
    assert!(!cache.get(r1.slot).invalid);

    cache.invalidate(r1.slot);
    assert!(cache.get(r1.slot).invalid);

    let r2 = cache.find_or_generate(&mut translator, 0x1000, 0, 0, 0x1000);
    assert_ne!(r2.slot, r1.slot, "the tombstoned slot must not be reused");
    assert!(!cache.get(r2.slot).invalid);
    assert!(cache.get(r1.slot).invalid, "tombstone must persist");
}

// Invariant 5: chaining never patches across a REPLAY run, and never
// patches a block that spans two physical pages, even with chaining
// enabled throughout.
#[test]
fn invariant_5_chaining_skips_replay_and_page_spanning_blocks() {
    struct TwoBlockExecutor {
        calls: RefCell<u32>,
    }
    impl BlockExecutor<TestEnv> for TwoBlockExecutor {
        fn execute(&mut self, env: &mut TestEnv, _code_ptr: usize) -> Result<NextTbWord, UnwindReason> {
            let mut calls = self.calls.borrow_mut();
            *calls += 1;
            match *calls {
                1 => {
                    env.pc = 0x2000;
                    Ok(NextTbWord::chain_to(1))
                }
                2 => {
                    env.exit_request = true;
                    Ok(NextTbWord::none())
                }
                _ => unreachable!(),
            }
        }
    }

    // Record a chainable run first, to get a log REPLAY can play back.
    let mut rec_config = ExecConfig::default();
    rec_config.enable_chaining = true;
    rec_config.rr_mode = RrMode::Record;
    let mut rec_loop = ExecLoop::new(Shared::new(), rec_config);
    let mut rec_env = TestEnv::new();
    rec_env.pc = 0x1000;
    let mut rec_translator = IdentityTranslator::new(1);
    let mut rec_executor = TwoBlockExecutor {
        calls: RefCell::new(0),
    };
    rec_loop
        .execute(
            &mut rec_env,
            &mut rec_translator,
            &mut rec_executor,
            &NoopFlagsCodec,
            &NoopArbiter,
            &NoopExceptionDeliver,
        )
        .unwrap();
    assert_eq!(rec_loop.shared.block_cache.get(0).chained_to[0], Some(1));
    assert_eq!(rec_loop.per_cpu.stats.chain_patched, 1);
    let log = rec_loop.rr.take_log();

    // Replay the identical scenario: chaining is still enabled, but
    // REPLAY mode must suppress the patch.
    let mut replay_config = ExecConfig::default();
    replay_config.enable_chaining = true;
    replay_config.rr_mode = RrMode::Replay;
    let mut replay_loop = ExecLoop::new(Shared::new(), replay_config);
    replay_loop.rr.load_log(log);
    let mut replay_env = TestEnv::new();
    replay_env.pc = 0x1000;
    let mut replay_translator = IdentityTranslator::new(1);
    let mut replay_executor = TwoBlockExecutor {
        calls: RefCell::new(0),
    };
    replay_loop
        .execute(
            &mut replay_env,
            &mut replay_translator,
            &mut replay_executor,
            &NoopFlagsCodec,
            &NoopArbiter,
            &NoopExceptionDeliver,
        )
        .unwrap();
    assert_eq!(replay_loop.shared.block_cache.get(0).chained_to[0], None);
    assert_eq!(replay_loop.per_cpu.stats.chain_patched, 0);
    assert_eq!(replay_loop.per_cpu.stats.chain_skipped_replay, 1);

    // Non-replay run, chaining enabled, but the first block spans two
    // physical pages: the patch must still be suppressed.
    struct PageSpanningTranslator;
    impl Translator for PageSpanningTranslator {
        fn generate(&mut self, pc: u64, cs_base: u64, flags: u32, _max_cycles: u32) -> TranslatedBlock {
            let mut tb = TranslatedBlock::new(pc, cs_base, flags, 0, pc);
            tb.num_guest_insns = 1;
            tb.page_addr[1] = tb.page_addr[0] + 0x1000;
            tb
        }
        fn code_phys_addr(&mut self, virt_pc: u64) -> Result<u64, String> {
            Ok(virt_pc)
        }
    }

    let mut span_config = ExecConfig::default();
    span_config.enable_chaining = true;
    let mut span_loop = ExecLoop::new(Shared::new(), span_config);
    let mut span_env = TestEnv::new();
    span_env.pc = 0x1000;
    let mut span_translator = PageSpanningTranslator;
    let mut span_executor = TwoBlockExecutor {
        calls: RefCell::new(0),
    };
    span_loop
        .execute(
            &mut span_env,
            &mut span_translator,
            &mut span_executor,
            &NoopFlagsCodec,
            &NoopArbiter,
            &NoopExceptionDeliver,
        )
        .unwrap();
    assert_eq!(span_loop.shared.block_cache.get(0).chained_to[0], None);
    assert_eq!(span_loop.per_cpu.stats.chain_patched, 0);
    assert_eq!(span_loop.per_cpu.stats.chain_skipped_page_span, 1);
}

// Invariant 6: once a block unwinds, `current_tb` is cleared before the
// loop does anything else, so no later lookup or dispatch can observe a
// stale slot.
#[test]
fn invariant_6_current_tb_cleared_after_unwind() {
    struct UnwindThenExit;
    impl BlockExecutor<TestEnv> for UnwindThenExit {
        fn execute(&mut self, env: &mut TestEnv, _code_ptr: usize) -> Result<NextTbWord, UnwindReason> {
            // Ask the loop to stop right after this unwind is handled,
            // so there is exactly one more pass through the sample
            // points and no second block attempt.
            env.exit_request = true;
            Err(UnwindReason::Exception)
        }
    }

    let mut loop_ = new_loop();
    let mut env = TestEnv::new();
    env.pc = 0x1000;
    let mut translator = IdentityTranslator::new(1);
    let mut executor = UnwindThenExit;

    let ret = loop_
        .execute(
            &mut env,
            &mut translator,
            &mut executor,
            &NoopFlagsCodec,
            &NoopArbiter,
            &NoopExceptionDeliver,
        )
        .unwrap();

    assert_eq!(ret, EXCP_INTERRUPT);
    assert_eq!(env.current_tb(), None);
}

// Invariant 7: a set exit_request terminates the loop with EXCP_INTERRUPT
// within one full iteration, without ever dispatching a block.
#[test]
fn invariant_7_exit_request_terminates_before_any_dispatch() {
    struct PanicsIfCalled;
    impl BlockExecutor<TestEnv> for PanicsIfCalled {
        fn execute(&mut self, _env: &mut TestEnv, _code_ptr: usize) -> Result<NextTbWord, UnwindReason> {
            panic!("exit_request must short-circuit before any block executes");
        }
    }

    let mut loop_ = new_loop();
    let mut env = TestEnv::new();
    env.exit_request = true;
    let mut translator = IdentityTranslator::new(1);
    let mut executor = PanicsIfCalled;

    let ret = loop_
        .execute(
            &mut env,
            &mut translator,
            &mut executor,
            &NoopFlagsCodec,
            &NoopArbiter,
            &NoopExceptionDeliver,
        )
        .unwrap();

    assert_eq!(ret, EXCP_INTERRUPT);
    assert_eq!(loop_.shared.block_cache.len(), 0);
}
