//! Two-level translation block cache.
//!
//! Reference: `~/qemu/accel/tcg/cpu-exec.c` (`tb_find_fast`/`tb_find_slow`),
//! `~/qemu/accel/tcg/translate-all.c` (`tb_phys_hash_insert`, `tb_invalidate`).
//!
//! Storage is a growable `Vec<TranslatedBlock>` behind an `UnsafeCell`,
//! published via an `AtomicUsize` length with `Release`/`Acquire`
//! ordering: once a slot index is below the published length, any
//! thread may read it without holding a lock, because slots are never
//! removed, only tombstoned (`invalid = true`) and never reused except
//! across a full `flush`. Mutating the physical-PC hash buckets (the
//! collision chains proper) always takes `buckets`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tb_core::tb::TB_HASH_SIZE;
use tb_core::TranslatedBlock;

/// Translator collaborator, invoked on a slow-path miss. Returns the
/// newly generated block. `max_cycles == 0` means unbounded; `> 0` caps
/// the number of guest instructions translated (used by counter-expiry
/// and replay re-translation).
pub trait Translator {
    fn generate(&mut self, pc: u64, cs_base: u64, flags: u32, max_cycles: u32) -> TranslatedBlock;

    /// Physical address of `virt_pc`. May fail if unmapped; the loop
    /// surfaces that as `ExecError::TranslatorFailure`.
    fn code_phys_addr(&mut self, virt_pc: u64) -> Result<u64, String>;

    /// Whether the `generate` call just made invalidated other blocks as
    /// a side effect (self-modifying guest code). Consumed and reset by
    /// the cache; defaults to `false` for translators that never do
    /// this.
    fn take_invalidated(&mut self) -> bool {
        false
    }
}

/// Outcome of a cache lookup that may have triggered translation, which
/// in turn may have invalidated arbitrary other blocks as a side effect
/// (self-modifying guest code). Chaining must be suppressed whenever
/// `invalidated` is true.
pub struct LookupResult {
    pub slot: usize,
    pub invalidated: bool,
}

pub struct BlockCache {
    storage: UnsafeCell<Vec<TranslatedBlock>>,
    len: AtomicUsize,
    buckets: Mutex<Vec<Option<usize>>>,
}

// SAFETY: `storage` only grows (never truncates or reuses a slot's
// memory in place), and every slot below `len.load(Acquire)` was fully
// initialized before `len.store(Release)` published it. Reads of
// already-published slots never race with the single writer, which
// holds `buckets` while appending.
unsafe impl Send for BlockCache {}
unsafe impl Sync for BlockCache {}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            storage: UnsafeCell::new(Vec::new()),
            len: AtomicUsize::new(0),
            buckets: Mutex::new(vec![None; TB_HASH_SIZE]),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, slot: usize) -> &TranslatedBlock {
        assert!(slot < self.len(), "block cache slot {slot} not yet published");
        // SAFETY: slot is below the published length; the vector only grows.
        unsafe { &(*self.storage.get())[slot] }
    }

    /// # Safety
    /// Caller must hold `buckets` (i.e. be inside `find_or_generate`'s
    /// translate section) so no other thread observes a half-initialized
    /// push.
    unsafe fn push(&self, tb: TranslatedBlock) -> usize {
        let storage = &mut *self.storage.get();
        let slot = storage.len();
        storage.push(tb);
        self.len.store(storage.len(), Ordering::Release);
        slot
    }

    /// Walk the physical-PC hash chain for `(phys_pc, cs_base, flags)`,
    /// promoting a hit to the head of its bucket (move-to-front LRU).
    /// A candidate spanning two pages must also have its second page's
    /// physical address re-confirmed against the guest MMU via
    /// `translator`; a block whose second page was remapped since
    /// translation is treated as a miss and left in the chain (not
    /// tombstoned) rather than returned stale. Returns `None` on a miss.
    fn lookup_slow(
        &self,
        translator: &mut dyn Translator,
        phys_pc: u64,
        cs_base: u64,
        flags: u32,
    ) -> Option<usize> {
        let h = TranslatedBlock::hash(phys_pc, cs_base, flags);
        let mut buckets = self.buckets.lock().unwrap();
        let mut prev: Option<usize> = None;
        let mut cur = buckets[h];
        while let Some(slot) = cur {
            let tb = self.get(slot);
            let next = tb.phys_hash_next;
            if !tb.invalid && tb.phys_pc == phys_pc && tb.cs_base == cs_base && tb.flags == flags {
                let second_page_ok = if tb.spans_pages() {
                    translator
                        .code_phys_addr(tb.second_page_virt())
                        .map(|phys2| phys2 == tb.page_addr[1])
                        .unwrap_or(false)
                } else {
                    true
                };
                if second_page_ok {
                    if prev.is_some() {
                        self.unlink_from_bucket(&mut buckets, h, slot);
                        self.prepend_to_bucket(&mut buckets, h, slot);
                    }
                    return Some(slot);
                }
            }
            prev = Some(slot);
            cur = next;
        }
        None
    }

    fn unlink_from_bucket(&self, buckets: &mut [Option<usize>], h: usize, slot: usize) {
        let storage = unsafe { &mut *self.storage.get() };
        let mut cur = buckets[h];
        let mut prev: Option<usize> = None;
        while let Some(s) = cur {
            let next = storage[s].phys_hash_next;
            if s == slot {
                match prev {
                    Some(p) => storage[p].phys_hash_next = next,
                    None => buckets[h] = next,
                }
                storage[slot].phys_hash_next = None;
                return;
            }
            prev = Some(s);
            cur = next;
        }
    }

    fn prepend_to_bucket(&self, buckets: &mut [Option<usize>], h: usize, slot: usize) {
        let storage = unsafe { &mut *self.storage.get() };
        storage[slot].phys_hash_next = buckets[h];
        buckets[h] = Some(slot);
    }

    /// Slow-path lookup, translating on a miss. `phys_pc`/`phys_page1`
    /// are supplied by the caller (derived via the guest MMU, out of
    /// scope here).
    pub fn find_or_generate(
        &self,
        translator: &mut dyn Translator,
        pc: u64,
        cs_base: u64,
        flags: u32,
        phys_pc: u64,
    ) -> LookupResult {
        if let Some(slot) = self.lookup_slow(translator, phys_pc, cs_base, flags) {
            return LookupResult {
                slot,
                invalidated: false,
            };
        }

        let _guard = self.buckets.lock().unwrap();
        // Re-check under the lock: another thread may have translated
        // this exact block while we were waiting.
        if let Some(slot) = self.lookup_slow(translator, phys_pc, cs_base, flags) {
            return LookupResult {
                slot,
                invalidated: false,
            };
        }
        let tb = translator.generate(pc, cs_base, flags, 0);
        let invalidated = translator.take_invalidated();
        // SAFETY: `_guard` holds `buckets`.
        let slot = unsafe { self.push(tb) };
        let h = TranslatedBlock::hash(phys_pc, cs_base, flags);
        let mut buckets = self.buckets.lock().unwrap();
        self.prepend_to_bucket(&mut buckets, h, slot);
        LookupResult { slot, invalidated }
    }

    /// Patch `from_slot`'s exit 0 to jump directly to `to_slot`. Takes
    /// the same lock `find_or_generate` mutates under, so a concurrent
    /// translate/invalidate can't observe a half-patched edge.
    pub fn patch_jump(&self, from_slot: usize, to_slot: usize) {
        let _guard = self.buckets.lock().unwrap();
        let storage = unsafe { &mut *self.storage.get() };
        storage[from_slot].chained_to[0] = Some(to_slot);
    }

    /// Unlink a block from its physical chain and tombstone it. Callers
    /// must also clear any jump-cache entries referencing `slot`
    /// (`JumpCache::invalidate_slot`) since this cache has no visibility
    /// into per-CPU caches.
    pub fn invalidate(&self, slot: usize) {
        let storage = unsafe { &mut *self.storage.get() };
        let tb = &storage[slot];
        let h = TranslatedBlock::hash(tb.phys_pc, tb.cs_base, tb.flags);
        let mut buckets = self.buckets.lock().unwrap();
        self.unlink_from_bucket(&mut buckets, h, slot);
        storage[slot].invalid = true;
    }

    /// Tombstone every live block and clear all buckets. Used when
    /// `RRTap::flush_tb_pending` fires.
    pub fn flush(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        let storage = unsafe { &mut *self.storage.get() };
        for tb in storage.iter_mut() {
            tb.invalid = true;
        }
        buckets.iter_mut().for_each(|b| *b = None);
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}
