//! Pre-allocated YUV frame slot pool.
//!
//! One pool per stream. Slots are allocated once at stream open with 20%
//! dimensional headroom and handed back and forth between the decode worker
//! and the renderer by move, so the steady-state path performs no allocation
//! at all. Ownership is the state machine:
//!
//! ```text
//!   free ──acquire_free──► decoding ──publish──► ready
//!     ▲                                            │
//!     └────────── release ◄── held ◄──borrow_latest┘
//! ```
//!
//! At most one slot is *decoding* and at most one is *held* at any moment;
//! the pool's mutex is the only synchronization between the two sides.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

/// Slots per pool. Enough to decouple decode from render by one full frame
/// while a third slot absorbs the hand-off itself.
pub const POOL_SLOTS: usize = 3;

/// Plane allocations are cache-line aligned.
pub const PLANE_ALIGN: usize = 64;

/// Dimensional headroom factor: a resolution change within 20% on each axis
/// re-uses the existing allocation.
pub fn padded_dim(v: u32) -> u32 {
    (v * 6).div_ceil(5)
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool allocation of {needed} bytes exceeds memory limit ({limit} bytes in use cap)")]
    BudgetExceeded { needed: u64, limit: u64 },
    #[error("plane allocation failed ({bytes} bytes)")]
    AllocFailed { bytes: usize },
}

// ============================================================================
// Memory budget
// ============================================================================

/// Soft process-wide ceiling on pool memory, charged at allocation time.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: u64,
    used: AtomicU64,
}

impl MemoryBudget {
    pub fn new(limit_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            limit: limit_bytes,
            used: AtomicU64::new(0),
        })
    }

    fn try_charge(&self, bytes: u64) -> Result<(), PoolError> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let next = used + bytes;
            if next > self.limit {
                return Err(PoolError::BudgetExceeded {
                    needed: bytes,
                    limit: self.limit,
                });
            }
            match self.used.compare_exchange_weak(
                used,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => used = actual,
            }
        }
    }

    fn uncharge(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Plane storage
// ============================================================================

/// One owned, 64-byte-aligned byte plane.
#[derive(Debug)]
pub struct PlaneBuf {
    ptr: NonNull<u8>,
    layout: Layout,
    stride: usize,
    rows: usize,
}

// The buffer is uniquely owned and only ever touched by whichever thread
// holds the enclosing slot.
unsafe impl Send for PlaneBuf {}

impl PlaneBuf {
    fn new(stride: usize, rows: usize) -> Result<Self, PoolError> {
        let bytes = stride * rows;
        let layout = Layout::from_size_align(bytes.max(PLANE_ALIGN), PLANE_ALIGN)
            .map_err(|_| PoolError::AllocFailed { bytes })?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(PoolError::AllocFailed { bytes })?;
        Ok(Self {
            ptr,
            layout,
            stride,
            rows,
        })
    }

    /// Allocated row stride in bytes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Allocated row count.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.stride * self.rows) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.stride * self.rows) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for PlaneBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// ============================================================================
// Frame slot
// ============================================================================

/// Valid (decoded) geometry of the frame currently in a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    /// Row strides actually written: Y, U, V.
    pub strides: [usize; 3],
}

/// One (Y, U, V) triple of planes plus the metadata of its last decode.
#[derive(Debug)]
pub struct FrameSlot {
    planes: [PlaneBuf; 3],
    alloc_width: u32,
    alloc_height: u32,
    generation: u32,
    seq: u64,
    pub geometry: FrameGeometry,
    pub pts: i64,
}

impl FrameSlot {
    fn new(padded_w: u32, padded_h: u32, generation: u32) -> Result<Self, PoolError> {
        Ok(Self {
            planes: alloc_planes(padded_w, padded_h)?,
            alloc_width: padded_w,
            alloc_height: padded_h,
            generation,
            seq: 0,
            geometry: FrameGeometry::default(),
            pts: 0,
        })
    }

    pub fn alloc_width(&self) -> u32 {
        self.alloc_width
    }

    pub fn alloc_height(&self) -> u32 {
        self.alloc_height
    }

    /// Monotonic publish sequence number, 0 before the first publish.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn plane(&self, i: usize) -> &PlaneBuf {
        &self.planes[i]
    }

    pub fn plane_mut(&mut self, i: usize) -> &mut PlaneBuf {
        &mut self.planes[i]
    }

    /// Decoded dimensions may never exceed the allocation.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        width <= self.alloc_width && height <= self.alloc_height
    }
}

fn chroma_dims(padded_w: u32, padded_h: u32) -> (u32, u32) {
    (padded_w.div_ceil(2), padded_h.div_ceil(2))
}

fn alloc_planes(padded_w: u32, padded_h: u32) -> Result<[PlaneBuf; 3], PoolError> {
    let (cw, ch) = chroma_dims(padded_w, padded_h);
    Ok([
        PlaneBuf::new(padded_w as usize, padded_h as usize)?,
        PlaneBuf::new(cw as usize, ch as usize)?,
        PlaneBuf::new(cw as usize, ch as usize)?,
    ])
}

fn slot_bytes(padded_w: u32, padded_h: u32) -> u64 {
    let (cw, ch) = chroma_dims(padded_w, padded_h);
    padded_w as u64 * padded_h as u64 + 2 * (cw as u64 * ch as u64)
}

/// Total pool footprint for a stream of the given native dimensions. Used by
/// config validation before any stream is opened.
pub fn pool_bytes(width: u32, height: u32) -> u64 {
    POOL_SLOTS as u64 * slot_bytes(padded_dim(width), padded_dim(height))
}

// ============================================================================
// Pool
// ============================================================================

#[derive(Debug)]
struct Inner {
    free: Vec<FrameSlot>,
    ready: Option<FrameSlot>,
    decoding: bool,
    held: bool,
    publish_seq: u64,
    borrow_seq: u64,
    generation: u32,
    padded_w: u32,
    padded_h: u32,
}

#[derive(Debug)]
pub struct FramePool {
    inner: Mutex<Inner>,
    budget: Arc<MemoryBudget>,
    publishes: AtomicU64,
    reallocations: AtomicU64,
}

impl FramePool {
    /// Allocate a pool for a stream with the given native dimensions.
    pub fn new(width: u32, height: u32, budget: Arc<MemoryBudget>) -> Result<Self, PoolError> {
        let padded_w = padded_dim(width);
        let padded_h = padded_dim(height);
        budget.try_charge(POOL_SLOTS as u64 * slot_bytes(padded_w, padded_h))?;

        let mut free = Vec::with_capacity(POOL_SLOTS);
        for _ in 0..POOL_SLOTS {
            free.push(FrameSlot::new(padded_w, padded_h, 0)?);
        }
        tracing::debug!(
            width,
            height,
            padded_w,
            padded_h,
            bytes = POOL_SLOTS as u64 * slot_bytes(padded_w, padded_h),
            "frame pool allocated"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                free,
                ready: None,
                decoding: false,
                held: false,
                publish_seq: 0,
                borrow_seq: 0,
                generation: 0,
                padded_w,
                padded_h,
            }),
            budget,
            publishes: AtomicU64::new(0),
            reallocations: AtomicU64::new(0),
        })
    }

    /// Take a free slot for decoding. Returns `None` only if the ownership
    /// invariant has been violated elsewhere; with three slots there is
    /// always a free one when the single worker asks.
    pub fn acquire_free(&self) -> Option<FrameSlot> {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.decoding, "second concurrent acquire_free");
        let slot = inner.free.pop()?;
        inner.decoding = true;
        Some(slot)
    }

    /// Transition a decoded slot from *decoding* to *ready*. A previously
    /// ready but never-borrowed slot is recycled to the free set.
    pub fn publish(&self, mut slot: FrameSlot) {
        let mut inner = self.inner.lock();
        inner.decoding = false;
        inner.publish_seq += 1;
        slot.seq = inner.publish_seq;
        if let Some(stale) = inner.ready.take() {
            inner.free.push(stale);
        }
        inner.ready = Some(slot);
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    /// Return an acquired slot without publishing (decode produced nothing).
    pub fn cancel(&self, slot: FrameSlot) {
        let mut inner = self.inner.lock();
        inner.decoding = false;
        inner.free.push(slot);
    }

    /// Promote the most recently published slot to *held-by-renderer*,
    /// returning the previously held slot to the free set in the same
    /// critical section. Returns `false`, leaving `current` untouched, when
    /// the slot the renderer already holds is still the most recent.
    pub fn borrow_latest(&self, current: &mut Option<FrameSlot>) -> bool {
        let mut inner = self.inner.lock();
        if inner.publish_seq == inner.borrow_seq || inner.ready.is_none() {
            return false;
        }
        let fresh = inner.ready.take().expect("checked above");
        inner.borrow_seq = fresh.seq;
        if let Some(old) = current.take() {
            self.recycle(&mut inner, old);
        }
        inner.held = true;
        *current = Some(fresh);
        true
    }

    /// Return a *held-by-renderer* slot to *free*.
    pub fn release(&self, slot: FrameSlot) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.held, "release without a borrowed slot");
        inner.held = false;
        self.recycle(&mut inner, slot);
    }

    fn recycle(&self, inner: &mut Inner, mut slot: FrameSlot) {
        // A slot released after a mid-stream reallocation still carries the
        // old geometry; bring it up to the current generation first.
        if slot.generation != inner.generation {
            if let Ok(planes) = alloc_planes(inner.padded_w, inner.padded_h) {
                slot.planes = planes;
                slot.alloc_width = inner.padded_w;
                slot.alloc_height = inner.padded_h;
                slot.generation = inner.generation;
            }
        }
        slot.geometry = FrameGeometry::default();
        inner.free.push(slot);
    }

    /// Called by the decoder when the source reports new dimensions. Within
    /// the allocated headroom nothing happens; beyond it every pool-owned
    /// slot is reallocated exactly once.
    pub fn ensure_capacity(&self, width: u32, height: u32) -> Result<bool, PoolError> {
        let mut inner = self.inner.lock();
        if width <= inner.padded_w && height <= inner.padded_h {
            return Ok(false);
        }

        let padded_w = padded_dim(width);
        let padded_h = padded_dim(height);
        let old_bytes = POOL_SLOTS as u64 * slot_bytes(inner.padded_w, inner.padded_h);
        let new_bytes = POOL_SLOTS as u64 * slot_bytes(padded_w, padded_h);
        self.budget.uncharge(old_bytes);
        if let Err(e) = self.budget.try_charge(new_bytes) {
            // Put the old charge back so teardown accounting stays balanced.
            let _ = self.budget.try_charge(old_bytes);
            return Err(e);
        }

        inner.generation += 1;
        inner.padded_w = padded_w;
        inner.padded_h = padded_h;
        let generation = inner.generation;
        for slot in inner.free.iter_mut().chain(inner.ready.as_mut()) {
            slot.planes = alloc_planes(padded_w, padded_h)?;
            slot.alloc_width = padded_w;
            slot.alloc_height = padded_h;
            slot.generation = generation;
        }
        self.reallocations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(width, height, padded_w, padded_h, "frame pool reallocated");
        Ok(true)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            capacity: POOL_SLOTS,
            free: inner.free.len(),
            publishes: self.publishes.load(Ordering::Relaxed),
            reallocations: self.reallocations.load(Ordering::Relaxed),
        }
    }

    /// Allocated (padded) dimensions, for texture sizing.
    pub fn padded_dims(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.padded_w, inner.padded_h)
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        self.budget
            .uncharge(POOL_SLOTS as u64 * slot_bytes(inner.padded_w, inner.padded_h));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub publishes: u64,
    pub reallocations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(w: u32, h: u32) -> FramePool {
        FramePool::new(w, h, MemoryBudget::new(512 * 1024 * 1024)).unwrap()
    }

    #[test]
    fn padded_dims_are_twenty_percent_up() {
        assert_eq!(padded_dim(1000), 1200);
        assert_eq!(padded_dim(1920), 2304);
        assert_eq!(padded_dim(1), 2);
    }

    #[test]
    fn planes_are_cache_aligned() {
        let pool = test_pool(640, 480);
        let slot = pool.acquire_free().unwrap();
        for i in 0..3 {
            assert_eq!(slot.plane(i).as_ptr() as usize % PLANE_ALIGN, 0);
        }
        pool.cancel(slot);
    }

    #[test]
    fn ownership_cycle() {
        let pool = test_pool(320, 240);

        // Nothing published yet: the renderer has nothing to borrow.
        let mut held = None;
        assert!(!pool.borrow_latest(&mut held));
        assert!(held.is_none());

        let mut slot = pool.acquire_free().unwrap();
        slot.pts = 42;
        pool.publish(slot);

        assert!(pool.borrow_latest(&mut held));
        assert_eq!(held.as_ref().unwrap().pts, 42);

        // Same publish again: still the most recent, so no re-borrow.
        assert!(!pool.borrow_latest(&mut held));

        pool.release(held.take().unwrap());
        assert_eq!(pool.stats().free, POOL_SLOTS);
    }

    #[test]
    fn borrow_swaps_in_one_step() {
        let pool = test_pool(320, 240);
        let mut held = None;

        let mut a = pool.acquire_free().unwrap();
        a.pts = 1;
        pool.publish(a);
        assert!(pool.borrow_latest(&mut held));

        let mut b = pool.acquire_free().unwrap();
        b.pts = 2;
        pool.publish(b);

        // The swap frees the old slot inside the pool; the caller only ever
        // owns one.
        assert!(pool.borrow_latest(&mut held));
        assert_eq!(held.as_ref().unwrap().pts, 2);
        assert_eq!(pool.stats().free, POOL_SLOTS - 1);

        pool.release(held.take().unwrap());
    }

    #[test]
    fn unborrowed_publish_is_recycled() {
        let pool = test_pool(320, 240);
        for pts in 0..10 {
            let mut slot = pool.acquire_free().unwrap();
            slot.pts = pts;
            pool.publish(slot);
        }
        // Renderer never borrowed; every stale ready slot went back to free.
        let mut held = None;
        assert!(pool.borrow_latest(&mut held));
        assert_eq!(held.as_ref().unwrap().pts, 9);
        pool.release(held.take().unwrap());
    }

    #[test]
    fn steady_state_reuses_the_same_allocations() {
        let pool = test_pool(320, 240);
        let mut initial: Vec<usize> = Vec::new();
        {
            let inner = pool.inner.lock();
            for slot in &inner.free {
                for i in 0..3 {
                    initial.push(slot.plane(i).as_ptr() as usize);
                }
            }
        }

        let mut held = None;
        for _ in 0..100 {
            let slot = pool.acquire_free().unwrap();
            pool.publish(slot);
            pool.borrow_latest(&mut held);
        }
        if let Some(slot) = held.take() {
            pool.release(slot);
        }

        let inner = pool.inner.lock();
        for slot in inner.free.iter().chain(inner.ready.as_ref()) {
            for i in 0..3 {
                assert!(
                    initial.contains(&(slot.plane(i).as_ptr() as usize)),
                    "plane allocation changed during steady state"
                );
            }
        }
    }

    #[test]
    fn resize_within_headroom_keeps_allocation() {
        let pool = test_pool(1000, 1000);
        assert!(!pool.ensure_capacity(1100, 1150).unwrap());
        assert_eq!(pool.stats().reallocations, 0);
    }

    #[test]
    fn resize_beyond_headroom_reallocates_once() {
        let pool = test_pool(1000, 1000);
        assert!(pool.ensure_capacity(1300, 1000).unwrap());
        assert_eq!(pool.stats().reallocations, 1);
        // The new size now has its own headroom.
        assert!(!pool.ensure_capacity(1350, 1000).unwrap());
        assert_eq!(pool.padded_dims().0, padded_dim(1300));
    }

    #[test]
    fn held_slot_is_refreshed_on_release_after_resize() {
        let pool = test_pool(320, 240);
        let slot = pool.acquire_free().unwrap();
        pool.publish(slot);
        let mut held = None;
        assert!(pool.borrow_latest(&mut held));

        pool.ensure_capacity(640, 480).unwrap();
        pool.release(held.take().unwrap());

        let inner = pool.inner.lock();
        for slot in &inner.free {
            assert_eq!(slot.alloc_width(), padded_dim(640));
            assert_eq!(slot.alloc_height(), padded_dim(480));
        }
    }

    #[test]
    fn budget_rejects_oversized_pool() {
        let budget = MemoryBudget::new(1024 * 1024); // 1 MB
        let err = FramePool::new(1920, 1080, budget).unwrap_err();
        assert!(matches!(err, PoolError::BudgetExceeded { .. }));
    }

    #[test]
    fn budget_is_returned_on_drop() {
        let budget = MemoryBudget::new(512 * 1024 * 1024);
        {
            let _pool = FramePool::new(1920, 1080, budget.clone()).unwrap();
            assert_eq!(budget.used_bytes(), pool_bytes(1920, 1080));
        }
        assert_eq!(budget.used_bytes(), 0);
    }
}
