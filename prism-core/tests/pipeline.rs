//! Decode-to-render hand-off over real pools and workers.
//!
//! A synthetic frame source stands in for the codec; everything else — slot
//! ownership, the request/ready protocol, borrow/release on the render side —
//! is the production path.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use prism_core::clock::StreamMetrics;
use prism_core::copy::copy_plane;
use prism_core::decode::{DecodeError, DecodeStatus, FrameSource};
use prism_core::pool::{FramePool, FrameSlot, MemoryBudget, POOL_SLOTS};
use prism_core::worker::{DecodeWorker, Terminal, WaitOutcome};
use prism_core::affinity::CoreAllocator;

const WAIT: Duration = Duration::from_secs(5);

/// Produces `total` frames of a deterministic test pattern, then EOF. The
/// source rows carry synthetic codec padding so the stride-aware copy path
/// is exercised end to end.
struct PatternSource {
    width: u32,
    height: u32,
    next_pts: i64,
    total: i64,
}

impl PatternSource {
    fn new(width: u32, height: u32, total: i64) -> Self {
        Self {
            width,
            height,
            next_pts: 0,
            total,
        }
    }

    fn fill_plane(slot: &mut FrameSlot, plane: usize, w: usize, h: usize, seed: u8) -> usize {
        // Source with 37 bytes of row padding, like decoder output.
        let src_stride = w + 37;
        let src: Vec<u8> = (0..src_stride * h)
            .map(|i| {
                let (row, col) = (i / src_stride, i % src_stride);
                if col < w {
                    expected_byte(row, col, seed)
                } else {
                    0xEE // padding; must never reach the slot
                }
            })
            .collect();
        let buf = slot.plane_mut(plane);
        let dst_stride = buf.stride();
        copy_plane(buf.as_mut_slice(), dst_stride, &src, src_stride, w, h);
        dst_stride
    }
}

fn expected_byte(row: usize, col: usize, seed: u8) -> u8 {
    (row as u8)
        .wrapping_mul(7)
        .wrapping_add((col as u8).wrapping_mul(13))
        .wrapping_add(seed)
}

impl FrameSource for PatternSource {
    fn next_frame(&mut self, slot: &mut FrameSlot) -> Result<DecodeStatus, DecodeError> {
        if self.next_pts >= self.total {
            return Ok(DecodeStatus::Eof);
        }
        let w = self.width as usize;
        let h = self.height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        let seed = self.next_pts as u8;

        let ys = Self::fill_plane(slot, 0, w, h, seed);
        let us = Self::fill_plane(slot, 1, cw, ch, seed.wrapping_add(1));
        let vs = Self::fill_plane(slot, 2, cw, ch, seed.wrapping_add(2));

        slot.geometry.width = self.width;
        slot.geometry.height = self.height;
        slot.geometry.strides = [ys, us, vs];
        slot.pts = self.next_pts;
        self.next_pts += 1;
        Ok(DecodeStatus::Frame)
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

struct Harness {
    pool: Arc<FramePool>,
    worker: DecodeWorker,
    metrics: Arc<Mutex<StreamMetrics>>,
    held: Option<FrameSlot>,
    presented: Vec<i64>,
}

fn spawn(name: &str, cores: &CoreAllocator, frames: i64) -> Harness {
    let pool = Arc::new(FramePool::new(176, 144, MemoryBudget::new(64 << 20)).unwrap());
    let metrics = Arc::new(Mutex::new(StreamMetrics::new()));
    let worker = DecodeWorker::spawn(
        name,
        PatternSource::new(176, 144, frames),
        pool.clone(),
        cores,
        metrics.clone(),
    );
    Harness {
        pool,
        worker,
        metrics,
        held: None,
        presented: Vec::new(),
    }
}

impl Harness {
    /// One render-side iteration: wait for the publish, borrow, re-request.
    fn step(&mut self) -> bool {
        match self.worker.wait_frame_ready(WAIT) {
            WaitOutcome::Ready => {}
            WaitOutcome::Terminal(Terminal::Ended) => return false,
            other => panic!("unexpected wait outcome: {other:?}"),
        }
        assert!(self.pool.borrow_latest(&mut self.held), "publish without borrowable slot");
        self.worker.request_next();
        self.presented.push(self.held.as_ref().unwrap().pts);
        true
    }

    fn finish(mut self) -> (Vec<i64>, Arc<FramePool>) {
        if let Some(slot) = self.held.take() {
            self.pool.release(slot);
        }
        self.worker.shutdown(WAIT);
        (self.presented, self.pool)
    }
}

#[test]
fn single_stream_delivers_every_frame_in_order() {
    let cores = CoreAllocator::new();
    let mut h = spawn("ordered", &cores, 40);
    h.worker.request_next();
    while h.step() {}

    assert_eq!(h.metrics.lock().frames_decoded, 40);
    let (presented, pool) = h.finish();
    assert_eq!(presented, (0..40).collect::<Vec<i64>>());
    assert_eq!(pool.stats().free, POOL_SLOTS);
}

#[test]
fn plane_contents_survive_the_stride_copy() {
    let cores = CoreAllocator::new();
    let mut h = spawn("content", &cores, 3);
    h.worker.request_next();
    assert!(h.step());

    let slot = h.held.as_ref().unwrap();
    let seed = slot.pts as u8;
    assert_eq!(slot.geometry.width, 176);
    assert_eq!(slot.geometry.height, 144);

    let dims = [(176usize, 144usize, seed), (88, 72, seed.wrapping_add(1)), (88, 72, seed.wrapping_add(2))];
    for (plane, (w, h_px, plane_seed)) in dims.into_iter().enumerate() {
        let buf = slot.plane(plane);
        let stride = slot.geometry.strides[plane];
        let data = buf.as_slice();
        for row in [0, 1, h_px / 2, h_px - 1] {
            for col in [0, 1, w / 2, w - 1] {
                assert_eq!(
                    data[row * stride + col],
                    expected_byte(row, col, plane_seed),
                    "plane {plane} row {row} col {col}"
                );
            }
        }
    }
    h.finish();
}

#[test]
fn dual_streams_advance_independently_and_equally() {
    let cores = CoreAllocator::new();
    let mut a = spawn("left", &cores, 30);
    let mut b = spawn("right", &cores, 30);

    a.worker.request_next();
    b.worker.request_next();

    let mut live_a = true;
    let mut live_b = true;
    while live_a || live_b {
        if live_a {
            live_a = a.step();
        }
        if live_b {
            live_b = b.step();
        }
    }

    let (pa, pool_a) = a.finish();
    let (pb, pool_b) = b.finish();

    // Per-stream ordering holds and neither stream starves the other.
    assert_eq!(pa, (0..30).collect::<Vec<i64>>());
    assert_eq!(pb, (0..30).collect::<Vec<i64>>());
    assert!((pa.len() as i64 - pb.len() as i64).abs() <= 1);

    assert_eq!(pool_a.stats().free, POOL_SLOTS);
    assert_eq!(pool_b.stats().free, POOL_SLOTS);
}

#[test]
fn workers_on_distinct_cores_when_available() {
    let cores = CoreAllocator::new();
    let a = spawn("pin-a", &cores, 1);
    let b = spawn("pin-b", &cores, 1);

    if let (Some(ca), Some(cb)) = (a.worker.core(), b.worker.core()) {
        assert_ne!(ca, cb);
        assert!(ca >= 2 && cb >= 2, "low cores are reserved");
    }
}
