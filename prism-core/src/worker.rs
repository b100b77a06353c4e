//! Per-stream async decode worker.
//!
//! One worker thread per stream, pinned to a dedicated core when one is
//! available. The render thread and the worker share a mutex and two
//! condition variables:
//!
//! ```text
//!   render ──request──► worker: acquire slot, decode, publish
//!   render ◄──ready──── worker: frame published (or stream ended/broke)
//! ```
//!
//! Decode latency hides beneath the render thread's VSync wait: the request
//! for frame N+1 is signalled as soon as frame N is consumed, so the worker
//! decodes while the renderer uploads, draws and blocks on the flip.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::affinity::{pin_current_thread, CoreAllocator};
use crate::clock::StreamMetrics;
use crate::decode::{DecodeStatus, FrameSource};
use crate::pool::FramePool;

/// Worker lifecycle, visible to the render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Decoding,
    FrameReady,
    Exiting,
}

/// Why a worker stopped producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Ended,
    Broken,
}

/// Result of waiting on the *ready* condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Terminal(Terminal),
    TimedOut,
}

#[derive(Debug)]
struct State {
    phase: WorkerPhase,
    requested: bool,
    /// Set on publish, cleared when the render thread observes it.
    fresh: bool,
    terminal: Option<Terminal>,
    exiting: bool,
    exited: bool,
}

struct Shared {
    state: Mutex<State>,
    request: Condvar,
    ready: Condvar,
}

pub struct DecodeWorker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    core: Option<usize>,
}

impl DecodeWorker {
    /// Spawn the worker for one stream. The core is reserved here so two
    /// workers can never race into the same assignment.
    pub fn spawn<S>(
        name: &str,
        source: S,
        pool: Arc<FramePool>,
        cores: &CoreAllocator,
        metrics: Arc<Mutex<StreamMetrics>>,
    ) -> Self
    where
        S: FrameSource + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                phase: WorkerPhase::Idle,
                requested: false,
                fresh: false,
                terminal: None,
                exiting: false,
                exited: false,
            }),
            request: Condvar::new(),
            ready: Condvar::new(),
        });

        let core = cores.allocate();
        let thread_shared = shared.clone();
        let thread_name = format!("decode-{name}");
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run(thread_shared, source, pool, metrics, core))
            .expect("spawn decode worker");

        tracing::debug!(worker = %thread_name, ?core, "decode worker started");
        Self {
            shared,
            handle: Some(handle),
            core,
        }
    }

    /// Core this worker pinned to, if any.
    pub fn core(&self) -> Option<usize> {
        self.core
    }

    pub fn phase(&self) -> WorkerPhase {
        self.shared.state.lock().phase
    }

    pub fn terminal(&self) -> Option<Terminal> {
        self.shared.state.lock().terminal
    }

    /// Ask the worker to decode the next frame. Cheap and idempotent.
    pub fn request_next(&self) {
        let mut state = self.shared.state.lock();
        if state.terminal.is_some() || state.exiting {
            return;
        }
        state.requested = true;
        self.shared.request.notify_one();
    }

    /// Block until a new frame has been published (or the stream terminated,
    /// or `timeout` elapsed). A `Ready` outcome consumes the freshness flag.
    pub fn wait_frame_ready(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.fresh {
                state.fresh = false;
                return WaitOutcome::Ready;
            }
            if let Some(t) = state.terminal {
                return WaitOutcome::Terminal(t);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::TimedOut;
            }
            self.shared.ready.wait_for(&mut state, remaining);
        }
    }

    /// Non-blocking check for a fresh publish, consuming the flag.
    pub fn take_fresh(&self) -> bool {
        let mut state = self.shared.state.lock();
        std::mem::take(&mut state.fresh)
    }

    /// Stop the worker. A worker blocked inside the codec can only observe
    /// cancellation at its next yield, so after `grace` the thread is
    /// abandoned and its resources are left for process exit to sweep up.
    pub fn shutdown(&mut self, grace: Duration) {
        {
            let mut state = self.shared.state.lock();
            state.exiting = true;
            self.shared.request.notify_all();
        }

        let deadline = Instant::now() + grace;
        let mut state = self.shared.state.lock();
        while !state.exited {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.shared.ready.wait_for(&mut state, remaining);
        }
        let exited = state.exited;
        drop(state);

        if exited {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        } else if let Some(handle) = self.handle.take() {
            tracing::warn!("decode worker did not stop within grace period, detaching");
            drop(handle);
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown(Duration::from_millis(500));
        }
    }
}

// ============================================================================
// Worker thread body
// ============================================================================

fn run<S: FrameSource>(
    shared: Arc<Shared>,
    mut source: S,
    pool: Arc<FramePool>,
    metrics: Arc<Mutex<StreamMetrics>>,
    core: Option<usize>,
) {
    if let Some(core) = core {
        pin_current_thread(core);
    }

    loop {
        // Sleep until the render thread wants another frame.
        {
            let mut state = shared.state.lock();
            if !state.requested && !state.exiting {
                state.phase = WorkerPhase::Idle;
            }
            while !state.requested && !state.exiting {
                shared.request.wait(&mut state);
            }
            if state.exiting {
                break;
            }
            state.requested = false;
            state.phase = WorkerPhase::Decoding;
        }

        if decode_one(&shared, &mut source, &pool, &metrics).is_err() {
            break;
        }
    }

    let mut state = shared.state.lock();
    state.phase = WorkerPhase::Exiting;
    state.exited = true;
    shared.ready.notify_all();
}

/// Decode until exactly one frame is published or the stream terminates.
/// `Err(())` means the outer loop should stop.
fn decode_one<S: FrameSource>(
    shared: &Shared,
    source: &mut S,
    pool: &FramePool,
    metrics: &Mutex<StreamMetrics>,
) -> Result<(), ()> {
    let mut slot = match pool.acquire_free() {
        Some(slot) => slot,
        None => {
            tracing::error!("no free pool slot on decode request");
            finish_terminal(shared, Terminal::Broken);
            return Err(());
        }
    };

    loop {
        let started = Instant::now();
        match source.next_frame(&mut slot) {
            Ok(DecodeStatus::Frame) => {
                pool.publish(slot);
                {
                    let mut m = metrics.lock();
                    m.frames_decoded += 1;
                    m.decode.record(started.elapsed());
                    let c = source.counters();
                    m.hw_failures = c.hw_failures;
                    m.fallbacks = c.fallbacks;
                }
                let mut state = shared.state.lock();
                state.phase = WorkerPhase::FrameReady;
                state.fresh = true;
                shared.ready.notify_all();
                return Ok(());
            }
            Ok(DecodeStatus::Retry) => {
                // Loop immediately; only a shutdown interrupts the retry run.
                if shared.state.lock().exiting {
                    pool.cancel(slot);
                    return Err(());
                }
            }
            Ok(DecodeStatus::NeedsRealloc { width, height }) => {
                pool.cancel(slot);
                if let Err(e) = pool.ensure_capacity(width, height) {
                    tracing::error!("pool reallocation failed: {e}");
                    finish_terminal(shared, Terminal::Broken);
                    return Err(());
                }
                slot = match pool.acquire_free() {
                    Some(slot) => slot,
                    None => {
                        finish_terminal(shared, Terminal::Broken);
                        return Err(());
                    }
                };
            }
            Ok(DecodeStatus::Eof) => {
                pool.cancel(slot);
                finish_terminal(shared, Terminal::Ended);
                return Err(());
            }
            Err(e) => {
                tracing::error!("stream broke: {e}");
                pool.cancel(slot);
                finish_terminal(shared, Terminal::Broken);
                return Err(());
            }
        }
    }
}

fn finish_terminal(shared: &Shared, terminal: Terminal) {
    let mut state = shared.state.lock();
    state.terminal = Some(terminal);
    shared.ready.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodeError, SourceCounters};
    use crate::pool::{FrameSlot, MemoryBudget};

    enum Step {
        Frame(i64),
        Retry,
        Resize(u32, u32),
        Block(Duration),
        Eof,
        Fatal,
    }

    struct ScriptedSource {
        steps: std::vec::IntoIter<Step>,
        dims: (u32, u32),
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into_iter(),
                dims: (320, 240),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self, slot: &mut FrameSlot) -> Result<DecodeStatus, DecodeError> {
            match self.steps.next() {
                Some(Step::Frame(pts)) => {
                    slot.pts = pts;
                    slot.geometry.width = self.dims.0;
                    slot.geometry.height = self.dims.1;
                    Ok(DecodeStatus::Frame)
                }
                Some(Step::Retry) => Ok(DecodeStatus::Retry),
                Some(Step::Resize(w, h)) => {
                    self.dims = (w, h);
                    if slot.fits(w, h) {
                        slot.pts = -1;
                        slot.geometry.width = w;
                        slot.geometry.height = h;
                        Ok(DecodeStatus::Frame)
                    } else {
                        Ok(DecodeStatus::NeedsRealloc {
                            width: w,
                            height: h,
                        })
                    }
                }
                Some(Step::Block(d)) => {
                    std::thread::sleep(d);
                    Ok(DecodeStatus::Retry)
                }
                Some(Step::Eof) | None => Ok(DecodeStatus::Eof),
                Some(Step::Fatal) => Err(DecodeError::Fatal("scripted".into())),
            }
        }

        fn dimensions(&self) -> (u32, u32) {
            self.dims
        }

        fn counters(&self) -> SourceCounters {
            SourceCounters::default()
        }
    }

    fn harness(steps: Vec<Step>) -> (DecodeWorker, Arc<FramePool>, Arc<Mutex<StreamMetrics>>) {
        let pool = Arc::new(
            FramePool::new(320, 240, MemoryBudget::new(512 * 1024 * 1024)).unwrap(),
        );
        let metrics = Arc::new(Mutex::new(StreamMetrics::new()));
        let cores = CoreAllocator::new();
        let worker = DecodeWorker::spawn(
            "test",
            ScriptedSource::new(steps),
            pool.clone(),
            &cores,
            metrics.clone(),
        );
        (worker, pool, metrics)
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn frames_arrive_in_decode_order() {
        let (mut worker, pool, metrics) =
            harness(vec![Step::Frame(10), Step::Retry, Step::Frame(20), Step::Frame(30)]);

        let mut held = None;
        for want_pts in [10, 20, 30] {
            worker.request_next();
            assert_eq!(worker.wait_frame_ready(WAIT), WaitOutcome::Ready);
            assert!(pool.borrow_latest(&mut held));
            assert_eq!(held.as_ref().unwrap().pts, want_pts);
        }
        assert_eq!(metrics.lock().frames_decoded, 3);

        if let Some(slot) = held.take() {
            pool.release(slot);
        }
        worker.shutdown(WAIT);
    }

    #[test]
    fn eof_surfaces_as_terminal() {
        let (mut worker, _pool, _metrics) = harness(vec![Step::Frame(1), Step::Eof]);

        worker.request_next();
        assert_eq!(worker.wait_frame_ready(WAIT), WaitOutcome::Ready);
        worker.request_next();
        assert_eq!(
            worker.wait_frame_ready(WAIT),
            WaitOutcome::Terminal(Terminal::Ended)
        );
        assert_eq!(worker.terminal(), Some(Terminal::Ended));
        worker.shutdown(WAIT);
    }

    #[test]
    fn fatal_marks_stream_broken() {
        let (mut worker, _pool, _metrics) = harness(vec![Step::Fatal]);
        worker.request_next();
        assert_eq!(
            worker.wait_frame_ready(WAIT),
            WaitOutcome::Terminal(Terminal::Broken)
        );
        worker.shutdown(WAIT);
    }

    #[test]
    fn resize_reallocates_and_still_delivers() {
        let (mut worker, pool, _metrics) =
            harness(vec![Step::Frame(1), Step::Resize(800, 600), Step::Frame(2)]);

        let mut held = None;
        worker.request_next();
        assert_eq!(worker.wait_frame_ready(WAIT), WaitOutcome::Ready);
        assert!(pool.borrow_latest(&mut held));

        // The resized frame forces exactly one pool reallocation mid-request.
        worker.request_next();
        assert_eq!(worker.wait_frame_ready(WAIT), WaitOutcome::Ready);
        assert!(pool.borrow_latest(&mut held));
        let slot = held.as_ref().unwrap();
        assert_eq!(slot.pts, -1);
        assert_eq!(slot.geometry.width, 800);
        assert!(slot.fits(800, 600));
        assert_eq!(pool.stats().reallocations, 1);

        pool.release(held.take().unwrap());
        worker.shutdown(WAIT);
    }

    #[test]
    fn idle_worker_stops_promptly() {
        let (mut worker, _pool, _metrics) = harness(vec![Step::Frame(1)]);
        let start = Instant::now();
        worker.shutdown(WAIT);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(worker.phase(), WorkerPhase::Exiting);
    }

    #[test]
    fn blocked_worker_is_abandoned_after_grace() {
        let (mut worker, _pool, _metrics) = harness(vec![
            Step::Block(Duration::from_millis(400)),
            Step::Block(Duration::from_millis(400)),
            Step::Frame(1),
        ]);
        worker.request_next();
        std::thread::sleep(Duration::from_millis(50)); // let it enter the block
        let start = Instant::now();
        worker.shutdown(Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn first_frame_timeout_is_observable() {
        let (mut worker, _pool, _metrics) = harness(vec![
            Step::Block(Duration::from_millis(500)),
            Step::Frame(1),
        ]);
        worker.request_next();
        assert_eq!(
            worker.wait_frame_ready(Duration::from_millis(30)),
            WaitOutcome::TimedOut
        );
        worker.shutdown(WAIT);
    }

    #[test]
    fn requests_after_terminal_are_ignored() {
        let (mut worker, _pool, _metrics) = harness(vec![Step::Eof]);
        worker.request_next();
        assert_eq!(
            worker.wait_frame_ready(WAIT),
            WaitOutcome::Terminal(Terminal::Ended)
        );
        // Nothing bad happens; terminal sticks.
        worker.request_next();
        assert_eq!(
            worker.wait_frame_ready(Duration::from_millis(20)),
            WaitOutcome::Terminal(Terminal::Ended)
        );
        worker.shutdown(WAIT);
    }
}
