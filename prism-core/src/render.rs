//! The render loop.
//!
//! Strictly VSync-paced: every iteration uploads whatever frames are ready,
//! draws each stream's quad under the keystone transform, runs the optional
//! overlay pass and then blocks in `present` until the page flip lands. No
//! software delays anywhere; if an iteration overshoots the frame interval
//! the miss is counted and the loop simply catches the next flip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::{RenderMetrics, StreamMetrics};
use crate::decode::{BackendReport, StreamPhase};
use crate::display::DisplaySurface;
use crate::error::EngineError;
use crate::gl::{GlContext, PlaneTextures};
use crate::input::{InputEvent, InputSource};
use crate::keystone::{KeystoneState, Mat3};
use crate::pool::{FramePool, FrameSlot};
use crate::worker::{DecodeWorker, Terminal, WaitOutcome};

/// External draw pass invoked after the video pass. Failures are logged and
/// the pass is skipped for that frame; they never stop playback.
pub trait OverlayPass: Send {
    fn draw(
        &mut self,
        gl: &GlContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Everything the render loop needs of one stream.
pub struct StreamRuntime {
    pub name: String,
    pub pool: Arc<FramePool>,
    pub worker: DecodeWorker,
    pub metrics: Arc<Mutex<StreamMetrics>>,
    pub report: BackendReport,
    pub phase: StreamPhase,
    opened_at: Instant,
    held: Option<FrameSlot>,
    textures: Option<PlaneTextures>,
}

impl StreamRuntime {
    pub fn new(
        name: String,
        pool: Arc<FramePool>,
        worker: DecodeWorker,
        metrics: Arc<Mutex<StreamMetrics>>,
        report: BackendReport,
    ) -> Self {
        Self {
            name,
            pool,
            worker,
            metrics,
            report,
            phase: StreamPhase::Draining,
            opened_at: Instant::now(),
            held: None,
            textures: None,
        }
    }

    fn has_first_frame(&self) -> bool {
        self.held.is_some()
    }

    fn mark_broken(&mut self) {
        self.phase = StreamPhase::Broken;
        self.worker.shutdown(Duration::from_millis(100));
    }

    /// Give the held slot back and drop GL-side state. Called by teardown
    /// before the pool and GL context go away.
    pub fn release_render_state(&mut self, gl: &GlContext) {
        if let Some(slot) = self.held.take() {
            self.pool.release(slot);
        }
        if let Some(textures) = self.textures.take() {
            textures.destroy(gl.gl());
        }
    }
}

/// Screen layout for stream `index` of `count`: full screen for one stream,
/// side-by-side halves for two.
pub fn layout_for(index: usize, count: usize) -> Mat3 {
    let w = 1.0 / count as f32;
    Mat3::scale_translate(w, 1.0, index as f32 * w, 0.0)
}

/// Apply one input event. Returns true when the engine should quit.
pub fn apply_input(
    event: InputEvent,
    keystone: &mut KeystoneState,
    overlay_enabled: &mut bool,
) -> bool {
    match event {
        InputEvent::Quit => return true,
        InputEvent::ToggleOverlay => *overlay_enabled = !*overlay_enabled,
        InputEvent::SelectCorner(c) => keystone.select(c as usize),
        InputEvent::NudgeCorner { dx, dy } => keystone.nudge(dx, dy),
        InputEvent::ResetKeystone => keystone.reset(),
    }
    false
}

pub struct RenderLoop<'a> {
    pub display: &'a mut DisplaySurface,
    pub gl: &'a GlContext,
    pub streams: &'a mut [StreamRuntime],
    pub keystone: &'a mut KeystoneState,
    pub input: &'a mut dyn InputSource,
    pub overlay: Option<&'a mut dyn OverlayPass>,
    pub overlay_enabled: bool,
    pub quit: &'a AtomicBool,
    pub metrics: &'a mut RenderMetrics,
    pub first_frame_deadline: Duration,
}

impl RenderLoop<'_> {
    pub fn run(mut self) -> Result<(), EngineError> {
        let period = self.display.refresh_period();
        let stream_count = self.streams.len();

        // Prime every worker before the first iteration.
        for stream in self.streams.iter() {
            stream.worker.request_next();
        }

        loop {
            if self.quit.load(Ordering::Relaxed) {
                tracing::info!("quit flag observed, leaving render loop");
                return Ok(());
            }

            // Inputs are applied between frames only.
            while let Some(event) = self.input.poll() {
                if apply_input(event, self.keystone, &mut self.overlay_enabled) {
                    self.quit.store(true, Ordering::Relaxed);
                }
            }

            let iteration_start = Instant::now();
            let mut broken = 0usize;

            for stream in self.streams.iter_mut() {
                step_stream(stream, self.gl, period, self.first_frame_deadline);
                if stream.phase == StreamPhase::Broken {
                    broken += 1;
                }
            }

            if broken == stream_count {
                tracing::error!("every stream is broken, stopping");
                return Err(EngineError::AllStreamsBroken);
            }

            // Draw pass: clear, one keystoned quad per stream, overlay.
            self.gl.begin_frame();
            let keystone_matrix = *self.keystone.matrix();
            for (i, stream) in self.streams.iter().enumerate() {
                if let Some(textures) = &stream.textures {
                    let transform = keystone_matrix.mul(&layout_for(i, stream_count));
                    self.gl.draw_video(textures, &transform);
                }
            }
            if self.overlay_enabled {
                if let Some(overlay) = self.overlay.as_deref_mut() {
                    if let Err(e) = overlay.draw(self.gl) {
                        tracing::warn!("overlay pass failed, skipped this frame: {e}");
                    }
                }
            }

            self.gl.swap()?;
            self.display.present()?;

            let now = Instant::now();
            self.metrics.render.record(now - iteration_start);
            self.metrics.on_present(now, period);
            for stream in self.streams.iter_mut() {
                if stream.has_first_frame() {
                    stream.metrics.lock().frames_presented += 1;
                }
            }
        }
    }
}

fn step_stream(
    stream: &mut StreamRuntime,
    gl: &GlContext,
    period: Duration,
    first_frame_deadline: Duration,
) {
    if stream.phase.is_terminal() {
        return;
    }

    // Before the first frame the loop may block briefly on the ready
    // condition; afterwards it never waits on the decoder.
    if !stream.has_first_frame() {
        match stream.worker.wait_frame_ready(period) {
            WaitOutcome::Ready => {}
            WaitOutcome::Terminal(t) => {
                apply_terminal(stream, t);
                return;
            }
            WaitOutcome::TimedOut => {
                if stream.opened_at.elapsed() > first_frame_deadline {
                    tracing::error!(
                        stream = %stream.name,
                        "no frame within the start-up deadline"
                    );
                    stream.mark_broken();
                }
                return;
            }
        }
    } else if let Some(t) = stream.worker.terminal() {
        apply_terminal(stream, t);
        return;
    } else {
        stream.worker.take_fresh();
    }

    let had_frame = stream.has_first_frame();
    if stream.pool.borrow_latest(&mut stream.held) {
        stream.phase = stream.phase.on_status(crate::decode::DecodeStatus::Frame);
        // Consumed a slot: kick the worker for the next one right away so it
        // decodes under our upcoming VSync wait.
        stream.worker.request_next();

        let slot = stream.held.as_ref().expect("borrow_latest returned true");
        upload_slot(stream.pool.padded_dims(), &mut stream.textures, gl, slot);
    } else if had_frame {
        // Re-presenting the previous frame is a repeat, not a drop. The
        // request issued at the last borrow is still outstanding, so the
        // worker needs no extra signal.
        stream.metrics.lock().frames_repeated += 1;
    }
}

fn apply_terminal(stream: &mut StreamRuntime, terminal: Terminal) {
    match terminal {
        Terminal::Ended => {
            if stream.phase != StreamPhase::Ended {
                tracing::info!(stream = %stream.name, "end of stream");
                stream.phase = StreamPhase::Ended;
            }
        }
        Terminal::Broken => {
            if stream.phase != StreamPhase::Broken {
                tracing::error!(stream = %stream.name, "stream broken");
                stream.phase = StreamPhase::Broken;
            }
        }
    }
}

fn upload_slot(
    padded: (u32, u32),
    textures: &mut Option<PlaneTextures>,
    gl: &GlContext,
    slot: &FrameSlot,
) {
    let needs_new = match textures {
        Some(t) => !t.matches(padded.0, padded.1),
        None => true,
    };
    if needs_new {
        if let Some(old) = textures.take() {
            old.destroy(gl.gl());
        }
        match gl.create_plane_textures(padded.0, padded.1) {
            Ok(t) => *textures = Some(t),
            Err(e) => {
                tracing::error!("plane texture allocation failed: {e}");
                return;
            }
        }
    }
    if let Some(t) = textures.as_mut() {
        t.upload(gl.gl(), slot);
    }
}
