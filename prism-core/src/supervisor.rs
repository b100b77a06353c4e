//! Engine lifecycle: construction, signal handling, ordered teardown.
//!
//! The supervisor owns every scoped resource and guarantees the display and
//! terminal come back in their original state on all exit paths:
//!
//! - interrupt/terminate set the quit flag; the render loop exits between
//!   frames and teardown runs normally,
//! - segfault/bus/abort run a minimal async-signal-safe handler (terminal to
//!   cooked mode, CRTC restore by raw ioctl) and re-raise the default
//!   disposition so the process still dumps core.
//!
//! Teardown order on quit: stop workers, close decoders, free pools, destroy
//! the GL context, release the display, flush logs.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::affinity::CoreAllocator;
use crate::clock::{Clock, RenderMetrics, RenderStats, StreamMetrics, StreamStats};
use crate::config::{EngineConfig, LogLevel};
use crate::decode::{BackendReport, FrameSource, MediaDecoder};
use crate::display::{self, DisplaySurface};
use crate::error::EngineError;
use crate::gl::GlContext;
use crate::input::{InputSource, NullInput};
use crate::keystone::KeystoneState;
use crate::pool::{FramePool, MemoryBudget};
use crate::render::{OverlayPass, RenderLoop, StreamRuntime};
use crate::worker::DecodeWorker;

/// How long a worker gets to leave a codec call before being abandoned.
const WORKER_GRACE: Duration = Duration::from_millis(750);

// ============================================================================
// Process-wide flags and restores
// ============================================================================

static QUIT: AtomicBool = AtomicBool::new(false);

/// The quit flag, readable from anywhere (it is set from signal context).
pub fn quit_flag() -> &'static AtomicBool {
    &QUIT
}

struct TerminalRestore {
    armed: AtomicBool,
    fd: AtomicI32,
    saved: std::cell::UnsafeCell<libc::termios>,
}

// Written once before arming, then read only by restore paths.
unsafe impl Sync for TerminalRestore {}

static TERMINAL: TerminalRestore = TerminalRestore {
    armed: AtomicBool::new(false),
    fd: AtomicI32::new(-1),
    saved: std::cell::UnsafeCell::new(unsafe { std::mem::zeroed() }),
};

/// Record the cooked-mode terminal state to put back on exit. Called by the
/// launcher after it switches the tty to raw mode.
pub fn register_terminal_restore(fd: i32, saved: libc::termios) {
    unsafe { *TERMINAL.saved.get() = saved };
    TERMINAL.fd.store(fd, Ordering::Relaxed);
    TERMINAL.armed.store(true, Ordering::Release);
}

/// Put the terminal back to cooked mode. Async-signal-safe, applies once.
pub fn restore_terminal() {
    if TERMINAL
        .armed
        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    let fd = TERMINAL.fd.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, TERMINAL.saved.get());
        }
    }
}

extern "C" fn on_quit_signal(_signum: libc::c_int) {
    QUIT.store(true, Ordering::Relaxed);
}

extern "C" fn on_fatal_signal(signum: libc::c_int) {
    // Nothing here may allocate, lock or log.
    restore_terminal();
    display::emergency_crtc_restore();
    unsafe {
        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
}

fn install_signal_handlers() {
    unsafe {
        let mut quit_action: libc::sigaction = std::mem::zeroed();
        quit_action.sa_sigaction = on_quit_signal as usize;
        libc::sigemptyset(&mut quit_action.sa_mask);
        for sig in [libc::SIGINT, libc::SIGTERM] {
            libc::sigaction(sig, &quit_action, std::ptr::null_mut());
        }

        let mut fatal_action: libc::sigaction = std::mem::zeroed();
        fatal_action.sa_sigaction = on_fatal_signal as usize;
        libc::sigemptyset(&mut fatal_action.sa_mask);
        for sig in [libc::SIGSEGV, libc::SIGBUS, libc::SIGABRT] {
            libc::sigaction(sig, &fatal_action, std::ptr::null_mut());
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Final per-stream and render-side statistics handed back to the launcher.
#[derive(Debug, Serialize)]
pub struct EngineReport {
    pub streams: Vec<StreamReport>,
    pub render: RenderStats,
}

#[derive(Debug, Serialize)]
pub struct StreamReport {
    pub name: String,
    pub backend: BackendReport,
    pub stats: StreamStats,
}

pub struct Engine {
    config: EngineConfig,
    input: Box<dyn InputSource>,
    overlay: Option<Box<dyn OverlayPass>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            input: Box::new(NullInput),
            overlay: None,
        }
    }

    /// Effective log level after the environment override.
    pub fn log_level(&self) -> LogLevel {
        LogLevel::resolve(self.config.log_level)
    }

    pub fn with_input(mut self, input: Box<dyn InputSource>) -> Self {
        self.input = input;
        self
    }

    pub fn with_overlay(mut self, overlay: Box<dyn OverlayPass>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Run to completion. Returns the final statistics on a clean quit.
    pub fn run(mut self) -> Result<EngineReport, EngineError> {
        let clock = Clock::new();
        self.config.validate()?;

        // Sources open before anything touches the display, so a bad path
        // leaves the console exactly as it was.
        let mut decoders = Vec::with_capacity(self.config.sources.len());
        for source in &self.config.sources {
            let decoder = MediaDecoder::open(
                source,
                self.config.prefer_hardware,
                self.config.max_decode_attempts,
            )?;
            let (width, height) = decoder.dimensions();
            self.config.check_dimensions(width, height)?;
            decoders.push(decoder);
        }

        let mut display = DisplaySurface::acquire()?;
        let (screen_w, screen_h) = display.mode_size();
        let gl = unsafe {
            GlContext::new(
                display.gbm_device_ptr(),
                display.gbm_surface_ptr(),
                screen_w,
                screen_h,
            )
        }?;

        install_signal_handlers();

        let budget = MemoryBudget::new(self.config.memory_limit_mb * 1024 * 1024);
        let cores = CoreAllocator::new();
        let mut streams = Vec::with_capacity(decoders.len());
        for (i, decoder) in decoders.into_iter().enumerate() {
            let name = format!("stream{i}");
            let (width, height) = decoder.dimensions();
            let report = decoder.report();
            let pool = Arc::new(FramePool::new(width, height, budget.clone())?);
            let metrics = Arc::new(Mutex::new(StreamMetrics::new()));
            let worker =
                DecodeWorker::spawn(&name, decoder, pool.clone(), &cores, metrics.clone());
            streams.push(StreamRuntime::new(name, pool, worker, metrics, report));
        }

        let mut keystone = KeystoneState::new(
            self.config.keystone_initial,
            self.config.keystone_step,
        );
        let mut render_metrics = RenderMetrics::new();

        let result = RenderLoop {
            display: &mut display,
            gl: &gl,
            streams: &mut streams,
            keystone: &mut keystone,
            input: self.input.as_mut(),
            overlay: self.overlay.as_deref_mut(),
            overlay_enabled: false,
            quit: &QUIT,
            metrics: &mut render_metrics,
            first_frame_deadline: Duration::from_millis(self.config.decode_timeout_ms),
        }
        .run();

        // Ordered teardown: workers first (decoders close with them), then
        // render-side slots and textures, pools with the streams, GL before
        // the display goes back to its owner.
        for stream in streams.iter_mut() {
            stream.worker.shutdown(WORKER_GRACE);
        }
        for stream in streams.iter_mut() {
            stream.release_render_state(&gl);
        }

        let report = EngineReport {
            streams: streams
                .iter()
                .map(|s| StreamReport {
                    name: s.name.clone(),
                    backend: s.report.clone(),
                    stats: s.metrics.lock().snapshot(),
                })
                .collect(),
            render: render_metrics.snapshot(),
        };
        log_report(&report);

        drop(streams);
        drop(gl);
        display.restore();
        drop(display);
        restore_terminal();
        tracing::info!(uptime_s = clock.now_us() / 1_000_000, "engine stopped");

        result.map(|()| report)
    }
}

fn log_report(report: &EngineReport) {
    for stream in &report.streams {
        tracing::info!(
            stream = %stream.name,
            backend = ?stream.backend.backend,
            decoded = stream.stats.frames_decoded,
            presented = stream.stats.frames_presented,
            repeated = stream.stats.frames_repeated,
            hw_failures = stream.stats.hw_failures,
            fallbacks = stream.stats.fallbacks,
            decode_p99_us = stream.stats.decode.p99_us,
            "stream summary"
        );
    }
    tracing::info!(
        render_mean_us = report.render.render.mean_us,
        present_p99_us = report.render.present_interval.p99_us,
        vsyncs_missed = report.render.vsyncs_missed,
        "render summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::decode::DecodeError;
    use crate::error::ExitCode;
    use std::path::PathBuf;

    #[test]
    fn invalid_config_fails_before_any_device_is_touched() {
        let engine = Engine::new(EngineConfig::default()); // no sources
        let err = engine.run().unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::NoSources)));
        assert_eq!(err.exit_code(), ExitCode::ConfigInvalid);
    }

    #[test]
    fn missing_source_fails_before_display_acquisition() {
        let config = EngineConfig {
            sources: vec![PathBuf::from("/definitely/not/here.mp4")],
            ..Default::default()
        };
        let err = Engine::new(config).run().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Decode(DecodeError::CannotOpen { .. })
        ));
        assert_eq!(err.exit_code(), ExitCode::ConfigInvalid);
    }

    #[test]
    fn quit_flag_is_sticky_and_shared() {
        quit_flag().store(false, Ordering::Relaxed);
        on_quit_signal(libc::SIGTERM);
        assert!(quit_flag().load(Ordering::Relaxed));
        quit_flag().store(false, Ordering::Relaxed);
    }

    #[test]
    fn terminal_restore_applies_once() {
        // Unarmed: nothing happens, repeatedly.
        restore_terminal();
        restore_terminal();
        // Armed with an invalid fd: consumed exactly once, no crash.
        let saved: libc::termios = unsafe { std::mem::zeroed() };
        register_terminal_restore(-1, saved);
        restore_terminal();
        assert!(!TERMINAL.armed.load(Ordering::Relaxed));
    }
}
