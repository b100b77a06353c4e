//! prism launcher: CLI parsing, logging, keyboard input, exit codes.
//!
//! Everything device-independent lives in `prism-core`; this binary only
//! assembles an `EngineConfig`, puts the controlling tty into raw mode so
//! keystrokes arrive unbuffered, and translates them into engine input
//! events.

use std::io::Read;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode as ProcessExit;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use prism_core::config::{Corners, LogLevel, IDENTITY_CORNERS};
use prism_core::supervisor;
use prism_core::{Engine, EngineConfig, InputEvent, InputSource};

#[derive(Parser, Debug)]
#[command(name = "prism", version, about = "Dual-stream keystone video player for KMS displays")]
struct Cli {
    /// One or two media paths/URIs.
    #[arg(required = true, num_args = 1..=2)]
    sources: Vec<PathBuf>,

    /// Decode in software even when a hardware decoder exists.
    #[arg(long)]
    software: bool,

    /// Consecutive hardware failures before software fallback.
    #[arg(long, default_value_t = 3)]
    max_decode_attempts: u32,

    /// First-frame decode deadline in milliseconds.
    #[arg(long, default_value_t = 5000)]
    decode_timeout_ms: u64,

    /// Pool memory ceiling in megabytes.
    #[arg(long, default_value_t = 512)]
    memory_limit_mb: u64,

    /// Reject streams wider than this.
    #[arg(long, default_value_t = 3840)]
    max_video_width: u32,

    /// Reject streams taller than this.
    #[arg(long, default_value_t = 2160)]
    max_video_height: u32,

    /// ERROR, WARN, INFO, DEBUG or TRACE.
    #[arg(long, default_value = "INFO")]
    log_level: String,

    /// Initial keystone corners as eight comma-separated values
    /// (x0,y0,x1,y1,x2,y2,x3,y3 in normalized screen coordinates).
    #[arg(long, value_parser = parse_corners)]
    keystone: Option<Corners>,
}

fn parse_corners(s: &str) -> Result<Corners, String> {
    let values: Vec<f32> = s
        .split(',')
        .map(|v| v.trim().parse::<f32>().map_err(|e| e.to_string()))
        .collect::<Result<_, _>>()?;
    if values.len() != 8 {
        return Err(format!("need 8 values, got {}", values.len()));
    }
    let mut corners = IDENTITY_CORNERS;
    for (i, corner) in corners.iter_mut().enumerate() {
        *corner = [values[i * 2], values[i * 2 + 1]];
    }
    Ok(corners)
}

fn main() -> ProcessExit {
    let cli = Cli::parse();

    let config = EngineConfig {
        sources: cli.sources,
        prefer_hardware: !cli.software,
        max_decode_attempts: cli.max_decode_attempts,
        decode_timeout_ms: cli.decode_timeout_ms,
        memory_limit_mb: cli.memory_limit_mb,
        max_video_width: cli.max_video_width,
        max_video_height: cli.max_video_height,
        log_level: LogLevel::parse(&cli.log_level).unwrap_or(LogLevel::Info),
        keystone_initial: cli.keystone.unwrap_or(IDENTITY_CORNERS),
        ..Default::default()
    };

    let engine = Engine::new(config);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!(
            "prism={}",
            engine.log_level().as_filter_str()
        )))
        .with_writer(std::io::stderr)
        .init();
    tracing::info!("prism {}", prism_core::VERSION);

    let input: Box<dyn InputSource> = match TtyInput::new() {
        Ok(tty) => Box::new(tty),
        Err(e) => {
            tracing::warn!("no interactive tty ({e}); keyboard control disabled");
            Box::new(prism_core::input::NullInput)
        }
    };

    match engine.with_input(input).run() {
        Ok(_report) => ProcessExit::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ProcessExit::from(e.exit_code() as u8)
        }
    }
}

// ============================================================================
// Raw-mode keyboard input
// ============================================================================

/// Non-blocking stdin reader on a raw-mode tty.
///
/// Keys: q / Esc quit, o toggles the overlay, 1-4 select a keystone corner,
/// arrows (or hjkl) nudge it, r resets the keystone.
struct TtyInput {
    stdin: std::io::Stdin,
    pending: std::collections::VecDeque<u8>,
}

impl TtyInput {
    fn new() -> anyhow::Result<Self> {
        let stdin = std::io::stdin();
        let fd = stdin.as_raw_fd();
        unsafe {
            if libc::isatty(fd) == 0 {
                anyhow::bail!("stdin is not a tty");
            }

            let mut saved: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut saved) != 0 {
                return Err(std::io::Error::last_os_error()).context("tcgetattr");
            }
            // The supervisor owns putting this back, on every exit path.
            supervisor::register_terminal_restore(fd, saved);

            let mut raw = saved;
            libc::cfmakeraw(&mut raw);
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;
            if libc::tcsetattr(fd, libc::TCSANOW, &raw) != 0 {
                return Err(std::io::Error::last_os_error()).context("tcsetattr");
            }

            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        Ok(Self {
            stdin,
            pending: std::collections::VecDeque::new(),
        })
    }

    fn refill(&mut self) {
        let mut buf = [0u8; 32];
        if let Ok(n) = self.stdin.read(&mut buf) {
            self.pending.extend(&buf[..n]);
        }
    }

    fn next_event(&mut self) -> Option<InputEvent> {
        loop {
            let byte = self.pending.pop_front()?;
            let event = match byte {
                b'q' | 3 => Some(InputEvent::Quit), // q or ctrl-c in raw mode
                0x1b => match self.escape_sequence() {
                    EscapeKey::Up => Some(InputEvent::NudgeCorner { dx: 0, dy: -1 }),
                    EscapeKey::Down => Some(InputEvent::NudgeCorner { dx: 0, dy: 1 }),
                    EscapeKey::Right => Some(InputEvent::NudgeCorner { dx: 1, dy: 0 }),
                    EscapeKey::Left => Some(InputEvent::NudgeCorner { dx: -1, dy: 0 }),
                    EscapeKey::Bare => Some(InputEvent::Quit),
                },
                b'o' => Some(InputEvent::ToggleOverlay),
                b'r' => Some(InputEvent::ResetKeystone),
                b'1'..=b'4' => Some(InputEvent::SelectCorner(byte - b'1')),
                b'h' => Some(InputEvent::NudgeCorner { dx: -1, dy: 0 }),
                b'l' => Some(InputEvent::NudgeCorner { dx: 1, dy: 0 }),
                b'k' => Some(InputEvent::NudgeCorner { dx: 0, dy: -1 }),
                b'j' => Some(InputEvent::NudgeCorner { dx: 0, dy: 1 }),
                _ => None,
            };
            if event.is_some() {
                return event;
            }
        }
    }

    fn escape_sequence(&mut self) -> EscapeKey {
        if self.pending.front() != Some(&b'[') {
            return EscapeKey::Bare;
        }
        self.pending.pop_front();
        match self.pending.pop_front() {
            Some(b'A') => EscapeKey::Up,
            Some(b'B') => EscapeKey::Down,
            Some(b'C') => EscapeKey::Right,
            Some(b'D') => EscapeKey::Left,
            _ => EscapeKey::Bare,
        }
    }
}

enum EscapeKey {
    Up,
    Down,
    Left,
    Right,
    Bare,
}

impl InputSource for TtyInput {
    fn poll(&mut self) -> Option<InputEvent> {
        if self.pending.is_empty() {
            self.refill();
        }
        self.next_event()
    }
}

impl Drop for TtyInput {
    fn drop(&mut self) {
        supervisor::restore_terminal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corners_parse_and_reject() {
        let corners = parse_corners("0,0, 1,0, 1,1, 0,1").unwrap();
        assert_eq!(corners, IDENTITY_CORNERS);
        assert!(parse_corners("1,2,3").is_err());
        assert!(parse_corners("a,b,c,d,e,f,g,h").is_err());
    }

    #[test]
    fn cli_defaults_match_engine_defaults() {
        let cli = Cli::parse_from(["prism", "/tmp/a.mp4"]);
        let defaults = EngineConfig::default();
        assert_eq!(cli.max_decode_attempts, defaults.max_decode_attempts);
        assert_eq!(cli.decode_timeout_ms, defaults.decode_timeout_ms);
        assert_eq!(cli.memory_limit_mb, defaults.memory_limit_mb);
        assert_eq!(cli.max_video_width, defaults.max_video_width);
        assert_eq!(cli.max_video_height, defaults.max_video_height);
        assert!(!cli.software);
    }

    #[test]
    fn two_sources_accepted_three_rejected() {
        assert!(Cli::try_parse_from(["prism", "a.mp4", "b.mp4"]).is_ok());
        assert!(Cli::try_parse_from(["prism", "a.mp4", "b.mp4", "c.mp4"]).is_err());
        assert!(Cli::try_parse_from(["prism"]).is_err());
    }
}
