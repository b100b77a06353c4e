//! Startup configuration.
//!
//! The launcher assembles an [`EngineConfig`] (from CLI flags, a config file,
//! whatever it likes) and hands it to the engine. The engine validates once at
//! start-up and treats the result as immutable for the life of the process.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that overrides the configured log level.
pub const LOG_LEVEL_ENV: &str = "PRISM_LOG_LEVEL";

/// Hard ceiling on concurrent streams. One CRTC, one composited framebuffer.
pub const MAX_STREAMS: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no sources given (need 1 or {MAX_STREAMS})")]
    NoSources,
    #[error("too many sources: {0} (max {MAX_STREAMS})")]
    TooManySources(usize),
    #[error("max video dimensions {width}x{height} are not decodable")]
    ImpossibleDimensions { width: u32, height: u32 },
    #[error("memory limit {limit_mb} MB cannot hold one {width}x{height} pool")]
    MemoryLimitTooSmall { limit_mb: u64, width: u32, height: u32 },
    #[error("source {width}x{height} exceeds configured maximum {max_width}x{max_height}")]
    SourceTooLarge {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
    #[error("keystone corner {0} is out of its adjustable range")]
    KeystoneCornerOutOfRange(usize),
}

/// Log verbosity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ERROR" => Some(Self::Error),
            "WARN" | "WARNING" => Some(Self::Warn),
            "INFO" => Some(Self::Info),
            "DEBUG" => Some(Self::Debug),
            "TRACE" => Some(Self::Trace),
            _ => None,
        }
    }

    /// Configured level, unless the environment says otherwise.
    pub fn resolve(configured: Self) -> Self {
        std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or(configured)
    }

    pub fn as_filter_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Four keystone corners in normalized screen coordinates, top-left origin,
/// ordered top-left, top-right, bottom-right, bottom-left.
pub type Corners = [[f32; 2]; 4];

/// The identity keystone: corners at the screen corners.
pub const IDENTITY_CORNERS: Corners = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 1 or 2 media paths/URIs.
    pub sources: Vec<PathBuf>,

    /// Attempt a hardware decoder before software.
    pub prefer_hardware: bool,

    /// Consecutive hardware decode failures tolerated before software fallback.
    pub max_decode_attempts: u32,

    /// Deadline for the first decoded frame of each stream, in milliseconds.
    pub decode_timeout_ms: u64,

    /// Soft ceiling for pool allocations, in megabytes.
    pub memory_limit_mb: u64,

    /// Streams above these native dimensions are rejected at open.
    pub max_video_width: u32,
    pub max_video_height: u32,

    pub log_level: LogLevel,

    /// Initial keystone corner positions.
    pub keystone_initial: Corners,

    /// Corner movement per nudge event, in normalized screen units.
    pub keystone_step: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            prefer_hardware: true,
            max_decode_attempts: 3,
            decode_timeout_ms: 5_000,
            memory_limit_mb: 512,
            max_video_width: 3840,
            max_video_height: 2160,
            log_level: LogLevel::Info,
            keystone_initial: IDENTITY_CORNERS,
            keystone_step: 1.0 / 512.0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if self.sources.len() > MAX_STREAMS {
            return Err(ConfigError::TooManySources(self.sources.len()));
        }
        if self.max_video_width < 16
            || self.max_video_height < 16
            || self.max_video_width > 8192
            || self.max_video_height > 8192
        {
            return Err(ConfigError::ImpossibleDimensions {
                width: self.max_video_width,
                height: self.max_video_height,
            });
        }
        // The ceiling must at least hold one worst-case pool.
        let worst = crate::pool::pool_bytes(self.max_video_width, self.max_video_height);
        if worst > self.memory_limit_mb * 1024 * 1024 {
            return Err(ConfigError::MemoryLimitTooSmall {
                limit_mb: self.memory_limit_mb,
                width: self.max_video_width,
                height: self.max_video_height,
            });
        }
        for (i, c) in self.keystone_initial.iter().enumerate() {
            if !crate::keystone::corner_in_range(i, *c) {
                return Err(ConfigError::KeystoneCornerOutOfRange(i));
            }
        }
        Ok(())
    }

    /// Check one stream's native dimensions against the configured maximum.
    pub fn check_dimensions(&self, width: u32, height: u32) -> Result<(), ConfigError> {
        if width > self.max_video_width || height > self.max_video_height {
            return Err(ConfigError::SourceTooLarge {
                width,
                height,
                max_width: self.max_video_width,
                max_height: self.max_video_height,
            });
        }
        Ok(())
    }
}
