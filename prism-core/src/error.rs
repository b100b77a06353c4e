//! Engine-wide error taxonomy and process exit codes.
//!
//! Recoverable failures (a glitched hardware frame, a rejected overlay pass)
//! are handled where they occur and never surface here. What does surface is
//! terminal: bad configuration, a display we cannot acquire, or every stream
//! going dark.

use thiserror::Error;

use crate::config::ConfigError;
use crate::decode::DecodeError;
use crate::display::DisplayError;
use crate::gl::GlError;
use crate::pool::PoolError;

/// Terminal engine failure. Each variant maps onto a distinct exit code so
/// supervising init systems can tell the cases apart.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("display: {0}")]
    Display(#[from] DisplayError),

    #[error("gpu: {0}")]
    Gl(#[from] GlError),

    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("resource: {0}")]
    Resource(#[from] PoolError),

    #[error("all streams broken")]
    AllStreamsBroken,
}

/// Process exit codes. 0 is reserved for a clean quit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Clean = 0,
    ConfigInvalid = 2,
    DisplayFailed = 3,
    AllStreamsBroken = 4,
    FatalSignal = 5,
}

impl EngineError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            // A source that cannot be opened is a configuration problem, not
            // a decode problem: the display is never acquired in that case.
            EngineError::Config(_) | EngineError::Resource(_) => ExitCode::ConfigInvalid,
            EngineError::Decode(DecodeError::CannotOpen { .. })
            | EngineError::Decode(DecodeError::NoVideoTrack { .. })
            | EngineError::Decode(DecodeError::CodecUnsupported { .. }) => ExitCode::ConfigInvalid,
            EngineError::Display(_) | EngineError::Gl(_) => ExitCode::DisplayFailed,
            EngineError::Decode(_) | EngineError::AllStreamsBroken => ExitCode::AllStreamsBroken,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_failure_exits_as_config_invalid() {
        let err = EngineError::Decode(DecodeError::CannotOpen {
            source: "/no/such/file.mp4".into(),
            reason: "No such file or directory".into(),
        });
        assert_eq!(err.exit_code(), ExitCode::ConfigInvalid);
    }

    #[test]
    fn broken_streams_have_their_own_code() {
        assert_eq!(
            EngineError::AllStreamsBroken.exit_code(),
            ExitCode::AllStreamsBroken
        );
        assert_ne!(
            EngineError::AllStreamsBroken.exit_code() as i32,
            ExitCode::Clean as i32
        );
    }
}
