//! # prism-core
//!
//! Direct-to-display video playback engine for embedded ARM boards: one or
//! two H.264 streams decoded on dedicated cores, uploaded as YUV planes,
//! keystone-corrected in a GLES 3.1 pass and scanned out over KMS, locked to
//! display VSync. Runs on a bare TTY, owns the display pipe exclusively, and
//! puts it back exactly as found on every exit path.

// ============================================================================
// Timing & statistics
// ============================================================================
pub mod clock;

// ============================================================================
// Frame storage & movement
// ============================================================================
pub mod copy;
pub mod pool;

// ============================================================================
// Decoding
// ============================================================================
pub mod decode;
pub mod worker;

// ============================================================================
// Presentation
// ============================================================================
pub mod display;
pub mod gl;
pub mod keystone;
pub mod render;

// ============================================================================
// Lifecycle & plumbing
// ============================================================================
pub mod affinity;
pub mod config;
pub mod error;
pub mod input;
pub mod supervisor;

pub use config::EngineConfig;
pub use error::{EngineError, ExitCode};
pub use input::{InputEvent, InputSource};
pub use render::OverlayPass;
pub use supervisor::{Engine, EngineReport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
