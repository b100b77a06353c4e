//! EGL + OpenGL ES 3.1 rendering on a GBM scan-out surface.
//!
//! No window system is involved: the EGL display is created straight on the
//! GBM device, the EGL surface on a GBM surface whose buffers the display
//! module turns into scan-out framebuffers. libEGL is loaded at runtime, so
//! the binary starts on boards with any vendor's GL stack.

mod context;
mod shader;
mod textures;

pub use context::GlContext;
pub use shader::{bt709, OVERLAY_FRAGMENT, OVERLAY_VERTEX, VIDEO_FRAGMENT, VIDEO_VERTEX};
pub use textures::PlaneTextures;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GlError {
    #[error("cannot load libEGL: {0}")]
    Load(String),
    #[error("no EGL display on the GBM device")]
    NoDisplay,
    #[error("EGL: {0}")]
    Egl(String),
    #[error("no EGL config supports a GLES 3 scan-out surface")]
    NoConfig,
    #[error("shader: {0}")]
    Shader(String),
    #[error("texture: {0}")]
    Texture(String),
}
