//! Error types for texture sharing.
//!
//! None of these escape the per-frame lifecycle calls. Endpoints log them
//! and fold them into observable state (`initialized`, `connected`).

use crate::context::TextureHandle;

/// Errors raised by render contexts and sharing backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShareError {
    #[error("invalid surface size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("no rendering context is active")]
    ContextInactive,
    #[error("sharing name '{0}' is already published")]
    NameInUse(String),
    #[error("no shared resource named '{0}'")]
    NotFound(String),
    #[error("unknown texture handle {0}")]
    UnknownTexture(TextureHandle),
    #[error("texture cannot be shared: {0}")]
    UnsupportedTexture(String),
    #[error("GPU error: {0}")]
    Gpu(String),
}

pub type Result<T> = std::result::Result<T, ShareError>;
