//! Rendering context abstraction.
//!
//! Every operation that creates, touches, or releases GPU surfaces receives a
//! `&mut dyn RenderContext`. The context decides whether it is current on the
//! calling thread; endpoints check [`RenderContext::is_active`] before doing
//! any GPU work and degrade to a logged no-op otherwise.
//!
//! Surfaces are referred to by [`TextureHandle`], an opaque id similar to a GL
//! texture name. The context owns the real GPU objects behind each handle.

mod gpu;
mod software;

use std::any::Any;
use std::fmt;

use image::RgbaImage;

use crate::error::Result;

pub use gpu::{check_importable, WgpuContext, SHARED_TEXTURE_FORMAT};
pub use software::SoftwareContext;

/// Opaque id of a texture owned by a [`RenderContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TextureHandle(pub u64);

impl fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A GPU surface (frame buffer + texture) owned by an endpoint.
///
/// Not `Clone`: a target is handed back to [`RenderContext::release_target`]
/// by value, so it can only be released once.
#[derive(Debug, PartialEq, Eq)]
pub struct RenderTarget {
    texture: TextureHandle,
    width: u32,
    height: u32,
}

impl RenderTarget {
    /// Wrap a texture allocated by a context implementation.
    pub fn new(texture: TextureHandle, width: u32, height: u32) -> Self {
        Self {
            texture,
            width,
            height,
        }
    }

    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Whether this target already has the requested dimensions.
    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

/// Axis-aligned drawing bounds in target pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Bounds {
    pub fn of(target: &RenderTarget) -> Self {
        Self {
            x: 0,
            y: 0,
            width: target.width(),
            height: target.height(),
        }
    }
}

/// A rendering context that may or may not be current on this thread.
pub trait RenderContext {
    /// True when GPU calls are legal right now.
    fn is_active(&self) -> bool;

    /// Allocate a surface. Zero-sized requests fail with `InvalidSize`.
    fn create_target(&mut self, width: u32, height: u32) -> Result<RenderTarget>;

    /// Free a surface allocated by this context.
    fn release_target(&mut self, target: RenderTarget);

    /// Clear a surface to transparent black.
    fn clear_target(&mut self, target: &RenderTarget) -> Result<()>;

    /// Copy a texture's pixels into CPU memory (RGBA8, top row first).
    fn read_pixels(&mut self, texture: TextureHandle) -> Result<RgbaImage>;

    /// Upload CPU pixels into a texture of identical size.
    fn write_pixels(&mut self, texture: TextureHandle, pixels: &RgbaImage) -> Result<()>;

    /// Downcast hook for draw listeners that need the concrete context.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
