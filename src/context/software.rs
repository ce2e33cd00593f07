//! CPU-backed rendering context.
//!
//! Surfaces are plain `RgbaImage`s. Useful headless and in tests, where it
//! also records how surfaces were released.

use std::any::Any;
use std::collections::HashMap;

use image::{Rgba, RgbaImage};

use super::{RenderContext, RenderTarget, TextureHandle};
use crate::error::{Result, ShareError};

/// Software render context with an explicit make-current protocol.
#[derive(Debug, Default)]
pub struct SoftwareContext {
    active: bool,
    next_handle: u64,
    surfaces: HashMap<TextureHandle, RgbaImage>,
    targets_created: u64,
    targets_released: u64,
    /// Releases attempted while the context was not current.
    inactive_releases: u64,
}

impl SoftwareContext {
    /// Create an inactive context.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_current(&mut self) {
        self.active = true;
    }

    pub fn done_current(&mut self) {
        self.active = false;
    }

    /// Number of surfaces currently allocated.
    pub fn live_targets(&self) -> usize {
        self.surfaces.len()
    }

    pub fn targets_created(&self) -> u64 {
        self.targets_created
    }

    pub fn targets_released(&self) -> u64 {
        self.targets_released
    }

    pub fn inactive_releases(&self) -> u64 {
        self.inactive_releases
    }

    pub fn surface(&self, texture: TextureHandle) -> Option<&RgbaImage> {
        self.surfaces.get(&texture)
    }

    pub fn surface_mut(&mut self, texture: TextureHandle) -> Option<&mut RgbaImage> {
        self.surfaces.get_mut(&texture)
    }

    /// Register an externally produced texture, e.g. a sender's source texture.
    pub fn import_texture(&mut self, pixels: RgbaImage) -> TextureHandle {
        let handle = self.allocate_handle();
        self.surfaces.insert(handle, pixels);
        handle
    }

    fn allocate_handle(&mut self) -> TextureHandle {
        self.next_handle += 1;
        TextureHandle(self.next_handle)
    }

    fn require_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(ShareError::ContextInactive)
        }
    }
}

impl RenderContext for SoftwareContext {
    fn is_active(&self) -> bool {
        self.active
    }

    fn create_target(&mut self, width: u32, height: u32) -> Result<RenderTarget> {
        self.require_active()?;
        if width == 0 || height == 0 {
            return Err(ShareError::InvalidSize { width, height });
        }

        let handle = self.allocate_handle();
        self.surfaces
            .insert(handle, RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0])));
        self.targets_created += 1;
        Ok(RenderTarget::new(handle, width, height))
    }

    fn release_target(&mut self, target: RenderTarget) {
        if !self.active {
            self.inactive_releases += 1;
            tracing::warn!(texture = %target.texture(), "SoftwareContext: release without a current context");
        }
        if self.surfaces.remove(&target.texture()).is_some() {
            self.targets_released += 1;
        }
    }

    fn clear_target(&mut self, target: &RenderTarget) -> Result<()> {
        self.require_active()?;
        let surface = self
            .surfaces
            .get_mut(&target.texture())
            .ok_or(ShareError::UnknownTexture(target.texture()))?;
        for pixel in surface.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
        Ok(())
    }

    fn read_pixels(&mut self, texture: TextureHandle) -> Result<RgbaImage> {
        self.require_active()?;
        self.surfaces
            .get(&texture)
            .cloned()
            .ok_or(ShareError::UnknownTexture(texture))
    }

    fn write_pixels(&mut self, texture: TextureHandle, pixels: &RgbaImage) -> Result<()> {
        self.require_active()?;
        let surface = self
            .surfaces
            .get_mut(&texture)
            .ok_or(ShareError::UnknownTexture(texture))?;
        if surface.dimensions() != pixels.dimensions() {
            let (width, height) = pixels.dimensions();
            return Err(ShareError::InvalidSize { width, height });
        }
        surface.copy_from_slice(pixels.as_raw());
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
