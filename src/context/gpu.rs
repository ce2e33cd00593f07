//! wgpu-backed rendering context.
//!
//! Owns a device/queue pair and a table of textures keyed by
//! [`TextureHandle`]. The active flag is managed by the host through
//! [`WgpuContext::make_current`] / [`WgpuContext::done_current`], bracketing
//! the part of the frame where the sharing manager may touch GPU state.

use std::any::Any;
use std::collections::HashMap;

use image::RgbaImage;

use super::{RenderContext, RenderTarget, TextureHandle};
use crate::error::{Result, ShareError};

/// Format used for every shared surface.
pub const SHARED_TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

struct GpuSurface {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    usage: wgpu::TextureUsages,
}

impl GpuSurface {
    fn require(&self, usage: wgpu::TextureUsages, operation: &str) -> Result<()> {
        if self.usage.contains(usage) {
            Ok(())
        } else {
            Err(ShareError::UnsupportedTexture(format!("{} needs {:?}", operation, usage)))
        }
    }
}

/// Check that a foreign texture can be published: the readback path
/// expects 4-byte RGBA texels and copies out of the texture.
pub fn check_importable(format: wgpu::TextureFormat, usage: wgpu::TextureUsages) -> Result<()> {
    if format != SHARED_TEXTURE_FORMAT {
        return Err(ShareError::UnsupportedTexture(format!(
            "format {:?}, expected {:?}",
            format, SHARED_TEXTURE_FORMAT
        )));
    }
    if !usage.contains(wgpu::TextureUsages::COPY_SRC) {
        return Err(ShareError::UnsupportedTexture("missing COPY_SRC usage".to_string()));
    }
    Ok(())
}

/// Rendering context over a wgpu device.
pub struct WgpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    active: bool,
    next_handle: u64,
    surfaces: HashMap<TextureHandle, GpuSurface>,
}

impl WgpuContext {
    /// Wrap a device and queue created by the host application.
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            active: false,
            next_handle: 0,
            surfaces: HashMap::new(),
        }
    }

    /// Create a context on the default adapter without any window surface.
    pub async fn new_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| ShareError::Gpu("no suitable GPU adapter".to_string()))?;

        tracing::info!("Using GPU: {}", adapter.get_info().name);
        tracing::info!("Backend: {:?}", adapter.get_info().backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Shared Texture Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| ShareError::Gpu(e.to_string()))?;

        Ok(Self::from_parts(device, queue))
    }

    pub fn make_current(&mut self) {
        self.active = true;
    }

    pub fn done_current(&mut self) {
        self.active = false;
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The wgpu texture behind a handle, for draw listeners.
    pub fn texture(&self, handle: TextureHandle) -> Option<&wgpu::Texture> {
        self.surfaces.get(&handle).map(|s| &s.texture)
    }

    /// A render-attachment view of the texture behind a handle.
    pub fn view(&self, handle: TextureHandle) -> Option<&wgpu::TextureView> {
        self.surfaces.get(&handle).map(|s| &s.view)
    }

    /// Register a texture created elsewhere on this device, e.g. a sender's
    /// source texture. It must be [`SHARED_TEXTURE_FORMAT`] with `COPY_SRC`
    /// usage; clearing and writing also need `RENDER_ATTACHMENT` / `COPY_DST`.
    pub fn import_texture(&mut self, texture: wgpu::Texture) -> Result<TextureHandle> {
        check_importable(texture.format(), texture.usage())?;

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let size = texture.size();
        let usage = texture.usage();
        let handle = self.allocate_handle();
        self.surfaces.insert(
            handle,
            GpuSurface {
                texture,
                view,
                width: size.width,
                height: size.height,
                usage,
            },
        );
        Ok(handle)
    }

    fn allocate_handle(&mut self) -> TextureHandle {
        self.next_handle += 1;
        TextureHandle(self.next_handle)
    }

    fn surface(&self, handle: TextureHandle) -> Result<&GpuSurface> {
        if !self.active {
            return Err(ShareError::ContextInactive);
        }
        self.surfaces
            .get(&handle)
            .ok_or(ShareError::UnknownTexture(handle))
    }
}

impl RenderContext for WgpuContext {
    fn is_active(&self) -> bool {
        self.active
    }

    fn create_target(&mut self, width: u32, height: u32) -> Result<RenderTarget> {
        if !self.active {
            return Err(ShareError::ContextInactive);
        }
        if width == 0 || height == 0 {
            return Err(ShareError::InvalidSize { width, height });
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Shared Texture Target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: SHARED_TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let usage = texture.usage();

        let handle = self.allocate_handle();
        self.surfaces.insert(
            handle,
            GpuSurface {
                texture,
                view,
                width,
                height,
                usage,
            },
        );

        tracing::debug!(texture = %handle, width, height, "WgpuContext: created target");
        Ok(RenderTarget::new(handle, width, height))
    }

    fn release_target(&mut self, target: RenderTarget) {
        if !self.active {
            tracing::warn!(texture = %target.texture(), "WgpuContext: release without a current context");
        }
        if let Some(surface) = self.surfaces.remove(&target.texture()) {
            surface.texture.destroy();
        }
    }

    fn clear_target(&mut self, target: &RenderTarget) -> Result<()> {
        let surface = self.surface(target.texture())?;
        surface.require(wgpu::TextureUsages::RENDER_ATTACHMENT, "clear")?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Shared Texture Clear"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Shared Texture Clear Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &surface.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_pixels(&mut self, texture: TextureHandle) -> Result<RgbaImage> {
        let surface = self.surface(texture)?;
        surface.require(wgpu::TextureUsages::COPY_SRC, "readback")?;
        let (width, height) = (surface.width, surface.height);

        // Rows in the staging buffer are padded to the copy alignment.
        let unpadded_bytes_per_row = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(align) * align;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Shared Texture Readback"),
            size: (padded_bytes_per_row * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Shared Texture Readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &surface.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ShareError::Gpu(e.to_string())),
            Err(_) => return Err(ShareError::Gpu("readback callback dropped".to_string())),
        }

        let mut pixels = Vec::with_capacity((unpadded_bytes_per_row * height) as usize);
        {
            let data = slice.get_mapped_range();
            for row in 0..height {
                let start = (row * padded_bytes_per_row) as usize;
                let end = start + unpadded_bytes_per_row as usize;
                pixels.extend_from_slice(&data[start..end]);
            }
        }
        staging.unmap();

        RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| ShareError::Gpu("readback size mismatch".to_string()))
    }

    fn write_pixels(&mut self, texture: TextureHandle, pixels: &RgbaImage) -> Result<()> {
        let surface = self.surface(texture)?;
        surface.require(wgpu::TextureUsages::COPY_DST, "upload")?;
        let (width, height) = pixels.dimensions();
        if width != surface.width || height != surface.height {
            return Err(ShareError::InvalidSize { width, height });
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &surface.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels.as_raw(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
