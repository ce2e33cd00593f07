//! Publishing endpoint.
//!
//! A `Sender` owns a local render target that listeners draw into every
//! frame, then publishes it (or an externally supplied texture) through a
//! [`SendResource`]. Setters only record intent; every backend or GPU change
//! happens in [`Sender::render_gl`], under an active context.

use image::RgbaImage;

use crate::backend::SendResource;
use crate::context::{Bounds, RenderContext, RenderTarget, TextureHandle};
use crate::endpoint::{Endpoint, EndpointState, ListenerId, ListenerList};
use crate::error::{Result, ShareError};

/// Manager-assigned identity of a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SenderId(pub(crate) u64);

/// The surface handed to draw listeners.
pub struct DrawSurface<'a> {
    ctx: &'a mut dyn RenderContext,
    target: &'a RenderTarget,
}

impl<'a> DrawSurface<'a> {
    pub fn target(&self) -> &RenderTarget {
        self.target
    }

    /// Replace the target's contents with CPU pixels of the same size.
    pub fn write_image(&mut self, pixels: &RgbaImage) -> Result<()> {
        self.ctx.write_pixels(self.target.texture(), pixels)
    }

    /// The active context, for listeners that render with the GPU directly.
    pub fn context_mut(&mut self) -> &mut dyn RenderContext {
        &mut *self.ctx
    }
}

/// Receives the per-frame draw request of a [`Sender`].
pub trait SenderListener: Send {
    /// Rasterize this frame's content. The target is cleared beforehand.
    fn draw_shared_texture(&mut self, surface: &mut DrawSurface<'_>, bounds: Bounds);
}

/// A named, published texture.
pub struct Sender {
    id: SenderId,
    state: EndpointState,
    resource: Box<dyn SendResource>,
    target: Option<RenderTarget>,
    source_texture: Option<TextureHandle>,
    name_changed: bool,
    /// Size the backend resource was last created or updated at.
    published_size: Option<(u32, u32)>,
    listeners: ListenerList<dyn SenderListener>,
    frames_published: u64,
    last_error: Option<ShareError>,
}

impl Sender {
    pub(crate) fn new(
        id: SenderId,
        name: &str,
        width: u32,
        height: u32,
        enabled: bool,
        resource: Box<dyn SendResource>,
    ) -> Self {
        Self {
            id,
            state: EndpointState::new(name, width, height, enabled),
            resource,
            target: None,
            source_texture: None,
            name_changed: false,
            published_size: None,
            listeners: ListenerList::default(),
            frames_published: 0,
            last_error: None,
        }
    }

    pub fn id(&self) -> SenderId {
        self.id
    }

    /// Set the published dimensions. Takes effect on the next render pass.
    pub fn set_size(&mut self, width: u32, height: u32) {
        self.state.width = width;
        self.state.height = height;
    }

    /// Rename the shared resource. Takes effect on the next render pass.
    pub fn set_sharing_name(&mut self, name: &str) {
        if self.state.name == name {
            return;
        }
        self.state.name = name.to_string();
        self.name_changed = true;
    }

    /// Toggle publishing. Takes effect on the next render pass.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.state.enabled = enabled;
    }

    /// Publish an existing texture instead of drawing into the local target.
    pub fn set_source_texture(&mut self, texture: Option<TextureHandle>) {
        self.source_texture = texture;
    }

    pub fn source_texture(&self) -> Option<TextureHandle> {
        self.source_texture
    }

    /// Pending rename not yet applied to the backend.
    pub fn is_name_changed(&self) -> bool {
        self.name_changed
    }

    pub fn target(&self) -> Option<&RenderTarget> {
        self.target.as_ref()
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published
    }

    /// Most recent creation or publish failure, cleared on success.
    pub fn last_error(&self) -> Option<&ShareError> {
        self.last_error.as_ref()
    }

    pub fn add_listener(&mut self, listener: Box<dyn SenderListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// A context is current and there is a local target to draw into.
    pub fn can_draw(&self, ctx: &dyn RenderContext) -> bool {
        ctx.is_active() && self.target.is_some()
    }

    /// Per-context setup: allocate the local target ahead of the first frame.
    pub fn init_gl(&mut self, ctx: &mut dyn RenderContext) {
        if !ctx.is_active() {
            tracing::warn!(sender = %self.state.name, "Sender: init_gl without an active context");
            return;
        }
        if self.state.enabled && self.source_texture.is_none() && self.state.has_size() {
            self.ensure_target(ctx);
        }
    }

    /// Run one frame of the sender state machine.
    pub fn render_gl(&mut self, ctx: &mut dyn RenderContext) {
        if !ctx.is_active() {
            tracing::warn!(sender = %self.state.name, "Sender: render_gl without an active context");
            return;
        }

        if !self.state.enabled {
            if self.state.initialized {
                self.release_resource();
            }
            return;
        }

        if !self.state.has_size() {
            self.withdraw_unsized(ctx);
            return;
        }

        if !self.state.initialized {
            self.create_resource();
            if !self.state.initialized {
                return;
            }
        } else if self.name_changed {
            self.recreate_resource();
            if !self.state.initialized {
                return;
            }
        }
        self.sync_resource_size();

        let texture = match self.source_texture {
            Some(texture) => {
                if let Some(target) = self.target.take() {
                    ctx.release_target(target);
                }
                texture
            }
            None => {
                if !self.ensure_target(ctx) {
                    return;
                }
                match self.draw(ctx) {
                    Some(texture) => texture,
                    None => return,
                }
            }
        };

        let (width, height) = (self.state.width, self.state.height);
        match self.resource.publish(ctx, texture, width, height) {
            Ok(()) => {
                self.frames_published += 1;
                self.last_error = None;
                if self.frames_published == 1 || self.frames_published % 300 == 0 {
                    tracing::info!(
                        "Sender '{}': published {} frames ({}x{})",
                        self.state.name,
                        self.frames_published,
                        width,
                        height
                    );
                }
            }
            Err(e) => self.report(e, "publish failed"),
        }
    }

    /// Tear down the local target and the backend resource.
    pub fn clear_gl(&mut self, ctx: &mut dyn RenderContext) {
        if let Some(target) = self.target.take() {
            if ctx.is_active() {
                ctx.release_target(target);
            } else {
                tracing::warn!(sender = %self.state.name, "Sender: clear_gl without an active context, target abandoned");
            }
        }
        self.release_resource();
    }

    /// Release the backend resource only. Used when no context is current.
    pub(crate) fn release_resource(&mut self) {
        self.resource.release();
        if self.state.initialized {
            tracing::info!("Sender '{}': released", self.state.name);
        }
        self.state.initialized = false;
        self.published_size = None;
    }

    fn create_resource(&mut self) {
        let (width, height) = (self.state.width, self.state.height);
        match self.resource.create(&self.state.name, width, height) {
            Ok(()) => {
                self.state.initialized = true;
                self.published_size = Some((width, height));
                self.name_changed = false;
                self.last_error = None;
                tracing::info!("Sender '{}': created ({}x{})", self.state.name, width, height);
            }
            Err(e) => self.report(e, "could not create shared resource, retrying next frame"),
        }
    }

    fn recreate_resource(&mut self) {
        tracing::info!("Sender: renaming to '{}'", self.state.name);
        self.resource.release();
        self.state.initialized = false;
        self.create_resource();
    }

    /// Width or height dropped to zero: stop advertising the old size and
    /// free the target until a valid size arrives.
    fn withdraw_unsized(&mut self, ctx: &mut dyn RenderContext) {
        if self.state.initialized {
            self.release_resource();
        }
        if let Some(target) = self.target.take() {
            ctx.release_target(target);
        }
        let (width, height) = (self.state.width, self.state.height);
        self.report(ShareError::InvalidSize { width, height }, "nothing to publish");
    }

    /// Push a size change to the backend resource.
    fn sync_resource_size(&mut self) {
        let size = (self.state.width, self.state.height);
        if self.published_size == Some(size) {
            return;
        }
        match self.resource.update(&self.state.name, size.0, size.1) {
            Ok(()) => self.published_size = Some(size),
            Err(e) => self.report(e, "could not resize shared resource"),
        }
    }

    /// Make sure the local target exists at the current size.
    fn ensure_target(&mut self, ctx: &mut dyn RenderContext) -> bool {
        let (width, height) = (self.state.width, self.state.height);
        if self.target.as_ref().is_some_and(|t| t.matches(width, height)) {
            return true;
        }

        if let Some(old) = self.target.take() {
            ctx.release_target(old);
        }

        match ctx.create_target(width, height) {
            Ok(target) => {
                self.target = Some(target);
                true
            }
            Err(e) => {
                self.report(e, "problem creating image");
                false
            }
        }
    }

    /// Clear the target and let listeners draw into it.
    fn draw(&mut self, ctx: &mut dyn RenderContext) -> Option<TextureHandle> {
        let target = self.target.as_ref()?;
        if let Err(e) = ctx.clear_target(target) {
            self.report(e, "could not clear target");
            return None;
        }

        let bounds = Bounds::of(target);
        for listener in self.listeners.iter_mut() {
            let mut surface = DrawSurface {
                ctx: &mut *ctx,
                target,
            };
            listener.draw_shared_texture(&mut surface, bounds);
        }
        Some(target.texture())
    }

    /// Log a failure once per distinct error.
    fn report(&mut self, error: ShareError, what: &str) {
        if self.last_error.as_ref() != Some(&error) {
            tracing::warn!("Sender '{}': {}: {}", self.state.name, what, error);
        } else {
            tracing::debug!("Sender '{}': {}: {}", self.state.name, what, error);
        }
        self.last_error = Some(error);
    }
}

impl Endpoint for Sender {
    fn state(&self) -> &EndpointState {
        &self.state
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.resource.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LoopbackBackend, TextureShareBackend};
    use crate::context::SoftwareContext;
    use image::Rgba;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sender(backend: &LoopbackBackend, name: &str, width: u32, height: u32) -> Sender {
        Sender::new(SenderId(1), name, width, height, true, backend.create_send_resource())
    }

    fn active_context() -> SoftwareContext {
        let mut ctx = SoftwareContext::new();
        ctx.make_current();
        ctx
    }

    struct Fill {
        color: [u8; 4],
        calls: Arc<AtomicUsize>,
    }

    impl SenderListener for Fill {
        fn draw_shared_texture(&mut self, surface: &mut DrawSurface<'_>, bounds: Bounds) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let pixels = RgbaImage::from_pixel(bounds.width, bounds.height, Rgba(self.color));
            surface.write_image(&pixels).unwrap();
        }
    }

    #[test]
    fn test_render_creates_and_publishes() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut s = sender(&backend, "Out", 8, 4);

        s.render_gl(&mut ctx);

        assert!(s.is_initialized());
        assert_eq!(s.target().map(|t| t.size()), Some((8, 4)));
        assert_eq!(s.frames_published(), 1);
        assert!(backend.is_published("Out"));
    }

    #[test]
    fn test_draw_listener_called_each_frame() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut s = sender(&backend, "Out", 2, 2);
        let calls = Arc::new(AtomicUsize::new(0));
        s.add_listener(Box::new(Fill {
            color: [9, 8, 7, 255],
            calls: Arc::clone(&calls),
        }));

        s.render_gl(&mut ctx);
        s.render_gl(&mut ctx);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let texture = s.target().unwrap().texture();
        assert_eq!(ctx.surface(texture).unwrap().get_pixel(1, 1), &Rgba([9, 8, 7, 255]));
    }

    #[test]
    fn test_disable_releases_resource() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut s = sender(&backend, "Out", 2, 2);
        s.render_gl(&mut ctx);
        assert!(s.is_initialized());

        s.set_enabled(false);
        assert!(s.is_initialized(), "setter must not touch the backend");
        s.render_gl(&mut ctx);

        assert!(!s.is_initialized());
        assert!(!backend.is_published("Out"));
    }

    #[test]
    fn test_zero_size_retries_until_sized() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut s = sender(&backend, "Out", 0, 0);

        s.render_gl(&mut ctx);
        s.render_gl(&mut ctx);
        assert!(!s.is_initialized());
        assert!(matches!(s.last_error(), Some(ShareError::InvalidSize { .. })));

        s.set_size(4, 4);
        s.render_gl(&mut ctx);
        assert!(s.is_initialized());
        assert!(s.last_error().is_none());
    }

    #[test]
    fn test_rename_recreates_under_new_name() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut s = sender(&backend, "A", 4, 4);
        s.render_gl(&mut ctx);

        s.set_sharing_name("B");
        assert!(s.is_name_changed());
        assert!(backend.is_published("A"), "rename is deferred to the render pass");

        s.render_gl(&mut ctx);
        assert!(!s.is_name_changed());
        assert!(!backend.is_published("A"));
        assert!(backend.is_published("B"));
        assert_eq!(s.target().map(|t| t.size()), Some((4, 4)));
    }

    #[test]
    fn test_same_name_is_noop() {
        let backend = LoopbackBackend::new("App");
        let mut s = sender(&backend, "A", 4, 4);
        s.set_sharing_name("A");
        assert!(!s.is_name_changed());
    }

    #[test]
    fn test_resize_recreates_target() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut s = sender(&backend, "Out", 4, 4);
        s.render_gl(&mut ctx);

        s.set_size(6, 3);
        assert_eq!(s.target().map(|t| t.size()), Some((4, 4)));
        s.render_gl(&mut ctx);

        assert_eq!(s.target().map(|t| t.size()), Some((6, 3)));
        assert_eq!(ctx.live_targets(), 1);
        let publishers = backend.list_publishers();
        assert_eq!(publishers.len(), 1);
    }

    #[test]
    fn test_source_texture_published_directly() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let source = ctx.import_texture(RgbaImage::from_pixel(3, 3, Rgba([1, 1, 1, 1])));

        let mut s = sender(&backend, "Out", 3, 3);
        s.set_source_texture(Some(source));
        let calls = Arc::new(AtomicUsize::new(0));
        s.add_listener(Box::new(Fill {
            color: [0, 0, 0, 0],
            calls: Arc::clone(&calls),
        }));
        s.render_gl(&mut ctx);

        assert!(s.target().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(s.frames_published(), 1);
    }

    #[test]
    fn test_inactive_context_is_noop() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = SoftwareContext::new();
        let mut s = sender(&backend, "Out", 4, 4);

        s.render_gl(&mut ctx);
        assert!(!s.is_initialized());
        assert!(!backend.is_published("Out"));
    }

    #[test]
    fn test_clear_gl_releases_everything() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut s = sender(&backend, "Out", 4, 4);
        s.render_gl(&mut ctx);

        s.clear_gl(&mut ctx);
        assert!(!s.is_initialized());
        assert!(s.target().is_none());
        assert_eq!(ctx.live_targets(), 0);
        assert!(!backend.is_published("Out"));
    }

    /// Send resource that only counts backend calls.
    #[derive(Default)]
    struct CallCounts {
        creates: AtomicUsize,
        updates: AtomicUsize,
    }

    struct CountingResource(Arc<CallCounts>);

    impl SendResource for CountingResource {
        fn create(&mut self, _name: &str, _width: u32, _height: u32) -> Result<()> {
            self.0.creates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn update(&mut self, _name: &str, _width: u32, _height: u32) -> Result<()> {
            self.0.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn rename(&mut self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn release(&mut self) {}

        fn publish(
            &mut self,
            _ctx: &mut dyn RenderContext,
            _texture: TextureHandle,
            _width: u32,
            _height: u32,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_update_only_on_size_change() {
        let counts = Arc::new(CallCounts::default());
        let mut ctx = active_context();
        let mut s = Sender::new(
            SenderId(1),
            "Out",
            4,
            4,
            true,
            Box::new(CountingResource(Arc::clone(&counts))),
        );

        s.render_gl(&mut ctx);
        s.render_gl(&mut ctx);
        assert_eq!(counts.creates.load(Ordering::SeqCst), 1);
        assert_eq!(counts.updates.load(Ordering::SeqCst), 0);

        s.set_size(6, 3);
        s.render_gl(&mut ctx);
        s.render_gl(&mut ctx);
        assert_eq!(counts.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_size_withdraws_publisher() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut s = sender(&backend, "Out", 4, 4);
        s.render_gl(&mut ctx);
        assert!(backend.is_published("Out"));

        s.set_size(0, 0);
        s.render_gl(&mut ctx);
        assert!(!s.is_initialized());
        assert!(s.target().is_none());
        assert!(!backend.is_published("Out"));
        assert_eq!(ctx.live_targets(), 0);
        assert_eq!(ctx.inactive_releases(), 0);
        assert!(matches!(s.last_error(), Some(ShareError::InvalidSize { .. })));

        s.set_size(4, 4);
        s.render_gl(&mut ctx);
        assert!(s.is_initialized());
        assert!(backend.is_published("Out"));
        assert_eq!(s.frames_published(), 2);
    }
}
