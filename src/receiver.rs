//! Consuming endpoint.
//!
//! A `Receiver` binds to a remote publisher by name (and optionally by
//! application), copies its frames into a local render target every render
//! pass, and can mirror them into CPU memory. Connection failures are never
//! fatal: the receiver stays disconnected and tries again next frame.

use std::sync::Arc;

use image::RgbaImage;

use crate::backend::{ReceiveResource, TextureShareBackend};
use crate::context::{RenderContext, RenderTarget};
use crate::endpoint::{Endpoint, EndpointState, ListenerId, ListenerList};
use crate::error::ShareError;

/// Manager-assigned identity of a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReceiverId(pub(crate) u64);

/// How received pixels are exposed.
///
/// The mirror only exists after a successful receive with mirroring on, and
/// switching to `GpuOnly` drops it.
#[derive(Debug, Default)]
pub enum ImageBacking {
    #[default]
    GpuOnly,
    GpuWithCpuMirror(Option<RgbaImage>),
}

/// The image a receiver currently exposes.
#[derive(Debug, Clone, Copy)]
pub enum ReceivedImage<'a> {
    Gpu(&'a RenderTarget),
    Cpu(&'a RgbaImage),
}

impl ReceivedImage<'_> {
    pub fn size(&self) -> (u32, u32) {
        match self {
            ReceivedImage::Gpu(target) => target.size(),
            ReceivedImage::Cpu(image) => image.dimensions(),
        }
    }
}

/// Connection and frame notifications of a [`Receiver`].
pub trait ReceiverListener: Send {
    /// `is_connected()` flipped since the previous frame.
    fn connection_changed(&mut self, _receiver: &Receiver) {}

    /// A render pass finished, whether or not a frame arrived.
    fn texture_updated(&mut self, _receiver: &Receiver) {}
}

/// A named, consumed texture.
pub struct Receiver {
    id: ReceiverId,
    state: EndpointState,
    remote_app_name: String,
    backend: Arc<dyn TextureShareBackend>,
    resource: Option<Box<dyn ReceiveResource>>,
    connected: bool,
    target: Option<RenderTarget>,
    backing: ImageBacking,
    invert_vertical: bool,
    identity_changed: bool,
    listeners: ListenerList<dyn ReceiverListener>,
    frames_received: u64,
    connect_attempts: u64,
}

impl Receiver {
    pub(crate) fn new(
        id: ReceiverId,
        name: &str,
        app_name: &str,
        use_cpu_image: bool,
        backend: Arc<dyn TextureShareBackend>,
    ) -> Self {
        let backing = if use_cpu_image {
            ImageBacking::GpuWithCpuMirror(None)
        } else {
            ImageBacking::GpuOnly
        };

        Self {
            id,
            state: EndpointState::new(name, 0, 0, true),
            remote_app_name: app_name.to_string(),
            backend,
            resource: None,
            connected: false,
            target: None,
            backing,
            invert_vertical: false,
            identity_changed: false,
            listeners: ListenerList::default(),
            frames_received: 0,
            connect_attempts: 0,
        }
    }

    pub fn id(&self) -> ReceiverId {
        self.id
    }

    pub fn remote_app_name(&self) -> &str {
        &self.remote_app_name
    }

    /// True iff the most recent receive succeeded.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_inverted(&self) -> bool {
        self.invert_vertical
    }

    pub fn target(&self) -> Option<&RenderTarget> {
        self.target.as_ref()
    }

    pub fn backing(&self) -> &ImageBacking {
        &self.backing
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts
    }

    /// Point the receiver at another publisher. Rebinds on the next render pass.
    pub fn set_sharing_name(&mut self, name: &str, app_name: &str) {
        if self.state.name == name && self.remote_app_name == app_name {
            return;
        }
        self.state.name = name.to_string();
        self.remote_app_name = app_name.to_string();
        self.identity_changed = true;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.state.enabled = enabled;
    }

    pub fn set_invert_vertical(&mut self, invert: bool) {
        self.invert_vertical = invert;
    }

    pub fn uses_cpu_image(&self) -> bool {
        matches!(self.backing, ImageBacking::GpuWithCpuMirror(_))
    }

    /// Turning mirroring off drops the mirror immediately; turning it on
    /// allocates lazily on the next successful receive.
    pub fn set_use_cpu_image(&mut self, use_cpu_image: bool) {
        if self.uses_cpu_image() == use_cpu_image {
            return;
        }
        self.backing = if use_cpu_image {
            ImageBacking::GpuWithCpuMirror(None)
        } else {
            ImageBacking::GpuOnly
        };
    }

    /// The CPU mirror when mirroring, otherwise the GPU target.
    pub fn image(&self) -> Option<ReceivedImage<'_>> {
        match &self.backing {
            ImageBacking::GpuOnly => self.target.as_ref().map(ReceivedImage::Gpu),
            ImageBacking::GpuWithCpuMirror(mirror) => mirror.as_ref().map(ReceivedImage::Cpu),
        }
    }

    pub fn can_draw(&self, ctx: &dyn RenderContext) -> bool {
        ctx.is_active() && self.image().is_some()
    }

    pub fn add_listener(&mut self, listener: Box<dyn ReceiverListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Per-context setup: reallocate the local target when the size is known.
    pub fn init_gl(&mut self, ctx: &mut dyn RenderContext) {
        if !ctx.is_active() {
            tracing::warn!(receiver = %self.state.name, "Receiver: init_gl without an active context");
            return;
        }
        if self.target.is_none() {
            self.create_image_definition(ctx);
        }
    }

    /// Run one frame of the receiver state machine.
    pub fn render_gl(&mut self, ctx: &mut dyn RenderContext) {
        if !ctx.is_active() {
            tracing::warn!(receiver = %self.state.name, "Receiver: render_gl without an active context");
            return;
        }

        if !self.state.enabled {
            if self.state.initialized {
                self.release_resource();
                self.set_connected(false);
            }
            return;
        }

        if self.identity_changed {
            self.identity_changed = false;
            if self.state.initialized {
                tracing::info!(
                    "Receiver: rebinding to '{}' ({})",
                    self.state.name,
                    self.remote_app_name
                );
                self.release_resource();
                self.set_connected(false);
            }
        }

        if !self.state.initialized {
            self.create_receiver(ctx);
        } else {
            let success = self.receive_frame(ctx);
            self.set_connected(success);
            if success {
                self.frames_received += 1;
                self.refresh_mirror(ctx);
            }
        }

        self.notify(|listener, receiver| listener.texture_updated(receiver));
    }

    /// Drop the remote binding and the local target.
    pub fn clear_gl(&mut self, ctx: &mut dyn RenderContext) {
        self.release_resource();
        self.set_connected(false);
        if let Some(target) = self.target.take() {
            if ctx.is_active() {
                ctx.release_target(target);
            } else {
                tracing::warn!(receiver = %self.state.name, "Receiver: clear_gl without an active context, target abandoned");
            }
        }
    }

    pub(crate) fn release_resource(&mut self) {
        if let Some(mut resource) = self.resource.take() {
            resource.release();
            tracing::info!("Receiver '{}': released", self.state.name);
        }
        self.state.initialized = false;
    }

    /// Locate the publisher and size local resources after it.
    fn create_receiver(&mut self, ctx: &mut dyn RenderContext) {
        self.connect_attempts += 1;

        let Some(resource) = self
            .backend
            .discover_receivable(&self.state.name, &self.remote_app_name)
        else {
            if self.connect_attempts == 1 || self.connect_attempts % 300 == 0 {
                tracing::debug!(
                    "Receiver: could not find '{}' ({}), attempt {}",
                    self.state.name,
                    self.remote_app_name,
                    self.connect_attempts
                );
            }
            return;
        };

        if let Some((width, height)) = resource.remote_size() {
            self.state.width = width.max(1);
            self.state.height = height.max(1);
        }
        self.resource = Some(resource);
        self.state.initialized = true;

        tracing::info!(
            "Receiver: bound to '{}' ({}) at {}x{}",
            self.state.name,
            self.remote_app_name,
            self.state.width,
            self.state.height
        );

        self.create_image_definition(ctx);
    }

    /// (Re)allocate the local target at the current size.
    fn create_image_definition(&mut self, ctx: &mut dyn RenderContext) {
        if !self.state.has_size() {
            return;
        }
        if let Some(old) = self.target.take() {
            ctx.release_target(old);
        }

        match ctx.create_target(self.state.width, self.state.height) {
            Ok(target) => self.target = Some(target),
            Err(e) => tracing::warn!("Receiver '{}': could not create target: {}", self.state.name, e),
        }

        if let ImageBacking::GpuWithCpuMirror(mirror) = &mut self.backing {
            if mirror
                .as_ref()
                .is_some_and(|m| m.dimensions() != (self.state.width, self.state.height))
            {
                *mirror = None;
            }
        }
    }

    /// Adopt a new remote size. Returns true when local dimensions changed.
    fn adopt_remote_size(&mut self, size: Option<(u32, u32)>) -> bool {
        let Some((width, height)) = size else {
            return false;
        };
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.state.width, self.state.height) {
            return false;
        }

        tracing::info!(
            "Receiver '{}': remote resized {}x{} -> {}x{}",
            self.state.name,
            self.state.width,
            self.state.height,
            width,
            height
        );
        self.state.width = width;
        self.state.height = height;
        true
    }

    fn receive_frame(&mut self, ctx: &mut dyn RenderContext) -> bool {
        let remote = self.resource.as_ref().and_then(|r| r.remote_size());
        if self.adopt_remote_size(remote) || self.target.is_none() {
            self.create_image_definition(ctx);
        }

        let (Some(resource), Some(target)) = (self.resource.as_mut(), self.target.as_ref()) else {
            return false;
        };
        if !resource.receive_into(ctx, target, self.invert_vertical) {
            return false;
        }

        if resource.remote_size_changed() {
            let remote = resource.remote_size();
            if self.adopt_remote_size(remote) {
                self.create_image_definition(ctx);
            }
        }
        true
    }

    fn refresh_mirror(&mut self, ctx: &mut dyn RenderContext) {
        let ImageBacking::GpuWithCpuMirror(mirror) = &mut self.backing else {
            return;
        };
        let Some(target) = self.target.as_ref() else {
            return;
        };

        match ctx.read_pixels(target.texture()) {
            Ok(pixels) => *mirror = Some(pixels),
            Err(ShareError::ContextInactive) => {}
            Err(e) => tracing::debug!("Receiver '{}': mirror readback failed: {}", self.state.name, e),
        }
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        tracing::info!(
            "Receiver '{}': {}",
            self.state.name,
            if connected { "connected" } else { "disconnected" }
        );
        self.notify(|listener, receiver| listener.connection_changed(receiver));
    }

    fn notify(&mut self, mut event: impl FnMut(&mut dyn ReceiverListener, &Receiver)) {
        if self.listeners.len() == 0 {
            return;
        }
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in listeners.iter_mut() {
            event(listener, self);
        }
        self.listeners = listeners;
    }
}

impl Endpoint for Receiver {
    fn state(&self) -> &EndpointState {
        &self.state
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if let Some(mut resource) = self.resource.take() {
            resource.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LoopbackBackend, SendResource};
    use crate::context::SoftwareContext;
    use image::Rgba;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counts {
        connection: AtomicUsize,
        updates: AtomicUsize,
    }

    struct Recorder(Arc<Counts>);

    impl ReceiverListener for Recorder {
        fn connection_changed(&mut self, _receiver: &Receiver) {
            self.0.connection.fetch_add(1, Ordering::SeqCst);
        }

        fn texture_updated(&mut self, _receiver: &Receiver) {
            self.0.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn active_context() -> SoftwareContext {
        let mut ctx = SoftwareContext::new();
        ctx.make_current();
        ctx
    }

    fn receiver(backend: &LoopbackBackend, name: &str, app: &str) -> Receiver {
        Receiver::new(ReceiverId(1), name, app, false, Arc::new(backend.clone()))
    }

    fn publish(ctx: &mut SoftwareContext, sender: &mut dyn SendResource, w: u32, h: u32, color: [u8; 4]) {
        let texture = ctx.import_texture(RgbaImage::from_pixel(w, h, Rgba(color)));
        sender.publish(ctx, texture, w, h).unwrap();
    }

    #[test]
    fn test_missing_publisher_stays_disconnected() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut r = receiver(&backend, "Out", "App");
        let counts = Arc::new(Counts::default());
        r.add_listener(Box::new(Recorder(Arc::clone(&counts))));

        for _ in 0..5 {
            r.render_gl(&mut ctx);
        }

        assert!(!r.is_connected());
        assert!(!r.is_initialized());
        assert_eq!(r.connect_attempts(), 5);
        assert_eq!(counts.connection.load(Ordering::SeqCst), 0);
        assert_eq!(counts.updates.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_connects_and_receives_remote_size() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut sender = backend.create_send_resource();
        sender.create("Out", 5, 3).unwrap();
        publish(&mut ctx, sender.as_mut(), 5, 3, [10, 20, 30, 255]);

        let mut r = receiver(&backend, "Out", "App");
        r.render_gl(&mut ctx);
        assert!(r.is_initialized());
        assert!(!r.is_connected(), "binding frame does not receive");
        assert_eq!((r.width(), r.height()), (5, 3));

        r.render_gl(&mut ctx);
        assert!(r.is_connected());
        let texture = r.target().unwrap().texture();
        assert_eq!(ctx.surface(texture).unwrap().get_pixel(4, 2), &Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn test_connection_notified_only_on_change() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut sender = backend.create_send_resource();
        sender.create("Out", 2, 2).unwrap();
        publish(&mut ctx, sender.as_mut(), 2, 2, [1, 1, 1, 1]);

        let mut r = receiver(&backend, "Out", "");
        let counts = Arc::new(Counts::default());
        r.add_listener(Box::new(Recorder(Arc::clone(&counts))));

        for _ in 0..4 {
            r.render_gl(&mut ctx);
        }
        assert_eq!(counts.connection.load(Ordering::SeqCst), 1);

        sender.release();
        r.render_gl(&mut ctx);
        r.render_gl(&mut ctx);
        assert!(!r.is_connected());
        assert_eq!(counts.connection.load(Ordering::SeqCst), 2);
        assert_eq!(counts.updates.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_follows_remote_resize() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut sender = backend.create_send_resource();
        sender.create("Out", 2, 2).unwrap();
        publish(&mut ctx, sender.as_mut(), 2, 2, [1, 1, 1, 1]);

        let mut r = receiver(&backend, "Out", "App");
        r.render_gl(&mut ctx);
        r.render_gl(&mut ctx);
        assert!(r.is_connected());

        publish(&mut ctx, sender.as_mut(), 7, 4, [2, 2, 2, 2]);
        r.render_gl(&mut ctx);

        assert!(r.is_connected());
        assert_eq!((r.width(), r.height()), (7, 4));
        assert_eq!(r.target().map(|t| t.size()), Some((7, 4)));
    }

    #[test]
    fn test_cpu_mirror_lifecycle() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut sender = backend.create_send_resource();
        sender.create("Out", 2, 2).unwrap();
        publish(&mut ctx, sender.as_mut(), 2, 2, [4, 5, 6, 7]);

        let mut r = receiver(&backend, "Out", "App");
        r.set_use_cpu_image(true);
        assert!(r.image().is_none(), "mirror is allocated lazily");

        r.render_gl(&mut ctx);
        r.render_gl(&mut ctx);
        match r.image() {
            Some(ReceivedImage::Cpu(mirror)) => {
                assert_eq!(mirror.get_pixel(0, 0), &Rgba([4, 5, 6, 7]));
            }
            other => panic!("expected CPU mirror, got {:?}", other),
        }

        r.set_use_cpu_image(false);
        assert!(matches!(r.backing(), ImageBacking::GpuOnly));
        assert!(matches!(r.image(), Some(ReceivedImage::Gpu(_))));
    }

    #[test]
    fn test_disable_releases_binding() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut sender = backend.create_send_resource();
        sender.create("Out", 2, 2).unwrap();
        publish(&mut ctx, sender.as_mut(), 2, 2, [1, 1, 1, 1]);

        let mut r = receiver(&backend, "Out", "App");
        r.render_gl(&mut ctx);
        r.render_gl(&mut ctx);
        assert!(r.is_connected());

        r.set_enabled(false);
        r.render_gl(&mut ctx);
        assert!(!r.is_initialized());
        assert!(!r.is_connected());

        r.set_enabled(true);
        r.render_gl(&mut ctx);
        r.render_gl(&mut ctx);
        assert!(r.is_connected());
    }

    #[test]
    fn test_rebinds_after_rename() {
        let backend = LoopbackBackend::new("App");
        let mut ctx = active_context();
        let mut first = backend.create_send_resource();
        first.create("A", 2, 2).unwrap();
        publish(&mut ctx, first.as_mut(), 2, 2, [1, 0, 0, 255]);
        let mut second = backend.create_send_resource();
        second.create("B", 3, 3).unwrap();
        publish(&mut ctx, second.as_mut(), 3, 3, [0, 1, 0, 255]);

        let mut r = receiver(&backend, "A", "App");
        r.render_gl(&mut ctx);
        r.render_gl(&mut ctx);
        assert!(r.is_connected());

        r.set_sharing_name("B", "App");
        r.render_gl(&mut ctx);
        assert!(r.is_initialized());
        assert_eq!((r.width(), r.height()), (3, 3));

        r.render_gl(&mut ctx);
        assert!(r.is_connected());
    }

    #[test]
    fn test_invert_flag() {
        let backend = LoopbackBackend::new("App");
        let mut r = receiver(&backend, "Out", "App");
        assert!(!r.is_inverted());
        r.set_invert_vertical(true);
        assert!(r.is_inverted());
    }
}
