//! Shared texture manager - sequences endpoint lifecycles in the render loop
//!
//! The manager owns every [`Sender`] and [`Receiver`]. The host calls
//! [`SharedTextureManager::init_gl`] once per context, `render_gl` once per
//! frame and `clear_gl` at shutdown or context loss, always on the thread that
//! owns the context.
//!
//! Removal is two-phase: a removal requested while no context is current is
//! queued and completed at the start of the next `render_gl` / `clear_gl`,
//! so GPU surfaces are never released without a current context.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::backend::{PublisherInfo, TextureShareBackend};
use crate::context::RenderContext;
use crate::endpoint::{ListenerId, ListenerList};
use crate::receiver::{Receiver, ReceiverId};
use crate::sender::{Sender, SenderId};
use crate::settings::SharingSettings;

/// Lifecycle notifications of a [`SharedTextureManager`].
pub trait ManagerListener: Send {
    fn context_initialized(&mut self) {}
    fn sender_removed(&mut self, _sender: &Sender) {}
    fn receiver_removed(&mut self, _receiver: &Receiver) {}
}

/// Outcome of a removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Unlinked and released now.
    Destroyed,
    /// Queued until the next context-bound pass.
    Deferred,
    /// Unknown id, already destroyed.
    NotFound,
}

/// Owns all senders and receivers of one application.
pub struct SharedTextureManager {
    backend: Arc<dyn TextureShareBackend>,
    senders: Vec<Sender>,
    receivers: Vec<Receiver>,
    pending_sender_removals: BTreeSet<SenderId>,
    pending_receiver_removals: BTreeSet<ReceiverId>,
    next_id: u64,
    /// Mirroring mode given to new receivers
    use_cpu_image: bool,
    listeners: ListenerList<dyn ManagerListener>,
}

impl SharedTextureManager {
    pub fn new(backend: Arc<dyn TextureShareBackend>) -> Self {
        tracing::info!("SharedTextureManager: using {} backend", backend.technology_name());
        Self {
            backend,
            senders: Vec::new(),
            receivers: Vec::new(),
            pending_sender_removals: BTreeSet::new(),
            pending_receiver_removals: BTreeSet::new(),
            next_id: 0,
            use_cpu_image: false,
            listeners: ListenerList::default(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn TextureShareBackend> {
        &self.backend
    }

    /// Default mirroring mode for receivers added from now on.
    pub fn set_default_use_cpu_image(&mut self, use_cpu_image: bool) {
        self.use_cpu_image = use_cpu_image;
    }

    pub fn add_listener(&mut self, listener: Box<dyn ManagerListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    // ========== Endpoint creation and access ==========

    pub fn add_sender(&mut self, name: &str, width: u32, height: u32, enabled: bool) -> SenderId {
        let id = SenderId(self.allocate_id());
        let resource = self.backend.create_send_resource();
        self.senders
            .push(Sender::new(id, name, width, height, enabled, resource));
        tracing::debug!("SharedTextureManager: added sender '{}'", name);
        id
    }

    pub fn add_receiver(&mut self, name: &str, app_name: &str) -> ReceiverId {
        let id = ReceiverId(self.allocate_id());
        self.receivers.push(Receiver::new(
            id,
            name,
            app_name,
            self.use_cpu_image,
            Arc::clone(&self.backend),
        ));
        tracing::debug!("SharedTextureManager: added receiver '{}' ({})", name, app_name);
        id
    }

    pub fn sender(&self, id: SenderId) -> Option<&Sender> {
        self.senders.iter().find(|s| s.id() == id)
    }

    pub fn sender_mut(&mut self, id: SenderId) -> Option<&mut Sender> {
        self.senders.iter_mut().find(|s| s.id() == id)
    }

    pub fn receiver(&self, id: ReceiverId) -> Option<&Receiver> {
        self.receivers.iter().find(|r| r.id() == id)
    }

    pub fn receiver_mut(&mut self, id: ReceiverId) -> Option<&mut Receiver> {
        self.receivers.iter_mut().find(|r| r.id() == id)
    }

    pub fn senders(&self) -> impl Iterator<Item = &Sender> {
        self.senders.iter()
    }

    pub fn receivers(&self) -> impl Iterator<Item = &Receiver> {
        self.receivers.iter()
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_sender_pending_removal(&self, id: SenderId) -> bool {
        self.pending_sender_removals.contains(&id)
    }

    pub fn is_receiver_pending_removal(&self, id: ReceiverId) -> bool {
        self.pending_receiver_removals.contains(&id)
    }

    /// Create the endpoints listed in `settings`.
    pub fn apply_settings(&mut self, settings: &SharingSettings) -> (Vec<SenderId>, Vec<ReceiverId>) {
        self.use_cpu_image = settings.use_cpu_image;

        let senders = settings
            .senders
            .iter()
            .map(|s| self.add_sender(&s.name, s.width, s.height, s.enabled))
            .collect();

        let mut receivers = Vec::with_capacity(settings.receivers.len());
        for config in &settings.receivers {
            let id = self.add_receiver(&config.name, &config.app_name);
            if let Some(receiver) = self.receiver_mut(id) {
                receiver.set_enabled(config.enabled);
                receiver.set_invert_vertical(settings.invert_receivers);
                if let Some(use_cpu_image) = config.use_cpu_image {
                    receiver.set_use_cpu_image(use_cpu_image);
                }
            }
            receivers.push(id);
        }

        (senders, receivers)
    }

    // ========== Removal ==========

    /// Destroy a sender now when forced or a context is current, otherwise
    /// queue it for the next render or clear pass.
    pub fn remove_sender(&mut self, id: SenderId, force: bool, ctx: &mut dyn RenderContext) -> Removal {
        if self.sender(id).is_none() {
            return Removal::NotFound;
        }
        if !force && !ctx.is_active() {
            if self.pending_sender_removals.insert(id) {
                tracing::debug!("SharedTextureManager: sender removal deferred");
            }
            return Removal::Deferred;
        }
        self.destroy_sender(id, ctx);
        Removal::Destroyed
    }

    /// Receiver counterpart of [`remove_sender`](Self::remove_sender).
    pub fn remove_receiver(
        &mut self,
        id: ReceiverId,
        force: bool,
        ctx: &mut dyn RenderContext,
    ) -> Removal {
        if self.receiver(id).is_none() {
            return Removal::NotFound;
        }
        if !force && !ctx.is_active() {
            if self.pending_receiver_removals.insert(id) {
                tracing::debug!("SharedTextureManager: receiver removal deferred");
            }
            return Removal::Deferred;
        }
        self.destroy_receiver(id, ctx);
        Removal::Destroyed
    }

    fn destroy_sender(&mut self, id: SenderId, ctx: &mut dyn RenderContext) {
        self.pending_sender_removals.remove(&id);
        let Some(index) = self.senders.iter().position(|s| s.id() == id) else {
            return;
        };

        let mut sender = self.senders.remove(index);
        if ctx.is_active() {
            sender.clear_gl(ctx);
        } else {
            // Forced without a context: the surface stays with the context.
            sender.release_resource();
        }

        for listener in self.listeners.iter_mut() {
            listener.sender_removed(&sender);
        }
        tracing::debug!("SharedTextureManager: sender removed");
    }

    fn destroy_receiver(&mut self, id: ReceiverId, ctx: &mut dyn RenderContext) {
        self.pending_receiver_removals.remove(&id);
        let Some(index) = self.receivers.iter().position(|r| r.id() == id) else {
            return;
        };

        let mut receiver = self.receivers.remove(index);
        if ctx.is_active() {
            receiver.clear_gl(ctx);
        } else {
            receiver.release_resource();
        }

        for listener in self.listeners.iter_mut() {
            listener.receiver_removed(&receiver);
        }
        tracing::debug!("SharedTextureManager: receiver removed");
    }

    /// Complete queued removals. Only called from context-bound passes.
    fn flush_removals(&mut self, ctx: &mut dyn RenderContext) {
        for id in std::mem::take(&mut self.pending_sender_removals) {
            self.destroy_sender(id, ctx);
        }
        for id in std::mem::take(&mut self.pending_receiver_removals) {
            self.destroy_receiver(id, ctx);
        }
    }

    // ========== Context-bound lifecycle ==========

    /// One-time setup after a context becomes available.
    pub fn init_gl(&mut self, ctx: &mut dyn RenderContext) {
        if !ctx.is_active() {
            tracing::warn!("SharedTextureManager: init_gl without an active context");
            return;
        }

        for sender in &mut self.senders {
            sender.init_gl(ctx);
        }
        for receiver in &mut self.receivers {
            receiver.init_gl(ctx);
        }

        for listener in self.listeners.iter_mut() {
            listener.context_initialized();
        }
    }

    /// Per-frame pass: queued removals, then senders, then receivers.
    pub fn render_gl(&mut self, ctx: &mut dyn RenderContext) {
        if !ctx.is_active() {
            tracing::warn!("SharedTextureManager: render_gl without an active context");
            return;
        }

        self.flush_removals(ctx);

        // Senders first so same-process receivers see this frame.
        for sender in &mut self.senders {
            sender.render_gl(ctx);
        }
        for receiver in &mut self.receivers {
            receiver.render_gl(ctx);
        }
    }

    /// Tear everything down, at shutdown or before the context goes away.
    pub fn clear_gl(&mut self, ctx: &mut dyn RenderContext) {
        if !ctx.is_active() {
            tracing::warn!("SharedTextureManager: clear_gl without an active context");
            return;
        }

        self.flush_removals(ctx);

        for sender in &mut self.senders {
            sender.clear_gl(ctx);
        }
        for receiver in &mut self.receivers {
            receiver.clear_gl(ctx);
        }

        while let Some(id) = self.senders.first().map(Sender::id) {
            self.destroy_sender(id, ctx);
        }
        while let Some(id) = self.receivers.first().map(Receiver::id) {
            self.destroy_receiver(id, ctx);
        }
    }

    // ========== Discovery ==========

    /// Publishers visible through the backend, as "name - app" strings.
    pub fn available_senders(&self) -> Vec<String> {
        self.available_publishers()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub fn available_publishers(&self) -> Vec<PublisherInfo> {
        self.backend.list_publishers()
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl Drop for SharedTextureManager {
    fn drop(&mut self) {
        // No context is guaranteed here, so only backend resources are released.
        for mut sender in std::mem::take(&mut self.senders) {
            sender.release_resource();
            for listener in self.listeners.iter_mut() {
                listener.sender_removed(&sender);
            }
        }
        for mut receiver in std::mem::take(&mut self.receivers) {
            receiver.release_resource();
            for listener in self.listeners.iter_mut() {
                listener.receiver_removed(&receiver);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LoopbackBackend;
    use crate::context::SoftwareContext;
    use crate::endpoint::Endpoint;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Events {
        initialized: AtomicUsize,
        senders_removed: AtomicUsize,
        receivers_removed: AtomicUsize,
    }

    struct Recorder(Arc<Events>);

    impl ManagerListener for Recorder {
        fn context_initialized(&mut self) {
            self.0.initialized.fetch_add(1, Ordering::SeqCst);
        }

        fn sender_removed(&mut self, _sender: &Sender) {
            self.0.senders_removed.fetch_add(1, Ordering::SeqCst);
        }

        fn receiver_removed(&mut self, _receiver: &Receiver) {
            self.0.receivers_removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager() -> (SharedTextureManager, LoopbackBackend) {
        let backend = LoopbackBackend::new("App");
        (SharedTextureManager::new(Arc::new(backend.clone())), backend)
    }

    #[test]
    fn test_manager_new() {
        let (manager, _) = manager();
        assert_eq!(manager.sender_count(), 0);
        assert_eq!(manager.receiver_count(), 0);
        assert_eq!(manager.listener_count(), 0);
        assert!(manager.available_senders().is_empty());
    }

    #[test]
    fn test_remove_with_active_context_is_immediate() {
        let (mut manager, backend) = manager();
        let events = Arc::new(Events::default());
        manager.add_listener(Box::new(Recorder(Arc::clone(&events))));

        let mut ctx = SoftwareContext::new();
        ctx.make_current();
        let id = manager.add_sender("Out", 4, 4, true);
        manager.render_gl(&mut ctx);
        assert!(backend.is_published("Out"));

        assert_eq!(manager.remove_sender(id, false, &mut ctx), Removal::Destroyed);
        assert!(manager.sender(id).is_none());
        assert!(!backend.is_published("Out"));
        assert_eq!(ctx.live_targets(), 0);
        assert_eq!(events.senders_removed.load(Ordering::SeqCst), 1);

        assert_eq!(manager.remove_sender(id, false, &mut ctx), Removal::NotFound);
        assert_eq!(events.senders_removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_without_context_is_deferred() {
        let (mut manager, backend) = manager();
        let mut ctx = SoftwareContext::new();
        ctx.make_current();
        let id = manager.add_sender("Out", 4, 4, true);
        manager.render_gl(&mut ctx);

        ctx.done_current();
        assert_eq!(manager.remove_sender(id, false, &mut ctx), Removal::Deferred);
        assert_eq!(manager.remove_sender(id, false, &mut ctx), Removal::Deferred);
        assert!(manager.sender(id).is_some());
        assert!(manager.is_sender_pending_removal(id));
        assert!(backend.is_published("Out"));

        ctx.make_current();
        manager.render_gl(&mut ctx);
        assert!(manager.sender(id).is_none());
        assert!(!manager.is_sender_pending_removal(id));
        assert!(manager.available_senders().is_empty());
        assert_eq!(ctx.inactive_releases(), 0);
        assert_eq!(ctx.live_targets(), 0);
    }

    #[test]
    fn test_clear_gl_completes_deferred_removal() {
        let (mut manager, backend) = manager();
        let events = Arc::new(Events::default());
        manager.add_listener(Box::new(Recorder(Arc::clone(&events))));

        let mut ctx = SoftwareContext::new();
        ctx.make_current();
        let id = manager.add_sender("Out", 4, 4, true);
        manager.render_gl(&mut ctx);

        ctx.done_current();
        assert_eq!(manager.remove_sender(id, false, &mut ctx), Removal::Deferred);
        assert_eq!(events.senders_removed.load(Ordering::SeqCst), 0);

        ctx.make_current();
        manager.clear_gl(&mut ctx);
        assert!(manager.sender(id).is_none());
        assert!(!manager.is_sender_pending_removal(id));
        assert!(!backend.is_published("Out"));
        assert_eq!(ctx.live_targets(), 0);
        assert_eq!(ctx.inactive_releases(), 0);
        assert_eq!(events.senders_removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forced_removal_without_context_keeps_surface() {
        let (mut manager, backend) = manager();
        let mut ctx = SoftwareContext::new();
        ctx.make_current();
        let id = manager.add_sender("Out", 4, 4, true);
        manager.render_gl(&mut ctx);

        ctx.done_current();
        assert_eq!(manager.remove_sender(id, true, &mut ctx), Removal::Destroyed);
        assert!(!backend.is_published("Out"));
        assert_eq!(ctx.inactive_releases(), 0);
    }

    #[test]
    fn test_init_gl_notifies() {
        let (mut manager, _) = manager();
        let events = Arc::new(Events::default());
        manager.add_listener(Box::new(Recorder(Arc::clone(&events))));

        let mut ctx = SoftwareContext::new();
        manager.init_gl(&mut ctx);
        assert_eq!(events.initialized.load(Ordering::SeqCst), 0);

        ctx.make_current();
        manager.init_gl(&mut ctx);
        assert_eq!(events.initialized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_loopback_within_one_frame() {
        let (mut manager, _) = manager();
        let mut ctx = SoftwareContext::new();
        ctx.make_current();

        let _sender = manager.add_sender("Out", 4, 4, true);
        let receiver = manager.add_receiver("Out", "App");

        manager.render_gl(&mut ctx);
        assert!(manager.receiver(receiver).unwrap().is_initialized());
        manager.render_gl(&mut ctx);
        assert!(manager.receiver(receiver).unwrap().is_connected());
    }

    #[test]
    fn test_clear_gl_destroys_everything() {
        let (mut manager, backend) = manager();
        let events = Arc::new(Events::default());
        manager.add_listener(Box::new(Recorder(Arc::clone(&events))));

        let mut ctx = SoftwareContext::new();
        ctx.make_current();
        manager.add_sender("A", 4, 4, true);
        manager.add_sender("B", 4, 4, true);
        manager.add_receiver("A", "App");
        manager.render_gl(&mut ctx);
        manager.render_gl(&mut ctx);

        manager.clear_gl(&mut ctx);
        assert_eq!(manager.sender_count(), 0);
        assert_eq!(manager.receiver_count(), 0);
        assert_eq!(backend.publisher_count(), 0);
        assert_eq!(ctx.live_targets(), 0);
        assert_eq!(events.senders_removed.load(Ordering::SeqCst), 2);
        assert_eq!(events.receivers_removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_backend() {
        let backend = LoopbackBackend::new("App");
        {
            let mut manager = SharedTextureManager::new(Arc::new(backend.clone()));
            let mut ctx = SoftwareContext::new();
            ctx.make_current();
            manager.add_sender("Out", 2, 2, true);
            manager.render_gl(&mut ctx);
            assert_eq!(backend.publisher_count(), 1);
        }
        assert_eq!(backend.publisher_count(), 0);
    }

    #[test]
    fn test_default_cpu_image_applies_to_new_receivers() {
        let (mut manager, _) = manager();
        let plain = manager.add_receiver("A", "");
        manager.set_default_use_cpu_image(true);
        let mirrored = manager.add_receiver("B", "");

        assert!(!manager.receiver(plain).unwrap().uses_cpu_image());
        assert!(manager.receiver(mirrored).unwrap().uses_cpu_image());
        assert_eq!(manager.receiver(mirrored).unwrap().name(), "B");
    }
}
