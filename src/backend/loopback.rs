//! In-process texture sharing.
//!
//! All `LoopbackBackend` values cloned from (or connected to) the same
//! directory see each other's publishers. A publisher is identified by its
//! name together with its application name, so two applications may publish
//! under the same name. Frames travel through the render context's pixel
//! paths, so a publish and a receive cost one readback and one upload.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::RwLock;

use super::{PublisherInfo, ReceiveResource, SendResource, TextureShareBackend};
use crate::context::{RenderContext, RenderTarget, TextureHandle};
use crate::error::{Result, ShareError};

/// Directory key: (sharing name, application name).
type SlotKey = (String, String);

/// A published slot in the shared directory.
struct PublishedSlot {
    owner: u64,
    width: u32,
    height: u32,
    frame: Option<Arc<RgbaImage>>,
}

#[derive(Default)]
struct Directory {
    slots: BTreeMap<SlotKey, PublishedSlot>,
    next_owner: AtomicU64,
}

impl Directory {
    fn allocate_owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Key of the publisher matching `name`. An empty `app_name` matches the
    /// first application, in name order, publishing under `name`.
    fn resolve(&self, name: &str, app_name: &str) -> Option<SlotKey> {
        if !app_name.is_empty() {
            let key = (name.to_string(), app_name.to_string());
            return self.slots.contains_key(&key).then_some(key);
        }
        self.slots
            .keys()
            .find(|(slot_name, _)| slot_name == name)
            .cloned()
    }
}

fn slot_key(name: &str, app_name: &str) -> SlotKey {
    (name.to_string(), app_name.to_string())
}

/// In-process backend over a shared publisher directory.
#[derive(Clone)]
pub struct LoopbackBackend {
    app_name: String,
    directory: Arc<RwLock<Directory>>,
}

impl LoopbackBackend {
    /// Create a backend with a fresh, empty directory.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            directory: Arc::new(RwLock::new(Directory::default())),
        }
    }

    /// Another application attached to the same directory.
    pub fn connect_app(&self, app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            directory: Arc::clone(&self.directory),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Whether any application publishes under this name.
    pub fn is_published(&self, name: &str) -> bool {
        self.directory.read().resolve(name, "").is_some()
    }

    /// Whether `app_name` publishes under this name.
    pub fn is_published_by(&self, name: &str, app_name: &str) -> bool {
        self.directory
            .read()
            .slots
            .contains_key(&slot_key(name, app_name))
    }

    /// Number of publishers in the directory.
    pub fn publisher_count(&self) -> usize {
        self.directory.read().slots.len()
    }
}

impl TextureShareBackend for LoopbackBackend {
    fn technology_name(&self) -> &'static str {
        "Loopback"
    }

    fn create_send_resource(&self) -> Box<dyn SendResource> {
        let owner = self.directory.read().allocate_owner();
        Box::new(LoopbackSendResource {
            app_name: self.app_name.clone(),
            directory: Arc::clone(&self.directory),
            owner,
            name: None,
        })
    }

    fn discover_receivable(&self, name: &str, app_name: &str) -> Option<Box<dyn ReceiveResource>> {
        let key = self.directory.read().resolve(name, app_name)?;

        Some(Box::new(LoopbackReceiveResource {
            directory: Arc::clone(&self.directory),
            key,
            last_size: None,
            size_changed: false,
        }))
    }

    fn list_publishers(&self) -> Vec<PublisherInfo> {
        self.directory
            .read()
            .slots
            .keys()
            .map(|(name, app_name)| PublisherInfo {
                name: name.clone(),
                app_name: app_name.clone(),
            })
            .collect()
    }
}

struct LoopbackSendResource {
    app_name: String,
    directory: Arc<RwLock<Directory>>,
    owner: u64,
    /// Name this handle currently publishes under.
    name: Option<String>,
}

impl LoopbackSendResource {
    fn key(&self, name: &str) -> SlotKey {
        slot_key(name, &self.app_name)
    }

    /// Fails when another sender of this application holds `name`.
    fn claim(&self, directory: &Directory, name: &str) -> Result<()> {
        match directory.slots.get(&self.key(name)) {
            Some(slot) if slot.owner != self.owner => Err(ShareError::NameInUse(name.to_string())),
            _ => Ok(()),
        }
    }
}

impl SendResource for LoopbackSendResource {
    fn create(&mut self, name: &str, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(ShareError::InvalidSize { width, height });
        }

        let mut directory = self.directory.write();
        self.claim(&directory, name)?;
        if let Some(old) = self.name.take() {
            directory.slots.remove(&self.key(&old));
        }
        directory.slots.insert(
            self.key(name),
            PublishedSlot {
                owner: self.owner,
                width,
                height,
                frame: None,
            },
        );
        self.name = Some(name.to_string());
        Ok(())
    }

    fn update(&mut self, name: &str, width: u32, height: u32) -> Result<()> {
        if self.name.as_deref() != Some(name) {
            if self.name.is_some() {
                self.rename(name)?;
            } else {
                return self.create(name, width, height);
            }
        }

        let mut directory = self.directory.write();
        let slot = directory
            .slots
            .get_mut(&self.key(name))
            .ok_or_else(|| ShareError::NotFound(name.to_string()))?;
        slot.width = width;
        slot.height = height;
        Ok(())
    }

    fn rename(&mut self, name: &str) -> Result<()> {
        let Some(current) = self.name.clone() else {
            return Err(ShareError::NotFound(name.to_string()));
        };
        if current == name {
            return Ok(());
        }

        let mut directory = self.directory.write();
        self.claim(&directory, name)?;
        let slot = directory
            .slots
            .remove(&self.key(&current))
            .ok_or(ShareError::NotFound(current))?;
        directory.slots.insert(self.key(name), slot);
        self.name = Some(name.to_string());
        Ok(())
    }

    fn release(&mut self) {
        if let Some(name) = self.name.take() {
            let key = self.key(&name);
            let mut directory = self.directory.write();
            if directory.slots.get(&key).is_some_and(|s| s.owner == self.owner) {
                directory.slots.remove(&key);
            }
        }
    }

    fn publish(
        &mut self,
        ctx: &mut dyn RenderContext,
        texture: TextureHandle,
        _width: u32,
        _height: u32,
    ) -> Result<()> {
        let Some(name) = self.name.as_deref() else {
            return Err(ShareError::NotFound(String::new()));
        };

        let frame = ctx.read_pixels(texture)?;
        let (width, height) = frame.dimensions();

        let mut directory = self.directory.write();
        let slot = directory
            .slots
            .get_mut(&self.key(name))
            .ok_or_else(|| ShareError::NotFound(name.to_string()))?;
        slot.width = width;
        slot.height = height;
        slot.frame = Some(Arc::new(frame));
        Ok(())
    }
}

impl Drop for LoopbackSendResource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Binding to one publisher, fixed at discovery time.
struct LoopbackReceiveResource {
    directory: Arc<RwLock<Directory>>,
    key: SlotKey,
    last_size: Option<(u32, u32)>,
    size_changed: bool,
}

impl LoopbackReceiveResource {
    fn current_frame(&self) -> Option<Arc<RgbaImage>> {
        self.directory.read().slots.get(&self.key)?.frame.clone()
    }
}

impl ReceiveResource for LoopbackReceiveResource {
    fn remote_size(&self) -> Option<(u32, u32)> {
        let directory = self.directory.read();
        let slot = directory.slots.get(&self.key)?;
        Some((slot.width, slot.height))
    }

    fn receive_into(
        &mut self,
        ctx: &mut dyn RenderContext,
        target: &RenderTarget,
        invert: bool,
    ) -> bool {
        let Some(frame) = self.current_frame() else {
            return false;
        };

        let size = frame.dimensions();
        if !target.matches(size.0, size.1) {
            // Publisher resized since the caller last checked.
            self.size_changed = true;
            return false;
        }

        let written = if invert {
            ctx.write_pixels(target.texture(), &image::imageops::flip_vertical(&*frame))
        } else {
            ctx.write_pixels(target.texture(), &frame)
        };
        if let Err(e) = written {
            tracing::debug!(name = %self.key.0, app = %self.key.1, "Loopback: receive failed: {}", e);
            return false;
        }

        self.size_changed = self.last_size.is_some_and(|last| last != size);
        self.last_size = Some(size);
        true
    }

    fn remote_size_changed(&self) -> bool {
        self.size_changed
    }

    fn release(&mut self) {
        self.last_size = None;
        self.size_changed = false;
    }
}
