//! Texture-interop backend contract.
//!
//! A backend moves pixels between a local texture and a named resource that
//! other processes can see. Native Syphon (macOS) and Spout (Windows) glue
//! implement these traits outside this crate; [`LoopbackBackend`] shares
//! frames between managers in the same process and is what the crate ships
//! with.

mod loopback;

use std::fmt;

use crate::context::{RenderContext, RenderTarget, TextureHandle};
use crate::error::Result;

pub use loopback::LoopbackBackend;

/// A publisher visible through discovery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublisherInfo {
    pub name: String,
    pub app_name: String,
}

impl fmt::Display for PublisherInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.app_name.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} - {}", self.name, self.app_name)
        }
    }
}

/// Publishing side of one shared resource.
pub trait SendResource: Send {
    /// Create the named resource. Replaces any resource this handle already owns.
    fn create(&mut self, name: &str, width: u32, height: u32) -> Result<()>;

    /// Update dimensions (and name) of the existing resource.
    fn update(&mut self, name: &str, width: u32, height: u32) -> Result<()>;

    /// Rename the existing resource in place.
    fn rename(&mut self, name: &str) -> Result<()>;

    /// Withdraw the resource. Safe to call when nothing is published.
    fn release(&mut self);

    /// Publish the contents of `texture` as the current frame.
    fn publish(
        &mut self,
        ctx: &mut dyn RenderContext,
        texture: TextureHandle,
        width: u32,
        height: u32,
    ) -> Result<()>;
}

/// Consuming side bound to one remote publisher.
pub trait ReceiveResource: Send {
    /// Dimensions the remote currently advertises, `None` while it is absent.
    fn remote_size(&self) -> Option<(u32, u32)>;

    /// Copy the remote frame into `target`. Returns false when no frame could
    /// be received this call.
    fn receive_into(
        &mut self,
        ctx: &mut dyn RenderContext,
        target: &RenderTarget,
        invert: bool,
    ) -> bool;

    /// True when the last successful receive saw different dimensions than
    /// the one before it.
    fn remote_size_changed(&self) -> bool;

    /// Drop the binding to the remote publisher.
    fn release(&mut self);
}

/// Factory and discovery entry point of a backend.
pub trait TextureShareBackend: Send + Sync {
    /// Technology name for display ("Syphon", "Spout", ...).
    fn technology_name(&self) -> &'static str;

    /// A fresh, unpublished send resource.
    fn create_send_resource(&self) -> Box<dyn SendResource>;

    /// Bind to a publisher by name. An empty `app_name` matches any application.
    fn discover_receivable(&self, name: &str, app_name: &str) -> Option<Box<dyn ReceiveResource>>;

    /// All publishers currently visible, ordered by name.
    fn list_publishers(&self) -> Vec<PublisherInfo>;
}

/// Get the platform-specific technology name.
#[cfg(target_os = "macos")]
pub fn platform_technology_name() -> &'static str {
    "Syphon"
}

#[cfg(target_os = "windows")]
pub fn platform_technology_name() -> &'static str {
    "Spout"
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub fn platform_technology_name() -> &'static str {
    "Texture Share"
}

/// Check if native texture sharing exists on this platform.
#[cfg(any(target_os = "macos", target_os = "windows"))]
pub fn is_available() -> bool {
    true
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub fn is_available() -> bool {
    false
}
