//! Shared Texture Library
//!
//! Publishes GPU render targets to other applications and receives frames
//! they publish, on top of a pluggable sharing backend (Spout on Windows,
//! Syphon on macOS, or the in-process loopback shipped here).

pub mod backend;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod receiver;
pub mod sender;
pub mod settings;
pub mod telemetry;

pub use backend::{LoopbackBackend, PublisherInfo, ReceiveResource, SendResource, TextureShareBackend};
pub use context::{Bounds, RenderContext, RenderTarget, SoftwareContext, TextureHandle, WgpuContext};
pub use endpoint::{Endpoint, EndpointState, ListenerId};
pub use error::{Result, ShareError};
pub use manager::{ManagerListener, Removal, SharedTextureManager};
pub use receiver::{ImageBacking, ReceivedImage, Receiver, ReceiverId, ReceiverListener};
pub use sender::{DrawSurface, Sender, SenderId, SenderListener};
pub use settings::{ReceiverSettings, SenderSettings, SettingsError, SharingSettings};
