//! Shared Texture - Loopback Demo
//!
//! Publishes an animated gradient through the in-process loopback backend and
//! receives it back, logging connection changes and frame counts.
//!
//! Usage: `shared-texture-demo [settings.xml] [frames]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use image::{Rgba, RgbaImage};
use shared_texture::telemetry::init_logging_default;
use shared_texture::{
    Bounds, DrawSurface, Endpoint, LoopbackBackend, ReceivedImage, Receiver, ReceiverListener,
    ReceiverSettings, RenderContext, SenderListener, SenderSettings, SharedTextureManager,
    SharingSettings, SoftwareContext, WgpuContext,
};

const DEFAULT_FRAMES: u32 = 180;
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Whichever context could be created on this machine
enum DemoContext {
    Gpu(WgpuContext),
    Software(SoftwareContext),
}

impl DemoContext {
    fn create() -> Self {
        match pollster::block_on(WgpuContext::new_headless()) {
            Ok(ctx) => Self::Gpu(ctx),
            Err(e) => {
                tracing::warn!("No GPU adapter ({}), using software context", e);
                Self::Software(SoftwareContext::new())
            }
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::Gpu(_) => "wgpu",
            Self::Software(_) => "software",
        }
    }

    /// Run `f` with the context current, releasing it afterwards.
    fn with_current<R>(&mut self, f: impl FnOnce(&mut dyn RenderContext) -> R) -> R {
        match self {
            Self::Gpu(ctx) => {
                ctx.make_current();
                let result = f(ctx);
                ctx.done_current();
                result
            }
            Self::Software(ctx) => {
                ctx.make_current();
                let result = f(ctx);
                ctx.done_current();
                result
            }
        }
    }
}

/// Animated diagonal gradient
struct Gradient {
    frame: u32,
}

impl SenderListener for Gradient {
    fn draw_shared_texture(&mut self, surface: &mut DrawSurface<'_>, bounds: Bounds) {
        self.frame = self.frame.wrapping_add(1);
        let shift = self.frame;
        let (w, h) = (bounds.width.max(1), bounds.height.max(1));
        let pixels = RgbaImage::from_fn(bounds.width, bounds.height, |x, y| {
            let r = (((x + shift) % w) * 255 / w) as u8;
            let g = (y * 255 / h) as u8;
            Rgba([r, g, 160, 255])
        });

        if let Err(e) = surface.write_image(&pixels) {
            tracing::warn!("Gradient: upload failed: {}", e);
        }
    }
}

struct ConnectionLog;

impl ReceiverListener for ConnectionLog {
    fn connection_changed(&mut self, receiver: &Receiver) {
        tracing::info!(
            "Receiver '{}' {}",
            receiver.name(),
            if receiver.is_connected() { "connected" } else { "disconnected" }
        );
    }
}

fn demo_settings(path: Option<PathBuf>) -> SharingSettings {
    let mut settings = match path {
        Some(path) => SharingSettings::load_from_file(&path).unwrap_or_else(|e| {
            tracing::warn!("Could not read {}: {}, using defaults", path.display(), e);
            SharingSettings::default()
        }),
        None => SharingSettings::load(),
    };
    if settings.senders.is_empty() {
        settings.senders.push(SenderSettings {
            name: "Gradient".to_string(),
            width: 640,
            height: 360,
            enabled: true,
        });
    }
    if settings.receivers.is_empty() {
        let first = &settings.senders[0];
        settings.receivers.push(ReceiverSettings {
            name: first.name.clone(),
            app_name: settings.app_name.clone(),
            enabled: true,
            use_cpu_image: Some(true),
        });
    }
    settings
}

fn main() {
    let _log_guard = init_logging_default();

    let mut frames = DEFAULT_FRAMES;
    let mut settings_path = None;
    for arg in std::env::args().skip(1) {
        match arg.parse::<u32>() {
            Ok(n) => frames = n,
            Err(_) => settings_path = Some(PathBuf::from(arg)),
        }
    }

    let settings = demo_settings(settings_path);
    tracing::info!(
        "Sharing as '{}' via {} ({})",
        settings.app_name,
        shared_texture::backend::platform_technology_name(),
        if shared_texture::backend::is_available() { "native available" } else { "loopback only" }
    );

    let backend = Arc::new(LoopbackBackend::new(settings.app_name.clone()));
    let mut manager = SharedTextureManager::new(backend);
    let (sender_ids, receiver_ids) = manager.apply_settings(&settings);

    for (index, id) in sender_ids.iter().enumerate() {
        if let Some(sender) = manager.sender_mut(*id) {
            sender.add_listener(Box::new(Gradient { frame: index as u32 * 40 }));
        }
    }
    for id in &receiver_ids {
        if let Some(receiver) = manager.receiver_mut(*id) {
            receiver.add_listener(Box::new(ConnectionLog));
        }
    }

    let mut ctx = DemoContext::create();
    tracing::info!("Rendering {} frames on the {} context", frames, ctx.describe());

    ctx.with_current(|ctx| manager.init_gl(ctx));
    for _ in 0..frames {
        ctx.with_current(|ctx| manager.render_gl(ctx));
        std::thread::sleep(FRAME_INTERVAL);
    }

    tracing::info!("Available senders: {:?}", manager.available_senders());
    for sender in manager.senders() {
        tracing::info!(
            "Sender '{}': {}x{}, {} frames published",
            sender.name(),
            sender.width(),
            sender.height(),
            sender.frames_published()
        );
    }
    for receiver in manager.receivers() {
        let image = match receiver.image() {
            Some(ReceivedImage::Cpu(pixels)) => format!("cpu {}x{}", pixels.width(), pixels.height()),
            Some(ReceivedImage::Gpu(target)) => format!("gpu {}x{}", target.width(), target.height()),
            None => "none".to_string(),
        };
        tracing::info!(
            "Receiver '{}': connected={}, {} frames, image {}",
            receiver.name(),
            receiver.is_connected(),
            receiver.frames_received(),
            image
        );
    }

    ctx.with_current(|ctx| manager.clear_gl(ctx));
}
