//! Logging configuration and initialization

use std::path::PathBuf;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt,
    layer::Layered,
    prelude::*,
    registry::Registry,
    Layer,
};

type BoxedLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Default log file name when file output is enabled without a path
pub const DEFAULT_LOG_FILE: &str = "shared_texture.log";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Write human-readable output to stderr
    pub console_enabled: bool,
    /// Also write to a log file
    pub file_enabled: bool,
    pub file_path: Option<PathBuf>,
    /// Emit JSON lines on the console instead of compact text
    pub json_format: bool,
    /// Filter used when neither `SHARED_TEXTURE_LOG` nor `RUST_LOG` is set
    pub default_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: None,
            json_format: false,
            default_level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Effective log file path
    pub fn log_file(&self) -> PathBuf {
        self.file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE))
    }

    fn wants_json(&self) -> bool {
        std::env::var("SHARED_TEXTURE_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(self.json_format)
    }
}

/// Install the global tracing subscriber
///
/// `SHARED_TEXTURE_LOG` overrides the level filter (falling back to `RUST_LOG`),
/// and `SHARED_TEXTURE_LOG_FORMAT=json` switches console output to JSON.
/// Keep the returned guard alive until shutdown or buffered file output is lost.
pub fn init_logging(config: &LogConfig) -> Result<Option<LogGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_env("SHARED_TEXTURE_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    let use_json = config.wants_json();
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.file_enabled {
        let path = config.log_file();
        let file = std::fs::File::create(&path)?;
        let (writer, file_guard) = tracing_appender::non_blocking(file);
        guard = Some(file_guard);

        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
        );
    }

    if config.console_enabled {
        let console = if use_json {
            fmt::layer()
                .json()
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .boxed()
        } else {
            fmt::layer().compact().with_target(true).boxed()
        };
        layers.push(console);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    tracing::info!(
        target: "shared_texture",
        version = env!("CARGO_PKG_VERSION"),
        json_format = use_json,
        file_enabled = config.file_enabled,
        "Logging initialized"
    );

    Ok(guard)
}

/// Initialize with defaults, reporting failure on stderr
pub fn init_logging_default() -> Option<LogGuard> {
    match init_logging(&LogConfig::default()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    }
}

pub use tracing_appender::non_blocking::WorkerGuard as LogGuard;
