//! Settings for texture sharing
//!
//! Describes the senders and receivers an application creates at startup,
//! stored as XML next to the other application preferences.

use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A sender created at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSettings {
    #[serde(rename = "@name")]
    pub name: String,

    #[serde(rename = "@width")]
    pub width: u32,

    #[serde(rename = "@height")]
    pub height: u32,

    #[serde(rename = "@enabled", default = "default_enabled")]
    pub enabled: bool,
}

/// A receiver created at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverSettings {
    #[serde(rename = "@name")]
    pub name: String,

    /// Publishing application; empty matches any
    #[serde(rename = "@appName", default)]
    pub app_name: String,

    #[serde(rename = "@enabled", default = "default_enabled")]
    pub enabled: bool,

    /// Overrides the global mirroring mode when present
    #[serde(rename = "@useCpuImage", default, skip_serializing_if = "Option::is_none")]
    pub use_cpu_image: Option<bool>,
}

/// Texture sharing settings stored in `sharing.xml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "SharedTextureSettings")]
pub struct SharingSettings {
    /// Name this application publishes under
    #[serde(rename = "appName", default = "default_app_name")]
    pub app_name: String,

    /// Whether receivers mirror frames into CPU memory by default
    #[serde(rename = "useCpuImage", default)]
    pub use_cpu_image: bool,

    /// Flip received frames vertically
    #[serde(rename = "invertReceivers", default)]
    pub invert_receivers: bool,

    #[serde(rename = "sender", default)]
    pub senders: Vec<SenderSettings>,

    #[serde(rename = "receiver", default)]
    pub receivers: Vec<ReceiverSettings>,
}

fn default_enabled() -> bool {
    true
}

fn default_app_name() -> String {
    "SharedTexture".to_string()
}

impl Default for SharingSettings {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            use_cpu_image: false,
            invert_receivers: false,
            senders: Vec::new(),
            receivers: Vec::new(),
        }
    }
}

impl SharingSettings {
    /// Settings file in the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("SharedTexture");
            p.push("sharing.xml");
            p
        })
    }

    /// Load from the config directory, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }

        match Self::load_from_file(&path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Failed to load sharing settings: {}", e);
                Self::default()
            }
        }
    }

    /// Load settings from an XML file
    pub fn load_from_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path)?;
        let settings: Self = from_str(&contents)?;
        Ok(settings)
    }

    /// Save settings to an XML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), SettingsError> {
        let xml = to_string(self)?;
        let formatted = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", xml);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, formatted)?;
        Ok(())
    }

    /// Save to the config directory
    pub fn save(&self) -> Result<(), SettingsError> {
        let path = Self::default_path().ok_or(SettingsError::NoConfigDir)?;
        self.save_to_file(&path)
    }
}

/// Settings-related errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XML parse error: {0}")]
    XmlParse(#[from] quick_xml::DeError),
    #[error("XML write error: {0}")]
    XmlWrite(#[from] quick_xml::SeError),
    #[error("Could not find config directory")]
    NoConfigDir,
}
