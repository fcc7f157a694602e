//! Configuration loading and config file resolution
//!
//! A mixdeck configuration is a single TOML document describing the session
//! options, logging, and an optional declarative channel layout that is
//! created when the session starts.
//!
//! # Resolution Priority
//!
//! 1. Explicit path passed by the caller (highest priority)
//! 2. `MIXDECK_CONFIG` environment variable
//! 3. `<config_dir>/mixdeck/audio.toml`
//! 4. Built-in defaults (fallback)
//!
//! A missing file is not an error: the caller gets defaults and a warning.
//! A file that exists but does not parse is an error.

use crate::options::{ChannelOptions, SessionOptions};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "MIXDECK_CONFIG";

/// Complete configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub session: SessionOptions,
    pub logging: LoggingConfig,
    pub channels: Vec<ChannelLayout>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_volume() -> f32 {
    1.0
}

/// One channel of the declarative layout, with its sub-channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub name: String,

    #[serde(default = "default_volume")]
    pub volume: f32,

    #[serde(default)]
    pub limit: Option<usize>,

    #[serde(default)]
    pub children: Vec<ChannelLayout>,
}

impl ChannelLayout {
    pub fn options(&self) -> ChannelOptions {
        ChannelOptions {
            volume: self.volume,
            limit: self.limit,
        }
        .normalized()
    }

    /// Number of channels in this subtree, this one included
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(ChannelLayout::count).sum::<usize>()
    }
}

impl AudioConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AudioConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.validated()
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AudioConfig = toml::from_str(&content).map_err(|source| Error::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded audio configuration from {}", path.display());
        config.validated()
    }

    /// Load the resolved config file, or defaults when none exists
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        match resolve_config_path(explicit) {
            Some(path) => Self::load(&path),
            None => {
                warn!("No audio configuration file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    /// Total channels the layout creates, root excluded
    pub fn layout_channel_count(&self) -> usize {
        self.channels.iter().map(ChannelLayout::count).sum()
    }

    /// Normalize option values and check the channel layout
    pub fn validated(mut self) -> Result<Self> {
        self.session = self.session.normalized();
        check_sibling_names(&self.channels, "<root>")?;

        let needed = self.layout_channel_count() + 1;
        if needed > self.session.max_channels {
            return Err(Error::Config(format!(
                "Channel layout needs {} channels but max_channels is {}",
                needed, self.session.max_channels
            )));
        }
        Ok(self)
    }
}

fn check_sibling_names(layouts: &[ChannelLayout], parent: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for layout in layouts {
        if layout.name.is_empty() || layout.name.contains('/') {
            return Err(Error::Config(format!(
                "Invalid channel name '{}' under {}",
                layout.name, parent
            )));
        }
        if !seen.insert(layout.name.as_str()) {
            return Err(Error::Config(format!(
                "Duplicate channel name '{}' under {}",
                layout.name, parent
            )));
        }
        check_sibling_names(&layout.children, &layout.name)?;
    }
    Ok(())
}

/// Resolve the config file path following the priority order above
///
/// Returns None when no candidate exists on disk.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    default_config_path().filter(|p| p.exists())
}

/// Platform default config file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mixdeck").join("audio.toml"))
}
