//! Option types recognized by sessions, channels and playback calls
//!
//! All option structs deserialize from TOML/JSON with defaults for every
//! missing field, so partial documents are valid. Values outside their
//! legal range are clamped by `normalized()` rather than rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default channel-count ceiling for a session (root channel included)
pub const DEFAULT_MAX_CHANNELS: usize = 32;

/// Strategy for acquiring playable audio data from a locator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Element-backed playback straight from the locator; never touches the cache
    Stream,
    /// Fetch and decode into memory through the decoded-audio cache
    Full,
    /// Probe the locator size and pick `Stream` or `Full`
    #[default]
    Auto,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Stream => write!(f, "stream"),
            LoadMode::Full => write!(f, "full"),
            LoadMode::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for LoadMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" => Ok(LoadMode::Stream),
            "full" => Ok(LoadMode::Full),
            "auto" => Ok(LoadMode::Auto),
            other => Err(crate::Error::Config(format!("Unknown load mode '{}'", other))),
        }
    }
}

/// Engine latency tuning hint passed to the audio context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyHint {
    #[default]
    Interactive,
    Balanced,
    Playback,
}

/// Session-wide options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Master gain applied by the root channel (0.0-1.0)
    pub volume: f32,

    /// Engine latency hint
    pub latency_hint: LatencyHint,

    /// Requested engine sample rate (None = engine default)
    pub sample_rate: Option<u32>,

    /// Maximum number of live channels, root included
    pub max_channels: usize,

    /// Suppress diagnostic logging for this session
    pub silent: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            volume: 1.0,
            latency_hint: LatencyHint::default(),
            sample_rate: None,
            max_channels: DEFAULT_MAX_CHANNELS,
            silent: false,
        }
    }
}

impl SessionOptions {
    /// Clamp every field into its legal range
    pub fn normalized(mut self) -> Self {
        self.volume = clamp_unit(self.volume);
        self.max_channels = self.max_channels.max(1);
        self
    }
}

/// Per-channel options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Own gain scale (0.0-1.0)
    pub volume: f32,

    /// Maximum concurrently attached tokens (None = unlimited)
    pub limit: Option<usize>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self { volume: 1.0, limit: None }
    }
}

impl ChannelOptions {
    pub fn normalized(mut self) -> Self {
        self.volume = clamp_unit(self.volume);
        self.limit = self.limit.map(|l| l.max(1));
        self
    }
}

/// Options for a single `play` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayOptions {
    /// Initial token gain (0.0-1.0)
    pub volume: f32,

    /// Playback window start in seconds
    pub start_time: f64,

    /// Playback window end in seconds (None = end of media)
    pub end_time: Option<f64>,

    /// Playback speed multiplier
    pub rate: f32,

    /// Load strategy
    pub load: LoadMode,

    /// Loop the playback window
    #[serde(rename = "loop")]
    pub looping: bool,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            volume: 1.0,
            start_time: 0.0,
            end_time: None,
            rate: 1.0,
            load: LoadMode::Auto,
            looping: false,
        }
    }
}

impl PlayOptions {
    /// Defaults with an explicit load mode
    pub fn with_load(load: LoadMode) -> Self {
        Self { load, ..Self::default() }
    }

    pub fn normalized(mut self, min_rate: f32) -> Self {
        self.volume = clamp_unit(self.volume);
        self.start_time = self.start_time.max(0.0);
        self.end_time = self
            .end_time
            .filter(|end| end.is_finite())
            .map(|end| end.max(self.start_time));
        self.rate = if self.rate.is_finite() { self.rate.max(min_rate) } else { 1.0 };
        self
    }
}

/// Options for stopping a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopOptions {
    /// Fade-to-zero duration before the terminal stop (0 = immediate)
    pub fade_duration_ms: u64,
}

impl StopOptions {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn fade(fade_duration_ms: u64) -> Self {
        Self { fade_duration_ms }
    }
}

/// Clamp a gain value into 0.0-1.0, mapping NaN to silence
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
