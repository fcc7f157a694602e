//! # mixdeck Common Library
//!
//! Shared code for the mixdeck audio session crates:
//! - Option types for sessions, channels, playback and stop requests
//! - TOML configuration loading and path resolution
//! - Linear ramp evaluation used by gain automation
//! - Logging bootstrap

pub mod config;
pub mod error;
pub mod logging;
pub mod options;
pub mod ramp;

pub use error::{Error, Result};
pub use config::{AudioConfig, ChannelLayout, LoggingConfig};
pub use options::{
    clamp_unit, ChannelOptions, LatencyHint, LoadMode, PlayOptions, SessionOptions, StopOptions,
};
pub use ramp::LinearRamp;
