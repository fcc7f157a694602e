//! Error types for mixdeck-core
//!
//! Defines the crate error type using thiserror. Probe failures in `auto`
//! load mode and best-effort unloads never surface here: the first is
//! downgraded to stream mode, the second is a silent no-op.

use thiserror::Error;

/// Main error type for mixdeck-core
#[derive(Error, Debug)]
pub enum Error {
    /// Operation on a destroyed session, removed channel or terminal token
    #[error("Use after teardown: {0}")]
    UseAfterTeardown(String),

    /// A live sibling channel already has this name
    #[error("Duplicate channel name: {0}")]
    DuplicateName(String),

    /// Session channel-count ceiling reached
    #[error("Channel limit exceeded: session allows {limit} channels")]
    LimitExceeded { limit: usize },

    /// Network or decode failure while loading audio
    #[error("Failed to load {locator}: {reason}")]
    Load { locator: String, reason: String },

    /// The engine refused to start playback (e.g. autoplay policy)
    #[error("Playback rejected: {0}")]
    PlaybackRejected(String),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-HTTP transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Audio engine errors
    #[error("Audio engine error: {0}")]
    Engine(String),

    /// Invalid request
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] mixdeck_common::Error),
}

/// Convenience Result type using mixdeck-core Error
pub type Result<T> = std::result::Result<T, Error>;
