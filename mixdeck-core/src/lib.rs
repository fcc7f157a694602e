//! # mixdeck Core
//!
//! Hierarchical management of concurrently playing audio instances.
//!
//! **Components:**
//! - [`Session`]: per-instance root owning the channel tree and the cache
//! - [`Channel`]: named volume/mute node with a token limit
//! - [`PlaybackToken`]: one playing instance and its state machine
//! - [`FadeOperation`]: cancellable linear gain ramp on one token
//! - [`DecodedAudioCache`]: reference-counted decoded audio with load coalescing
//!
//! The audio engine itself sits behind the [`engine::AudioContext`] traits;
//! [`engine::HeadlessContext`] runs the subsystem without a device.

/// Emit a tracing event unless the owning session is silent
macro_rules! diag {
    ($silent:expr, $level:ident, $($arg:tt)+) => {
        if !$silent {
            tracing::$level!($($arg)+);
        }
    };
}

pub mod cache;
pub mod channel;
pub mod decode;
pub mod engine;
pub mod error;
pub mod events;
pub mod fade;
pub mod load_mode;
pub mod session;
mod source;
pub mod token;
pub mod transport;

pub use cache::{CacheLease, CachedAudio, DecodedAudioCache};
pub use channel::{Channel, ChannelId, ROOT_CHANNEL_NAME};
pub use error::{Error, Result};
pub use events::{EventKind, ListenerId, TokenEvent};
pub use fade::{FadeOperation, FadeState};
pub use load_mode::{resolve_load_mode, FULL_LOAD_THRESHOLD_BYTES};
pub use session::Session;
pub use source::{SourceKind, SEEK_EPSILON};
pub use token::{PlaybackState, PlaybackToken, TokenId, MIN_PLAYBACK_RATE};

pub use mixdeck_common::{
    AudioConfig, ChannelOptions, LatencyHint, LoadMode, PlayOptions, SessionOptions, StopOptions,
};
