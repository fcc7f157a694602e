//! Audio engine collaborator contract
//!
//! The session subsystem never touches an audio device directly. It talks to
//! an `AudioContext` that hands out gain stages and the two kinds of playable
//! sources:
//!
//! ```text
//! element source ─┐
//!                 ├─> token gain ─> channel gain ─> ... ─> root gain ─> destination
//! buffer source ──┘
//! ```
//!
//! Volume cascading is structural: every gain stage scales its own input and
//! forwards it to the stage it is connected to. Nothing walks the tree to
//! recompute levels.

pub mod headless;

use crate::Result;
use async_trait::async_trait;
use mixdeck_common::{LatencyHint, SessionOptions};
use std::sync::Arc;
use std::time::Duration;

pub use headless::{HeadlessContext, HeadlessGain};

/// Callback invoked by a source when it reaches its natural end
///
/// Engines must not invoke it re-entrantly from inside a control call on the
/// same source.
pub type EndedCallback = Box<dyn Fn() + Send + Sync>;

/// Engine tuning hints taken from the session options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextHints {
    pub latency_hint: LatencyHint,
    pub sample_rate: Option<u32>,
}

impl From<&SessionOptions> for ContextHints {
    fn from(options: &SessionOptions) -> Self {
        Self {
            latency_hint: options.latency_hint,
            sample_rate: options.sample_rate,
        }
    }
}

/// Decoded PCM payload
///
/// Samples are interleaved `f32`. The payload is read-only once built and is
/// shared by every token playing it.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    sample_rate: u32,
    channels: u16,
    samples: Vec<f32>,
}

impl DecodedAudio {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            samples,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Approximate memory footprint of the payload
    pub fn byte_size(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}

/// Volume-control primitive
pub trait GainStage: Send + Sync {
    /// Diagnostic label given at creation
    fn label(&self) -> &str;

    /// Current gain, including any automation in progress
    fn value(&self) -> f32;

    /// Cancel scheduled automation and set the gain now
    fn set_value(&self, value: f32);

    /// Replace scheduled automation with a linear ramp starting now
    fn linear_ramp(&self, from: f32, to: f32, duration: Duration);

    /// Cancel scheduled automation, keeping the value reached so far
    fn hold(&self) -> f32;

    /// Route this stage's output into another stage
    fn connect(&self, destination: Arc<dyn GainStage>);

    /// Route this stage's output to the engine destination
    fn connect_to_destination(&self);

    /// Detach this stage's output
    fn disconnect(&self);

    /// Level this stage contributes at the destination (0.0 when detached)
    fn output_level(&self) -> f32;
}

/// Media-element style source: streams from a locator, resumable in place
pub trait ElementSource: Send + Sync {
    /// Start or resume playback; the engine may refuse
    fn play(&self) -> Result<()>;
    fn pause(&self);
    fn current_time(&self) -> f64;
    fn set_current_time(&self, seconds: f64);
    fn set_playback_rate(&self, rate: f32);
    fn set_looping(&self, looping: bool);
    /// Stop at this media time instead of the end of the media
    fn set_end_time(&self, end: Option<f64>);
    fn set_on_ended(&self, callback: EndedCallback);
    /// Stop and drop the media; the source is unusable afterwards
    fn release(&self);
}

/// Buffer-backed one-shot source
pub trait BufferSource: Send + Sync {
    /// Start at `offset` seconds, playing for `duration` seconds when given.
    /// A buffer source can be started once.
    fn start(&self, offset: f64, duration: Option<f64>) -> Result<()>;
    fn stop(&self);
    fn set_playback_rate(&self, rate: f32);
    fn set_loop(&self, looping: bool, loop_start: f64, loop_end: Option<f64>);
    fn set_on_ended(&self, callback: EndedCallback);
    fn disconnect(&self);
}

/// Decoding-capable engine execution context
#[async_trait]
pub trait AudioContext: Send + Sync {
    /// Monotonic clock in seconds
    fn now(&self) -> f64;

    fn sample_rate(&self) -> u32;

    fn create_gain(&self, label: &str) -> Arc<dyn GainStage>;

    fn create_element_source(
        &self,
        locator: &str,
        output: &Arc<dyn GainStage>,
    ) -> Result<Box<dyn ElementSource>>;

    fn create_buffer_source(
        &self,
        audio: &Arc<DecodedAudio>,
        output: &Arc<dyn GainStage>,
    ) -> Result<Box<dyn BufferSource>>;

    /// Decode an encoded byte buffer; `hint` is a file extension when known
    async fn decode(&self, bytes: Vec<u8>, hint: Option<String>) -> Result<DecodedAudio>;

    /// Resume the context (user-gesture unlock handshake)
    async fn resume(&self) -> Result<()>;

    fn close(&self);
}
