//! Source controllers
//!
//! A `SourceController` owns the playable primitive behind one token and hides
//! the difference between the two source kinds:
//!
//! - **Element**: streams from the locator; pause/resume/seek act in place.
//! - **Buffer**: plays decoded data; primitives are one-shot, so pause stops
//!   the primitive and resume/seek start a fresh one at the stored position.
//!
//! The kind is chosen once when the token is built. Natural-end notifications
//! carry the generation of the primitive that produced them so the token can
//! ignore ends from primitives that were already replaced or stopped.

use crate::engine::{AudioContext, BufferSource, DecodedAudio, ElementSource, GainStage};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Seeks closer than this to the current position are ignored for buffer sources
pub const SEEK_EPSILON: f64 = 0.01;

/// Receives the generation of the primitive that reached its natural end
pub(crate) type EndNotifier = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Element,
    Buffer,
}

/// Playback window in media seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PlaybackWindow {
    pub start: f64,
    pub end: Option<f64>,
}

/// Narrow control surface shared by both source kinds
pub(crate) trait SourceController: Send {
    fn kind(&self) -> SourceKind;

    /// Begin playback at the window start
    fn start(&mut self) -> Result<()>;

    /// Capture the position and release the playing resource
    fn pause(&mut self);

    /// Continue from the captured position
    fn resume(&mut self) -> Result<()>;

    /// Move to `position`; returns whether anything changed
    fn seek(&mut self, position: f64, playing: bool) -> Result<bool>;

    fn set_rate(&mut self, rate: f32);

    /// Current media position in seconds
    fn position(&self) -> f64;

    /// Whether an end notification with this generation is still meaningful
    fn is_current(&self, generation: u64) -> bool;

    /// Stop and drop the primitive; the controller is unusable afterwards
    fn release(&mut self);
}

/// Controller over a streaming element source
pub(crate) struct ElementController {
    source: Box<dyn ElementSource>,
    released: bool,
}

impl ElementController {
    pub fn new(
        context: &dyn AudioContext,
        locator: &str,
        output: &Arc<dyn GainStage>,
        window: PlaybackWindow,
        rate: f32,
        looping: bool,
        notifier: EndNotifier,
    ) -> Result<Self> {
        let source = context.create_element_source(locator, output)?;
        source.set_playback_rate(rate);
        source.set_looping(looping);
        source.set_end_time(window.end);
        source.set_current_time(window.start);
        source.set_on_ended(Box::new(move || notifier(0)));
        Ok(Self {
            source,
            released: false,
        })
    }
}

impl SourceController for ElementController {
    fn kind(&self) -> SourceKind {
        SourceKind::Element
    }

    fn start(&mut self) -> Result<()> {
        self.source.play()
    }

    fn pause(&mut self) {
        self.source.pause();
    }

    fn resume(&mut self) -> Result<()> {
        self.source.play()
    }

    fn seek(&mut self, position: f64, _playing: bool) -> Result<bool> {
        self.source.set_current_time(position);
        Ok(true)
    }

    fn set_rate(&mut self, rate: f32) {
        self.source.set_playback_rate(rate);
    }

    fn position(&self) -> f64 {
        self.source.current_time()
    }

    fn is_current(&self, _generation: u64) -> bool {
        !self.released
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.source.pause();
        self.source.release();
    }
}

/// Controller over one-shot buffer sources
pub(crate) struct BufferController {
    context: Arc<dyn AudioContext>,
    audio: Arc<DecodedAudio>,
    output: Arc<dyn GainStage>,
    current: Option<Box<dyn BufferSource>>,
    generation: u64,
    window: PlaybackWindow,
    looping: bool,
    rate: f32,
    /// Media position when the current primitive started
    anchor_offset: f64,
    /// Context time when the current primitive started
    anchor_time: f64,
    /// Position to resume from while no primitive is playing
    stored_position: f64,
    notifier: EndNotifier,
}

impl BufferController {
    pub fn new(
        context: Arc<dyn AudioContext>,
        audio: Arc<DecodedAudio>,
        output: Arc<dyn GainStage>,
        window: PlaybackWindow,
        rate: f32,
        looping: bool,
        notifier: EndNotifier,
    ) -> Self {
        let duration = audio.duration();
        let start = window.start.min(duration);
        let end = window.end.map(|end| end.clamp(start, duration));
        Self {
            context,
            audio,
            output,
            current: None,
            generation: 0,
            window: PlaybackWindow { start, end },
            looping,
            rate,
            anchor_offset: start,
            anchor_time: 0.0,
            stored_position: start,
            notifier,
        }
    }

    fn window_end(&self) -> f64 {
        self.window.end.unwrap_or_else(|| self.audio.duration())
    }

    /// Create and start a fresh primitive at `offset`
    fn spawn_at(&mut self, offset: f64) -> Result<()> {
        self.discard_current();
        self.generation += 1;

        let source = self.context.create_buffer_source(&self.audio, &self.output)?;
        source.set_playback_rate(self.rate);
        source.set_loop(self.looping, self.window.start, self.window.end);

        let notifier = Arc::clone(&self.notifier);
        let generation = self.generation;
        source.set_on_ended(Box::new(move || notifier(generation)));

        let duration = if self.looping {
            None
        } else {
            Some((self.window_end() - offset).max(0.0))
        };
        if let Err(e) = source.start(offset, duration) {
            source.disconnect();
            return Err(e);
        }

        self.current = Some(source);
        self.anchor_offset = offset;
        self.anchor_time = self.context.now();
        Ok(())
    }

    fn discard_current(&mut self) {
        if let Some(source) = self.current.take() {
            source.stop();
            source.disconnect();
            self.generation += 1;
        }
    }
}

impl SourceController for BufferController {
    fn kind(&self) -> SourceKind {
        SourceKind::Buffer
    }

    fn start(&mut self) -> Result<()> {
        let start = self.window.start;
        self.stored_position = start;
        self.spawn_at(start)
    }

    fn pause(&mut self) {
        self.stored_position = self.position();
        self.discard_current();
    }

    fn resume(&mut self) -> Result<()> {
        let position = self.stored_position;
        self.spawn_at(position)
    }

    fn seek(&mut self, position: f64, playing: bool) -> Result<bool> {
        let position = position.min(self.window_end());
        if (position - self.position()).abs() <= SEEK_EPSILON {
            return Ok(false);
        }
        self.stored_position = position;
        if playing {
            self.spawn_at(position)?;
        }
        Ok(true)
    }

    fn set_rate(&mut self, rate: f32) {
        if let Some(source) = &self.current {
            let position = self.position();
            self.anchor_offset = position;
            self.anchor_time = self.context.now();
            source.set_playback_rate(rate);
        }
        self.rate = rate;
    }

    fn position(&self) -> f64 {
        if self.current.is_none() {
            return self.stored_position;
        }
        let elapsed = (self.context.now() - self.anchor_time).max(0.0);
        let raw = self.anchor_offset + elapsed * f64::from(self.rate);
        let end = self.window_end();
        if self.looping {
            let span = end - self.window.start;
            if span > 0.0 && raw >= end {
                return self.window.start + (raw - self.window.start) % span;
            }
            raw
        } else {
            raw.min(end)
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current.is_some() && generation == self.generation
    }

    fn release(&mut self) {
        self.stored_position = self.position();
        self.discard_current();
    }
}
