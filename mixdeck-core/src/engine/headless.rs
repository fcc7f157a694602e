//! Headless audio engine
//!
//! An in-process `AudioContext` with no device behind it. Gain automation is
//! evaluated exactly against the tokio clock, and source playback is simulated
//! as a timeline (position, rate, loop window, end) whose natural end fires
//! from a tokio timer. With a paused tokio clock every fade and end is
//! deterministic, which is what the test-suite relies on.
//!
//! Streams have no intrinsic length unless one is registered with
//! `set_media_duration`; unregistered streams play forever.

use super::{AudioContext, BufferSource, ContextHints, DecodedAudio, ElementSource, EndedCallback, GainStage};
use crate::{decode, Error, Result};
use async_trait::async_trait;
use mixdeck_common::LinearRamp;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_SAMPLE_RATE: u32 = 44100;

#[derive(Debug, Clone, Copy)]
struct Clock {
    origin: Instant,
}

impl Clock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Engine context without an output device
pub struct HeadlessContext {
    shared: Arc<HeadlessShared>,
}

struct HeadlessShared {
    clock: Clock,
    hints: ContextHints,
    runtime: Option<Handle>,
    autoplay_allowed: AtomicBool,
    resumed: AtomicBool,
    closed: AtomicBool,
    decode_count: AtomicUsize,
    gains: Mutex<Vec<Arc<HeadlessGain>>>,
    media_durations: Mutex<HashMap<String, f64>>,
}

impl HeadlessContext {
    pub fn new(hints: ContextHints) -> Self {
        Self {
            shared: Arc::new(HeadlessShared {
                clock: Clock { origin: Instant::now() },
                hints,
                runtime: Handle::try_current().ok(),
                autoplay_allowed: AtomicBool::new(true),
                resumed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                decode_count: AtomicUsize::new(0),
                gains: Mutex::new(Vec::new()),
                media_durations: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Simulate the platform autoplay policy: when false, every start is refused
    pub fn set_autoplay_allowed(&self, allowed: bool) {
        self.shared.autoplay_allowed.store(allowed, Ordering::SeqCst);
    }

    /// Give a streamed locator a finite length (seconds)
    pub fn set_media_duration(&self, locator: &str, seconds: f64) {
        self.shared
            .media_durations
            .lock()
            .insert(locator.to_string(), seconds.max(0.0));
    }

    /// Every gain stage created so far, in creation order
    pub fn gains(&self) -> Vec<Arc<HeadlessGain>> {
        self.shared.gains.lock().clone()
    }

    /// Most recently created gain stage with this label
    pub fn gain(&self, label: &str) -> Option<Arc<HeadlessGain>> {
        self.shared
            .gains
            .lock()
            .iter()
            .rev()
            .find(|g| g.label == label)
            .cloned()
    }

    pub fn decode_count(&self) -> usize {
        self.shared.decode_count.load(Ordering::SeqCst)
    }

    pub fn is_resumed(&self) -> bool {
        self.shared.resumed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Engine("headless context is closed".to_string()));
        }
        Ok(())
    }
}

impl Default for HeadlessContext {
    fn default() -> Self {
        Self::new(ContextHints::default())
    }
}

#[async_trait]
impl AudioContext for HeadlessContext {
    fn now(&self) -> f64 {
        self.shared.clock.now()
    }

    fn sample_rate(&self) -> u32 {
        self.shared.hints.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    fn create_gain(&self, label: &str) -> Arc<dyn GainStage> {
        let gain = Arc::new(HeadlessGain::new(label, self.shared.clock));
        self.shared.gains.lock().push(Arc::clone(&gain));
        gain
    }

    fn create_element_source(
        &self,
        locator: &str,
        _output: &Arc<dyn GainStage>,
    ) -> Result<Box<dyn ElementSource>> {
        self.ensure_open()?;
        let media_duration = self.shared.media_durations.lock().get(locator).copied();
        Ok(Box::new(HeadlessElementSource {
            locator: locator.to_string(),
            media_duration,
            timeline: Arc::new(Mutex::new(Timeline::new(self.shared.clock, media_duration))),
            shared: Arc::clone(&self.shared),
            released: AtomicBool::new(false),
        }))
    }

    fn create_buffer_source(
        &self,
        audio: &Arc<DecodedAudio>,
        _output: &Arc<dyn GainStage>,
    ) -> Result<Box<dyn BufferSource>> {
        self.ensure_open()?;
        let buffer_duration = audio.duration();
        Ok(Box::new(HeadlessBufferSource {
            buffer_duration,
            timeline: Arc::new(Mutex::new(Timeline::new(self.shared.clock, Some(buffer_duration)))),
            shared: Arc::clone(&self.shared),
            started: AtomicBool::new(false),
        }))
    }

    async fn decode(&self, bytes: Vec<u8>, hint: Option<String>) -> Result<DecodedAudio> {
        self.ensure_open()?;
        self.shared.decode_count.fetch_add(1, Ordering::SeqCst);
        tokio::task::spawn_blocking(move || decode::decode_bytes(bytes, hint.as_deref()))
            .await
            .map_err(|e| Error::Decode(format!("decoder task failed: {}", e)))?
    }

    async fn resume(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.resumed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        debug!("Headless context closed");
    }
}

// ========================================
// Gain stage
// ========================================

enum Route {
    Detached,
    Destination,
    Stage(Arc<dyn GainStage>),
}

struct GainState {
    base: f32,
    ramp: Option<LinearRamp>,
    route: Route,
    disconnects: usize,
}

/// Gain stage with exact linear automation
pub struct HeadlessGain {
    label: String,
    clock: Clock,
    state: Mutex<GainState>,
}

impl HeadlessGain {
    fn new(label: &str, clock: Clock) -> Self {
        Self {
            label: label.to_string(),
            clock,
            state: Mutex::new(GainState {
                base: 1.0,
                ramp: None,
                route: Route::Detached,
                disconnects: 0,
            }),
        }
    }

    fn value_locked(state: &GainState, now: f64) -> f32 {
        match &state.ramp {
            Some(ramp) => ramp.value_at(now),
            None => state.base,
        }
    }

    /// Number of times `disconnect` was called
    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.state.lock().route, Route::Detached)
    }
}

impl GainStage for HeadlessGain {
    fn label(&self) -> &str {
        &self.label
    }

    fn value(&self) -> f32 {
        let state = self.state.lock();
        Self::value_locked(&state, self.clock.now())
    }

    fn set_value(&self, value: f32) {
        let mut state = self.state.lock();
        state.ramp = None;
        state.base = value;
    }

    fn linear_ramp(&self, from: f32, to: f32, duration: Duration) {
        let mut state = self.state.lock();
        state.ramp = Some(LinearRamp::new(from, to, self.clock.now(), duration.as_secs_f64()));
        state.base = to;
    }

    fn hold(&self) -> f32 {
        let mut state = self.state.lock();
        let value = Self::value_locked(&state, self.clock.now());
        state.ramp = None;
        state.base = value;
        value
    }

    fn connect(&self, destination: Arc<dyn GainStage>) {
        self.state.lock().route = Route::Stage(destination);
    }

    fn connect_to_destination(&self) {
        self.state.lock().route = Route::Destination;
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        state.route = Route::Detached;
        state.disconnects += 1;
    }

    fn output_level(&self) -> f32 {
        let (value, next) = {
            let state = self.state.lock();
            let value = Self::value_locked(&state, self.clock.now());
            match &state.route {
                Route::Detached => return 0.0,
                Route::Destination => (value, None),
                Route::Stage(next) => (value, Some(Arc::clone(next))),
            }
        };
        match next {
            Some(next) => value * next.output_level(),
            None => value,
        }
    }
}

// ========================================
// Source timelines
// ========================================

struct Timeline {
    clock: Clock,
    playing: bool,
    anchor_position: f64,
    anchor_time: f64,
    rate: f64,
    looping: bool,
    loop_start: f64,
    loop_end: Option<f64>,
    end: Option<f64>,
    generation: u64,
    on_ended: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Timeline {
    fn new(clock: Clock, end: Option<f64>) -> Self {
        Self {
            clock,
            playing: false,
            anchor_position: 0.0,
            anchor_time: clock.now(),
            rate: 1.0,
            looping: false,
            loop_start: 0.0,
            loop_end: None,
            end,
            generation: 0,
            on_ended: None,
        }
    }

    fn position(&self) -> f64 {
        if !self.playing {
            return self.anchor_position;
        }
        let raw = self.anchor_position + (self.clock.now() - self.anchor_time) * self.rate;
        if self.looping {
            if let Some(loop_end) = self.loop_end.or(self.end) {
                let span = loop_end - self.loop_start;
                if span > 0.0 && raw >= loop_end {
                    return self.loop_start + (raw - self.loop_start) % span;
                }
            }
            raw
        } else {
            match self.end {
                Some(end) => raw.min(end),
                None => raw,
            }
        }
    }

    fn reanchor(&mut self) {
        self.anchor_position = self.position();
        self.anchor_time = self.clock.now();
    }

    fn remaining(&self) -> Option<Duration> {
        if !self.playing || self.looping {
            return None;
        }
        let end = self.end?;
        let seconds = ((end - self.position()) / self.rate).max(0.0);
        // Unrepresentable deadlines never fire
        Duration::try_from_secs_f64(seconds).ok()
    }
}

/// Invalidate pending end timers and arm a new one if the timeline can end
fn schedule_end(timeline: &Arc<Mutex<Timeline>>, runtime: &Option<Handle>) {
    let (generation, remaining) = {
        let mut t = timeline.lock();
        t.generation += 1;
        (t.generation, t.remaining())
    };
    let (Some(remaining), Some(runtime)) = (remaining, runtime) else {
        return;
    };

    let timeline = Arc::clone(timeline);
    runtime.spawn(async move {
        tokio::time::sleep(remaining).await;
        let callback = {
            let mut t = timeline.lock();
            if t.generation != generation || !t.playing {
                return;
            }
            t.anchor_position = t.end.unwrap_or(t.anchor_position);
            t.anchor_time = t.clock.now();
            t.playing = false;
            t.on_ended.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    });
}

struct HeadlessElementSource {
    locator: String,
    media_duration: Option<f64>,
    timeline: Arc<Mutex<Timeline>>,
    shared: Arc<HeadlessShared>,
    released: AtomicBool,
}

impl HeadlessElementSource {
    fn update(&self, f: impl FnOnce(&mut Timeline)) {
        {
            let mut t = self.timeline.lock();
            t.reanchor();
            f(&mut t);
        }
        schedule_end(&self.timeline, &self.shared.runtime);
    }
}

impl ElementSource for HeadlessElementSource {
    fn play(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(Error::Engine(format!("element source for {} was released", self.locator)));
        }
        if !self.shared.autoplay_allowed.load(Ordering::SeqCst) {
            return Err(Error::PlaybackRejected(format!(
                "autoplay refused for {}",
                self.locator
            )));
        }
        {
            let mut t = self.timeline.lock();
            if t.playing {
                return Ok(());
            }
            if let Some(end) = t.end {
                if !t.looping && t.anchor_position >= end {
                    t.anchor_position = 0.0;
                }
            }
            t.anchor_time = t.clock.now();
            t.playing = true;
        }
        schedule_end(&self.timeline, &self.shared.runtime);
        Ok(())
    }

    fn pause(&self) {
        self.update(|t| t.playing = false);
    }

    fn current_time(&self) -> f64 {
        self.timeline.lock().position()
    }

    fn set_current_time(&self, seconds: f64) {
        self.update(|t| {
            let seconds = seconds.max(0.0);
            t.anchor_position = match t.end {
                Some(end) => seconds.min(end),
                None => seconds,
            };
        });
    }

    fn set_playback_rate(&self, rate: f32) {
        self.update(|t| t.rate = f64::from(rate.max(f32::EPSILON)));
    }

    fn set_looping(&self, looping: bool) {
        self.update(|t| t.looping = looping);
    }

    fn set_end_time(&self, end: Option<f64>) {
        let media_duration = self.media_duration;
        self.update(|t| {
            t.end = match (media_duration, end) {
                (Some(duration), Some(end)) => Some(duration.min(end)),
                (duration, end) => end.or(duration),
            };
        });
    }

    fn set_on_ended(&self, callback: EndedCallback) {
        self.timeline.lock().on_ended = Some(Arc::from(callback));
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.update(|t| {
            t.playing = false;
            t.on_ended = None;
        });
    }
}

struct HeadlessBufferSource {
    buffer_duration: f64,
    timeline: Arc<Mutex<Timeline>>,
    shared: Arc<HeadlessShared>,
    started: AtomicBool,
}

impl HeadlessBufferSource {
    fn update(&self, f: impl FnOnce(&mut Timeline)) {
        {
            let mut t = self.timeline.lock();
            t.reanchor();
            f(&mut t);
        }
        schedule_end(&self.timeline, &self.shared.runtime);
    }
}

impl BufferSource for HeadlessBufferSource {
    fn start(&self, offset: f64, duration: Option<f64>) -> Result<()> {
        if !self.shared.autoplay_allowed.load(Ordering::SeqCst) {
            return Err(Error::PlaybackRejected("buffer playback refused".to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Engine("buffer source can only be started once".to_string()));
        }
        let buffer_duration = self.buffer_duration;
        {
            let mut t = self.timeline.lock();
            let offset = offset.clamp(0.0, buffer_duration);
            t.anchor_position = offset;
            t.anchor_time = t.clock.now();
            t.end = Some(match duration {
                Some(duration) if !t.looping => (offset + duration).min(buffer_duration),
                _ => buffer_duration,
            });
            t.playing = true;
        }
        schedule_end(&self.timeline, &self.shared.runtime);
        Ok(())
    }

    fn stop(&self) {
        self.update(|t| {
            t.playing = false;
            t.on_ended = None;
        });
    }

    fn set_playback_rate(&self, rate: f32) {
        self.update(|t| t.rate = f64::from(rate.max(f32::EPSILON)));
    }

    fn set_loop(&self, looping: bool, loop_start: f64, loop_end: Option<f64>) {
        self.update(|t| {
            t.looping = looping;
            t.loop_start = loop_start.max(0.0);
            t.loop_end = loop_end;
        });
    }

    fn set_on_ended(&self, callback: EndedCallback) {
        self.timeline.lock().on_ended = Some(Arc::from(callback));
    }

    fn disconnect(&self) {
        self.stop();
    }
}
