//! Playback tokens
//!
//! A `PlaybackToken` is one playing instance. It owns a source controller, a
//! gain stage routed into its channel's output, at most one active fade, and
//! (in `full` mode) a cache lease.
//!
//! # State machine
//!
//! ```text
//!            pause()             stop() / natural end
//! Playing ──────────> Paused ──────────────────────────> Stopped | Ended
//!    ^                  │
//!    └──── resume() ────┘
//! ```
//!
//! `Stopped` and `Ended` are terminal. Every mutating call on a terminal
//! token returns `Error::UseAfterTeardown`; read-only queries stay valid.
//!
//! # Deferred stop
//!
//! `stop` with a fade duration starts a fade to zero and marks it as the stop
//! fade. Whenever the stop fade settles (natural completion, fast-forward by
//! mute, cancellation by `set_volume`/`fade`/`cancel`), the token performs its
//! terminal stop right there. A second faded `stop` replaces the pending stop
//! fade without stopping early.
//!
//! # Locking
//!
//! The inner state is locked for short, non-suspending sections only. Events,
//! the channel detach hook and the cache lease release all run after the lock
//! is dropped.

use crate::cache::CacheLease;
use crate::engine::{AudioContext, DecodedAudio, GainStage};
use crate::events::{EventEmitter, EventKind, ListenerId, TokenEvent};
use crate::fade::{FadeOperation, FadeState};
use crate::source::{
    BufferController, ElementController, EndNotifier, PlaybackWindow, SourceController, SourceKind,
};
use crate::{Error, Result};
use mixdeck_common::{clamp_unit, LoadMode, PlayOptions, StopOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

/// Lowest accepted playback rate
pub const MIN_PLAYBACK_RATE: f32 = 0.0625;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Playback state of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    /// Terminal: reached through `stop`
    Stopped,
    /// Terminal: reached through natural completion
    Ended,
}

impl PlaybackState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlaybackState::Stopped | PlaybackState::Ended)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
            PlaybackState::Stopped => write!(f, "stopped"),
            PlaybackState::Ended => write!(f, "ended"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(u64);

impl TokenId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token-{}", self.0)
    }
}

/// Invoked once when the token reaches a terminal state
pub(crate) type DetachHook = Box<dyn FnOnce(TokenId) + Send>;

/// Everything needed to build and start a token
pub(crate) struct TokenConfig {
    pub locator: String,
    /// Already normalized
    pub options: PlayOptions,
    /// Resolved mode, never `Auto`
    pub load_mode: LoadMode,
    /// Decoded payload and its lease for `full` mode
    pub audio: Option<(Arc<DecodedAudio>, CacheLease)>,
    pub context: Arc<dyn AudioContext>,
    /// Output stage of the owning channel
    pub channel_output: Arc<dyn GainStage>,
    pub runtime: Handle,
    pub silent: bool,
    pub detach: DetachHook,
}

/// Handle to one playing instance
#[derive(Clone)]
pub struct PlaybackToken {
    shared: Arc<TokenShared>,
}

pub(crate) struct TokenShared {
    id: TokenId,
    me: Weak<TokenShared>,
    locator: String,
    load_mode: LoadMode,
    kind: SourceKind,
    runtime: Handle,
    silent: bool,
    output: Arc<dyn GainStage>,
    next_fade_id: AtomicU64,
    events: EventEmitter,
    inner: Mutex<TokenInner>,
}

struct TokenInner {
    state: PlaybackState,
    /// Logical volume; unchanged by mute and by fades until they finish
    volume: f32,
    muted: bool,
    rate: f32,
    source: Box<dyn SourceController>,
    fade: Option<FadeOperation>,
    /// Id of the fade whose settlement stops the token
    stop_fade: Option<u64>,
    lease: Option<CacheLease>,
    detach: Option<DetachHook>,
}

impl TokenInner {
    fn ensure_live(&self, id: TokenId, operation: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::UseAfterTeardown(format!(
                "{} on {} {}",
                operation, self.state, id
            )));
        }
        Ok(())
    }
}

impl PlaybackToken {
    /// Build the source and gain stage and start playing
    ///
    /// On failure every resource created so far is released, including the
    /// cache lease.
    pub(crate) fn start(config: TokenConfig) -> Result<Self> {
        let TokenConfig {
            locator,
            options,
            load_mode,
            audio,
            context,
            channel_output,
            runtime,
            silent,
            detach,
        } = config;

        let id = TokenId(NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed));
        let output = context.create_gain(&format!("token:{}", id.0));
        output.set_value(options.volume);
        output.connect(channel_output);

        let slot: Arc<OnceLock<Weak<TokenShared>>> = Arc::new(OnceLock::new());
        let notifier: EndNotifier = {
            let slot = Arc::clone(&slot);
            Arc::new(move |generation| {
                if let Some(shared) = slot.get().and_then(Weak::upgrade) {
                    shared.terminate(PlaybackState::Ended, Some(generation));
                }
            })
        };

        let window = PlaybackWindow {
            start: options.start_time,
            end: options.end_time,
        };
        let (source, lease): (Box<dyn SourceController>, Option<CacheLease>) = match audio {
            Some((audio, lease)) => {
                let controller = BufferController::new(
                    Arc::clone(&context),
                    audio,
                    Arc::clone(&output),
                    window,
                    options.rate,
                    options.looping,
                    notifier,
                );
                (Box::new(controller) as Box<dyn SourceController>, Some(lease))
            }
            None => {
                match ElementController::new(
                    context.as_ref(),
                    &locator,
                    &output,
                    window,
                    options.rate,
                    options.looping,
                    notifier,
                ) {
                    Ok(controller) => (Box::new(controller) as Box<dyn SourceController>, None),
                    Err(e) => {
                        output.disconnect();
                        return Err(e);
                    }
                }
            }
        };

        let kind = source.kind();
        let shared = Arc::new_cyclic(|me| TokenShared {
            id,
            me: me.clone(),
            locator,
            load_mode,
            kind,
            runtime,
            silent,
            output,
            next_fade_id: AtomicU64::new(1),
            events: EventEmitter::new(),
            inner: Mutex::new(TokenInner {
                state: PlaybackState::Playing,
                volume: options.volume,
                muted: false,
                rate: options.rate,
                source,
                fade: None,
                stop_fade: None,
                lease,
                detach: Some(detach),
            }),
        });
        let _ = slot.set(Arc::downgrade(&shared));

        let started = shared.inner.lock().source.start();
        if let Err(e) = started {
            let lease = {
                let mut inner = shared.inner.lock();
                inner.state = PlaybackState::Stopped;
                inner.source.release();
                inner.detach = None;
                inner.lease.take()
            };
            shared.output.disconnect();
            drop(lease);
            diag!(silent, warn, "{} failed to start {}: {}", id, shared.locator, e);
            return Err(e);
        }

        diag!(
            silent,
            debug,
            "{} playing {} ({:?}, {} mode)",
            id,
            shared.locator,
            kind,
            load_mode
        );
        Ok(Self { shared })
    }

    pub fn id(&self) -> TokenId {
        self.shared.id
    }

    pub fn locator(&self) -> &str {
        &self.shared.locator
    }

    /// Resolved load mode (`Stream` or `Full`)
    pub fn load_mode(&self) -> LoadMode {
        self.shared.load_mode
    }

    pub fn source_kind(&self) -> SourceKind {
        self.shared.kind
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.inner.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Logical volume (pre-fade value while a fade is running)
    pub fn volume(&self) -> f32 {
        self.shared.inner.lock().volume
    }

    pub fn is_muted(&self) -> bool {
        self.shared.inner.lock().muted
    }

    pub fn rate(&self) -> f32 {
        self.shared.inner.lock().rate
    }

    /// Media position in seconds
    pub fn position(&self) -> f64 {
        self.shared.inner.lock().source.position()
    }

    /// Gain currently applied by this token's own stage
    pub fn output_gain(&self) -> f32 {
        self.shared.output.value()
    }

    /// Level this token contributes at the destination
    pub fn effective_volume(&self) -> f32 {
        self.shared.output.output_level()
    }

    pub fn active_fade(&self) -> Option<FadeOperation> {
        self.shared.inner.lock().fade.clone()
    }

    /// Whether a faded stop is in progress
    pub fn has_pending_stop(&self) -> bool {
        self.shared.inner.lock().stop_fade.is_some()
    }

    /// Pause playback; no-op unless playing
    pub fn pause(&self) -> Result<()> {
        let position = {
            let mut inner = self.shared.inner.lock();
            inner.ensure_live(self.shared.id, "pause")?;
            if inner.state != PlaybackState::Playing {
                return Ok(());
            }
            inner.source.pause();
            inner.state = PlaybackState::Paused;
            inner.source.position()
        };

        diag!(self.shared.silent, debug, "{} paused at {:.3}s", self.shared.id, position);
        self.shared.events.emit(&TokenEvent::Pause { position });
        Ok(())
    }

    /// Resume playback; no-op unless paused
    ///
    /// If the engine refuses to start, the token stays paused and
    /// `Error::PlaybackRejected` is returned.
    pub fn resume(&self) -> Result<()> {
        let resumed = {
            let mut inner = self.shared.inner.lock();
            inner.ensure_live(self.shared.id, "resume")?;
            if inner.state != PlaybackState::Paused {
                return Ok(());
            }
            match inner.source.resume() {
                Ok(()) => {
                    inner.state = PlaybackState::Playing;
                    Ok(inner.source.position())
                }
                Err(e) => Err(e),
            }
        };

        match resumed {
            Ok(position) => {
                diag!(self.shared.silent, debug, "{} resumed at {:.3}s", self.shared.id, position);
                self.shared.events.emit(&TokenEvent::Resume { position });
                Ok(())
            }
            Err(e) => {
                diag!(self.shared.silent, warn, "{} resume refused: {}", self.shared.id, e);
                Err(match e {
                    Error::PlaybackRejected(reason) => Error::PlaybackRejected(reason),
                    other => Error::PlaybackRejected(other.to_string()),
                })
            }
        }
    }

    /// Stop immediately, or fade to zero and then stop
    pub fn stop(&self, options: StopOptions) -> Result<()> {
        if options.fade_duration_ms == 0 {
            if !self.shared.terminate(PlaybackState::Stopped, None) {
                return Err(Error::UseAfterTeardown(format!(
                    "stop on terminal {}",
                    self.shared.id
                )));
            }
            return Ok(());
        }

        let duration = Duration::from_millis(options.fade_duration_ms);
        let mut inner = self.shared.inner.lock();
        inner.ensure_live(self.shared.id, "stop")?;

        // Replacing a pending stop fade must not stop early
        inner.stop_fade = None;
        self.shared.settle_active_locked(&mut inner, FadeState::Cancelled);

        let from = self.shared.output.value();
        let fade = self.shared.begin_fade_locked(&mut inner, from, 0.0, duration);
        inner.stop_fade = Some(fade.id());
        drop(inner);

        diag!(
            self.shared.silent,
            debug,
            "{} stopping after {}ms fade",
            self.shared.id,
            options.fade_duration_ms
        );
        Ok(())
    }

    /// Move the playback position
    pub fn seek(&self, seconds: f64) -> Result<()> {
        let target = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        let position = {
            let mut inner = self.shared.inner.lock();
            inner.ensure_live(self.shared.id, "seek")?;
            let playing = inner.state == PlaybackState::Playing;
            match inner.source.seek(target, playing) {
                Ok(true) => inner.source.position(),
                Ok(false) => return Ok(()),
                Err(e) => {
                    // The old primitive is gone; keep the new position for resume
                    if playing {
                        inner.state = PlaybackState::Paused;
                    }
                    return Err(e);
                }
            }
        };

        self.shared.events.emit(&TokenEvent::Seek { position });
        Ok(())
    }

    /// Change playback speed; clamped to `MIN_PLAYBACK_RATE`
    pub fn set_rate(&self, rate: f32) -> Result<()> {
        let rate = if rate.is_finite() {
            rate.max(MIN_PLAYBACK_RATE)
        } else {
            1.0
        };
        let mut inner = self.shared.inner.lock();
        inner.ensure_live(self.shared.id, "set_rate")?;
        inner.source.set_rate(rate);
        inner.rate = rate;
        Ok(())
    }

    /// Set the logical volume, cancelling any active fade
    ///
    /// A pending faded stop is abandoned in favor of an immediate stop.
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        let volume = clamp_unit(volume);
        let stopping = {
            let mut inner = self.shared.inner.lock();
            inner.ensure_live(self.shared.id, "set_volume")?;
            let stopping = self.shared.settle_active_locked(&mut inner, FadeState::Cancelled);
            inner.volume = volume;
            if !inner.muted {
                self.shared.output.set_value(volume);
            }
            stopping
        };

        if stopping {
            self.shared.terminate(PlaybackState::Stopped, None);
        }
        Ok(())
    }

    pub fn mute(&self) -> Result<()> {
        self.set_muted(true)
    }

    pub fn unmute(&self) -> Result<()> {
        self.set_muted(false)
    }

    /// Mute or unmute, fast-forwarding any active fade to its target first
    pub fn set_muted(&self, muted: bool) -> Result<()> {
        let stopping = {
            let mut inner = self.shared.inner.lock();
            inner.ensure_live(self.shared.id, if muted { "mute" } else { "unmute" })?;
            let stopping = self.shared.settle_active_locked(&mut inner, FadeState::Finished);
            inner.muted = muted;
            let gain = if muted { 0.0 } else { inner.volume };
            self.shared.output.set_value(gain);
            stopping
        };

        if stopping {
            self.shared.terminate(PlaybackState::Stopped, None);
        }
        Ok(())
    }

    /// Ramp linearly from `from` to `to` over `duration_ms`
    ///
    /// Any previous fade is cancelled first. A zero duration applies `to`
    /// at once and returns an already finished operation. Superseding a
    /// pending faded stop stops the token and returns
    /// `Error::UseAfterTeardown`.
    pub fn fade(&self, from: f32, to: f32, duration_ms: u64) -> Result<FadeOperation> {
        let from = clamp_unit(from);
        let to = clamp_unit(to);

        let fade = {
            let mut inner = self.shared.inner.lock();
            inner.ensure_live(self.shared.id, "fade")?;
            let stopping = self.shared.settle_active_locked(&mut inner, FadeState::Cancelled);
            if stopping {
                None
            } else if duration_ms == 0 {
                inner.volume = to;
                if !inner.muted {
                    self.shared.output.set_value(to);
                }
                let id = self.shared.next_fade_id.fetch_add(1, Ordering::Relaxed);
                Some(FadeOperation::finished(id, to, self.shared.me.clone()))
            } else {
                let duration = Duration::from_millis(duration_ms);
                Some(self.shared.begin_fade_locked(&mut inner, from, to, duration))
            }
        };

        match fade {
            Some(fade) => Ok(fade),
            None => {
                self.shared.terminate(PlaybackState::Stopped, None);
                Err(Error::UseAfterTeardown(format!(
                    "{} stopped: fade superseded its pending stop",
                    self.shared.id
                )))
            }
        }
    }

    /// Register a persistent event listener
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TokenEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, listener)
    }

    /// Register a listener that runs at most once
    pub fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TokenEvent) + Send + Sync + 'static,
    {
        self.shared.events.once(kind, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.events.off(id)
    }
}

impl PartialEq for PlaybackToken {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for PlaybackToken {}

impl fmt::Debug for PlaybackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackToken")
            .field("id", &self.shared.id)
            .field("locator", &self.shared.locator)
            .field("state", &self.state())
            .finish()
    }
}

impl TokenShared {
    /// Detach the active fade, apply `outcome` to the gain and settle it
    ///
    /// Returns whether the settled fade was the stop fade.
    fn settle_active_locked(&self, inner: &mut TokenInner, outcome: FadeState) -> bool {
        let Some(fade) = inner.fade.take() else {
            return false;
        };

        match outcome {
            FadeState::Finished => {
                inner.volume = fade.target();
                if !inner.muted {
                    self.output.set_value(fade.target());
                }
            }
            _ => {
                if !inner.muted {
                    self.output.hold();
                }
            }
        }
        fade.settle(outcome);

        let was_stop = inner.stop_fade == Some(fade.id());
        if was_stop {
            inner.stop_fade = None;
        }
        was_stop
    }

    fn begin_fade_locked(
        &self,
        inner: &mut TokenInner,
        from: f32,
        to: f32,
        duration: Duration,
    ) -> FadeOperation {
        let id = self.next_fade_id.fetch_add(1, Ordering::Relaxed);
        let fade = FadeOperation::running(id, from, to, duration, self.me.clone());
        if !inner.muted {
            self.output.linear_ramp(from, to, duration);
        }
        inner.fade = Some(fade.clone());

        let timer = fade.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            timer.finish();
        });
        fade
    }

    /// Settle `fade` through the token if it is still the active one
    pub(crate) fn settle_fade(&self, fade: &FadeOperation, outcome: FadeState) -> bool {
        let stopping = {
            let mut inner = self.inner.lock();
            match &inner.fade {
                Some(active) if active.same(fade) => {
                    Some(self.settle_active_locked(&mut inner, outcome))
                }
                _ => None,
            }
        };

        match stopping {
            Some(stopping) => {
                if stopping {
                    self.terminate(PlaybackState::Stopped, None);
                }
                true
            }
            None => fade.settle(outcome),
        }
    }

    /// Enter a terminal state exactly once
    ///
    /// `generation` is set for natural-end notifications, which are ignored
    /// unless playing and produced by the current source primitive.
    fn terminate(&self, outcome: PlaybackState, generation: Option<u64>) -> bool {
        let (fade, detach, lease) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            if let Some(generation) = generation {
                if inner.state != PlaybackState::Playing || !inner.source.is_current(generation) {
                    return false;
                }
            }
            inner.state = outcome;
            inner.source.release();
            inner.stop_fade = None;
            (inner.fade.take(), inner.detach.take(), inner.lease.take())
        };

        if let Some(fade) = fade {
            fade.settle(FadeState::Cancelled);
        }
        self.output.disconnect();
        if let Some(detach) = detach {
            detach(self.id);
        }
        drop(lease);

        diag!(self.silent, debug, "{} {}", self.id, outcome);
        let event = match outcome {
            PlaybackState::Ended => TokenEvent::Ended,
            _ => TokenEvent::Stop,
        };
        self.events.emit(&event);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HeadlessContext;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        ctx: Arc<HeadlessContext>,
        channel: Arc<dyn GainStage>,
        detached: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            let ctx = Arc::new(HeadlessContext::default());
            let channel = ctx.create_gain("channel:test");
            channel.connect_to_destination();
            Self {
                ctx,
                channel,
                detached: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn config(&self, locator: &str, audio: Option<(Arc<DecodedAudio>, CacheLease)>) -> TokenConfig {
            let detached = Arc::clone(&self.detached);
            TokenConfig {
                locator: locator.to_string(),
                options: PlayOptions::default().normalized(MIN_PLAYBACK_RATE),
                load_mode: if audio.is_some() { LoadMode::Full } else { LoadMode::Stream },
                audio,
                context: self.ctx.clone(),
                channel_output: Arc::clone(&self.channel),
                runtime: Handle::current(),
                silent: true,
                detach: Box::new(move |_| {
                    detached.fetch_add(1, Ordering::SeqCst);
                }),
            }
        }

        fn stream(&self, locator: &str) -> PlaybackToken {
            PlaybackToken::start(self.config(locator, None)).unwrap()
        }
    }

    fn counter(token: &PlaybackToken, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        token.on(kind, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_events() {
        let fx = Fixture::new();
        let token = fx.stream("music.ogg");
        let pauses = counter(&token, EventKind::Pause);
        let resumes = counter(&token, EventKind::Resume);

        token.pause().unwrap();
        token.pause().unwrap();
        assert_eq!(token.state(), PlaybackState::Paused);
        token.resume().unwrap();
        token.resume().unwrap();
        assert_eq!(token.state(), PlaybackState::Playing);

        assert_eq!(pauses.load(Ordering::SeqCst), 1);
        assert_eq!(resumes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_refused_rolls_back() {
        let fx = Fixture::new();
        let token = fx.stream("music.ogg");
        token.pause().unwrap();

        fx.ctx.set_autoplay_allowed(false);
        assert!(matches!(token.resume(), Err(Error::PlaybackRejected(_))));
        assert_eq!(token.state(), PlaybackState::Paused);

        fx.ctx.set_autoplay_allowed(true);
        token.resume().unwrap();
        assert_eq!(token.state(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_length_fade_is_finished() {
        let fx = Fixture::new();
        let token = fx.stream("music.ogg");
        let fade = token.fade(1.0, 0.35, 0).unwrap();

        assert_eq!(fade.state(), FadeState::Finished);
        assert_eq!(token.volume(), 0.35);
        assert!(token.active_fade().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_updates_only_when_fade_completes() {
        let fx = Fixture::new();
        let token = fx.stream("music.ogg");
        let fade = token.fade(1.0, 0.2, 1000).unwrap();

        sleep_ms(500).await;
        assert_eq!(token.volume(), 1.0);
        assert!((token.output_gain() - 0.6).abs() < 1e-3);

        assert_eq!(fade.wait().await, FadeState::Finished);
        assert_eq!(token.volume(), 0.2);
        assert!((token.output_gain() - 0.2).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_holds_current_gain() {
        let fx = Fixture::new();
        let token = fx.stream("music.ogg");
        let fade = token.fade(1.0, 0.0, 1000).unwrap();

        sleep_ms(250).await;
        assert!(fade.cancel());
        assert!(!fade.cancel());
        assert_eq!(fade.state(), FadeState::Cancelled);

        sleep_ms(1000).await;
        assert!((token.output_gain() - 0.75).abs() < 1e-3);
        assert_eq!(token.volume(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_fade_supersedes_first() {
        let fx = Fixture::new();
        let token = fx.stream("music.ogg");
        let first = token.fade(1.0, 0.0, 1000).unwrap();
        let second = token.fade(0.5, 1.0, 1000).unwrap();

        assert_eq!(first.wait().await, FadeState::Cancelled);
        assert!(second.is_running());
        assert!(token.active_fade().unwrap().same(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_fast_forwards_fade() {
        let fx = Fixture::new();
        let token = fx.stream("music.ogg");
        let fade = token.fade(1.0, 0.4, 1000).unwrap();

        sleep_ms(300).await;
        token.mute().unwrap();
        assert_eq!(fade.state(), FadeState::Finished);
        assert_eq!(token.volume(), 0.4);
        assert_eq!(token.output_gain(), 0.0);

        token.unmute().unwrap();
        assert_eq!(token.output_gain(), 0.4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faded_stop_is_deferred() {
        let fx = Fixture::new();
        let token = fx.stream("music.ogg");
        let stops = counter(&token, EventKind::Stop);

        token.stop(StopOptions::fade(500)).unwrap();
        assert_eq!(token.state(), PlaybackState::Playing);
        assert!(token.has_pending_stop());

        sleep_ms(200).await;
        token.set_rate(1.5).unwrap();
        token.seek(3.0).unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 0);

        sleep_ms(400).await;
        assert_eq!(token.state(), PlaybackState::Stopped);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(fx.detached.load(Ordering::SeqCst), 1);
        assert!(matches!(token.seek(1.0), Err(Error::UseAfterTeardown(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_volume_during_faded_stop_stops_now() {
        let fx = Fixture::new();
        let token = fx.stream("music.ogg");
        let stops = counter(&token, EventKind::Stop);

        token.stop(StopOptions::fade(1000)).unwrap();
        sleep_ms(100).await;
        token.set_volume(0.8).unwrap();

        assert_eq!(token.state(), PlaybackState::Stopped);
        sleep_ms(2000).await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_faded_stop_replaces_first() {
        let fx = Fixture::new();
        let token = fx.stream("music.ogg");

        token.stop(StopOptions::fade(300)).unwrap();
        sleep_ms(100).await;
        token.stop(StopOptions::fade(1000)).unwrap();

        sleep_ms(500).await;
        assert_eq!(token.state(), PlaybackState::Playing);

        sleep_ms(700).await;
        assert_eq!(token.state(), PlaybackState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_natural_end_releases_lease_once() {
        let fx = Fixture::new();
        let ctx: Arc<dyn AudioContext> = fx.ctx.clone();
        let cache = crate::cache::DecodedAudioCache::new(
            ctx,
            Arc::new(crate::transport::DefaultTransport::new()),
            Handle::current(),
            true,
        );
        let audio = Arc::new(DecodedAudio::new(1000, 1, vec![0.0; 1000]));
        let entry = cache.insert_decoded("beep.wav", Arc::clone(&audio));
        let token = PlaybackToken::start(fx.config("beep.wav", Some((audio, entry.acquire())))).unwrap();
        let ends = counter(&token, EventKind::Ended);
        assert_eq!(entry.ref_count(), 1);

        sleep_ms(1100).await;
        assert_eq!(token.state(), PlaybackState::Ended);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert_eq!(entry.ref_count(), 0);
        assert_eq!(fx.detached.load(Ordering::SeqCst), 1);
        assert!(token.stop(StopOptions::immediate()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_token_does_not_end() {
        let fx = Fixture::new();
        fx.ctx.set_media_duration("short.ogg", 1.0);
        let token = fx.stream("short.ogg");

        sleep_ms(500).await;
        token.pause().unwrap();
        sleep_ms(2000).await;
        assert_eq!(token.state(), PlaybackState::Paused);

        token.resume().unwrap();
        sleep_ms(600).await;
        assert_eq!(token.state(), PlaybackState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_floor() {
        let fx = Fixture::new();
        let token = fx.stream("music.ogg");
        token.set_rate(0.0).unwrap();
        assert_eq!(token.rate(), MIN_PLAYBACK_RATE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_refused_releases_resources() {
        let fx = Fixture::new();
        fx.ctx.set_autoplay_allowed(false);
        let result = PlaybackToken::start(fx.config("music.ogg", None));

        assert!(matches!(result, Err(Error::PlaybackRejected(_))));
        let gain = fx.ctx.gains().into_iter().last().unwrap();
        assert!(!gain.is_connected());
        assert_eq!(fx.detached.load(Ordering::SeqCst), 0);
    }
}
