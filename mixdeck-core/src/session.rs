//! Audio session
//!
//! The session is the per-instance root: it owns the root channel, the
//! decoded-audio cache and the channel registry with its ceiling (root
//! included). Destroying it tears down the whole channel tree, closes the
//! cache and closes the engine context; it happens exactly once.
//!
//! `SessionCore` is the part every channel shares. It never owns channels,
//! so the ownership graph stays acyclic: Session -> Channel -> {Channel, Token}.

use crate::cache::{CachedAudio, DecodedAudioCache};
use crate::channel::{Channel, ChannelId};
use crate::engine::{AudioContext, ContextHints, HeadlessContext};
use crate::token::PlaybackToken;
use crate::transport::{DefaultTransport, Transport};
use crate::{Error, Result};
use mixdeck_common::{AudioConfig, ChannelLayout, ChannelOptions, PlayOptions, SessionOptions};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Handle;

/// State shared by every channel of one session
pub(crate) struct SessionCore {
    options: SessionOptions,
    context: Arc<dyn AudioContext>,
    transport: Arc<dyn Transport>,
    cache: DecodedAudioCache,
    runtime: Handle,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    destroyed: bool,
    channels: HashSet<ChannelId>,
}

impl SessionCore {
    pub fn silent(&self) -> bool {
        self.options.silent
    }

    pub fn context(&self) -> &Arc<dyn AudioContext> {
        &self.context
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn cache(&self) -> &DecodedAudioCache {
        &self.cache
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn ensure_alive(&self) -> Result<()> {
        if self.registry.lock().destroyed {
            return Err(Error::UseAfterTeardown("session was destroyed".to_string()));
        }
        Ok(())
    }

    /// Reserve a slot under the channel ceiling
    pub fn register_channel(&self, id: ChannelId) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.destroyed {
            return Err(Error::UseAfterTeardown("session was destroyed".to_string()));
        }
        if registry.channels.len() >= self.options.max_channels {
            return Err(Error::LimitExceeded {
                limit: self.options.max_channels,
            });
        }
        registry.channels.insert(id);
        Ok(())
    }

    pub fn unregister_channel(&self, id: ChannelId) {
        self.registry.lock().channels.remove(&id);
    }

    fn channel_count(&self) -> usize {
        self.registry.lock().channels.len()
    }
}

/// Root of one audio session
pub struct Session {
    core: Arc<SessionCore>,
    root: Channel,
}

impl Session {
    /// Create a session on the current tokio runtime
    ///
    /// The context should honor the latency and sample-rate hints of
    /// `options`; build it from `ContextHints::from(&options)`.
    pub fn new(
        options: SessionOptions,
        context: Arc<dyn AudioContext>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Engine(format!("a tokio runtime is required: {}", e)))?;
        let options = options.normalized();

        let cache = DecodedAudioCache::new(
            Arc::clone(&context),
            Arc::clone(&transport),
            runtime.clone(),
            options.silent,
        );
        let core = Arc::new(SessionCore {
            options: options.clone(),
            context,
            transport,
            cache,
            runtime,
            registry: Mutex::new(Registry::default()),
        });
        let root = Channel::root(Arc::clone(&core), options.volume)?;

        diag!(
            options.silent,
            info,
            "Audio session created (volume {:.2}, max {} channels, {:?} latency)",
            options.volume,
            options.max_channels,
            options.latency_hint
        );
        Ok(Self { core, root })
    }

    /// Create a session that fetches over HTTP or from the filesystem
    pub fn with_context(options: SessionOptions, context: Arc<dyn AudioContext>) -> Result<Self> {
        Self::new(options, context, Arc::new(DefaultTransport::new()))
    }

    /// Create a session over a headless engine tuned by the session hints
    pub fn headless(options: SessionOptions) -> Result<Self> {
        let context = Arc::new(HeadlessContext::new(ContextHints::from(&options)));
        Self::with_context(options, context)
    }

    /// Create a session and its declared channel layout
    pub fn from_config(
        config: &AudioConfig,
        context: Arc<dyn AudioContext>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let config = config.clone().validated()?;
        let session = Self::new(config.session.clone(), context, transport)?;
        for layout in &config.channels {
            build_layout(&session.root, layout)?;
        }
        Ok(session)
    }

    /// Resume the engine context (user-gesture unlock)
    pub async fn ready(&self) -> Result<()> {
        self.core.ensure_alive()?;
        self.core.context.resume().await?;
        // Destroyed while the context was resuming
        self.core.ensure_alive()
    }

    /// Tear down every channel and token, close the cache and the context
    pub fn destroy(&self) -> Result<()> {
        {
            let mut registry = self.core.registry.lock();
            if registry.destroyed {
                return Err(Error::UseAfterTeardown("session already destroyed".to_string()));
            }
            registry.destroyed = true;
        }

        self.root.teardown();
        self.core.cache.close();
        self.core.context.close();

        diag!(self.core.silent(), info, "Audio session destroyed");
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.registry.lock().destroyed
    }

    pub fn options(&self) -> &SessionOptions {
        &self.core.options
    }

    pub fn context(&self) -> &Arc<dyn AudioContext> {
        &self.core.context
    }

    pub fn root(&self) -> &Channel {
        &self.root
    }

    pub fn create_channel(&self, name: &str, options: ChannelOptions) -> Result<Channel> {
        self.root.create_channel(name, options)
    }

    pub fn channel(&self, name: &str) -> Result<Option<Channel>> {
        self.root.channel(name)
    }

    pub fn channels(&self) -> Result<Vec<Channel>> {
        self.root.channels()
    }

    /// Channel by `/`-separated path below the root
    pub fn find(&self, path: &str) -> Result<Option<Channel>> {
        self.root.find(path)
    }

    /// Play on the root channel
    pub async fn play(&self, locator: &str, options: PlayOptions) -> Result<PlaybackToken> {
        self.root.play(locator, options).await
    }

    /// Master volume
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.root.set_volume(volume)
    }

    pub fn volume(&self) -> f32 {
        self.root.volume()
    }

    pub fn mute(&self) -> Result<()> {
        self.root.mute()
    }

    pub fn unmute(&self) -> Result<()> {
        self.root.unmute()
    }

    pub fn is_muted(&self) -> bool {
        self.root.is_muted()
    }

    /// Every attached token in the session
    pub fn tokens(&self) -> Result<Vec<PlaybackToken>> {
        self.root.tokens()
    }

    /// Fetch and decode into the cache without playing
    pub async fn load(&self, locator: &str) -> Result<CachedAudio> {
        self.core.ensure_alive()?;
        self.core.cache.load(locator).await
    }

    pub fn cache(&self) -> &DecodedAudioCache {
        &self.core.cache
    }

    /// Live channels, root included
    pub fn channel_count(&self) -> usize {
        self.core.channel_count()
    }

    pub fn max_channels(&self) -> usize {
        self.core.options.max_channels
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            let _ = self.destroy();
        }
    }
}

fn build_layout(parent: &Channel, layout: &ChannelLayout) -> Result<()> {
    let channel = parent.create_channel(&layout.name, layout.options())?;
    for child in &layout.children {
        build_layout(&channel, child)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(max_channels: usize) -> Session {
        let options = SessionOptions {
            max_channels,
            silent: true,
            ..SessionOptions::default()
        };
        Session::with_context(options, Arc::new(HeadlessContext::default())).unwrap()
    }

    #[tokio::test]
    async fn test_ceiling_counts_root() {
        let session = session(3);
        assert_eq!(session.channel_count(), 1);
        session.create_channel("a", ChannelOptions::default()).unwrap();
        session.create_channel("b", ChannelOptions::default()).unwrap();
        assert!(matches!(
            session.create_channel("c", ChannelOptions::default()),
            Err(Error::LimitExceeded { limit: 3 })
        ));
    }

    #[tokio::test]
    async fn test_removal_frees_ceiling_slots() {
        let session = session(2);
        let a = session.create_channel("a", ChannelOptions::default()).unwrap();
        a.remove().unwrap();
        assert_eq!(session.channel_count(), 1);
        session.create_channel("a", ChannelOptions::default()).unwrap();
    }

    #[tokio::test]
    async fn test_destroy_once() {
        let ctx = Arc::new(HeadlessContext::default());
        let options = SessionOptions {
            silent: true,
            ..SessionOptions::default()
        };
        let session = Session::with_context(options, ctx.clone()).unwrap();
        session.ready().await.unwrap();
        assert!(ctx.is_resumed());
        let music = session.create_channel("music", ChannelOptions::default()).unwrap();

        session.destroy().unwrap();
        assert!(session.is_destroyed());
        assert!(music.is_removed());
        assert!(session.root().is_removed());
        assert_eq!(session.channel_count(), 0);
        assert!(matches!(session.destroy(), Err(Error::UseAfterTeardown(_))));
        assert!(matches!(session.ready().await, Err(Error::UseAfterTeardown(_))));
        assert!(matches!(
            music.create_channel("x", ChannelOptions::default()),
            Err(Error::UseAfterTeardown(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_builds_layout() {
        let config = AudioConfig::from_toml_str(
            r#"
            [session]
            silent = true

            [[channels]]
            name = "music"
            volume = 0.5
            limit = 1

            [[channels]]
            name = "sfx"
            children = [{ name = "ui", volume = 0.25 }]
            "#,
        )
        .unwrap();

        let session = Session::from_config(
            &config,
            Arc::new(HeadlessContext::default()),
            Arc::new(DefaultTransport::new()),
        )
        .unwrap();

        let music = session.channel("music").unwrap().unwrap();
        assert_eq!(music.volume(), 0.5);
        assert_eq!(music.limit(), Some(1));
        let ui = session.find("sfx/ui").unwrap().unwrap();
        assert_eq!(ui.path(), "master/sfx/ui");
        assert!((ui.effective_volume() - 0.25).abs() < 1e-6);
        assert_eq!(session.channel_count(), 4);
    }

    #[tokio::test]
    async fn test_headless_session_uses_option_hints() {
        let session = Session::headless(SessionOptions {
            sample_rate: Some(48000),
            silent: true,
            ..SessionOptions::default()
        })
        .unwrap();
        assert_eq!(session.context().sample_rate(), 48000);

        let defaulted = Session::headless(SessionOptions {
            silent: true,
            ..SessionOptions::default()
        })
        .unwrap();
        assert_eq!(defaulted.context().sample_rate(), 44100);
    }

    #[test]
    fn test_requires_runtime() {
        let result = Session::with_context(SessionOptions::default(), Arc::new(HeadlessContext::default()));
        assert!(matches!(result, Err(Error::Engine(_))));
    }
}
