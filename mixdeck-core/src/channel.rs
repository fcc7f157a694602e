//! Channel tree
//!
//! Channels are named nodes in a volume-scoped tree. Each owns a gain stage
//! routed into its parent's stage (the root routes to the destination), so a
//! descendant's loudness is the structural product of every volume on its
//! path. Ownership flows downward only: a channel owns its children and its
//! attached tokens, and holds a weak link to its parent.
//!
//! Admission control: `play` stops the oldest attached tokens until the
//! channel is below its limit, before any resources for the new token are
//! created, and again after the load suspension just before attaching.
//!
//! Removal is synchronous and recursive: attached tokens are stopped, child
//! channels are torn down, the output stage is disconnected, the channel is
//! unregistered from the session and dropped from its parent.

use crate::engine::GainStage;
use crate::load_mode::resolve_load_mode;
use crate::session::SessionCore;
use crate::token::{DetachHook, PlaybackToken, TokenConfig, TokenId, MIN_PLAYBACK_RATE};
use crate::{Error, Result};
use mixdeck_common::{clamp_unit, ChannelOptions, LoadMode, PlayOptions, StopOptions};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Name of the session's root channel
pub const ROOT_CHANNEL_NAME: &str = "master";

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Handle to a channel node
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    id: ChannelId,
    name: String,
    /// `/`-joined names from the root
    path: String,
    root: bool,
    core: Arc<SessionCore>,
    parent: Weak<ChannelShared>,
    output: Arc<dyn GainStage>,
    inner: Mutex<ChannelInner>,
}

struct ChannelInner {
    removed: bool,
    volume: f32,
    muted: bool,
    limit: Option<usize>,
    /// Creation order
    children: Vec<Channel>,
    /// Attachment order, oldest first
    tokens: Vec<PlaybackToken>,
}

impl ChannelInner {
    fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(usize::MAX)
    }
}

impl Channel {
    /// Create the root channel of a session
    pub(crate) fn root(core: Arc<SessionCore>, volume: f32) -> Result<Self> {
        let id = ChannelId::next();
        core.register_channel(id)?;

        let label = format!("channel:{}", ROOT_CHANNEL_NAME);
        let output = core.context().create_gain(&label);
        let volume = clamp_unit(volume);
        output.set_value(volume);
        output.connect_to_destination();

        Ok(Self {
            shared: Arc::new(ChannelShared {
                id,
                name: ROOT_CHANNEL_NAME.to_string(),
                path: ROOT_CHANNEL_NAME.to_string(),
                root: true,
                core,
                parent: Weak::new(),
                output,
                inner: Mutex::new(ChannelInner {
                    removed: false,
                    volume,
                    muted: false,
                    limit: None,
                    children: Vec::new(),
                    tokens: Vec::new(),
                }),
            }),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Names from the root down to this channel, joined with `/`
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn is_root(&self) -> bool {
        self.shared.root
    }

    pub fn is_removed(&self) -> bool {
        self.shared.inner.lock().removed
    }

    pub fn parent(&self) -> Option<Channel> {
        self.shared.parent.upgrade().map(|shared| Channel { shared })
    }

    fn lock_live(&self) -> Result<MutexGuard<'_, ChannelInner>> {
        let inner = self.shared.inner.lock();
        if inner.removed {
            return Err(Error::UseAfterTeardown(format!(
                "channel '{}' was removed",
                self.shared.path
            )));
        }
        Ok(inner)
    }

    /// Create a child channel
    pub fn create_channel(&self, name: &str, options: ChannelOptions) -> Result<Channel> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidOperation(format!(
                "invalid channel name '{}'",
                name
            )));
        }
        let options = options.normalized();

        let mut inner = self.lock_live()?;
        if inner.children.iter().any(|child| child.name() == name) {
            return Err(Error::DuplicateName(format!("{}/{}", self.shared.path, name)));
        }

        let id = ChannelId::next();
        self.shared.core.register_channel(id)?;

        let path = format!("{}/{}", self.shared.path, name);
        let output = self
            .shared
            .core
            .context()
            .create_gain(&format!("channel:{}", path));
        output.set_value(options.volume);
        output.connect(Arc::clone(&self.shared.output));

        let child = Channel {
            shared: Arc::new(ChannelShared {
                id,
                name: name.to_string(),
                path,
                root: false,
                core: Arc::clone(&self.shared.core),
                parent: Arc::downgrade(&self.shared),
                output,
                inner: Mutex::new(ChannelInner {
                    removed: false,
                    volume: options.volume,
                    muted: false,
                    limit: options.limit,
                    children: Vec::new(),
                    tokens: Vec::new(),
                }),
            }),
        };
        inner.children.push(child.clone());
        drop(inner);

        diag!(
            self.shared.core.silent(),
            debug,
            "Created channel {} (volume {:.2}, limit {:?})",
            child.shared.path,
            options.volume,
            options.limit
        );
        Ok(child)
    }

    /// Direct child by name
    pub fn channel(&self, name: &str) -> Result<Option<Channel>> {
        let inner = self.lock_live()?;
        Ok(inner.children.iter().find(|child| child.name() == name).cloned())
    }

    /// Direct children in creation order
    pub fn channels(&self) -> Result<Vec<Channel>> {
        Ok(self.lock_live()?.children.clone())
    }

    /// Descendant by `/`-separated path relative to this channel
    pub fn find(&self, path: &str) -> Result<Option<Channel>> {
        let mut current = self.clone();
        for name in path.split('/').filter(|segment| !segment.is_empty()) {
            match current.channel(name)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Set this channel's own gain; children keep their stored volumes
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        let volume = clamp_unit(volume);
        let mut inner = self.lock_live()?;
        inner.volume = volume;
        if !inner.muted {
            self.shared.output.set_value(volume);
        }
        Ok(())
    }

    pub fn volume(&self) -> f32 {
        self.shared.inner.lock().volume
    }

    pub fn mute(&self) -> Result<()> {
        self.set_muted(true)
    }

    pub fn unmute(&self) -> Result<()> {
        self.set_muted(false)
    }

    pub fn set_muted(&self, muted: bool) -> Result<()> {
        let mut inner = self.lock_live()?;
        inner.muted = muted;
        let gain = if muted { 0.0 } else { inner.volume };
        self.shared.output.set_value(gain);
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        self.shared.inner.lock().muted
    }

    /// Level this channel's output contributes at the destination
    pub fn effective_volume(&self) -> f32 {
        self.shared.output.output_level()
    }

    /// Change the token limit; applied at the next `play`
    pub fn set_limit(&self, limit: Option<usize>) -> Result<()> {
        let mut inner = self.lock_live()?;
        inner.limit = limit.map(|l| l.max(1));
        Ok(())
    }

    pub fn limit(&self) -> Option<usize> {
        self.shared.inner.lock().limit
    }

    /// Tokens attached directly to this channel
    pub fn token_count(&self) -> usize {
        self.shared.inner.lock().tokens.len()
    }

    /// Own tokens first, then each child's tokens in creation order
    pub fn tokens(&self) -> Result<Vec<PlaybackToken>> {
        let (mut tokens, children) = {
            let inner = self.lock_live()?;
            (inner.tokens.clone(), inner.children.clone())
        };
        for child in children {
            // A child removed meanwhile has no tokens left
            if let Ok(child_tokens) = child.tokens() {
                tokens.extend(child_tokens);
            }
        }
        Ok(tokens)
    }

    /// Start playing `locator` on this channel
    pub async fn play(&self, locator: &str, options: PlayOptions) -> Result<PlaybackToken> {
        let options = options.normalized(MIN_PLAYBACK_RATE);
        let core = Arc::clone(&self.shared.core);
        core.ensure_alive()?;

        drop(self.admit()?);

        let load_mode =
            resolve_load_mode(core.transport(), locator, options.load, core.silent()).await;

        let audio = match load_mode {
            LoadMode::Full => {
                let entry = core.cache().load(locator).await?;
                let lease = entry.acquire();
                Some((entry.raw(), lease))
            }
            _ => None,
        };

        // Suspensions are over; state may have changed meanwhile
        core.ensure_alive()?;
        let mut inner = self.admit()?;

        let token = PlaybackToken::start(TokenConfig {
            locator: locator.to_string(),
            options,
            load_mode,
            audio,
            context: Arc::clone(core.context()),
            channel_output: Arc::clone(&self.shared.output),
            runtime: core.runtime().clone(),
            silent: core.silent(),
            detach: self.detach_hook(),
        })?;

        if !token.is_terminal() {
            inner.tokens.push(token.clone());
        }
        drop(inner);

        diag!(
            core.silent(),
            debug,
            "{} attached to {} ({} mode)",
            token.id(),
            self.shared.path,
            load_mode
        );
        Ok(token)
    }

    /// Stop the oldest tokens until the channel is below its limit
    ///
    /// Returns the held lock so the caller can attach without a gap.
    fn admit(&self) -> Result<MutexGuard<'_, ChannelInner>> {
        loop {
            let evicted = {
                let mut inner = self.lock_live()?;
                if inner.tokens.len() < inner.effective_limit() {
                    return Ok(inner);
                }
                inner.tokens.remove(0)
            };

            diag!(
                self.shared.core.silent(),
                debug,
                "Channel {} at limit, evicting {}",
                self.shared.path,
                evicted.id()
            );
            // Already terminal tokens are simply dropped from tracking
            let _ = evicted.stop(StopOptions::immediate());
        }
    }

    fn detach_hook(&self) -> DetachHook {
        let channel = Arc::downgrade(&self.shared);
        Box::new(move |id: TokenId| {
            if let Some(shared) = channel.upgrade() {
                shared.inner.lock().tokens.retain(|token| token.id() != id);
            }
        })
    }

    /// Tear down this channel and its subtree
    ///
    /// The root channel can only be torn down by destroying the session.
    pub fn remove(&self) -> Result<()> {
        if self.shared.root {
            return Err(Error::InvalidOperation(
                "the root channel is removed by destroying the session".to_string(),
            ));
        }
        drop(self.lock_live()?);

        self.teardown();
        if let Some(parent) = self.shared.parent.upgrade() {
            parent
                .inner
                .lock()
                .children
                .retain(|child| child.id() != self.shared.id);
        }
        Ok(())
    }

    /// Stop tokens, tear down children, release the output stage, unregister
    pub(crate) fn teardown(&self) {
        let (tokens, children) = {
            let mut inner = self.shared.inner.lock();
            if inner.removed {
                return;
            }
            inner.removed = true;
            (
                std::mem::take(&mut inner.tokens),
                std::mem::take(&mut inner.children),
            )
        };

        let stopped = tokens.len();
        for token in tokens {
            let _ = token.stop(StopOptions::immediate());
        }
        for child in children {
            child.teardown();
        }

        self.shared.output.disconnect();
        self.shared.core.unregister_channel(self.shared.id);

        diag!(
            self.shared.core.silent(),
            debug,
            "Removed channel {} ({} tokens stopped)",
            self.shared.path,
            stopped
        );
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("path", &self.shared.path)
            .finish()
    }
}
