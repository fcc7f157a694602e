//! Decoded-audio cache
//!
//! Keyed by locator. Each entry holds a shared, read-only decoded payload, an
//! `alive` flag and a reference count. Tokens playing in `full` mode hold a
//! `CacheLease`, which performs exactly one decrement when dropped.
//!
//! Concurrent loads of one locator are coalesced: the first caller spawns a
//! fetch-then-decode task and registers it as in flight; later callers await
//! the same shared future and observe the identical entry (or the identical
//! failure). The spawned task completes even if every caller goes away.
//!
//! Lock order: cache state, then entry state.

use crate::decode::extension_hint;
use crate::engine::{AudioContext, DecodedAudio};
use crate::transport::Transport;
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

#[derive(Debug, Clone)]
enum LoadFailure {
    Failed(String),
    Closed,
}

impl LoadFailure {
    fn into_error(self, locator: &str) -> Error {
        match self {
            LoadFailure::Failed(reason) => Error::Load {
                locator: locator.to_string(),
                reason,
            },
            LoadFailure::Closed => {
                Error::UseAfterTeardown(format!("cache closed while loading {}", locator))
            }
        }
    }
}

type LoadFuture = Shared<BoxFuture<'static, std::result::Result<CachedAudio, LoadFailure>>>;

/// Reference-counted store of decoded audio
#[derive(Clone)]
pub struct DecodedAudioCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    context: Arc<dyn AudioContext>,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    silent: bool,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    closed: bool,
    entries: HashMap<String, CachedAudio>,
    in_flight: HashMap<String, LoadFuture>,
}

impl DecodedAudioCache {
    pub(crate) fn new(
        context: Arc<dyn AudioContext>,
        transport: Arc<dyn Transport>,
        runtime: Handle,
        silent: bool,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                context,
                transport,
                runtime,
                silent,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Return the live entry for `locator`, loading it if needed
    pub async fn load(&self, locator: &str) -> Result<CachedAudio> {
        let pending = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::UseAfterTeardown("decoded-audio cache is closed".to_string()));
            }
            if let Some(entry) = state.entries.get(locator) {
                if entry.is_alive() {
                    return Ok(entry.clone());
                }
            }
            match state.in_flight.get(locator) {
                Some(pending) => {
                    diag!(self.inner.silent, debug, "Joining in-flight load: {}", locator);
                    pending.clone()
                }
                None => {
                    let pending = self.spawn_load(locator);
                    state.in_flight.insert(locator.to_string(), pending.clone());
                    pending
                }
            }
        };

        pending.await.map_err(|failure| failure.into_error(locator))
    }

    fn spawn_load(&self, locator: &str) -> LoadFuture {
        let inner = Arc::clone(&self.inner);
        let task_locator = locator.to_string();
        let task = self
            .inner
            .runtime
            .spawn(async move { CacheInner::fetch_and_decode(inner, task_locator).await });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(LoadFailure::Failed(format!("load task failed: {}", e))),
            }
        }
        .boxed()
        .shared()
    }

    /// Live entry for `locator`, without loading
    pub fn get(&self, locator: &str) -> Option<CachedAudio> {
        let state = self.inner.state.lock();
        state
            .entries
            .get(locator)
            .filter(|entry| entry.is_alive())
            .cloned()
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.get(locator).is_some()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state.entries.values().filter(|entry| entry.is_alive()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of loads currently being fetched or decoded
    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Force-unload every entry
    pub fn clear(&self) {
        let entries: Vec<CachedAudio> = {
            let mut state = self.inner.state.lock();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.force_unload();
        }
        if !entries.is_empty() {
            diag!(self.inner.silent, debug, "Cleared {} cached entries", entries.len());
        }
    }

    /// Clear and refuse further loads; pending loads resolve as torn down
    pub(crate) fn close(&self) {
        self.inner.state.lock().closed = true;
        self.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    #[cfg(test)]
    pub(crate) fn insert_decoded(&self, locator: &str, audio: Arc<DecodedAudio>) -> CachedAudio {
        let entry = CachedAudio::new(locator.to_string(), audio, Arc::downgrade(&self.inner));
        self.inner
            .state
            .lock()
            .entries
            .insert(locator.to_string(), entry.clone());
        entry
    }
}

impl CacheInner {
    async fn fetch_and_decode(
        inner: Arc<CacheInner>,
        locator: String,
    ) -> std::result::Result<CachedAudio, LoadFailure> {
        diag!(inner.silent, debug, "Loading into cache: {}", locator);

        let outcome: Result<DecodedAudio> = async {
            let bytes = inner.transport.fetch(&locator).await?;
            inner.context.decode(bytes, extension_hint(&locator)).await
        }
        .await;

        let result = {
            let mut state = inner.state.lock();
            state.in_flight.remove(&locator);
            if state.closed {
                Err(LoadFailure::Closed)
            } else {
                match outcome {
                    Ok(audio) => {
                        let entry =
                            CachedAudio::new(locator.clone(), Arc::new(audio), Arc::downgrade(&inner));
                        state.entries.insert(locator.clone(), entry.clone());
                        Ok(entry)
                    }
                    Err(e) => Err(LoadFailure::Failed(e.to_string())),
                }
            }
        };

        match &result {
            Ok(entry) => diag!(
                inner.silent,
                debug,
                "Cached {} ({:.2}s, {} bytes)",
                locator,
                entry.raw().duration(),
                entry.raw().byte_size()
            ),
            Err(LoadFailure::Failed(reason)) => {
                diag!(inner.silent, warn, "Failed to load {}: {}", locator, reason)
            }
            Err(LoadFailure::Closed) => {
                diag!(inner.silent, debug, "Discarding load of {}: cache closed", locator)
            }
        }
        result
    }

    fn evict(&self, entry: &CachedAudio) {
        let mut state = self.state.lock();
        let matches = state
            .entries
            .get(entry.locator())
            .is_some_and(|current| Arc::ptr_eq(&current.inner, &entry.inner));
        if matches {
            state.entries.remove(entry.locator());
        }
    }
}

/// One decoded, reference-counted cache entry
#[derive(Clone)]
pub struct CachedAudio {
    inner: Arc<EntryInner>,
}

struct EntryInner {
    locator: String,
    audio: Arc<DecodedAudio>,
    state: Mutex<EntryState>,
    cache: Weak<CacheInner>,
}

struct EntryState {
    alive: bool,
    refs: usize,
}

impl CachedAudio {
    fn new(locator: String, audio: Arc<DecodedAudio>, cache: Weak<CacheInner>) -> Self {
        Self {
            inner: Arc::new(EntryInner {
                locator,
                audio,
                state: Mutex::new(EntryState { alive: true, refs: 0 }),
                cache,
            }),
        }
    }

    pub fn locator(&self) -> &str {
        &self.inner.locator
    }

    /// Decoded payload; stays valid after the entry dies
    pub fn raw(&self) -> Arc<DecodedAudio> {
        Arc::clone(&self.inner.audio)
    }

    pub fn is_alive(&self) -> bool {
        self.inner.state.lock().alive
    }

    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().refs
    }

    /// Mark the entry dead if nothing is using it
    ///
    /// Returns false, leaving the entry untouched, while references remain.
    pub fn unload(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !state.alive || state.refs > 0 {
                return false;
            }
            state.alive = false;
        }
        self.evict();
        true
    }

    /// Mark the entry dead regardless of active users
    pub fn force_unload(&self) {
        {
            let mut state = self.inner.state.lock();
            state.alive = false;
            state.refs = 0;
        }
        self.evict();
    }

    pub(crate) fn acquire(&self) -> CacheLease {
        self.inner.state.lock().refs += 1;
        CacheLease { entry: self.clone() }
    }

    fn evict(&self) {
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.evict(self);
        }
    }

    pub fn ptr_eq(&self, other: &CachedAudio) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CachedAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CachedAudio")
            .field("locator", &self.inner.locator)
            .field("alive", &state.alive)
            .field("refs", &state.refs)
            .finish()
    }
}

/// One counted use of a cache entry; decrements once when dropped
pub struct CacheLease {
    entry: CachedAudio,
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        let mut state = self.entry.inner.state.lock();
        state.refs = state.refs.saturating_sub(1);
    }
}

impl fmt::Debug for CacheLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLease")
            .field("locator", &self.entry.locator())
            .finish()
    }
}
