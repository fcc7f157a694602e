//! In-memory transport with failure injection

use async_trait::async_trait;
use mixdeck_core::transport::Transport;
use mixdeck_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Default)]
struct Resource {
    bytes: Vec<u8>,
    /// Size reported by probes; `None` means the response carries no size
    reported_size: Option<u64>,
    fail_probe: bool,
    fail_fetch: bool,
}

#[derive(Default)]
struct Counters {
    probes: HashMap<String, usize>,
    fetches: HashMap<String, usize>,
}

pub struct MemoryTransport {
    resources: Mutex<HashMap<String, Resource>>,
    counters: Mutex<Counters>,
    fetch_delay: Mutex<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            fetch_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Serve `bytes` at `locator`, reporting their real length
    pub fn insert(&self, locator: &str, bytes: Vec<u8>) {
        let reported_size = Some(bytes.len() as u64);
        self.resources.lock().insert(
            locator.to_string(),
            Resource {
                bytes,
                reported_size,
                ..Resource::default()
            },
        );
    }

    /// Override the size probes report (e.g. a large Content-Length)
    pub fn set_reported_size(&self, locator: &str, size: Option<u64>) {
        self.resources
            .lock()
            .entry(locator.to_string())
            .or_default()
            .reported_size = size;
    }

    pub fn fail_probe(&self, locator: &str) {
        self.resources
            .lock()
            .entry(locator.to_string())
            .or_default()
            .fail_probe = true;
    }

    pub fn fail_fetch(&self, locator: &str) {
        self.resources
            .lock()
            .entry(locator.to_string())
            .or_default()
            .fail_fetch = true;
    }

    /// Delay every fetch, so concurrent loads overlap
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn fetch_count(&self, locator: &str) -> usize {
        self.counters.lock().fetches.get(locator).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.counters.lock().fetches.values().sum()
    }

    pub fn probe_count(&self, locator: &str) -> usize {
        self.counters.lock().probes.get(locator).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn probe_size(&self, locator: &str) -> Result<Option<u64>> {
        *self
            .counters
            .lock()
            .probes
            .entry(locator.to_string())
            .or_default() += 1;

        let resources = self.resources.lock();
        match resources.get(locator) {
            Some(resource) if resource.fail_probe => {
                Err(Error::Transport(format!("probe refused for {}", locator)))
            }
            Some(resource) => Ok(resource.reported_size),
            None => Err(Error::Transport(format!("no such locator: {}", locator))),
        }
    }

    async fn fetch(&self, locator: &str) -> Result<Vec<u8>> {
        *self
            .counters
            .lock()
            .fetches
            .entry(locator.to_string())
            .or_default() += 1;

        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let resources = self.resources.lock();
        match resources.get(locator) {
            Some(resource) if resource.fail_fetch => {
                Err(Error::Transport(format!("fetch failed for {}", locator)))
            }
            Some(resource) => Ok(resource.bytes.clone()),
            None => Err(Error::Transport(format!("no such locator: {}", locator))),
        }
    }
}
