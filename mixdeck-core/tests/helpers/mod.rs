//! Test helpers for mixdeck-core integration tests
//!
//! - MemoryTransport: in-memory locators with probe/fetch counters and
//!   failure injection
//! - audio_generator: deterministic WAV fixtures built with hound
//! - init_tracing: route diagnostics to the test writer

#![allow(dead_code)]

pub mod audio_generator;
pub mod memory_transport;

pub use audio_generator::{sine_wav, silent_wav};
pub use memory_transport::MemoryTransport;

use mixdeck_common::LoggingConfig;
use mixdeck_core::engine::{ContextHints, HeadlessContext};
use mixdeck_core::{Session, SessionOptions};
use std::sync::Arc;
use std::time::Duration;

/// Session over a headless engine and an in-memory transport
pub struct TestSession {
    pub session: Session,
    pub context: Arc<HeadlessContext>,
    pub transport: Arc<MemoryTransport>,
}

impl TestSession {
    pub fn new() -> Self {
        Self::with_options(SessionOptions {
            silent: true,
            ..SessionOptions::default()
        })
    }

    pub fn with_options(options: SessionOptions) -> Self {
        let context = Arc::new(HeadlessContext::new(ContextHints::from(&options)));
        let transport = Arc::new(MemoryTransport::new());
        let session = Session::new(options, context.clone(), transport.clone())
            .expect("session creation should succeed inside a runtime");
        Self {
            session,
            context,
            transport,
        }
    }

    /// Gain stage created for a token
    pub fn token_gain(&self, token: &mixdeck_core::PlaybackToken) -> Arc<mixdeck_core::engine::HeadlessGain> {
        self.context
            .gain(&format!("token:{}", token.id().value()))
            .expect("token gain should exist")
    }

    /// Gain stage created for a channel path
    pub fn channel_gain(&self, path: &str) -> Arc<mixdeck_core::engine::HeadlessGain> {
        self.context
            .gain(&format!("channel:{}", path))
            .expect("channel gain should exist")
    }
}

/// Install a fmt subscriber once per test binary, filtered like the library bootstrap
pub fn init_tracing() {
    let config = LoggingConfig {
        level: "debug".to_string(),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(mixdeck_common::logging::env_filter(&config))
        .with_test_writer()
        .try_init();
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

pub fn approx_eq(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-4
}
