//! Fade operations
//!
//! A `FadeOperation` is a linear ramp of one token's gain with a single-shot
//! completion signal. It leaves `Running` exactly once:
//!
//! - **Finished**: the ramp ran to completion, or `finish()` forced the
//!   token's volume to the target.
//! - **Cancelled**: superseded by another fade or a direct volume change, or
//!   `cancel()` was called. The gain is held at the value the ramp had
//!   reached at the cancel instant.
//!
//! The token's logical volume only changes when a fade finishes; reading it
//! mid-fade reports the pre-fade value.

use crate::token::TokenShared;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Completion state of a fade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FadeState {
    Running,
    Cancelled,
    Finished,
}

impl FadeState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, FadeState::Running)
    }
}

impl fmt::Display for FadeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FadeState::Running => write!(f, "running"),
            FadeState::Cancelled => write!(f, "cancelled"),
            FadeState::Finished => write!(f, "finished"),
        }
    }
}

/// Handle to one fade on one token
#[derive(Clone)]
pub struct FadeOperation {
    inner: Arc<FadeInner>,
}

struct FadeInner {
    id: u64,
    from: f32,
    target: f32,
    duration: Duration,
    state: watch::Sender<FadeState>,
    token: Weak<TokenShared>,
}

impl FadeOperation {
    pub(crate) fn running(
        id: u64,
        from: f32,
        target: f32,
        duration: Duration,
        token: Weak<TokenShared>,
    ) -> Self {
        Self::with_state(id, from, target, duration, token, FadeState::Running)
    }

    /// Operation that completed on creation (zero-length fades)
    pub(crate) fn finished(id: u64, target: f32, token: Weak<TokenShared>) -> Self {
        Self::with_state(id, target, target, Duration::ZERO, token, FadeState::Finished)
    }

    fn with_state(
        id: u64,
        from: f32,
        target: f32,
        duration: Duration,
        token: Weak<TokenShared>,
        state: FadeState,
    ) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            inner: Arc::new(FadeInner {
                id,
                from,
                target,
                duration,
                state,
                token,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn start_volume(&self) -> f32 {
        self.inner.from
    }

    pub fn target(&self) -> f32 {
        self.inner.target
    }

    pub fn duration(&self) -> Duration {
        self.inner.duration
    }

    pub fn state(&self) -> FadeState {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == FadeState::Running
    }

    /// Stop the ramp where it is and resolve the completion signal
    ///
    /// Returns false if the fade had already settled.
    pub fn cancel(&self) -> bool {
        self.resolve(FadeState::Cancelled)
    }

    /// Jump the token's volume to the target and resolve the completion signal
    ///
    /// Returns false if the fade had already settled.
    pub fn finish(&self) -> bool {
        self.resolve(FadeState::Finished)
    }

    /// Wait for the fade to settle
    pub async fn wait(&self) -> FadeState {
        let mut rx = self.inner.state.subscribe();
        let settled = match rx.wait_for(|state| state.is_settled()).await {
            Ok(state) => *state,
            // The sender lives as long as `self`
            Err(_) => self.state(),
        };
        settled
    }

    fn resolve(&self, outcome: FadeState) -> bool {
        match self.inner.token.upgrade() {
            Some(token) => token.settle_fade(self, outcome),
            None => self.settle(outcome),
        }
    }

    /// Transition out of `Running`; no-op when already settled
    pub(crate) fn settle(&self, outcome: FadeState) -> bool {
        debug_assert!(outcome.is_settled());
        self.inner.state.send_if_modified(|state| {
            if *state == FadeState::Running {
                *state = outcome;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn same(&self, other: &FadeOperation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for FadeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FadeOperation")
            .field("id", &self.inner.id)
            .field("from", &self.inner.from)
            .field("target", &self.inner.target)
            .field("duration", &self.inner.duration)
            .field("state", &self.state())
            .finish()
    }
}
