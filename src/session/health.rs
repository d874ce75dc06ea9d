//! Connection health state
//!
//! `Connecting → Open ⇄ Degraded`, and any state → `Closed`, which is
//! terminal. Rejected transitions leave the state untouched.

use std::fmt;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Connecting,
    Open,
    /// A ping is outstanding past its deadline or failed
    Degraded,
    Closed,
}

impl HealthState {
    fn can_become(self, next: HealthState) -> bool {
        use HealthState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Open) | (Open, Degraded) | (Degraded, Open) => true,
            _ => false,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared, observable health state
pub struct HealthCell {
    state: watch::Sender<HealthState>,
}

impl HealthCell {
    pub fn new() -> Self {
        let (state, _) = watch::channel(HealthState::Connecting);
        Self { state }
    }

    pub fn get(&self) -> HealthState {
        *self.state.borrow()
    }

    /// Move to `next` if allowed. Returns whether the state changed.
    pub fn transition(&self, next: HealthState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_become(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.state.subscribe()
    }
}

impl Default for HealthCell {
    fn default() -> Self {
        Self::new()
    }
}
