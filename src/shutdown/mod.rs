//! Shutdown coordination
//!
//! A single-fire gate observed by every background loop of a session. The
//! first detector to fire it records why; later attempts are no-ops that
//! report `false`. Waiting on an already fired gate returns immediately.

use std::fmt;
use std::sync::OnceLock;
use tokio::sync::watch;
use tracing::debug;

/// Which detector fired the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `Session::close` called by the owner
    CallerClose,
    /// The read loop hit a transport error or peer close
    ReadFailure,
    /// A frame write failed
    WriteFailure,
    /// Pings stopped coming back
    KeepaliveFailure,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CallerClose => "caller close",
            Self::ReadFailure => "read failure",
            Self::WriteFailure => "write failure",
            Self::KeepaliveFailure => "keepalive failure",
        };
        f.write_str(name)
    }
}

/// One-shot broadcast signal
pub struct ShutdownGate {
    reason: OnceLock<ShutdownReason>,
    signal: watch::Sender<bool>,
}

impl ShutdownGate {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            reason: OnceLock::new(),
            signal,
        }
    }

    /// Fire the gate. Returns `true` only for the call that actually fired it.
    pub fn fire(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason).is_err() {
            debug!(%reason, "Shutdown gate already fired, ignoring");
            return false;
        }
        // send_replace never fails, even with no receivers
        self.signal.send_replace(true);
        debug!(%reason, "Shutdown gate fired");
        true
    }

    pub fn is_fired(&self) -> bool {
        self.reason.get().is_some()
    }

    /// The reason recorded by the first `fire`
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Resolve once the gate has fired.
    pub async fn fired(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for ShutdownGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_first_fire_wins() {
        let gate = ShutdownGate::new();
        assert!(!gate.is_fired());
        assert!(gate.fire(ShutdownReason::KeepaliveFailure));
        assert!(!gate.fire(ShutdownReason::CallerClose));
        assert!(!gate.fire(ShutdownReason::ReadFailure));
        assert_eq!(gate.reason(), Some(ShutdownReason::KeepaliveFailure));
    }

    #[tokio::test]
    async fn test_fired_returns_immediately_after_fire() {
        let gate = ShutdownGate::new();
        gate.fire(ShutdownReason::CallerClose);
        tokio::time::timeout(Duration::from_millis(100), gate.fired())
            .await
            .expect("fired() should not block once the gate has fired");
        // Observing twice is fine too
        tokio::time::timeout(Duration::from_millis(100), gate.fired())
            .await
            .expect("second observation should not block");
    }

    #[tokio::test]
    async fn test_waiters_released_by_fire() {
        let gate = Arc::new(ShutdownGate::new());
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            waiters.push(tokio::spawn(async move { gate.fired().await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        gate.fire(ShutdownReason::ReadFailure);
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should be released")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_concurrent_fire_fires_once() {
        let gate = Arc::new(ShutdownGate::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                gate.fire(ShutdownReason::WriteFailure)
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
