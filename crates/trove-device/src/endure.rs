//! Bounded retry for the initialize handshake.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};
use trove_core::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndurePolicy {
    pub delay: Duration,
    pub attempts: u32,
}

impl Default for EndurePolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            attempts: 60,
        }
    }
}

/// Run `op` until it succeeds, waiting `policy.delay` between failures.
///
/// Before every attempt the session is checked; once it is gone the loop
/// stops with [`SessionError::Disconnected`] and that attempt is not
/// counted. A cancelled prompt is returned at once. When all attempts fail
/// the last error is returned.
pub async fn endure<T, F, Fut>(
    policy: &EndurePolicy,
    is_connected: impl Fn() -> bool,
    mut op: F,
) -> Result<T, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    let mut last = SessionError::Disconnected;
    for attempt in 1..=policy.attempts {
        if !is_connected() {
            debug!(attempt, "session gone, giving up");
            return Err(SessionError::Disconnected);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(SessionError::Cancelled) => return Err(SessionError::Cancelled),
            Err(e) => {
                warn!(attempt, error = %e, "attempt failed");
                last = e;
            }
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn transport(msg: &str) -> SessionError {
        SessionError::Transport(msg.into())
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = tokio::time::Instant::now();
        let out = endure(&EndurePolicy::default(), || true, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transport("busy"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = EndurePolicy {
            delay: Duration::from_secs(3),
            attempts: 4,
        };
        let out: Result<(), _> = endure(&policy, || true, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(transport(&format!("fail {n}")))
        })
        .await;
        assert_eq!(out, Err(transport("fail 3")));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_without_counting() {
        let connected = AtomicBool::new(true);
        let counter = AtomicU32::new(0);
        let (flag, calls) = (&connected, &counter);
        let out: Result<(), _> = endure(
            &EndurePolicy::default(),
            || flag.load(Ordering::SeqCst),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                flag.store(false, Ordering::SeqCst);
                Err(transport("unplugged"))
            },
        )
        .await;
        assert_eq!(out, Err(SessionError::Disconnected));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = endure(&EndurePolicy::default(), || true, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::Cancelled)
        })
        .await;
        assert_eq!(out, Err(SessionError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
