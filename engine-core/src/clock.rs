//! Monotonic + wall time abstraction with cancellable sleeps (§2 Clock)
//!
//! Every suspension point in the scheduler loop goes through this trait so
//! that `CancelToken`-aware waits are expressed once instead of being
//! reimplemented at each call site.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::cancel::CancelToken;

/// Time source used throughout the engine. The default `SystemClock`
/// delegates to `chrono`/`tokio::time`; tests may swap in a fake that
/// reports a controlled `now_utc()` while still sleeping in real time for
/// short, deterministic scenario durations.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for `duration`, returning early (with `true`) if `cancel`
    /// fires first.
    async fn sleep_cancellable(&self, duration: Duration, cancel: &CancelToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = cancel.cancelled() => true,
        }
    }
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn sleep_cancellable_returns_early_on_cancel() {
        let clock = SystemClock;
        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });

        let start = Instant::now();
        let was_cancelled = clock.sleep_cancellable(Duration::from_secs(5), &cancel).await;
        assert!(was_cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sleep_cancellable_completes_normally_without_cancel() {
        let clock = SystemClock;
        let cancel = CancelToken::new();
        let was_cancelled = clock.sleep_cancellable(Duration::from_millis(10), &cancel).await;
        assert!(!was_cancelled);
    }
}
