//! Idle tracking and self-termination

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rmx_core::time::{current_time_millis, elapsed_duration};

/// Last time anything happened on the control surface or a stream
#[derive(Debug)]
pub struct ActivityTracker {
    last: AtomicU64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(current_time_millis()),
        }
    }

    /// Record activity now
    pub fn touch(&self) {
        self.last.store(current_time_millis(), Ordering::Relaxed);
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self) -> Duration {
        elapsed_duration(self.last.load(Ordering::Relaxed))
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel `shutdown` once no activity has been seen for `idle_timeout`.
///
/// Returns when the token is cancelled, by this monitor or anyone else.
pub async fn run_idle_monitor(
    activity: Arc<ActivityTracker>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    let check_every = (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(30));
    let mut ticker = tokio::time::interval(check_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let idle = activity.idle_for();
                if idle >= idle_timeout {
                    tracing::info!(
                        "Idle for {}s (limit {}s), shutting down",
                        idle.as_secs(),
                        idle_timeout.as_secs()
                    );
                    shutdown.cancel();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_idle_monitor_cancels() {
        let activity = Arc::new(ActivityTracker::new());
        let token = CancellationToken::new();

        tokio::time::timeout(
            Duration::from_secs(5),
            run_idle_monitor(Arc::clone(&activity), Duration::from_millis(100), token.clone()),
        )
        .await
        .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_activity_postpones_shutdown() {
        let activity = Arc::new(ActivityTracker::new());
        let token = CancellationToken::new();
        let monitor = tokio::spawn(run_idle_monitor(
            Arc::clone(&activity),
            Duration::from_millis(300),
            token.clone(),
        ));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            activity.touch();
        }
        assert!(!token.is_cancelled());

        token.cancel();
        monitor.await.unwrap();
    }
}
