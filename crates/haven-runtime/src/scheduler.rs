//! Periodic background tasks

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A task ticking at a fixed period until stopped.
///
/// Dropping the handle also stops the task, after any tick in progress.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawn on the current tokio runtime. `tick` receives the tick number,
    /// starting at 1. The first tick fires one period after spawning.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;

            let mut ticks = 0u64;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = interval.tick() => {
                        if *stopped.borrow() {
                            break;
                        }
                        ticks += 1;
                        tick(ticks).await;
                    }
                }
            }
            tracing::debug!(task = name, ticks, "scheduled task stopped");
        });

        tracing::debug!(
            task = name,
            period_ms = period.as_millis() as u64,
            "scheduled task started"
        );
        ScheduledTask {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal shutdown and wait for the task. No tick starts after this
    /// returns.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(task = self.name, error = %e, "scheduled task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ticks_until_stopped() {
        let count = Arc::new(AtomicU64::new(0));
        let seen = count.clone();
        let task = ScheduledTask::spawn("count", Duration::from_millis(5), move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        task.stop().await;
        let stopped_at = count.load(Ordering::SeqCst);
        assert!(stopped_at >= 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
    }

    #[tokio::test]
    async fn test_tick_numbers_start_at_one() {
        let first = Arc::new(AtomicU64::new(0));
        let slot = first.clone();
        let task = ScheduledTask::spawn("numbers", Duration::from_millis(5), move |n| {
            let slot = slot.clone();
            async move {
                let _ = slot.compare_exchange(0, n, Ordering::SeqCst, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        task.stop().await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_stops_task() {
        let count = Arc::new(AtomicU64::new(0));
        let seen = count.clone();
        let task = ScheduledTask::spawn("dropped", Duration::from_millis(5), move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(task.name(), "dropped");
        drop(task);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_drop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_drop);
    }
}
