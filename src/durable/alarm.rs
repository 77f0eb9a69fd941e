//! Alarm scheduling for durable objects.
//!
//! Each object stores at most one pending alarm time. The scheduler watches
//! the store, sleeps until the alarm is due, then dispatches into the
//! worker. Partial-failure semantics mirror queues: failed dispatches are
//! retried with a backoff ladder, then the alarm is dropped with a warning.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{clock::SharedClock, durable::DurableObjectStore, error::Result};

/// Backoff ladder applied between failed alarm dispatches.
const RETRY_DELAYS: &[Duration] = &[
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_millis(1_000),
    Duration::from_millis(3_000),
];

/// Callback invoked when an alarm fires, receiving the scheduled time in
/// unix milliseconds.
pub type AlarmHandler = Arc<dyn Fn(u64) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handle to a running alarm scheduler; aborts the task on drop.
pub struct AlarmHandle {
    task: JoinHandle<()>,
}

impl Drop for AlarmHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watches one durable object's alarm record and dispatches fires.
pub struct AlarmScheduler;

impl AlarmScheduler {
    /// Spawns the scheduler task for `store`.
    pub fn spawn(
        store: Arc<DurableObjectStore>,
        clock: SharedClock,
        handler: AlarmHandler,
    ) -> AlarmHandle {
        let notify = store.alarm_notify();
        let task = tokio::spawn(async move {
            loop {
                let notified = notify.notified();
                let pending = match store.get_alarm().await {
                    Ok(pending) => pending,
                    Err(e) => {
                        warn!("Failed to read alarm state: {e}");
                        notified.await;
                        continue;
                    }
                };

                let Some(at) = pending else {
                    notified.await;
                    continue;
                };

                let now = clock.now_millis();
                if at > now {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(at - now)) => {}
                        _ = notified => continue,
                    }
                    // Re-read in case the alarm moved while sleeping.
                    match store.get_alarm().await {
                        Ok(Some(current)) if current == at => {}
                        _ => continue,
                    }
                }

                if let Err(e) = store.set_alarm(None).await {
                    warn!("Failed to clear fired alarm: {e}");
                }
                Self::deliver(at, &handler).await;
            }
        });
        AlarmHandle { task }
    }

    async fn deliver(at: u64, handler: &AlarmHandler) {
        let mut attempt = 0;
        loop {
            match handler(at).await {
                Ok(()) => return,
                Err(e) => {
                    if attempt >= RETRY_DELAYS.len() {
                        warn!("Dropped alarm scheduled for {at} after {} failed attempts: {e}", attempt + 1);
                        return;
                    }
                    tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{clock::Clock, clock::FakeClock, storage::MemoryStorage};

    fn setup() -> (Arc<FakeClock>, Arc<DurableObjectStore>) {
        let clock = Arc::new(FakeClock::new(1_000_000));
        let store = Arc::new(DurableObjectStore::new(Arc::new(MemoryStorage::new(
            clock.clone(),
        ))));
        (clock, store)
    }

    #[tokio::test(start_paused = true)]
    async fn alarm_fires_once_due() {
        let (clock, store) = setup();
        let fired = Arc::new(AtomicUsize::new(0));

        let handler: AlarmHandler = {
            let fired = fired.clone();
            Arc::new(move |_at| {
                let fired = fired.clone();
                Box::pin(async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        };
        let _handle = AlarmScheduler::spawn(store.clone(), clock.clone(), handler);

        store
            .set_alarm(Some(clock.now_millis() + 5_000))
            .await
            .unwrap();

        clock.advance(5_000);
        tokio::time::sleep(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_alarm().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_alarm_retries_then_drops() {
        let (clock, store) = setup();
        let attempts = Arc::new(AtomicUsize::new(0));

        let handler: AlarmHandler = {
            let attempts = attempts.clone();
            Arc::new(move |_at| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(crate::error::KumoError::io("boom"))
                })
            })
        };
        let _handle = AlarmScheduler::spawn(store.clone(), clock.clone(), handler);

        store.set_alarm(Some(clock.now_millis())).await.unwrap();

        // Enough virtual time to burn through the whole backoff ladder.
        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(attempts.load(Ordering::SeqCst), RETRY_DELAYS.len() + 1);
    }
}
