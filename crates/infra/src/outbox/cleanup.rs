//! Outbox retention and stale-claim reaping.
//!
//! Runs on its own interval, independent of the processor:
//! - returns `processing` rows claimed longer than `processing_timeout` ago to
//!   `pending` (their processor is assumed gone)
//! - deletes `processed` rows past `processed_retention`
//! - deletes `dead_letter` / `failed` rows past `failed_retention`

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument, warn};

use super::processor::{OutboxConfig, OutboxMetrics};
use super::store::{OutboxError, OutboxStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub stale_released: u64,
    pub processed_deleted: u64,
    pub failed_deleted: u64,
}

#[derive(Debug)]
pub struct OutboxCleanup<S> {
    store: Arc<S>,
    config: OutboxConfig,
    metrics: Arc<OutboxMetrics>,
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<S: OutboxStore> OutboxCleanup<S> {
    pub fn new(store: Arc<S>, config: OutboxConfig, metrics: Arc<OutboxMetrics>) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// One cleanup pass relative to `now`.
    #[instrument(skip(self), err)]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CleanupReport, OutboxError> {
        let stale_released = self
            .store
            .release_stale(cutoff(now, self.config.processing_timeout))
            .await?;
        let processed_deleted = self
            .store
            .delete_processed_before(cutoff(now, self.config.processed_retention))
            .await?;
        let failed_deleted = self
            .store
            .delete_failed_before(cutoff(now, self.config.failed_retention))
            .await?;

        self.metrics.stale_released.add(stale_released);
        self.metrics
            .cleanup_deleted
            .add(processed_deleted + failed_deleted);

        if stale_released > 0 {
            warn!(stale_released, "released stale processing outbox rows");
        }
        if processed_deleted > 0 || failed_deleted > 0 {
            info!(processed_deleted, failed_deleted, "outbox cleanup completed");
        }

        Ok(CleanupReport {
            stale_released,
            processed_deleted,
            failed_deleted,
        })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.config.cleanup_interval, "outbox cleanup started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(err) = self.run_once(Utc::now()).await {
                        self.metrics.store_errors.inc();
                        warn!(error = %err, "outbox cleanup iteration failed");
                    }
                }
            }
        }
        info!("outbox cleanup stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::event::{NewOutboxEvent, OutboxEvent, OutboxStatus};
    use crate::outbox::in_memory::InMemoryOutboxStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn row(status: OutboxStatus, created_at: DateTime<Utc>) -> OutboxEvent {
        let mut event = NewOutboxEvent::new("order-1", "order.created", json!({}), "k")
            .into_event("orders", 3, created_at)
            .unwrap();
        event.status = status;
        if status == OutboxStatus::Processed {
            event.processed_at = Some(created_at);
        }
        if status == OutboxStatus::Processing {
            event.claimed_at = Some(created_at);
        }
        event
    }

    fn cleanup(store: Arc<InMemoryOutboxStore>) -> OutboxCleanup<InMemoryOutboxStore> {
        let config = OutboxConfig::default()
            .with_retention(Duration::from_secs(3600), Duration::from_secs(4 * 3600))
            .with_processing_timeout(Duration::from_secs(60));
        OutboxCleanup::new(store, config, Arc::new(OutboxMetrics::default()))
    }

    #[tokio::test]
    async fn deletes_by_retention_window() {
        let store = InMemoryOutboxStore::arc();
        let now = Utc::now();
        let two_hours = now - ChronoDuration::hours(2);
        let five_hours = now - ChronoDuration::hours(5);

        let old_processed = row(OutboxStatus::Processed, two_hours);
        let fresh_processed = row(OutboxStatus::Processed, now);
        let young_dead = row(OutboxStatus::DeadLetter, two_hours);
        let old_dead = row(OutboxStatus::DeadLetter, five_hours);
        let old_failed = row(OutboxStatus::Failed, five_hours);
        let old_pending = row(OutboxStatus::Pending, five_hours);
        for event in [&old_processed, &fresh_processed, &young_dead, &old_dead, &old_failed, &old_pending] {
            store.put(event.clone());
        }

        let cleanup = cleanup(store.clone());
        let report = cleanup.run_once(now).await.unwrap();

        assert_eq!(report.processed_deleted, 1);
        assert_eq!(report.failed_deleted, 2);
        let remaining: Vec<_> = store.all().into_iter().map(|e| e.id).collect();
        assert!(remaining.contains(&fresh_processed.id));
        assert!(remaining.contains(&young_dead.id));
        assert!(remaining.contains(&old_pending.id));
        assert_eq!(remaining.len(), 3);
        assert_eq!(cleanup.metrics.snapshot().cleanup_deleted, 3);
    }

    #[tokio::test]
    async fn releases_only_stale_claims() {
        let store = InMemoryOutboxStore::arc();
        let now = Utc::now();
        let stale = row(OutboxStatus::Processing, now - ChronoDuration::minutes(5));
        let active = row(OutboxStatus::Processing, now - ChronoDuration::seconds(5));
        store.put(stale.clone());
        store.put(active.clone());

        let report = cleanup(store.clone()).run_once(now).await.unwrap();

        assert_eq!(report.stale_released, 1);
        let stale = store.get(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, OutboxStatus::Pending);
        assert_eq!(stale.retry_count, 0);
        assert_eq!(
            store.get(active.id).await.unwrap().unwrap().status,
            OutboxStatus::Processing
        );
    }

    #[test]
    fn cutoff_saturates_for_huge_windows() {
        let now = Utc::now();
        assert_eq!(cutoff(now, Duration::from_secs(u64::MAX)), DateTime::<Utc>::MIN_UTC);
        assert_eq!(cutoff(now, Duration::from_secs(10)), now - ChronoDuration::seconds(10));
    }
}
