//! In-memory outbox store for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use herald_core::EventId;

use super::event::{OutboxEvent, OutboxStatus};
use super::store::{OutboxError, OutboxStore, StatusCounts};

/// Transaction over [`InMemoryOutboxStore`].
///
/// Besides outbox rows it can stage generic business records, which makes the
/// all-or-nothing behaviour of a transaction observable in tests.
#[derive(Debug, Default)]
pub struct InMemoryTx {
    events: Vec<OutboxEvent>,
    records: Vec<(String, JsonValue)>,
}

impl InMemoryTx {
    /// Stage a business record write.
    pub fn put_record(&mut self, key: impl Into<String>, value: JsonValue) {
        self.records.push((key.into(), value));
    }

    pub fn staged_events(&self) -> usize {
        self.events.len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    rows: HashMap<EventId, OutboxEvent>,
    records: BTreeMap<String, JsonValue>,
}

#[derive(Debug)]
pub struct InMemoryOutboxStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the database going away; every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// A committed business record.
    pub fn record(&self, key: &str) -> Option<JsonValue> {
        self.lock().ok()?.records.get(key).cloned()
    }

    /// Every row, oldest first.
    pub fn all(&self) -> Vec<OutboxEvent> {
        let Ok(inner) = self.lock() else {
            return Vec::new();
        };
        let mut rows: Vec<OutboxEvent> = inner.rows.values().cloned().collect();
        rows.sort_by_key(|row| (row.created_at, row.id));
        rows
    }

    /// Overwrite a stored row, bypassing lifecycle rules.
    pub fn put(&self, event: OutboxEvent) {
        if let Ok(mut inner) = self.lock() {
            inner.rows.insert(event.id, event);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, OutboxError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(OutboxError::Persistence("store unavailable".into()));
        }
        self.inner
            .lock()
            .map_err(|_| OutboxError::Persistence("store lock poisoned".into()))
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

fn oldest_first(rows: &mut [OutboxEvent]) {
    rows.sort_by_key(|row| (row.created_at, row.id));
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, OutboxError> {
        drop(self.lock()?);
        Ok(InMemoryTx::default())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), OutboxError> {
        let mut inner = self.lock()?;
        if let Some(dup) = tx.events.iter().find(|e| inner.rows.contains_key(&e.id)) {
            return Err(OutboxError::Persistence(format!("duplicate outbox id {}", dup.id)));
        }
        for event in tx.events {
            inner.rows.insert(event.id, event);
        }
        for (key, value) in tx.records {
            inner.records.insert(key, value);
        }
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), OutboxError> {
        drop(tx);
        Ok(())
    }

    async fn insert(&self, tx: &mut Self::Tx, event: &OutboxEvent) -> Result<(), OutboxError> {
        if event.status != OutboxStatus::Pending {
            return Err(OutboxError::InvalidState {
                id: event.id,
                status: event.status,
            });
        }
        tx.events.push(event.clone());
        Ok(())
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let mut inner = self.lock()?;
        let mut due: Vec<OutboxEvent> = inner
            .rows
            .values()
            .filter(|row| row.is_due(now))
            .cloned()
            .collect();
        oldest_first(&mut due);
        due.truncate(limit);

        for row in &mut due {
            row.mark_processing(now);
            inner.rows.insert(row.id, row.clone());
        }
        Ok(due)
    }

    async fn save_outcomes(&self, events: &[OutboxEvent]) -> Result<(), OutboxError> {
        let mut inner = self.lock()?;
        for event in events {
            if let Some(row) = inner.rows.get_mut(&event.id) {
                if row.status == OutboxStatus::Processing {
                    *row = event.clone();
                }
            }
        }
        Ok(())
    }

    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, OutboxError> {
        let mut inner = self.lock()?;
        let mut released = 0;
        for row in inner.rows.values_mut() {
            let stale = row.status == OutboxStatus::Processing
                && row.claimed_at.is_none_or(|at| at < claimed_before);
            if stale {
                row.release();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxError> {
        let mut inner = self.lock()?;
        let before = inner.rows.len();
        inner.rows.retain(|_, row| {
            !(row.status == OutboxStatus::Processed && row.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - inner.rows.len()) as u64)
    }

    async fn delete_failed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxError> {
        let mut inner = self.lock()?;
        let before = inner.rows.len();
        inner.rows.retain(|_, row| {
            let terminal_failure =
                matches!(row.status, OutboxStatus::DeadLetter | OutboxStatus::Failed);
            !(terminal_failure && row.created_at < cutoff)
        });
        Ok((before - inner.rows.len()) as u64)
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxError> {
        Ok(self.lock()?.rows.get(&id).cloned())
    }

    async fn find_by_aggregate(
        &self,
        aggregate_id: &str,
        event_type: Option<&str>,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let inner = self.lock()?;
        let mut rows: Vec<OutboxEvent> = inner
            .rows
            .values()
            .filter(|row| row.aggregate_id == aggregate_id)
            .filter(|row| event_type.is_none_or(|t| row.event_type == t))
            .cloned()
            .collect();
        oldest_first(&mut rows);
        Ok(rows)
    }

    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let inner = self.lock()?;
        let mut rows: Vec<OutboxEvent> = inner
            .rows
            .values()
            .filter(|row| row.correlation_id.as_deref() == Some(correlation_id))
            .cloned()
            .collect();
        oldest_first(&mut rows);
        Ok(rows)
    }

    async fn status_counts(&self) -> Result<StatusCounts, OutboxError> {
        let inner = self.lock()?;
        let mut counts = StatusCounts::default();
        for row in inner.rows.values() {
            counts.add(row.status, 1);
        }
        Ok(counts)
    }

    async fn requeue_dead_letter(&self, id: EventId) -> Result<OutboxEvent, OutboxError> {
        let mut inner = self.lock()?;
        let row = inner.rows.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        row.requeue()?;
        Ok(row.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::event::NewOutboxEvent;
    use chrono::Duration;
    use serde_json::json;

    fn new_event(aggregate: &str, at: DateTime<Utc>) -> OutboxEvent {
        NewOutboxEvent::new(aggregate, "order.created", json!({}), "order.created")
            .with_correlation_id("corr-1")
            .into_event("orders", 3, at)
            .unwrap()
    }

    async fn committed(store: &InMemoryOutboxStore, events: &[OutboxEvent]) {
        let mut tx = store.begin().await.unwrap();
        for event in events {
            store.insert(&mut tx, event).await.unwrap();
        }
        store.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_transaction_persists_nothing() {
        let store = InMemoryOutboxStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.put_record("order-1", json!({"total": 5}));
            store.insert(&mut tx, &new_event("order-1", Utc::now())).await.unwrap();
        }

        assert_eq!(store.status_counts().await.unwrap().total(), 0);
        assert!(store.record("order-1").is_none());
    }

    #[tokio::test]
    async fn claims_oldest_due_rows_once() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let older = new_event("a", now - Duration::seconds(10));
        let newer = new_event("b", now - Duration::seconds(5));
        let mut later = new_event("c", now - Duration::seconds(20));
        later.next_retry_at = Some(now + Duration::seconds(30));
        committed(&store, &[newer.clone(), older.clone(), later]).await;

        let batch = store.claim_batch(10, now).await.unwrap();
        let ids: Vec<EventId> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
        assert!(batch.iter().all(|e| e.status == OutboxStatus::Processing));

        assert!(store.claim_batch(10, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outcomes_only_apply_to_processing_rows() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        committed(&store, &[new_event("a", now)]).await;

        let mut batch = store.claim_batch(1, now).await.unwrap();
        store.release_stale(now + Duration::seconds(1)).await.unwrap();
        batch[0].mark_processed(now);
        store.save_outcomes(&batch).await.unwrap();

        let row = store.get(batch[0].id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn lookups_and_requeue() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let mut dead = new_event("order-9", now);
        dead.status = OutboxStatus::DeadLetter;
        dead.retry_count = 3;
        store.put(dead.clone());

        assert_eq!(store.find_by_aggregate("order-9", Some("order.created")).await.unwrap().len(), 1);
        assert!(store.find_by_aggregate("order-9", Some("order.cancelled")).await.unwrap().is_empty());
        assert_eq!(store.find_by_correlation("corr-1").await.unwrap().len(), 1);

        let requeued = store.requeue_dead_letter(dead.id).await.unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
        assert!(matches!(
            store.requeue_dead_letter(EventId::new()).await,
            Err(OutboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_store_reports_persistence_errors() {
        let store = InMemoryOutboxStore::new();
        store.set_available(false);
        assert!(matches!(store.begin().await, Err(OutboxError::Persistence(_))));
        assert!(matches!(store.claim_batch(5, Utc::now()).await, Err(OutboxError::Persistence(_))));
    }
}
