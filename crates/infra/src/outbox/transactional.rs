//! Producer-facing façade: business writes and outbox rows in one transaction.
//!
//! ```ignore
//! let mut tx = outbox.begin().await?;
//! save_order(tx.connection(), &order).await?;
//! tx.create_event(NewOutboxEvent::new(order.id, "order.created", payload, "orders.created")).await?;
//! tx.commit().await?;
//! ```
//!
//! Nothing reaches the broker from here; the processor publishes committed rows
//! later. A rolled back (or dropped) transaction therefore publishes nothing.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use herald_core::EventId;

use super::event::NewOutboxEvent;
use super::processor::OutboxConfig;
use super::store::{OutboxError, OutboxStore};

#[derive(Debug)]
pub struct TransactionalOutbox<S> {
    store: Arc<S>,
    source_service: String,
    default_max_retries: u32,
}

impl<S: OutboxStore> TransactionalOutbox<S> {
    pub fn new(store: Arc<S>, config: &OutboxConfig) -> Self {
        Self {
            store,
            source_service: config.source_service.clone(),
            default_max_retries: config.default_max_retries,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn begin(&self) -> Result<OutboxTransaction<'_, S>, OutboxError> {
        let tx = self.store.begin().await?;
        Ok(OutboxTransaction {
            outbox: self,
            tx,
            created: Vec::new(),
        })
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut OutboxTransaction<'_, S>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<OutboxError> + Send,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "outbox transaction rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// An open unit of work. Dropping it without [`OutboxTransaction::commit`]
/// discards every write made through it.
pub struct OutboxTransaction<'a, S: OutboxStore> {
    outbox: &'a TransactionalOutbox<S>,
    tx: S::Tx,
    created: Vec<EventId>,
}

impl<S: OutboxStore> std::fmt::Debug for OutboxTransaction<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxTransaction")
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

impl<S: OutboxStore> OutboxTransaction<'_, S> {
    /// The store's native transaction, for the caller's business writes.
    pub fn connection(&mut self) -> &mut S::Tx {
        &mut self.tx
    }

    /// Stage a `pending` outbox row. Validation and persistence errors are
    /// returned to the caller, who decides whether to abort the transaction.
    pub async fn create_event(&mut self, event: NewOutboxEvent) -> Result<EventId, OutboxError> {
        let outbox = self.outbox;
        let event = event.into_event(&outbox.source_service, outbox.default_max_retries, Utc::now())?;
        outbox.store.insert(&mut self.tx, &event).await?;
        debug!(
            event_id = %event.id,
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type,
            "outbox event staged"
        );
        self.created.push(event.id);
        Ok(event.id)
    }

    /// Events staged so far.
    pub fn created(&self) -> &[EventId] {
        &self.created
    }

    /// Commit business writes and outbox rows together; returns the new ids.
    pub async fn commit(self) -> Result<Vec<EventId>, OutboxError> {
        self.outbox.store.commit(self.tx).await?;
        debug!(events = self.created.len(), "outbox transaction committed");
        Ok(self.created)
    }

    pub async fn rollback(self) -> Result<(), OutboxError> {
        self.outbox.store.rollback(self.tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::event::OutboxStatus;
    use crate::outbox::in_memory::InMemoryOutboxStore;
    use serde_json::json;

    fn outbox() -> TransactionalOutbox<InMemoryOutboxStore> {
        TransactionalOutbox::new(
            InMemoryOutboxStore::arc(),
            &OutboxConfig::default()
                .with_source_service("orders")
                .with_default_max_retries(5),
        )
    }

    fn order_created() -> NewOutboxEvent {
        NewOutboxEvent::new("order-1", "order.created", json!({"total": 42}), "orders.created")
    }

    #[tokio::test]
    async fn commit_persists_record_and_event_together() {
        let outbox = outbox();
        let mut tx = outbox.begin().await.unwrap();
        tx.connection().put_record("order-1", json!({"total": 42}));
        let id = tx.create_event(order_created()).await.unwrap();
        assert_eq!(tx.created(), &[id]);
        assert_eq!(tx.commit().await.unwrap(), vec![id]);

        let store = outbox.store();
        assert_eq!(store.record("order-1"), Some(json!({"total": 42})));
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.source_service, "orders");
        assert_eq!(row.max_retries, 5);
    }

    #[tokio::test]
    async fn rollback_and_drop_persist_nothing() {
        let outbox = outbox();

        let mut tx = outbox.begin().await.unwrap();
        tx.connection().put_record("order-1", json!({}));
        tx.create_event(order_created()).await.unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = outbox.begin().await.unwrap();
            tx.create_event(order_created()).await.unwrap();
        }

        assert_eq!(outbox.store().status_counts().await.unwrap().total(), 0);
        assert!(outbox.store().record("order-1").is_none());
    }

    #[tokio::test]
    async fn closure_error_rolls_back() {
        let outbox = outbox();

        let result: Result<(), OutboxError> = outbox
            .transaction(|tx| {
                Box::pin(async move {
                    tx.connection().put_record("order-1", json!({}));
                    tx.create_event(order_created()).await?;
                    Err(OutboxError::Validation("insufficient stock".into()))
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(outbox.store().status_counts().await.unwrap().total(), 0);
        assert!(outbox.store().record("order-1").is_none());
    }

    #[tokio::test]
    async fn closure_success_commits() {
        let outbox = outbox();

        let id = outbox
            .transaction(|tx| {
                Box::pin(async move {
                    tx.connection().put_record("order-1", json!({}));
                    tx.create_event(order_created().with_max_retries(2)).await
                })
            })
            .await
            .unwrap();

        assert_eq!(outbox.store().get(id).await.unwrap().unwrap().max_retries, 2);
        assert!(outbox.store().record("order-1").is_some());
    }

    #[tokio::test]
    async fn invalid_event_is_surfaced_to_the_caller() {
        let outbox = outbox();
        let mut tx = outbox.begin().await.unwrap();
        let err = tx
            .create_event(NewOutboxEvent::new("order-1", " ", json!({}), "k"))
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::Validation(_)));
        assert!(tx.created().is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_begin() {
        let outbox = outbox();
        outbox.store().set_available(false);
        assert!(matches!(outbox.begin().await, Err(OutboxError::Persistence(_))));
    }
}
