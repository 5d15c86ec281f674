//! In-memory broker for tests/dev.
//!
//! Implements the full [`Broker`] contract inside the process: topic and direct
//! exchanges, priority-ordered queues, message and per-message TTL with
//! dead-lettering, queue expiry, prefetch-bounded consumers, and requeue on
//! reject. Fault injection hooks let tests simulate an unreachable broker.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tracing::{debug, trace, warn};

use crate::broker::{
    Broker, BrokerError, Consumer, DEATH_QUEUE_HEADER, DEATH_REASON_HEADER, Delivery, ExchangeKind,
    QueueSpec, WireMessage,
};

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    seq: u64,
    exchange: String,
    routing_key: String,
    enqueued_at: Instant,
    redelivered: bool,
    message: WireMessage,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    /// Highest priority first, then FIFO by sequence.
    messages: BTreeMap<(Reverse<u8>, u64), QueuedMessage>,
    notify: Arc<Notify>,
    consumers: usize,
    last_used: Instant,
    /// Earliest TTL deadline among ready messages.
    next_deadline: Option<Instant>,
    /// Wakes the queue's expiry sweeper when `next_deadline` moves earlier.
    expiry_wake: Arc<Notify>,
    sweeping: bool,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            messages: BTreeMap::new(),
            notify: Arc::new(Notify::new()),
            consumers: 0,
            last_used: Instant::now(),
            next_deadline: None,
            expiry_wake: Arc::new(Notify::new()),
            sweeping: false,
        }
    }

    fn deadline(&self, queued: &QueuedMessage) -> Option<Instant> {
        self.ttl_for(&queued.message).map(|ttl| queued.enqueued_at + ttl)
    }

    fn recompute_deadline(&mut self) {
        self.next_deadline = self
            .messages
            .values()
            .filter_map(|queued| self.deadline(queued))
            .min();
    }

    fn ttl_for(&self, message: &WireMessage) -> Option<Duration> {
        match (self.spec.message_ttl, message.expiration) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn is_expired(&self, queued: &QueuedMessage, now: Instant) -> bool {
        self.ttl_for(&queued.message)
            .is_some_and(|ttl| now.duration_since(queued.enqueued_at) >= ttl)
    }
}

#[derive(Debug)]
struct Unacked {
    queued: QueuedMessage,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    available: AtomicBool,
    fail_publishes: AtomicU32,
    reject_publishes: AtomicU32,
    published: AtomicU64,
    next_seq: AtomicU64,
    next_tag: AtomicU64,
    sweepers: AtomicUsize,
    closed: watch::Sender<bool>,
}

/// In-process [`Broker`]. Cloning shares the same broker.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a message goes when it leaves a queue without being acked.
struct DeadLetter {
    exchange: String,
    routing_key: String,
    message: WireMessage,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                available: AtomicBool::new(true),
                fail_publishes: AtomicU32::new(0),
                reject_publishes: AtomicU32::new(0),
                published: AtomicU64::new(0),
                next_seq: AtomicU64::new(0),
                next_tag: AtomicU64::new(1),
                sweepers: AtomicUsize::new(0),
                closed,
            }),
        }
    }

    /// Make the next `n` publishes fail with a connection error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.shared.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` publishes be refused by the broker.
    pub fn reject_next_publishes(&self, n: u32) {
        self.shared.reject_publishes.store(n, Ordering::SeqCst);
    }

    /// Toggle reachability; while unavailable every operation fails with a
    /// connection error.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Number of publishes accepted so far.
    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::SeqCst)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Ready (not yet delivered) messages in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Expiry sweeper tasks currently running, at most one per queue.
    pub fn active_sweepers(&self) -> usize {
        self.shared.sweepers.load(Ordering::SeqCst)
    }

    /// Delivered but unsettled messages across all queues.
    pub fn unacked_len(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Remove and return every ready message in `queue`, in delivery order.
    pub fn drain(&self, queue: &str) -> Vec<WireMessage> {
        let mut state = self.lock();
        let Some(q) = state.queues.get_mut(queue) else {
            return Vec::new();
        };
        std::mem::take(&mut q.messages)
            .into_values()
            .map(|queued| queued.message)
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if *self.shared.closed.borrow() {
            return Err(BrokerError::Closed);
        }
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("broker unavailable".into()));
        }
        Ok(())
    }

    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Route `message` through `exchange` and enqueue it on every matching queue.
    fn route(
        &self,
        state: &mut State,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
    ) -> Result<(), BrokerError> {
        let Some(ex) = state.exchanges.get(exchange) else {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        };

        let mut targets: Vec<String> = ex
            .bindings
            .iter()
            .filter(|(_, key)| ex.kind.matches(key, routing_key))
            .map(|(queue, _)| queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            debug!(exchange, routing_key, "message matched no binding, dropped");
            return Ok(());
        }

        for queue in targets {
            self.enqueue(state, &queue, exchange, routing_key, message.clone(), false, None);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue(
        &self,
        state: &mut State,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
        redelivered: bool,
        seq: Option<u64>,
    ) {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let seq = seq.unwrap_or_else(|| self.shared.next_seq.fetch_add(1, Ordering::SeqCst));
        let priority = match q.spec.max_priority {
            Some(max) => message.priority.min(max),
            None => message.priority,
        };
        let queued = QueuedMessage {
            seq,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            enqueued_at: Instant::now(),
            redelivered,
            message,
        };
        let deadline = q.deadline(&queued);
        q.messages.insert((Reverse(priority), seq), queued);
        q.notify.notify_one();
        trace!(queue, seq, "message enqueued");

        let Some(deadline) = deadline else {
            return;
        };
        if q.next_deadline.is_none_or(|current| deadline < current) {
            q.next_deadline = Some(deadline);
            q.expiry_wake.notify_one();
        }
        if !q.sweeping {
            q.sweeping = true;
            self.shared.sweepers.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(self.clone().sweep(queue.to_string()));
        }
    }

    /// Per-queue expiry task: sleeps until the earliest deadline, dead-letters
    /// what is due, and exits once the queue holds no message with a TTL.
    async fn sweep(self, queue: String) {
        let mut closed = self.shared.closed.subscribe();
        loop {
            let (deadline, wake) = {
                let mut state = self.lock();
                let Some(q) = state.queues.get_mut(&queue) else {
                    break;
                };
                match q.next_deadline {
                    Some(deadline) => (deadline, Arc::clone(&q.expiry_wake)),
                    None => {
                        q.sweeping = false;
                        break;
                    }
                }
            };
            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    self.expire_due(&queue);
                }
                _ = wake.notified() => {}
                _ = closed.wait_for(|closed| *closed) => break,
            }
        }
        self.shared.sweepers.fetch_sub(1, Ordering::SeqCst);
        trace!(queue = %queue, "expiry sweeper stopped");
    }

    /// Dead-letter every message in `queue` whose TTL has elapsed.
    fn expire_due(&self, queue: &str) {
        let mut state = self.lock();
        let now = Instant::now();
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let expired: Vec<(Reverse<u8>, u64)> = q
            .messages
            .iter()
            .filter(|(_, queued)| q.is_expired(queued, now))
            .map(|(key, _)| *key)
            .collect();

        let mut dead = Vec::new();
        for key in expired {
            if let Some(queued) = q.messages.remove(&key) {
                if let Some(letter) = dead_letter_for(&q.spec, queued, "expired") {
                    dead.push(letter);
                }
            }
        }
        q.recompute_deadline();
        self.route_dead_letters(&mut state, queue, dead);
    }

    fn route_dead_letters(&self, state: &mut State, queue: &str, dead: Vec<DeadLetter>) {
        for letter in dead {
            if let Err(err) =
                self.route(state, &letter.exchange, &letter.routing_key, letter.message)
            {
                warn!(
                    queue,
                    exchange = %letter.exchange,
                    error = %err,
                    "failed to dead-letter expired message; dropped"
                );
            }
        }
    }

    fn sweep_expired_queues(state: &mut State) {
        let now = Instant::now();
        state.queues.retain(|name, q| {
            let expired = q.consumers == 0
                && q.spec
                    .expires
                    .is_some_and(|expires| now.duration_since(q.last_used) >= expires);
            if expired {
                debug!(queue = %name, "queue expired");
            }
            !expired
        });
        let queues = &state.queues;
        for ex in state.exchanges.values_mut() {
            ex.bindings.retain(|(queue, _)| queues.contains_key(queue));
        }
    }

    /// Pop the next deliverable message, dead-lettering expired ones on the way.
    fn next_ready(&self, queue: &str) -> Result<Option<QueuedMessage>, BrokerError> {
        let mut state = self.lock();
        let now = Instant::now();
        let mut dead = Vec::new();
        let next = {
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(BrokerError::NotFound(format!("queue '{queue}'")));
            };
            q.last_used = now;
            loop {
                let Some((_, queued)) = q.messages.pop_first() else {
                    break None;
                };
                if q.is_expired(&queued, now) {
                    if let Some(letter) = dead_letter_for(&q.spec, queued, "expired") {
                        dead.push(letter);
                    }
                    continue;
                }
                break Some(queued);
            }
        };
        self.route_dead_letters(&mut state, queue, dead);
        Ok(next)
    }

    async fn pump(
        self,
        queue: String,
        notify: Arc<Notify>,
        permits: Arc<Semaphore>,
        tx: mpsc::Sender<Delivery>,
    ) {
        let mut closed = self.shared.closed.subscribe();

        loop {
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = closed.wait_for(|closed| *closed) => break,
                _ = tx.closed() => break,
            };

            let queued = loop {
                match self.next_ready(&queue) {
                    Ok(Some(queued)) => break Some(queued),
                    Ok(None) => {}
                    Err(_) => break None,
                }
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = closed.wait_for(|closed| *closed) => break None,
                    _ = tx.closed() => break None,
                }
            };
            let Some(queued) = queued else {
                break;
            };

            let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst);
            let delivery = Delivery {
                tag,
                queue: queue.clone(),
                exchange: queued.exchange.clone(),
                routing_key: queued.routing_key.clone(),
                redelivered: queued.redelivered,
                message: queued.message.clone(),
            };
            self.lock().unacked.insert(
                tag,
                Unacked {
                    queued,
                    _permit: permit,
                },
            );

            if tx.send(delivery).await.is_err() {
                self.requeue_tag(&queue, tag);
                break;
            }
        }

        let mut state = self.lock();
        if let Some(q) = state.queues.get_mut(&queue) {
            q.consumers = q.consumers.saturating_sub(1);
            q.last_used = Instant::now();
        }
        debug!(queue = %queue, "consumer stopped");
    }

    fn requeue_tag(&self, queue: &str, tag: u64) {
        let mut state = self.lock();
        if let Some(unacked) = state.unacked.remove(&tag) {
            let queued = unacked.queued;
            self.enqueue(
                &mut state,
                queue,
                &queued.exchange,
                &queued.routing_key,
                queued.message,
                true,
                Some(queued.seq),
            );
        }
    }
}

fn dead_letter_for(spec: &QueueSpec, queued: QueuedMessage, reason: &str) -> Option<DeadLetter> {
    let exchange = spec.dead_letter_exchange.clone()?;
    let routing_key = spec
        .dead_letter_routing_key
        .clone()
        .unwrap_or(queued.routing_key);
    let mut message = queued.message;
    // The per-message expiration does not follow the message to its next queue.
    message.expiration = None;
    message
        .headers
        .insert(DEATH_REASON_HEADER.to_string(), reason.to_string());
    message
        .headers
        .insert(DEATH_QUEUE_HEADER.to_string(), spec.name.clone());
    Some(DeadLetter {
        exchange,
        routing_key,
        message,
    })
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.lock();
        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != kind {
                return Err(BrokerError::Rejected(format!(
                    "exchange '{name}' already declared as {:?}",
                    existing.kind
                )));
            }
            return Ok(());
        }
        state.exchanges.insert(
            name.to_string(),
            ExchangeState {
                kind,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn declare_queue(&self, spec: QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.lock();
        if let Some(existing) = state.queues.get_mut(&spec.name) {
            existing.last_used = Instant::now();
            return Ok(());
        }
        state.queues.insert(spec.name.clone(), QueueState::new(spec));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue '{queue}'")));
        }
        let Some(ex) = state.exchanges.get_mut(exchange) else {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        };
        let binding = (queue.to_string(), routing_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if Self::take_injected(&self.shared.fail_publishes) {
            return Err(BrokerError::Connection("injected publish failure".into()));
        }
        if Self::take_injected(&self.shared.reject_publishes) {
            return Err(BrokerError::Rejected("injected publish rejection".into()));
        }

        let mut state = self.lock();
        Self::sweep_expired_queues(&mut state);
        self.route(&mut state, exchange, routing_key, message)?;
        self.shared.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Consumer, BrokerError> {
        self.ensure_open()?;
        let notify = {
            let mut state = self.lock();
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(BrokerError::NotFound(format!("queue '{queue}'")));
            };
            q.consumers += 1;
            q.last_used = Instant::now();
            Arc::clone(&q.notify)
        };

        let prefetch = usize::from(prefetch.max(1));
        let (tx, rx) = mpsc::channel(prefetch);
        let permits = Arc::new(Semaphore::new(prefetch));
        tokio::spawn(self.clone().pump(queue.to_string(), notify, permits, tx));

        Ok(Consumer::new(queue, rx))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.ensure_open()?;
        match self.lock().unacked.remove(&delivery.tag) {
            Some(_) => Ok(()),
            None => Err(BrokerError::NotFound(format!("delivery tag {}", delivery.tag))),
        }
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if requeue {
            if !self.lock().unacked.contains_key(&delivery.tag) {
                return Err(BrokerError::NotFound(format!("delivery tag {}", delivery.tag)));
            }
            self.requeue_tag(&delivery.queue, delivery.tag);
            return Ok(());
        }

        let mut state = self.lock();
        let Some(unacked) = state.unacked.remove(&delivery.tag) else {
            return Err(BrokerError::NotFound(format!("delivery tag {}", delivery.tag)));
        };
        let letter = state
            .queues
            .get(&delivery.queue)
            .and_then(|q| dead_letter_for(&q.spec, unacked.queued, "rejected"));
        if let Some(letter) = letter {
            self.route(&mut state, &letter.exchange, &letter.routing_key, letter.message)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.closed.send_replace(true);
        debug!("in-memory broker closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker_with_queue(queue: QueueSpec) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("events", ExchangeKind::Topic).await.unwrap();
        let name = queue.name.clone();
        broker.declare_queue(queue).await.unwrap();
        broker.bind_queue(&name, "events", "order.*").await.unwrap();
        broker
    }

    fn message(body: &str, priority: u8) -> WireMessage {
        WireMessage::new(body.as_bytes().to_vec()).with_priority(priority)
    }

    #[tokio::test]
    async fn routes_by_topic_pattern() {
        let broker = broker_with_queue(QueueSpec::new("orders")).await;

        broker.publish("events", "order.created", message("a", 2)).await.unwrap();
        broker.publish("events", "payment.failed", message("b", 2)).await.unwrap();

        assert_eq!(broker.queue_len("orders"), 1);
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn higher_priority_is_delivered_first() {
        let broker = broker_with_queue(QueueSpec::new("orders")).await;
        broker.publish("events", "order.a", message("low", 1)).await.unwrap();
        broker.publish("events", "order.b", message("critical", 4)).await.unwrap();
        broker.publish("events", "order.c", message("normal", 2)).await.unwrap();

        let bodies: Vec<Vec<u8>> = broker.drain("orders").into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![b"critical".to_vec(), b"normal".to_vec(), b"low".to_vec()]);
    }

    #[tokio::test]
    async fn unknown_exchange_is_not_found() {
        let broker = InMemoryBroker::new();
        let err = broker.publish("missing", "x", message("a", 1)).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let broker = broker_with_queue(QueueSpec::new("orders")).await;
        broker.fail_next_publishes(1);

        let first = broker.publish("events", "order.x", message("a", 1)).await;
        let second = broker.publish("events", "order.x", message("a", 1)).await;

        assert!(first.unwrap_err().is_connection());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn unavailable_broker_fails_every_call() {
        let broker = broker_with_queue(QueueSpec::new("orders")).await;
        broker.set_available(false);
        assert!(broker.publish("events", "order.x", message("a", 1)).await.unwrap_err().is_connection());

        broker.set_available(true);
        assert!(broker.publish("events", "order.x", message("a", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn expired_messages_are_dead_lettered() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("delay", ExchangeKind::Direct).await.unwrap();
        broker.declare_exchange("retry", ExchangeKind::Direct).await.unwrap();
        broker
            .declare_queue(
                QueueSpec::new("orders.delay.20")
                    .with_message_ttl(Duration::from_millis(20))
                    .with_dead_letter("retry", Some("orders".into())),
            )
            .await
            .unwrap();
        broker.declare_queue(QueueSpec::new("orders")).await.unwrap();
        broker.bind_queue("orders.delay.20", "delay", "orders.delay.20").await.unwrap();
        broker.bind_queue("orders", "retry", "orders").await.unwrap();

        broker.publish("delay", "orders.delay.20", message("later", 2)).await.unwrap();
        assert_eq!(broker.queue_len("orders"), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let arrived = broker.drain("orders");
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].header(DEATH_REASON_HEADER), Some("expired"));
    }

    #[tokio::test]
    async fn ttl_messages_share_one_sweeper_per_queue() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("dlx", ExchangeKind::Direct).await.unwrap();
        broker
            .declare_queue(
                QueueSpec::new("orders.dead_letter").with_message_ttl(Duration::from_secs(3600)),
            )
            .await
            .unwrap();
        broker.bind_queue("orders.dead_letter", "dlx", "orders").await.unwrap();

        for i in 0..200 {
            broker.publish("dlx", "orders", message(&i.to_string(), 2)).await.unwrap();
        }
        tokio::task::yield_now().await;

        assert_eq!(broker.active_sweepers(), 1);
        assert_eq!(broker.queue_len("orders.dead_letter"), 200);
        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn sweeper_rearms_for_an_earlier_deadline() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("events", ExchangeKind::Direct).await.unwrap();
        broker.declare_exchange("retry", ExchangeKind::Direct).await.unwrap();
        broker
            .declare_queue(QueueSpec::new("orders.delay").with_dead_letter("retry", Some("orders".into())))
            .await
            .unwrap();
        broker.declare_queue(QueueSpec::new("orders")).await.unwrap();
        broker.bind_queue("orders.delay", "events", "orders.delay").await.unwrap();
        broker.bind_queue("orders", "retry", "orders").await.unwrap();

        let slow = message("slow", 2).with_expiration(Some(Duration::from_secs(60)));
        let fast = message("fast", 2).with_expiration(Some(Duration::from_millis(20)));
        broker.publish("events", "orders.delay", slow).await.unwrap();
        broker.publish("events", "orders.delay", fast).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let arrived = broker.drain("orders");
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].body, b"fast");
        assert_eq!(broker.queue_len("orders.delay"), 1);
        assert_eq!(broker.active_sweepers(), 1);
    }

    #[tokio::test]
    async fn sweeper_exits_once_no_ttl_message_remains() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("events", ExchangeKind::Direct).await.unwrap();
        broker
            .declare_queue(QueueSpec::new("orders.delay").with_message_ttl(Duration::from_millis(10)))
            .await
            .unwrap();
        broker.bind_queue("orders.delay", "events", "orders.delay").await.unwrap();
        broker.publish("events", "orders.delay", message("gone", 2)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(broker.queue_len("orders.delay"), 0);
        assert_eq!(broker.active_sweepers(), 0);
    }

    #[tokio::test]
    async fn consumer_respects_prefetch_and_settlement() {
        let broker = broker_with_queue(QueueSpec::new("orders")).await;
        for i in 0..3 {
            broker.publish("events", "order.x", message(&i.to_string(), 2)).await.unwrap();
        }

        let mut consumer = broker.consume("orders", 1).await.unwrap();
        let first = consumer.next().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.unacked_len(), 1);
        assert_eq!(broker.queue_len("orders"), 2);

        broker.ack(&first).await.unwrap();
        let second = consumer.next().await.unwrap();
        broker.reject(&second, true).await.unwrap();
        let again = consumer.next().await.unwrap();

        assert_eq!(again.message.body, second.message.body);
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn reject_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("events", ExchangeKind::Topic).await.unwrap();
        broker.declare_exchange("dlx", ExchangeKind::Direct).await.unwrap();
        broker.declare_queue(QueueSpec::new("orders.dead_letter")).await.unwrap();
        broker.bind_queue("orders.dead_letter", "dlx", "orders").await.unwrap();
        broker
            .declare_queue(QueueSpec::new("orders").with_dead_letter("dlx", Some("orders".into())))
            .await
            .unwrap();
        broker.bind_queue("orders", "events", "order.#").await.unwrap();

        broker.publish("events", "order.created", message("x", 2)).await.unwrap();
        let mut consumer = broker.consume("orders", 4).await.unwrap();
        let delivery = consumer.next().await.unwrap();
        broker.reject(&delivery, false).await.unwrap();

        let dead = broker.drain("orders.dead_letter");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].header(DEATH_REASON_HEADER), Some("rejected"));
        assert_eq!(dead[0].header(DEATH_QUEUE_HEADER), Some("orders"));
    }

    #[tokio::test]
    async fn close_ends_consumers() {
        let broker = broker_with_queue(QueueSpec::new("orders")).await;
        let mut consumer = broker.consume("orders", 2).await.unwrap();

        broker.close().await.unwrap();
        assert!(consumer.next().await.is_none());
        assert!(matches!(
            broker.publish("events", "order.x", message("a", 1)).await,
            Err(BrokerError::Closed)
        ));
    }
}
