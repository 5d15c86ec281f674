//! Redis Streams-backed [`Broker`] (durable, at-least-once delivery).
//!
//! ## Key layout
//!
//! With the default prefix `herald`:
//! - `herald:exchanges`: hash, exchange name → kind (`direct` / `topic`)
//! - `herald:bindings:<exchange>`: set of `<queue>\n<binding key>`
//! - `herald:queues`: set of declared queue names
//! - `herald:queue:<name>`: the queue itself, a stream read through the
//!   consumer group `herald`
//! - `herald:queue:<name>:spec`: JSON queue arguments (TTL, expiry, dead-letter target)
//! - `herald:queue:<name>:expiry`: sorted set, entry id scored by its expiry
//!   time in epoch millis
//!
//! ## Semantics
//!
//! - Routing happens on publish: the exchange's bindings are matched with
//!   AMQP topic/direct rules and the message is appended to every matching
//!   queue stream. Unroutable messages are dropped.
//! - Acked entries are removed from the stream (`XACK` + `XDEL`).
//! - A sweeper task promotes due entries from the expiry sets: each one is
//!   removed from its stream and dead-lettered through the queue's configured
//!   exchange. Consumers also dead-letter expired entries they read.
//! - Queue expiry maps to `PEXPIRE` on the queue keys, refreshed while a
//!   consumer is attached.
//! - Entries left pending by a dead consumer are reclaimed with `XAUTOCLAIM`
//!   after `claim_idle` and redelivered.
//! - Streams are FIFO; message priority is carried but does not reorder delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::Value;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use herald_events::{
    Broker, BrokerError, Consumer, DEATH_QUEUE_HEADER, DEATH_REASON_HEADER, Delivery,
    ExchangeKind, QueueSpec, WireMessage,
};

#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Prefix for every key the broker touches.
    pub prefix: String,
    /// Consumer group shared by all consumers of a queue.
    pub group: String,
    /// How long one `XREADGROUP` blocks waiting for entries.
    pub block: Duration,
    /// Pending entries idle this long are reclaimed from their consumer.
    pub claim_idle: Duration,
    pub sweep_interval: Duration,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            prefix: "herald".to_string(),
            group: "herald".to_string(),
            block: Duration::from_millis(1000),
            claim_idle: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(250),
        }
    }
}

impl RedisBrokerConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    fn exchanges_key(&self) -> String {
        format!("{}:exchanges", self.prefix)
    }

    fn bindings_key(&self, exchange: &str) -> String {
        format!("{}:bindings:{exchange}", self.prefix)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn stream_key(&self, queue: &str) -> String {
        format!("{}:queue:{queue}", self.prefix)
    }

    fn spec_key(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:spec", self.prefix)
    }

    fn expiry_key(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:expiry", self.prefix)
    }
}

/// Queue arguments as persisted in Redis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredSpec {
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
    message_ttl_ms: Option<u64>,
    expires_ms: Option<u64>,
}

impl From<&QueueSpec> for StoredSpec {
    fn from(spec: &QueueSpec) -> Self {
        Self {
            dead_letter_exchange: spec.dead_letter_exchange.clone(),
            dead_letter_routing_key: spec.dead_letter_routing_key.clone(),
            message_ttl_ms: spec.message_ttl.map(duration_ms),
            expires_ms: spec.expires.map(duration_ms),
        }
    }
}

/// A stream entry decoded back into a message.
#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    expires_at_ms: Option<i64>,
    message: WireMessage,
}

impl StoredMessage {
    fn decode(fields: &HashMap<String, Vec<u8>>) -> Result<Self, BrokerError> {
        let text = |name: &str| -> Result<String, BrokerError> {
            fields
                .get(name)
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .ok_or_else(|| BrokerError::Rejected(format!("stream entry missing '{name}'")))
        };
        let optional_i64 = |name: &str| {
            fields
                .get(name)
                .and_then(|raw| String::from_utf8_lossy(raw).parse::<i64>().ok())
        };

        let headers = serde_json::from_str(&text("headers")?)
            .map_err(|e| BrokerError::Rejected(format!("invalid stream headers: {e}")))?;
        let body = fields
            .get("body")
            .cloned()
            .ok_or_else(|| BrokerError::Rejected("stream entry missing 'body'".into()))?;

        let mut message = WireMessage::new(body)
            .with_priority(text("priority")?.parse().unwrap_or(0))
            .with_expiration(
                optional_i64("expiration_ms").map(|ms| Duration::from_millis(ms.max(0) as u64)),
            );
        message.headers = headers;

        Ok(Self {
            exchange: text("exchange")?,
            routing_key: text("routing_key")?,
            redelivered: text("redelivered")? == "1",
            expires_at_ms: optional_i64("expires_at"),
            message,
        })
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

#[derive(Debug)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct Inflight {
    queue: String,
    entry_id: String,
    stored: StoredMessage,
    _permit: OwnedSemaphorePermit,
}

struct Inner {
    client: redis::Client,
    conn: MultiplexedConnection,
    config: RedisBrokerConfig,
    inflight: Mutex<HashMap<u64, Inflight>>,
    next_tag: AtomicU64,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// [`Broker`] over Redis Streams. Cloning shares the connection.
#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    inner: Arc<Inner>,
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        BrokerError::Connection(format!("{operation}: {err}"))
    } else {
        BrokerError::Rejected(format!("{operation}: {err}"))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn kind_name(kind: ExchangeKind) -> &'static str {
    match kind {
        ExchangeKind::Direct => "direct",
        ExchangeKind::Topic => "topic",
    }
}

fn parse_kind(name: &str) -> Option<ExchangeKind> {
    match name {
        "direct" => Some(ExchangeKind::Direct),
        "topic" => Some(ExchangeKind::Topic),
        _ => None,
    }
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(status) => Some(status.clone()),
        _ => None,
    }
}

/// Parse `[[id, [field, value, ...]], ...]`. Entries deleted while pending
/// come back with nil fields and are skipped.
fn parse_entries(value: &Value) -> Vec<StreamEntry> {
    let Value::Bulk(entries) = value else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let Value::Bulk(parts) = entry else {
                return None;
            };
            let id = value_string(parts.first()?)?;
            let Some(Value::Bulk(pairs)) = parts.get(1) else {
                return None;
            };
            let fields = pairs
                .chunks(2)
                .filter_map(|pair| match pair {
                    [key, Value::Data(data)] => Some((value_string(key)?, data.clone())),
                    _ => None,
                })
                .collect();
            Some(StreamEntry { id, fields })
        })
        .collect()
}

/// `XREADGROUP` reply: nil on timeout, else `[[stream, entries], ...]`.
fn parse_read_reply(value: &Value) -> Vec<StreamEntry> {
    let Value::Bulk(streams) = value else {
        return Vec::new();
    };
    streams
        .iter()
        .flat_map(|stream| match stream {
            Value::Bulk(parts) => parts.get(1).map(parse_entries).unwrap_or_default(),
            _ => Vec::new(),
        })
        .collect()
}

impl RedisStreamsBroker {
    pub async fn connect(redis_url: &str, config: RedisBrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(|e| map_redis_error("open", e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        let (closed, _) = watch::channel(false);

        let broker = Self {
            inner: Arc::new(Inner {
                client,
                conn,
                config,
                inflight: Mutex::new(HashMap::new()),
                next_tag: AtomicU64::new(1),
                closed,
                tasks: Mutex::new(Vec::new()),
            }),
        };
        let sweeper = tokio::spawn(Arc::clone(&broker.inner).sweep_loop());
        broker.inner.track(sweeper);
        info!(prefix = %broker.inner.config.prefix, "redis streams broker connected");
        Ok(broker)
    }

    pub fn config(&self) -> &RedisBrokerConfig {
        &self.inner.config
    }
}

impl Inner {
    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if *self.closed.borrow() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    async fn load_spec(&self, queue: &str) -> Result<Option<StoredSpec>, BrokerError> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.config.spec_key(queue))
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_redis_error("GET spec", e))?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| BrokerError::Rejected(format!("invalid spec for queue '{queue}': {e}")))
        })
        .transpose()
    }

    /// Append `message` to every queue bound to `exchange` under a matching key.
    async fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &WireMessage,
    ) -> Result<usize, BrokerError> {
        let mut conn = self.conn();
        let kind: Option<String> = redis::cmd("HGET")
            .arg(self.config.exchanges_key())
            .arg(exchange)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("HGET exchange", e))?;
        let kind = kind
            .as_deref()
            .and_then(parse_kind)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange '{exchange}'")))?;

        let bindings: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.config.bindings_key(exchange))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("SMEMBERS bindings", e))?;

        let mut queues: Vec<&str> = bindings
            .iter()
            .filter_map(|binding| binding.split_once('\n'))
            .filter(|(_, key)| kind.matches(key, routing_key))
            .map(|(queue, _)| queue)
            .collect();
        queues.sort_unstable();
        queues.dedup();

        let mut delivered = 0;
        for queue in queues {
            if self.enqueue(queue, exchange, routing_key, message, false, None).await? {
                delivered += 1;
            }
        }
        if delivered == 0 {
            debug!(exchange, routing_key, "message matched no queue; dropped");
        }
        Ok(delivered)
    }

    /// Returns `false` when the queue no longer exists.
    async fn enqueue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        message: &WireMessage,
        redelivered: bool,
        expires_at_ms: Option<i64>,
    ) -> Result<bool, BrokerError> {
        let Some(spec) = self.load_spec(queue).await? else {
            debug!(queue, "skipping expired or undeclared queue");
            return Ok(false);
        };

        let ttl_ms = match (spec.message_ttl_ms, message.expiration.map(duration_ms)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let expires_at_ms = expires_at_ms.or_else(|| {
            ttl_ms.map(|ttl| now_ms().saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX)))
        });
        let headers = serde_json::to_string(&message.headers)
            .map_err(|e| BrokerError::Rejected(format!("unencodable headers: {e}")))?;

        let mut xadd = redis::cmd("XADD");
        xadd.arg(self.config.stream_key(queue))
            .arg("*")
            .arg("body")
            .arg(message.body.as_slice())
            .arg("headers")
            .arg(headers)
            .arg("priority")
            .arg(message.priority)
            .arg("exchange")
            .arg(exchange)
            .arg("routing_key")
            .arg(routing_key)
            .arg("redelivered")
            .arg(if redelivered { "1" } else { "0" });
        if let Some(expiration) = message.expiration {
            xadd.arg("expiration_ms").arg(duration_ms(expiration));
        }
        if let Some(at) = expires_at_ms {
            xadd.arg("expires_at").arg(at);
        }

        let mut conn = self.conn();
        let id: String = xadd
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XADD", e))?;
        if let Some(at) = expires_at_ms {
            let _: i64 = redis::cmd("ZADD")
                .arg(self.config.expiry_key(queue))
                .arg(at)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("ZADD expiry", e))?;
        }
        Ok(true)
    }

    /// Remove an entry from its queue for good.
    async fn settle(&self, queue: &str, entry_id: &str) -> Result<(), BrokerError> {
        let stream = self.config.stream_key(queue);
        let _: () = redis::pipe()
            .cmd("XACK")
            .arg(&stream)
            .arg(&self.config.group)
            .arg(entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&stream)
            .arg(entry_id)
            .ignore()
            .cmd("ZREM")
            .arg(self.config.expiry_key(queue))
            .arg(entry_id)
            .ignore()
            .query_async(&mut self.conn())
            .await
            .map_err(|e| map_redis_error("settle", e))?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        queue: &str,
        stored: StoredMessage,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let Some(spec) = self.load_spec(queue).await? else {
            return Ok(());
        };
        let Some(exchange) = spec.dead_letter_exchange else {
            debug!(queue, reason, "no dead-letter exchange; message dropped");
            return Ok(());
        };
        let routing_key = spec.dead_letter_routing_key.unwrap_or(stored.routing_key);
        let mut message = stored.message;
        message.expiration = None;
        message
            .headers
            .insert(DEATH_REASON_HEADER.to_string(), reason.to_string());
        message
            .headers
            .insert(DEATH_QUEUE_HEADER.to_string(), queue.to_string());
        self.route(&exchange, &routing_key, &message).await?;
        Ok(())
    }

    /// Route a message to the queue's dead-letter target and only then remove
    /// its entry, so a failed route leaves the entry in the stream.
    async fn dead_letter_then_settle(
        &self,
        queue: &str,
        entry_id: &str,
        stored: StoredMessage,
        reason: &str,
    ) -> Result<(), BrokerError> {
        self.dead_letter(queue, stored, reason).await?;
        self.settle(queue, entry_id).await
    }

    fn register(
        &self,
        queue: &str,
        entry_id: String,
        stored: StoredMessage,
        permit: OwnedSemaphorePermit,
    ) -> Delivery {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery {
            tag,
            queue: queue.to_string(),
            exchange: stored.exchange.clone(),
            routing_key: stored.routing_key.clone(),
            redelivered: stored.redelivered,
            message: stored.message.clone(),
        };
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                tag,
                Inflight {
                    queue: queue.to_string(),
                    entry_id,
                    stored,
                    _permit: permit,
                },
            );
        delivery
    }

    fn take_inflight(&self, delivery: &Delivery) -> Result<Inflight, BrokerError> {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&delivery.tag)
            .ok_or_else(|| BrokerError::NotFound(format!("delivery tag {}", delivery.tag)))
    }

    /// Next entry for this consumer: a reclaimed stale entry when one is due,
    /// otherwise a new one.
    async fn read_next(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        consumer: &str,
        next_claim: &mut Instant,
    ) -> Result<Option<(StreamEntry, bool)>, BrokerError> {
        let stream = self.config.stream_key(queue);

        if Instant::now() >= *next_claim {
            let reply: Value = redis::cmd("XAUTOCLAIM")
                .arg(&stream)
                .arg(&self.config.group)
                .arg(consumer)
                .arg(duration_ms(self.config.claim_idle))
                .arg("0-0")
                .arg("COUNT")
                .arg(1)
                .query_async(conn)
                .await
                .map_err(|e| map_redis_error("XAUTOCLAIM", e))?;
            let claimed = match &reply {
                Value::Bulk(parts) => parts.get(1).map(parse_entries).unwrap_or_default(),
                _ => Vec::new(),
            };
            if let Some(entry) = claimed.into_iter().next() {
                return Ok(Some((entry, true)));
            }
            *next_claim = Instant::now() + self.config.claim_idle;
        }

        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(duration_ms(self.config.block))
            .arg("STREAMS")
            .arg(&stream)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| map_redis_error("XREADGROUP", e))?;
        Ok(parse_read_reply(&reply).into_iter().next().map(|entry| (entry, false)))
    }

    async fn consume_loop(
        self: Arc<Self>,
        queue: String,
        mut conn: MultiplexedConnection,
        expires_ms: Option<u64>,
        permits: Arc<Semaphore>,
        sender: mpsc::Sender<Delivery>,
    ) {
        let consumer = format!("consumer-{}", uuid::Uuid::now_v7());
        let mut closed = self.closed.subscribe();
        let mut next_claim = Instant::now();

        loop {
            if *closed.borrow() || sender.is_closed() {
                break;
            }
            let permit = tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if let Some(expires) = expires_ms {
                let refreshed: Result<(), _> = redis::pipe()
                    .cmd("PEXPIRE").arg(self.config.stream_key(&queue)).arg(expires).ignore()
                    .cmd("PEXPIRE").arg(self.config.spec_key(&queue)).arg(expires).ignore()
                    .query_async(&mut conn)
                    .await;
                if let Err(err) = refreshed {
                    debug!(queue = %queue, error = %err, "queue expiry refresh failed");
                }
            }

            let (entry, reclaimed) = match self.read_next(&mut conn, &queue, &consumer, &mut next_claim).await {
                Ok(Some(next)) => next,
                Ok(None) => continue,
                Err(err) => {
                    warn!(queue = %queue, error = %err, "stream read failed");
                    tokio::time::sleep(self.config.block).await;
                    continue;
                }
            };

            let mut stored = match StoredMessage::decode(&entry.fields) {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(queue = %queue, entry_id = %entry.id, error = %err, "dropping undecodable stream entry");
                    if let Err(err) = self.settle(&queue, &entry.id).await {
                        warn!(queue = %queue, error = %err, "failed to drop stream entry");
                    }
                    continue;
                }
            };
            stored.redelivered |= reclaimed;

            if stored.is_expired(now_ms()) {
                // Left pending on failure; XAUTOCLAIM or the sweeper retries it.
                if let Err(err) = self.dead_letter_then_settle(&queue, &entry.id, stored, "expired").await {
                    warn!(queue = %queue, entry_id = %entry.id, error = %err, "failed to dead-letter expired entry");
                }
                continue;
            }

            let delivery = self.register(&queue, entry.id, stored, permit);
            if sender.send(delivery).await.is_err() {
                break;
            }
        }
        debug!(queue = %queue, "redis consumer stopped");
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut closed = self.closed.subscribe();
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        warn!(error = %err, "expiry sweep failed");
                    }
                }
            }
        }
    }

    /// Dead-letter every entry whose expiry time has passed.
    async fn sweep_once(&self) -> Result<u64, BrokerError> {
        let mut conn = self.conn();
        let queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.config.queues_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("SMEMBERS queues", e))?;

        let mut expired = 0;
        for queue in queues {
            let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.config.expiry_key(&queue))
                .arg("-inf")
                .arg(now_ms())
                .arg("LIMIT")
                .arg(0)
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("ZRANGEBYSCORE", e))?;

            for entry_id in due {
                // Only the sweeper that removes the id handles the entry.
                let removed: i64 = redis::cmd("ZREM")
                    .arg(self.config.expiry_key(&queue))
                    .arg(&entry_id)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error("ZREM", e))?;
                if removed == 0 {
                    continue;
                }
                let reply: Value = redis::cmd("XRANGE")
                    .arg(self.config.stream_key(&queue))
                    .arg(&entry_id)
                    .arg(&entry_id)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error("XRANGE", e))?;
                for entry in parse_entries(&reply) {
                    let stored = match StoredMessage::decode(&entry.fields) {
                        Ok(stored) => stored,
                        Err(err) => {
                            warn!(queue = %queue, error = %err, "dropping undecodable expired entry");
                            self.settle(&queue, &entry.id).await?;
                            continue;
                        }
                    };
                    if let Err(err) = self.dead_letter_then_settle(&queue, &entry.id, stored, "expired").await {
                        warn!(queue = %queue, entry_id = %entry.id, error = %err, "failed to dead-letter expired entry; will retry");
                        // Put the deadline back so the next sweep picks it up again.
                        let _: i64 = redis::cmd("ZADD")
                            .arg(self.config.expiry_key(&queue))
                            .arg(now_ms())
                            .arg(&entry.id)
                            .query_async(&mut conn)
                            .await
                            .map_err(|e| map_redis_error("ZADD expiry", e))?;
                        continue;
                    }
                    expired += 1;
                }
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    #[instrument(skip(self), err)]
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.inner.ensure_open()?;
        let mut conn = self.inner.conn();
        let key = self.inner.config.exchanges_key();
        let existing: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg(name)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("HGET exchange", e))?;
        match existing.as_deref() {
            Some(found) if found == kind_name(kind) => Ok(()),
            Some(found) => Err(BrokerError::Rejected(format!(
                "exchange '{name}' already declared as {found}"
            ))),
            None => {
                let _: i64 = redis::cmd("HSET")
                    .arg(&key)
                    .arg(name)
                    .arg(kind_name(kind))
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error("HSET exchange", e))?;
                Ok(())
            }
        }
    }

    #[instrument(skip(self, spec), fields(queue = %spec.name), err)]
    async fn declare_queue(&self, spec: QueueSpec) -> Result<(), BrokerError> {
        self.inner.ensure_open()?;
        let cfg = &self.inner.config;
        let mut conn = self.inner.conn();
        let stored = StoredSpec::from(&spec);

        if let Some(existing) = self.inner.load_spec(&spec.name).await? {
            if existing != stored {
                return Err(BrokerError::Rejected(format!(
                    "queue '{}' already declared with different arguments",
                    spec.name
                )));
            }
        }
        let json = serde_json::to_string(&stored)
            .map_err(|e| BrokerError::Rejected(format!("unencodable queue spec: {e}")))?;

        let stream = cfg.stream_key(&spec.name);
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(&cfg.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => {}
            Err(err) if err.code() == Some("BUSYGROUP") => {}
            Err(err) => return Err(map_redis_error("XGROUP CREATE", err)),
        }

        let mut pipe = redis::pipe();
        pipe.cmd("SET").arg(cfg.spec_key(&spec.name)).arg(json).ignore();
        pipe.cmd("SADD").arg(cfg.queues_key()).arg(&spec.name).ignore();
        if let Some(expires) = stored.expires_ms {
            pipe.cmd("PEXPIRE").arg(&stream).arg(expires).ignore();
            pipe.cmd("PEXPIRE").arg(cfg.spec_key(&spec.name)).arg(expires).ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("declare_queue", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner.ensure_open()?;
        let cfg = &self.inner.config;
        let mut conn = self.inner.conn();
        let exists: bool = redis::cmd("HEXISTS")
            .arg(cfg.exchanges_key())
            .arg(exchange)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("HEXISTS exchange", e))?;
        if !exists {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }
        if self.inner.load_spec(queue).await?.is_none() {
            return Err(BrokerError::NotFound(format!("queue '{queue}'")));
        }
        let _: i64 = redis::cmd("SADD")
            .arg(cfg.bindings_key(exchange))
            .arg(format!("{queue}\n{routing_key}"))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("SADD binding", e))?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
    ) -> Result<(), BrokerError> {
        self.inner.ensure_open()?;
        self.inner.route(exchange, routing_key, &message).await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Consumer, BrokerError> {
        self.inner.ensure_open()?;
        let spec = self
            .inner
            .load_spec(queue)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;

        // Blocking reads get a connection of their own.
        let conn = self
            .inner
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error("connect consumer", e))?;
        let prefetch = usize::from(prefetch.max(1));
        let (sender, receiver) = mpsc::channel(prefetch);
        let permits = Arc::new(Semaphore::new(prefetch));

        let handle = tokio::spawn(Arc::clone(&self.inner).consume_loop(
            queue.to_string(),
            conn,
            spec.expires_ms,
            permits,
            sender,
        ));
        self.inner.track(handle);
        Ok(Consumer::new(queue, receiver))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let inflight = self.inner.take_inflight(delivery)?;
        self.inner.settle(&inflight.queue, &inflight.entry_id).await
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let inflight = self.inner.take_inflight(delivery)?;
        let Inflight {
            queue,
            entry_id,
            stored,
            ..
        } = inflight;

        if requeue {
            // Requeued entries go to the tail of the stream.
            self.inner
                .enqueue(
                    &queue,
                    &stored.exchange,
                    &stored.routing_key,
                    &stored.message,
                    true,
                    stored.expires_at_ms,
                )
                .await?;
            self.inner.settle(&queue, &entry_id).await
        } else {
            // On failure the entry stays pending and XAUTOCLAIM redelivers it.
            self.inner
                .dead_letter_then_settle(&queue, &entry_id, stored, "rejected")
                .await
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.closed.send_replace(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            // Consumers may sit in a blocking read; don't wait it out.
            handle.abort();
        }
        info!("redis streams broker closed");
        Ok(())
    }
}
