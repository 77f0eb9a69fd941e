//! Queue broker: buffering, batching, retries, and dead-letter routing.
//!
//! Producers push messages into per-queue FIFO buffers; a single dispatch
//! task per queue extracts batches and invokes the consumer. Delivery
//! triggers either when the buffer reaches `max_batch_size` or when
//! `max_batch_timeout_ms` has elapsed since the first pending message.
//! Consumers acknowledge a whole batch by returning, retry individual
//! messages, retry the whole batch, or throw (equivalent to retrying the
//! batch). A message that exhausts its retries moves to the configured
//! dead-letter queue with its attempt counter reset, or is dropped with a
//! warning. A queue may not name itself as its dead-letter queue; cycles
//! across distinct queues are permitted and drain through retries.
//!
//! With a persistence directory configured, each queue appends
//! `{op, id, contentType, body}` records to `<dir>/<name>.log` and
//! reconstructs its pending buffer from unacknowledged sends on startup.
//!
//! # Examples
//!
//! ```rust
//! use kumo::queue::{QueueBroker, QueueOptions, QueuePayload};
//! use kumo::clock::system_clock;
//! use std::sync::Arc;
//!
//! # async fn example() -> kumo::error::Result<()> {
//! let broker = QueueBroker::new(system_clock());
//! broker.register_queue("jobs", QueueOptions::default())?;
//! broker.set_consumer("jobs", Arc::new(|batch| Box::pin(async move {
//!     for message in &batch.messages {
//!         println!("job {}", message.id);
//!     }
//!     Ok(())
//! })))?;
//! broker.send("jobs", QueuePayload::Text("work".into())).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clock::SharedClock,
    error::{ErrorKind, KumoError, Result},
};

mod payload;

pub use payload::{CloneGraph, CloneNode, PayloadKind, QueuePayload, TypedArrayKind};

/// Maximum serialized message payload in bytes.
pub const MAX_MESSAGE_SIZE: usize = 128_000;

/// Per-queue delivery configuration.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Batch size trigger, 1..=100.
    pub max_batch_size: usize,
    /// Timeout trigger, measured from the first pending message.
    pub max_batch_timeout_ms: u64,
    /// Retries before dead-lettering or dropping.
    pub max_retries: u32,
    /// Destination for messages that exhaust their retries.
    pub dead_letter_queue: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 5,
            max_batch_timeout_ms: 1_000,
            max_retries: 2,
            dead_letter_queue: None,
        }
    }
}

/// A delivered message handle.
#[derive(Clone)]
pub struct Message {
    /// Message id: 32 hex characters.
    pub id: String,
    /// Decoded body.
    pub body: QueuePayload,
    /// Enqueue time in unix milliseconds.
    pub timestamp: u64,
    /// Delivery attempt number, starting at 1.
    pub attempts: u32,
    retried: Arc<AtomicBool>,
}

impl Message {
    /// Marks this message for redelivery; the rest of the batch is still
    /// acknowledged when the consumer returns.
    pub fn retry(&self) {
        self.retried.store(true, Ordering::SeqCst);
    }
}

/// One delivered batch.
#[derive(Clone)]
pub struct MessageBatch {
    /// Source queue name.
    pub queue: String,
    /// Messages in send order.
    pub messages: Vec<Message>,
    retry_all: Arc<AtomicBool>,
}

impl MessageBatch {
    /// Returns every message to the buffer with an incremented attempt
    /// counter.
    pub fn retry_all(&self) {
        self.retry_all.store(true, Ordering::SeqCst);
    }

    /// Explicitly acknowledges the batch, clearing any earlier retry
    /// marks.
    pub fn ack_all(&self) {
        self.retry_all.store(false, Ordering::SeqCst);
        for message in &self.messages {
            message.retried.store(false, Ordering::SeqCst);
        }
    }
}

/// Batch consumer callback.
pub type QueueConsumer = Arc<dyn Fn(MessageBatch) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    kind: PayloadKind,
    body: Vec<u8>,
    timestamp: u64,
    attempts: u32,
}

#[derive(Serialize, Deserialize)]
struct WalRecord {
    op: String,
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

struct QueueState {
    name: String,
    options: Mutex<QueueOptions>,
    pending: Mutex<VecDeque<StoredMessage>>,
    pending_since: Mutex<Option<Instant>>,
    notify: Notify,
    consumer: Mutex<Option<QueueConsumer>>,
    dispatching: AtomicUsize,
    wal: Option<Mutex<PathBuf>>,
}

impl QueueState {
    fn enqueue(&self, message: StoredMessage) {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            *self.pending_since.lock() = Some(Instant::now());
        }
        pending.push_back(message);
        drop(pending);
        self.notify.notify_one();
    }

    fn wal_append(&self, record: &WalRecord) {
        let Some(wal) = &self.wal else { return };
        let path = wal.lock();
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&*path)
            .and_then(|mut file| {
                let mut line = serde_json::to_vec(record).unwrap_or_default();
                line.push(b'\n');
                file.write_all(&line)
            });
        if let Err(e) = appended {
            warn!("Failed to append to queue log {}: {e}", path.display());
        }
    }
}

struct BrokerInner {
    clock: SharedClock,
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    persist_dir: Option<PathBuf>,
}

/// The queue broker: shared buffers, per-queue dispatchers.
///
/// Dispatcher tasks have broker-scoped lifetime; per-request cancellation
/// never cancels them.
#[derive(Clone)]
pub struct QueueBroker {
    inner: Arc<BrokerInner>,
}

impl QueueBroker {
    /// Creates an in-memory broker.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                clock,
                queues: Mutex::new(HashMap::new()),
                persist_dir: None,
            }),
        }
    }

    /// Creates a broker that appends a write-ahead log per queue under
    /// `dir` and replays unacknowledged sends on queue creation.
    pub fn with_persistence(clock: SharedClock, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                clock,
                queues: Mutex::new(HashMap::new()),
                persist_dir: Some(dir.into()),
            }),
        }
    }

    /// Registers (or reconfigures) a queue with explicit options.
    pub fn register_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        if !(1..=100).contains(&options.max_batch_size) {
            return Err(KumoError::new(
                ErrorKind::Configuration,
                "RangeError",
                format!(
                    "Queue \"{name}\": max_batch_size must be between 1 and 100, got {}",
                    options.max_batch_size
                ),
            ));
        }
        if options.dead_letter_queue.as_deref() == Some(name) {
            return Err(KumoError::new(
                ErrorKind::Configuration,
                "ERR_DEAD_LETTER_QUEUE_CYCLE",
                format!("Dead letter queue for queue \"{name}\" cannot be itself"),
            ));
        }
        let queue = self.ensure_queue(name);
        *queue.options.lock() = options;
        Ok(())
    }

    /// Attaches the consumer and starts the queue's dispatch task.
    pub fn set_consumer(&self, name: &str, consumer: QueueConsumer) -> Result<()> {
        let queue = self.ensure_queue(name);
        let mut slot = queue.consumer.lock();
        let started = slot.is_some();
        *slot = Some(consumer);
        drop(slot);
        if !started {
            let inner = self.inner.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                dispatch_loop(inner, queue).await;
            });
        } else {
            queue.notify.notify_one();
        }
        Ok(())
    }

    /// Produces a message. Returns the assigned message id.
    pub async fn send(&self, name: &str, payload: QueuePayload) -> Result<String> {
        let body = payload.serialize()?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(KumoError::new(
                ErrorKind::Capacity,
                "Error",
                format!(
                    "Queue send failed: message length of {} bytes exceeds limit of {MAX_MESSAGE_SIZE}",
                    body.len()
                ),
            ));
        }

        let queue = self.ensure_queue(name);
        let message = StoredMessage {
            id: Uuid::new_v4().simple().to_string(),
            kind: payload.kind(),
            body,
            timestamp: self.inner.clock.now_millis(),
            attempts: 1,
        };
        queue.wal_append(&WalRecord {
            op: "send".into(),
            id: message.id.clone(),
            content_type: Some(message.kind.as_str().into()),
            body: Some(STANDARD.encode(&message.body)),
        });
        let id = message.id.clone();
        queue.enqueue(message);
        Ok(id)
    }

    /// Like [`Self::send`], waiting for the context's output gate first:
    /// a queue send is an outbound effect and must not escape before the
    /// durable-object write it may depend on is confirmed.
    pub async fn send_in_context(
        &self,
        ctx: &crate::gate::RequestContext,
        name: &str,
        payload: QueuePayload,
    ) -> Result<String> {
        ctx.output_gate.wait_open().await;
        self.send(name, payload).await
    }

    /// Sends several messages in order.
    pub async fn send_batch(&self, name: &str, payloads: Vec<QueuePayload>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            ids.push(self.send(name, payload).await?);
        }
        Ok(ids)
    }

    /// Test helper: resolves once every queue buffer is empty and no batch
    /// is being dispatched.
    pub async fn wait_idle(&self) {
        loop {
            let busy = {
                let queues = self.inner.queues.lock();
                queues.values().any(|q| {
                    !q.pending.lock().is_empty() || q.dispatching.load(Ordering::SeqCst) > 0
                })
            };
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn ensure_queue(&self, name: &str) -> Arc<QueueState> {
        let mut queues = self.inner.queues.lock();
        if let Some(queue) = queues.get(name) {
            return queue.clone();
        }
        let wal = self.inner.persist_dir.as_ref().map(|dir| {
            let _ = std::fs::create_dir_all(dir);
            Mutex::new(dir.join(format!("{name}.log")))
        });
        let queue = Arc::new(QueueState {
            name: name.to_string(),
            options: Mutex::new(QueueOptions::default()),
            pending: Mutex::new(VecDeque::new()),
            pending_since: Mutex::new(None),
            notify: Notify::new(),
            consumer: Mutex::new(None),
            dispatching: AtomicUsize::new(0),
            wal,
        });
        if let Some(wal) = &queue.wal {
            replay_wal(&queue, &wal.lock(), &self.inner.clock);
        }
        queues.insert(name.to_string(), queue.clone());
        queue
    }
}

/// Rebuilds a queue's pending buffer from its log: sends without a
/// matching ack, in send order.
fn replay_wal(queue: &QueueState, path: &PathBuf, clock: &SharedClock) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    let mut unacked: Vec<StoredMessage> = Vec::new();
    for line in contents.lines() {
        let Ok(record) = serde_json::from_str::<WalRecord>(line) else {
            continue;
        };
        match record.op.as_str() {
            "send" => {
                let kind = record
                    .content_type
                    .as_deref()
                    .and_then(PayloadKind::parse)
                    .unwrap_or(PayloadKind::Bytes);
                let body = record
                    .body
                    .as_deref()
                    .and_then(|b| STANDARD.decode(b).ok())
                    .unwrap_or_default();
                unacked.push(StoredMessage {
                    id: record.id,
                    kind,
                    body,
                    timestamp: clock.now_millis(),
                    attempts: 1,
                });
            }
            "ack" => unacked.retain(|m| m.id != record.id),
            _ => {}
        }
    }
    let mut pending = queue.pending.lock();
    if !unacked.is_empty() && pending.is_empty() {
        *queue.pending_since.lock() = Some(Instant::now());
    }
    pending.extend(unacked);
}

async fn dispatch_loop(inner: Arc<BrokerInner>, queue: Arc<QueueState>) {
    loop {
        enum Trigger {
            Now,
            At(Instant),
            Wait,
        }
        let trigger = {
            let pending = queue.pending.lock();
            let options = queue.options.lock();
            if pending.len() >= options.max_batch_size {
                Trigger::Now
            } else if let Some(since) = *queue.pending_since.lock() {
                Trigger::At(since + Duration::from_millis(options.max_batch_timeout_ms))
            } else {
                Trigger::Wait
            }
        };

        match trigger {
            Trigger::Now => {}
            Trigger::At(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = queue.notify.notified() => continue,
                }
            }
            Trigger::Wait => {
                queue.notify.notified().await;
                continue;
            }
        }

        dispatch_batch(&inner, &queue).await;
    }
}

async fn dispatch_batch(inner: &Arc<BrokerInner>, queue: &Arc<QueueState>) {
    queue.dispatching.fetch_add(1, Ordering::SeqCst);

    let (batch_messages, options) = {
        let mut pending = queue.pending.lock();
        let options = queue.options.lock().clone();
        let take = pending.len().min(options.max_batch_size);
        let batch: Vec<StoredMessage> = pending.drain(..take).collect();
        if pending.is_empty() {
            *queue.pending_since.lock() = None;
        }
        (batch, options)
    };
    if batch_messages.is_empty() {
        queue.dispatching.fetch_sub(1, Ordering::SeqCst);
        return;
    }

    let consumer = queue.consumer.lock().clone();
    let Some(consumer) = consumer else {
        // No consumer attached after all; put the batch back.
        let mut pending = queue.pending.lock();
        for message in batch_messages.into_iter().rev() {
            pending.push_front(message);
        }
        queue.dispatching.fetch_sub(1, Ordering::SeqCst);
        return;
    };

    let retry_all = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::with_capacity(batch_messages.len());
    let mut deliverable = Vec::with_capacity(batch_messages.len());
    for stored in batch_messages {
        match QueuePayload::deserialize(stored.kind, &stored.body) {
            Ok(body) => {
                let flag = Arc::new(AtomicBool::new(false));
                handles.push((stored.clone(), flag.clone()));
                deliverable.push(Message {
                    id: stored.id,
                    body,
                    timestamp: stored.timestamp,
                    attempts: stored.attempts,
                    retried: flag,
                });
            }
            Err(e) => {
                warn!(
                    "Dropped message \"{}\" on queue \"{}\": failed to decode body: {e}",
                    stored.id, queue.name
                );
                queue.wal_append(&WalRecord {
                    op: "ack".into(),
                    id: stored.id,
                    content_type: None,
                    body: None,
                });
            }
        }
    }

    let total = deliverable.len();
    let batch = MessageBatch {
        queue: queue.name.clone(),
        messages: deliverable,
        retry_all: retry_all.clone(),
    };

    let start = Instant::now();
    let outcome = consumer(batch).await;
    let elapsed_ms = start.elapsed().as_millis();

    // A throwing consumer retries the whole batch.
    let all_retried = outcome.is_err() || retry_all.load(Ordering::SeqCst);
    let retried: Vec<StoredMessage> = handles
        .iter()
        .filter(|(_, flag)| all_retried || flag.load(Ordering::SeqCst))
        .map(|(stored, _)| stored.clone())
        .collect();
    let acked = total - retried.len();
    info!("QUEUE {} {acked}/{total} ({elapsed_ms}ms)", queue.name);

    for (stored, flag) in &handles {
        if !(all_retried || flag.load(Ordering::SeqCst)) {
            queue.wal_append(&WalRecord {
                op: "ack".into(),
                id: stored.id.clone(),
                content_type: None,
                body: None,
            });
        }
    }

    for mut stored in retried {
        let failed_attempts = stored.attempts;
        stored.attempts += 1;
        if stored.attempts > options.max_retries + 1 {
            queue.wal_append(&WalRecord {
                op: "ack".into(),
                id: stored.id.clone(),
                content_type: None,
                body: None,
            });
            match &options.dead_letter_queue {
                Some(dlq) => {
                    warn!(
                        "Moving message \"{}\" on queue \"{}\" to dead letter queue \"{dlq}\" after {failed_attempts} failed attempt{}...",
                        stored.id,
                        queue.name,
                        plural(failed_attempts)
                    );
                    let target = QueueBroker {
                        inner: inner.clone(),
                    }
                    .ensure_queue(dlq);
                    stored.attempts = 1;
                    target.wal_append(&WalRecord {
                        op: "send".into(),
                        id: stored.id.clone(),
                        content_type: Some(stored.kind.as_str().into()),
                        body: Some(STANDARD.encode(&stored.body)),
                    });
                    target.enqueue(stored);
                }
                None => {
                    warn!(
                        "Dropped message \"{}\" on queue \"{}\" after {failed_attempts} failed attempt{}!",
                        stored.id,
                        queue.name,
                        plural(failed_attempts)
                    );
                }
            }
        } else {
            info!(
                "Retrying message \"{}\" on queue \"{}\"...",
                stored.id, queue.name
            );
            queue.enqueue(stored);
        }
    }

    queue.dispatching.fetch_sub(1, Ordering::SeqCst);
    queue.notify.notify_one();
}

fn plural(n: u32) -> &'static str {
    if n == 1 { "" } else { "s" }
}
