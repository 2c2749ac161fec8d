//!
//! This module provides an in-process [`BrokerEndpoint`] backed by partitioned
//! in-memory logs. It implements the broker-side behaviors the client contract
//! depends on: per-group committed offsets, delay-level visibility, clustered
//! and broadcasting subscription modes, and pending/backoff tracking for
//! redelivery. The test suite runs against it, and applications can use it as
//! a local queue.
//!

use crate::endpoint::{BrokerEndpoint, SessionId};
use crate::error::ClientError;
use crate::filter::Subscription;
use crate::message::{Message, MessageExt, SendResult, SendStatus};
use async_trait::async_trait;
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Delay-level buckets, level 1 first. Level 3 is the 10 second bucket.
const DELAY_TABLE: [Duration; 18] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(2 * 60),
    Duration::from_secs(3 * 60),
    Duration::from_secs(4 * 60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(6 * 60),
    Duration::from_secs(7 * 60),
    Duration::from_secs(8 * 60),
    Duration::from_secs(9 * 60),
    Duration::from_secs(10 * 60),
    Duration::from_secs(20 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(2 * 60 * 60),
];

pub(crate) fn delay_for_level(level: u8) -> Duration {
    let index = (level.max(1) as usize - 1).min(DELAY_TABLE.len() - 1);
    DELAY_TABLE[index]
}

/// How a topic's messages are spread over a consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Messages are load-balanced across the group's sessions; the group shares
    /// one committed offset per partition.
    Clustered,
    /// Every session receives every message; offsets are kept per session.
    Broadcasting,
}

#[derive(Debug, Clone)]
pub struct MemoryEndpointOptions {
    /// Partitions created per topic.
    pub partitions: u32,
    /// How long a nacked batch stays invisible before redelivery.
    pub redelivery_backoff: Duration,
}

impl Default for MemoryEndpointOptions {
    fn default() -> Self {
        MemoryEndpointOptions {
            partitions: 4,
            redelivery_backoff: Duration::from_millis(500),
        }
    }
}

struct StoredMessage {
    ext: MessageExt,
    visible_at: Instant,
}

struct Partition {
    log: Vec<StoredMessage>,
}

struct Topic {
    mode: SubscriptionMode,
    partitions: Vec<Partition>,
    next_partition: usize,
}

struct SessionState {
    group: String,
    subscriptions: HashMap<String, Subscription>,
}

/// Consumption progress for one (consumer, topic, partition). The consumer key
/// is the group in clustered mode and the session in broadcasting mode.
#[derive(Default)]
struct Cursor {
    /// Index of the next log entry to examine.
    committed: usize,
    /// Log range `[start, end)` of the delivered-but-unacknowledged batch.
    inflight: Option<(usize, usize)>,
    /// Session the in-flight batch was delivered to.
    holder: Option<SessionId>,
    /// Set after a nack; the partition is not re-pulled before this instant.
    redeliver_at: Option<Instant>,
    /// Redelivery count applied to the next delivered batch.
    attempts: u32,
}

#[derive(Hash, PartialEq, Eq, Clone)]
enum ConsumerKey {
    Group(String),
    Session(SessionId),
}

struct Inner {
    topics: HashMap<String, Topic>,
    sessions: HashMap<SessionId, SessionState>,
    cursors: HashMap<(ConsumerKey, String, u32), Cursor>,
}

pub struct MemoryEndpoint {
    inner: Mutex<Inner>,
    options: MemoryEndpointOptions,
    notify: Notify,
    next_session: AtomicU64,
    next_message_id: AtomicU64,
}

impl MemoryEndpoint {
    pub fn new() -> Arc<Self> {
        Self::with_options(MemoryEndpointOptions::default())
    }

    pub fn with_options(options: MemoryEndpointOptions) -> Arc<Self> {
        Arc::new(MemoryEndpoint {
            inner: Mutex::new(Inner {
                topics: HashMap::new(),
                sessions: HashMap::new(),
                cursors: HashMap::new(),
            }),
            options,
            notify: Notify::new(),
            next_session: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
        })
    }

    /// Create a topic with an explicit subscription mode. Topics touched by
    /// `submit` or `register_subscription` without a prior `create_topic` are
    /// created as [`SubscriptionMode::Clustered`].
    pub fn create_topic(&self, topic: &str, mode: SubscriptionMode) {
        let mut inner = self.lock();
        let partitions = self.options.partitions;
        inner
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| Topic::new(mode, partitions));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_message_id(&self) -> String {
        format!("{:032X}", self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// One pass over the caller's subscriptions. Returns delivered messages,
    /// which are marked in-flight until acknowledged or nacked.
    fn try_pull(&self, session: SessionId, max: usize) -> Result<Vec<MessageExt>, ClientError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let state = inner.sessions.get(&session).ok_or(ClientError::BadSession)?;
        let group = state.group.clone();
        let subscriptions: Vec<Subscription> = state.subscriptions.values().cloned().collect();

        let mut delivered = Vec::new();
        for subscription in subscriptions {
            if delivered.len() >= max {
                break;
            }
            let Some(topic) = inner.topics.get(&subscription.topic) else {
                continue;
            };
            let mode = topic.mode;
            let partition_count = topic.partitions.len() as u32;
            let key = match mode {
                SubscriptionMode::Clustered => ConsumerKey::Group(group.clone()),
                SubscriptionMode::Broadcasting => ConsumerKey::Session(session),
            };

            for queue_id in 0..partition_count {
                if delivered.len() >= max {
                    break;
                }
                let cursor_key = (key.clone(), subscription.topic.clone(), queue_id);
                let cursor = inner.cursors.entry(cursor_key.clone()).or_default();

                // A partition with an outstanding batch is not re-pulled, which
                // is what preserves per-partition delivery order.
                if cursor.inflight.is_some() {
                    continue;
                }
                if cursor.redeliver_at.map(|at| at > now).unwrap_or(false) {
                    continue;
                }
                let start = cursor.committed;
                let attempts = cursor.attempts;

                let topic = inner
                    .topics
                    .get(&subscription.topic)
                    .ok_or_else(|| ClientError::UnknownTopic(subscription.topic.clone()))?;
                let log = &topic.partitions[queue_id as usize].log;

                let mut end = start;
                let mut batch = Vec::new();
                while end < log.len() && delivered.len() + batch.len() < max {
                    let stored = &log[end];
                    // Scanning stops at the first message that is not visible
                    // yet, so a scheduled message holds its slot in the
                    // partition order.
                    if stored.visible_at > now {
                        break;
                    }
                    if subscription.expression.matches(&stored.ext) {
                        let mut ext = stored.ext.clone();
                        ext.reconsume_times = attempts;
                        batch.push(ext);
                    }
                    end += 1;
                }

                let cursor = inner.cursors.get_mut(&cursor_key).ok_or(ClientError::BadSession)?;
                if batch.is_empty() {
                    // Nothing matched in the scanned range; commit past it so
                    // filtered-out messages are not re-scanned forever.
                    cursor.committed = end;
                } else {
                    cursor.inflight = Some((start, end));
                    cursor.holder = Some(session);
                    cursor.redeliver_at = None;
                    delivered.extend(batch);
                }
            }
        }

        Ok(delivered)
    }

    fn resolve_batches(
        &self,
        session: SessionId,
        messages: &[MessageExt],
        ack: bool,
    ) -> Result<(), ClientError> {
        let backoff = self.options.redelivery_backoff;
        let mut inner = self.lock();
        let state = inner.sessions.get(&session).ok_or(ClientError::BadSession)?;
        let group = state.group.clone();

        // A delivered batch never spans partitions, but one ack call may carry
        // messages from several.
        let mut touched: Vec<(String, u32)> = Vec::new();
        for message in messages {
            let pair = (message.topic().to_owned(), message.queue_id);
            if !touched.contains(&pair) {
                touched.push(pair);
            }
        }

        for (topic_name, queue_id) in touched {
            let mode = inner
                .topics
                .get(&topic_name)
                .ok_or_else(|| ClientError::UnknownTopic(topic_name.clone()))?
                .mode;
            let key = match mode {
                SubscriptionMode::Clustered => ConsumerKey::Group(group.clone()),
                SubscriptionMode::Broadcasting => ConsumerKey::Session(session),
            };
            let cursor = inner
                .cursors
                .get_mut(&(key, topic_name.clone(), queue_id))
                .ok_or(ClientError::BadSession)?;
            let Some((start, end)) = cursor.inflight.take() else {
                continue;
            };
            cursor.holder = None;
            if ack {
                cursor.committed = end;
                cursor.attempts = 0;
                cursor.redeliver_at = None;
                trace!(
                    "ack {}#{}: committed offset advanced to {}",
                    topic_name, queue_id, end
                );
            } else {
                cursor.committed = start;
                cursor.attempts += 1;
                cursor.redeliver_at = Some(Instant::now() + backoff);
                debug!(
                    "nack {}#{}: redelivery attempt {} after {:?}",
                    topic_name, queue_id, cursor.attempts, backoff
                );
            }
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }
}

impl Topic {
    fn new(mode: SubscriptionMode, partitions: u32) -> Self {
        Topic {
            mode,
            partitions: (0..partitions.max(1))
                .map(|_| Partition { log: Vec::new() })
                .collect(),
            next_partition: 0,
        }
    }

    /// Batches stay whole: one partition per submit call. Keyed messages hash
    /// to a stable partition, the rest round-robin.
    fn pick_partition(&mut self, key: Option<&str>) -> u32 {
        match key {
            Some(key) => {
                use std::hash::{Hash, Hasher};
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.partitions.len() as u64) as u32
            }
            None => {
                let queue_id = self.next_partition as u32;
                self.next_partition = (self.next_partition + 1) % self.partitions.len();
                queue_id
            }
        }
    }
}

#[async_trait]
impl BrokerEndpoint for MemoryEndpoint {
    async fn connect(&self, group: &str) -> Result<SessionId, ClientError> {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.lock();
        inner.sessions.insert(
            session,
            SessionState {
                group: group.to_owned(),
                subscriptions: HashMap::new(),
            },
        );
        debug!("session {:?} opened for group {}", session, group);
        Ok(session)
    }

    async fn disconnect(&self, session: SessionId) -> Result<(), ClientError> {
        let mut inner = self.lock();
        if inner.sessions.remove(&session).is_none() {
            return Err(ClientError::BadSession);
        }
        inner
            .cursors
            .retain(|(key, _, _), _| *key != ConsumerKey::Session(session));
        // Batches the session never settled go back to the group, so a crash
        // before acknowledgment means redelivery rather than a wedged partition.
        for cursor in inner.cursors.values_mut() {
            if cursor.holder == Some(session) && cursor.inflight.take().is_some() {
                cursor.holder = None;
                cursor.attempts += 1;
            }
        }
        debug!("session {:?} closed", session);
        Ok(())
    }

    async fn submit(
        &self,
        session: SessionId,
        messages: Vec<Message>,
        _wait_store_ok: bool,
        delay_level: Option<u8>,
    ) -> Result<SendResult, ClientError> {
        if messages.is_empty() {
            return Err(ClientError::Broker("empty submit".to_owned()));
        }
        let topic_name = messages[0].topic.clone();
        if topic_name.is_empty() {
            return Err(ClientError::Broker("empty topic".to_owned()));
        }

        let now = Instant::now();
        let now_millis = Self::now_millis();
        let partition_key = if messages.len() == 1 {
            messages[0].key.clone()
        } else {
            None
        };

        let ids: Vec<String> = messages.iter().map(|_| self.next_message_id()).collect();

        let mut inner = self.lock();
        if !inner.sessions.contains_key(&session) {
            return Err(ClientError::BadSession);
        }
        let partitions = self.options.partitions;
        let topic = inner
            .topics
            .entry(topic_name.clone())
            .or_insert_with(|| Topic::new(SubscriptionMode::Clustered, partitions));
        let queue_id = topic.pick_partition(partition_key.as_deref());

        let partition = &mut topic.partitions[queue_id as usize];
        let first_offset = partition.log.len() as u64;
        for (message, id) in messages.into_iter().zip(&ids) {
            let level = delay_level.or(message.delay_level);
            let visible_at = match level {
                Some(level) => now + delay_for_level(level),
                None => now,
            };
            let queue_offset = partition.log.len() as u64;
            partition.log.push(StoredMessage {
                ext: MessageExt {
                    message,
                    message_id: id.clone(),
                    queue_id,
                    queue_offset,
                    born_timestamp: now_millis,
                    store_timestamp: now_millis,
                    reconsume_times: 0,
                },
                visible_at,
            });
        }
        drop(inner);
        self.notify.notify_waiters();

        trace!("stored {} message(s) in {}#{}", ids.len(), topic_name, queue_id);
        Ok(SendResult {
            status: SendStatus::SendOk,
            message_id: ids.join(","),
            queue_id,
            queue_offset: first_offset,
        })
    }

    async fn register_subscription(
        &self,
        session: SessionId,
        subscription: Subscription,
    ) -> Result<(), ClientError> {
        let mut inner = self.lock();
        let partitions = self.options.partitions;
        inner
            .topics
            .entry(subscription.topic.clone())
            .or_insert_with(|| Topic::new(SubscriptionMode::Clustered, partitions));
        let state = inner.sessions.get_mut(&session).ok_or(ClientError::BadSession)?;
        state
            .subscriptions
            .insert(subscription.topic.clone(), subscription);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pull(
        &self,
        session: SessionId,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<MessageExt>, ClientError> {
        let deadline = Instant::now() + wait;
        loop {
            let batch = self.try_pull(session, max)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Re-check periodically as well as on notification, so delayed
            // messages and redelivery backoffs become visible without a
            // producer-side event.
            let step = (deadline - now).min(Duration::from_millis(100));
            let _ = tokio::time::timeout(step, self.notify.notified()).await;
        }
    }

    async fn acknowledge(
        &self,
        session: SessionId,
        messages: &[MessageExt],
    ) -> Result<(), ClientError> {
        self.resolve_batches(session, messages, true)
    }

    async fn nack(&self, session: SessionId, messages: &[MessageExt]) -> Result<(), ClientError> {
        self.resolve_batches(session, messages, false)
    }
}
