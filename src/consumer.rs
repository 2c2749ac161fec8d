//!
//! This module defines the push-style consumer: filtered subscriptions, a
//! user-supplied batch handler, and the background long-poll loop that feeds a
//! bounded worker pool. The push surface is a convenience over pull-then-
//! dispatch; the transport mechanism stays an internal detail.
//!

use crate::endpoint::{BrokerEndpoint, SessionId};
use crate::error::ClientError;
use crate::filter::{FilterExpression, SqlEvaluator, SqlExpression, Subscription, TagExpression};
use crate::message::MessageExt;
use crate::producer::duration_millis;
use crate::registry;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

/// Verdict a handler returns for a whole delivered batch.
///
/// `Success` acknowledges the batch and lets the group's committed offset
/// advance; `RetryLater` leaves it pending, to be redelivered after the
/// broker's backoff. This is the at-least-once contract: a batch may come
/// again, but is never silently dropped.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumeVerdict {
    Success,
    RetryLater,
}

/// User handler invoked with 1..N messages per call, all from one partition.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn consume(&self, batch: Vec<MessageExt>) -> ConsumeVerdict;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Vec<MessageExt>) -> ConsumeVerdict + Send + Sync + 'static,
{
    async fn consume(&self, batch: Vec<MessageExt>) -> ConsumeVerdict {
        self(batch)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerOptions {
    /// Upper bound on messages handed to one handler invocation.
    pub consume_batch_size: usize,
    /// Worker pool size, which bounds concurrent handler invocations. Pulling
    /// pauses while the pool is saturated.
    pub consume_concurrency: usize,
    /// Long-poll bound for one pull round trip.
    #[serde(with = "duration_millis")]
    pub pull_wait: Duration,
    /// How long `shutdown` waits for the loop and in-flight handlers to drain.
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            consume_batch_size: 32,
            consume_concurrency: 4,
            pull_wait: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Created,
    Running,
    Shutdown,
}

/// A push consumer bound to one group name and one broker session.
///
/// One handler per instance; [`subscribe`](Self::subscribe) may be called for
/// several topics, and re-subscribing a topic replaces its filter. Consuming
/// happens only between [`start`](Self::start) and
/// [`shutdown`](Self::shutdown).
pub struct PushConsumer {
    group: String,
    endpoint: Arc<dyn BrokerEndpoint>,
    options: ConsumerOptions,
    sql_evaluator: Mutex<Option<Arc<dyn SqlEvaluator>>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    state: Mutex<ServiceState>,
    session: Mutex<Option<SessionId>>,
    workers: Mutex<Option<Arc<Semaphore>>>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    poll_loop: Mutex<Option<JoinHandle<()>>>,
}

impl PushConsumer {
    pub fn new(group: impl Into<String>, endpoint: Arc<dyn BrokerEndpoint>) -> Self {
        Self::with_options(group, endpoint, ConsumerOptions::default())
    }

    pub fn with_options(
        group: impl Into<String>,
        endpoint: Arc<dyn BrokerEndpoint>,
        options: ConsumerOptions,
    ) -> Self {
        PushConsumer {
            group: group.into(),
            endpoint,
            options,
            sql_evaluator: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            state: Mutex::new(ServiceState::Created),
            session: Mutex::new(None),
            workers: Mutex::new(None),
            stop: Mutex::new(None),
            poll_loop: Mutex::new(None),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Inject the predicate service used to compile SQL subscriptions.
    pub fn set_sql_evaluator(&self, evaluator: Arc<dyn SqlEvaluator>) {
        *self.lock(&self.sql_evaluator) = Some(evaluator);
    }

    /// Subscribe with tag syntax: `"*"`, or tags joined by `||` such as
    /// `"TagA || TagC || TagD"`. Replaces any previous filter for the topic.
    pub async fn subscribe(&self, topic: &str, tags: &str) -> Result<(), ClientError> {
        let expression = FilterExpression::Tag(TagExpression::parse(tags)?);
        self.install_subscription(Subscription::new(topic, expression))
            .await
    }

    /// Subscribe with a SQL-92 predicate over message properties, compiled by
    /// the injected [`SqlEvaluator`]. A malformed expression is rejected here
    /// and nothing is registered.
    pub async fn subscribe_sql(&self, topic: &str, expression: &str) -> Result<(), ClientError> {
        let evaluator = self
            .lock(&self.sql_evaluator)
            .clone()
            .ok_or_else(|| ClientError::Filter {
                expression: expression.to_owned(),
                reason: "no SQL evaluator configured".to_owned(),
            })?;
        let sql = SqlExpression::compile(expression, evaluator.as_ref())?;
        self.install_subscription(Subscription::new(topic, FilterExpression::Sql(sql)))
            .await
    }

    async fn install_subscription(&self, subscription: Subscription) -> Result<(), ClientError> {
        let running_session = {
            let state = self.lock(&self.state);
            if *state == ServiceState::Shutdown {
                return Err(ClientError::InvalidState("PushConsumer::subscribe"));
            }
            *self.lock(&self.session)
        };
        // Push to the endpoint first: a rejected filter must not take effect
        // locally, or the two sides silently diverge.
        if let Some(session) = running_session {
            self.endpoint
                .register_subscription(session, subscription.clone())
                .await?;
        }
        self.lock(&self.subscriptions)
            .insert(subscription.topic.clone(), subscription);
        Ok(())
    }

    /// Register the batch handler. Exactly one per consumer; a second call
    /// replaces the first.
    pub fn register_handler(&self, handler: impl MessageHandler) {
        *self.lock(&self.handler) = Some(Arc::new(handler));
    }

    /// Register the group, connect, push subscriptions to the endpoint and
    /// spawn the polling loop. Requires a registered handler.
    pub async fn start(&self) -> Result<(), ClientError> {
        {
            let state = self.lock(&self.state);
            if *state != ServiceState::Created {
                return Err(ClientError::InvalidState("PushConsumer::start"));
            }
        }
        let handler = self
            .lock(&self.handler)
            .clone()
            .ok_or(ClientError::InvalidState(
                "PushConsumer::start without a registered handler",
            ))?;

        registry::register("consumer", &self.group)?;
        let session = match self.endpoint.connect(&self.group).await {
            Ok(session) => session,
            Err(e) => {
                registry::deregister("consumer", &self.group);
                return Err(e);
            }
        };
        let subscriptions: Vec<Subscription> =
            self.lock(&self.subscriptions).values().cloned().collect();
        for subscription in subscriptions {
            if let Err(e) = self
                .endpoint
                .register_subscription(session, subscription)
                .await
            {
                // Unwind both start steps so the group name and the session
                // are free for a retry.
                if let Err(de) = self.endpoint.disconnect(session).await {
                    warn!("disconnect after failed subscription push: {}", de);
                }
                registry::deregister("consumer", &self.group);
                return Err(e);
            }
        }

        let workers = Arc::new(Semaphore::new(self.options.consume_concurrency));
        let (stop_tx, stop_rx) = watch::channel(false);
        let poll_loop = tokio::spawn(poll_loop(
            Arc::clone(&self.endpoint),
            session,
            handler,
            Arc::clone(&workers),
            self.options.clone(),
            stop_rx,
        ));

        *self.lock(&self.session) = Some(session);
        *self.lock(&self.workers) = Some(workers);
        *self.lock(&self.stop) = Some(stop_tx);
        *self.lock(&self.poll_loop) = Some(poll_loop);
        *self.lock(&self.state) = ServiceState::Running;
        info!("consumer group {} started", self.group);
        Ok(())
    }

    /// Stop pulling, drain in-flight handler invocations within the configured
    /// timeout, release the session and deregister the group. A second call
    /// fails fast with [`ClientError::InvalidState`].
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        {
            let mut state = self.lock(&self.state);
            if *state != ServiceState::Running {
                return Err(ClientError::InvalidState("PushConsumer::shutdown"));
            }
            *state = ServiceState::Shutdown;
        }

        let stop = self.lock(&self.stop).take();
        if let Some(stop) = stop {
            let _ = stop.send(true);
        }
        let poll_loop = self.lock(&self.poll_loop).take();
        if let Some(mut handle) = poll_loop {
            if tokio::time::timeout(self.options.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!("poll loop did not stop within the shutdown timeout");
                handle.abort();
            }
        }
        let workers = self.lock(&self.workers).take();
        if let Some(workers) = workers {
            let permits = self.options.consume_concurrency as u32;
            match tokio::time::timeout(self.options.shutdown_timeout, workers.acquire_many(permits))
                .await
            {
                Ok(Ok(_drained)) => {}
                _ => warn!("abandoning in-flight handler invocations after the shutdown timeout"),
            }
        }

        let session = self.lock(&self.session).take();
        if let Some(session) = session {
            self.endpoint.disconnect(session).await?;
        }
        registry::deregister("consumer", &self.group);
        info!("consumer group {} shut down", self.group);
        Ok(())
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Long-poll pull feeding the worker pool. One pulled partition becomes one
/// handler batch, so order within a partition is preserved while separate
/// partitions are processed concurrently.
async fn poll_loop(
    endpoint: Arc<dyn BrokerEndpoint>,
    session: SessionId,
    handler: Arc<dyn MessageHandler>,
    workers: Arc<Semaphore>,
    options: ConsumerOptions,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let pulled = tokio::select! {
            biased;
            _ = stop.changed() => break,
            pulled = endpoint.pull(session, options.consume_batch_size, options.pull_wait) => pulled,
        };
        let pulled = match pulled {
            Ok(pulled) => pulled,
            Err(ClientError::BadSession) => break,
            Err(e) => {
                error!("pull failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if pulled.is_empty() {
            continue;
        }

        // Group the pull result by partition; each group is one handler batch.
        let mut batches: HashMap<(String, u32), Vec<MessageExt>> = HashMap::new();
        for message in pulled {
            let key = (message.topic().to_owned(), message.queue_id);
            batches.entry(key).or_default().push(message);
        }

        for (_, batch) in batches {
            // Acquiring a permit before dispatch is the backpressure point:
            // once the pool is saturated, pulling itself pauses here.
            let permit = tokio::select! {
                biased;
                _ = stop.changed() => {
                    if let Err(e) = endpoint.nack(session, &batch).await {
                        warn!("nack during shutdown failed: {}", e);
                    }
                    return;
                }
                permit = Arc::clone(&workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let endpoint = Arc::clone(&endpoint);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let _permit = permit;
                dispatch_batch(endpoint.as_ref(), session, handler, batch).await;
            });
        }
    }
    debug!("poll loop stopped");
}

/// Invoke the handler on its own task so a panic is contained, then convert
/// the outcome into an acknowledge or a redelivery decision.
async fn dispatch_batch(
    endpoint: &dyn BrokerEndpoint,
    session: SessionId,
    handler: Arc<dyn MessageHandler>,
    batch: Vec<MessageExt>,
) {
    let handler_batch = batch.clone();
    let verdict = match tokio::spawn(async move { handler.consume(handler_batch).await }).await {
        Ok(verdict) => verdict,
        Err(e) => {
            let failure = ClientError::Handler(format!("handler panicked: {}", e));
            error!("{}; batch of {} will be redelivered", failure, batch.len());
            ConsumeVerdict::RetryLater
        }
    };

    let outcome = match verdict {
        ConsumeVerdict::Success => endpoint.acknowledge(session, &batch).await,
        ConsumeVerdict::RetryLater => endpoint.nack(session, &batch).await,
    };
    if let Err(e) = outcome {
        // Leaving the batch pending is safe: unacknowledged messages are
        // redelivered, never dropped.
        warn!("failed to settle batch of {}: {}", batch.len(), e);
    }
}
