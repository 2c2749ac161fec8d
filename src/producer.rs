//!
//! This module defines the producer side of the client: packaging messages
//! into delivery requests and executing them against the broker endpoint under
//! one of four delivery modes (sync, async, batch, scheduled).
//!

use crate::endpoint::{BrokerEndpoint, SessionId};
use crate::error::ClientError;
use crate::message::{validate_batch, validate_message, Message, SendResult};
use crate::registry;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Created,
    Running,
    Shutdown,
}

/// Retry budgets and timeouts. Values mirror the defaults callers tune in
/// practice: a small positive sync budget, and zero async retries so a failure
/// callback is never preceded by an invisible duplicate delivery.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ProducerOptions {
    /// Extra attempts after the first failed sync or batch send.
    pub send_retry_times: u32,
    /// Extra attempts for async sends. Independent of the sync budget.
    pub async_retry_times: u32,
    /// Per-attempt bound on waiting for the broker acknowledgment.
    #[serde(with = "duration_millis")]
    pub send_timeout: Duration,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        ProducerOptions {
            send_retry_times: 2,
            async_retry_times: 0,
            send_timeout: Duration::from_secs(3),
        }
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Awaitable outcome of an async send. Resolves exactly once, to either the
/// broker's [`SendResult`] or the final error after the async retry budget.
pub struct SendHandle {
    receiver: oneshot::Receiver<Result<SendResult, ClientError>>,
}

impl SendHandle {
    pub async fn wait(self) -> Result<SendResult, ClientError> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            // The sending task completes the channel before exiting; this arm
            // is only reachable if the runtime is torn down mid-send.
            Err(_) => Err(ClientError::Broker("send task dropped".to_owned())),
        }
    }
}

/// A producer instance bound to one group name and one broker session.
///
/// Lifecycle: [`start`](Self::start) before the first send, then
/// [`shutdown`](Self::shutdown) once the instance is no longer in use. Any
/// send outside that bracket fails with [`ClientError::InvalidState`].
pub struct Producer {
    group: String,
    endpoint: Arc<dyn BrokerEndpoint>,
    options: ProducerOptions,
    state: Mutex<ServiceState>,
    session: Mutex<Option<SessionId>>,
}

impl Producer {
    pub fn new(group: impl Into<String>, endpoint: Arc<dyn BrokerEndpoint>) -> Self {
        Self::with_options(group, endpoint, ProducerOptions::default())
    }

    pub fn with_options(
        group: impl Into<String>,
        endpoint: Arc<dyn BrokerEndpoint>,
        options: ProducerOptions,
    ) -> Self {
        Producer {
            group: group.into(),
            endpoint,
            options,
            state: Mutex::new(ServiceState::Created),
            session: Mutex::new(None),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Register the group name and acquire a broker session.
    pub async fn start(&self) -> Result<(), ClientError> {
        {
            let state = self.lock_state();
            if *state != ServiceState::Created {
                return Err(ClientError::InvalidState("Producer::start"));
            }
        }
        registry::register("producer", &self.group)?;
        let session = match self.endpoint.connect(&self.group).await {
            Ok(session) => session,
            Err(e) => {
                registry::deregister("producer", &self.group);
                return Err(e);
            }
        };
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
        *self.lock_state() = ServiceState::Running;
        info!("producer group {} started", self.group);
        Ok(())
    }

    /// Release the broker session and deregister the group. A second call
    /// fails fast with [`ClientError::InvalidState`].
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        {
            let mut state = self.lock_state();
            if *state != ServiceState::Running {
                return Err(ClientError::InvalidState("Producer::shutdown"));
            }
            *state = ServiceState::Shutdown;
        }
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(session) = session {
            self.endpoint.disconnect(session).await?;
        }
        registry::deregister("producer", &self.group);
        info!("producer group {} shut down", self.group);
        Ok(())
    }

    /// Block until the broker acknowledges, retrying up to the configured
    /// budget. After the budget is exhausted the error carries the last cause;
    /// the caller must treat the delivery as unknown, since an earlier attempt
    /// may have reached the broker.
    pub async fn send_sync(&self, message: Message) -> Result<SendResult, ClientError> {
        let session = self.current_session("Producer::send_sync")?;
        validate_message(&message).map_err(ClientError::InvalidMessage)?;
        let wait_store_ok = message.wait_store_ok;
        let delay_level = message.delay_level;
        self.submit_with_retries(
            session,
            vec![message],
            wait_store_ok,
            delay_level,
            self.options.send_retry_times,
        )
        .await
    }

    /// Return immediately and drive the send on a background task. The
    /// returned [`SendHandle`] resolves exactly once, to success or failure,
    /// after the independent async retry budget.
    pub fn send_async(&self, message: Message) -> Result<SendHandle, ClientError> {
        let session = self.current_session("Producer::send_async")?;
        validate_message(&message).map_err(ClientError::InvalidMessage)?;
        let (sender, receiver) = oneshot::channel();
        let endpoint = Arc::clone(&self.endpoint);
        let retries = self.options.async_retry_times;
        let timeout = self.options.send_timeout;
        tokio::spawn(async move {
            let wait_store_ok = message.wait_store_ok;
            let delay_level = message.delay_level;
            let outcome = submit_with_retries_on(
                endpoint.as_ref(),
                session,
                vec![message],
                wait_store_ok,
                delay_level,
                retries,
                timeout,
            )
            .await;
            // The receiver may have been dropped; completion is best effort then.
            let _ = sender.send(outcome);
        });
        Ok(SendHandle { receiver })
    }

    /// Deliver several messages as one all-or-nothing unit. The batch
    /// invariants are checked locally first: same topic, same durability flag,
    /// no delay level, aggregate body within 1 MiB. A violation fails with
    /// [`ClientError::BatchValidation`] before anything reaches the broker.
    pub async fn send_batch(&self, messages: Vec<Message>) -> Result<SendResult, ClientError> {
        let session = self.current_session("Producer::send_batch")?;
        validate_batch(&messages).map_err(ClientError::BatchValidation)?;
        let wait_store_ok = messages[0].wait_store_ok;
        self.submit_with_retries(
            session,
            messages,
            wait_store_ok,
            None,
            self.options.send_retry_times,
        )
        .await
    }

    /// Send a message that stays invisible to consumers until the delay bucket
    /// elapses. Holding the message back is the broker's responsibility; this
    /// call only stamps the level and submits.
    pub async fn send_scheduled(
        &self,
        message: Message,
        delay_level: u8,
    ) -> Result<SendResult, ClientError> {
        self.send_sync(message.with_delay_level(delay_level)).await
    }

    /// Semantically identical to [`send_sync`](Self::send_sync). Whether every
    /// subscriber instance receives the message is decided by the topic's
    /// subscription mode, not by this call; do not assume load-balanced
    /// delivery when the topic is a broadcast topic.
    pub async fn send_broadcast(&self, message: Message) -> Result<SendResult, ClientError> {
        self.send_sync(message).await
    }

    async fn submit_with_retries(
        &self,
        session: SessionId,
        messages: Vec<Message>,
        wait_store_ok: bool,
        delay_level: Option<u8>,
        retries: u32,
    ) -> Result<SendResult, ClientError> {
        submit_with_retries_on(
            self.endpoint.as_ref(),
            session,
            messages,
            wait_store_ok,
            delay_level,
            retries,
            self.options.send_timeout,
        )
        .await
    }

    fn current_session(&self, operation: &'static str) -> Result<SessionId, ClientError> {
        if *self.lock_state() != ServiceState::Running {
            return Err(ClientError::InvalidState(operation));
        }
        let guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        (*guard).ok_or(ClientError::InvalidState(operation))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn submit_with_retries_on(
    endpoint: &dyn BrokerEndpoint,
    session: SessionId,
    messages: Vec<Message>,
    wait_store_ok: bool,
    delay_level: Option<u8>,
    retries: u32,
    timeout: Duration,
) -> Result<SendResult, ClientError> {
    let attempts = retries + 1;
    let mut last = ClientError::Broker("no attempt made".to_owned());
    for attempt in 1..=attempts {
        let submit = endpoint.submit(session, messages.clone(), wait_store_ok, delay_level);
        match tokio::time::timeout(timeout, submit).await {
            Ok(Ok(result)) => {
                debug!(
                    "submit ok on attempt {}/{}: id {}",
                    attempt, attempts, result.message_id
                );
                return Ok(result);
            }
            Ok(Err(e)) => {
                warn!("submit attempt {}/{} failed: {}", attempt, attempts, e);
                last = e;
            }
            Err(_) => {
                warn!(
                    "submit attempt {}/{} timed out after {:?}",
                    attempt, attempts, timeout
                );
                last = ClientError::Broker(format!("acknowledgment timeout after {:?}", timeout));
            }
        }
    }
    Err(ClientError::SendFailure {
        attempts,
        cause: Box::new(last),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{BrokerEndpoint, SessionId};
    use crate::filter::Subscription;
    use crate::memory::MemoryEndpoint;
    use crate::message::{MessageExt, SendStatus, MAX_BATCH_BODY_BYTES};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_send_outside_lifecycle_bracket() -> Result<(), Box<dyn std::error::Error>> {
        let producer = Producer::new("LifecycleProducerGroup", MemoryEndpoint::new());
        let result = producer.send_sync(Message::new("TopicTest1", "early")).await;
        assert!(matches!(result, Err(ClientError::InvalidState(_))));

        producer.start().await?;
        producer.send_sync(Message::new("TopicTest1", "ok")).await?;
        producer.shutdown().await?;

        let result = producer.send_sync(Message::new("TopicTest1", "late")).await;
        assert!(matches!(result, Err(ClientError::InvalidState(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_double_shutdown_fails_fast() -> Result<(), Box<dyn std::error::Error>> {
        let producer = Producer::new("DoubleShutdownGroup", MemoryEndpoint::new());
        producer.start().await?;
        producer.shutdown().await?;
        assert!(matches!(
            producer.shutdown().await,
            Err(ClientError::InvalidState("Producer::shutdown"))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_group_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let endpoint = MemoryEndpoint::new();
        let first = Producer::new("UniqueProducerGroup", endpoint.clone());
        let second = Producer::new("UniqueProducerGroup", endpoint);
        first.start().await?;
        assert!(matches!(
            second.start().await,
            Err(ClientError::DuplicateGroup(_))
        ));
        first.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_send_batch_rejects_violations_locally() -> Result<(), Box<dyn std::error::Error>> {
        let producer = Producer::new("BatchValidationGroup", MemoryEndpoint::new());
        producer.start().await?;

        let mixed = vec![
            Message::new("BatchTopic", "Hello world 0"),
            Message::new("OtherTopic", "Hello world 1"),
        ];
        assert!(matches!(
            producer.send_batch(mixed).await,
            Err(ClientError::BatchValidation(_))
        ));

        let scheduled = vec![
            Message::new("BatchTopic", "Hello world 0"),
            Message::new("BatchTopic", "Hello world 1").with_delay_level(3),
        ];
        assert!(matches!(
            producer.send_batch(scheduled).await,
            Err(ClientError::BatchValidation(_))
        ));

        let oversized = vec![
            Message::new("BatchTopic", vec![0u8; MAX_BATCH_BODY_BYTES / 2 + 1]),
            Message::new("BatchTopic", vec![0u8; MAX_BATCH_BODY_BYTES / 2 + 1]),
        ];
        assert!(matches!(
            producer.send_batch(oversized).await,
            Err(ClientError::BatchValidation(_))
        ));

        producer.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_send_batch_delivers_as_one_unit() -> Result<(), Box<dyn std::error::Error>> {
        let endpoint = MemoryEndpoint::new();
        let producer = Producer::new("BatchProducerGroup", endpoint.clone());
        producer.start().await?;

        let messages: Vec<Message> = (0..3)
            .map(|i| {
                Message::new("BatchTopic", format!("Hello world {}", i))
                    .with_tag("TagA")
                    .with_key(format!("OrderID00{}", i + 1))
            })
            .collect();
        let result = producer.send_batch(messages).await?;
        assert_eq!(result.status, SendStatus::SendOk);
        assert_eq!(result.message_id.split(',').count(), 3);

        // All three land in one partition, visible to a TagA subscriber.
        let session = endpoint.connect("BatchCheckGroup").await?;
        endpoint
            .register_subscription(
                session,
                Subscription::new(
                    "BatchTopic",
                    crate::filter::FilterExpression::Tag(
                        crate::filter::TagExpression::parse("TagA")?,
                    ),
                ),
            )
            .await?;
        let batch = endpoint.pull(session, 32, Duration::from_secs(1)).await?;
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|m| m.queue_id == result.queue_id));

        producer.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_send_async_resolves_once_on_success() -> Result<(), Box<dyn std::error::Error>> {
        let producer = Producer::new("AsyncProducerGroup1", MemoryEndpoint::new());
        producer.start().await?;
        let handle = producer.send_async(
            Message::new("TopicTest1", "AsyncProducer Hello world 0")
                .with_tag("TagC")
                .with_key("OrderID188"),
        )?;
        let result = handle.wait().await?;
        assert_eq!(result.status, SendStatus::SendOk);
        producer.shutdown().await?;
        Ok(())
    }

    /// Endpoint that rejects every submit and counts the attempts.
    struct FailingEndpoint {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl BrokerEndpoint for FailingEndpoint {
        async fn connect(&self, _group: &str) -> Result<SessionId, ClientError> {
            Ok(SessionId(1))
        }
        async fn disconnect(&self, _session: SessionId) -> Result<(), ClientError> {
            Ok(())
        }
        async fn submit(
            &self,
            _session: SessionId,
            _messages: Vec<Message>,
            _wait_store_ok: bool,
            _delay_level: Option<u8>,
        ) -> Result<SendResult, ClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::Broker("store unavailable".to_owned()))
        }
        async fn register_subscription(
            &self,
            _session: SessionId,
            _subscription: Subscription,
        ) -> Result<(), ClientError> {
            Ok(())
        }
        async fn pull(
            &self,
            _session: SessionId,
            _max: usize,
            _wait: Duration,
        ) -> Result<Vec<MessageExt>, ClientError> {
            Ok(Vec::new())
        }
        async fn acknowledge(
            &self,
            _session: SessionId,
            _messages: &[MessageExt],
        ) -> Result<(), ClientError> {
            Ok(())
        }
        async fn nack(
            &self,
            _session: SessionId,
            _messages: &[MessageExt],
        ) -> Result<(), ClientError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_empty_topic_rejected_before_submit() -> Result<(), Box<dyn std::error::Error>> {
        let endpoint = Arc::new(FailingEndpoint {
            attempts: AtomicU32::new(0),
        });
        let producer = Producer::new("EmptyTopicGroup", endpoint.clone());
        producer.start().await?;

        assert!(matches!(
            producer.send_sync(Message::new("", "no address")).await,
            Err(ClientError::InvalidMessage(_))
        ));
        assert!(matches!(
            producer.send_async(Message::new("", "no address")),
            Err(ClientError::InvalidMessage(_))
        ));
        assert_eq!(
            endpoint.attempts.load(Ordering::SeqCst),
            0,
            "a message without a topic must never reach the broker"
        );

        producer.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_sync_retry_budget_then_send_failure() -> Result<(), Box<dyn std::error::Error>> {
        let endpoint = Arc::new(FailingEndpoint {
            attempts: AtomicU32::new(0),
        });
        let producer = Producer::with_options(
            "RetryProducerGroup",
            endpoint.clone(),
            ProducerOptions {
                send_retry_times: 2,
                ..Default::default()
            },
        );
        producer.start().await?;
        let result = producer.send_sync(Message::new("TopicTest1", "doomed")).await;
        match result {
            Err(ClientError::SendFailure { attempts, cause }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*cause, ClientError::Broker(_)));
            }
            other => panic!("expected SendFailure, got {:?}", other.map(|r| r.status)),
        }
        assert_eq!(endpoint.attempts.load(Ordering::SeqCst), 3);
        producer.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_async_zero_retries_fails_once() -> Result<(), Box<dyn std::error::Error>> {
        let endpoint = Arc::new(FailingEndpoint {
            attempts: AtomicU32::new(0),
        });
        let producer = Producer::with_options(
            "AsyncRetryGroup",
            endpoint.clone(),
            ProducerOptions {
                async_retry_times: 0,
                ..Default::default()
            },
        );
        producer.start().await?;
        let handle = producer.send_async(Message::new("TopicTest1", "doomed"))?;
        let outcome = handle.wait().await;
        assert!(matches!(
            outcome,
            Err(ClientError::SendFailure { attempts: 1, .. })
        ));
        assert_eq!(endpoint.attempts.load(Ordering::SeqCst), 1);
        producer.shutdown().await?;
        Ok(())
    }

    #[test]
    fn test_options_deserialization() -> Result<(), Box<dyn std::error::Error>> {
        let json = r#"
        {"sendRetryTimes": 5, "asyncRetryTimes": 1, "sendTimeout": 1500}
        "#;
        let options: ProducerOptions = serde_json::from_str(json)?;
        assert_eq!(options.send_retry_times, 5);
        assert_eq!(options.async_retry_times, 1);
        assert_eq!(options.send_timeout, Duration::from_millis(1500));
        Ok(())
    }
}
