//!
//! This module defines the abstract broker contract the client core talks to.
//! Discovery, persistence, replication and the bytes on the wire all live
//! behind this trait; the client only depends on its call shapes.
//!

use crate::error::ClientError;
use crate::filter::Subscription;
use crate::message::{Message, MessageExt, SendResult};
use async_trait::async_trait;
use std::time::Duration;

/// Handle to one broker session. Sessions are owned exclusively by the
/// producer or consumer instance that opened them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// The broker endpoint contract consumed by this core.
///
/// Sync, batch and scheduled sends unify on [`submit`](Self::submit); a batch
/// is accepted or rejected as one unit. [`pull`](Self::pull) has long-poll
/// semantics: it blocks up to the given bound and may return an empty batch.
#[async_trait]
pub trait BrokerEndpoint: Send + Sync + 'static {
    async fn connect(&self, group: &str) -> Result<SessionId, ClientError>;

    async fn disconnect(&self, session: SessionId) -> Result<(), ClientError>;

    async fn submit(
        &self,
        session: SessionId,
        messages: Vec<Message>,
        wait_store_ok: bool,
        delay_level: Option<u8>,
    ) -> Result<SendResult, ClientError>;

    async fn register_subscription(
        &self,
        session: SessionId,
        subscription: Subscription,
    ) -> Result<(), ClientError>;

    async fn pull(
        &self,
        session: SessionId,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<MessageExt>, ClientError>;

    /// Acknowledge a delivered batch: the group's committed offset advances and
    /// the messages leave the pending set for good.
    async fn acknowledge(
        &self,
        session: SessionId,
        messages: &[MessageExt],
    ) -> Result<(), ClientError>;

    /// Negative-acknowledge a delivered batch: the messages become eligible for
    /// redelivery after a broker-defined backoff.
    async fn nack(&self, session: SessionId, messages: &[MessageExt]) -> Result<(), ClientError>;
}
