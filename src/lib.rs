//! This crate provides producer and push-consumer APIs over an abstract message broker endpoint,
//! covering sync, async, batch and scheduled sends, tag and SQL filtered subscriptions, and
//! at-least-once concurrent consumption.
pub mod consumer;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod memory;
pub mod message;
pub mod producer;
pub(crate) mod registry;

pub use consumer::{ConsumeVerdict, ConsumerOptions, MessageHandler, PushConsumer};
pub use endpoint::{BrokerEndpoint, SessionId};
pub use error::ClientError;
pub use filter::{
    CompiledFilter, FilterExpression, SqlEvaluator, SqlExpression, Subscription, TagExpression,
};
pub use memory::{MemoryEndpoint, MemoryEndpointOptions, SubscriptionMode};
pub use message::{Message, MessageExt, SendResult, SendStatus};
pub use producer::{Producer, ProducerOptions, SendHandle};
