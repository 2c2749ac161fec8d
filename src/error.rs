use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Raised when an operation is invoked outside the start/shutdown bracket.
    #[error("Operation `{0}` invoked outside the start/shutdown bracket")]
    InvalidState(&'static str),

    /// The configured retry budget is exhausted; carries the last underlying cause.
    ///
    /// Retries may have reached the broker, so the caller must treat delivery as
    /// unknown rather than definitely failed.
    #[error("Send failed after {attempts} attempt(s)")]
    SendFailure {
        attempts: u32,
        #[source]
        cause: Box<ClientError>,
    },

    /// Malformed single message rejected locally. Nothing was submitted to the broker.
    #[error("Message rejected: {0}")]
    InvalidMessage(String),

    /// Batch invariants violated locally. Nothing was submitted to the broker.
    #[error("Batch rejected: {0}")]
    BatchValidation(String),

    /// Malformed filter expression at subscribe time. The subscription is not registered.
    #[error("Invalid filter expression `{expression}`: {reason}")]
    Filter { expression: String, reason: String },

    /// A user handler failed while processing a batch. Converted to a redelivery
    /// decision at the dispatch boundary, surfaced here for observability only.
    #[error("Handler failure: {0}")]
    Handler(String),

    /// Group names must be unique per process; see `registry`.
    #[error("Group `{0}` is already registered in this process")]
    DuplicateGroup(String),

    #[error("Broker rejected the request: {0}")]
    Broker(String),

    #[error("Unknown topic `{0}`")]
    UnknownTopic(String),

    /// The session was never opened, or was closed by `disconnect`.
    #[error("Session is expired or unknown")]
    BadSession,
}
