use crate::{EnvelopeError, HandlerError, TransportError};

/// Errors surfaced by [`Publisher`](crate::Publisher) and [`Subscriber`](crate::Subscriber)
///
/// A disconnected publisher is not an error; see
/// [`PublishOutcome::Unavailable`](crate::PublishOutcome::Unavailable).
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Connecting or disconnecting the transport failed. Never retried here.
    #[error("connection error: {0}")]
    Connection(#[source] TransportError),

    /// `start()` was called before a handler was registered
    #[error("no message handler registered")]
    HandlerNotSet,

    /// The transport rejected a send after the connection was established
    #[error("failed to publish to {topic}: {source}")]
    SendFailure {
        topic: String,
        #[source]
        source: TransportError,
    },

    /// The handler failed; the message was not committed and will be redelivered
    #[error("handler failed on {topic}[{partition}]@{offset}: {source}")]
    HandlerFailure {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: HandlerError,
    },

    /// The handler succeeded but the transport refused the commit
    #[error("commit failed on {topic}[{partition}]@{offset}: {source}")]
    CommitFailure {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: TransportError,
    },

    #[error("unknown topic: {0}")]
    InvalidTopic(String),

    #[error("subscriber has no topics configured")]
    NoTopics,

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for publisher and subscriber operations
pub type MessagingResult<T> = Result<T, MessagingError>;
