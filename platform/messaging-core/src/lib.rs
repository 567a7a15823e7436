//! # Banking Messaging Core
//!
//! Producer/consumer abstraction over a partitioned, topic-based log
//! transport, plus the event envelope every banking service exchanges.
//!
//! ## Components
//!
//! - **EventEnvelope**: canonical wire shape, built through an [`EnvelopeFactory`]
//! - **Topic registry**: static logical-category to physical-topic table ([`topics`])
//! - **Publisher**: idempotent publish; reports [`PublishOutcome::Unavailable`]
//!   instead of failing when the link is down
//! - **Subscriber**: message loop that commits progress only after the
//!   handler succeeded, with pause/resume for backpressure
//!
//! ## Transports
//!
//! - **JetStreamProducer / JetStreamConsumer**: production transport over NATS JetStream
//! - **InMemoryBroker**: partitioned in-process broker for tests and local development
//!
//! ## Usage
//!
//! ```rust,no_run
//! use messaging_core::{
//!     handler_fn, EnvelopeFactory, EventType, InMemoryBroker, PublishOptions, Publisher,
//!     Subscriber, SubscriberConfig, TopicCategory,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//!
//! let publisher = Publisher::new(
//!     Arc::new(broker.producer()),
//!     EnvelopeFactory::new("user-service")?,
//! );
//! publisher.connect().await?;
//! publisher
//!     .publish(
//!         TopicCategory::UserEvents.key(),
//!         EventType::UserCreated,
//!         serde_json::json!({"id": "u1"}),
//!         "u1",
//!         PublishOptions::default(),
//!     )
//!     .await?;
//!
//! let subscriber = Subscriber::new(
//!     Arc::new(broker.consumer("notification-service")),
//!     SubscriberConfig::new(["USER_EVENTS"]).from_beginning(true),
//! )?;
//! subscriber.set_handler(handler_fn(|message| async move {
//!     println!("{} @ {}", message.topic, message.offset);
//!     Ok(())
//! }));
//! subscriber.connect().await?;
//! subscriber.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod envelope;
mod error;
mod jetstream;
mod memory;
mod publisher;
pub mod retry;
mod subscriber;
pub mod topics;

pub use config::{ConfigError, MessagingConfig};
pub use envelope::{
    create_envelope, validate_envelope_fields, EnvelopeError, EnvelopeFactory, EnvelopeValidation,
    EventCategory, EventEnvelope, EventType, DEFAULT_ENVELOPE_VERSION,
};
pub use error::{MessagingError, MessagingResult};
pub use jetstream::{JetStreamConsumer, JetStreamProducer, JetStreamSettings};
pub use memory::{InMemoryBroker, InMemoryConsumer, InMemoryProducer, DEFAULT_PARTITIONS};
pub use publisher::{BatchMessage, ConnectionState, PublishOptions, PublishOutcome, Publisher};
pub use retry::{retry_with_backoff, RetryConfig};
pub use subscriber::{
    handler_fn, ConsumerStats, FnHandler, MessageHandler, StatsSnapshot, Subscriber,
    SubscriberConfig, SubscriberState,
};
pub use topics::TopicCategory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

/// Header carrying the envelope's `eventType`
pub const HEADER_EVENT_TYPE: &str = "event-type";
/// Header carrying the envelope's `version`
pub const HEADER_EVENT_VERSION: &str = "event-version";
/// Header carrying the envelope's `source`
pub const HEADER_SOURCE_SERVICE: &str = "source-service";
/// Header carrying the envelope's `correlationId` (only when set)
pub const HEADER_CORRELATION_ID: &str = "correlation-id";

/// Error type application handlers return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Record handed to a producer transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Partition key; records sharing a key keep their relative order
    pub key: String,
    /// Encoded envelope
    pub value: Vec<u8>,
    pub headers: HashMap<String, String>,
    /// Idempotency id used by the transport to drop duplicate writes
    pub message_id: Option<String>,
}

/// Where a record landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Position of a delivered message, used for commit and redelivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessagePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A message received from a consumer transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// The topic this message was published to
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// The message value (raw bytes)
    pub value: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl TransportMessage {
    pub fn position(&self) -> MessagePosition {
        MessagePosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// `event-type` header, readable without decoding the value
    pub fn event_type(&self) -> Option<&str> {
        self.header(HEADER_EVENT_TYPE)
    }
}

/// Compression requested from the transport. Never changes the logical contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl std::str::FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(format!("unknown compression: {other}")),
        }
    }
}

/// Per-send transport options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Transport-internal retries must not write duplicate records
    pub idempotent: bool,
    pub compression: Compression,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            idempotent: true,
            compression: Compression::default(),
        }
    }
}

/// Errors reported by transports
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("failed to send: {0}")]
    Send(String),

    #[error("failed to subscribe: {0}")]
    Subscribe(String),

    #[error("failed to fetch: {0}")]
    Fetch(String),

    #[error("failed to commit: {0}")]
    Commit(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sending half of the external log transport
#[async_trait]
pub trait ProducerTransport: Send + Sync {
    async fn connect(&self) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;

    /// Write `records` to `topic` as one request.
    ///
    /// Either every record is written and its position returned (in input
    /// order), or the whole request is reported as failed.
    async fn send(
        &self,
        topic: &str,
        records: Vec<OutboundRecord>,
        options: &SendOptions,
    ) -> TransportResult<Vec<RecordMetadata>>;
}

/// Receiving half of the external log transport
#[async_trait]
pub trait ConsumerTransport: Send + Sync {
    async fn connect(&self) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;

    /// Start delivery for `topics`, resuming from the committed position
    /// (or from the start/end of the log when nothing was committed).
    async fn subscribe(&self, topics: &[String], from_beginning: bool) -> TransportResult<()>;

    /// Wait for the next message in partition order.
    ///
    /// Returns `Ok(None)` once delivery has been stopped. Must be cancel-safe:
    /// dropping the future before it resolves loses no message.
    async fn poll(&self) -> TransportResult<Option<TransportMessage>>;

    /// Mark everything up to and including `position` as processed.
    async fn commit(&self, position: &MessagePosition) -> TransportResult<()>;

    /// Deliver `position` again instead of moving past it.
    async fn redeliver(&self, position: &MessagePosition) -> TransportResult<()>;

    /// Stop handing out new messages for `topics`, keeping the subscription.
    async fn pause(&self, topics: &[String]) -> TransportResult<()>;

    async fn resume(&self, topics: &[String]) -> TransportResult<()>;

    /// End the current delivery session; `poll` returns `Ok(None)` afterwards.
    async fn stop(&self) -> TransportResult<()>;
}

impl fmt::Debug for dyn ProducerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProducerTransport")
    }
}

impl fmt::Debug for dyn ConsumerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConsumerTransport")
    }
}
