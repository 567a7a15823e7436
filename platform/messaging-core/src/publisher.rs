//! Publisher: envelope construction, headers, and idempotent send

use crate::error::{MessagingError, MessagingResult};
use crate::topics::resolve_topic;
use crate::{
    Compression, EnvelopeFactory, EventEnvelope, EventType, OutboundRecord, ProducerTransport,
    RecordMetadata, SendOptions, TransportError, HEADER_CORRELATION_ID, HEADER_EVENT_TYPE, HEADER_EVENT_VERSION,
    HEADER_SOURCE_SERVICE,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Publisher connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

/// Caller-supplied metadata for one publish call
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Propagated verbatim into the envelope and the `correlation-id` header
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    /// Extra transport headers; the envelope headers take precedence
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Result of a publish call that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum PublishOutcome {
    /// Written; one entry per record, in input order
    Delivered(Vec<RecordMetadata>),
    /// The publisher is not connected and nothing was sent.
    /// The caller owns the fallback (e.g. a local durable log).
    Unavailable,
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Delivered(_))
    }

    pub fn metadata(&self) -> &[RecordMetadata] {
        match self {
            PublishOutcome::Delivered(metadata) => metadata,
            PublishOutcome::Unavailable => &[],
        }
    }
}

/// One entry of [`Publisher::publish_batch`]
#[derive(Debug, Clone)]
pub struct BatchMessage<T> {
    pub event_type: EventType,
    pub payload: T,
    pub partition_key: String,
}

impl<T> BatchMessage<T> {
    pub fn new(event_type: EventType, payload: T, partition_key: impl Into<String>) -> Self {
        Self {
            event_type,
            payload,
            partition_key: partition_key.into(),
        }
    }
}

/// Sends envelopes to topics over an exclusively owned producer transport
///
/// - Never throws because the link is down: publishing while not connected
///   returns [`PublishOutcome::Unavailable`] without touching the transport,
///   and so does a send the transport refuses with `NotConnected`.
/// - Never swallows send failures: once connected, a rejected send is
///   returned as [`MessagingError::SendFailure`].
/// - Sends are idempotent at the transport: every record carries the
///   envelope's `eventId` as its idempotency id.
pub struct Publisher {
    transport: Arc<dyn ProducerTransport>,
    factory: EnvelopeFactory,
    send_options: SendOptions,
    state: watch::Sender<ConnectionState>,
    // Serialises connect/disconnect
    transition: Mutex<()>,
}

impl Publisher {
    pub fn new(transport: Arc<dyn ProducerTransport>, factory: EnvelopeFactory) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            factory,
            send_options: SendOptions::default(),
            state,
            transition: Mutex::new(()),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.send_options.compression = compression;
        self
    }

    pub fn factory(&self) -> &EnvelopeFactory {
        &self.factory
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect the transport. Failures are returned, not retried.
    pub async fn connect(&self) -> MessagingResult<()> {
        let _guard = self.transition.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.state.send_replace(ConnectionState::Connecting);
        match self.transport.connect().await {
            Ok(()) => {
                self.state.send_replace(ConnectionState::Connected);
                info!(source = %self.factory.source(), "Publisher connected");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                error!(source = %self.factory.source(), error = %e, "Publisher failed to connect");
                Err(MessagingError::Connection(e))
            }
        }
    }

    /// Disconnect; a no-op when already disconnected
    pub async fn disconnect(&self) -> MessagingResult<()> {
        let _guard = self.transition.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        let result = self.transport.disconnect().await;
        self.state.send_replace(ConnectionState::Disconnected);
        match result {
            Ok(()) => {
                info!(source = %self.factory.source(), "Publisher disconnected");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Transport reported an error while disconnecting");
                Err(MessagingError::Connection(e))
            }
        }
    }

    /// Build an envelope for `payload` and send it to `topic`, keyed by `partition_key`.
    ///
    /// `topic` is a registry key, a registered name, or a raw
    /// `<domain>.<category>.<action>` name.
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        event_type: EventType,
        payload: T,
        partition_key: &str,
        options: PublishOptions,
    ) -> MessagingResult<PublishOutcome> {
        let topic = resolve(topic)?;
        if !self.is_connected() {
            warn!(topic = %topic, event_type = %event_type, "Publisher unavailable, event not sent");
            return Ok(PublishOutcome::Unavailable);
        }

        let envelope = self.envelope(event_type, payload, &options);
        let record = self.record_for(&envelope, partition_key, &options.headers)?;
        self.send(&topic, vec![record]).await
    }

    /// Send an already built envelope again, byte for byte.
    ///
    /// The `eventId` is unchanged, so an application-level retry is
    /// recognisable downstream as the same logical event.
    pub async fn publish_envelope<T: Serialize>(
        &self,
        topic: &str,
        envelope: &EventEnvelope<T>,
        partition_key: &str,
        headers: &HashMap<String, String>,
    ) -> MessagingResult<PublishOutcome> {
        let topic = resolve(topic)?;
        if !self.is_connected() {
            warn!(topic = %topic, event_id = %envelope.event_id(), "Publisher unavailable, event not sent");
            return Ok(PublishOutcome::Unavailable);
        }

        let record = self.record_for(envelope, partition_key, headers)?;
        self.send(&topic, vec![record]).await
    }

    /// Send every message as one transport request, preserving input order.
    ///
    /// The request succeeds or fails as a whole; there is no per-record retry.
    pub async fn publish_batch<T: Serialize>(
        &self,
        topic: &str,
        messages: Vec<BatchMessage<T>>,
        options: PublishOptions,
    ) -> MessagingResult<PublishOutcome> {
        let topic = resolve(topic)?;
        if !self.is_connected() {
            warn!(topic = %topic, count = messages.len(), "Publisher unavailable, batch not sent");
            return Ok(PublishOutcome::Unavailable);
        }
        if messages.is_empty() {
            return Ok(PublishOutcome::Delivered(Vec::new()));
        }

        let records = messages
            .into_iter()
            .map(|message| {
                let envelope = self.envelope(message.event_type, message.payload, &options);
                self.record_for(&envelope, &message.partition_key, &options.headers)
            })
            .collect::<MessagingResult<Vec<_>>>()?;
        self.send(&topic, records).await
    }

    fn envelope<T>(
        &self,
        event_type: EventType,
        payload: T,
        options: &PublishOptions,
    ) -> EventEnvelope<T> {
        self.factory
            .create(event_type, payload)
            .with_correlation_id(options.correlation_id.clone())
            .with_causation_id(options.causation_id.clone())
    }

    fn record_for<T: Serialize>(
        &self,
        envelope: &EventEnvelope<T>,
        partition_key: &str,
        extra_headers: &HashMap<String, String>,
    ) -> MessagingResult<OutboundRecord> {
        let value = envelope.to_bytes()?;

        let mut headers = extra_headers.clone();
        headers.insert(
            HEADER_EVENT_TYPE.to_string(),
            envelope.event_type().to_string(),
        );
        headers.insert(
            HEADER_EVENT_VERSION.to_string(),
            envelope.version().to_string(),
        );
        headers.insert(
            HEADER_SOURCE_SERVICE.to_string(),
            envelope.source().to_string(),
        );
        match envelope.correlation_id() {
            Some(correlation_id) => {
                headers.insert(HEADER_CORRELATION_ID.to_string(), correlation_id.to_string());
            }
            None => {
                headers.remove(HEADER_CORRELATION_ID);
            }
        }

        Ok(OutboundRecord {
            key: partition_key.to_string(),
            value,
            headers,
            message_id: Some(envelope.event_id().to_string()),
        })
    }

    async fn send(
        &self,
        topic: &str,
        records: Vec<OutboundRecord>,
    ) -> MessagingResult<PublishOutcome> {
        let count = records.len();
        match self
            .transport
            .send(topic, records, &self.send_options)
            .await
        {
            Ok(metadata) => {
                for record in &metadata {
                    debug!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "Event published"
                    );
                }
                Ok(PublishOutcome::Delivered(metadata))
            }
            Err(TransportError::NotConnected) => {
                warn!(topic = %topic, count, "Transport link down, event not sent");
                Ok(PublishOutcome::Unavailable)
            }
            Err(e) => {
                error!(topic = %topic, count, error = %e, "Publish failed");
                Err(MessagingError::SendFailure {
                    topic: topic.to_string(),
                    source: e,
                })
            }
        }
    }
}

fn resolve(topic: &str) -> MessagingResult<String> {
    resolve_topic(topic).ok_or_else(|| MessagingError::InvalidTopic(topic.to_string()))
}
