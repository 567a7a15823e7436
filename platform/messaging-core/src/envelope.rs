//! # Event Envelope
//!
//! Canonical wire shape for every event exchanged between banking services.
//!
//! ## Envelope Fields
//!
//! - `eventId`: Unique identifier, assigned once by the producer (idempotency key)
//! - `eventType`: Member of the closed [`EventType`] enumeration
//! - `timestamp`: ISO 8601 construction time
//! - `version`: Envelope schema version of the producing component
//! - `correlationId`: Links every event of one workflow (optional, propagated verbatim)
//! - `causationId`: The specific event that caused this one (optional)
//! - `source`: Service that produced the event
//! - `payload`: Caller-owned business data, opaque to this crate
//!
//! Envelopes are immutable once built. The only way to attach the optional
//! ids is through the consuming `with_*` builders, before the envelope is
//! handed to a [`Publisher`](crate::Publisher).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::topics::TopicCategory;
use crate::TransportMessage;

/// Envelope schema version used when a factory is not given one explicitly.
pub const DEFAULT_ENVELOPE_VERSION: &str = "1.0";

/// Errors raised while building or decoding envelopes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid event type: {0}")]
    InvalidEventType(String),

    #[error("source identity cannot be empty")]
    EmptySource,

    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

/// Business area an [`EventType`] belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Transaction,
    Fraud,
    User,
    Security,
    Notification,
    Aml,
}

/// Closed set of event kinds understood by the platform.
///
/// The wire spelling is the variant name (`"UserCreated"`). Adding a variant
/// is a coordinated change across producers and consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Transaction lifecycle
    TransactionInitiated,
    TransactionValidated,
    TransactionCompleted,
    TransactionFailed,
    TransactionReversed,
    // Fraud outcome
    FraudAnalysisCompleted,
    FraudDetected,
    FraudManualReview,
    // User lifecycle
    UserCreated,
    UserUpdated,
    UserDeleted,
    // Security / auth
    UserLoggedIn,
    UserLoggedOut,
    LoginFailed,
    PasswordChanged,
    AccountLocked,
    SecurityAlert,
    // Notification
    NotificationRequested,
    NotificationSent,
    // AML
    AmlCheckCompleted,
    AmlAlertRaised,
}

impl EventType {
    /// Every known event type, in declaration order
    pub const ALL: [EventType; 21] = [
        EventType::TransactionInitiated,
        EventType::TransactionValidated,
        EventType::TransactionCompleted,
        EventType::TransactionFailed,
        EventType::TransactionReversed,
        EventType::FraudAnalysisCompleted,
        EventType::FraudDetected,
        EventType::FraudManualReview,
        EventType::UserCreated,
        EventType::UserUpdated,
        EventType::UserDeleted,
        EventType::UserLoggedIn,
        EventType::UserLoggedOut,
        EventType::LoginFailed,
        EventType::PasswordChanged,
        EventType::AccountLocked,
        EventType::SecurityAlert,
        EventType::NotificationRequested,
        EventType::NotificationSent,
        EventType::AmlCheckCompleted,
        EventType::AmlAlertRaised,
    ];

    /// Wire name, identical to the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TransactionInitiated => "TransactionInitiated",
            EventType::TransactionValidated => "TransactionValidated",
            EventType::TransactionCompleted => "TransactionCompleted",
            EventType::TransactionFailed => "TransactionFailed",
            EventType::TransactionReversed => "TransactionReversed",
            EventType::FraudAnalysisCompleted => "FraudAnalysisCompleted",
            EventType::FraudDetected => "FraudDetected",
            EventType::FraudManualReview => "FraudManualReview",
            EventType::UserCreated => "UserCreated",
            EventType::UserUpdated => "UserUpdated",
            EventType::UserDeleted => "UserDeleted",
            EventType::UserLoggedIn => "UserLoggedIn",
            EventType::UserLoggedOut => "UserLoggedOut",
            EventType::LoginFailed => "LoginFailed",
            EventType::PasswordChanged => "PasswordChanged",
            EventType::AccountLocked => "AccountLocked",
            EventType::SecurityAlert => "SecurityAlert",
            EventType::NotificationRequested => "NotificationRequested",
            EventType::NotificationSent => "NotificationSent",
            EventType::AmlCheckCompleted => "AmlCheckCompleted",
            EventType::AmlAlertRaised => "AmlAlertRaised",
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            EventType::TransactionInitiated
            | EventType::TransactionValidated
            | EventType::TransactionCompleted
            | EventType::TransactionFailed
            | EventType::TransactionReversed => EventCategory::Transaction,
            EventType::FraudAnalysisCompleted
            | EventType::FraudDetected
            | EventType::FraudManualReview => EventCategory::Fraud,
            EventType::UserCreated | EventType::UserUpdated | EventType::UserDeleted => {
                EventCategory::User
            }
            EventType::UserLoggedIn
            | EventType::UserLoggedOut
            | EventType::LoginFailed
            | EventType::PasswordChanged
            | EventType::AccountLocked
            | EventType::SecurityAlert => EventCategory::Security,
            EventType::NotificationRequested | EventType::NotificationSent => {
                EventCategory::Notification
            }
            EventType::AmlCheckCompleted | EventType::AmlAlertRaised => EventCategory::Aml,
        }
    }

    /// Registry topic this event type is routed to unless the caller picks another
    pub fn default_topic(&self) -> TopicCategory {
        match self {
            EventType::TransactionInitiated => TopicCategory::TransactionInitiated,
            EventType::TransactionValidated => TopicCategory::TransactionValidated,
            EventType::TransactionCompleted => TopicCategory::TransactionCompleted,
            EventType::TransactionFailed => TopicCategory::TransactionFailed,
            EventType::TransactionReversed => TopicCategory::TransactionReversed,
            EventType::FraudAnalysisCompleted => TopicCategory::FraudAnalysisComplete,
            EventType::FraudDetected => TopicCategory::FraudDetected,
            EventType::FraudManualReview => TopicCategory::FraudManualReview,
            EventType::UserCreated | EventType::UserUpdated | EventType::UserDeleted => {
                TopicCategory::UserEvents
            }
            EventType::UserLoggedIn
            | EventType::UserLoggedOut
            | EventType::LoginFailed
            | EventType::PasswordChanged
            | EventType::AccountLocked
            | EventType::SecurityAlert => TopicCategory::SecurityEvents,
            EventType::NotificationRequested | EventType::NotificationSent => {
                TopicCategory::Notifications
            }
            EventType::AmlCheckCompleted => TopicCategory::AmlChecks,
            EventType::AmlAlertRaised => TopicCategory::AmlAlerts,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EnvelopeError::InvalidEventType(s.to_string()))
    }
}

/// Standard event envelope
///
/// # Examples
///
/// ```rust
/// use messaging_core::{EnvelopeFactory, EventType};
/// use serde_json::json;
///
/// let factory = EnvelopeFactory::new("payments-service").unwrap();
/// let envelope = factory
///     .create(EventType::TransactionInitiated, json!({"transactionId": "tx-1"}))
///     .with_correlation_id(Some("req-42".to_string()));
///
/// assert_eq!(envelope.source(), "payments-service");
/// assert_eq!(envelope.correlation_id(), Some("req-42"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T = serde_json::Value> {
    event_id: Uuid,
    event_type: EventType,
    timestamp: DateTime<Utc>,
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    causation_id: Option<String>,
    source: String,
    payload: T,
}

impl<T> EventEnvelope<T> {
    fn new(event_type: EventType, source: String, version: String, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            version,
            correlation_id: None,
            causation_id: None,
            source,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Set the correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the causation ID
    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Chain this envelope onto `parent`.
    ///
    /// The parent's correlation id is copied as is, absent included; the
    /// causation id points at the parent.
    pub fn caused_by<U>(self, parent: &EventEnvelope<U>) -> Self {
        self.with_correlation_id(parent.correlation_id.clone())
            .with_causation_id(Some(parent.event_id.to_string()))
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// JSON wire encoding (UTF-8)
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }
}

impl<T: DeserializeOwned> EventEnvelope<T> {
    /// Decode a wire value. Unknown fields are ignored, unknown event types are not.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }

    /// Decode the value of a received transport message
    pub fn decode(message: &TransportMessage) -> Result<Self, EnvelopeError> {
        Self::from_bytes(&message.value)
    }
}

/// Builds envelopes for one producing component.
///
/// `source` and `version` are fixed per factory so every envelope a component
/// emits carries the same identity.
#[derive(Debug, Clone)]
pub struct EnvelopeFactory {
    source: String,
    version: String,
}

impl EnvelopeFactory {
    pub fn new(source: impl Into<String>) -> Result<Self, EnvelopeError> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(EnvelopeError::EmptySource);
        }
        Ok(Self {
            source,
            version: DEFAULT_ENVELOPE_VERSION.to_string(),
        })
    }

    /// Set the envelope schema version stamped on every envelope
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn create<T>(&self, event_type: EventType, payload: T) -> EventEnvelope<T> {
        EventEnvelope::new(
            event_type,
            self.source.clone(),
            self.version.clone(),
            payload,
        )
    }

    /// Like [`create`](Self::create), for event types arriving as strings
    pub fn create_named<T>(
        &self,
        event_type: &str,
        payload: T,
    ) -> Result<EventEnvelope<T>, EnvelopeError> {
        let event_type = event_type.parse::<EventType>()?;
        Ok(self.create(event_type, payload))
    }
}

/// Build a single envelope without keeping a factory around.
pub fn create_envelope<T>(
    event_type: &str,
    source: &str,
    payload: T,
) -> Result<EventEnvelope<T>, EnvelopeError> {
    let event_type = event_type.parse::<EventType>()?;
    Ok(EnvelopeFactory::new(source)?.create(event_type, payload))
}

/// Outcome of [`validate_envelope_fields`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeValidation {
    Valid,
    Invalid { reason: String },
}

impl EnvelopeValidation {
    fn invalid(reason: impl Into<String>) -> Self {
        EnvelopeValidation::Invalid {
            reason: reason.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, EnvelopeValidation::Valid)
    }
}

/// Validate a raw wire envelope
///
/// # Validation Rules
///
/// - `eventId`: Must be a UUID string
/// - `eventType`: Must name a known [`EventType`]
/// - `timestamp`: Must be an RFC 3339 string
/// - `version`, `source`: Must be non-empty strings
/// - `correlationId`, `causationId`: Strings when present
/// - `payload`: Must be present
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> EnvelopeValidation {
    let Some(object) = envelope.as_object() else {
        return EnvelopeValidation::invalid("envelope must be a JSON object");
    };

    match object.get("eventId").and_then(|v| v.as_str()) {
        None => return EnvelopeValidation::invalid("Missing or invalid eventId"),
        Some(id) if Uuid::parse_str(id).is_err() => {
            return EnvelopeValidation::invalid(format!("eventId is not a UUID: {id}"))
        }
        Some(_) => {}
    }

    match object.get("eventType").and_then(|v| v.as_str()) {
        None => return EnvelopeValidation::invalid("Missing or invalid eventType"),
        Some(kind) if kind.parse::<EventType>().is_err() => {
            return EnvelopeValidation::invalid(format!("unknown eventType: {kind}"))
        }
        Some(_) => {}
    }

    match object.get("timestamp").and_then(|v| v.as_str()) {
        None => return EnvelopeValidation::invalid("Missing or invalid timestamp"),
        Some(ts) if DateTime::parse_from_rfc3339(ts).is_err() => {
            return EnvelopeValidation::invalid(format!("timestamp is not ISO 8601: {ts}"))
        }
        Some(_) => {}
    }

    for field in ["version", "source"] {
        match object.get(field).and_then(|v| v.as_str()) {
            None => return EnvelopeValidation::invalid(format!("Missing or invalid {field}")),
            Some(value) if value.is_empty() => {
                return EnvelopeValidation::invalid(format!("{field} cannot be empty"))
            }
            Some(_) => {}
        }
    }

    for field in ["correlationId", "causationId"] {
        if let Some(value) = object.get(field) {
            if !value.is_string() && !value.is_null() {
                return EnvelopeValidation::invalid(format!("{field} must be a string"));
            }
        }
    }

    if !object.contains_key("payload") {
        return EnvelopeValidation::invalid("Missing payload");
    }

    EnvelopeValidation::Valid
}
