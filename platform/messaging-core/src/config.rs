//! Environment-driven configuration

use crate::{
    Compression, EnvelopeError, EnvelopeFactory, InMemoryBroker, JetStreamSettings, RetryConfig,
    SubscriberConfig, DEFAULT_ENVELOPE_VERSION, DEFAULT_PARTITIONS,
};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingConfig {
    pub nats_url: String,
    /// Producing service name stamped into every envelope
    pub source_service: String,
    pub client_id: String,
    /// Consumer group; defaults to the source service
    pub group_id: String,
    pub stream: String,
    pub envelope_version: String,
    /// Registry keys, registered names, or raw physical names
    pub topics: Vec<String>,
    pub from_beginning: bool,
    pub redelivery: RetryConfig,
    /// Partition count of the in-memory broker
    pub partitions: u32,
    pub compression: Compression,
}

impl MessagingConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let source_service = required("MESSAGING_SOURCE_SERVICE")?;
        let defaults = RetryConfig::default();

        Ok(Self {
            nats_url: required("NATS_URL")?,
            client_id: lookup("MESSAGING_CLIENT_ID").unwrap_or_else(|| source_service.clone()),
            group_id: lookup("MESSAGING_GROUP_ID").unwrap_or_else(|| source_service.clone()),
            stream: lookup("MESSAGING_STREAM").unwrap_or_else(|| "BANKING".to_string()),
            envelope_version: lookup("MESSAGING_ENVELOPE_VERSION")
                .unwrap_or_else(|| DEFAULT_ENVELOPE_VERSION.to_string()),
            topics: lookup("MESSAGING_TOPICS")
                .map(|topics| {
                    topics
                        .split(',')
                        .map(str::trim)
                        .filter(|topic| !topic.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            from_beginning: parse_or(&lookup, "MESSAGING_FROM_BEGINNING", false)?,
            redelivery: RetryConfig {
                initial_backoff: Duration::from_millis(parse_or(
                    &lookup,
                    "MESSAGING_REDELIVERY_INITIAL_MS",
                    defaults.initial_backoff.as_millis() as u64,
                )?),
                max_backoff: Duration::from_millis(parse_or(
                    &lookup,
                    "MESSAGING_REDELIVERY_MAX_MS",
                    defaults.max_backoff.as_millis() as u64,
                )?),
                ..defaults
            },
            partitions: match parse_or(&lookup, "MESSAGING_PARTITIONS", DEFAULT_PARTITIONS)? {
                0 => {
                    return Err(ConfigError::Invalid {
                        key: "MESSAGING_PARTITIONS",
                        value: "0".to_string(),
                        reason: "must be at least 1".to_string(),
                    })
                }
                partitions => partitions,
            },
            compression: parse_or(&lookup, "MESSAGING_COMPRESSION", Compression::default())?,
            source_service,
        })
    }

    pub fn envelope_factory(&self) -> Result<EnvelopeFactory, EnvelopeError> {
        Ok(EnvelopeFactory::new(self.source_service.clone())?
            .with_version(self.envelope_version.clone()))
    }

    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig::new(self.topics.clone())
            .from_beginning(self.from_beginning)
            .with_redelivery(self.redelivery.clone())
    }

    pub fn jetstream_settings(&self) -> JetStreamSettings {
        JetStreamSettings::new(self.nats_url.clone())
            .with_client_id(self.client_id.clone())
            .with_stream(self.stream.clone())
            .with_compression(self.compression)
    }

    pub fn in_memory_broker(&self) -> InMemoryBroker {
        InMemoryBroker::with_partitions(self.partitions)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: value.clone(),
            reason: e.to_string(),
        }),
    }
}
