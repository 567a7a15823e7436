//! Connectivity probe: publishes one `UserCreated` event through JetStream
//! and logs whatever the configured topics deliver for a few seconds.

use messaging_core::{
    handler_fn, retry_with_backoff, EventEnvelope, EventType, JetStreamConsumer,
    JetStreamProducer, MessagingConfig, PublishOptions, Publisher, RetryConfig, Subscriber,
    TopicCategory,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,messaging_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let mut cfg = MessagingConfig::from_env()?;
    if cfg.topics.is_empty() {
        cfg.topics = vec![TopicCategory::UserEvents.key().to_string()];
    }
    let listen = Duration::from_secs(
        std::env::var("PROBE_LISTEN_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()?,
    );
    let settings = cfg.jetstream_settings();
    let connect_retry = RetryConfig {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(5),
    };

    let subscriber = Subscriber::new(
        Arc::new(JetStreamConsumer::new(settings.clone(), cfg.group_id.clone())),
        cfg.subscriber_config(),
    )?;
    subscriber.set_handler(handler_fn(|message| async move {
        match EventEnvelope::<serde_json::Value>::decode(&message) {
            Ok(envelope) => info!(
                topic = %message.topic,
                offset = message.offset,
                event_id = %envelope.event_id(),
                event_type = %envelope.event_type(),
                source = %envelope.source(),
                "Received event"
            ),
            Err(e) => warn!(topic = %message.topic, offset = message.offset, error = %e, "Undecodable message"),
        }
        Ok(())
    }));
    retry_with_backoff(|| subscriber.connect(), &connect_retry, "subscriber_connect").await?;
    subscriber.start().await?;

    let publisher = Publisher::new(
        Arc::new(JetStreamProducer::new(settings)),
        cfg.envelope_factory()?,
    )
    .with_compression(cfg.compression);
    retry_with_backoff(|| publisher.connect(), &connect_retry, "publisher_connect").await?;

    let user_id = uuid::Uuid::new_v4().to_string();
    let outcome = publisher
        .publish(
            TopicCategory::UserEvents.key(),
            EventType::UserCreated,
            serde_json::json!({ "userId": user_id, "origin": "messaging-probe" }),
            &user_id,
            PublishOptions::default().with_correlation_id(user_id.clone()),
        )
        .await?;
    info!(delivered = outcome.is_delivered(), metadata = ?outcome.metadata(), "Probe event published");

    tokio::time::sleep(listen).await;

    info!(stats = ?subscriber.stats(), "Probe finished");
    subscriber.disconnect().await?;
    publisher.disconnect().await?;
    Ok(())
}
