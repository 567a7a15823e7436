//! NATS JetStream implementation of the producer and consumer transports
//!
//! Every physical topic is a subject captured by one stream. JetStream has a
//! single ordered sequence per stream, so messages always report partition 0
//! and the stream sequence as their offset. The partition key travels in the
//! `partition-key` header.
//!
//! Consumer groups map to durable pull consumers, one per topic, with
//! explicit acks and a single unacknowledged message at a time. Commit acks
//! the message; redelivery naks it so the server hands it out again before
//! anything that follows.

use crate::{
    Compression, ConsumerTransport, MessagePosition, OutboundRecord, ProducerTransport,
    RecordMetadata, SendOptions, TransportError, TransportMessage, TransportResult,
};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    stream, AckKind,
};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Header JetStream uses to drop duplicate publishes
const MSG_ID_HEADER: &str = "Nats-Msg-Id";
/// Header carrying the record's partition key
const PARTITION_KEY_HEADER: &str = "partition-key";

/// Where and how to reach the JetStream server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JetStreamSettings {
    /// Server address, e.g. `nats://localhost:4222`
    pub url: String,
    /// Connection name reported to the server
    pub client_id: String,
    /// Stream holding every banking topic
    pub stream: String,
    /// Subjects captured by the stream
    pub subjects: Vec<String>,
    pub max_age: Duration,
    /// Anything but `None` enables S2 compression on the stream
    pub compression: Compression,
}

impl JetStreamSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_id: "messaging-core".to_string(),
            stream: "BANKING".to_string(),
            subjects: vec!["banking.>".to_string()],
            max_age: Duration::from_secs(60 * 60 * 24 * 14), // 14 days
            compression: Compression::default(),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    pub fn with_subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = subjects;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    fn stream_config(&self) -> stream::Config {
        stream::Config {
            name: self.stream.clone(),
            subjects: self.subjects.clone(),
            max_age: self.max_age,
            compression: match self.compression {
                Compression::None => None,
                _ => Some(stream::Compression::S2),
            },
            ..Default::default()
        }
    }
}

#[derive(Clone)]
struct Link {
    client: Client,
    context: jetstream::Context,
}

async fn open_link(settings: &JetStreamSettings) -> TransportResult<Link> {
    let client = async_nats::ConnectOptions::new()
        .name(settings.client_id.clone())
        .connect(settings.url.as_str())
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    let context = jetstream::new(client.clone());

    context
        .get_or_create_stream(settings.stream_config())
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    info!(url = %settings.url, stream = %settings.stream, "Connected to JetStream");
    Ok(Link { client, context })
}

fn outbound_headers(record: &OutboundRecord, options: &SendOptions) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &record.headers {
        headers.insert(name.as_str(), value.as_str());
    }
    headers.insert(PARTITION_KEY_HEADER, record.key.as_str());
    if options.idempotent {
        if let Some(message_id) = &record.message_id {
            headers.insert(MSG_ID_HEADER, message_id.as_str());
        }
    }
    headers
}

/// Durable consumer names may not contain `.`, `*`, or `>`
fn durable_name(group_id: &str, topic: &str) -> String {
    format!("{group_id}-{topic}")
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            other => other,
        })
        .collect()
}

/// [`ProducerTransport`] publishing to a JetStream stream
pub struct JetStreamProducer {
    settings: JetStreamSettings,
    link: RwLock<Option<Link>>,
}

impl JetStreamProducer {
    pub fn new(settings: JetStreamSettings) -> Self {
        Self {
            settings,
            link: RwLock::new(None),
        }
    }

    fn link(&self) -> TransportResult<Link> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl ProducerTransport for JetStreamProducer {
    async fn connect(&self) -> TransportResult<()> {
        let link = open_link(&self.settings).await?;
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(link);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        let link = self
            .link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(link) = link {
            link.client
                .flush()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
        }
        Ok(())
    }

    /// Publishes in order on one connection, then awaits every ack.
    ///
    /// JetStream has no multi-message write, so a failed ack can leave
    /// earlier records of the request stored. Their message ids make a
    /// resend of the same request harmless.
    async fn send(
        &self,
        topic: &str,
        records: Vec<OutboundRecord>,
        options: &SendOptions,
    ) -> TransportResult<Vec<RecordMetadata>> {
        let link = self.link()?;

        let mut pending = Vec::with_capacity(records.len());
        for record in records {
            let headers = outbound_headers(&record, options);
            let ack = link
                .context
                .publish_with_headers(topic.to_string(), headers, record.value.into())
                .await
                .map_err(|e| TransportError::Send(e.to_string()))?;
            pending.push(ack);
        }

        let mut metadata = Vec::with_capacity(pending.len());
        for ack in pending {
            let ack = ack
                .await
                .map_err(|e| TransportError::Send(e.to_string()))?;
            if ack.duplicate {
                debug!(topic = %topic, sequence = ack.sequence, "Duplicate publish dropped by stream");
            }
            metadata.push(RecordMetadata {
                topic: topic.to_string(),
                partition: 0,
                offset: ack.sequence as i64,
            });
        }
        Ok(metadata)
    }
}

type Inbound = Result<jetstream::Message, String>;

struct Session {
    pumps: Vec<JoinHandle<()>>,
    paused: HashMap<String, watch::Sender<bool>>,
}

impl Session {
    fn end(self) {
        for pump in self.pumps {
            pump.abort();
        }
    }
}

/// [`ConsumerTransport`] reading through durable JetStream pull consumers
pub struct JetStreamConsumer {
    settings: JetStreamSettings,
    group_id: String,
    link: RwLock<Option<Link>>,
    inbox: Mutex<Option<mpsc::Receiver<Inbound>>>,
    session: StdMutex<Option<Session>>,
    in_flight: StdMutex<HashMap<MessagePosition, jetstream::Message>>,
}

impl JetStreamConsumer {
    pub fn new(settings: JetStreamSettings, group_id: impl Into<String>) -> Self {
        Self {
            settings,
            group_id: group_id.into(),
            link: RwLock::new(None),
            inbox: Mutex::new(None),
            session: StdMutex::new(None),
            in_flight: StdMutex::new(HashMap::new()),
        }
    }

    fn link(&self) -> TransportResult<Link> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<MessagePosition, jetstream::Message>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn end_session(&self) {
        if let Some(session) = self.session().take() {
            session.end();
        }
        self.inbox.lock().await.take();
        self.in_flight().clear();
    }

    fn set_paused(&self, topics: &[String], paused: bool) -> TransportResult<()> {
        self.link()?;
        if let Some(session) = self.session().as_ref() {
            for topic in topics {
                if let Some(flag) = session.paused.get(topic) {
                    flag.send_replace(paused);
                }
            }
        }
        Ok(())
    }

    fn take_in_flight(&self, position: &MessagePosition) -> TransportResult<jetstream::Message> {
        self.in_flight()
            .remove(position)
            .ok_or_else(|| TransportError::Commit(format!("no in-flight message at {position}")))
    }
}

fn to_transport_message(message: &jetstream::Message) -> Result<TransportMessage, String> {
    let sequence = message.info().map_err(|e| e.to_string())?.stream_sequence;

    let mut headers = HashMap::new();
    if let Some(nats_headers) = &message.message.headers {
        for (name, values) in nats_headers.iter() {
            // First value per header
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.to_string());
            }
        }
    }
    let key = headers.remove(PARTITION_KEY_HEADER);
    headers.remove(MSG_ID_HEADER);

    Ok(TransportMessage {
        topic: message.message.subject.to_string(),
        partition: 0,
        offset: sequence as i64,
        key,
        value: message.message.payload.to_vec(),
        headers,
    })
}

async fn pump(
    consumer: jetstream::consumer::Consumer<pull::Config>,
    topic: String,
    mut paused: watch::Receiver<bool>,
    inbox: mpsc::Sender<Inbound>,
) {
    let mut messages = match consumer.messages().await {
        Ok(messages) => messages,
        Err(e) => {
            let _ = inbox.send(Err(e.to_string())).await;
            return;
        }
    };

    loop {
        if paused.wait_for(|paused| !*paused).await.is_err() {
            break;
        }

        let next = tokio::select! {
            next = messages.next() => next,
            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        let Some(next) = next else {
            debug!(topic = %topic, "Pull stream ended");
            break;
        };
        if inbox.send(next.map_err(|e| e.to_string())).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl ConsumerTransport for JetStreamConsumer {
    async fn connect(&self) -> TransportResult<()> {
        let link = open_link(&self.settings).await?;
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(link);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.end_session().await;
        self.link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    async fn subscribe(&self, topics: &[String], from_beginning: bool) -> TransportResult<()> {
        let link = self.link()?;
        self.end_session().await;

        let stream = link
            .context
            .get_stream(self.settings.stream.as_str())
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let (sender, receiver) = mpsc::channel(topics.len().max(1));
        let mut session = Session {
            pumps: Vec::with_capacity(topics.len()),
            paused: HashMap::new(),
        };

        for topic in topics {
            let name = durable_name(&self.group_id, topic);
            let consumer = stream
                .get_or_create_consumer(
                    &name,
                    pull::Config {
                        durable_name: Some(name.clone()),
                        filter_subject: topic.clone(),
                        ack_policy: AckPolicy::Explicit,
                        // Ignored when the durable already exists; it resumes
                        // from its acked position.
                        deliver_policy: if from_beginning {
                            DeliverPolicy::All
                        } else {
                            DeliverPolicy::New
                        },
                        max_ack_pending: 1,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()));
            let consumer = match consumer {
                Ok(consumer) => consumer,
                Err(e) => {
                    session.end();
                    return Err(e);
                }
            };

            let (paused, paused_rx) = watch::channel(false);
            session.paused.insert(topic.clone(), paused);
            session.pumps.push(tokio::spawn(pump(
                consumer,
                topic.clone(),
                paused_rx,
                sender.clone(),
            )));
            debug!(topic = %topic, durable = %name, "Pull consumer ready");
        }

        *self.inbox.lock().await = Some(receiver);
        *self.session() = Some(session);
        info!(group_id = %self.group_id, topics = ?topics, "Subscribed to JetStream");
        Ok(())
    }

    async fn poll(&self) -> TransportResult<Option<TransportMessage>> {
        let mut inbox = self.inbox.lock().await;
        let Some(receiver) = inbox.as_mut() else {
            self.link()?;
            return Ok(None);
        };

        match receiver.recv().await {
            None => Ok(None),
            Some(Err(e)) => Err(TransportError::Fetch(e)),
            Some(Ok(message)) => {
                let converted = to_transport_message(&message).map_err(TransportError::Fetch)?;
                self.in_flight().insert(converted.position(), message);
                Ok(Some(converted))
            }
        }
    }

    async fn commit(&self, position: &MessagePosition) -> TransportResult<()> {
        let message = self.take_in_flight(position)?;
        message
            .ack()
            .await
            .map_err(|e| TransportError::Commit(e.to_string()))
    }

    async fn redeliver(&self, position: &MessagePosition) -> TransportResult<()> {
        let message = self.take_in_flight(position)?;
        if let Err(e) = message.ack_with(AckKind::Nak(None)).await {
            // Without the nak the server still redelivers after ack_wait
            warn!(position = %position, error = %e, "Nak failed");
        }
        Ok(())
    }

    async fn pause(&self, topics: &[String]) -> TransportResult<()> {
        self.set_paused(topics, true)
    }

    async fn resume(&self, topics: &[String]) -> TransportResult<()> {
        self.set_paused(topics, false)
    }

    async fn stop(&self) -> TransportResult<()> {
        self.end_session().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EnvelopeFactory, EventType, PublishOptions, Publisher};
    use std::sync::Arc;

    // Tests marked #[ignore] need a JetStream-enabled server:
    // docker run -p 4222:4222 nats:2.10-alpine -js

    #[test]
    fn test_durable_name_strips_subject_tokens() {
        assert_eq!(
            durable_name("fraud-service", "banking.transactions.initiated"),
            "fraud-service-banking_transactions_initiated"
        );
        assert_eq!(durable_name("a b", "x.*.>"), "a_b-x____");
    }

    #[test]
    fn test_outbound_headers_carry_key_and_message_id() {
        let record = OutboundRecord {
            key: "user-1".to_string(),
            value: b"{}".to_vec(),
            headers: HashMap::from([("event-type".to_string(), "UserCreated".to_string())]),
            message_id: Some("evt-1".to_string()),
        };

        let headers = outbound_headers(&record, &SendOptions::default());
        assert_eq!(headers.get("event-type").map(|v| v.as_str()), Some("UserCreated"));
        assert_eq!(headers.get(PARTITION_KEY_HEADER).map(|v| v.as_str()), Some("user-1"));
        assert_eq!(headers.get(MSG_ID_HEADER).map(|v| v.as_str()), Some("evt-1"));

        let plain = SendOptions {
            idempotent: false,
            ..SendOptions::default()
        };
        assert!(outbound_headers(&record, &plain).get(MSG_ID_HEADER).is_none());
    }

    #[test]
    fn test_stream_compression_follows_settings() {
        let settings = JetStreamSettings::new("nats://localhost:4222");
        assert!(matches!(
            settings.stream_config().compression,
            Some(stream::Compression::S2)
        ));
        let plain = settings.with_compression(Compression::None);
        assert!(plain.stream_config().compression.is_none());
    }

    #[tokio::test]
    async fn test_send_before_connect_is_rejected() {
        let producer = JetStreamProducer::new(JetStreamSettings::new("nats://localhost:4222"));
        let result = producer
            .send("banking.users.events", Vec::new(), &SendOptions::default())
            .await;
        assert_eq!(result, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream
    async fn test_jetstream_publish_and_consume() {
        let settings = JetStreamSettings::new("nats://localhost:4222")
            .with_stream("BANKING_TEST")
            .with_subjects(vec!["banking.>".to_string()]);

        let publisher = Publisher::new(
            Arc::new(JetStreamProducer::new(settings.clone())),
            EnvelopeFactory::new("user-service").unwrap(),
        );
        publisher.connect().await.unwrap();

        let consumer = JetStreamConsumer::new(settings, format!("test-{}", uuid::Uuid::new_v4()));
        consumer.connect().await.unwrap();
        consumer
            .subscribe(&["banking.users.events".to_string()], false)
            .await
            .unwrap();

        let outcome = publisher
            .publish(
                "USER_EVENTS",
                EventType::UserCreated,
                serde_json::json!({"id": "u1"}),
                "u1",
                PublishOptions::default(),
            )
            .await
            .unwrap();
        assert!(outcome.is_delivered());

        let message = tokio::time::timeout(Duration::from_secs(5), consumer.poll())
            .await
            .expect("timeout waiting for message")
            .unwrap()
            .expect("delivery stopped");
        assert_eq!(message.topic, "banking.users.events");
        assert_eq!(message.key.as_deref(), Some("u1"));
        assert_eq!(message.event_type(), Some("UserCreated"));

        consumer.commit(&message.position()).await.unwrap();
        consumer.disconnect().await.unwrap();
        publisher.disconnect().await.unwrap();
    }
}
