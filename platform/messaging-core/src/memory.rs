//! In-memory partitioned log transport for testing and development

use crate::{
    Compression, ConsumerTransport, MessagePosition, OutboundRecord, ProducerTransport,
    RecordMetadata, SendOptions, TransportError, TransportMessage, TransportResult,
};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

/// Partitions per topic unless [`InMemoryBroker::with_partitions`] says otherwise
pub const DEFAULT_PARTITIONS: u32 = 3;

/// Broker shared by any number of producer and consumer handles
///
/// Behaves like a small log broker:
/// - every topic has a fixed number of partitions; a record's partition is
///   derived from its key, so equal keys stay in order
/// - offsets are committed per consumer group; a new delivery session resumes
///   at the committed offset
/// - idempotent sends are de-duplicated on the record's message id
///
/// # Example
/// ```rust
/// use messaging_core::{InMemoryBroker, OutboundRecord, ProducerTransport, SendOptions};
/// use std::collections::HashMap;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let producer = broker.producer();
/// producer.connect().await?;
///
/// let record = OutboundRecord {
///     key: "acct-1".to_string(),
///     value: b"{}".to_vec(),
///     headers: HashMap::new(),
///     message_id: Some("evt-1".to_string()),
/// };
/// producer
///     .send("banking.users.events", vec![record.clone()], &SendOptions::default())
///     .await?;
/// producer
///     .send("banking.users.events", vec![record], &SendOptions::default())
///     .await?;
///
/// assert_eq!(broker.records("banking.users.events").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    partitions: u32,
    state: Mutex<BrokerState>,
    // Wakes pollers on new records, resume and stop
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<Vec<StoredRecord>>>,
    written_ids: HashMap<(String, String), RecordMetadata>,
    committed: HashMap<(String, String, i32), i64>,
    connect_failure: Option<String>,
    send_failure: Option<String>,
    send_requests: usize,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    value: Vec<u8>,
    headers: HashMap<String, String>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                partitions: partitions.max(1),
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    /// New producer handle (starts disconnected)
    pub fn producer(&self) -> InMemoryProducer {
        InMemoryProducer {
            broker: self.clone(),
            connected: AtomicBool::new(false),
        }
    }

    /// New consumer handle in `group_id` (starts disconnected)
    pub fn consumer(&self, group_id: impl Into<String>) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            group_id: group_id.into(),
            connected: AtomicBool::new(false),
            session: Mutex::new(Session::default()),
        }
    }

    /// Partition a key is written to
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.inner.partitions)) as i32
    }

    /// Make every following `connect` fail (`None` clears it)
    pub fn fail_connections(&self, reason: Option<&str>) {
        self.state().connect_failure = reason.map(str::to_string);
    }

    /// Make every following `send` fail (`None` clears it)
    pub fn fail_sends(&self, reason: Option<&str>) {
        self.state().send_failure = reason.map(str::to_string);
    }

    /// Number of send requests that reached the broker, failed ones included
    pub fn send_requests(&self) -> usize {
        self.state().send_requests
    }

    /// All records of `topic`, partition by partition in offset order
    pub fn records(&self, topic: &str) -> Vec<TransportMessage> {
        let state = self.state();
        let Some(partitions) = state.logs.get(topic) else {
            return Vec::new();
        };
        let messages: Vec<TransportMessage> = partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter().enumerate().map(move |(offset, record)| {
                    to_message(topic, partition as i32, offset as i64, record)
                })
            })
            .collect();
        messages
    }

    /// Next offset `group_id` will read from `topic`/`partition`, if it ever committed
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_connect(&self) -> TransportResult<()> {
        match &self.state().connect_failure {
            Some(reason) => Err(TransportError::Connection(reason.clone())),
            None => Ok(()),
        }
    }

    fn append(
        &self,
        topic: &str,
        records: Vec<OutboundRecord>,
        options: &SendOptions,
    ) -> TransportResult<Vec<RecordMetadata>> {
        let partitions = self.inner.partitions as usize;
        let mut guard = self.state();
        let state = &mut *guard;
        state.send_requests += 1;

        if let Some(reason) = &state.send_failure {
            return Err(TransportError::Send(reason.clone()));
        }

        let mut delivered = Vec::with_capacity(records.len());
        for record in records {
            let dedupe_key = match (&record.message_id, options.idempotent) {
                (Some(id), true) => Some((topic.to_string(), id.clone())),
                _ => None,
            };
            if let Some(existing) = dedupe_key.as_ref().and_then(|k| state.written_ids.get(k)) {
                debug!(topic, offset = existing.offset, "Dropped duplicate idempotent write");
                delivered.push(existing.clone());
                continue;
            }

            let partition = self.partition_for(&record.key);
            let log = state
                .logs
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new(); partitions]);
            let lane = &mut log[partition as usize];
            let metadata = RecordMetadata {
                topic: topic.to_string(),
                partition,
                offset: lane.len() as i64,
            };
            lane.push(StoredRecord {
                key: record.key,
                value: record.value,
                headers: record.headers,
            });

            if let Some(key) = dedupe_key {
                state.written_ids.insert(key, metadata.clone());
            }
            delivered.push(metadata);
        }
        drop(guard);

        if options.compression != Compression::None {
            debug!(topic, compression = ?options.compression, "Compression is a no-op in memory");
        }
        self.inner.notify.notify_waiters();
        Ok(delivered)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn to_message(topic: &str, partition: i32, offset: i64, record: &StoredRecord) -> TransportMessage {
    TransportMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: Some(record.key.clone()),
        value: record.value.clone(),
        headers: record.headers.clone(),
    }
}

/// Producer handle on an [`InMemoryBroker`]
pub struct InMemoryProducer {
    broker: InMemoryBroker,
    connected: AtomicBool,
}

#[async_trait]
impl ProducerTransport for InMemoryProducer {
    async fn connect(&self) -> TransportResult<()> {
        self.broker.check_connect()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        records: Vec<OutboundRecord>,
        options: &SendOptions,
    ) -> TransportResult<Vec<RecordMetadata>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.broker.append(topic, records, options)
    }
}

/// Consumer handle on an [`InMemoryBroker`], member of one consumer group
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group_id: String,
    connected: AtomicBool,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    delivering: bool,
    // (topic, partition) in delivery rotation order
    lanes: Vec<(String, i32)>,
    positions: HashMap<(String, i32), i64>,
    paused: HashSet<String>,
    cursor: usize,
}

impl InMemoryConsumer {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn end_session(&self) {
        let mut session = self.session();
        session.delivering = false;
        session.paused.clear();
        drop(session);
        self.broker.inner.notify.notify_waiters();
    }

    // Lock order: session, then broker state.
    fn next_available(&self, session: &mut Session) -> Option<TransportMessage> {
        let state = self.broker.state();
        let lanes = session.lanes.len();

        for step in 0..lanes {
            let index = (session.cursor + step) % lanes;
            let (topic, partition) = &session.lanes[index];
            if session.paused.contains(topic) {
                continue;
            }
            let position = session
                .positions
                .get(&(topic.clone(), *partition))
                .copied()
                .unwrap_or(0);
            let record = state
                .logs
                .get(topic)
                .and_then(|partitions| partitions.get(*partition as usize))
                .and_then(|log| log.get(position as usize));

            if let Some(record) = record {
                let message = to_message(topic, *partition, position, record);
                session
                    .positions
                    .insert((topic.clone(), *partition), position + 1);
                session.cursor = index + 1;
                return Some(message);
            }
        }
        None
    }
}

#[async_trait]
impl ConsumerTransport for InMemoryConsumer {
    async fn connect(&self) -> TransportResult<()> {
        self.broker.check_connect()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.end_session();
        Ok(())
    }

    async fn subscribe(&self, topics: &[String], from_beginning: bool) -> TransportResult<()> {
        self.ensure_connected()?;
        let partitions = self.broker.inner.partitions as i32;

        let mut session = self.session();
        let state = self.broker.state();
        session.lanes.clear();
        session.positions.clear();
        session.paused.clear();
        session.cursor = 0;

        for topic in topics {
            for partition in 0..partitions {
                let committed = state
                    .committed
                    .get(&(self.group_id.clone(), topic.clone(), partition))
                    .copied();
                let end = state
                    .logs
                    .get(topic)
                    .map_or(0, |log| log[partition as usize].len() as i64);
                let start = match committed {
                    Some(offset) => offset,
                    None if from_beginning => 0,
                    None => end,
                };
                session.lanes.push((topic.clone(), partition));
                session.positions.insert((topic.clone(), partition), start);
            }
        }
        session.delivering = true;
        debug!(group_id = %self.group_id, ?topics, "Subscribed");
        Ok(())
    }

    async fn poll(&self) -> TransportResult<Option<TransportMessage>> {
        loop {
            let notified = self.broker.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent send cannot be missed
            notified.as_mut().enable();

            {
                self.ensure_connected()?;
                let mut session = self.session();
                if !session.delivering {
                    return Ok(None);
                }
                if let Some(message) = self.next_available(&mut session) {
                    return Ok(Some(message));
                }
            }

            notified.await;
        }
    }

    async fn commit(&self, position: &MessagePosition) -> TransportResult<()> {
        self.ensure_connected()?;
        self.broker.state().committed.insert(
            (self.group_id.clone(), position.topic.clone(), position.partition),
            position.offset + 1,
        );
        Ok(())
    }

    async fn redeliver(&self, position: &MessagePosition) -> TransportResult<()> {
        self.ensure_connected()?;
        let mut session = self.session();
        let lane = (position.topic.clone(), position.partition);
        let current = session.positions.get(&lane).copied().unwrap_or(0);
        session
            .positions
            .insert(lane, current.min(position.offset));
        Ok(())
    }

    async fn pause(&self, topics: &[String]) -> TransportResult<()> {
        self.ensure_connected()?;
        self.session().paused.extend(topics.iter().cloned());
        Ok(())
    }

    async fn resume(&self, topics: &[String]) -> TransportResult<()> {
        self.ensure_connected()?;
        {
            let mut session = self.session();
            for topic in topics {
                session.paused.remove(topic);
            }
        }
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        self.end_session();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const TOPIC: &str = "banking.users.events";

    fn record(key: &str, body: &str, id: Option<&str>) -> OutboundRecord {
        OutboundRecord {
            key: key.to_string(),
            value: body.as_bytes().to_vec(),
            headers: HashMap::new(),
            message_id: id.map(str::to_string),
        }
    }

    async fn connected_producer(broker: &InMemoryBroker) -> InMemoryProducer {
        let producer = broker.producer();
        assert_ok!(producer.connect().await);
        producer
    }

    async fn next(consumer: &InMemoryConsumer) -> TransportMessage {
        tokio::time::timeout(Duration::from_secs(1), consumer.poll())
            .await
            .expect("timeout")
            .expect("poll failed")
            .expect("delivery stopped")
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let broker = InMemoryBroker::new();
        let producer = broker.producer();

        let result = producer
            .send(TOPIC, vec![record("k", "v", None)], &SendOptions::default())
            .await;
        assert_eq!(result, Err(TransportError::NotConnected));
        assert_eq!(broker.send_requests(), 0);
    }

    #[tokio::test]
    async fn test_same_key_keeps_partition_and_order() {
        let broker = InMemoryBroker::with_partitions(4);
        let producer = connected_producer(&broker).await;

        let mut offsets = Vec::new();
        for i in 0..5 {
            let meta = producer
                .send(TOPIC, vec![record("acct-9", &format!("m{i}"), None)], &SendOptions::default())
                .await
                .unwrap();
            assert_eq!(meta[0].partition, broker.partition_for("acct-9"));
            offsets.push(meta[0].offset);
        }
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_idempotent_send_drops_duplicates_only_when_enabled() {
        let broker = InMemoryBroker::with_partitions(1);
        let producer = connected_producer(&broker).await;
        let idempotent = SendOptions::default();
        let plain = SendOptions {
            idempotent: false,
            ..SendOptions::default()
        };

        let first = producer
            .send(TOPIC, vec![record("k", "v", Some("evt-1"))], &idempotent)
            .await
            .unwrap();
        let retry = producer
            .send(TOPIC, vec![record("k", "v", Some("evt-1"))], &idempotent)
            .await
            .unwrap();
        assert_eq!(first, retry);
        assert_eq!(broker.records(TOPIC).len(), 1);

        producer
            .send(TOPIC, vec![record("k", "v", Some("evt-1"))], &plain)
            .await
            .unwrap();
        assert_eq!(broker.records(TOPIC).len(), 2);
    }

    #[tokio::test]
    async fn test_consumer_resumes_from_committed_offset() {
        let broker = InMemoryBroker::with_partitions(1);
        let producer = connected_producer(&broker).await;
        for i in 0..3 {
            producer
                .send(TOPIC, vec![record("k", &format!("m{i}"), None)], &SendOptions::default())
                .await
                .unwrap();
        }

        let consumer = broker.consumer("ledger");
        consumer.connect().await.unwrap();
        consumer.subscribe(&[TOPIC.to_string()], true).await.unwrap();

        let first = next(&consumer).await;
        consumer.commit(&first.position()).await.unwrap();
        let second = next(&consumer).await;
        assert_eq!(second.offset, 1);
        // second is never committed
        consumer.stop().await.unwrap();
        assert_eq!(consumer.poll().await, Ok(None));

        consumer.subscribe(&[TOPIC.to_string()], true).await.unwrap();
        let replayed = next(&consumer).await;
        assert_eq!(replayed.offset, 1);
        assert_eq!(broker.committed_offset("ledger", TOPIC, 0), Some(1));
    }

    #[tokio::test]
    async fn test_redeliver_rewinds_partition() {
        let broker = InMemoryBroker::with_partitions(1);
        let producer = connected_producer(&broker).await;
        producer
            .send(
                TOPIC,
                vec![record("k", "a", None), record("k", "b", None)],
                &SendOptions::default(),
            )
            .await
            .unwrap();

        let consumer = broker.consumer("fraud");
        consumer.connect().await.unwrap();
        consumer.subscribe(&[TOPIC.to_string()], true).await.unwrap();

        let first = next(&consumer).await;
        consumer.redeliver(&first.position()).await.unwrap();
        let again = next(&consumer).await;
        assert_eq!(again.offset, first.offset);
        assert_eq!(again.value, b"a".to_vec());
    }

    #[tokio::test]
    async fn test_latest_subscription_skips_existing_records() {
        let broker = InMemoryBroker::with_partitions(1);
        let producer = connected_producer(&broker).await;
        producer
            .send(TOPIC, vec![record("k", "old", None)], &SendOptions::default())
            .await
            .unwrap();

        let consumer = broker.consumer("audit");
        consumer.connect().await.unwrap();
        consumer.subscribe(&[TOPIC.to_string()], false).await.unwrap();

        producer
            .send(TOPIC, vec![record("k", "new", None)], &SendOptions::default())
            .await
            .unwrap();
        assert_eq!(next(&consumer).await.value, b"new".to_vec());
    }

    #[tokio::test]
    async fn test_paused_topic_is_not_delivered_until_resumed() {
        let broker = InMemoryBroker::with_partitions(1);
        let producer = connected_producer(&broker).await;
        let consumer = broker.consumer("notifications");
        assert_ok!(consumer.connect().await);
        assert_ok!(consumer.subscribe(&[TOPIC.to_string()], true).await);
        assert_ok!(consumer.pause(&[TOPIC.to_string()]).await);

        producer
            .send(TOPIC, vec![record("k", "held", None)], &SendOptions::default())
            .await
            .unwrap();

        assert_err!(
            tokio::time::timeout(Duration::from_millis(50), consumer.poll()).await,
            "paused topic must not deliver"
        );

        consumer.resume(&[TOPIC.to_string()]).await.unwrap();
        assert_eq!(next(&consumer).await.value, b"held".to_vec());
    }

    #[tokio::test]
    async fn test_failing_connect_reports_connection_error() {
        let broker = InMemoryBroker::new();
        broker.fail_connections(Some("broker down"));

        let err = assert_err!(broker.producer().connect().await);
        assert_eq!(err, TransportError::Connection("broker down".to_string()));

        broker.fail_connections(None);
        assert_ok!(broker.producer().connect().await);
    }
}
