//! Shared fakes for the integration tests
//!
//! `RecordingProducer` and `RecordingConsumer` implement the transport
//! traits, remember every call they receive, and let a test script what
//! the transport does.

#![allow(dead_code)]

use async_trait::async_trait;
use messaging_core::{
    ConsumerTransport, MessagePosition, OutboundRecord, ProducerTransport, RecordMetadata,
    SendOptions, TransportError, TransportMessage, TransportResult,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// One `send` call as the transport saw it
#[derive(Debug, Clone)]
pub struct SendCall {
    pub topic: String,
    pub records: Vec<OutboundRecord>,
    pub options: SendOptions,
}

#[derive(Default)]
struct ProducerState {
    connects: usize,
    disconnects: usize,
    sends: Vec<SendCall>,
    connect_error: Option<TransportError>,
    send_error: Option<TransportError>,
    next_offset: i64,
}

#[derive(Default)]
pub struct RecordingProducer {
    state: Mutex<ProducerState>,
}

impl RecordingProducer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ProducerState> {
        self.state.lock().unwrap()
    }

    pub fn fail_connect(&self, error: Option<TransportError>) {
        self.state().connect_error = error;
    }

    pub fn fail_send(&self, error: Option<TransportError>) {
        self.state().send_error = error;
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    pub fn sends(&self) -> Vec<SendCall> {
        self.state().sends.clone()
    }
}

#[async_trait]
impl ProducerTransport for RecordingProducer {
    async fn connect(&self) -> TransportResult<()> {
        let mut state = self.state();
        state.connects += 1;
        match state.connect_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.state().disconnects += 1;
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        records: Vec<OutboundRecord>,
        options: &SendOptions,
    ) -> TransportResult<Vec<RecordMetadata>> {
        let mut state = self.state();
        state.sends.push(SendCall {
            topic: topic.to_string(),
            records: records.clone(),
            options: *options,
        });
        if let Some(e) = state.send_error.clone() {
            return Err(e);
        }

        let mut metadata = Vec::with_capacity(records.len());
        for _ in &records {
            metadata.push(RecordMetadata {
                topic: topic.to_string(),
                partition: 0,
                offset: state.next_offset,
            });
            state.next_offset += 1;
        }
        Ok(metadata)
    }
}

#[derive(Default)]
struct ConsumerState {
    connected: bool,
    delivering: bool,
    paused: bool,
    queue: VecDeque<TransportMessage>,
    in_flight: HashMap<MessagePosition, TransportMessage>,
    subscribes: Vec<(Vec<String>, bool)>,
    commits: Vec<MessagePosition>,
    redeliveries: Vec<MessagePosition>,
    pauses: usize,
    resumes: usize,
    stops: usize,
    disconnects: usize,
}

/// Consumer transport fed by [`RecordingConsumer::push`]
#[derive(Default)]
pub struct RecordingConsumer {
    state: Mutex<ConsumerState>,
    notify: Notify,
}

impl RecordingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ConsumerState> {
        self.state.lock().unwrap()
    }

    /// Queue a message for delivery
    pub fn push(&self, message: TransportMessage) {
        self.state().queue.push_back(message);
        self.notify.notify_waiters();
    }

    pub fn subscribes(&self) -> Vec<(Vec<String>, bool)> {
        self.state().subscribes.clone()
    }

    pub fn commits(&self) -> Vec<MessagePosition> {
        self.state().commits.clone()
    }

    pub fn redeliveries(&self) -> Vec<MessagePosition> {
        self.state().redeliveries.clone()
    }

    pub fn pauses(&self) -> usize {
        self.state().pauses
    }

    pub fn resumes(&self) -> usize {
        self.state().resumes
    }

    pub fn stops(&self) -> usize {
        self.state().stops
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    pub fn pending(&self) -> usize {
        self.state().queue.len()
    }
}

#[async_trait]
impl ConsumerTransport for RecordingConsumer {
    async fn connect(&self) -> TransportResult<()> {
        self.state().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        let mut state = self.state();
        state.connected = false;
        state.delivering = false;
        state.disconnects += 1;
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topics: &[String], from_beginning: bool) -> TransportResult<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.subscribes.push((topics.to_vec(), from_beginning));
        state.delivering = true;
        Ok(())
    }

    async fn poll(&self) -> TransportResult<Option<TransportMessage>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if !state.delivering {
                    return Ok(None);
                }
                if !state.paused {
                    if let Some(message) = state.queue.pop_front() {
                        state.in_flight.insert(message.position(), message.clone());
                        return Ok(Some(message));
                    }
                }
            }

            notified.await;
        }
    }

    async fn commit(&self, position: &MessagePosition) -> TransportResult<()> {
        let mut state = self.state();
        state.in_flight.remove(position);
        state.commits.push(position.clone());
        Ok(())
    }

    async fn redeliver(&self, position: &MessagePosition) -> TransportResult<()> {
        let mut state = self.state();
        state.redeliveries.push(position.clone());
        if let Some(message) = state.in_flight.remove(position) {
            state.queue.push_front(message);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pause(&self, _topics: &[String]) -> TransportResult<()> {
        let mut state = self.state();
        state.paused = true;
        state.pauses += 1;
        Ok(())
    }

    async fn resume(&self, _topics: &[String]) -> TransportResult<()> {
        let mut state = self.state();
        state.paused = false;
        state.resumes += 1;
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        let mut state = self.state();
        state.delivering = false;
        state.stops += 1;
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}

pub fn message(topic: &str, offset: i64, value: &[u8]) -> TransportMessage {
    TransportMessage {
        topic: topic.to_string(),
        partition: 0,
        offset,
        key: Some(format!("key-{offset}")),
        value: value.to_vec(),
        headers: HashMap::new(),
    }
}

/// Wait up to two seconds for `condition` to hold
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 2s");
}
