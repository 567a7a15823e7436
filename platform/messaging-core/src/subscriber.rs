//! Subscriber: message loop, commit-on-success, and backpressure

use crate::error::{MessagingError, MessagingResult};
use crate::retry::RetryConfig;
use crate::topics::resolve_topic;
use crate::{ConsumerTransport, HandlerError, TransportMessage};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Subscriber lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Connecting,
    Connected,
    Running,
    Paused,
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubscriberState::Disconnected => "disconnected",
            SubscriberState::Connecting => "connecting",
            SubscriberState::Connected => "connected",
            SubscriberState::Running => "running",
            SubscriberState::Paused => "paused",
        })
    }
}

/// Application logic invoked once per delivered message.
///
/// Returning `Err` withholds the commit and the message is delivered again,
/// so implementations must tolerate seeing the same message more than once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &TransportMessage) -> Result<(), HandlerError>;
}

/// [`MessageHandler`] backed by an async closure; see [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(TransportMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(TransportMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &TransportMessage) -> Result<(), HandlerError> {
        (self.f)(message.clone()).await
    }
}

/// Topics and delivery settings of a subscriber
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Registry keys, registered names, or raw physical names
    pub topics: Vec<String>,
    /// Where to start when the group has never committed
    pub from_beginning: bool,
    /// Pause between redeliveries of a failing message
    pub redelivery: RetryConfig,
}

impl SubscriberConfig {
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            from_beginning: false,
            redelivery: RetryConfig::default(),
        }
    }

    pub fn from_beginning(mut self, from_beginning: bool) -> Self {
        self.from_beginning = from_beginning;
        self
    }

    pub fn with_redelivery(mut self, redelivery: RetryConfig) -> Self {
        self.redelivery = redelivery;
        self
    }
}

/// Counters updated by the message loop
#[derive(Debug, Default)]
pub struct ConsumerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    committed: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Handler returned `Ok`
    pub processed: u64,
    /// Handler returned `Err`
    pub failed: u64,
    /// Commits accepted by the transport
    pub committed: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
        }
    }
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Drives the message loop over an exclusively owned consumer transport
///
/// ```text
/// disconnected -> connecting -> connected -> running <-> paused
///                                   ^            |
///                                   +--- stop ---+
/// ```
pub struct Subscriber {
    transport: Arc<dyn ConsumerTransport>,
    topics: Vec<String>,
    from_beginning: bool,
    redelivery: RetryConfig,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    // Shared with the loop, which falls back to `Connected` when delivery ends
    state: Arc<watch::Sender<SubscriberState>>,
    // Serialises every state transition
    transition: Mutex<()>,
    running: Mutex<Option<RunningLoop>>,
    stats: Arc<ConsumerStats>,
}

impl Subscriber {
    /// Resolves every configured topic through the registry up front.
    pub fn new(
        transport: Arc<dyn ConsumerTransport>,
        config: SubscriberConfig,
    ) -> MessagingResult<Self> {
        if config.topics.is_empty() {
            return Err(MessagingError::NoTopics);
        }
        let topics = config
            .topics
            .iter()
            .map(|topic| {
                resolve_topic(topic).ok_or_else(|| MessagingError::InvalidTopic(topic.clone()))
            })
            .collect::<MessagingResult<Vec<_>>>()?;

        let (state, _) = watch::channel(SubscriberState::Disconnected);
        Ok(Self {
            transport,
            topics,
            from_beginning: config.from_beginning,
            redelivery: config.redelivery,
            handler: RwLock::new(None),
            state: Arc::new(state),
            transition: Mutex::new(()),
            running: Mutex::new(None),
            stats: Arc::new(ConsumerStats::default()),
        })
    }

    /// Resolved physical topic names
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Register the handler, replacing any previous one.
    ///
    /// A running loop keeps the handler it was started with; the replacement
    /// is used from the next `start()`.
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn connect(&self) -> MessagingResult<()> {
        let _guard = self.transition.lock().await;
        if self.state() != SubscriberState::Disconnected {
            return Ok(());
        }

        self.state.send_replace(SubscriberState::Connecting);
        match self.transport.connect().await {
            Ok(()) => {
                self.state.send_replace(SubscriberState::Connected);
                info!(topics = ?self.topics, "Subscriber connected");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(SubscriberState::Disconnected);
                error!(error = %e, "Subscriber failed to connect");
                Err(MessagingError::Connection(e))
            }
        }
    }

    /// Subscribe to every topic and start the message loop.
    pub async fn start(&self) -> MessagingResult<()> {
        let _guard = self.transition.lock().await;
        let handler = self.handler().ok_or(MessagingError::HandlerNotSet)?;

        let state = self.state();
        if state != SubscriberState::Connected {
            return Err(MessagingError::InvalidState {
                operation: "start",
                state: state.to_string(),
            });
        }

        self.transport
            .subscribe(&self.topics, self.from_beginning)
            .await?;

        // Set before spawning so a loop that ends at once can move it back.
        self.state.send_replace(SubscriberState::Running);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            self.transport.clone(),
            handler,
            self.redelivery.clone(),
            self.stats.clone(),
            self.state.clone(),
            shutdown_rx,
        ));
        *self.running.lock().await = Some(RunningLoop { shutdown, task });
        info!(topics = ?self.topics, from_beginning = self.from_beginning, "Subscriber started");
        Ok(())
    }

    /// Stop new deliveries without dropping the subscription. No-op unless running.
    pub async fn pause(&self) -> MessagingResult<()> {
        let _guard = self.transition.lock().await;
        if self.state() != SubscriberState::Running {
            debug!(state = %self.state(), "Pause ignored");
            return Ok(());
        }

        self.transport.pause(&self.topics).await?;
        self.state.send_replace(SubscriberState::Paused);
        info!(topics = ?self.topics, "Subscriber paused");
        Ok(())
    }

    /// Undo [`pause`](Self::pause). No-op unless paused.
    pub async fn resume(&self) -> MessagingResult<()> {
        let _guard = self.transition.lock().await;
        if self.state() != SubscriberState::Paused {
            debug!(state = %self.state(), "Resume ignored");
            return Ok(());
        }

        self.transport.resume(&self.topics).await?;
        self.state.send_replace(SubscriberState::Running);
        info!(topics = ?self.topics, "Subscriber resumed");
        Ok(())
    }

    /// Halt the loop, letting an in-flight handler finish. Stays connected.
    pub async fn stop(&self) -> MessagingResult<()> {
        let _guard = self.transition.lock().await;
        self.halt().await
    }

    /// Stop if needed, then disconnect. No-op when already disconnected.
    pub async fn disconnect(&self) -> MessagingResult<()> {
        let _guard = self.transition.lock().await;
        if self.state() == SubscriberState::Disconnected {
            return Ok(());
        }

        let halted = self.halt().await;
        let result = self.transport.disconnect().await;
        self.state.send_replace(SubscriberState::Disconnected);
        info!("Subscriber disconnected");
        halted?;
        result.map_err(MessagingError::Connection)
    }

    // Caller holds `transition`.
    async fn halt(&self) -> MessagingResult<()> {
        if !matches!(
            self.state(),
            SubscriberState::Running | SubscriberState::Paused
        ) {
            return Ok(());
        }

        if let Some(running) = self.running.lock().await.take() {
            running.shutdown.send_replace(true);
            if let Err(e) = running.task.await {
                error!(error = %e, "Message loop ended abnormally");
            }
        }

        let stopped = self.transport.stop().await;
        self.state.send_replace(SubscriberState::Connected);
        info!(stats = ?self.stats.snapshot(), "Subscriber stopped");
        stopped.map_err(MessagingError::from)
    }
}

// Signals shutdown and detaches the loop: an in-flight handler still runs to
// completion and commits, then the task exits on its own.
impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.send_replace(true);
        }
    }
}

/// Invoke the handler and commit only when it succeeded.
///
/// On failure nothing is committed, the transport is asked to deliver the
/// same position again, and the failure is returned.
pub(crate) async fn process_message(
    transport: &dyn ConsumerTransport,
    handler: &dyn MessageHandler,
    message: &TransportMessage,
    stats: &ConsumerStats,
) -> MessagingResult<()> {
    let position = message.position();

    match handler.handle(message).await {
        Ok(()) => {
            stats.processed.fetch_add(1, Ordering::Relaxed);
            if let Err(source) = transport.commit(&position).await {
                return Err(MessagingError::CommitFailure {
                    topic: position.topic,
                    partition: position.partition,
                    offset: position.offset,
                    source,
                });
            }
            stats.committed.fetch_add(1, Ordering::Relaxed);
            debug!(position = %position, "Message committed");
            Ok(())
        }
        Err(source) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            transport.redeliver(&position).await?;
            Err(MessagingError::HandlerFailure {
                topic: position.topic,
                partition: position.partition,
                offset: position.offset,
                source,
            })
        }
    }
}

async fn run_loop(
    transport: Arc<dyn ConsumerTransport>,
    handler: Arc<dyn MessageHandler>,
    redelivery: RetryConfig,
    stats: Arc<ConsumerStats>,
    state: Arc<watch::Sender<SubscriberState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;

    loop {
        // Shutdown interrupts waiting for a message, never a running handler.
        let polled = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            polled = transport.poll() => polled,
        };

        let message = match polled {
            Ok(Some(message)) => message,
            Ok(None) => {
                let ended = state.send_if_modified(|current| {
                    if matches!(*current, SubscriberState::Running | SubscriberState::Paused) {
                        *current = SubscriberState::Connected;
                        true
                    } else {
                        false
                    }
                });
                if ended {
                    warn!(stats = ?stats.snapshot(), "Transport ended delivery, message loop stopped");
                }
                break;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!(error = %e, "Poll failed");
                if backoff_or_shutdown(&redelivery, failures, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        match process_message(transport.as_ref(), handler.as_ref(), &message, &stats).await {
            Ok(()) => failures = 0,
            Err(e @ MessagingError::CommitFailure { .. }) => {
                failures = failures.saturating_add(1);
                error!(
                    error = %e,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Handled message could not be committed"
                );
                if backoff_or_shutdown(&redelivery, failures, &mut shutdown).await {
                    break;
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                error!(
                    error = %e,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Message not committed, will be redelivered"
                );
                if backoff_or_shutdown(&redelivery, failures, &mut shutdown).await {
                    break;
                }
            }
        }
    }
}

/// Sleep for the backoff; `true` when shutdown was requested meanwhile.
async fn backoff_or_shutdown(
    redelivery: &RetryConfig,
    failures: u32,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let delay = redelivery.backoff_for(failures);
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryBroker, MessagePosition};
    use std::collections::HashMap;

    fn message(offset: i64) -> TransportMessage {
        TransportMessage {
            topic: "banking.security.events".to_string(),
            partition: 0,
            offset,
            key: Some("user-1".to_string()),
            value: b"{}".to_vec(),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_unknown_topic_rejected_at_construction() {
        let broker = InMemoryBroker::new();
        let result = Subscriber::new(
            Arc::new(broker.consumer("g")),
            SubscriberConfig::new(["SECURITY_EVENTS", "nope"]),
        );
        assert!(matches!(result, Err(MessagingError::InvalidTopic(t)) if t == "nope"));

        let empty = Subscriber::new(
            Arc::new(broker.consumer("g")),
            SubscriberConfig::new(Vec::<String>::new()),
        );
        assert!(matches!(empty, Err(MessagingError::NoTopics)));
    }

    #[test]
    fn test_topics_resolved_through_registry() {
        let broker = InMemoryBroker::new();
        let subscriber = Subscriber::new(
            Arc::new(broker.consumer("g")),
            SubscriberConfig::new(["SECURITY_EVENTS", "banking.loans.approved"]),
        )
        .unwrap();
        assert_eq!(
            subscriber.topics(),
            ["banking.security.events", "banking.loans.approved"]
        );
    }

    #[tokio::test]
    async fn test_process_message_commits_only_on_success() {
        let broker = InMemoryBroker::with_partitions(1);
        let consumer = broker.consumer("security-monitor");
        consumer.connect().await.unwrap();
        let stats = ConsumerStats::default();

        let ok = handler_fn(|_| async { Ok(()) });
        process_message(&consumer, ok.as_ref(), &message(4), &stats)
            .await
            .unwrap();
        assert_eq!(
            broker.committed_offset("security-monitor", "banking.security.events", 0),
            Some(5)
        );

        let failing = handler_fn(|_| async { Err::<(), HandlerError>("ledger locked".into()) });
        let err = process_message(&consumer, failing.as_ref(), &message(5), &stats)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MessagingError::HandlerFailure { offset: 5, .. }
        ));
        assert_eq!(
            broker.committed_offset("security-monitor", "banking.security.events", 0),
            Some(5)
        );
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                processed: 1,
                failed: 1,
                committed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_refused_commit_is_a_commit_failure() {
        let broker = InMemoryBroker::with_partitions(1);
        let consumer = broker.consumer("security-monitor");
        consumer.connect().await.unwrap();
        consumer.disconnect().await.unwrap();
        let stats = ConsumerStats::default();

        let ok = handler_fn(|_| async { Ok(()) });
        let err = process_message(&consumer, ok.as_ref(), &message(3), &stats)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MessagingError::CommitFailure {
                offset: 3,
                source: crate::TransportError::NotConnected,
                ..
            }
        ));
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                processed: 1,
                failed: 0,
                committed: 0
            }
        );
    }

    #[test]
    fn test_position_display() {
        let position = MessagePosition {
            topic: "banking.aml.alerts".to_string(),
            partition: 2,
            offset: 17,
        };
        assert_eq!(position.to_string(), "banking.aml.alerts[2]@17");
    }
}
