//! In-process broker
//!
//! Implements every client interface without Docker or network access, for
//! unit tests and quick local runs. Topics are partitioned append-only logs
//! kept in memory and lost when the broker is dropped.
//!
//! Timing knobs let tests reproduce the behaviours the harness guards
//! against: a backend that is slow to accept connections, topic metadata
//! that propagates late, records that become visible after a delay and
//! acknowledgements that never arrive in time.

use super::backend::{BackendClients, ConsumerSession, RecordProducer, TopicAdmin};
use super::config::OffsetReset;
use super::error::{HarnessError, HarnessResult};
use super::types::{
    MessageRecord, ReceivedRecord, RecordMetadata, SessionSettings, TopicDescriptor,
};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Address reported by the in-memory broker
pub const MEMORY_ADDRESS: &str = "memory:0";

/// Timing and topology of an in-memory broker
#[derive(Debug, Clone)]
pub struct InMemoryOptions {
    /// Number of simulated broker nodes (upper bound for replication factor)
    pub nodes: u16,
    /// Time before the broker answers readiness probes
    pub startup_delay: Duration,
    /// Time before a created topic shows up in metadata
    pub propagation_delay: Duration,
    /// Time before a produced record becomes visible to consumers
    pub visibility_delay: Duration,
    /// Time before a produced record is acknowledged
    pub ack_delay: Duration,
}

impl Default for InMemoryOptions {
    fn default() -> Self {
        Self {
            nodes: 1,
            startup_delay: Duration::ZERO,
            propagation_delay: Duration::ZERO,
            visibility_delay: Duration::ZERO,
            ack_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    timestamp_ms: i64,
    visible_at: Instant,
}

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
    metadata_visible_at: Instant,
}

struct BrokerState {
    options: InMemoryOptions,
    ready_at: Instant,
    running: AtomicBool,
    topics: Mutex<HashMap<String, TopicLog>>,
    arrivals: Notify,
    round_robin: AtomicU64,
    open_sessions: AtomicUsize,
    sessions_opened: AtomicUsize,
}

impl BrokerState {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicLog>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_running(&self) -> HarnessResult<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HarnessError::unreachable(MEMORY_ADDRESS, "in-memory broker is stopped"))
        }
    }
}

/// In-process broker implementing [`BackendClients`]
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Create a broker that is ready immediately
    pub fn new() -> Self {
        Self::with_options(InMemoryOptions::default())
    }

    /// Create a broker with explicit timing and topology
    pub fn with_options(options: InMemoryOptions) -> Self {
        let ready_at = Instant::now() + options.startup_delay;
        Self {
            state: Arc::new(BrokerState {
                options,
                ready_at,
                running: AtomicBool::new(true),
                topics: Mutex::new(HashMap::new()),
                arrivals: Notify::new(),
                round_robin: AtomicU64::new(0),
                open_sessions: AtomicUsize::new(0),
                sessions_opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    /// Sessions opened over the broker's lifetime
    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Number of records stored in a topic across all partitions
    pub fn record_count(&self, topic: &str) -> usize {
        self.state
            .topics()
            .get(topic)
            .map(|log| log.partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Stop answering requests and wake every waiting session
    pub fn stop(&self) {
        if self.state.running.swap(false, Ordering::SeqCst) {
            log::debug!("In-memory broker stopped");
        }
        self.state.arrivals.notify_waiters();
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendClients for InMemoryBroker {
    fn address(&self) -> &str {
        MEMORY_ADDRESS
    }

    async fn probe(&self, _timeout: Duration) -> HarnessResult<()> {
        self.state.ensure_running()?;
        if Instant::now() < self.state.ready_at {
            return Err(HarnessError::unreachable(
                MEMORY_ADDRESS,
                "broker not accepting connections yet",
            ));
        }
        Ok(())
    }

    fn admin(&self) -> HarnessResult<Arc<dyn TopicAdmin>> {
        self.state.ensure_running()?;
        Ok(Arc::new(self.clone()))
    }

    fn producer(&self) -> HarnessResult<Arc<dyn RecordProducer>> {
        self.state.ensure_running()?;
        Ok(Arc::new(self.clone()))
    }

    fn open_session(&self, settings: &SessionSettings) -> HarnessResult<Box<dyn ConsumerSession>> {
        self.state.ensure_running()?;
        self.state.open_sessions.fetch_add(1, Ordering::SeqCst);
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        log::debug!("Opened in-memory session for group {}", settings.group_id);
        Ok(Box::new(InMemorySession {
            state: Arc::clone(&self.state),
            settings: settings.clone(),
            topic: None,
            positions: Vec::new(),
            next_partition: 0,
            closed: false,
        }))
    }

    async fn shutdown(&self) {
        self.stop();
    }
}

#[async_trait]
impl TopicAdmin for InMemoryBroker {
    async fn create_topic(&self, topic: &TopicDescriptor, _timeout: Duration) -> HarnessResult<()> {
        self.state.ensure_running()?;
        topic.validate()?;

        if topic.replication_factor > i32::from(self.state.options.nodes) {
            return Err(HarnessError::InvalidTopic {
                topic: topic.name.clone(),
                reason: format!(
                    "replication factor {} exceeds broker count {}",
                    topic.replication_factor, self.state.options.nodes
                ),
            });
        }

        let mut topics = self.state.topics();
        if topics.contains_key(&topic.name) {
            return Err(HarnessError::AlreadyExists {
                topic: topic.name.clone(),
            });
        }
        topics.insert(
            topic.name.clone(),
            TopicLog {
                partitions: vec![Vec::new(); topic.partitions as usize],
                metadata_visible_at: Instant::now() + self.state.options.propagation_delay,
            },
        );
        Ok(())
    }

    async fn describe_topic(&self, name: &str, _timeout: Duration) -> HarnessResult<Option<i32>> {
        self.state.ensure_running()?;
        let now = Instant::now();
        Ok(self
            .state
            .topics()
            .get(name)
            .filter(|log| log.metadata_visible_at <= now)
            .map(|log| log.partitions.len() as i32))
    }
}

#[async_trait]
impl RecordProducer for InMemoryBroker {
    async fn send(&self, record: &MessageRecord, timeout: Duration) -> HarnessResult<RecordMetadata> {
        self.state.ensure_running()?;
        if !self.state.topics().contains_key(&record.topic) {
            return Err(HarnessError::TopicNotFound {
                topic: record.topic.clone(),
            });
        }

        let ack_delay = self.state.options.ack_delay;
        if !ack_delay.is_zero() {
            if ack_delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(HarnessError::PublishTimeout {
                    topic: record.topic.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(ack_delay).await;
        }

        // The broker may have been stopped while the ack was pending
        self.state.ensure_running()?;

        let now = Instant::now();
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let metadata = {
            let mut topics = self.state.topics();
            let log = topics
                .get_mut(&record.topic)
                .ok_or_else(|| HarnessError::TopicNotFound {
                    topic: record.topic.clone(),
                })?;

            let partition_count = log.partitions.len() as u64;
            let partition = (match &record.key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    hasher.finish() % partition_count
                }
                None => self.state.round_robin.fetch_add(1, Ordering::SeqCst) % partition_count,
            }) as usize;

            let entries = &mut log.partitions[partition];
            entries.push(StoredRecord {
                key: record.key.clone(),
                payload: record.payload.clone(),
                timestamp_ms,
                visible_at: now + self.state.options.visibility_delay,
            });

            RecordMetadata {
                topic: record.topic.clone(),
                partition: partition as i32,
                offset: (entries.len() - 1) as i64,
                timestamp_ms: Some(timestamp_ms),
            }
        };

        self.state.arrivals.notify_waiters();
        Ok(metadata)
    }
}

/// Consumer session against the in-memory broker
///
/// Not closed on drop, so [`InMemoryBroker::open_sessions`] exposes leaks.
struct InMemorySession {
    state: Arc<BrokerState>,
    settings: SessionSettings,
    topic: Option<String>,
    positions: Vec<usize>,
    next_partition: usize,
    closed: bool,
}

enum NextRecord {
    Ready(ReceivedRecord),
    /// Nothing visible yet; the earliest pending record becomes visible then
    Pending(Option<Instant>),
}

impl InMemorySession {
    fn next_record(&mut self, topic: &str) -> HarnessResult<NextRecord> {
        let now = Instant::now();
        let topics = self.state.topics();
        let log = topics.get(topic).ok_or_else(|| HarnessError::TopicNotFound {
            topic: topic.to_string(),
        })?;

        let count = self.positions.len();
        let mut earliest_pending: Option<Instant> = None;
        for step in 0..count {
            let partition = (self.next_partition + step) % count;
            let position = self.positions[partition];
            if let Some(stored) = log.partitions[partition].get(position) {
                if stored.visible_at <= now {
                    self.positions[partition] += 1;
                    self.next_partition = (partition + 1) % count;
                    return Ok(NextRecord::Ready(ReceivedRecord {
                        topic: topic.to_string(),
                        partition: partition as i32,
                        offset: position as i64,
                        key: stored.key.clone(),
                        payload: stored.payload.clone(),
                        timestamp_ms: Some(stored.timestamp_ms),
                    }));
                }
                earliest_pending = Some(match earliest_pending {
                    Some(t) => t.min(stored.visible_at),
                    None => stored.visible_at,
                });
            }
        }
        Ok(NextRecord::Pending(earliest_pending))
    }
}

#[async_trait]
impl ConsumerSession for InMemorySession {
    fn subscribe(&mut self, topic: &str) -> HarnessResult<()> {
        self.state.ensure_running()?;
        let topics = self.state.topics();
        let log = topics.get(topic).ok_or_else(|| HarnessError::TopicNotFound {
            topic: topic.to_string(),
        })?;

        self.positions = match self.settings.offset_reset {
            OffsetReset::Earliest => vec![0; log.partitions.len()],
            OffsetReset::Latest => log.partitions.iter().map(Vec::len).collect(),
        };
        self.next_partition = 0;
        self.topic = Some(topic.to_string());
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> HarnessResult<Option<ReceivedRecord>> {
        let topic = self.topic.clone().ok_or_else(|| HarnessError::InfraError {
            message: "poll called before subscribe".to_string(),
            source: None,
        })?;
        let deadline = Instant::now() + timeout;
        let state = Arc::clone(&self.state);

        loop {
            state.ensure_running()?;

            // Register interest before inspecting the log so an append in between is not missed
            let arrival = state.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let wake_at = match self.next_record(&topic)? {
                NextRecord::Ready(record) => return Ok(Some(record)),
                NextRecord::Pending(Some(visible_at)) => visible_at.min(deadline),
                NextRecord::Pending(None) => deadline,
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.topic = None;
            self.state.open_sessions.fetch_sub(1, Ordering::SeqCst);
            log::debug!("Closed in-memory session for group {}", self.settings.group_id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(offset_reset: OffsetReset) -> SessionSettings {
        SessionSettings {
            group_id: "test-group".to_string(),
            offset_reset,
        }
    }

    async fn broker_with_topic(partitions: i32) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        let topic = TopicDescriptor::new("orders", partitions, 1).unwrap();
        broker
            .create_topic(&topic, Duration::from_secs(1))
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn test_duplicate_topic_rejected() {
        let broker = broker_with_topic(1).await;
        let topic = TopicDescriptor::new("orders", 1, 1).unwrap();
        let err = broker
            .create_topic(&topic, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_replication_bounded_by_nodes() {
        let broker = InMemoryBroker::new();
        let topic = TopicDescriptor::new("orders", 1, 3).unwrap();
        let err = broker
            .create_topic(&topic, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidTopic { .. }));
    }

    #[tokio::test]
    async fn test_send_to_missing_topic() {
        let broker = InMemoryBroker::new();
        let err = broker
            .send(&MessageRecord::new("nope", "x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::TopicNotFound { .. }));
    }

    #[tokio::test]
    async fn test_offsets_increase_per_partition() {
        let broker = broker_with_topic(1).await;
        let first = broker
            .send(&MessageRecord::new("orders", "a"), Duration::from_secs(1))
            .await
            .unwrap();
        let second = broker
            .send(&MessageRecord::new("orders", "b"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 1);
        assert_eq!(broker.record_count("orders"), 2);
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let broker = broker_with_topic(4).await;
        let mut partitions = Vec::new();
        for i in 0..5 {
            let record = MessageRecord::new("orders", format!("v{}", i)).with_key("customer-1");
            let meta = broker.send(&record, Duration::from_secs(1)).await.unwrap();
            partitions.push(meta.partition);
        }
        assert!(partitions.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_latest_skips_existing_records() {
        let broker = broker_with_topic(1).await;
        broker
            .send(&MessageRecord::new("orders", "old"), Duration::from_secs(1))
            .await
            .unwrap();

        let mut session = broker.open_session(&settings(OffsetReset::Latest)).unwrap();
        session.subscribe("orders").unwrap();
        assert!(session
            .poll(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        broker
            .send(&MessageRecord::new("orders", "new"), Duration::from_secs(1))
            .await
            .unwrap();
        let record = session.poll(Duration::from_millis(20)).await.unwrap().unwrap();
        assert_eq!(record.payload, b"new".to_vec());
        session.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_tracked() {
        let broker = broker_with_topic(1).await;
        let mut session = broker.open_session(&settings(OffsetReset::Earliest)).unwrap();
        assert_eq!(broker.open_sessions(), 1);
        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(broker.open_sessions(), 0);
        assert_eq!(broker.sessions_opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_waits_for_visibility() {
        let broker = InMemoryBroker::with_options(InMemoryOptions {
            visibility_delay: Duration::from_millis(300),
            ..InMemoryOptions::default()
        });
        let topic = TopicDescriptor::new("orders", 1, 1).unwrap();
        broker.create_topic(&topic, Duration::from_secs(1)).await.unwrap();
        broker
            .send(&MessageRecord::new("orders", "late"), Duration::from_secs(1))
            .await
            .unwrap();

        let mut session = broker.open_session(&settings(OffsetReset::Earliest)).unwrap();
        session.subscribe("orders").unwrap();
        assert!(session
            .poll(Duration::from_millis(100))
            .await
            .unwrap()
            .is_none());
        let record = session.poll(Duration::from_millis(500)).await.unwrap();
        assert!(record.is_some());
        session.close();
    }

    #[tokio::test]
    async fn test_stopped_broker_is_unreachable() {
        let broker = broker_with_topic(1).await;
        broker.stop();
        let err = broker.probe(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, HarnessError::Unreachable { .. }));
        assert!(broker.admin().is_err());
    }
}
