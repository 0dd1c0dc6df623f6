//! Client interfaces the harness needs from a messaging backend
//!
//! The harness only ever talks to a backend through these traits. Two
//! implementations exist: [`KafkaClients`](super::kafka::KafkaClients) over
//! rdkafka and [`InMemoryBroker`](super::memory::InMemoryBroker) for runs
//! without Docker.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ BackendClients                               │
//! │   probe()        readiness during startup    │
//! │   admin()     -> TopicAdmin                  │
//! │   producer()  -> RecordProducer              │
//! │   open_session() -> ConsumerSession          │
//! └──────────────────────────────────────────────┘
//! ```

use super::error::HarnessResult;
use super::types::{MessageRecord, ReceivedRecord, RecordMetadata, SessionSettings, TopicDescriptor};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Administrative interface
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Create one topic; `AlreadyExists` when it is already present
    async fn create_topic(&self, topic: &TopicDescriptor, timeout: Duration) -> HarnessResult<()>;

    /// Partition count of a topic visible in broker metadata, `None` if unknown
    async fn describe_topic(&self, name: &str, timeout: Duration) -> HarnessResult<Option<i32>>;
}

/// Produce interface with send-and-wait semantics
#[async_trait]
pub trait RecordProducer: Send + Sync {
    /// Resolve once the backend has acknowledged the record
    async fn send(&self, record: &MessageRecord, timeout: Duration) -> HarnessResult<RecordMetadata>;
}

/// Consume interface for one session
///
/// `close` must be idempotent. Implementations are free to release resources
/// on drop as well, but callers close explicitly.
#[async_trait]
pub trait ConsumerSession: Send {
    /// Subscribe to a single topic
    fn subscribe(&mut self, topic: &str) -> HarnessResult<()>;

    /// Wait at most `timeout` for the next record
    async fn poll(&mut self, timeout: Duration) -> HarnessResult<Option<ReceivedRecord>>;

    /// Release the session
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Factory for the clients of one running backend
#[async_trait]
pub trait BackendClients: Send + Sync {
    /// Network address (`host:port`) of the backend
    fn address(&self) -> &str;

    /// Succeed once the backend answers a metadata request within `timeout`
    async fn probe(&self, timeout: Duration) -> HarnessResult<()>;

    fn admin(&self) -> HarnessResult<Arc<dyn TopicAdmin>>;

    fn producer(&self) -> HarnessResult<Arc<dyn RecordProducer>>;

    fn open_session(&self, settings: &SessionSettings) -> HarnessResult<Box<dyn ConsumerSession>>;

    /// Release backend-side resources owned by the clients
    async fn shutdown(&self) {}
}
