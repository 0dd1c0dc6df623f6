//! rdkafka-backed clients
//!
//! Every client shares one base [`ClientConfig`]: bootstrap servers, broker
//! address family and any extra properties from the harness configuration.
//! Topic auto-creation is disabled everywhere so that a missing topic
//! surfaces as `TopicNotFound` instead of being created behind our back.

use super::backend::{BackendClients, ConsumerSession, RecordProducer, TopicAdmin};
use super::config::HarnessConfig;
use super::error::{HarnessError, HarnessResult};
use super::types::{
    MessageRecord, ReceivedRecord, RecordMetadata, SessionSettings, TopicDescriptor,
};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, DefaultConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{BaseProducer, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;

/// Builds the librdkafka configuration shared by all harness clients
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new(bootstrap_servers: &str) -> Self {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", bootstrap_servers);
        config.set("allow.auto.create.topics", "false");
        Self { config }
    }

    /// Apply `broker.address.family` unless it is librdkafka's default
    pub fn broker_address_family(mut self, family: &str) -> Self {
        if family != "any" {
            self.config.set("broker.address.family", family);
        }
        self
    }

    /// Apply additional properties; later values win
    pub fn properties<'a, I>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in properties {
            self.config.set(key, value);
        }
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// How long librdkafka waits for an unknown topic to appear before failing
/// queued records; kept well inside the publish timeout
fn unknown_topic_grace(publish_timeout: Duration) -> Duration {
    (publish_timeout / 2).max(Duration::from_millis(1))
}

/// Client factory for a Kafka broker reachable at `bootstrap_servers`
pub struct KafkaClients {
    bootstrap_servers: String,
    base: ClientConfig,
    publish_timeout: Duration,
    producer: OnceCell<Arc<KafkaProducer>>,
}

impl KafkaClients {
    pub fn new(bootstrap_servers: &str, config: &HarnessConfig) -> Self {
        let base = ClientConfigBuilder::new(bootstrap_servers)
            .broker_address_family(&config.broker_address_family)
            .properties(&config.client_properties)
            .build();

        Self {
            bootstrap_servers: bootstrap_servers.to_string(),
            base,
            publish_timeout: config.publish_timeout(),
            producer: OnceCell::new(),
        }
    }

    fn unreachable(&self, message: &str, err: &KafkaError) -> HarnessError {
        HarnessError::Unreachable {
            message: message.to_string(),
            address: self.bootstrap_servers.clone(),
            source: Some(err.to_string()),
        }
    }
}

#[async_trait]
impl BackendClients for KafkaClients {
    fn address(&self) -> &str {
        &self.bootstrap_servers
    }

    async fn probe(&self, timeout: Duration) -> HarnessResult<()> {
        let config = self.base.clone();
        let address = self.bootstrap_servers.clone();

        let probe = tokio::task::spawn_blocking(move || -> Result<usize, KafkaError> {
            let producer: BaseProducer = config.create()?;
            let metadata = producer.client().fetch_metadata(None, timeout)?;
            Ok(metadata.brokers().len())
        })
        .await
        .map_err(|e| HarnessError::InfraError {
            message: "Readiness probe task failed".to_string(),
            source: Some(e.to_string()),
        })?;

        match probe {
            Ok(brokers) => {
                log::debug!("Probe of {} answered by {} broker(s)", address, brokers);
                Ok(())
            }
            Err(e) => Err(self.unreachable("metadata probe failed", &e)),
        }
    }

    fn admin(&self) -> HarnessResult<Arc<dyn TopicAdmin>> {
        let admin: AdminClient<DefaultClientContext> = self
            .base
            .create()
            .map_err(|e| self.unreachable("Failed to create admin client", &e))?;

        Ok(Arc::new(KafkaAdmin {
            admin: Arc::new(admin),
            address: self.bootstrap_servers.clone(),
        }))
    }

    fn producer(&self) -> HarnessResult<Arc<dyn RecordProducer>> {
        let producer = self.producer.get_or_try_init(|| -> HarnessResult<_> {
            let producer: FutureProducer = self
                .base
                .clone()
                .set("acks", "all")
                .set(
                    "message.timeout.ms",
                    self.publish_timeout.as_millis().to_string(),
                )
                .set(
                    "topic.metadata.propagation.max.ms",
                    unknown_topic_grace(self.publish_timeout).as_millis().to_string(),
                )
                .create()
                .map_err(|e| self.unreachable("Failed to create producer", &e))?;
            log::debug!("Created producer for {}", self.bootstrap_servers);
            Ok(Arc::new(KafkaProducer {
                producer,
                address: self.bootstrap_servers.clone(),
            }))
        })?;

        Ok(Arc::clone(producer) as Arc<dyn RecordProducer>)
    }

    fn open_session(&self, settings: &SessionSettings) -> HarnessResult<Box<dyn ConsumerSession>> {
        let consumer: StreamConsumer<DefaultConsumerContext> = self
            .base
            .clone()
            .set("group.id", &settings.group_id)
            .set(
                "auto.offset.reset",
                settings.offset_reset.as_librdkafka_value(),
            )
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "10000")
            .set("fetch.wait.max.ms", "100")
            .create()
            .map_err(|e| self.unreachable("Failed to create consumer", &e))?;

        log::debug!("Opened consumer session with group {}", settings.group_id);
        Ok(Box::new(KafkaSession {
            consumer: Some(consumer),
            address: self.bootstrap_servers.clone(),
            group_id: settings.group_id.clone(),
            topic: None,
        }))
    }
}

/// Topic administration through the Kafka admin API
pub struct KafkaAdmin {
    admin: Arc<AdminClient<DefaultClientContext>>,
    address: String,
}

#[async_trait]
impl TopicAdmin for KafkaAdmin {
    async fn create_topic(&self, topic: &TopicDescriptor, timeout: Duration) -> HarnessResult<()> {
        let new_topic = NewTopic::new(
            &topic.name,
            topic.partitions,
            TopicReplication::Fixed(topic.replication_factor),
        );
        let options = AdminOptions::new()
            .operation_timeout(Some(timeout))
            .request_timeout(Some(timeout));

        let results = self
            .admin
            .create_topics(&[new_topic], &options)
            .await
            .map_err(|e| HarnessError::Unreachable {
                message: format!("Failed to create topic '{}'", topic.name),
                address: self.address.clone(),
                source: Some(e.to_string()),
            })?;

        for result in results {
            if let Err((name, code)) = result {
                return Err(match code {
                    RDKafkaErrorCode::TopicAlreadyExists => HarnessError::AlreadyExists { topic: name },
                    RDKafkaErrorCode::InvalidReplicationFactor
                    | RDKafkaErrorCode::InvalidPartitions
                    | RDKafkaErrorCode::InvalidTopic => HarnessError::InvalidTopic {
                        topic: name,
                        reason: code.to_string(),
                    },
                    RDKafkaErrorCode::RequestTimedOut | RDKafkaErrorCode::OperationTimedOut => {
                        HarnessError::unreachable(
                            &self.address,
                            format!("creation of '{}' timed out: {}", name, code),
                        )
                    }
                    other => HarnessError::InfraError {
                        message: format!("Failed to create topic '{}'", name),
                        source: Some(other.to_string()),
                    },
                });
            }
        }
        Ok(())
    }

    async fn describe_topic(&self, name: &str, timeout: Duration) -> HarnessResult<Option<i32>> {
        let admin = Arc::clone(&self.admin);
        let topic = name.to_string();

        let metadata = tokio::task::spawn_blocking(move || {
            admin.inner().fetch_metadata(Some(&topic), timeout)
        })
        .await
        .map_err(|e| HarnessError::InfraError {
            message: "Metadata task failed".to_string(),
            source: Some(e.to_string()),
        })?
        .map_err(|e| HarnessError::Unreachable {
            message: format!("Failed to fetch metadata for '{}'", name),
            address: self.address.clone(),
            source: Some(e.to_string()),
        })?;

        let partitions = metadata
            .topics()
            .iter()
            .find(|t| t.name() == name)
            .filter(|t| t.error().is_none())
            .map(|t| t.partitions().len() as i32)
            .filter(|count| *count > 0);
        Ok(partitions)
    }
}

/// Send-and-wait producer
pub struct KafkaProducer {
    producer: FutureProducer,
    address: String,
}

#[async_trait]
impl RecordProducer for KafkaProducer {
    async fn send(&self, record: &MessageRecord, timeout: Duration) -> HarnessResult<RecordMetadata> {
        let started = tokio::time::Instant::now();
        self.ensure_topic_exists(&record.topic, timeout).await?;
        let timeout = timeout.saturating_sub(started.elapsed());

        let mut future_record =
            FutureRecord::<Vec<u8>, Vec<u8>>::to(&record.topic).payload(&record.payload);
        if let Some(ref key) = record.key {
            future_record = future_record.key(key);
        }

        let delivery = tokio::time::timeout(
            timeout,
            self.producer.send(future_record, Timeout::After(timeout)),
        )
        .await
        .map_err(|_| HarnessError::PublishTimeout {
            topic: record.topic.clone(),
            timeout_ms: timeout.as_millis() as u64,
        })?;

        match delivery {
            Ok((partition, offset)) => Ok(RecordMetadata {
                topic: record.topic.clone(),
                partition,
                offset,
                timestamp_ms: None,
            }),
            Err((err, _message)) => Err(self.map_produce_error(&record.topic, timeout, err)),
        }
    }
}

impl KafkaProducer {
    /// Fail fast with `TopicNotFound` instead of letting librdkafka hold the
    /// record until it expires
    async fn ensure_topic_exists(&self, topic: &str, timeout: Duration) -> HarnessResult<()> {
        let producer = self.producer.clone();
        let name = topic.to_string();

        let lookup = tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(Some(&name), timeout)
        });
        let metadata = match tokio::time::timeout(timeout, lookup).await {
            Err(_) => {
                return Err(HarnessError::PublishTimeout {
                    topic: topic.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(joined) => joined
                .map_err(|e| HarnessError::InfraError {
                    message: "Metadata task failed".to_string(),
                    source: Some(e.to_string()),
                })?
                .map_err(|e| HarnessError::Unreachable {
                    message: format!("Failed to fetch metadata for '{}'", topic),
                    address: self.address.clone(),
                    source: Some(e.to_string()),
                })?,
        };

        let known = metadata
            .topics()
            .iter()
            .any(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty());
        if known {
            Ok(())
        } else {
            Err(HarnessError::TopicNotFound {
                topic: topic.to_string(),
            })
        }
    }

    fn map_produce_error(&self, topic: &str, timeout: Duration, err: KafkaError) -> HarnessError {
        match err.rdkafka_error_code() {
            Some(RDKafkaErrorCode::MessageTimedOut) => HarnessError::PublishTimeout {
                topic: topic.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            },
            Some(RDKafkaErrorCode::UnknownTopicOrPartition)
            | Some(RDKafkaErrorCode::UnknownTopic) => HarnessError::TopicNotFound {
                topic: topic.to_string(),
            },
            Some(RDKafkaErrorCode::AllBrokersDown)
            | Some(RDKafkaErrorCode::BrokerTransportFailure) => HarnessError::Unreachable {
                message: format!("Publish to '{}' failed", topic),
                address: self.address.clone(),
                source: Some(err.to_string()),
            },
            _ => HarnessError::PublishFailed {
                topic: topic.to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Consumer session over a [`StreamConsumer`]
pub struct KafkaSession {
    consumer: Option<StreamConsumer<DefaultConsumerContext>>,
    address: String,
    group_id: String,
    topic: Option<String>,
}

impl KafkaSession {
    fn consumer(&self) -> HarnessResult<&StreamConsumer<DefaultConsumerContext>> {
        self.consumer.as_ref().ok_or_else(|| HarnessError::InfraError {
            message: format!("Session for group {} is closed", self.group_id),
            source: None,
        })
    }
}

fn to_received(message: &BorrowedMessage<'_>) -> ReceivedRecord {
    ReceivedRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp_ms: message.timestamp().to_millis(),
    }
}

#[async_trait]
impl ConsumerSession for KafkaSession {
    fn subscribe(&mut self, topic: &str) -> HarnessResult<()> {
        self.consumer()?
            .subscribe(&[topic])
            .map_err(|e| HarnessError::Unreachable {
                message: format!("Failed to subscribe to topic '{}'", topic),
                address: self.address.clone(),
                source: Some(e.to_string()),
            })?;
        self.topic = Some(topic.to_string());
        log::debug!("Subscribed to {} with group {}", topic, self.group_id);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> HarnessResult<Option<ReceivedRecord>> {
        let topic = self.topic.clone().unwrap_or_default();
        let consumer = self.consumer()?;

        match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(to_received(&message))),
            Ok(Err(e)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::UnknownTopicOrPartition)
                | Some(RDKafkaErrorCode::UnknownTopic) => {
                    Err(HarnessError::TopicNotFound { topic })
                }
                Some(RDKafkaErrorCode::AllBrokersDown) => Err(HarnessError::Unreachable {
                    message: format!("Consumer for '{}' lost all brokers", topic),
                    address: self.address.clone(),
                    source: Some(e.to_string()),
                }),
                _ => {
                    // librdkafka recovers from the rest on its own
                    log::warn!("Consumer error on '{}': {}", topic, e);
                    Ok(None)
                }
            },
        }
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            log::debug!("Closed consumer session with group {}", self.group_id);
        }
    }

    fn is_closed(&self) -> bool {
        self.consumer.is_none()
    }
}

impl Drop for KafkaSession {
    fn drop(&mut self) {
        self.close();
    }
}
