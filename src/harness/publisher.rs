//! Message publishing
//!
//! Sends one record and waits for the backend acknowledgement. Records are
//! produced with `acks=all` and are never retried: a failed send surfaces
//! as-is and nothing is assumed about whether the record landed.

use super::config::HarnessConfig;
use super::error::HarnessResult;
use super::provisioner::BackendHandle;
use super::types::{MessageRecord, RecordMetadata};
use std::time::Duration;

/// Publishes records to a running backend
pub struct MessagePublisher {
    timeout: Duration,
}

impl MessagePublisher {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            timeout: config.publish_timeout(),
        }
    }

    /// Publish one record and return its acknowledged position
    pub async fn publish(
        &self,
        handle: &BackendHandle,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> HarnessResult<RecordMetadata> {
        let mut record = MessageRecord::new(topic, payload);
        if let Some(key) = key {
            record = record.with_key(key);
        }
        self.send(handle, &record).await
    }

    /// Publish a prepared record
    pub async fn send(
        &self,
        handle: &BackendHandle,
        record: &MessageRecord,
    ) -> HarnessResult<RecordMetadata> {
        let producer = handle.clients()?.producer()?;
        let metadata = producer.send(record, self.timeout).await?;
        log::debug!(
            "Published {} byte(s) to {}[{}] at offset {}",
            record.payload.len(),
            metadata.topic,
            metadata.partition,
            metadata.offset
        );
        Ok(metadata)
    }

    /// Publish records one after another, each acknowledged before the next
    pub async fn publish_all(
        &self,
        handle: &BackendHandle,
        records: &[MessageRecord],
    ) -> HarnessResult<Vec<RecordMetadata>> {
        let mut acknowledged = Vec::with_capacity(records.len());
        for record in records {
            acknowledged.push(self.send(handle, record).await?);
        }
        Ok(acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::admin::TopicAdministrator;
    use crate::harness::error::HarnessError;
    use crate::harness::memory::{InMemoryBroker, InMemoryOptions};
    use crate::harness::provisioner::BackendProvisioner;
    use crate::harness::types::TopicDescriptor;

    async fn running(broker: InMemoryBroker, config: &HarnessConfig) -> (BackendProvisioner, BackendHandle) {
        let provisioner = BackendProvisioner::new(config.clone()).with_memory_broker(broker);
        let handle = provisioner.start().await.unwrap();
        TopicAdministrator::new(config)
            .create_topic(&handle, &TopicDescriptor::new("orders", 1, 1).unwrap())
            .await
            .unwrap();
        (provisioner, handle)
    }

    #[tokio::test]
    async fn test_publish_acknowledged() {
        let config = HarnessConfig::in_memory();
        let broker = InMemoryBroker::new();
        let (provisioner, mut handle) = running(broker.clone(), &config).await;
        let publisher = MessagePublisher::new(&config);

        let metadata = publisher
            .publish(&handle, "orders", None, b"order-42")
            .await
            .unwrap();
        assert_eq!(metadata.topic, "orders");
        assert_eq!(metadata.partition, 0);
        assert_eq!(metadata.offset, 0);
        assert_eq!(broker.record_count("orders"), 1);

        provisioner.stop(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_to_unknown_topic() {
        let config = HarnessConfig::in_memory();
        let (provisioner, mut handle) = running(InMemoryBroker::new(), &config).await;
        let publisher = MessagePublisher::new(&config);

        let err = publisher
            .publish(&handle, "payments", Some(b"k".as_slice()), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::TopicNotFound { ref topic } if topic == "payments"));

        provisioner.stop(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_all_preserves_order() {
        let config = HarnessConfig::in_memory();
        let (provisioner, mut handle) = running(InMemoryBroker::new(), &config).await;
        let publisher = MessagePublisher::new(&config);

        let records = vec![
            MessageRecord::new("orders", "a"),
            MessageRecord::new("orders", "b"),
        ];
        let acknowledged = publisher.publish_all(&handle, &records).await.unwrap();
        let offsets: Vec<i64> = acknowledged.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 1]);

        provisioner.stop(&mut handle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_times_out() {
        let config = HarnessConfig {
            publish_timeout_ms: 500,
            ..HarnessConfig::in_memory()
        };
        let broker = InMemoryBroker::with_options(InMemoryOptions {
            ack_delay: Duration::from_secs(10),
            ..InMemoryOptions::default()
        });
        let (provisioner, mut handle) = running(broker, &config).await;
        let publisher = MessagePublisher::new(&config);

        let err = publisher
            .publish(&handle, "orders", None, b"late")
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::PublishTimeout { timeout_ms: 500, .. }));

        provisioner.stop(&mut handle).await.unwrap();
    }
}
