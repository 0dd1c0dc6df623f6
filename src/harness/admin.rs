//! Topic administration
//!
//! Creates topics on a running backend and waits until their metadata is
//! visible, so publishing right after creation never races propagation.

use super::config::{ExistingTopicPolicy, HarnessConfig};
use super::error::{HarnessError, HarnessResult};
use super::provisioner::BackendHandle;
use super::types::TopicDescriptor;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Spacing between metadata checks while waiting for a new topic
const METADATA_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// How a topic came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicCreation {
    /// Created by this call
    Created,
    /// Already present and reused under [`ExistingTopicPolicy::Reuse`]
    AlreadyPresent,
}

/// Creates topics on a running backend
pub struct TopicAdministrator {
    timeout: Duration,
    on_existing: ExistingTopicPolicy,
}

impl TopicAdministrator {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            timeout: config.admin_timeout(),
            on_existing: config.on_existing_topic,
        }
    }

    /// Create a topic and wait for it to appear in metadata
    ///
    /// On success the topic is visible with the requested partition count.
    pub async fn create_topic(
        &self,
        handle: &BackendHandle,
        topic: &TopicDescriptor,
    ) -> HarnessResult<TopicCreation> {
        topic.validate()?;
        let admin = handle.clients()?.admin()?;
        let started = Instant::now();

        log::info!(
            "Creating topic '{}' ({} partition(s), replication {})",
            topic.name,
            topic.partitions,
            topic.replication_factor
        );

        let creation = match admin.create_topic(topic, self.timeout).await {
            Ok(()) => TopicCreation::Created,
            Err(HarnessError::AlreadyExists { topic: name })
                if self.on_existing == ExistingTopicPolicy::Reuse =>
            {
                log::info!("Topic '{}' already exists, reusing it", name);
                TopicCreation::AlreadyPresent
            }
            Err(e) => return Err(e),
        };

        loop {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if let Some(partitions) = admin
                .describe_topic(&topic.name, remaining.max(METADATA_CHECK_INTERVAL))
                .await?
            {
                if creation == TopicCreation::AlreadyPresent || partitions == topic.partitions {
                    log::debug!(
                        "Topic '{}' visible with {} partition(s) after {:?}",
                        topic.name,
                        partitions,
                        started.elapsed()
                    );
                    return Ok(creation);
                }
            }

            if started.elapsed() >= self.timeout {
                return Err(HarnessError::Unreachable {
                    message: format!(
                        "Topic '{}' not visible in metadata within {}ms",
                        topic.name,
                        self.timeout.as_millis()
                    ),
                    address: handle.address().to_string(),
                    source: None,
                });
            }
            let remaining = self.timeout.saturating_sub(started.elapsed());
            tokio::time::sleep(METADATA_CHECK_INTERVAL.min(remaining)).await;
        }
    }

    /// Create every topic in order, stopping at the first failure
    pub async fn create_topics(
        &self,
        handle: &BackendHandle,
        topics: &[TopicDescriptor],
    ) -> HarnessResult<Vec<TopicCreation>> {
        let mut created = Vec::with_capacity(topics.len());
        for topic in topics {
            created.push(self.create_topic(handle, topic).await?);
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::memory::{InMemoryBroker, InMemoryOptions};
    use crate::harness::provisioner::BackendProvisioner;

    async fn start(config: &HarnessConfig, broker: InMemoryBroker) -> (BackendProvisioner, BackendHandle) {
        let provisioner = BackendProvisioner::new(config.clone()).with_memory_broker(broker);
        let handle = provisioner.start().await.unwrap();
        (provisioner, handle)
    }

    #[tokio::test]
    async fn test_create_then_duplicate() {
        let config = HarnessConfig::in_memory();
        let (provisioner, mut handle) = start(&config, InMemoryBroker::new()).await;
        let admin = TopicAdministrator::new(&config);
        let topic = TopicDescriptor::new("orders", 1, 1).unwrap();

        assert_eq!(
            admin.create_topic(&handle, &topic).await.unwrap(),
            TopicCreation::Created
        );
        let err = admin.create_topic(&handle, &topic).await.unwrap_err();
        assert!(matches!(err, HarnessError::AlreadyExists { .. }));

        provisioner.stop(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_reuse_policy() {
        let config = HarnessConfig {
            on_existing_topic: ExistingTopicPolicy::Reuse,
            ..HarnessConfig::in_memory()
        };
        let (provisioner, mut handle) = start(&config, InMemoryBroker::new()).await;
        let admin = TopicAdministrator::new(&config);
        let topic = TopicDescriptor::new("orders", 1, 1).unwrap();

        admin.create_topic(&handle, &topic).await.unwrap();
        assert_eq!(
            admin.create_topic(&handle, &topic).await.unwrap(),
            TopicCreation::AlreadyPresent
        );

        provisioner.stop(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_descriptor_rejected_locally() {
        let config = HarnessConfig::in_memory();
        let broker = InMemoryBroker::new();
        let (provisioner, mut handle) = start(&config, broker.clone()).await;
        let admin = TopicAdministrator::new(&config);
        let topic = TopicDescriptor {
            name: "bad topic".to_string(),
            partitions: 1,
            replication_factor: 1,
        };

        let err = admin.create_topic(&handle, &topic).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidTopic { .. }));

        provisioner.stop(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_backend_unreachable() {
        let config = HarnessConfig::in_memory();
        let (provisioner, mut handle) = start(&config, InMemoryBroker::new()).await;
        provisioner.stop(&mut handle).await.unwrap();

        let admin = TopicAdministrator::new(&config);
        let topic = TopicDescriptor::new("orders", 1, 1).unwrap();
        let err = admin.create_topic(&handle, &topic).await.unwrap_err();
        assert!(matches!(err, HarnessError::Unreachable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_metadata_propagation() {
        let config = HarnessConfig::in_memory();
        let broker = InMemoryBroker::with_options(InMemoryOptions {
            propagation_delay: Duration::from_millis(750),
            ..InMemoryOptions::default()
        });
        let (provisioner, mut handle) = start(&config, broker).await;
        let admin = TopicAdministrator::new(&config);
        let topic = TopicDescriptor::new("orders", 3, 1).unwrap();

        let started = Instant::now();
        admin.create_topic(&handle, &topic).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(750));

        let visible = handle
            .clients()
            .unwrap()
            .admin()
            .unwrap()
            .describe_topic("orders", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(visible, Some(3));

        provisioner.stop(&mut handle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_propagation_bounded_by_admin_timeout() {
        let config = HarnessConfig {
            admin_timeout_ms: 1_000,
            ..HarnessConfig::in_memory()
        };
        let broker = InMemoryBroker::with_options(InMemoryOptions {
            propagation_delay: Duration::from_secs(30),
            ..InMemoryOptions::default()
        });
        let (provisioner, mut handle) = start(&config, broker).await;
        let admin = TopicAdministrator::new(&config);
        let topic = TopicDescriptor::new("orders", 1, 1).unwrap();

        let started = Instant::now();
        let err = admin.create_topic(&handle, &topic).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        match err {
            HarnessError::Unreachable { message, address, .. } => {
                assert!(message.contains("orders"));
                assert!(message.contains("1000ms"));
                assert_eq!(address, handle.address());
            }
            other => panic!("expected Unreachable, got {:?}", other),
        }

        provisioner.stop(&mut handle).await.unwrap();
    }
}
