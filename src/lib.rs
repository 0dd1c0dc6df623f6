//! # velo-kafka-harness
//!
//! A test harness that proves records produced to Apache Kafka reach a
//! consumer. It starts a disposable broker, creates topics, publishes with
//! broker acknowledgement and verifies delivery with bounded polling.
//!
//! ## Features
//!
//! - **Disposable Backends**: Kafka via `testcontainers`, an external cluster, or an in-process broker
//! - **Bounded Waits**: Explicit startup, administration, publish and verification timeouts
//! - **Deterministic Cleanup**: Consumer sessions closed on every path, backend stopped after every run
//! - **Run Plans**: YAML topics and scenarios with text and JSON reports
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use velo_kafka_harness::harness::{
//!     BackendProvisioner, HarnessConfig, MessagePublisher, MessageVerifier, TopicAdministrator,
//!     TopicDescriptor,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HarnessConfig::default();
//!     let provisioner = BackendProvisioner::new(config.clone());
//!     let mut handle = provisioner.start().await?;
//!
//!     let topic = TopicDescriptor::new("orders", 1, 1)?;
//!     TopicAdministrator::new(&config).create_topic(&handle, &topic).await?;
//!     MessagePublisher::new(&config)
//!         .publish(&handle, "orders", None, b"order-42")
//!         .await?;
//!
//!     let outcome = MessageVerifier::new(&config)
//!         .verify(&handle, "orders", &["order-42".to_string()], Duration::from_secs(10))
//!         .await?;
//!     assert_eq!(outcome.records.len(), 1);
//!
//!     provisioner.stop(&mut handle).await?;
//!     Ok(())
//! }
//! ```

pub mod harness;
