//! Kafka Delivery Harness
//!
//! Provisions an isolated Kafka backend, creates topics, publishes records
//! and verifies that they are delivered to a fresh consumer, with every wait
//! bounded and the backend released at the end of each run.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Run Flow                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  1. Load config (defaults, YAML, VELO_HARNESS_*, CLI flags)     │
//! │  2. Start backend (testcontainers Kafka, external, in-memory)   │
//! │  3. Create each distinct topic, wait for metadata               │
//! │  4. For each scenario:                                          │
//! │     a. Publish records, each acknowledged (acks=all)            │
//! │     b. Verify on a fresh consumer group within the window       │
//! │  5. Stop backend, whatever the scenarios did                    │
//! │  6. Generate report                                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Single-message check against a Kafka container
//! velo-harness smoke
//!
//! # Run a plan
//! velo-harness run plan.yaml --output json
//!
//! # Validate a plan without starting anything
//! velo-harness validate plan.yaml
//! ```

pub mod admin;
pub mod backend;
pub mod config;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod orchestrator;
pub mod plan;
pub mod provisioner;
pub mod publisher;
pub mod report;
pub mod types;
pub mod verifier;

// Re-export main types for convenience
pub use admin::{TopicAdministrator, TopicCreation};
pub use config::{BackendKind, ExistingTopicPolicy, HarnessConfig, OffsetReset, PayloadEncoding};
pub use error::{ErrorKind, HarnessError, HarnessResult};
pub use memory::{InMemoryBroker, InMemoryOptions};
pub use orchestrator::TestOrchestrator;
pub use plan::{PlannedMessage, RunPlan, Scenario};
pub use provisioner::{BackendHandle, BackendProvisioner, BackendState};
pub use publisher::MessagePublisher;
pub use report::{OutputFormat, RunReport, ScenarioStatus};
pub use types::{MessageRecord, ReceivedRecord, RecordMetadata, TopicDescriptor};
pub use verifier::{MessageVerifier, VerificationOutcome, VerificationState};
