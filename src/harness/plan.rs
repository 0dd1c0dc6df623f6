//! Run plans
//!
//! A run plan lists the topics to create and the scenarios to run against
//! them. Plans are YAML files:
//!
//! ```yaml
//! name: orders
//! topics:
//!   - name: orders
//!     partitions: 1
//!     replication_factor: 1
//!   - name: audit
//! scenarios:
//!   - name: single order
//!     topic: orders
//!     publish:
//!       - payload: order-42
//!     expect: [order-42]
//!     within_ms: 10000
//!   - name: nothing audited
//!     topic: audit
//!     expect: []
//!     within_ms: 2000
//! ```
//!
//! Every scenario reads its topic from the beginning with a fresh consumer
//! group, so an empty expectation only holds on a topic no earlier scenario
//! published to.

use super::error::{HarnessError, HarnessResult};
use super::types::{MessageRecord, TopicDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Topic of the built-in smoke check
pub const SMOKE_TOPIC: &str = "test_topic";

/// Payload of the built-in smoke check
pub const SMOKE_PAYLOAD: &str = "Hello, Kafka";

/// Complete run plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    /// Plan name, shown in reports
    pub name: String,

    /// Topics created before any scenario runs
    #[serde(default)]
    pub topics: Vec<TopicDescriptor>,

    /// Scenarios, run in order
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

/// One publish-then-verify step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,

    /// Topic published to and verified on
    pub topic: String,

    /// Messages published before verification, in order
    #[serde(default)]
    pub publish: Vec<PlannedMessage>,

    /// Payloads the verifier must observe; empty means none at all
    #[serde(default)]
    pub expect: Vec<String>,

    /// Verification window (config default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within_ms: Option<u64>,
}

/// Message to publish
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    pub payload: String,
}

impl Scenario {
    /// Verification window, falling back to `default`
    pub fn within(&self, default: Duration) -> Duration {
        self.within_ms.map(Duration::from_millis).unwrap_or(default)
    }

    /// Records to publish for this scenario
    pub fn records(&self) -> Vec<MessageRecord> {
        self.publish
            .iter()
            .map(|m| {
                let record = MessageRecord::new(&self.topic, m.payload.as_bytes());
                match m.key {
                    Some(ref key) => record.with_key(key.as_bytes()),
                    None => record,
                }
            })
            .collect()
    }
}

impl RunPlan {
    /// Load run plan from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| HarnessError::IoError {
            message: e.to_string(),
            path: path.display().to_string(),
        })?;

        Self::from_yaml(&content).map_err(|e| match e {
            HarnessError::ConfigError { message } => HarnessError::ConfigError {
                message: format!("{}: {}", path.display(), message),
            },
            other => other,
        })
    }

    /// Parse and validate a run plan
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        let plan: RunPlan = serde_yaml::from_str(yaml)?;
        plan.validate()?;
        Ok(plan)
    }

    /// The single-message check: `Hello, Kafka` through `test_topic`
    pub fn smoke() -> Self {
        Self {
            name: "smoke".to_string(),
            topics: vec![TopicDescriptor {
                name: SMOKE_TOPIC.to_string(),
                partitions: 1,
                replication_factor: 1,
            }],
            scenarios: vec![Scenario {
                name: "hello".to_string(),
                topic: SMOKE_TOPIC.to_string(),
                publish: vec![PlannedMessage {
                    key: None,
                    payload: SMOKE_PAYLOAD.to_string(),
                }],
                expect: vec![SMOKE_PAYLOAD.to_string()],
                within_ms: None,
            }],
        }
    }

    /// Validate the plan before anything is provisioned
    pub fn validate(&self) -> HarnessResult<()> {
        if self.name.trim().is_empty() {
            return Err(HarnessError::config("Plan name cannot be empty"));
        }

        for topic in &self.topics {
            topic.validate()?;
        }

        // Redeclaring a topic is allowed only with the same shape
        for (i, topic) in self.topics.iter().enumerate() {
            if let Some(other) = self.topics[..i].iter().find(|t| t.name == topic.name) {
                if other != topic {
                    return Err(HarnessError::config(format!(
                        "Topic '{}' declared twice with different settings",
                        topic.name
                    )));
                }
            }
        }

        let declared: HashSet<&str> = self.topics.iter().map(|t| t.name.as_str()).collect();
        let mut names = HashSet::new();
        for scenario in &self.scenarios {
            if !names.insert(scenario.name.as_str()) {
                return Err(HarnessError::config(format!(
                    "Duplicate scenario name: {}",
                    scenario.name
                )));
            }
            if !declared.contains(scenario.topic.as_str()) {
                return Err(HarnessError::config(format!(
                    "Scenario '{}': topic '{}' is not declared in topics",
                    scenario.name, scenario.topic
                )));
            }
            if scenario.within_ms == Some(0) {
                return Err(HarnessError::config(format!(
                    "Scenario '{}': within_ms must be positive",
                    scenario.name
                )));
            }
        }

        Ok(())
    }

    /// Topics in declaration order, each name once
    pub fn distinct_topics(&self) -> Vec<&TopicDescriptor> {
        let mut seen = HashSet::new();
        self.topics
            .iter()
            .filter(|t| seen.insert(t.name.as_str()))
            .collect()
    }
}
