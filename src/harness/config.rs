//! Harness configuration
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `VELO_HARNESS_*` environment variables. The CLI applies its flags last.
//! Every scalar setting has an environment variable; `client_properties` is a
//! map and can only be set from the file.
//!
//! ```yaml
//! backend: kafka
//! kafka_image_tag: latest
//! startup_timeout_ms: 90000
//! group_id_prefix: orders-check
//! offset_reset: earliest
//! client_properties:
//!   security.protocol: plaintext
//! ```

use super::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Prefix shared by every environment variable the harness reads
pub const ENV_PREFIX: &str = "VELO_HARNESS_";

/// Which backend the provisioner brings up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Confluent Kafka container started through testcontainers
    #[default]
    Kafka,
    /// Existing broker at `bootstrap_servers`, never stopped by the harness
    External,
    /// In-process broker, no Docker required
    Memory,
}

impl BackendKind {
    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> HarnessResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "kafka" | "container" | "testcontainers" => Ok(BackendKind::Kafka),
            "external" => Ok(BackendKind::External),
            "memory" | "in-memory" | "inmemory" => Ok(BackendKind::Memory),
            other => Err(HarnessError::config(format!(
                "Unknown backend '{}'. Valid values: kafka, external, memory",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Kafka => "Confluent Kafka",
            BackendKind::External => "External Kafka",
            BackendKind::Memory => "In-memory broker",
        }
    }
}

/// Where a fresh consumer session starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    /// Get the librdkafka `auto.offset.reset` value
    pub fn as_librdkafka_value(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }

    pub fn parse(s: &str) -> HarnessResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "earliest" | "smallest" | "beginning" => Ok(OffsetReset::Earliest),
            "latest" | "largest" | "end" => Ok(OffsetReset::Latest),
            other => Err(HarnessError::config(format!(
                "Unknown offset reset policy '{}'. Valid values: earliest, latest",
                other
            ))),
        }
    }
}

/// How payload bytes are interpreted when compared against expectations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Strict UTF-8 strings; undecodable payloads never match
    #[default]
    Utf8,
    /// Raw byte comparison
    Bytes,
}

impl PayloadEncoding {
    pub fn parse(s: &str) -> HarnessResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "utf8" | "utf-8" | "string" => Ok(PayloadEncoding::Utf8),
            "bytes" | "raw" => Ok(PayloadEncoding::Bytes),
            other => Err(HarnessError::config(format!(
                "Unknown payload encoding '{}'. Valid values: utf8, bytes",
                other
            ))),
        }
    }
}

/// What topic creation does when the topic is already there
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingTopicPolicy {
    /// Surface `AlreadyExists`
    #[default]
    Fail,
    /// Treat the existing topic as created
    Reuse,
}

impl ExistingTopicPolicy {
    pub fn parse(s: &str) -> HarnessResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "fail" | "error" => Ok(ExistingTopicPolicy::Fail),
            "reuse" => Ok(ExistingTopicPolicy::Reuse),
            other => Err(HarnessError::config(format!(
                "Unknown existing-topic policy '{}'. Valid values: fail, reuse",
                other
            ))),
        }
    }
}

/// Complete harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Backend to provision
    pub backend: BackendKind,

    /// Broker list for the `external` backend
    pub bootstrap_servers: Option<String>,

    /// Image tag override for the Kafka container (module default when unset)
    pub kafka_image_tag: Option<String>,

    /// Upper bound on backend startup including readiness probing
    pub startup_timeout_ms: u64,

    /// Spacing between readiness probes during startup
    pub probe_interval_ms: u64,

    /// Bound on topic creation including metadata propagation
    pub admin_timeout_ms: u64,

    /// Bound on a single publish acknowledgement
    pub publish_timeout_ms: u64,

    /// Verification window used when a scenario does not set its own
    pub verify_within_ms: u64,

    /// Per-iteration poll bound inside verification
    pub poll_interval_ms: u64,

    /// Minimum spacing between consecutive polls
    pub min_poll_spacing_ms: u64,

    /// Prefix for the unique group id of each consumer session
    pub group_id_prefix: String,

    /// Offset reset policy for consumer sessions
    pub offset_reset: OffsetReset,

    /// Payload interpretation for comparisons
    pub payload_encoding: PayloadEncoding,

    /// Behaviour when a topic already exists
    pub on_existing_topic: ExistingTopicPolicy,

    /// `broker.address.family` for librdkafka clients (`v4`, `v6`, `any`)
    pub broker_address_family: String,

    /// Broker count assumed by the in-memory backend
    pub memory_nodes: u16,

    /// Additional librdkafka properties applied to every client (file only)
    pub client_properties: HashMap<String, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Kafka,
            bootstrap_servers: None,
            kafka_image_tag: None,
            startup_timeout_ms: 60_000,
            probe_interval_ms: 500,
            admin_timeout_ms: 10_000,
            publish_timeout_ms: 5_000,
            verify_within_ms: 10_000,
            poll_interval_ms: 100,
            min_poll_spacing_ms: 50,
            group_id_prefix: "velo-harness".to_string(),
            offset_reset: OffsetReset::Earliest,
            payload_encoding: PayloadEncoding::Utf8,
            on_existing_topic: ExistingTopicPolicy::Fail,
            broker_address_family: "v4".to_string(),
            memory_nodes: 1,
            client_properties: HashMap::new(),
        }
    }
}

impl HarnessConfig {
    /// Configuration for the in-process broker
    pub fn in_memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            ..Self::default()
        }
    }

    /// Configuration attaching to an existing broker
    pub fn external(bootstrap_servers: &str) -> Self {
        Self {
            backend: BackendKind::External,
            bootstrap_servers: Some(bootstrap_servers.to_string()),
            ..Self::default()
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| HarnessError::IoError {
            message: e.to_string(),
            path: path.display().to_string(),
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML
    pub fn from_yaml(content: &str) -> HarnessResult<Self> {
        let config: HarnessConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the optional file, then the environment
    pub fn load(path: Option<&Path>) -> HarnessResult<Self> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        let config = config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `VELO_HARNESS_*` overrides using the given variable lookup
    pub fn apply_env<F>(mut self, lookup: F) -> HarnessResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("BACKEND") {
            self.backend = BackendKind::parse(&v)?;
        }
        if let Some(v) = var("BOOTSTRAP_SERVERS") {
            self.bootstrap_servers = Some(v);
        }
        if let Some(v) = var("KAFKA_IMAGE_TAG") {
            self.kafka_image_tag = Some(v);
        }
        if let Some(v) = var("STARTUP_TIMEOUT_MS") {
            self.startup_timeout_ms = parse_millis("STARTUP_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("PROBE_INTERVAL_MS") {
            self.probe_interval_ms = parse_millis("PROBE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("ADMIN_TIMEOUT_MS") {
            self.admin_timeout_ms = parse_millis("ADMIN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("PUBLISH_TIMEOUT_MS") {
            self.publish_timeout_ms = parse_millis("PUBLISH_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("VERIFY_WITHIN_MS") {
            self.verify_within_ms = parse_millis("VERIFY_WITHIN_MS", &v)?;
        }
        if let Some(v) = var("POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_millis("POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("MIN_POLL_SPACING_MS") {
            self.min_poll_spacing_ms = parse_millis("MIN_POLL_SPACING_MS", &v)?;
        }
        if let Some(v) = var("GROUP_ID_PREFIX") {
            self.group_id_prefix = v;
        }
        if let Some(v) = var("OFFSET_RESET") {
            self.offset_reset = OffsetReset::parse(&v)?;
        }
        if let Some(v) = var("PAYLOAD_ENCODING") {
            self.payload_encoding = PayloadEncoding::parse(&v)?;
        }
        if let Some(v) = var("ON_EXISTING_TOPIC") {
            self.on_existing_topic = ExistingTopicPolicy::parse(&v)?;
        }
        if let Some(v) = var("BROKER_ADDRESS_FAMILY") {
            self.broker_address_family = v;
        }
        if let Some(v) = var("MEMORY_NODES") {
            self.memory_nodes = v.trim().parse::<u16>().map_err(|e| {
                HarnessError::config(format!(
                    "{}MEMORY_NODES must be a broker count, got '{}': {}",
                    ENV_PREFIX, v, e
                ))
            })?;
        }

        Ok(self)
    }

    /// Reject settings that would make the harness misbehave
    pub fn validate(&self) -> HarnessResult<()> {
        if self.backend == BackendKind::External
            && self
                .bootstrap_servers
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(HarnessError::config(
                "The external backend requires bootstrap_servers",
            ));
        }
        if self.startup_timeout_ms == 0 {
            return Err(HarnessError::config("startup_timeout_ms must be positive"));
        }
        if self.poll_interval_ms == 0 {
            return Err(HarnessError::config("poll_interval_ms must be positive"));
        }
        if self.min_poll_spacing_ms > self.poll_interval_ms {
            return Err(HarnessError::config(format!(
                "min_poll_spacing_ms ({}) cannot exceed poll_interval_ms ({})",
                self.min_poll_spacing_ms, self.poll_interval_ms
            )));
        }
        if self.group_id_prefix.trim().is_empty() {
            return Err(HarnessError::config("group_id_prefix cannot be empty"));
        }
        if self.memory_nodes == 0 {
            return Err(HarnessError::config("memory_nodes must be at least 1"));
        }
        match self.broker_address_family.as_str() {
            "v4" | "v6" | "any" => Ok(()),
            other => Err(HarnessError::config(format!(
                "Invalid broker_address_family '{}'. Valid values: v4, v6, any",
                other
            ))),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn verify_within(&self) -> Duration {
        Duration::from_millis(self.verify_within_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn min_poll_spacing(&self) -> Duration {
        Duration::from_millis(self.min_poll_spacing_ms)
    }
}

fn parse_millis(name: &str, value: &str) -> HarnessResult<u64> {
    value.trim().parse::<u64>().map_err(|e| {
        HarnessError::config(format!(
            "{}{} must be a number of milliseconds, got '{}': {}",
            ENV_PREFIX, name, value, e
        ))
    })
}
