//! Records, topic descriptors and session settings shared by every component

use super::config::{OffsetReset, PayloadEncoding};
use super::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};

/// Longest topic name Kafka accepts
pub const MAX_TOPIC_NAME_LEN: usize = 249;

/// A topic to create: immutable once created, never deleted within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDescriptor {
    pub name: String,

    #[serde(default = "default_partitions")]
    pub partitions: i32,

    #[serde(default = "default_replication")]
    pub replication_factor: i32,
}

fn default_partitions() -> i32 {
    1
}

fn default_replication() -> i32 {
    1
}

impl TopicDescriptor {
    /// Build and validate a descriptor
    pub fn new(name: &str, partitions: i32, replication_factor: i32) -> HarnessResult<Self> {
        let descriptor = Self {
            name: name.to_string(),
            partitions,
            replication_factor,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check name and counts against Kafka's rules
    pub fn validate(&self) -> HarnessResult<()> {
        validate_topic_name(&self.name)?;
        if self.partitions < 1 {
            return Err(self.invalid(format!(
                "partition count must be positive, got {}",
                self.partitions
            )));
        }
        if self.replication_factor < 1 {
            return Err(self.invalid(format!(
                "replication factor must be positive, got {}",
                self.replication_factor
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> HarnessError {
        HarnessError::InvalidTopic {
            topic: self.name.clone(),
            reason,
        }
    }
}

/// Validate a topic name: 1..=249 chars of `[A-Za-z0-9._-]`, not `.` or `..`
pub fn validate_topic_name(name: &str) -> HarnessResult<()> {
    let invalid = |reason: &str| HarnessError::InvalidTopic {
        topic: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > MAX_TOPIC_NAME_LEN {
        return Err(invalid("name longer than 249 characters"));
    }
    if name == "." || name == ".." {
        return Err(invalid("'.' and '..' are reserved"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(invalid("only ASCII alphanumerics, '.', '_' and '-' are allowed"));
    }
    Ok(())
}

/// Outgoing record handed to the publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl MessageRecord {
    pub fn new(topic: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.to_string(),
            key: None,
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Broker acknowledgement of a published record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Broker-assigned timestamp in epoch milliseconds, when reported
    pub timestamp_ms: Option<i64>,
}

/// Record read back by a consumer session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp_ms: Option<i64>,
}

impl ReceivedRecord {
    /// Render the payload for comparison and display
    ///
    /// Under [`PayloadEncoding::Utf8`] an undecodable payload yields `None`.
    pub fn decode(&self, encoding: PayloadEncoding) -> Option<String> {
        match encoding {
            PayloadEncoding::Utf8 => String::from_utf8(self.payload.clone()).ok(),
            PayloadEncoding::Bytes => Some(String::from_utf8_lossy(&self.payload).into_owned()),
        }
    }
}

/// Settings for one consumer session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub group_id: String,
    pub offset_reset: OffsetReset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_descriptor() {
        let topic = TopicDescriptor::new("orders", 1, 1).unwrap();
        assert_eq!(topic.name, "orders");
        assert!(TopicDescriptor::new("orders.v2_eu-west", 3, 1).is_ok());
    }

    #[test]
    fn test_rejects_bad_names() {
        for name in ["", ".", "..", "orders/eu", "orders eu", "zamówienia"] {
            let err = TopicDescriptor::new(name, 1, 1).unwrap_err();
            assert!(
                matches!(err, HarnessError::InvalidTopic { .. }),
                "expected InvalidTopic for {:?}",
                name
            );
        }
        let long = "a".repeat(MAX_TOPIC_NAME_LEN + 1);
        assert!(TopicDescriptor::new(&long, 1, 1).is_err());
        assert!(TopicDescriptor::new(&"a".repeat(MAX_TOPIC_NAME_LEN), 1, 1).is_ok());
    }

    #[test]
    fn test_rejects_non_positive_counts() {
        assert!(TopicDescriptor::new("orders", 0, 1).is_err());
        assert!(TopicDescriptor::new("orders", 1, 0).is_err());
        assert!(TopicDescriptor::new("orders", -2, 1).is_err());
    }

    #[test]
    fn test_decode_respects_encoding() {
        let record = ReceivedRecord {
            topic: "orders".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: vec![0xff, 0x61],
            timestamp_ms: None,
        };
        assert_eq!(record.decode(PayloadEncoding::Utf8), None);
        assert!(record.decode(PayloadEncoding::Bytes).is_some());
    }
}
