//! Error types for the delivery harness
//!
//! Every backend-facing failure surfaces as a [`HarnessError`]; nothing is
//! retried or recovered locally.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Main error type for harness operations
#[derive(Debug, Clone)]
pub enum HarnessError {
    /// Backend did not accept administrative connections within the bound
    StartupTimeout {
        message: String,
        timeout_ms: u64,
    },

    /// Backend is not running or cannot be reached
    Unreachable {
        message: String,
        address: String,
        source: Option<String>,
    },

    /// Topic referenced before it was created
    TopicNotFound { topic: String },

    /// Topic creation collided with an existing topic
    AlreadyExists { topic: String },

    /// Topic descriptor rejected before reaching the backend
    InvalidTopic { topic: String, reason: String },

    /// Backend did not acknowledge a record in time
    PublishTimeout {
        topic: String,
        timeout_ms: u64,
    },

    /// Backend rejected a record for any other reason
    PublishFailed {
        topic: String,
        message: String,
    },

    /// Verification window elapsed without a single record
    NoMessagesReceived {
        topic: String,
        waited_ms: u64,
    },

    /// Records arrived but did not match what was expected
    PartialMismatch {
        topic: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// Verification aborted by an external cancellation signal
    Cancelled {
        topic: String,
        observed: usize,
    },

    /// Configuration or run plan error
    ConfigError { message: String },

    /// Infrastructure failure not covered by a more specific variant
    InfraError {
        message: String,
        source: Option<String>,
    },

    /// IO error (plan and config files)
    IoError { message: String, path: String },
}

/// Coarse classification of a [`HarnessError`], used in run reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StartupTimeout,
    Unreachable,
    TopicNotFound,
    AlreadyExists,
    InvalidTopic,
    PublishTimeout,
    PublishFailed,
    NoMessagesReceived,
    PartialMismatch,
    Cancelled,
    Config,
    Infra,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::StartupTimeout => "StartupTimeout",
            ErrorKind::Unreachable => "Unreachable",
            ErrorKind::TopicNotFound => "TopicNotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::InvalidTopic => "InvalidTopic",
            ErrorKind::PublishTimeout => "PublishTimeout",
            ErrorKind::PublishFailed => "PublishFailed",
            ErrorKind::NoMessagesReceived => "NoMessagesReceived",
            ErrorKind::PartialMismatch => "PartialMismatch",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Config => "Config",
            ErrorKind::Infra => "Infra",
            ErrorKind::Io => "Io",
        };
        f.write_str(name)
    }
}

impl HarnessError {
    /// Classify this error for reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::StartupTimeout { .. } => ErrorKind::StartupTimeout,
            HarnessError::Unreachable { .. } => ErrorKind::Unreachable,
            HarnessError::TopicNotFound { .. } => ErrorKind::TopicNotFound,
            HarnessError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            HarnessError::InvalidTopic { .. } => ErrorKind::InvalidTopic,
            HarnessError::PublishTimeout { .. } => ErrorKind::PublishTimeout,
            HarnessError::PublishFailed { .. } => ErrorKind::PublishFailed,
            HarnessError::NoMessagesReceived { .. } => ErrorKind::NoMessagesReceived,
            HarnessError::PartialMismatch { .. } => ErrorKind::PartialMismatch,
            HarnessError::Cancelled { .. } => ErrorKind::Cancelled,
            HarnessError::ConfigError { .. } => ErrorKind::Config,
            HarnessError::InfraError { .. } => ErrorKind::Infra,
            HarnessError::IoError { .. } => ErrorKind::Io,
        }
    }

    pub(crate) fn unreachable(address: &str, message: impl Into<String>) -> Self {
        HarnessError::Unreachable {
            message: message.into(),
            address: address.to_string(),
            source: None,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        HarnessError::ConfigError {
            message: message.into(),
        }
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::StartupTimeout {
                message,
                timeout_ms,
            } => {
                write!(
                    f,
                    "Backend not ready after {}ms: {}",
                    timeout_ms, message
                )
            }
            HarnessError::Unreachable {
                message,
                address,
                source,
            } => {
                if let Some(s) = source {
                    write!(f, "Backend '{}' unreachable: {} ({})", address, message, s)
                } else {
                    write!(f, "Backend '{}' unreachable: {}", address, message)
                }
            }
            HarnessError::TopicNotFound { topic } => {
                write!(f, "Topic '{}' does not exist", topic)
            }
            HarnessError::AlreadyExists { topic } => {
                write!(f, "Topic '{}' already exists", topic)
            }
            HarnessError::InvalidTopic { topic, reason } => {
                write!(f, "Invalid topic '{}': {}", topic, reason)
            }
            HarnessError::PublishTimeout { topic, timeout_ms } => {
                write!(
                    f,
                    "No acknowledgement for record on '{}' within {}ms",
                    topic, timeout_ms
                )
            }
            HarnessError::PublishFailed { topic, message } => {
                write!(f, "Publish to '{}' failed: {}", topic, message)
            }
            HarnessError::NoMessagesReceived { topic, waited_ms } => {
                write!(
                    f,
                    "No messages were received from '{}' within {}ms",
                    topic, waited_ms
                )
            }
            HarnessError::PartialMismatch {
                topic,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Records on '{}' did not match (expected: {:?}, actual: {:?})",
                    topic, expected, actual
                )
            }
            HarnessError::Cancelled { topic, observed } => {
                write!(
                    f,
                    "Verification of '{}' cancelled after {} record(s)",
                    topic, observed
                )
            }
            HarnessError::ConfigError { message } => {
                write!(f, "Configuration error: {}", message)
            }
            HarnessError::InfraError { message, source } => {
                if let Some(s) = source {
                    write!(f, "Infrastructure error: {} ({})", message, s)
                } else {
                    write!(f, "Infrastructure error: {}", message)
                }
            }
            HarnessError::IoError { message, path } => {
                write!(f, "IO error for '{}': {}", path, message)
            }
        }
    }
}

impl std::error::Error for HarnessError {}

impl From<io::Error> for HarnessError {
    fn from(err: io::Error) -> Self {
        HarnessError::IoError {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<serde_yaml::Error> for HarnessError {
    fn from(err: serde_yaml::Error) -> Self {
        HarnessError::ConfigError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::ConfigError {
            message: err.to_string(),
        }
    }
}

/// Result type alias for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;
