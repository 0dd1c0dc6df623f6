//! Delivery verification
//!
//! Opens a fresh consumer session per verification and polls it repeatedly
//! until enough records have arrived or the window is spent:
//!
//! ```text
//! Idle -> Subscribed -> Polling -> Satisfied | TimedOut | Cancelled -> Closed
//! ```
//!
//! Each poll waits at most `poll_interval_ms` (never past the deadline) and
//! empty polls are spaced at least `min_poll_spacing_ms` apart. A verification
//! that never sees a matching record therefore returns no earlier than the
//! window and no later than the window plus one poll bound.
//!
//! The session is closed on every exit path, including errors and
//! cancellation.

use super::backend::ConsumerSession;
use super::config::{HarnessConfig, OffsetReset, PayloadEncoding};
use super::error::{HarnessError, HarnessResult};
use super::provisioner::BackendHandle;
use super::types::{ReceivedRecord, SessionSettings};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Verification lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Idle,
    Subscribed,
    Polling,
    Satisfied,
    TimedOut,
    Cancelled,
    Closed,
}

/// Successful verification
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub topic: String,
    pub group_id: String,
    /// Records observed, in arrival order
    pub records: Vec<ReceivedRecord>,
    /// Decoded payloads of `records`
    pub values: Vec<String>,
    /// States visited, ending with `Closed`
    pub states: Vec<VerificationState>,
    pub elapsed: Duration,
    pub polls: u32,
}

/// Closes the session when dropped
struct SessionGuard {
    session: Box<dyn ConsumerSession>,
}

impl SessionGuard {
    fn close(&mut self) {
        self.session.close();
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.session.is_closed() {
            self.session.close();
        }
    }
}

/// Verifies that published records reach a fresh consumer
pub struct MessageVerifier {
    group_id_prefix: String,
    offset_reset: OffsetReset,
    encoding: PayloadEncoding,
    poll_interval: Duration,
    min_poll_spacing: Duration,
}

impl MessageVerifier {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            group_id_prefix: config.group_id_prefix.clone(),
            offset_reset: config.offset_reset,
            encoding: config.payload_encoding,
            poll_interval: config.poll_interval(),
            min_poll_spacing: config.min_poll_spacing(),
        }
    }

    /// Wait up to `within` for `expected` to arrive on `topic`
    ///
    /// An empty `expected` asserts silence: the whole window is polled and
    /// any record fails the verification.
    pub async fn verify(
        &self,
        handle: &BackendHandle,
        topic: &str,
        expected: &[String],
        within: Duration,
    ) -> HarnessResult<VerificationOutcome> {
        self.verify_until_cancelled(handle, topic, expected, within, &CancellationToken::new())
            .await
    }

    /// Like [`verify`](Self::verify), aborting with `Cancelled` once `cancel` fires
    pub async fn verify_until_cancelled(
        &self,
        handle: &BackendHandle,
        topic: &str,
        expected: &[String],
        within: Duration,
        cancel: &CancellationToken,
    ) -> HarnessResult<VerificationOutcome> {
        let started = Instant::now();
        let deadline = started + within;
        let mut states = vec![VerificationState::Idle];

        let settings = SessionSettings {
            group_id: format!("{}-{}", self.group_id_prefix, uuid::Uuid::new_v4()),
            offset_reset: self.offset_reset,
        };
        let session = handle.clients()?.open_session(&settings)?;
        let mut guard = SessionGuard { session };

        guard.session.subscribe(topic)?;
        states.push(VerificationState::Subscribed);
        log::debug!(
            "Verifying {} record(s) on '{}' within {:?} (group: {})",
            expected.len(),
            topic,
            within,
            settings.group_id
        );

        states.push(VerificationState::Polling);
        let mut records: Vec<ReceivedRecord> = Vec::new();
        let mut polls = 0u32;

        let terminal = loop {
            if !expected.is_empty() && records.len() >= expected.len() {
                break VerificationState::Satisfied;
            }
            let now = Instant::now();
            if now >= deadline {
                break VerificationState::TimedOut;
            }

            let bound = self.poll_interval.min(deadline - now);
            let poll_started = Instant::now();
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break VerificationState::Cancelled,
                polled = guard.session.poll(bound) => polled?,
            };
            polls += 1;

            match polled {
                Some(record) => {
                    log::debug!(
                        "Received record from {}[{}] at offset {}",
                        record.topic,
                        record.partition,
                        record.offset
                    );
                    records.push(record);
                }
                None => {
                    let spent = poll_started.elapsed();
                    if spent < self.min_poll_spacing {
                        let pause = (self.min_poll_spacing - spent)
                            .min(deadline.saturating_duration_since(Instant::now()));
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break VerificationState::Cancelled,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                }
            }
        };

        states.push(terminal);
        guard.close();
        states.push(VerificationState::Closed);

        let elapsed = started.elapsed();
        log::debug!(
            "Verification of '{}' ended {:?} after {:?} ({} poll(s), {} record(s))",
            topic,
            terminal,
            elapsed,
            polls,
            records.len()
        );

        if terminal == VerificationState::Cancelled {
            return Err(HarnessError::Cancelled {
                topic: topic.to_string(),
                observed: records.len(),
            });
        }

        let values: Vec<String> = records.iter().map(|r| self.render(r)).collect();

        if records.is_empty() && !expected.is_empty() {
            return Err(HarnessError::NoMessagesReceived {
                topic: topic.to_string(),
                waited_ms: elapsed.as_millis() as u64,
            });
        }

        if !self.matches(&records, expected) {
            return Err(HarnessError::PartialMismatch {
                topic: topic.to_string(),
                expected: expected.to_vec(),
                actual: values,
            });
        }

        Ok(VerificationOutcome {
            topic: topic.to_string(),
            group_id: settings.group_id,
            records,
            values,
            states,
            elapsed,
            polls,
        })
    }

    fn render(&self, record: &ReceivedRecord) -> String {
        record
            .decode(self.encoding)
            .unwrap_or_else(|| format!("<{} undecodable byte(s)>", record.payload.len()))
    }

    /// Payload comparison, ordered only when a single partition is involved
    fn matches(&self, records: &[ReceivedRecord], expected: &[String]) -> bool {
        if records.len() != expected.len() {
            return false;
        }
        let decoded: Option<Vec<String>> =
            records.iter().map(|r| r.decode(self.encoding)).collect();
        let Some(mut actual) = decoded else {
            return false;
        };

        let single_partition = records.windows(2).all(|w| w[0].partition == w[1].partition);
        if single_partition {
            return actual == expected;
        }

        let mut wanted = expected.to_vec();
        actual.sort();
        wanted.sort();
        actual == wanted
    }
}
