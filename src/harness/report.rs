//! Run reports
//!
//! Generates run reports in two formats:
//! - Text (human-readable console output)
//! - JSON (machine-readable)

use super::error::{ErrorKind, HarnessError};
use super::verifier::VerificationOutcome;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Complete run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Plan name
    pub plan: String,

    /// Run ID
    pub run_id: String,

    /// Backend description
    pub backend: String,

    /// Backend address, empty when provisioning failed
    pub address: String,

    /// Start time (RFC 3339)
    pub start_time: String,

    /// End time (RFC 3339)
    pub end_time: String,

    /// Total duration in milliseconds
    pub duration_ms: u64,

    pub summary: RunSummary,

    pub topics: Vec<TopicReport>,

    pub scenarios: Vec<ScenarioReport>,
}

impl RunReport {
    /// True when every topic was created and every scenario passed
    pub fn success(&self) -> bool {
        self.summary.failed == 0 && self.topics.iter().all(|t| t.error.is_none())
    }
}

/// Summary statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Outcome of creating one topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicReport {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
    /// `created` or `already_present` on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Scenario status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStatus {
    Passed,
    Failed,
}

/// Per-scenario report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub topic: String,
    pub status: ScenarioStatus,
    pub duration_ms: u64,
    /// Records acknowledged by the backend
    pub published: usize,
    /// Records observed by the verifier
    pub observed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl ScenarioReport {
    pub fn passed(
        name: &str,
        topic: &str,
        published: usize,
        outcome: &VerificationOutcome,
        duration_ms: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            topic: topic.to_string(),
            status: ScenarioStatus::Passed,
            duration_ms,
            published,
            observed: outcome.records.len(),
            error_kind: None,
            error: None,
            values: outcome.values.clone(),
        }
    }

    pub fn failed(
        name: &str,
        topic: &str,
        published: usize,
        error: &HarnessError,
        duration_ms: u64,
    ) -> Self {
        let (observed, values) = match error {
            HarnessError::PartialMismatch { actual, .. } => (actual.len(), actual.clone()),
            HarnessError::Cancelled { observed, .. } => (*observed, Vec::new()),
            _ => (0, Vec::new()),
        };
        Self {
            name: name.to_string(),
            topic: topic.to_string(),
            status: ScenarioStatus::Failed,
            duration_ms,
            published,
            observed,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
            values,
        }
    }
}

/// Collects results while a run is in progress
pub struct ReportGenerator {
    plan: String,
    run_id: String,
    backend: String,
    address: String,
    topics: Vec<TopicReport>,
    scenarios: Vec<ScenarioReport>,
    start_time: chrono::DateTime<chrono::Utc>,
}

impl ReportGenerator {
    pub fn new(plan: &str, backend: &str) -> Self {
        Self {
            plan: plan.to_string(),
            run_id: String::new(),
            backend: backend.to_string(),
            address: String::new(),
            topics: Vec::new(),
            scenarios: Vec::new(),
            start_time: chrono::Utc::now(),
        }
    }

    /// Record the provisioned backend
    pub fn set_backend(&mut self, run_id: &str, address: &str) {
        self.run_id = run_id.to_string();
        self.address = address.to_string();
    }

    pub fn add_topic(&mut self, topic: TopicReport) {
        self.topics.push(topic);
    }

    pub fn add_scenario(&mut self, scenario: ScenarioReport) {
        self.scenarios.push(scenario);
    }

    /// Generate final report
    pub fn generate(&self) -> RunReport {
        let end_time = chrono::Utc::now();
        let duration = end_time - self.start_time;

        let passed = self
            .scenarios
            .iter()
            .filter(|s| s.status == ScenarioStatus::Passed)
            .count();

        RunReport {
            plan: self.plan.clone(),
            run_id: self.run_id.clone(),
            backend: self.backend.clone(),
            address: self.address.clone(),
            start_time: self.start_time.to_rfc3339(),
            end_time: end_time.to_rfc3339(),
            duration_ms: duration.num_milliseconds().max(0) as u64,
            summary: RunSummary {
                total: self.scenarios.len(),
                passed,
                failed: self.scenarios.len() - passed,
            },
            topics: self.topics.clone(),
            scenarios: self.scenarios.clone(),
        }
    }
}

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

/// Write report to output
pub fn write_report(
    report: &RunReport,
    format: OutputFormat,
    writer: &mut dyn Write,
) -> std::io::Result<()> {
    match format {
        OutputFormat::Text => write_text_report(report, writer),
        OutputFormat::Json => write_json_report(report, writer),
    }
}

fn write_text_report(report: &RunReport, writer: &mut dyn Write) -> std::io::Result<()> {
    writeln!(writer, "\nKafka Delivery Report")?;
    writeln!(writer, "════════════════════════════════════════")?;
    writeln!(writer, "Plan: {}", report.plan)?;
    writeln!(writer, "Run ID: {}", report.run_id)?;
    writeln!(writer, "Backend: {} ({})", report.backend, report.address)?;
    writeln!(writer, "Duration: {}ms", report.duration_ms)?;
    writeln!(writer)?;

    if !report.topics.is_empty() {
        writeln!(writer, "Topics")?;
        writeln!(writer, "────────────────────────────────────────")?;
        for topic in &report.topics {
            match (&topic.creation, &topic.error) {
                (_, Some(error)) => writeln!(writer, "❌ {}: {}", topic.name, error)?,
                (Some(creation), None) => writeln!(
                    writer,
                    "✅ {} ({} partition(s), replication {}, {})",
                    topic.name, topic.partitions, topic.replication_factor, creation
                )?,
                (None, None) => writeln!(writer, "   {}", topic.name)?,
            }
        }
        writeln!(writer)?;
    }

    writeln!(writer, "Scenarios")?;
    writeln!(writer, "────────────────────────────────────────")?;
    for scenario in &report.scenarios {
        let icon = match scenario.status {
            ScenarioStatus::Passed => "✅",
            ScenarioStatus::Failed => "❌",
        };
        writeln!(
            writer,
            "{} {} on '{}' ({}ms, {} published, {} observed)",
            icon,
            scenario.name,
            scenario.topic,
            scenario.duration_ms,
            scenario.published,
            scenario.observed
        )?;
        if let (Some(kind), Some(error)) = (&scenario.error_kind, &scenario.error) {
            writeln!(writer, "   {}: {}", kind, error)?;
        }
    }

    writeln!(writer)?;
    if report.success() {
        writeln!(writer, "ALL SCENARIOS PASSED ({})", report.summary.total)?;
    } else {
        writeln!(
            writer,
            "{} of {} scenario(s) failed",
            report.summary.failed, report.summary.total
        )?;
    }

    Ok(())
}

fn write_json_report(report: &RunReport, writer: &mut dyn Write) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;
    writeln!(writer, "{}", json)
}
