//! Run orchestration
//!
//! Sequences one run: provision the backend once, create each distinct
//! topic once, run every scenario (publish then verify on a fresh session),
//! then stop the backend whatever the scenarios did.
//!
//! Scenario failures are isolated: they are recorded in the report with their
//! error kind and the next scenario still runs. Only a provisioning failure
//! fails the run itself.

use super::admin::{TopicAdministrator, TopicCreation};
use super::config::HarnessConfig;
use super::error::{HarnessError, HarnessResult};
use super::memory::InMemoryBroker;
use super::plan::{RunPlan, Scenario};
use super::provisioner::{BackendHandle, BackendProvisioner};
use super::publisher::MessagePublisher;
use super::report::{ReportGenerator, RunReport, ScenarioReport, TopicReport};
use super::verifier::{MessageVerifier, VerificationOutcome};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Runs plans against a freshly provisioned backend
pub struct TestOrchestrator {
    config: HarnessConfig,
    provisioner: BackendProvisioner,
    administrator: TopicAdministrator,
    publisher: MessagePublisher,
    verifier: MessageVerifier,
    cancel: CancellationToken,
}

impl TestOrchestrator {
    /// Build every component from one configuration
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            provisioner: BackendProvisioner::new(config.clone()),
            administrator: TopicAdministrator::new(&config),
            publisher: MessagePublisher::new(&config),
            verifier: MessageVerifier::new(&config),
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Use this broker for the memory backend
    pub fn with_memory_broker(mut self, broker: InMemoryBroker) -> Self {
        self.provisioner = self.provisioner.with_memory_broker(broker);
        self
    }

    /// Token that aborts in-flight verifications when cancelled
    ///
    /// Cancelled scenarios are reported as `Cancelled`; the backend is still
    /// stopped.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Execute a plan and report every topic and scenario outcome
    pub async fn run(&self, plan: &RunPlan) -> HarnessResult<RunReport> {
        plan.validate()?;

        let mut report = ReportGenerator::new(&plan.name, self.config.backend.name());
        let mut handle = self.provisioner.start().await?;
        report.set_backend(handle.run_id(), handle.address());

        log::info!(
            "Running plan '{}': {} topic(s), {} scenario(s)",
            plan.name,
            plan.topics.len(),
            plan.scenarios.len()
        );

        let topic_errors = self.create_topics(&handle, plan, &mut report).await;

        for scenario in &plan.scenarios {
            let started = Instant::now();
            let result = match topic_errors.get(scenario.topic.as_str()) {
                Some(err) => Err((0, err.clone())),
                None => self.run_scenario(&handle, scenario).await,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let entry = match result {
                Ok((published, outcome)) => {
                    log::info!("Scenario '{}' passed", scenario.name);
                    ScenarioReport::passed(
                        &scenario.name,
                        &scenario.topic,
                        published,
                        &outcome,
                        duration_ms,
                    )
                }
                Err((published, err)) => {
                    log::warn!(
                        "Scenario '{}' failed with {}: {}",
                        scenario.name,
                        err.kind(),
                        err
                    );
                    ScenarioReport::failed(
                        &scenario.name,
                        &scenario.topic,
                        published,
                        &err,
                        duration_ms,
                    )
                }
            };
            report.add_scenario(entry);
        }

        if let Err(e) = self.provisioner.stop(&mut handle).await {
            log::warn!("Failed to stop backend: {}", e);
        }

        let report = report.generate();
        log::info!(
            "Plan '{}' finished: {}/{} scenario(s) passed",
            plan.name,
            report.summary.passed,
            report.summary.total
        );
        Ok(report)
    }

    /// Create each distinct topic once; failures are returned per topic
    async fn create_topics(
        &self,
        handle: &BackendHandle,
        plan: &RunPlan,
        report: &mut ReportGenerator,
    ) -> HashMap<String, HarnessError> {
        let mut errors = HashMap::new();

        for topic in plan.distinct_topics() {
            let mut entry = TopicReport {
                name: topic.name.clone(),
                partitions: topic.partitions,
                replication_factor: topic.replication_factor,
                creation: None,
                error: None,
            };

            match self.administrator.create_topic(handle, topic).await {
                Ok(creation) => {
                    entry.creation = Some(
                        match creation {
                            TopicCreation::Created => "created",
                            TopicCreation::AlreadyPresent => "already_present",
                        }
                        .to_string(),
                    );
                }
                Err(e) => {
                    log::warn!("Failed to create topic '{}': {}", topic.name, e);
                    entry.error = Some(e.to_string());
                    errors.insert(topic.name.clone(), e);
                }
            }
            report.add_topic(entry);
        }

        errors
    }

    /// Publish then verify; the error carries how many records were acknowledged
    async fn run_scenario(
        &self,
        handle: &BackendHandle,
        scenario: &Scenario,
    ) -> Result<(usize, VerificationOutcome), (usize, HarnessError)> {
        log::info!("Scenario '{}' on topic '{}'", scenario.name, scenario.topic);

        let mut published = 0;
        for record in scenario.records() {
            self.publisher
                .send(handle, &record)
                .await
                .map_err(|e| (published, e))?;
            published += 1;
        }

        let within = scenario.within(self.config.verify_within());
        let outcome = self
            .verifier
            .verify_until_cancelled(handle, &scenario.topic, &scenario.expect, within, &self.cancel)
            .await
            .map_err(|e| (published, e))?;

        Ok((published, outcome))
    }
}
