//! Backend provisioning
//!
//! Brings up exactly one backend per run and tears it down again:
//! - Kafka container startup/shutdown through testcontainers (requires Docker)
//! - Attaching to an external broker (never stopped by the harness)
//! - In-process broker for Docker-less runs
//!
//! Startup is bounded by `startup_timeout_ms`: the container start and the
//! readiness probes that follow it share that one budget. A backend that
//! misses it is released before `StartupTimeout` is returned; a container
//! whose start only completes after the bound is removed as soon as it
//! arrives.
//!
//! ```rust,ignore
//! let provisioner = BackendProvisioner::new(HarnessConfig::default());
//! let mut handle = provisioner.start().await?;
//! // ... administer, publish, verify
//! provisioner.stop(&mut handle).await?;
//! ```

use super::backend::BackendClients;
use super::config::{BackendKind, HarnessConfig};
use super::error::{HarnessError, HarnessResult};
use super::kafka::KafkaClients;
use super::memory::{InMemoryBroker, InMemoryOptions};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{Kafka, KAFKA_PORT};
use tokio::time::Instant;

/// Longest single readiness probe
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a backend handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Stopped,
    Starting,
    Running,
    StoppedFinal,
}

/// One running backend instance
///
/// Shared read-only with every component for the whole run; only the
/// provisioner changes its state.
pub struct BackendHandle {
    run_id: String,
    kind: BackendKind,
    address: String,
    state: BackendState,
    clients: Arc<dyn BackendClients>,
    container: Option<ContainerAsync<Kafka>>,
}

impl BackendHandle {
    /// Unique identifier for this run
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Network address (`host:port`) clients connect to
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == BackendState::Running
    }

    /// Client factory, available only while the backend is running
    pub fn clients(&self) -> HarnessResult<Arc<dyn BackendClients>> {
        if !self.is_running() {
            return Err(HarnessError::unreachable(
                &self.address,
                format!("backend is {:?}", self.state),
            ));
        }
        Ok(Arc::clone(&self.clients))
    }

    /// Properties a client application needs to reach this backend
    pub fn config_overrides(&self) -> HashMap<String, String> {
        let mut overrides = HashMap::new();
        if self.is_running() {
            overrides.insert("bootstrap.servers".to_string(), self.address.clone());
        }
        overrides
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        if self.is_running() {
            log::warn!(
                "Backend {} dropped while running. Call stop() for clean shutdown.",
                self.address
            );
        }
    }
}

/// Starts and stops the backend for a run
pub struct BackendProvisioner {
    config: HarnessConfig,
    memory_broker: Option<InMemoryBroker>,
}

impl BackendProvisioner {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            memory_broker: None,
        }
    }

    /// Use this broker instead of a fresh one for the memory backend
    pub fn with_memory_broker(mut self, broker: InMemoryBroker) -> Self {
        self.memory_broker = Some(broker);
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Start the backend and wait until it accepts administrative connections
    pub async fn start(&self) -> HarnessResult<BackendHandle> {
        let bound = self.config.startup_timeout();
        let started = Instant::now();
        let run_id = generate_run_id();

        log::info!(
            "Starting {} backend (run_id: {}, startup bound: {:?})",
            self.config.backend.name(),
            run_id,
            bound
        );

        let (address, clients, container) = match self.config.backend {
            BackendKind::Kafka => {
                let tag = self.config.kafka_image_tag.clone();
                let launched = launch_within(
                    bound,
                    start_kafka_container(tag),
                    |(container, _): (ContainerAsync<Kafka>, String)| remove_container(container),
                )
                .await;
                let (container, address) = match launched {
                    Some(result) => result?,
                    None => {
                        return Err(HarnessError::StartupTimeout {
                            message: format!("{} did not start", self.config.backend.name()),
                            timeout_ms: bound.as_millis() as u64,
                        })
                    }
                };
                let clients: Arc<dyn BackendClients> =
                    Arc::new(KafkaClients::new(&address, &self.config));
                (address, clients, Some(container))
            }
            BackendKind::External => self.attach_external()?,
            BackendKind::Memory => self.memory_backend(),
        };

        let mut handle = BackendHandle {
            run_id,
            kind: self.config.backend,
            address,
            state: BackendState::Starting,
            clients,
            container,
        };

        if let Err(e) = self.wait_until_ready(&handle, started, bound).await {
            self.release(&mut handle).await;
            return Err(e);
        }

        handle.state = BackendState::Running;
        log::info!(
            "{} ready at {} after {:?}",
            self.config.backend.name(),
            handle.address,
            started.elapsed()
        );
        Ok(handle)
    }

    /// Release everything the handle owns; a second call is a no-op
    pub async fn stop(&self, handle: &mut BackendHandle) -> HarnessResult<()> {
        match handle.state {
            BackendState::Stopped | BackendState::StoppedFinal => {
                log::debug!("Backend {} already stopped", handle.address);
                Ok(())
            }
            BackendState::Starting | BackendState::Running => {
                log::info!(
                    "Stopping backend {} (run_id: {})",
                    handle.address,
                    handle.run_id
                );
                self.release(handle).await;
                log::info!("Backend stopped");
                Ok(())
            }
        }
    }

    fn attach_external(
        &self,
    ) -> HarnessResult<(String, Arc<dyn BackendClients>, Option<ContainerAsync<Kafka>>)> {
        let address = self.config.bootstrap_servers.clone().ok_or_else(|| {
            HarnessError::config("No bootstrap servers configured for the external backend")
        })?;
        log::info!("Attaching to external Kafka at {}", address);
        let clients: Arc<dyn BackendClients> = Arc::new(KafkaClients::new(&address, &self.config));
        Ok((address, clients, None))
    }

    fn memory_backend(&self) -> (String, Arc<dyn BackendClients>, Option<ContainerAsync<Kafka>>) {
        let broker = self.memory_broker.clone().unwrap_or_else(|| {
            InMemoryBroker::with_options(InMemoryOptions {
                nodes: self.config.memory_nodes,
                ..InMemoryOptions::default()
            })
        });
        let address = broker.address().to_string();
        let clients: Arc<dyn BackendClients> = Arc::new(broker);
        (address, clients, None)
    }

    async fn wait_until_ready(
        &self,
        handle: &BackendHandle,
        started: Instant,
        bound: Duration,
    ) -> HarnessResult<()> {
        let probe_interval = self.config.probe_interval();
        let mut last_error: Option<String> = None;
        let mut attempts = 0u32;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= bound {
                return Err(HarnessError::StartupTimeout {
                    message: format!(
                        "{} not accepting connections after {} probe(s){}",
                        handle.address,
                        attempts,
                        last_error
                            .map(|e| format!(": {}", e))
                            .unwrap_or_default()
                    ),
                    timeout_ms: bound.as_millis() as u64,
                });
            }

            let remaining = bound - elapsed;
            attempts += 1;
            let probe_timeout = remaining.min(MAX_PROBE_TIMEOUT);
            match tokio::time::timeout(remaining, handle.clients.probe(probe_timeout)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    log::debug!("Readiness probe {} failed: {}", attempts, e);
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    last_error = Some("probe did not answer".to_string());
                    continue;
                }
            }

            let remaining = bound.saturating_sub(started.elapsed());
            tokio::time::sleep(probe_interval.min(remaining)).await;
        }
    }

    async fn release(&self, handle: &mut BackendHandle) {
        handle.clients.shutdown().await;

        if let Some(container) = handle.container.take() {
            remove_container(container).await;
        }

        handle.state = BackendState::StoppedFinal;
    }
}

/// Start the Kafka container and resolve its bootstrap address
async fn start_kafka_container(
    tag: Option<String>,
) -> HarnessResult<(ContainerAsync<Kafka>, String)> {
    let container = match tag {
        Some(ref tag) => Kafka::default().with_tag(tag.as_str()).start().await,
        None => Kafka::default().start().await,
    }
    .map_err(|e| HarnessError::InfraError {
        message: format!("Failed to start Kafka container: {}", e),
        source: Some(e.to_string()),
    })?;

    let host_port = match container.get_host_port_ipv4(KAFKA_PORT).await {
        Ok(port) => port,
        Err(e) => {
            remove_container(container).await;
            return Err(HarnessError::InfraError {
                message: format!("Failed to get Kafka port: {}", e),
                source: Some(e.to_string()),
            });
        }
    };

    let address = format!("127.0.0.1:{}", host_port);
    log::info!("Kafka container started, bootstrap servers: {}", address);
    Ok((container, address))
}

async fn remove_container(container: ContainerAsync<Kafka>) {
    log::info!("Stopping Kafka container...");
    if let Err(e) = container.stop().await {
        log::warn!("Failed to stop Kafka container: {}", e);
    }
    if let Err(e) = container.rm().await {
        log::warn!("Failed to remove Kafka container: {}", e);
    }
    log::info!("Kafka container stopped and removed");
}

/// Run `launch` on its own task and wait at most `bound` for it
///
/// Returns `None` when the bound expires. The launch keeps running in that
/// case and whatever it eventually produces goes to `release`, so nothing it
/// started outlives the run.
async fn launch_within<T, F, R, RF>(
    bound: Duration,
    launch: F,
    release: R,
) -> Option<HarnessResult<T>>
where
    T: Send + 'static,
    F: Future<Output = HarnessResult<T>> + Send + 'static,
    R: FnOnce(T) -> RF + Send + 'static,
    RF: Future<Output = ()> + Send + 'static,
{
    let mut task = tokio::spawn(launch);
    match tokio::time::timeout(bound, &mut task).await {
        Ok(joined) => Some(
            joined
                .map_err(|e| HarnessError::InfraError {
                    message: "Backend launch task failed".to_string(),
                    source: Some(e.to_string()),
                })
                .and_then(|result| result),
        ),
        Err(_) => {
            log::warn!("Backend launch exceeded {:?}, releasing it once it completes", bound);
            tokio::spawn(async move {
                if let Ok(Ok(late)) = task.await {
                    release(late).await;
                }
            });
            None
        }
    }
}

/// Generate a short unique run ID
fn generate_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
