//! Kafka Delivery Harness CLI
//!
//! Usage:
//!   velo-harness smoke
//!   velo-harness run plan.yaml --output json
//!   velo-harness validate plan.yaml

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use velo_kafka_harness::harness::config::{BackendKind, HarnessConfig};
use velo_kafka_harness::harness::plan::RunPlan;
use velo_kafka_harness::harness::report::{write_report, OutputFormat};
use velo_kafka_harness::harness::TestOrchestrator;

#[derive(Parser)]
#[command(name = "velo-harness")]
#[command(about = "Kafka producer/consumer delivery harness")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Harness configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by commands that provision a backend
#[derive(clap::Args)]
struct BackendArgs {
    /// Backend: kafka, external, memory
    #[arg(long)]
    backend: Option<String>,

    /// External Kafka bootstrap servers (implies --backend external)
    #[arg(long)]
    kafka: Option<String>,

    /// Upper bound on backend startup in milliseconds
    #[arg(long)]
    startup_timeout_ms: Option<u64>,

    /// Verification window in milliseconds for scenarios without their own
    #[arg(long)]
    within_ms: Option<u64>,

    /// Output format: text, json
    #[arg(short, long, default_value = "text")]
    output: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan
    Run {
        /// Path to the run plan YAML file
        plan: PathBuf,

        #[command(flatten)]
        backend: BackendArgs,
    },

    /// Publish "Hello, Kafka" to test_topic and read it back
    Smoke {
        #[command(flatten)]
        backend: BackendArgs,
    },

    /// Validate a plan without provisioning anything
    Validate {
        /// Path to the run plan YAML file
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Validate { plan } => match RunPlan::from_file(&plan) {
            Ok(plan) => {
                println!(
                    "✅ Plan '{}' is valid: {} topic(s), {} scenario(s)",
                    plan.name,
                    plan.topics.len(),
                    plan.scenarios.len()
                );
            }
            Err(e) => {
                eprintln!("❌ {}", e);
                std::process::exit(1);
            }
        },
        Commands::Run { plan, backend } => {
            let plan = match RunPlan::from_file(&plan) {
                Ok(plan) => plan,
                Err(e) => {
                    eprintln!("❌ {}", e);
                    std::process::exit(1);
                }
            };
            execute(cli.config, backend, plan).await;
        }
        Commands::Smoke { backend } => {
            execute(cli.config, backend, RunPlan::smoke()).await;
        }
    }

    Ok(())
}

async fn execute(config_path: Option<PathBuf>, args: BackendArgs, plan: RunPlan) {
    let format: OutputFormat = match args.output.parse() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let config = match build_config(config_path, &args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let orchestrator = TestOrchestrator::new(config);
    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling verification");
            token.cancel();
        }
    });

    let report = match orchestrator.run(&plan).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("❌ Run failed ({}): {}", e.kind(), e);
            std::process::exit(1);
        }
    };

    let mut stdout = std::io::stdout();
    if let Err(e) = write_report(&report, format, &mut stdout) {
        eprintln!("❌ Failed to write report: {}", e);
        std::process::exit(1);
    }

    if !report.success() {
        std::process::exit(1);
    }
}

/// Defaults, config file and environment, then command-line flags
fn build_config(
    config_path: Option<PathBuf>,
    args: &BackendArgs,
) -> velo_kafka_harness::harness::HarnessResult<HarnessConfig> {
    let mut config = HarnessConfig::load(config_path.as_deref())?;

    if let Some(ref backend) = args.backend {
        config.backend = BackendKind::parse(backend)?;
    }
    if let Some(ref servers) = args.kafka {
        config.bootstrap_servers = Some(servers.clone());
        if args.backend.is_none() {
            config.backend = BackendKind::External;
        }
    }
    if let Some(ms) = args.startup_timeout_ms {
        config.startup_timeout_ms = ms;
    }
    if let Some(ms) = args.within_ms {
        config.verify_within_ms = ms;
    }

    config.validate()?;
    Ok(config)
}
