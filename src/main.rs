#![allow(missing_docs)]

//! Meridian runtime entry point.
//!
//! `start` assembles the store, recovery, Scout/Sentinel providers, the
//! Gear runtime and the Axis scheduler, then runs until interrupted.
//! `verify-audit` checks the current month's audit chain and exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use meridian::audit::AuditLog;
use meridian::axis::Axis;
use meridian::config::MeridianConfig;
use meridian::gear::context::{InMemorySecrets, SecretValue};
use meridian::gear::inprocess::{BuiltinRegistry, FilesBuiltin, HttpBuiltin};
use meridian::gear::{GearAction, GearManifest, GearRuntime, SandboxLevel};
use meridian::pipeline::approval::ApprovalBroker;
use meridian::pipeline::{Orchestrator, TracingSink};
use meridian::scout::provider::backend_from_settings;
use meridian::scout::ScoutAdapter;
use meridian::sentinel::memory::SentinelMemory;
use meridian::sentinel::validator::LlmValidator;
use meridian::sentinel::Sentinel;
use meridian::store::Store;

/// Environment prefix for secrets seeded into the in-memory store.
const SECRET_ENV_PREFIX: &str = "MERIDIAN_SECRET_";

#[derive(Parser)]
#[command(name = "meridian", version, about = "Local automation runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full runtime.
    Start,
    /// Run boot-time recovery only and print the summary.
    Recover,
    /// Verify the current month's audit chain.
    VerifyAudit,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = MeridianConfig::load().context("failed to load configuration")?;

    match cli.command {
        Command::Start => start(config).await,
        Command::Recover => {
            meridian::logging::init_cli();
            let store = Store::open(&config.runtime.db_path).await?;
            let summary = meridian::axis::recovery::recover(&store).await?;
            info!(?summary, "recovery finished");
            Ok(())
        }
        Command::VerifyAudit => {
            meridian::logging::init_cli();
            let store = Store::open(&config.runtime.db_path).await?;
            let audit = AuditLog::new(store);
            let report = audit.verify(chrono::Utc::now()).await?;
            info!(table = %report.table, entries = report.entries, "audit chain verified");
            Ok(())
        }
    }
}

async fn start(config: MeridianConfig) -> Result<()> {
    let _guard = meridian::logging::init_production(&config.runtime.logs_dir)?;
    info!("meridian starting");

    let store = Store::open(&config.runtime.db_path)
        .await
        .context("failed to open database")?;
    let audit = AuditLog::new(store.clone());

    // Recovery runs before any worker can claim a job.
    let axis = Axis::new(&config, store.clone());
    let summary = axis.recover().await.context("recovery failed")?;
    if !summary.is_clean() {
        warn!(
            reset = summary.reset_job_ids.len(),
            stale_pipeline = summary.stale_pipeline_job_ids.len(),
            failed_entries = summary.failed_execution_entries,
            "recovered interrupted jobs"
        );
    }

    // Scout.
    let planner_backend = backend_from_settings(&config.llm.planner)
        .context("planner provider misconfigured")?;
    let scout = Arc::new(ScoutAdapter::new(planner_backend));
    let planner_family = scout.provider_family();

    // Sentinel, with its own provider family.
    let validator_backend = backend_from_settings(&config.llm.validator)
        .context("validator provider misconfigured")?;
    let sentinel = Arc::new(
        Sentinel::new(
            Box::new(LlmValidator::new(validator_backend)),
            SentinelMemory::new(store.clone()),
            config.trust.profile,
        )
        .with_planner_family(planner_family)
        .with_shell_gear_enabled(config.trust.shell_gear_enabled),
    );

    // Gear runtime: built-ins plus the container tier when available.
    let secrets = Arc::new(seed_secrets_from_env().await);
    let mut builtins = BuiltinRegistry::new();
    builtins.register("files", Arc::new(FilesBuiltin));
    builtins.register("http", Arc::new(HttpBuiltin));
    let gears = Arc::new(
        GearRuntime::new(
            config.sandbox.clone(),
            builtins,
            secrets,
            config.trust.shell_gear_enabled,
        )
        .await,
    );
    if gears.containers_available() {
        info!("container sandbox tier available");
    }

    // Approval boundary and pipeline.
    let approvals = Arc::new(ApprovalBroker::new(std::time::Duration::from_millis(
        config.runtime.approval_timeout_ms,
    )));
    let mut orchestrator = Orchestrator::new(
        &config.runtime,
        axis.queue().clone(),
        audit,
        scout,
        sentinel,
        Arc::clone(&approvals) as Arc<dyn meridian::sentinel::UserApproval>,
        gears,
        axis.breaker(),
        Arc::new(TracingSink),
        config.sandbox.workspace_dir.clone(),
    );
    orchestrator.register_gear(files_manifest());
    orchestrator.register_gear(http_manifest());
    let orchestrator = Arc::new(orchestrator);

    // Periodic sweep of expired approval requests.
    let sweep_broker = Arc::clone(&approvals);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(15)).await;
            sweep_broker.cleanup_expired().await;
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = axis.start(orchestrator, shutdown_rx);

    info!(workers = config.runtime.workers, "meridian ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    shutdown_tx.send(true).ok();
    axis.stop();
    for handle in handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(10), handle).await;
    }
    info!("meridian stopped");
    Ok(())
}

/// Seed the in-memory secret store from `MERIDIAN_SECRET_*` variables.
async fn seed_secrets_from_env() -> InMemorySecrets {
    let secrets = InMemorySecrets::new();
    for (key, value) in std::env::vars() {
        if let Some(name) = key.strip_prefix(SECRET_ENV_PREFIX) {
            secrets
                .put(name.to_lowercase(), SecretValue::new(value))
                .await;
        }
    }
    secrets
}

fn files_manifest() -> GearManifest {
    GearManifest {
        id: "files".to_owned(),
        description: "Read and write files inside the workspace".to_owned(),
        level: SandboxLevel::InProcess,
        actions: vec![
            GearAction {
                name: "read".to_owned(),
                description: "Read a workspace file".to_owned(),
            },
            GearAction {
                name: "write".to_owned(),
                description: "Write a workspace file".to_owned(),
            },
        ],
        entry: None,
        image: None,
        secrets: Vec::new(),
        limits: None,
        allow_host_exec: false,
    }
}

fn http_manifest() -> GearManifest {
    GearManifest {
        id: "http".to_owned(),
        description: "Fetch a URL over HTTP GET".to_owned(),
        level: SandboxLevel::InProcess,
        actions: vec![GearAction {
            name: "get".to_owned(),
            description: "Fetch a URL".to_owned(),
        }],
        entry: None,
        image: None,
        secrets: Vec::new(),
        limits: None,
        allow_host_exec: false,
    }
}
