//! Stratos agent binary - compute provider for a decentralized marketplace

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratos::accountant::Accountant;
use stratos::compiler::{HttpModelResolver, WorkloadCompiler};
use stratos::config::{ProviderConfig, ResourcePolicy};
use stratos::context::ProviderContext;
use stratos::lifecycle::{
    intake_channel, spawn_expiry_watchdog, spawn_namespace_reclaimer, EngineArtifactCleaner,
    JobTracker, LifecycleManager, ProviderAgent,
};
use stratos::upstream::MarketplaceClient;
use stratos::{PROVIDER_STATUS_INTERVAL, RESOURCE_REPORT_INTERVAL};

/// Stratos - compute-provider agent for a decentralized compute marketplace
#[derive(Parser, Debug)]
#[command(name = "stratos", version, about, long_about = None)]
struct Cli {
    /// Provider repo directory holding config.toml and resource_policy.json
    #[arg(long, env = "STRATOS_REPO", default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the provider agent (default mode)
    ///
    /// Starts the lifecycle manager, the resource and admission reporting
    /// loops, and both watchdogs. The request-intake HTTP layer is a separate
    /// process that drives this agent through the library interface.
    Run,

    /// Evaluate the admission policy once and print the verdict
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = ProviderConfig::load(&cli.repo)?;

    match cli.command {
        Some(Commands::Check) => run_check(cli.repo, config).await,
        Some(Commands::Run) | None => run_agent(cli.repo, config).await,
    }
}

/// One-shot admission evaluation
async fn run_check(repo: PathBuf, config: ProviderConfig) -> anyhow::Result<()> {
    let context = ProviderContext::initialize(config).await?;
    let policy = ResourcePolicy::load(&repo)?;
    let accountant = Accountant::new(context.cluster.clone(), context.reservations.clone());
    let status = accountant.admission_status(&policy).await?;
    println!("{}", status);
    Ok(())
}

/// Run the full agent supervisor
async fn run_agent(repo: PathBuf, config: ProviderConfig) -> anyhow::Result<()> {
    let context = ProviderContext::initialize(config).await?;
    info!(
        node_id = %context.config.api.node_id,
        region = %context.region,
        "stratos provider agent starting"
    );

    let upstream = MarketplaceClient::new(
        context.http.clone(),
        context.config.marketplace.server_url.clone(),
        context.config.marketplace.access_token.clone(),
        context.config.api.node_id.clone(),
        context.config.provider_name(),
        context.config.api.multi_address.clone(),
    );

    let accountant = Accountant::new(context.cluster.clone(), context.reservations.clone());

    // One label-sync pass up front so GPU node selectors can match
    {
        let accountant = accountant.clone();
        tokio::spawn(async move {
            if let Err(e) = accountant.sync_node_gpu_labels().await {
                error!(error = %e, "node GPU label sync failed");
            }
        });
    }

    // Cluster resource summaries
    {
        let accountant = accountant.clone();
        let upstream = upstream.clone();
        let region = context.region.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESOURCE_REPORT_INTERVAL);
            loop {
                ticker.tick().await;
                match accountant.snapshot().await {
                    Ok(nodes) => {
                        if let Err(e) = upstream.report_cluster_resource(&region, nodes).await {
                            warn!(error = %e, "cluster summary report failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping summary cycle: snapshot failed"),
                }
            }
        });
    }

    // Admission status heartbeat; the policy file is re-read on every tick so
    // operator changes take effect without a restart
    {
        let accountant = accountant.clone();
        let upstream = upstream.clone();
        let repo = repo.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROVIDER_STATUS_INTERVAL);
            loop {
                ticker.tick().await;
                let policy = match ResourcePolicy::load(&repo) {
                    Ok(policy) => policy,
                    Err(e) => {
                        warn!(error = %e, "skipping admission push: policy unreadable");
                        continue;
                    }
                };
                match accountant.admission_status(&policy).await {
                    Ok(status) => {
                        if let Err(e) = upstream.push_provider_status(status).await {
                            warn!(error = %e, "admission status push failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping admission push: evaluation failed"),
                }
            }
        });
    }

    let _expiry = spawn_expiry_watchdog(context.cluster.clone(), context.store.clone());
    let _reclaimer =
        spawn_namespace_reclaimer(context.cluster.clone(), Arc::new(EngineArtifactCleaner));

    let (intake_tx, intake_rx) = intake_channel();
    let tracker = JobTracker::new();

    let introspection_url = if context.config.marketplace.introspection_url.is_empty() {
        context.config.marketplace.server_url.clone()
    } else {
        context.config.marketplace.introspection_url.clone()
    };
    let resolver = Arc::new(HttpModelResolver::new(
        context.http.clone(),
        introspection_url,
    ));
    let compiler = Arc::new(WorkloadCompiler::new(
        context.cluster.clone(),
        context.store.clone(),
        context.http.clone(),
        resolver,
        intake_tx.clone(),
        context.config.registry.server_address.clone(),
    ));

    // The agent handle is what the (external) request-intake layer drives;
    // it also keeps the intake sender alive for the manager below.
    let agent = ProviderAgent::new(
        compiler,
        context.cluster.clone(),
        context.store.clone(),
        accountant,
        context.reservations.clone(),
        tracker.clone(),
        intake_tx,
        context.config.api.domain.clone(),
    );

    match agent.cluster_snapshot().await {
        Ok(nodes) => info!(nodes = nodes.len(), "cluster inventory ready"),
        Err(e) => warn!(error = %e, "initial cluster snapshot failed"),
    }

    let manager = LifecycleManager::new(
        tracker,
        intake_rx,
        upstream,
        context.http.clone(),
    );
    let manager_handle = tokio::spawn(manager.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    manager_handle.abort();
    drop(agent);
    Ok(())
}
