use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser as _;
use evmstack_app::prelude::*;
use evmstack_config::ServiceKind;
use evmstack_core::{
    lock::RunLock,
    orchestrator::Orchestrator,
    repair::{detect_dirty, recover, repair, verify_against_reference},
    runtime::{created_by_selector, ContainerRuntime, DockerRuntime, LogOptions, RuntimeError},
};
use evmstack_error::{find_in_chain, generic_error, ErrorContext as _, GenericError};
use futures::StreamExt as _;
use tracing::{error, info, warn};

mod config;
use self::config::{Action, CleanConfig, Cli, RepairConfig, StreamConfig, UpConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging("evmstackd", Some(cli.log_level())) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(cli).await {
        Ok(()) => info!("evmstackd stopped."),
        Err(e) => {
            error!("{:?}", e);
            if find_in_chain::<RuntimeError>(&e).is_some_and(RuntimeError::is_unreachable) {
                error!("Is the Docker daemon running? Containers from an earlier run can be removed with `evmstackd clean`.");
            }
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), GenericError> {
    info!("evmstackd starting...");

    let docker = DockerRuntime::connect_with_defaults()?;
    docker.ping().await?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    match cli.action {
        Action::Up(config) => {
            info!("User requested 'up'. Starting stack...");
            run_up(runtime, &cli.root, config).await
        }
        Action::Clean(config) => {
            info!("User requested 'clean'. Removing leftover containers...");
            run_clean(runtime.as_ref(), &cli.root, config).await
        }
        Action::Stream(config) => run_stream(runtime, &cli.root, config).await,
        Action::Repair(config) => {
            info!("User requested 'repair'. Checking node state...");
            run_repair(runtime, &cli.root, config).await
        }
    }
}

async fn run_up(runtime: Arc<dyn ContainerRuntime>, root: &Path, config: UpConfig) -> Result<(), GenericError> {
    let mut orchestrator = Orchestrator::load(runtime, root)?;
    if !config.services.is_empty() {
        orchestrator.config_mut().daemon.services = config.services;
    }
    if config.wait_sync {
        orchestrator.config_mut().daemon.wait_sync = true;
    }

    orchestrator.initialize().await?;
    orchestrator.start().await?;

    info!("Stack is up. Press Ctrl-C to stop.");
    wait_for_shutdown().await?;

    info!("Stopping stack...");
    orchestrator.stop().await?;
    Ok(())
}

async fn run_clean(runtime: &dyn ContainerRuntime, root: &Path, config: CleanConfig) -> Result<(), GenericError> {
    let removed = Orchestrator::clean(runtime, &created_by_selector(), config.network.as_deref()).await?;
    info!("Removed {} container(s).", removed);

    if RunLock::remove_stale(root)? {
        info!("Removed stale pid file.");
    }
    Ok(())
}

async fn run_stream(runtime: Arc<dyn ContainerRuntime>, root: &Path, config: StreamConfig) -> Result<(), GenericError> {
    let pid = RunLock::read_pid(root)?
        .ok_or_else(|| generic_error!("No daemon is running under '{}'.", root.display()))?;

    let mut orchestrator = Orchestrator::load(runtime, root)?.with_instance(pid.to_string());
    orchestrator.initialize_units()?;

    let mut lines = orchestrator.stream_logs(config.service, LogOptions::tail_then_follow(config.lines))?;
    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(line) => println!("{}", line?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn run_repair(runtime: Arc<dyn ContainerRuntime>, root: &Path, config: RepairConfig) -> Result<(), GenericError> {
    let mut orchestrator = Orchestrator::load(runtime, root)?;
    orchestrator.initialize().await?;

    let timeout = Duration::from_secs(config.detect_timeout);
    if !detect_dirty(&mut orchestrator, timeout).await? {
        info!("Node state is clean. Nothing to repair.");
        return Ok(());
    }

    warn!("Node state is dirty. Replaying history from the indexed data...");
    orchestrator
        .restart_service(ServiceKind::Search)
        .await
        .error_context("Failed to start the search engine for the replay.")?;
    let replay = repair(&mut orchestrator).await;
    orchestrator.stop().await?;
    let block = replay?;
    info!(block, "Replay finished.");

    if config.no_recover {
        return Ok(());
    }

    recover(&mut orchestrator).await?;
    if let Some(reference) = config.reference.as_deref() {
        let gateway = orchestrator.view().gateway_url();
        verify_against_reference(orchestrator.chain(), &gateway, reference).await?;
    }

    info!("Stack recovered. Press Ctrl-C to stop.");
    wait_for_shutdown().await?;

    info!("Stopping stack...");
    orchestrator.stop().await?;
    Ok(())
}

async fn wait_for_shutdown() -> Result<(), GenericError> {
    tokio::signal::ctrl_c()
        .await
        .error_context("Failed to listen for the shutdown signal.")
}
