//! Recovery of a node whose state database was left dirty by an unclean shutdown.
//!
//! The procedure runs in four steps, each of which can be invoked on its own:
//!
//! 1. [`detect_dirty`]: relaunch the node without gating or startup logic and look for the dirty-state marker in its
//!    most recent log lines.
//! 2. [`repair`]: find the highest block the indexer stored, replay the node's block log up to exactly that block in a
//!    one-shot container, and resume indexing from the block after it.
//! 3. [`recover`]: bring the whole stack back up, gateway included.
//! 4. [`verify_against_reference`]: check the gateway agrees with a reference endpoint on the hash of its latest block.

use std::time::Duration;

use evmstack_config::{BlockRef, NodeConfig, ServiceKind};
use serde_json::Value;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::{info, warn};

use crate::{
    chain::{ChainClient, ChainError},
    orchestrator::Orchestrator,
    readiness::{GateOutcome, ReadinessGate},
    runtime::{LogOptions, RuntimeError},
    unit::DIRTY_STATE_PHRASE,
    OrchestratorError,
};

/// Number of recent node log lines searched for the dirty-state marker.
const DIRTY_SCAN_LINES: usize = 10;

/// A repair error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RepairError {
    /// The search engine holds no indexed blocks, so there is no block to repair up to.
    #[snafu(display("No indexed blocks found. Nothing to repair."))]
    NothingToRepair,

    /// A stack operation failed.
    #[snafu(display("Stack operation failed during repair."))]
    Orchestration {
        /// Error source.
        source: OrchestratorError,
    },

    /// An HTTP query failed.
    #[snafu(display("Query failed during repair."))]
    Query {
        /// Error source.
        source: ChainError,
    },

    /// The node logs could not be read.
    #[snafu(display("Failed to read node logs."))]
    NodeLogs {
        /// Error source.
        source: RuntimeError,
    },

    /// The repair container could not be run.
    #[snafu(display("Failed to run repair container."))]
    RepairRun {
        /// Error source.
        source: RuntimeError,
    },

    /// The repair container exited with a non-zero code.
    #[snafu(display("Repair container exited with code {}.", code))]
    RepairExited {
        /// Exit code.
        code: i64,
    },

    /// A block returned by an endpoint lacked a field.
    #[snafu(display("Block from '{}' has no '{}'.", endpoint, field))]
    MalformedBlock {
        /// Endpoint queried.
        endpoint: String,

        /// Missing field.
        field: &'static str,
    },

    /// The gateway and the reference endpoint disagree on a block hash.
    #[snafu(display("Hash mismatch at block {}: local {}, reference {}.", block, local, reference))]
    HashMismatch {
        /// Block number, as a hex quantity.
        block: String,

        /// Hash reported by the gateway.
        local: String,

        /// Hash reported by the reference endpoint.
        reference: String,
    },
}

/// Relaunches the node with API checks and readiness gating disabled, then searches its most recent log lines for
/// the dirty-state marker, giving up after `timeout`.
///
/// The node is stopped again afterwards, and both settings are restored. Returns `true` if the marker was found.
///
/// # Errors
///
/// If the node cannot be relaunched, its logs cannot be read, or it cannot be stopped, an error will be returned.
pub async fn detect_dirty(orchestrator: &mut Orchestrator, timeout: Duration) -> Result<bool, RepairError> {
    let node = &mut orchestrator.config_mut().node;
    let saved = (node.api_check, node.common.wait_startup);
    node.api_check = false;
    node.common.wait_startup = false;

    let result = scan_for_dirty_state(orchestrator, timeout).await;

    let node = &mut orchestrator.config_mut().node;
    (node.api_check, node.common.wait_startup) = saved;
    result
}

async fn scan_for_dirty_state(orchestrator: &mut Orchestrator, timeout: Duration) -> Result<bool, RepairError> {
    orchestrator
        .relaunch_service(ServiceKind::Node)
        .await
        .context(Orchestration)?;

    let lines = orchestrator
        .stream_logs(ServiceKind::Node, LogOptions::tail_then_follow(DIRTY_SCAN_LINES))
        .context(Orchestration)?;
    let outcome = ReadinessGate::new(DIRTY_STATE_PHRASE, timeout)
        .with_echo(true)
        .wait(lines)
        .await
        .context(NodeLogs)?;
    let dirty = outcome == GateOutcome::Found;
    info!(dirty, "Checked node state.");

    orchestrator.stop().await.context(Orchestration)?;
    Ok(dirty)
}

fn repair_command(node: &NodeConfig, block: u64) -> String {
    let mut command = vec![
        node.node_bin.clone(),
        "--config=/root/config.ini".to_string(),
        format!("--data-dir={}", node.data_path_guest),
    ];
    command.extend(node.repair_args.iter().cloned());
    command.push(format!("--terminate-at-block={}", block));
    command.extend([">>".to_string(), format!("/logs/{}", node.logs_file), "2>&1".to_string()]);
    command.join(" ")
}

/// Repairs the node state up to the highest block stored in the search engine, which must be reachable.
///
/// Returns the block the indexer resumes from.
///
/// # Errors
///
/// If nothing is indexed yet, the search engine cannot be queried, or [`repair_at`] fails, an error will be returned.
pub async fn repair(orchestrator: &mut Orchestrator) -> Result<u64, RepairError> {
    let view = orchestrator.view();
    let pattern = format!(
        "{}-delta-{}-*",
        view.config.chain_name(),
        view.config.rpc.index_version
    );
    let last = orchestrator
        .chain()
        .max_indexed_block(&view.search_url(), &pattern)
        .await
        .context(Query)?
        .context(NothingToRepair)?;
    info!(block = last, "Highest indexed block found.");

    repair_at(orchestrator, last).await
}

/// Replays the node's block log up to `block` in a one-shot container, then records `block + 1` as the indexer's start
/// block and persists the configuration.
///
/// The node unit is stopped and rebuilt first. The one-shot container shares the node's mounts and runs the node
/// binary with the configured `repair_args` and `--terminate-at-block=<block>`.
///
/// Returns the block the indexer resumes from.
///
/// # Errors
///
/// If the node cannot be rebuilt, the container cannot be run, or it exits with a non-zero code, an error will be
/// returned.
pub async fn repair_at(orchestrator: &mut Orchestrator, block: u64) -> Result<u64, RepairError> {
    orchestrator
        .rebuild_service(ServiceKind::Node)
        .await
        .context(Orchestration)?;

    let view = orchestrator.view();
    let unit = orchestrator
        .unit(ServiceKind::Node)
        .context(crate::error::UnknownService {
            service: ServiceKind::Node,
        })
        .context(Orchestration)?;

    let mut spec = unit.container_spec(&view).context(Orchestration)?;
    spec.name = format!("{}-repair", spec.name);
    spec.published_ports.clear();

    let shell = repair_command(&view.config.node, block);
    info!("Repair command: \"{}\"", shell);
    spec.command = Some(vec!["/bin/bash".to_string(), "-c".to_string(), shell]);

    let runtime = orchestrator.runtime();
    runtime.run_container(&spec).await.context(RepairRun)?;
    let code = runtime.wait_container(&spec.name).await.context(RepairRun)?;
    if let Err(e) = runtime.remove_container(&spec.name).await {
        warn!(error = %e, "Failed to remove repair container '{}'.", spec.name);
    }
    if code != 0 {
        return RepairExited { code }.fail();
    }

    let resume = block + 1;
    orchestrator.config_mut().indexer.start_block = BlockRef::At(resume);
    orchestrator.write_config().context(Orchestration)?;
    info!(resume, "Node state repaired. Indexer will resume from the next block.");
    Ok(resume)
}

/// Brings the stack back up after a repair: reloads the persisted configuration, adds the gateway to the active
/// services if missing, then initializes and starts the stack.
///
/// # Errors
///
/// If the configuration cannot be reloaded, or the stack fails to start, an error will be returned.
pub async fn recover(orchestrator: &mut Orchestrator) -> Result<(), RepairError> {
    orchestrator.reload_config().context(Orchestration)?;

    let services = &mut orchestrator.config_mut().daemon.services;
    if !services.contains(&ServiceKind::Rpc) {
        services.push(ServiceKind::Rpc);
    }

    orchestrator.initialize().await.context(Orchestration)?;
    orchestrator.start().await.context(Orchestration)
}

fn block_field<'a>(block: &'a Value, endpoint: &str, field: &'static str) -> Result<&'a str, RepairError> {
    block
        .get(field)
        .and_then(Value::as_str)
        .context(MalformedBlock { endpoint, field })
}

/// Compares the hash of the gateway's latest block with the same block from a reference endpoint.
///
/// Returns the block number compared, as a hex quantity.
///
/// # Errors
///
/// If either endpoint cannot be queried, a block lacks its number or hash, or the hashes differ, an error will be
/// returned.
pub async fn verify_against_reference(
    chain: &ChainClient, gateway: &str, reference: &str,
) -> Result<String, RepairError> {
    let latest = chain
        .eth_get_block_by_number(gateway, "latest")
        .await
        .context(Query)?;
    let number = block_field(&latest, gateway, "number")?;
    let local = block_field(&latest, gateway, "hash")?;

    let remote = chain
        .eth_get_block_by_number(reference, number)
        .await
        .context(Query)?;
    let remote_hash = block_field(&remote, reference, "hash")?;

    if local != remote_hash {
        return HashMismatch {
            block: number,
            local,
            reference: remote_hash,
        }
        .fail();
    }

    info!(block = number, hash = local, "Gateway agrees with reference endpoint.");
    Ok(number.to_string())
}
