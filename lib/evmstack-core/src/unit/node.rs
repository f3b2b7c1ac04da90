use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable as _};
use evmstack_config::{template::Template, write_config, BlockRef, Substitution, Substitutions};
use evmstack_error::{generic_error, ErrorContext as _, GenericError};
use futures::{future, stream, StreamExt as _};
use tracing::{debug, info, warn};

use super::{LaunchPlan, Readiness, ServiceBehavior, StackView, StartContext, TemplateFile, UnitLayout};
use crate::{
    chain::ChainError,
    logs::{follow_file, node_lines, LogLines, FILE_POLL_INTERVAL},
    readiness::{GateOutcome, ReadinessGate},
    runtime::{ContainerRuntime, LogOptions, Mount, RuntimeError},
};

/// Logged by a node that finds its state database was not closed cleanly.
pub const DIRTY_STATE_PHRASE: &str = "database dirty flag set (likely due to unclean shutdown)";

const FIRST_BOOT_PHRASE: &str = "Done storing initial state on startup";
const PRODUCED_PHRASE: &str = "Produced block";
const RECEIVED_PHRASE: &str = "Received block";
const FRESH_CHAIN_PHRASE: &str = "Initializing new blockchain with genesis state";
const EXIT_PHRASE: &str = "nodeos successfully exiting";

const READINESS_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const FIRST_BLOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const EXIT_TIMEOUT: Duration = Duration::from_secs(60);
const API_CHECK_DELAY: Duration = Duration::from_secs(1);
const API_CHECK_ATTEMPTS: usize = 60;
const SYNC_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

const MEMORY_LIMIT: i64 = 6 * 1024 * 1024 * 1024;
const CONTRACTS_GUEST_DIR: &str = "/opt/eosio/bin/contracts";

const INI_TEMPLATE: &str = "config/nodeos.config.ini";
const LOCAL_INI_TEMPLATE: &str = "config/nodeos.local.config.ini";

const TEMPLATES: &[TemplateFile] = &[
    TemplateFile::text("docker/nodeos/build/Dockerfile", "build/Dockerfile"),
    TemplateFile::text("config/logrotate.conf", "config/logrotate.conf"),
];

/// Blockchain node.
///
/// The node logs to a file in its logs directory rather than to its container output, so every log consumer reads
/// that file.
#[derive(Default)]
pub(super) struct Node {
    relaunch: bool,
}

/// Returns `true` if the node's data directory already holds a block log directory.
fn is_relaunch(layout: &UnitLayout) -> bool {
    layout
        .data_dir()
        .map(|dir| dir.join("blocks").is_dir())
        .unwrap_or(false)
}

fn log_path(layout: &UnitLayout, view: &StackView<'_>) -> Result<PathBuf, GenericError> {
    Ok(layout.logs_dir()?.join(&view.config.node.logs_file))
}

fn render_file(path: &Path, subst: &Substitutions) -> Result<String, GenericError> {
    let source =
        std::fs::read_to_string(path).with_error_context(|| format!("Failed to read template '{}'.", path.display()))?;
    Template::parse(&source)
        .and_then(|template| template.render(subst))
        .with_error_context(|| format!("Failed to render template '{}'.", path.display()))
}

/// Assembles the node's `config.ini`: the base template, the local-chain template on local chains, then plugins,
/// contract substitutions, and peers.
fn render_ini(view: &StackView<'_>, subst: &Substitutions) -> Result<String, GenericError> {
    let templates_dir = view.templates_dir();
    let ini = &view.config.node.ini;

    let mut out = render_file(&templates_dir.join(INI_TEMPLATE), subst)?;
    out.push('\n');
    if view.config.profile().is_local() {
        out.push_str(&render_file(&templates_dir.join(LOCAL_INI_TEMPLATE), subst)?);
        out.push('\n');
    }

    for plugin in &ini.plugins {
        out.push_str(&format!("plugin = {}\n", plugin));
    }

    if let Some(substitution) = &ini.subst {
        out.push_str("plugin = eosio::subst_plugin\n\n");
        match substitution {
            Substitution::Manifest(manifest) => out.push_str(&format!("subst-manifest = {}\n", manifest)),
            Substitution::ByName(contracts) => {
                for (account, code) in contracts {
                    out.push_str(&format!("subst-by-name = {}:{}\n", account, code));
                }
            }
        }
    }
    out.push('\n');

    for peer in &ini.peers {
        out.push_str(&format!("p2p-peer-address = {}\n", peer));
    }

    Ok(out)
}

fn expect_found(outcome: Result<GateOutcome, RuntimeError>, phrase: &str) -> Result<(), GenericError> {
    match outcome.error_context("Failed to read node logs.")? {
        GateOutcome::Found => Ok(()),
        GateOutcome::StreamEnded => Err(generic_error!("Node logs ended before \"{}\" appeared.", phrase)),
        GateOutcome::TimedOut => Err(generic_error!("Timed out waiting for \"{}\" in node logs.", phrase)),
    }
}

/// Runs the operator's boot commands on a fresh local chain, then records the current head as the block the
/// indexer starts from.
async fn bootstrap(ctx: &mut StartContext<'_>) -> Result<(), GenericError> {
    info!("Fresh chain detected. Running boot sequence...");
    for command in &ctx.config.node.boot_commands {
        let output = ctx
            .runtime
            .exec(ctx.container, command)
            .await
            .with_error_context(|| format!("Failed to run boot command '{}'.", command.join(" ")))?;
        if !output.success() {
            return Err(generic_error!(
                "Boot command '{}' exited with {:?}: {}",
                command.join(" "),
                output.exit_code,
                output.output
            ));
        }
        debug!(command = %command.join(" "), "Boot command finished.");
    }

    let api = ctx.view().node_api_url();
    let head = ctx
        .chain
        .head_block(&api)
        .await
        .error_context("Failed to read head block after boot.")?;
    info!(block = head, "Boot sequence done. Recording deploy block.");

    ctx.config.indexer.start_block = BlockRef::At(head);
    ctx.config.indexer.deploy_block = BlockRef::At(head);
    write_config(ctx.config, ctx.config_path).error_context("Failed to persist deploy block.")?;
    Ok(())
}

async fn api_check(ctx: &StartContext<'_>) -> Result<(), GenericError> {
    let api = ctx.view().node_api_url();
    let (chain, url) = (ctx.chain, api.as_str());
    (move || async move { chain.get_info(url).await })
        .retry(
            ConstantBuilder::default()
                .with_delay(API_CHECK_DELAY)
                .with_max_times(API_CHECK_ATTEMPTS),
        )
        .when(ChainError::is_connect)
        .notify(|e, delay| warn!(error = %e, "Node API not reachable. Retrying in {:?}...", delay))
        .await
        .error_context("Node API did not come up.")?;
    Ok(())
}

/// Waits until the node's head reaches the block before the indexer's start block, logging sync speed.
async fn sync_to_start_block(ctx: &StartContext<'_>) -> Result<(), GenericError> {
    let Some(start_block) = ctx.config.indexer.start_block.number() else {
        debug!("Indexer start block not resolved yet. Not waiting for sync.");
        return Ok(());
    };
    let sync_until = start_block.saturating_sub(1);
    let api = ctx.view().node_api_url();

    info!(sync_until, "Waiting for node to sync up to the indexer start block...");
    let mut head = ctx.chain.head_block(&api).await.error_context("Failed to read head block.")?;
    while head < sync_until {
        let before = head;
        tokio::time::sleep(SYNC_SAMPLE_INTERVAL).await;
        head = ctx.chain.head_block(&api).await.error_context("Failed to read head block.")?;

        let speed = head.saturating_sub(before) as f64 / SYNC_SAMPLE_INTERVAL.as_secs_f64();
        info!(remaining = sync_until.saturating_sub(head), speed, "Node syncing...");
    }
    Ok(())
}

#[async_trait]
impl ServiceBehavior for Node {
    fn templates(&self) -> &'static [TemplateFile] {
        TEMPLATES
    }

    fn configure(
        &mut self, view: &StackView<'_>, layout: &UnitLayout, subst: &mut Substitutions,
    ) -> Result<(), GenericError> {
        self.relaunch = is_relaunch(layout);
        let node = &view.config.node;

        subst.insert("nodeos_port", node.ini.http_addr.port);
        subst.insert("nodeos_log_path", format!("/logs/{}", node.logs_file));
        subst.insert("nodeos_history_port", node.ini.history_endpoint.port);
        subst.extend_unprefixed(&serde_json::to_value(&node.ini)?);

        let ini = render_ini(view, subst)?;
        let target = layout.config_dir()?.join("config.ini");
        std::fs::write(&target, ini).with_error_context(|| format!("Failed to write '{}'.", target.display()))?;
        debug!(relaunch = self.relaunch, "Wrote '{}'.", target.display());
        Ok(())
    }

    fn prepare(&self, view: &StackView<'_>, layout: &UnitLayout) -> Result<LaunchPlan, GenericError> {
        let node = &view.config.node;
        let data_dir = layout.data_dir()?;
        let contracts_dir = layout.service_dir().join(&node.contracts_dir);
        std::fs::create_dir_all(&contracts_dir)
            .with_error_context(|| format!("Failed to create '{}'.", contracts_dir.display()))?;

        let mut command = vec![
            node.node_bin.clone(),
            "--config=/root/config.ini".to_string(),
            format!("--data-dir={}", node.data_path_guest),
            "--disable-replay-opts".to_string(),
            "--logconf=/root/logging.json".to_string(),
        ];
        if !self.relaunch && !data_dir.join("blocks/blocks.log").is_file() {
            if let Some(snapshot) = &node.snapshot {
                command.push(format!("--snapshot={}", snapshot));
            } else if let Some(genesis) = &node.genesis {
                command.push(format!("--genesis-json=/root/genesis/{}.json", genesis));
            }
        }
        if !node.space_monitor {
            command.push("--resource-monitor-not-shutdown-on-threshold-exceeded".to_string());
        }
        if node.produce {
            command.extend(["-e", "-p", "eosio"].map(String::from));
        }
        command.extend([">>".to_string(), format!("/logs/{}", node.logs_file), "2>&1".to_string()]);

        let shell = command.join(" ");
        info!("Node command: \"{}\"", shell);

        Ok(LaunchPlan {
            mounts: vec![
                Mount::bind(layout.config_dir()?, "/root"),
                Mount::bind(layout.logs_dir()?, "/logs"),
                Mount::bind(contracts_dir, CONTRACTS_GUEST_DIR),
                Mount::bind(data_dir, node.data_path_guest.as_str()),
            ],
            published_ports: vec![node.ini.http_addr.port, node.ini.history_endpoint.port],
            command: Some(vec!["/bin/bash".to_string(), "-c".to_string(), shell]),
            memory_limit: view.topology.is_private().then_some(MEMORY_LIMIT),
            ..Default::default()
        })
    }

    fn readiness(&self, view: &StackView<'_>) -> Option<Readiness> {
        let phrase = if !self.relaunch {
            FIRST_BOOT_PHRASE
        } else if view.config.node.produce {
            PRODUCED_PHRASE
        } else {
            RECEIVED_PHRASE
        };
        Some(Readiness {
            phrase,
            timeout: READINESS_TIMEOUT,
            from_latest: true,
        })
    }

    fn log_lines(
        &self, _runtime: &dyn ContainerRuntime, _container: &str, layout: &UnitLayout, view: &StackView<'_>,
        options: LogOptions,
    ) -> LogLines {
        match log_path(layout, view) {
            Ok(path) => node_lines(follow_file(path, options.tail, FILE_POLL_INTERVAL)),
            Err(e) => stream::once(future::ready(Err(RuntimeError::Other { message: e.to_string() }))).boxed(),
        }
    }

    async fn start(&self, ctx: &mut StartContext<'_>) -> Result<(), GenericError> {
        let path = log_path(ctx.layout, &ctx.view())?;

        // The log file is appended to across launches. A relaunch only looks at what this launch writes.
        let tail = self.relaunch.then_some(0);

        if ctx.config.profile().is_local() && ctx.config.node.initialize {
            info!("Waiting for node to produce a block...");
            let mut fresh = false;
            let lines = node_lines(follow_file(path, tail, FILE_POLL_INTERVAL));
            let outcome = ReadinessGate::new(PRODUCED_PHRASE, FIRST_BLOCK_TIMEOUT)
                .scan(lines, |line| fresh |= line.contains(FRESH_CHAIN_PHRASE))
                .await;
            expect_found(outcome, PRODUCED_PHRASE)?;

            if fresh && !self.relaunch {
                bootstrap(ctx).await?;
            }
        } else {
            info!("Waiting for node to receive a block...");
            let lines = node_lines(follow_file(path, tail, FILE_POLL_INTERVAL));
            let outcome = ReadinessGate::new(RECEIVED_PHRASE, FIRST_BLOCK_TIMEOUT).wait(lines).await;
            expect_found(outcome, RECEIVED_PHRASE)?;
        }

        if ctx.config.node.api_check {
            api_check(ctx).await?;
        }

        if !self.relaunch {
            sync_to_start_block(ctx).await?;
        }

        Ok(())
    }

    async fn before_stop(
        &self, runtime: &dyn ContainerRuntime, container: &str, layout: &UnitLayout, view: &StackView<'_>,
    ) -> Result<(), GenericError> {
        let command = ["pkill", "-f", view.config.node.node_bin.as_str()].map(String::from);
        let output = runtime
            .exec(container, &command)
            .await
            .error_context("Failed to signal node process.")?;
        info!(exit_code = ?output.exit_code, "Asked node process to exit.");

        let lines = node_lines(follow_file(log_path(layout, view)?, Some(10), FILE_POLL_INTERVAL));
        let gate = ReadinessGate::new(EXIT_PHRASE, EXIT_TIMEOUT).with_echo(true);
        match gate.wait(lines).await.error_context("Failed to read node logs.")? {
            GateOutcome::Found => info!("Node exited cleanly."),
            _ => warn!("Node did not report a clean exit within {:?}.", EXIT_TIMEOUT),
        }
        Ok(())
    }
}
