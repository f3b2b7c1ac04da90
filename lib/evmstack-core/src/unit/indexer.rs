use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use evmstack_config::{ServiceKind, Substitutions};
use evmstack_error::{generic_error, ErrorContext as _, GenericError};
use futures::StreamExt as _;
use regex::Regex;
use tokio::time::Instant;
use tracing::info;

use super::{LaunchPlan, Readiness, ServiceBehavior, StackView, StartContext, TemplateFile, UnitLayout};
use crate::{logs::decode_lines, runtime::LogOptions};

const TEMPLATES: &[TemplateFile] = &[TemplateFile::text("docker/translator/build/Dockerfile", "build/Dockerfile")];

const READINESS_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// The indexer counts as caught up once it is this many blocks behind the remote head.
const SYNC_THRESHOLD: i64 = 100;

const PROGRESS_MARKER: &str = "] pushed, at ";

static PROGRESS_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r": \[([^|]*)\|").unwrap()
});

/// Chain-history indexer.
pub(super) struct Indexer;

/// Extracts the block number from an indexer progress line, such as
/// `... 10 blocks] pushed, at 1,234/s: [181,245,010|0x1a2b...]`.
///
/// Returns `None` for any other line, or when the number is not known yet.
fn indexed_block(line: &str) -> Option<u64> {
    if !line.contains(PROGRESS_MARKER) {
        return None;
    }

    let mut captures = PROGRESS_BLOCK.captures_iter(line);
    let block = captures.next()?.get(1)?.as_str();
    if captures.next().is_some() || block == "NaN" {
        return None;
    }
    block.replace(',', "").trim().parse().ok()
}

fn remote_endpoint(view: &StackView<'_>) -> Option<String> {
    view.config
        .daemon
        .remote_endpoint
        .clone()
        .or_else(|| view.config.profile().remote_endpoint().map(str::to_string))
}

/// Follows the indexer's progress until it is within [`SYNC_THRESHOLD`] blocks of the remote chain head.
async fn await_full_index(ctx: &StartContext<'_>) -> Result<(), GenericError> {
    let view = ctx.view();
    let remote = remote_endpoint(&view).ok_or_else(|| generic_error!("No remote endpoint to sync against."))?;
    let refresh = Duration::from_secs(view.config.daemon.remote_head_refresh);

    let mut remote_head = ctx
        .chain
        .head_block(&remote)
        .await
        .error_context("Failed to read remote head block.")?;
    let node_head = ctx
        .chain
        .head_block(&view.node_api_url())
        .await
        .with_error_context(|| format!("Failed to read {} head block.", ServiceKind::Node))?;
    let mut delta = remote_head as i64 - node_head as i64;
    let mut refreshed_at = Instant::now();

    let mut lines = decode_lines(ctx.runtime.logs(ctx.container, LogOptions::tail_then_follow(100)));
    while let Some(line) = lines.next().await {
        let line = line.error_context("Failed to read indexer logs.")?;
        if let Some(block) = indexed_block(&line) {
            delta = remote_head as i64 - block as i64;
        }
        info!(delta, "Waiting on indexer sync...");

        if delta < SYNC_THRESHOLD {
            info!("Indexer caught up with the remote chain.");
            return Ok(());
        }

        if refreshed_at.elapsed() > refresh {
            remote_head = ctx
                .chain
                .head_block(&remote)
                .await
                .error_context("Failed to refresh remote head block.")?;
            refreshed_at = Instant::now();
        }
    }

    Err(generic_error!("Indexer logs ended before it caught up."))
}

#[async_trait]
impl ServiceBehavior for Indexer {
    fn templates(&self) -> &'static [TemplateFile] {
        TEMPLATES
    }

    fn configure(
        &mut self, view: &StackView<'_>, _layout: &UnitLayout, subst: &mut Substitutions,
    ) -> Result<(), GenericError> {
        subst.insert("broadcast_port", view.config.rpc.indexer_websocket_port);
        Ok(())
    }

    fn prepare(&self, view: &StackView<'_>, _layout: &UnitLayout) -> Result<LaunchPlan, GenericError> {
        let config = view.config;
        let indexer = &config.indexer;
        let rpc = &config.rpc;
        let node_host = view.address_of(ServiceKind::Node);

        let endpoint = view.node_api_url();
        let remote = remote_endpoint(view).unwrap_or_else(|| endpoint.clone());
        let history = format!("ws://{}:{}", node_host, config.node.ini.history_endpoint.port);

        let plan = LaunchPlan {
            published_ports: vec![rpc.indexer_websocket_port],
            ..Default::default()
        };
        Ok(plan
            .with_env("CHAIN_NAME", config.chain_name())
            .with_env("CHAIN_ID", rpc.chain_id)
            .with_env("ELASTIC_NODE", view.search_url())
            .with_env("ELASTIC_DUMP_SIZE", indexer.elastic_dump_size)
            .with_env("ELASTIC_TIMEOUT", indexer.elastic_timeout)
            .with_env("TELOS_ENDPOINT", endpoint)
            .with_env("TELOS_REMOTE_ENDPOINT", remote)
            .with_env("TELOS_WS_ENDPOINT", history)
            .with_env("INDEXER_START_BLOCK", indexer.start_block)
            .with_env("INDEXER_STOP_BLOCK", indexer.stop_block)
            .with_env("EVM_DEPLOY_BLOCK", indexer.deploy_block)
            .with_env("EVM_PREV_HASH", &indexer.prev_hash)
            .with_env("EVM_START_BLOCK", indexer.evm_start_block)
            .with_env("EVM_VALIDATE_HASH", &indexer.evm_validate_hash)
            .with_env("BROADCAST_HOST", &rpc.indexer_websocket_host)
            .with_env("BROADCAST_PORT", rpc.indexer_websocket_port)
            .with_env("WORKER_AMOUNT", indexer.worker_amount))
    }

    fn readiness(&self, _view: &StackView<'_>) -> Option<Readiness> {
        Some(Readiness::from_start("drained", READINESS_TIMEOUT))
    }

    async fn start(&self, ctx: &mut StartContext<'_>) -> Result<(), GenericError> {
        if !ctx.config.profile().is_local() && ctx.config.daemon.wait_sync {
            await_full_index(ctx).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{network::NetworkTopology, testing};

    #[test]
    fn progress_lines_yield_block_numbers() {
        let line = "2024-05-01 indexer: 10 blocks] pushed, at 1,234/s: [181,245,010|0x1a2b]";
        assert_eq!(indexed_block(line), Some(181_245_010));
    }

    #[test]
    fn unknown_or_ambiguous_progress_is_skipped() {
        assert_eq!(indexed_block("blocks] pushed, at 0/s: [NaN|0x0]"), None);
        assert_eq!(indexed_block("blocks] pushed, at 1/s: [1|a] and: [2|b]"), None);
        assert_eq!(indexed_block("drained: [12|0x0]"), None);
    }

    #[test]
    fn local_chain_uses_node_as_remote() {
        let config = testing::local_config();
        let topology = NetworkTopology::host(&config);
        let view = StackView {
            config: &config,
            topology: &topology,
            root: Path::new("/srv/stack"),
        };
        let layout = UnitLayout::new(view.root, &config.indexer.common);

        let plan = Indexer.prepare(&view, &layout).unwrap();

        assert_eq!(plan.env["TELOS_ENDPOINT"], "http://127.0.0.1:8888");
        assert_eq!(plan.env["TELOS_REMOTE_ENDPOINT"], "http://127.0.0.1:8888");
        assert_eq!(plan.env["TELOS_WS_ENDPOINT"], "ws://127.0.0.1:29999");
        assert_eq!(plan.env["INDEXER_START_BLOCK"], "override");
        assert_eq!(plan.env["BROADCAST_PORT"], "7300");
        assert_eq!(plan.published_ports, vec![7300]);
    }

    #[test]
    fn followers_use_the_public_network_as_remote() {
        let mut config = testing::local_config();
        config.rpc.index_prefix = "telos-testnet".to_string();
        let topology = NetworkTopology::host(&config);
        let view = StackView {
            config: &config,
            topology: &topology,
            root: Path::new("/srv/stack"),
        };
        let layout = UnitLayout::new(view.root, &config.indexer.common);

        let plan = Indexer.prepare(&view, &layout).unwrap();
        assert_eq!(plan.env["TELOS_REMOTE_ENDPOINT"], "https://testnet.telos.net");
        assert_eq!(remote_endpoint(&view).as_deref(), Some("https://testnet.telos.net"));
    }

    #[test]
    fn remote_endpoint_override_reaches_the_container() {
        let mut config = testing::local_config();
        config.rpc.index_prefix = "telos-mainnet".to_string();
        config.daemon.remote_endpoint = Some("https://mainnet.example.org".to_string());
        let topology = NetworkTopology::host(&config);
        let view = StackView {
            config: &config,
            topology: &topology,
            root: Path::new("/srv/stack"),
        };
        let layout = UnitLayout::new(view.root, &config.indexer.common);

        let plan = Indexer.prepare(&view, &layout).unwrap();
        assert_eq!(plan.env["TELOS_REMOTE_ENDPOINT"], "https://mainnet.example.org");
        assert_eq!(remote_endpoint(&view).as_deref(), Some("https://mainnet.example.org"));
    }
}
