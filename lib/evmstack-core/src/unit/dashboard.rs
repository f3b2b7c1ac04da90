use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable as _};
use evmstack_config::ServiceKind;
use evmstack_error::{ErrorContext as _, GenericError};
use tracing::{debug, info, warn};

use super::{
    LaunchPlan, Readiness, ServiceBehavior, StackView, StartContext, TemplateFile, UnitLayout,
    DEFAULT_READINESS_TIMEOUT,
};
use crate::{chain::ChainError, runtime::Mount};

const TEMPLATES: &[TemplateFile] = &[
    TemplateFile::text("docker/kibana/build/Dockerfile", "build/Dockerfile"),
    TemplateFile::text("docker/kibana/config/kibana.yml", "config/kibana.yml"),
];

const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(3);
const REGISTER_ATTEMPTS: usize = 100;

/// Dashboard over the search engine.
pub(super) struct Dashboard;

/// Index patterns the dashboard is set up with.
pub(super) fn index_patterns(view: &StackView<'_>) -> Vec<String> {
    let chain = view.config.chain_name();
    let version = &view.config.rpc.index_version;
    vec![
        format!("{}-action-{}-*", chain, version),
        format!("{}-delta-{}-*", chain, version),
        "filebeat-*".to_string(),
    ]
}

#[async_trait]
impl ServiceBehavior for Dashboard {
    fn templates(&self) -> &'static [TemplateFile] {
        TEMPLATES
    }

    fn prepare(&self, view: &StackView<'_>, layout: &UnitLayout) -> Result<LaunchPlan, GenericError> {
        let plan = LaunchPlan {
            mounts: vec![
                Mount::bind(layout.config_dir()?, "/usr/share/kibana/config"),
                Mount::bind(layout.data_dir()?, "/data"),
            ],
            published_ports: vec![view.config.dashboard.port],
            ..Default::default()
        };
        Ok(plan.with_env("ELASTICSEARCH_HOSTS", view.search_url()))
    }

    fn readiness(&self, _view: &StackView<'_>) -> Option<Readiness> {
        Some(Readiness::from_start("Kibana is now available", DEFAULT_READINESS_TIMEOUT))
    }

    async fn start(&self, ctx: &mut StartContext<'_>) -> Result<(), GenericError> {
        let view = ctx.view();
        let dashboard_url = view.dashboard_url();
        let chain = ctx.chain;

        for title in index_patterns(&view) {
            info!("Registering index pattern '{}'...", title);
            let (url, pattern) = (dashboard_url.as_str(), title.as_str());
            let response = (move || async move { chain.register_index_pattern(url, pattern).await })
                .retry(
                    ConstantBuilder::default()
                        .with_delay(REGISTER_RETRY_DELAY)
                        .with_max_times(REGISTER_ATTEMPTS),
                )
                .notify(|e: &ChainError, delay| {
                    if e.is_connect() {
                        warn!("Can't reach {} yet. Retrying in {:?}...", ServiceKind::Dashboard, delay);
                    } else {
                        info!(error = %e, "Dashboard not ready yet. Retrying in {:?}...", delay);
                    }
                })
                .await
                .with_error_context(|| format!("Failed to register index pattern '{}'.", title))?;
            debug!(%response, "Registered index pattern.");
        }

        Ok(())
    }
}
