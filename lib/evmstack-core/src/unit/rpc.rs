use evmstack_config::Substitutions;
use evmstack_error::GenericError;

use super::{LaunchPlan, Readiness, ServiceBehavior, StackView, TemplateFile, UnitLayout, DEFAULT_READINESS_TIMEOUT};
use crate::runtime::Mount;

const TEMPLATES: &[TemplateFile] = &[
    TemplateFile::text("docker/rpc/build/Dockerfile", "build/Dockerfile"),
    TemplateFile::json("docker/rpc/build/config.json", "build/config.json"),
];

/// JSON-RPC gateway.
pub(super) struct Rpc;

impl ServiceBehavior for Rpc {
    fn templates(&self) -> &'static [TemplateFile] {
        TEMPLATES
    }

    fn configure(
        &mut self, view: &StackView<'_>, _layout: &UnitLayout, subst: &mut Substitutions,
    ) -> Result<(), GenericError> {
        let config = view.config;
        subst.insert("redis_host", config.cache.host.as_str());
        subst.insert("redis_port", config.cache.port);
        subst.insert("rpc_nodeos_read", view.node_api_url());
        subst.insert("rpc_elastic_node", view.search_url());
        subst.insert("elasticsearch_user", "");
        subst.insert("elasticsearch_pass", "");
        subst.insert("elasticsearch_prefix", config.rpc.index_prefix.as_str());
        subst.insert("elasticsearch_index_version", config.rpc.index_version.as_str());
        Ok(())
    }

    fn prepare(&self, view: &StackView<'_>, layout: &UnitLayout) -> Result<LaunchPlan, GenericError> {
        let rpc = &view.config.rpc;
        Ok(LaunchPlan {
            mounts: vec![Mount::bind(layout.logs_dir()?, "/root/.pm2/logs")],
            published_ports: vec![rpc.api_port, rpc.websocket_port],
            ..Default::default()
        })
    }

    fn readiness(&self, _view: &StackView<'_>) -> Option<Readiness> {
        Some(Readiness::from_start("Telos EVM RPC started!!!", DEFAULT_READINESS_TIMEOUT))
    }
}
