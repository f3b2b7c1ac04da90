use evmstack_error::GenericError;

use super::{LaunchPlan, Readiness, ServiceBehavior, StackView, TemplateFile, UnitLayout, DEFAULT_READINESS_TIMEOUT};
use crate::runtime::Mount;

const TEMPLATES: &[TemplateFile] = &[
    TemplateFile::text("docker/elasticsearch/build/Dockerfile", "build/Dockerfile"),
    TemplateFile::text("docker/elasticsearch/build/elasticsearch.yml", "build/elasticsearch.yml"),
];

/// Search engine holding the indexed chain history.
pub(super) struct Search;

impl ServiceBehavior for Search {
    fn templates(&self) -> &'static [TemplateFile] {
        TEMPLATES
    }

    fn prepare(&self, view: &StackView<'_>, layout: &UnitLayout) -> Result<LaunchPlan, GenericError> {
        let plan = LaunchPlan {
            mounts: vec![
                Mount::bind(layout.logs_dir()?, "/home/elasticsearch/logs"),
                Mount::bind(layout.data_dir()?, "/home/elasticsearch/data"),
            ],
            published_ports: vec![view.config.search.port],
            user: Some("root".to_string()),
            ..Default::default()
        };

        Ok(plan
            .with_env("discovery.type", "single-node")
            .with_env("cluster.name", "es-cluster")
            .with_env("node.name", "es01")
            .with_env("bootstrap.memory_lock", "true")
            .with_env("xpack.security.enabled", "false")
            .with_env("ES_JAVA_OPTS", "-Xms2g -Xmx2g")
            .with_env("ES_NETWORK_HOST", "0.0.0.0"))
    }

    fn readiness(&self, _view: &StackView<'_>) -> Option<Readiness> {
        Some(Readiness::from_start(" indices into cluster_state", DEFAULT_READINESS_TIMEOUT))
    }
}
