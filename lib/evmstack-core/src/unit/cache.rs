use evmstack_error::GenericError;

use super::{LaunchPlan, Readiness, ServiceBehavior, StackView, TemplateFile, UnitLayout, DEFAULT_READINESS_TIMEOUT};
use crate::runtime::Mount;

const TEMPLATES: &[TemplateFile] = &[
    TemplateFile::text("docker/redis/build/Dockerfile", "build/Dockerfile"),
    TemplateFile::text("docker/redis/config/redis.conf", "config/redis.conf"),
];

/// Key/value cache backing the gateway.
pub(super) struct Cache;

impl ServiceBehavior for Cache {
    fn templates(&self) -> &'static [TemplateFile] {
        TEMPLATES
    }

    fn prepare(&self, view: &StackView<'_>, layout: &UnitLayout) -> Result<LaunchPlan, GenericError> {
        Ok(LaunchPlan {
            mounts: vec![
                Mount::bind(layout.config_dir()?, "/root"),
                Mount::bind(layout.data_dir()?, "/data"),
            ],
            published_ports: vec![view.config.cache.port],
            ..Default::default()
        })
    }

    fn readiness(&self, _view: &StackView<'_>) -> Option<Readiness> {
        Some(Readiness::from_start("Ready to accept connections", DEFAULT_READINESS_TIMEOUT))
    }
}
