use std::time::Duration;

use async_trait::async_trait;
use evmstack_config::ServiceKind;
use evmstack_error::{generic_error, ErrorContext as _, GenericError};
use tracing::{error, info};

use super::{LaunchPlan, ServiceBehavior, StackView, StartContext, TemplateFile, UnitLayout};
use crate::runtime::{ContainerRuntime, Mount};

const TEMPLATES: &[TemplateFile] = &[TemplateFile::text("docker/beats/build/Dockerfile", "build/Dockerfile")];

const SHIPPER_CONFIG: &str = "/etc/filebeat/filebeat.yml";
const PIPELINE_SETUP_DELAY: Duration = Duration::from_secs(3);

/// Log shipper feeding gateway logs into the search engine.
pub(super) struct Shipper;

async fn run_checked(runtime: &dyn ContainerRuntime, container: &str, command: &[&str]) -> Result<(), GenericError> {
    let command = command.iter().map(|arg| arg.to_string()).collect::<Vec<_>>();
    let output = runtime
        .exec(container, &command)
        .await
        .with_error_context(|| format!("Failed to run '{}'.", command.join(" ")))?;
    if !output.success() {
        return Err(generic_error!(
            "'{}' exited with {:?}: {}",
            command.join(" "),
            output.exit_code,
            output.output
        ));
    }
    Ok(())
}

#[async_trait]
impl ServiceBehavior for Shipper {
    fn templates(&self) -> &'static [TemplateFile] {
        TEMPLATES
    }

    fn prepare(&self, view: &StackView<'_>, layout: &UnitLayout) -> Result<LaunchPlan, GenericError> {
        let rpc = &view.config.rpc.common;
        let gateway_logs = view
            .service_dir(ServiceKind::Rpc)
            .join(rpc.logs_path.as_deref().unwrap_or("logs"));
        std::fs::create_dir_all(&gateway_logs)
            .with_error_context(|| format!("Failed to create '{}'.", gateway_logs.display()))?;

        let plan = LaunchPlan {
            mounts: vec![
                Mount::bind(layout.config_dir()?, "/etc/filebeat"),
                Mount::bind(gateway_logs, "/root/logs"),
            ],
            ..Default::default()
        };
        Ok(plan
            .with_env("CHAIN_NAME", view.config.chain_name())
            .with_env("ELASTIC_HOST", view.search_url())
            .with_env("KIBANA_HOST", format!("localhost:{}", view.config.dashboard.port)))
    }

    async fn start(&self, ctx: &mut StartContext<'_>) -> Result<(), GenericError> {
        run_checked(ctx.runtime, ctx.container, &["chown", "-R", "0:0", SHIPPER_CONFIG]).await?;
        run_checked(ctx.runtime, ctx.container, &["chmod", "600", SHIPPER_CONFIG]).await?;

        ctx.runtime
            .exec_detached(ctx.container, &["filebeat".to_string(), "-e".to_string()])
            .await
            .error_context("Failed to launch shipper process.")?;

        tokio::time::sleep(PIPELINE_SETUP_DELAY).await;

        let setup = ["filebeat", "setup", "--pipelines"].map(String::from);
        let output = ctx
            .runtime
            .exec(ctx.container, &setup)
            .await
            .error_context("Failed to set up shipper pipelines.")?;
        if output.success() {
            info!("Shipper pipelines set up.");
        } else {
            error!(exit_code = ?output.exit_code, "Shipper pipeline setup failed:\n{}", output.output);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use evmstack_config::StackConfig;

    use super::*;
    use crate::{
        chain::ChainClient,
        network::NetworkTopology,
        runtime::{
            memory::{Call, MemoryRuntime},
            ExecOutput,
        },
        testing,
    };

    async fn run_start(runtime: &MemoryRuntime, config: &mut StackConfig, root: &std::path::Path) -> Result<(), GenericError> {
        let topology = NetworkTopology::host(config);
        let layout = UnitLayout::new(root, &config.shipper.common);
        let chain = ChainClient::new().unwrap();
        let config_path = PathBuf::from("/nonexistent/evmstack.json");
        let mut ctx = StartContext {
            config,
            config_path: &config_path,
            topology: &topology,
            root,
            runtime,
            chain: &chain,
            container: "telos-local-1-beats",
            layout: &layout,
        };
        Shipper.start(&mut ctx).await
    }

    #[tokio::test(start_paused = true)]
    async fn start_fixes_permissions_then_launches_and_sets_up() {
        let runtime = MemoryRuntime::new();
        let mut config = testing::local_config();
        let dir = tempfile::tempdir().unwrap();

        run_start(&runtime, &mut config, dir.path()).await.unwrap();

        let calls = runtime.calls();
        assert!(matches!(&calls[0], Call::Exec(_, cmd) if cmd[0] == "chown"));
        assert!(matches!(&calls[1], Call::Exec(_, cmd) if cmd[0] == "chmod"));
        assert!(matches!(&calls[2], Call::ExecDetached(_, cmd) if cmd == &["filebeat", "-e"]));
        assert!(matches!(&calls[3], Call::Exec(_, cmd) if cmd[1] == "setup"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_permission_fix_is_fatal() {
        let runtime = MemoryRuntime::new();
        runtime.script_exec(
            "chmod",
            ExecOutput {
                exit_code: Some(1),
                output: "Operation not permitted".to_string(),
            },
        );
        let mut config = testing::local_config();
        let dir = tempfile::tempdir().unwrap();

        assert!(run_start(&runtime, &mut config, dir.path()).await.is_err());
        assert!(!runtime.calls().iter().any(|call| matches!(call, Call::ExecDetached(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pipeline_setup_is_not_fatal() {
        let runtime = MemoryRuntime::new();
        runtime.script_exec(
            "filebeat",
            ExecOutput {
                exit_code: Some(1),
                output: "no pipelines".to_string(),
            },
        );
        let mut config = testing::local_config();
        let dir = tempfile::tempdir().unwrap();

        run_start(&runtime, &mut config, dir.path()).await.unwrap();
    }

    #[test]
    fn gateway_log_directory_is_created_and_mounted() {
        let config = testing::local_config();
        let topology = NetworkTopology::host(&config);
        let dir = tempfile::tempdir().unwrap();
        let view = StackView {
            config: &config,
            topology: &topology,
            root: dir.path(),
        };
        let layout = UnitLayout::new(dir.path(), &config.shipper.common);

        let plan = Shipper.prepare(&view, &layout).unwrap();

        assert!(dir.path().join("docker/rpc/logs").is_dir());
        assert_eq!(plan.mounts[1].target, "/root/logs");
        assert_eq!(plan.env["KIBANA_HOST"], "localhost:5601");
    }
}
