//! Stack orchestration.
//!
//! The orchestrator owns one [`ServiceUnit`] per active service, in the order `daemon.services` declares them. Starting
//! the stack configures and builds every unit first, then brings units up one at a time: launch, readiness gate,
//! network attach, unit-specific startup. If any of that fails, every unit launched so far is stopped again, last
//! launched first, before the error is returned.

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use evmstack_config::{ConfigurationLoader, ServiceKind, StackConfig, DEFAULT_ENV_PREFIX};
use snafu::{OptionExt as _, ResultExt as _};
use tracing::{debug, error, info, info_span, warn, Instrument as _, Span};

use crate::{
    chain::ChainClient,
    error::{Configuration, Filesystem, HttpClient, OrchestratorError, Runtime, UnknownService},
    lock::RunLock,
    logs::LogLines,
    network::NetworkTopology,
    runtime::{ContainerFilter, ContainerRuntime, LogOptions},
    unit::{ServiceUnit, StackView},
};

/// Name of the persisted configuration, relative to the deployment root.
pub const CONFIG_FILE: &str = "evmstack.json";

const CLEAN_STOP_TIMEOUT: Duration = Duration::from_secs(10);

fn load_config(path: &Path) -> Result<StackConfig, OrchestratorError> {
    ConfigurationLoader::default()
        .from_json(path)
        .and_then(|loader| loader.from_environment(DEFAULT_ENV_PREFIX))
        .and_then(ConfigurationLoader::into_typed)
        .context(Configuration)
}

fn copy_tree(source: &Path, target: &Path) -> Result<(), OrchestratorError> {
    std::fs::create_dir_all(target).context(Filesystem { path: target })?;
    for entry in std::fs::read_dir(source).context(Filesystem { path: source })? {
        let entry = entry.context(Filesystem { path: source })?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if entry.file_type().context(Filesystem { path: &from })?.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).context(Filesystem { path: &from })?;
        }
    }
    Ok(())
}

/// Brings a configured and built unit up: launch, readiness gate, network attach, unit-specific startup.
async fn bring_up(
    unit: &mut ServiceUnit, runtime: &dyn ContainerRuntime, chain: &ChainClient, config: &mut StackConfig,
    config_path: &Path, topology: &NetworkTopology, root: &Path,
) -> Result<(), OrchestratorError> {
    let view = StackView {
        config: &*config,
        topology,
        root,
    };
    unit.launch(runtime, &view).await?;
    unit.await_ready(runtime, &view).await?;
    unit.attach(runtime, config, topology).await?;
    unit.start(runtime, chain, config, config_path, topology, root).await
}

/// Drives every service of a deployment.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    chain: ChainClient,
    root: PathBuf,
    config_path: PathBuf,
    config: StackConfig,
    instance: String,
    topology: NetworkTopology,
    units: Vec<ServiceUnit>,
    lock: Option<RunLock>,
    span: Span,
}

impl Orchestrator {
    /// Creates an orchestrator for the deployment rooted at `root`, from an in-memory configuration.
    ///
    /// The configuration is persisted to `<root>/evmstack.json` only when [`write_config`][Self::write_config] is
    /// called. Container names use the current process ID as their instance suffix.
    ///
    /// # Errors
    ///
    /// If the root directory cannot be created, or the HTTP client cannot be built, an error will be returned.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>, root: impl Into<PathBuf>, config: StackConfig,
    ) -> Result<Self, OrchestratorError> {
        let root = root.into();
        std::fs::create_dir_all(&root).context(Filesystem { path: &root })?;

        let span = info_span!("stack", chain = %config.chain_name());
        Ok(Self {
            runtime,
            chain: ChainClient::new().context(HttpClient)?,
            config_path: root.join(CONFIG_FILE),
            topology: NetworkTopology::host(&config),
            root,
            config,
            instance: std::process::id().to_string(),
            units: Vec::new(),
            lock: None,
            span,
        })
    }

    /// Creates an orchestrator from the configuration persisted under `root`, with environment overrides applied.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be loaded, or [`new`][Self::new] fails, an error will be returned.
    pub fn load(runtime: Arc<dyn ContainerRuntime>, root: impl Into<PathBuf>) -> Result<Self, OrchestratorError> {
        let root = root.into();
        let config = load_config(&root.join(CONFIG_FILE))?;
        Self::new(runtime, root, config)
    }

    /// Uses `instance` rather than the current process ID as the container name suffix.
    ///
    /// Commands operating on a stack run by another process use the ID held in that process's run lock.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    /// Stack configuration.
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Mutable stack configuration. Changes reach the units the next time they are configured.
    pub fn config_mut(&mut self) -> &mut StackConfig {
        &mut self.config
    }

    /// Deployment root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Instance suffix of container names.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Container runtime.
    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    /// HTTP client.
    pub fn chain(&self) -> &ChainClient {
        &self.chain
    }

    /// Units, in startup order.
    pub fn units(&self) -> &[ServiceUnit] {
        &self.units
    }

    /// Returns the unit of `kind`, if the service is active.
    pub fn unit(&self, kind: ServiceKind) -> Option<&ServiceUnit> {
        self.units.iter().find(|unit| unit.kind() == kind)
    }

    /// Returns the address other services use to reach `kind`.
    pub fn address_of(&self, kind: ServiceKind) -> Ipv4Addr {
        self.topology.address_of(kind)
    }

    /// Read-only view of the stack, as given to unit hooks.
    pub fn view(&self) -> StackView<'_> {
        StackView {
            config: &self.config,
            topology: &self.topology,
            root: &self.root,
        }
    }

    /// Sets up the network, copies the static service files out of the templates directory, and creates the units of
    /// the active services.
    ///
    /// Any units from a previous call are replaced. Call [`stop`][Self::stop] first if they may still be running.
    ///
    /// # Errors
    ///
    /// If the network cannot be set up, the templates directory cannot be copied, or a unit directory cannot be
    /// created, an error will be returned.
    pub async fn initialize(&mut self) -> Result<(), OrchestratorError> {
        self.topology = NetworkTopology::from_config(self.runtime.as_ref(), &self.config)
            .instrument(self.span.clone())
            .await?;

        let templates = self.root.join(&self.config.daemon.templates_dir).join("docker");
        copy_tree(&templates, &self.root.join("docker"))?;

        self.initialize_units()
    }

    /// Creates the units of the active services without touching the runtime or the network.
    ///
    /// # Errors
    ///
    /// If a unit directory cannot be created, an error will be returned.
    pub fn initialize_units(&mut self) -> Result<(), OrchestratorError> {
        self.units = self
            .config
            .daemon
            .services
            .iter()
            .map(|kind| ServiceUnit::new(*kind, &self.config, &self.root, &self.instance, &self.span))
            .collect::<Result<_, _>>()?;
        debug!(parent: &self.span, units = self.units.len(), "Initialized units.");
        Ok(())
    }

    /// Starts the stack.
    ///
    /// Unless `daemon.testing` is set, the run lock is taken first. On failure, every unit launched so far is stopped in
    /// reverse launch order and the run lock is released before the error is returned.
    ///
    /// # Errors
    ///
    /// If the run lock is held, or any unit fails to configure, build, launch, become ready, attach, or start, an
    /// error will be returned.
    pub async fn start(&mut self) -> Result<(), OrchestratorError> {
        if !self.config.daemon.testing && self.lock.is_none() {
            self.lock = Some(RunLock::acquire(&self.root)?);
        }

        let span = self.span.clone();
        let result = self.start_units().instrument(span.clone()).await;
        if let Err(e) = &result {
            span.in_scope(|| error!(error = %e, "Stack failed to start. Stopping launched services..."));
            self.stop_units().instrument(span.clone()).await;
            if let Some(lock) = self.lock.take() {
                if let Err(e) = lock.release() {
                    span.in_scope(|| warn!(error = %e, "Failed to release run lock."));
                }
            }
        }
        result
    }

    async fn start_units(&mut self) -> Result<(), OrchestratorError> {
        info!("Starting stack...");
        let Self {
            ref runtime,
            ref chain,
            ref root,
            ref config_path,
            ref mut config,
            ref topology,
            ref mut units,
            ..
        } = *self;
        let runtime = runtime.as_ref();

        for unit in units.iter_mut() {
            let view = StackView {
                config: &*config,
                topology,
                root,
            };
            unit.configure(&view)?;
            let span = unit.span().clone();
            unit.build(runtime, config).instrument(span).await?;
        }

        for unit in units.iter_mut() {
            let span = unit.span().clone();
            bring_up(unit, runtime, chain, config, config_path, topology, root)
                .instrument(span)
                .await?;
        }

        info!("Stack started.");
        Ok(())
    }

    /// Stops every unit, last started first, and returns the first error encountered, if any.
    async fn stop_units(&mut self) -> Option<OrchestratorError> {
        let view = StackView {
            config: &self.config,
            topology: &self.topology,
            root: &self.root,
        };
        let runtime = self.runtime.as_ref();

        let mut first_error = None;
        for unit in self.units.iter_mut().rev() {
            let span = unit.span().clone();
            if let Err(e) = unit.stop(runtime, &view).instrument(span.clone()).await {
                span.in_scope(|| error!(error = %e, "Failed to stop service."));
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error
    }

    /// Stops every unit and releases the run lock.
    ///
    /// Every unit is stopped even if an earlier one fails. Stopping an already stopped stack does nothing.
    ///
    /// # Errors
    ///
    /// If any unit fails to stop, the first such error is returned after all units were attempted.
    pub async fn stop(&mut self) -> Result<(), OrchestratorError> {
        info!(parent: &self.span, "Stopping stack...");
        let span = self.span.clone();
        let first_error = self.stop_units().instrument(span).await;

        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(parent: &self.span, "Stack stopped.");
                Ok(())
            }
        }
    }

    fn unit_index(&self, kind: ServiceKind) -> Result<usize, OrchestratorError> {
        self.units
            .iter()
            .position(|unit| unit.kind() == kind)
            .context(UnknownService { service: kind })
    }

    /// Stops one unit, then configures and builds it again. Other units are not touched.
    ///
    /// # Errors
    ///
    /// If the service is not active, or the unit fails to stop, configure, or build, an error will be returned.
    pub async fn rebuild_service(&mut self, kind: ServiceKind) -> Result<(), OrchestratorError> {
        let index = self.unit_index(kind)?;
        let Self {
            ref runtime,
            ref root,
            ref config,
            ref topology,
            ref mut units,
            ..
        } = *self;
        let runtime = runtime.as_ref();
        let view = StackView { config, topology, root };

        let unit = &mut units[index];
        let span = unit.span().clone();
        async {
            unit.stop(runtime, &view).await?;
            unit.configure(&view)?;
            unit.build(runtime, config).await
        }
        .instrument(span)
        .await
    }

    /// Restarts one unit: stop, configure, build, then launch, gate, attach, and start it again.
    ///
    /// A failure leaves the other units running and is returned as is.
    ///
    /// # Errors
    ///
    /// If the service is not active, or any step fails, an error will be returned.
    pub async fn restart_service(&mut self, kind: ServiceKind) -> Result<(), OrchestratorError> {
        info!(parent: &self.span, service = %kind, "Restarting service...");
        self.rebuild_service(kind).await?;

        let index = self.unit_index(kind)?;
        let Self {
            ref runtime,
            ref chain,
            ref root,
            ref config_path,
            ref mut config,
            ref topology,
            ref mut units,
            ..
        } = *self;
        let unit = &mut units[index];
        let span = unit.span().clone();
        bring_up(unit, runtime.as_ref(), chain, config, config_path, topology, root)
            .instrument(span)
            .await
    }

    /// Relaunches one unit without waiting for readiness, attaching it, or running its startup logic.
    ///
    /// Used to inspect what a service does on boot, such as a node refusing to open a dirty database.
    ///
    /// # Errors
    ///
    /// If the service is not active, or it fails to stop, configure, build, or launch, an error will be returned.
    pub async fn relaunch_service(&mut self, kind: ServiceKind) -> Result<(), OrchestratorError> {
        self.rebuild_service(kind).await?;

        let index = self.unit_index(kind)?;
        let view = StackView {
            config: &self.config,
            topology: &self.topology,
            root: &self.root,
        };
        let unit = &mut self.units[index];
        let span = unit.span().clone();
        unit.launch(self.runtime.as_ref(), &view).instrument(span).await
    }

    /// Re-reads the persisted configuration, with environment overrides, and re-derives unit names, directories, and
    /// service addresses from it. Container handles are kept.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be loaded or a unit directory cannot be created, an error will be returned.
    pub fn reload_config(&mut self) -> Result<(), OrchestratorError> {
        self.config = load_config(&self.config_path)?;
        self.topology.rebind(&self.config);
        for unit in &mut self.units {
            unit.reload(&self.config, &self.root, &self.instance, &self.span)?;
        }
        debug!(parent: &self.span, "Reloaded configuration.");
        Ok(())
    }

    /// Persists the configuration to `<root>/evmstack.json`.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be written, an error will be returned.
    pub fn write_config(&self) -> Result<(), OrchestratorError> {
        evmstack_config::write_config(&self.config, &self.config_path).context(Configuration)
    }

    /// Streams the log lines of one service.
    ///
    /// # Errors
    ///
    /// If the service is not active, an error will be returned.
    pub fn stream_logs(&self, kind: ServiceKind, options: LogOptions) -> Result<LogLines, OrchestratorError> {
        let unit = self.unit(kind).context(UnknownService { service: kind })?;
        Ok(unit.log_lines(self.runtime.as_ref(), &self.view(), options))
    }

    /// Stops and removes every container carrying `label`, then removes `network` if given.
    ///
    /// Meant for cleaning up after a daemon that died without stopping its stack. Failures on individual resources are
    /// logged and skipped. Returns the number of containers removed.
    ///
    /// # Errors
    ///
    /// If the containers cannot be listed, an error will be returned.
    pub async fn clean(
        runtime: &dyn ContainerRuntime, label: &str, network: Option<&str>,
    ) -> Result<usize, OrchestratorError> {
        let containers = runtime
            .list_containers(&ContainerFilter::labelled(label))
            .await
            .context(Runtime)?;

        let mut removed = 0;
        for container in containers {
            let name = container.name.as_str();
            match runtime.stop_container(name, CLEAN_STOP_TIMEOUT).await {
                Ok(()) => debug!("Stopped container '{}'.", name),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!(error = %e, "Failed to stop container '{}'.", name);
                    continue;
                }
            }

            match runtime.remove_container(name).await {
                Ok(()) => {
                    debug!("Removed container '{}'.", name);
                    removed += 1;
                }
                Err(e) if e.is_not_found() || e.is_in_progress() => {}
                Err(e) => error!(error = %e, "Failed to remove container '{}'.", name),
            }
        }

        if let Some(network) = network {
            match runtime.remove_network(network).await {
                Ok(()) => debug!("Removed network '{}'.", network),
                Err(e) if e.is_not_found() => {}
                Err(e) => error!(error = %e, "Failed to remove network '{}'.", network),
            }
        }

        info!(removed, "Cleaned up stack resources.");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lock::PID_FILE,
        runtime::{
            created_by_selector,
            memory::{Call, MemoryRuntime},
        },
        testing,
        unit::UnitState,
    };

    const NODE_LOG: &str = "\
info  2024-05-01T10:00:00.000 nodeos Produced block 0000001 #1
info  2024-05-01T10:00:01.000 nodeos nodeos successfully exiting
";

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        runtime: MemoryRuntime,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            testing::write_templates(&root.join("templates"));

            let runtime = MemoryRuntime::new();
            runtime.script_logs("-redis", &["* Ready to accept connections tcp"]);
            runtime.script_logs("-elasticsearch", &["added 3 indices into cluster_state"]);
            runtime.script_logs("-translator", &["queue drained"]);
            runtime.script_logs("-rpc", &["Telos EVM RPC started!!!"]);

            Self {
                _dir: dir,
                root,
                runtime,
            }
        }

        fn config(&self, services: &[ServiceKind]) -> StackConfig {
            let mut config = testing::local_config();
            config.daemon.services = services.to_vec();
            config.daemon.testing = true;
            config.node.common.wait_startup = false;
            config.node.api_check = false;
            config
        }

        async fn orchestrator(&self, config: StackConfig) -> Orchestrator {
            let mut orchestrator = Orchestrator::new(Arc::new(self.runtime.clone()), &self.root, config)
                .unwrap()
                .with_instance("7");
            orchestrator.initialize().await.unwrap();

            let node_logs = self.root.join("docker/nodeos/logs");
            if node_logs.is_dir() {
                std::fs::write(node_logs.join("nodeos.log"), NODE_LOG).unwrap();
            }
            orchestrator
        }

        fn runs(&self) -> Vec<String> {
            self.runtime
                .calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Run(name) => Some(name),
                    _ => None,
                })
                .collect()
        }

        fn stops(&self) -> Vec<String> {
            self.runtime
                .calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Stop(name) => Some(name),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn builds_everything_then_launches_in_declared_order() {
        let fixture = Fixture::new();
        let services = [
            ServiceKind::Cache,
            ServiceKind::Search,
            ServiceKind::Node,
            ServiceKind::Indexer,
            ServiceKind::Rpc,
        ];
        let mut orchestrator = fixture.orchestrator(fixture.config(&services)).await;

        orchestrator.start().await.unwrap();

        let calls = fixture.runtime.calls();
        let last_build = calls.iter().rposition(|call| matches!(call, Call::Build(_))).unwrap();
        let first_run = calls.iter().position(|call| matches!(call, Call::Run(_))).unwrap();
        assert!(last_build < first_run);
        assert_eq!(
            fixture.runs(),
            vec![
                "telos-local-7-redis",
                "telos-local-7-elasticsearch",
                "telos-local-7-nodeos",
                "telos-local-7-translator",
                "telos-local-7-rpc",
            ]
        );
        assert!(orchestrator
            .units()
            .iter()
            .all(|unit| unit.state() == UnitState::Running));

        orchestrator.stop().await.unwrap();
        assert!(fixture.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn readiness_timeout_unwinds_launched_units_in_reverse() {
        let fixture = Fixture::new();
        let mut config = fixture.config(&[ServiceKind::Cache, ServiceKind::Search, ServiceKind::Rpc]);
        config.search.common.startup_timeout = Some(1);
        fixture.runtime.script_logs("-elasticsearch", &["starting"]);
        let mut orchestrator = fixture.orchestrator(config).await;

        let result = orchestrator.start().await;

        assert!(matches!(result, Err(OrchestratorError::ReadinessTimeout { .. })));
        assert_eq!(
            fixture.runs(),
            vec!["telos-local-7-redis", "telos-local-7-elasticsearch"]
        );
        assert_eq!(
            fixture.stops(),
            vec!["telos-local-7-elasticsearch", "telos-local-7-redis"]
        );
        assert!(fixture.runtime.container_names().is_empty());
        assert!(orchestrator.units().iter().all(|unit| !unit.is_launched()));
    }

    #[tokio::test]
    async fn launch_conflict_aborts_without_touching_existing_container() {
        let fixture = Fixture::new();
        fixture.runtime.add_running("telos-local-7-elasticsearch");
        let mut orchestrator = fixture
            .orchestrator(fixture.config(&[ServiceKind::Cache, ServiceKind::Search]))
            .await;

        let result = orchestrator.start().await;

        assert!(matches!(result, Err(OrchestratorError::LaunchConflict { .. })));
        assert_eq!(fixture.stops(), vec!["telos-local-7-redis"]);
        assert_eq!(fixture.runtime.container_names(), vec!["telos-local-7-elasticsearch"]);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator(fixture.config(&[ServiceKind::Cache])).await;
        orchestrator.start().await.unwrap();

        orchestrator.stop().await.unwrap();
        let calls = fixture.runtime.calls().len();
        orchestrator.stop().await.unwrap();

        assert_eq!(fixture.runtime.calls().len(), calls);
        assert_eq!(fixture.stops(), vec!["telos-local-7-redis"]);
    }

    #[tokio::test]
    async fn killed_node_restarts_to_running() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture
            .orchestrator(fixture.config(&[ServiceKind::Cache, ServiceKind::Node]))
            .await;
        orchestrator.start().await.unwrap();

        fixture.runtime.remove_container("telos-local-7-nodeos").await.unwrap();
        orchestrator.restart_service(ServiceKind::Node).await.unwrap();

        assert_eq!(
            orchestrator.unit(ServiceKind::Node).map(ServiceUnit::state),
            Some(UnitState::Running)
        );
        assert_eq!(
            fixture.runs(),
            vec!["telos-local-7-redis", "telos-local-7-nodeos", "telos-local-7-nodeos"]
        );
        assert_eq!(
            orchestrator.unit(ServiceKind::Cache).map(ServiceUnit::state),
            Some(UnitState::Running)
        );
    }

    #[tokio::test]
    async fn inactive_services_cannot_be_restarted_or_streamed() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator(fixture.config(&[ServiceKind::Cache])).await;

        assert!(matches!(
            orchestrator.restart_service(ServiceKind::Dashboard).await,
            Err(OrchestratorError::UnknownService { .. })
        ));
        assert!(matches!(
            orchestrator.stream_logs(ServiceKind::Dashboard, LogOptions::from_start()),
            Err(OrchestratorError::UnknownService { .. })
        ));
    }

    #[tokio::test]
    async fn run_lock_is_held_while_running() {
        let fixture = Fixture::new();
        let mut config = fixture.config(&[ServiceKind::Cache]);
        config.daemon.testing = false;
        let mut orchestrator = fixture.orchestrator(config).await;

        orchestrator.start().await.unwrap();
        assert!(fixture.root.join(PID_FILE).is_file());

        orchestrator.stop().await.unwrap();
        assert!(!fixture.root.join(PID_FILE).exists());
    }

    #[tokio::test]
    async fn test_harness_runs_without_run_lock() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator(fixture.config(&[ServiceKind::Cache])).await;

        orchestrator.start().await.unwrap();
        assert!(!fixture.root.join(PID_FILE).exists());
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_start_releases_run_lock() {
        let fixture = Fixture::new();
        fixture.runtime.fail_build("tevm:redis-telos-local");
        let mut config = fixture.config(&[ServiceKind::Cache]);
        config.daemon.testing = false;
        let mut orchestrator = fixture.orchestrator(config).await;

        assert!(matches!(
            orchestrator.start().await,
            Err(OrchestratorError::ImageBuildFailed { .. })
        ));
        assert!(!fixture.root.join(PID_FILE).exists());
        assert!(fixture.runs().is_empty());
    }

    #[tokio::test]
    async fn static_files_are_copied_into_the_deployment() {
        let fixture = Fixture::new();
        let _orchestrator = fixture.orchestrator(fixture.config(&[ServiceKind::Search])).await;

        let copied = fixture.root.join("docker/elasticsearch/build/elasticsearch.yml");
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "http.port: $port\n");
    }

    #[tokio::test]
    async fn reload_picks_up_persisted_changes() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator(fixture.config(&[ServiceKind::Cache])).await;

        orchestrator.config_mut().rpc.index_prefix = "telos-other".to_string();
        orchestrator.write_config().unwrap();
        orchestrator.config_mut().rpc.index_prefix = "telos-local".to_string();
        orchestrator.reload_config().unwrap();

        assert_eq!(orchestrator.config().chain_name(), "telos-other");
        assert_eq!(
            orchestrator.unit(ServiceKind::Cache).map(ServiceUnit::container_name),
            Some("telos-other-7-redis")
        );
    }

    #[tokio::test]
    async fn logs_are_streamed_per_service() {
        use futures::StreamExt as _;

        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator(fixture.config(&[ServiceKind::Cache])).await;
        orchestrator.start().await.unwrap();

        let mut lines = orchestrator
            .stream_logs(ServiceKind::Cache, LogOptions::from_start())
            .unwrap();
        let line = lines.next().await.unwrap().unwrap();
        assert!(line.contains("Ready to accept connections"));
    }

    #[tokio::test]
    async fn clean_removes_only_labelled_containers() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture
            .orchestrator(fixture.config(&[ServiceKind::Cache, ServiceKind::Rpc]))
            .await;
        orchestrator.start().await.unwrap();
        fixture.runtime.add_running("unrelated");

        let removed = Orchestrator::clean(&fixture.runtime, &created_by_selector(), None)
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert_eq!(fixture.runtime.container_names(), vec!["unrelated"]);
    }
}
