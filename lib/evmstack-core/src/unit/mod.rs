//! Service units.
//!
//! A [`ServiceUnit`] is one managed service: its slice of the configuration, its directories on the host, and the
//! container running it. The lifecycle steps every unit shares live here; what differs per service (templates,
//! mounts, environment, readiness phrase, one-time startup logic) is supplied by a [`ServiceBehavior`].

use std::{
    collections::BTreeMap,
    fmt,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable as _};
use evmstack_config::{template, ServiceCommon, ServiceKind, StackConfig, Substitutions};
use evmstack_error::{generic_error, GenericError};
use snafu::ResultExt as _;
use tracing::{debug, info, info_span, warn, Span};

use crate::{
    build::build_image,
    chain::ChainClient,
    error::{
        Configuration, Filesystem, ImageNotFound, LaunchConflict, LogStreamEnded, NotRunning, OrchestratorError,
        ReadinessTimeout, Runtime, Service, Template as RenderTemplate,
    },
    logs::{decode_lines, LogLines},
    network::NetworkTopology,
    readiness::{GateOutcome, ReadinessGate},
    runtime::{default_labels, ContainerFilter, ContainerRuntime, ContainerSpec, LogOptions, Mount, NetworkMode},
};

mod cache;
mod dashboard;
mod indexer;
mod node;
mod rpc;
mod search;
mod shipper;

pub use self::node::DIRTY_STATE_PHRASE;

/// Readiness timeout for units that do not declare their own.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(120);

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);
const STOP_ATTEMPTS: usize = 3;
const STOP_RETRY_DELAY: Duration = Duration::from_secs(1);
const LOG_MAX_SIZE: &str = "100m";

/// Lifecycle state of a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    /// Nothing done yet.
    Unconfigured,

    /// Templates rendered.
    Configured,

    /// Image built.
    Built,

    /// Container running, readiness not yet confirmed.
    Launched,

    /// Readiness phrase seen, or none required.
    Gated,

    /// Attached to the network and confirmed alive.
    Ready,

    /// Unit-specific startup finished.
    Running,

    /// Container stopped and removed.
    Stopped,

    /// The image was missing after its build.
    BuildFailed,

    /// A container with the same name was already running.
    LaunchConflict,

    /// The readiness phrase never showed up.
    ReadinessTimeout,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Built => "built",
            Self::Launched => "launched",
            Self::Gated => "gated",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::BuildFailed => "build-failed",
            Self::LaunchConflict => "launch-conflict",
            Self::ReadinessTimeout => "readiness-timeout",
        };
        f.write_str(name)
    }
}

/// Directories of a unit on the host.
///
/// Everything lives under `<root>/docker/<docker_path>`. The optional directories exist only when the service
/// configures the matching path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitLayout {
    service_dir: PathBuf,
    build_dir: PathBuf,
    config_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    logs_dir: Option<PathBuf>,
}

impl UnitLayout {
    /// Derives the layout of a service under the stack root.
    pub fn new(root: &Path, common: &ServiceCommon) -> Self {
        let service_dir = root.join("docker").join(&common.docker_path);
        Self {
            build_dir: service_dir.join(&common.build_path),
            config_dir: common.config_path.as_ref().map(|path| service_dir.join(path)),
            data_dir: common.data_path.as_ref().map(|path| service_dir.join(path)),
            logs_dir: common.logs_path.as_ref().map(|path| service_dir.join(path)),
            service_dir,
        }
    }

    /// Creates every directory of the layout.
    ///
    /// # Errors
    ///
    /// If a directory cannot be created, an error will be returned.
    pub fn create_dirs(&self) -> Result<(), OrchestratorError> {
        let dirs = [
            Some(&self.service_dir),
            Some(&self.build_dir),
            self.config_dir.as_ref(),
            self.data_dir.as_ref(),
            self.logs_dir.as_ref(),
        ];
        for dir in dirs.into_iter().flatten() {
            std::fs::create_dir_all(dir).context(Filesystem { path: dir })?;
        }
        Ok(())
    }

    /// Service directory.
    pub fn service_dir(&self) -> &Path {
        &self.service_dir
    }

    /// Build context directory.
    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Configuration directory.
    ///
    /// # Errors
    ///
    /// If the service has no `config_path`, an error will be returned.
    pub fn config_dir(&self) -> Result<&Path, GenericError> {
        self.config_dir
            .as_deref()
            .ok_or_else(|| generic_error!("Service has no 'config_path'."))
    }

    /// Data directory.
    ///
    /// # Errors
    ///
    /// If the service has no `data_path`, an error will be returned.
    pub fn data_dir(&self) -> Result<&Path, GenericError> {
        self.data_dir
            .as_deref()
            .ok_or_else(|| generic_error!("Service has no 'data_path'."))
    }

    /// Logs directory.
    ///
    /// # Errors
    ///
    /// If the service has no `logs_path`, an error will be returned.
    pub fn logs_dir(&self) -> Result<&Path, GenericError> {
        self.logs_dir
            .as_deref()
            .ok_or_else(|| generic_error!("Service has no 'logs_path'."))
    }
}

/// A template rendered into the service directory.
#[derive(Clone, Copy, Debug)]
pub struct TemplateFile {
    /// Source path, relative to the templates directory.
    pub source: &'static str,

    /// Target path, relative to the service directory.
    pub target: &'static str,

    /// Whether the file is a JSON document, in which case every value is substituted as a JSON literal.
    pub json: bool,
}

impl TemplateFile {
    const fn text(source: &'static str, target: &'static str) -> Self {
        Self {
            source,
            target,
            json: false,
        }
    }

    const fn json(source: &'static str, target: &'static str) -> Self {
        Self {
            source,
            target,
            json: true,
        }
    }
}

/// What a unit needs from the runtime to be launched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaunchPlan {
    /// Service mounts. Mounts from configuration are added on top.
    pub mounts: Vec<Mount>,

    /// Ports to publish when running on the private network.
    pub published_ports: Vec<u16>,

    /// Environment variables.
    pub env: BTreeMap<String, String>,

    /// Command, or the image default.
    pub command: Option<Vec<String>>,

    /// Memory limit, in bytes.
    pub memory_limit: Option<i64>,

    /// User to run as.
    pub user: Option<String>,
}

impl LaunchPlan {
    fn with_env(mut self, key: &str, value: impl ToString) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

/// The log phrase signalling a unit finished starting up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Readiness {
    /// Phrase, matched as an exact substring.
    pub phrase: &'static str,

    /// Default time to wait for it.
    pub timeout: Duration,

    /// Only consider output produced after the wait begins.
    pub from_latest: bool,
}

impl Readiness {
    const fn from_start(phrase: &'static str, timeout: Duration) -> Self {
        Self {
            phrase,
            timeout,
            from_latest: false,
        }
    }
}

/// Read-only view of the stack given to unit hooks.
#[derive(Clone, Copy)]
pub struct StackView<'a> {
    /// Stack configuration.
    pub config: &'a StackConfig,

    /// Service addresses.
    pub topology: &'a NetworkTopology,

    /// Stack root directory.
    pub root: &'a Path,
}

impl StackView<'_> {
    /// Directory holding the per-service templates.
    pub fn templates_dir(&self) -> PathBuf {
        self.root.join(&self.config.daemon.templates_dir)
    }

    /// Address other services use to reach `kind`.
    pub fn address_of(&self, kind: ServiceKind) -> Ipv4Addr {
        self.topology.address_of(kind)
    }

    /// Service directory of `kind`.
    pub fn service_dir(&self, kind: ServiceKind) -> PathBuf {
        self.root.join("docker").join(&self.config.common(kind).docker_path)
    }

    /// Base URL of the search engine.
    pub fn search_url(&self) -> String {
        let search = &self.config.search;
        format!("{}://{}:{}", search.protocol, self.address_of(ServiceKind::Search), search.port)
    }

    /// Base URL of the node's HTTP API.
    pub fn node_api_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.address_of(ServiceKind::Node),
            self.config.node.ini.http_addr.port
        )
    }

    /// JSON-RPC endpoint of the gateway.
    pub fn gateway_url(&self) -> String {
        format!(
            "http://{}:{}/evm",
            self.address_of(ServiceKind::Rpc),
            self.config.rpc.api_port
        )
    }

    /// Base URL of the dashboard.
    pub fn dashboard_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.address_of(ServiceKind::Dashboard),
            self.config.dashboard.port
        )
    }
}

/// Everything a unit's one-time startup logic may touch.
pub struct StartContext<'a> {
    /// Stack configuration. Changes are persisted by the unit itself when needed.
    pub config: &'a mut StackConfig,

    /// Path the configuration is persisted to.
    pub config_path: &'a Path,

    /// Service addresses.
    pub topology: &'a NetworkTopology,

    /// Stack root directory.
    pub root: &'a Path,

    /// Container runtime.
    pub runtime: &'a dyn ContainerRuntime,

    /// HTTP client.
    pub chain: &'a ChainClient,

    /// Name of the unit's container.
    pub container: &'a str,

    /// Unit directories.
    pub layout: &'a UnitLayout,
}

impl StartContext<'_> {
    /// Read-only view of the stack.
    pub fn view(&self) -> StackView<'_> {
        StackView {
            config: self.config,
            topology: self.topology,
            root: self.root,
        }
    }
}

/// Service-specific parts of a unit.
#[async_trait]
pub trait ServiceBehavior: Send + Sync {
    /// Templates rendered by [`ServiceUnit::configure`].
    fn templates(&self) -> &'static [TemplateFile];

    /// Adds unit-specific keys to the substitution context, and writes any file that is not a plain template.
    ///
    /// Called before templates are rendered.
    fn configure(
        &mut self, _view: &StackView<'_>, _layout: &UnitLayout, _subst: &mut Substitutions,
    ) -> Result<(), GenericError> {
        Ok(())
    }

    /// Mounts, ports, environment, and command of the container.
    fn prepare(&self, view: &StackView<'_>, layout: &UnitLayout) -> Result<LaunchPlan, GenericError>;

    /// Phrase to wait for after launch, if any.
    fn readiness(&self, _view: &StackView<'_>) -> Option<Readiness> {
        None
    }

    /// Log lines of the running unit.
    fn log_lines(
        &self, runtime: &dyn ContainerRuntime, container: &str, _layout: &UnitLayout, _view: &StackView<'_>,
        options: LogOptions,
    ) -> LogLines {
        decode_lines(runtime.logs(container, options))
    }

    /// One-time logic run once the unit is up and attached.
    async fn start(&self, _ctx: &mut StartContext<'_>) -> Result<(), GenericError> {
        Ok(())
    }

    /// Runs before a running container is stopped.
    async fn before_stop(
        &self, _runtime: &dyn ContainerRuntime, _container: &str, _layout: &UnitLayout, _view: &StackView<'_>,
    ) -> Result<(), GenericError> {
        Ok(())
    }
}

fn behavior_for(kind: ServiceKind) -> Box<dyn ServiceBehavior> {
    match kind {
        ServiceKind::Cache => Box::new(cache::Cache),
        ServiceKind::Search => Box::new(search::Search),
        ServiceKind::Dashboard => Box::new(dashboard::Dashboard),
        ServiceKind::Node => Box::new(node::Node::default()),
        ServiceKind::Shipper => Box::new(shipper::Shipper),
        ServiceKind::Indexer => Box::new(indexer::Indexer),
        ServiceKind::Rpc => Box::new(rpc::Rpc),
    }
}

/// One managed service.
pub struct ServiceUnit {
    kind: ServiceKind,
    behavior: Box<dyn ServiceBehavior>,
    layout: UnitLayout,
    container_name: String,
    image: String,
    container_id: Option<String>,
    state: UnitState,
    span: Span,
}

impl ServiceUnit {
    /// Creates the unit for `kind`, creating its directories.
    ///
    /// Containers are named `<chain>-<instance>-<name>` and images `<tag>-<chain>`.
    ///
    /// # Errors
    ///
    /// If a directory cannot be created, an error will be returned.
    pub fn new(
        kind: ServiceKind, config: &StackConfig, root: &Path, instance: &str, parent: &Span,
    ) -> Result<Self, OrchestratorError> {
        let mut unit = Self {
            kind,
            behavior: behavior_for(kind),
            layout: UnitLayout::new(root, config.common(kind)),
            container_name: String::new(),
            image: String::new(),
            container_id: None,
            state: UnitState::Unconfigured,
            span: Span::none(),
        };
        unit.reload(config, root, instance, parent)?;
        Ok(unit)
    }

    /// Re-derives names and directories after the configuration changed. The container handle is kept.
    ///
    /// # Errors
    ///
    /// If a directory cannot be created, an error will be returned.
    pub fn reload(
        &mut self, config: &StackConfig, root: &Path, instance: &str, parent: &Span,
    ) -> Result<(), OrchestratorError> {
        let common = config.common(self.kind);
        self.container_name = format!("{}-{}-{}", config.chain_name(), instance, common.name);
        self.image = format!("{}-{}", common.tag, config.chain_name());
        self.layout = UnitLayout::new(root, common);
        self.layout.create_dirs()?;
        self.span = info_span!(parent: parent, "unit", service = %self.kind);
        Ok(())
    }

    /// Service kind.
    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    /// Lifecycle state.
    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Container name.
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Image reference.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Directories on the host.
    pub fn layout(&self) -> &UnitLayout {
        &self.layout
    }

    /// Tracing span of the unit.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Returns `true` if the unit holds a container handle.
    pub fn is_launched(&self) -> bool {
        self.container_id.is_some()
    }

    /// Renders every template of the unit into its service directory, overwriting previous output.
    ///
    /// # Errors
    ///
    /// If a template is missing, invalid, or references an unknown key, or a file cannot be written, an error will be
    /// returned.
    pub fn configure(&mut self, view: &StackView<'_>) -> Result<(), OrchestratorError> {
        let _entered = self.span.enter();
        let service = self.kind;

        let mut subst = Substitutions::for_service(view.config, service).context(Configuration)?;
        subst.insert("timestamp", chrono::Local::now().to_rfc3339());
        self.behavior
            .configure(view, &self.layout, &mut subst)
            .context(Service {
                service,
                step: "configure",
            })?;

        let templates_dir = view.templates_dir();
        let json_subst = subst.jsonized();
        for file in self.behavior.templates() {
            let source_path = templates_dir.join(file.source);
            let source = std::fs::read_to_string(&source_path).context(Filesystem { path: &source_path })?;
            let context = if file.json { &json_subst } else { &subst };
            let rendered = template::Template::parse(&source)
                .and_then(|template| template.render(context))
                .context(RenderTemplate {
                    service,
                    path: &source_path,
                })?;

            let target = self.layout.service_dir.join(file.target);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).context(Filesystem { path: parent })?;
            }
            std::fs::write(&target, rendered).context(Filesystem { path: &target })?;
            debug!("Rendered '{}'.", target.display());
        }

        self.state = UnitState::Configured;
        Ok(())
    }

    /// Builds the unit's image.
    ///
    /// # Errors
    ///
    /// If the build fails or does not produce the image, an error will be returned.
    pub async fn build(&mut self, runtime: &dyn ContainerRuntime, config: &StackConfig) -> Result<(), OrchestratorError> {
        let show_build = config.common(self.kind).show_build;
        let result = build_image(runtime, self.kind, &self.layout.build_dir, &self.image, show_build).await;
        self.state = if result.is_ok() {
            UnitState::Built
        } else {
            UnitState::BuildFailed
        };
        result
    }

    /// Assembles the container specification from the unit's launch plan and the configuration.
    ///
    /// # Errors
    ///
    /// If the unit cannot produce its launch plan, an error will be returned.
    pub fn container_spec(&self, view: &StackView<'_>) -> Result<ContainerSpec, OrchestratorError> {
        let common = view.config.common(self.kind);
        let plan = self.behavior.prepare(view, &self.layout).context(Service {
            service: self.kind,
            step: "prepare",
        })?;

        let mut mounts = plan.mounts;
        mounts.extend(common.mounts.iter().map(|mount| Mount {
            source: mount.source.clone(),
            target: mount.target.clone(),
            kind: mount.kind,
        }));

        let private = view.topology.is_private();
        let mut labels = default_labels();
        labels.insert("chain".to_string(), view.config.chain_name().to_string());
        labels.insert("service".to_string(), self.kind.to_string());

        Ok(ContainerSpec {
            name: self.container_name.clone(),
            image: self.image.clone(),
            command: plan.command,
            env: plan.env,
            mounts,
            published_ports: if private { plan.published_ports } else { Vec::new() },
            memory_limit: plan.memory_limit,
            network_mode: if private { NetworkMode::Bridge } else { NetworkMode::Host },
            user: plan.user,
            labels,
            log_max_size: Some(LOG_MAX_SIZE.to_string()),
        })
    }

    /// Runs the unit's container.
    ///
    /// # Errors
    ///
    /// If a container with the same name is already running, the image does not exist, or the runtime fails, an
    /// error will be returned.
    pub async fn launch(&mut self, runtime: &dyn ContainerRuntime, view: &StackView<'_>) -> Result<(), OrchestratorError> {
        let running = runtime
            .list_containers(&ContainerFilter::running_named(self.container_name.as_str()))
            .await
            .context(Runtime)?;
        if !running.is_empty() {
            self.state = UnitState::LaunchConflict;
            return LaunchConflict {
                container: self.container_name.as_str(),
            }
            .fail();
        }

        if !runtime.image_exists(&self.image).await.context(Runtime)? {
            return ImageNotFound {
                service: self.kind,
                image: self.image.as_str(),
            }
            .fail();
        }

        let spec = self.container_spec(view)?;
        info!("Launching container '{}' from image '{}'...", spec.name, spec.image);
        let id = runtime.run_container(&spec).await.context(Runtime)?;
        self.container_id = Some(id);
        self.state = UnitState::Launched;

        let status = runtime.container_status(&self.container_name).await.context(Runtime)?;
        debug!(%status, "Container launched.");
        Ok(())
    }

    /// Waits for the unit's readiness phrase, if it has one and waiting is enabled.
    ///
    /// # Errors
    ///
    /// If the phrase does not show up in time, or the logs end first, an error will be returned.
    pub async fn await_ready(&mut self, runtime: &dyn ContainerRuntime, view: &StackView<'_>) -> Result<(), OrchestratorError> {
        let common = view.config.common(self.kind);
        let readiness = match self.behavior.readiness(view) {
            Some(readiness) if common.wait_startup => readiness,
            _ => {
                self.state = UnitState::Gated;
                return Ok(());
            }
        };

        let timeout = common
            .startup_timeout
            .map(Duration::from_secs)
            .unwrap_or(readiness.timeout);
        let gate = ReadinessGate::new(readiness.phrase, timeout).with_echo(common.show_startup);
        let options = if readiness.from_latest {
            LogOptions::from_latest()
        } else {
            LogOptions::from_start()
        };

        info!("Waiting for phrase \"{}\" in logs...", gate.phrase());
        let lines = self
            .behavior
            .log_lines(runtime, &self.container_name, &self.layout, view, options);
        match gate.wait(lines).await.context(Runtime)? {
            GateOutcome::Found => {
                info!("Found phrase \"{}\".", gate.phrase());
                self.state = UnitState::Gated;
                Ok(())
            }
            GateOutcome::StreamEnded => {
                self.state = UnitState::ReadinessTimeout;
                LogStreamEnded {
                    service: self.kind,
                    phrase: gate.phrase(),
                }
                .fail()
            }
            GateOutcome::TimedOut => {
                self.state = UnitState::ReadinessTimeout;
                ReadinessTimeout {
                    service: self.kind,
                    phrase: gate.phrase(),
                    timeout,
                }
                .fail()
            }
        }
    }

    /// Attaches the container to the private network, then checks it is still running.
    ///
    /// # Errors
    ///
    /// If attaching fails or the container is no longer running, an error will be returned.
    pub async fn attach(
        &mut self, runtime: &dyn ContainerRuntime, config: &StackConfig, topology: &NetworkTopology,
    ) -> Result<(), OrchestratorError> {
        topology.attach(runtime, self.kind, &self.container_name, config).await?;

        let status = runtime.container_status(&self.container_name).await.context(Runtime)?;
        if !status.is_running() {
            warn!(%status, "Container is not running after launch.");
            return NotRunning {
                service: self.kind,
                container: self.container_name.as_str(),
            }
            .fail();
        }

        self.state = UnitState::Ready;
        Ok(())
    }

    /// Runs the unit's one-time startup logic.
    ///
    /// # Errors
    ///
    /// If the startup logic fails, an error will be returned.
    pub async fn start(
        &mut self, runtime: &dyn ContainerRuntime, chain: &ChainClient, config: &mut StackConfig, config_path: &Path,
        topology: &NetworkTopology, root: &Path,
    ) -> Result<(), OrchestratorError> {
        let mut ctx = StartContext {
            config,
            config_path,
            topology,
            root,
            runtime,
            chain,
            container: &self.container_name,
            layout: &self.layout,
        };
        self.behavior.start(&mut ctx).await.context(Service {
            service: self.kind,
            step: "start",
        })?;

        info!("Service '{}' is running.", self.kind);
        self.state = UnitState::Running;
        Ok(())
    }

    /// Stops and removes the unit's container.
    ///
    /// Without a container handle this does nothing. A container that no longer exists counts as stopped.
    ///
    /// # Errors
    ///
    /// If the runtime fails for any other reason, an error will be returned.
    pub async fn stop(&mut self, runtime: &dyn ContainerRuntime, view: &StackView<'_>) -> Result<(), OrchestratorError> {
        if self.container_id.is_none() {
            return Ok(());
        }
        let name = self.container_name.clone();

        let status = match runtime.container_status(&name).await {
            Ok(status) => status,
            Err(e) if e.is_not_found() => {
                debug!("Container '{}' already gone.", name);
                self.mark_stopped();
                return Ok(());
            }
            Err(e) => return Err(e).context(Runtime),
        };

        if status.is_running() {
            if let Err(e) = self.behavior.before_stop(runtime, &name, &self.layout, view).await {
                warn!(error = %e, "Pre-stop step failed. Stopping anyway.");
            }

            info!("Stopping container '{}'...", name);
            let container = name.as_str();
            let stopped = (move || async move { runtime.stop_container(container, STOP_GRACE_PERIOD).await })
                .retry(
                    ConstantBuilder::default()
                        .with_delay(STOP_RETRY_DELAY)
                        .with_max_times(STOP_ATTEMPTS - 1),
                )
                .when(|e| !e.is_not_found())
                .notify(|e, delay| warn!(error = %e, "Failed to stop container. Retrying in {:?}...", delay))
                .await;
            match stopped {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    self.mark_stopped();
                    return Ok(());
                }
                Err(e) => warn!(error = %e, "Giving up on graceful stop. Removing container."),
            }
        }

        match runtime.remove_container(&name).await {
            Ok(()) => info!("Removed container '{}'.", name),
            Err(e) if e.is_not_found() || e.is_in_progress() => debug!(error = %e, "Container removal not needed."),
            Err(e) => return Err(e).context(Runtime),
        }

        self.mark_stopped();
        Ok(())
    }

    fn mark_stopped(&mut self) {
        self.container_id = None;
        self.state = UnitState::Stopped;
    }

    /// Log lines of the unit, from wherever the unit writes them.
    pub fn log_lines(&self, runtime: &dyn ContainerRuntime, view: &StackView<'_>, options: LogOptions) -> LogLines {
        self.behavior
            .log_lines(runtime, &self.container_name, &self.layout, view, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        runtime::memory::{Call, MemoryRuntime},
        testing,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        config: StackConfig,
        topology: NetworkTopology,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            testing::write_templates(&root.join("templates"));
            let config = testing::local_config();
            let topology = NetworkTopology::host(&config);
            Self {
                _dir: dir,
                root,
                config,
                topology,
            }
        }

        fn view(&self) -> StackView<'_> {
            StackView {
                config: &self.config,
                topology: &self.topology,
                root: &self.root,
            }
        }

        fn unit(&self, kind: ServiceKind) -> ServiceUnit {
            ServiceUnit::new(kind, &self.config, &self.root, "42", &Span::none()).unwrap()
        }
    }

    #[test]
    fn names_follow_chain_and_instance() {
        let fixture = Fixture::new();
        let unit = fixture.unit(ServiceKind::Cache);

        assert_eq!(unit.container_name(), "telos-local-42-redis");
        assert_eq!(unit.image(), "tevm:redis-telos-local");
        assert!(unit.layout().service_dir().ends_with("docker/redis"));
        assert!(unit.layout().config_dir().unwrap().is_dir());
        assert!(unit.layout().logs_dir().is_err());
    }

    #[test]
    fn configure_renders_templates() {
        let fixture = Fixture::new();
        let mut unit = fixture.unit(ServiceKind::Cache);

        unit.configure(&fixture.view()).unwrap();

        let rendered = std::fs::read_to_string(unit.layout().service_dir().join("config/redis.conf")).unwrap();
        assert_eq!(rendered, "port 6379\n");
        assert_eq!(unit.state(), UnitState::Configured);
    }

    #[test]
    fn json_templates_get_json_literals() {
        let fixture = Fixture::new();
        let mut unit = fixture.unit(ServiceKind::Rpc);

        unit.configure(&fixture.view()).unwrap();

        let rendered = std::fs::read_to_string(unit.layout().service_dir().join("build/config.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["chainId"], 41);
        assert_eq!(value["nodeos_read"], "http://127.0.0.1:8888");
    }

    #[test]
    fn missing_template_is_reported_with_its_path() {
        let fixture = Fixture::new();
        std::fs::remove_file(fixture.root.join("templates/docker/redis/config/redis.conf")).unwrap();
        let mut unit = fixture.unit(ServiceKind::Cache);

        match unit.configure(&fixture.view()) {
            Err(OrchestratorError::Filesystem { path, .. }) => assert!(path.ends_with("redis.conf")),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn host_networking_publishes_nothing() {
        let mut fixture = Fixture::new();
        fixture.config.cache.common.mounts.push(evmstack_config::MountSpec {
            source: "cache-extra".to_string(),
            target: "/extra".to_string(),
            kind: evmstack_config::MountKind::Volume,
        });
        let unit = fixture.unit(ServiceKind::Cache);

        let spec = unit.container_spec(&fixture.view()).unwrap();
        assert!(spec.published_ports.is_empty());
        assert_eq!(spec.network_mode, NetworkMode::Host);
        assert_eq!(spec.mounts.len(), 3);
        assert_eq!(spec.mounts[2].target, "/extra");
        assert_eq!(spec.labels.get("service").map(String::as_str), Some("cache"));
        assert_eq!(spec.log_max_size.as_deref(), Some("100m"));
    }

    #[tokio::test]
    async fn launch_conflict_leaves_existing_container_alone() {
        let fixture = Fixture::new();
        let runtime = MemoryRuntime::new();
        let mut unit = fixture.unit(ServiceKind::Cache);
        runtime.add_image(unit.image());
        runtime.add_running(unit.container_name());

        let result = unit.launch(&runtime, &fixture.view()).await;

        assert!(matches!(result, Err(OrchestratorError::LaunchConflict { .. })));
        assert_eq!(unit.state(), UnitState::LaunchConflict);
        assert!(!runtime.calls().iter().any(|call| matches!(call, Call::Run(_))));
    }

    #[tokio::test]
    async fn launch_without_image_fails() {
        let fixture = Fixture::new();
        let runtime = MemoryRuntime::new();
        let mut unit = fixture.unit(ServiceKind::Cache);

        let result = unit.launch(&runtime, &fixture.view()).await;
        assert!(matches!(result, Err(OrchestratorError::ImageNotFound { .. })));
        assert!(!unit.is_launched());
    }

    #[tokio::test]
    async fn readiness_timeout_is_fatal() {
        let mut fixture = Fixture::new();
        fixture.config.cache.common.startup_timeout = Some(1);
        let runtime = MemoryRuntime::new();
        runtime.script_logs("-redis", &["starting"]);
        let mut unit = fixture.unit(ServiceKind::Cache);
        runtime.add_image(unit.image());

        unit.launch(&runtime, &fixture.view()).await.unwrap();
        let result = unit.await_ready(&runtime, &fixture.view()).await;

        assert!(matches!(result, Err(OrchestratorError::ReadinessTimeout { .. })));
        assert_eq!(unit.state(), UnitState::ReadinessTimeout);
    }

    #[tokio::test]
    async fn log_stream_ending_before_readiness_is_fatal() {
        let fixture = Fixture::new();
        let runtime = MemoryRuntime::new();
        runtime.script_logs("-redis", &["starting", "shutting down"]);
        runtime.close_logs("-redis");
        let mut unit = fixture.unit(ServiceKind::Cache);
        runtime.add_image(unit.image());

        unit.launch(&runtime, &fixture.view()).await.unwrap();
        let result = unit.await_ready(&runtime, &fixture.view()).await;

        assert!(matches!(result, Err(OrchestratorError::LogStreamEnded { .. })));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let fixture = Fixture::new();
        let runtime = MemoryRuntime::new();
        runtime.script_logs("-redis", &["Ready to accept connections tcp"]);
        let mut unit = fixture.unit(ServiceKind::Cache);
        runtime.add_image(unit.image());

        unit.stop(&runtime, &fixture.view()).await.unwrap();
        assert!(runtime.calls().is_empty());

        unit.launch(&runtime, &fixture.view()).await.unwrap();
        unit.await_ready(&runtime, &fixture.view()).await.unwrap();
        unit.stop(&runtime, &fixture.view()).await.unwrap();
        unit.stop(&runtime, &fixture.view()).await.unwrap();

        let stops = runtime
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Stop(_) | Call::Remove(_)))
            .count();
        assert_eq!(stops, 2);
        assert_eq!(unit.state(), UnitState::Stopped);
        assert!(runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn stop_of_vanished_container_succeeds() {
        let fixture = Fixture::new();
        let runtime = MemoryRuntime::new();
        let mut unit = fixture.unit(ServiceKind::Cache);
        runtime.add_image(unit.image());

        unit.launch(&runtime, &fixture.view()).await.unwrap();
        runtime.remove_container(unit.container_name()).await.unwrap();

        unit.stop(&runtime, &fixture.view()).await.unwrap();
        assert!(!unit.is_launched());
    }

    #[tokio::test]
    async fn exited_container_fails_liveness_check() {
        let fixture = Fixture::new();
        let runtime = MemoryRuntime::new();
        runtime.exit_on_start("-redis");
        let mut unit = fixture.unit(ServiceKind::Cache);
        runtime.add_image(unit.image());

        unit.launch(&runtime, &fixture.view()).await.unwrap();
        let result = unit.attach(&runtime, &fixture.config, &fixture.topology).await;

        assert!(matches!(result, Err(OrchestratorError::NotRunning { .. })));
    }
}
