//! Container runtime boundary.
//!
//! Everything the orchestrator needs from a container engine goes through [`ContainerRuntime`]. Resources are
//! addressed by name, since every container and network the stack creates has a deterministic one.

use std::{collections::BTreeMap, fmt, net::Ipv4Addr, path::PathBuf, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use evmstack_config::MountKind;
use futures::stream::BoxStream;
use snafu::Snafu;

mod docker;
pub use self::docker::DockerRuntime;

#[cfg(test)]
pub(crate) mod memory;

/// Label key attached to every resource the stack creates.
pub const CREATED_BY_LABEL: &str = "created_by";

/// Label value attached to every resource the stack creates.
pub const CREATED_BY_VALUE: &str = "evmstack";

/// Returns the labels attached to every resource the stack creates.
pub fn default_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(CREATED_BY_LABEL.to_string(), CREATED_BY_VALUE.to_string());
    labels
}

/// Label selector matching every resource the stack creates, as `key=value`.
pub fn created_by_selector() -> String {
    format!("{}={}", CREATED_BY_LABEL, CREATED_BY_VALUE)
}

/// A container runtime error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum RuntimeError {
    /// The runtime could not be reached at all.
    #[snafu(display("Container runtime is unreachable: {}", message))]
    Unreachable {
        /// Underlying transport error.
        message: String,
    },

    /// The named resource does not exist.
    #[snafu(display("Resource '{}' not found: {}", resource, message))]
    NotFound {
        /// Name of the resource.
        resource: String,

        /// Message returned by the runtime.
        message: String,
    },

    /// The runtime is already performing a conflicting operation on the resource.
    #[snafu(display("Operation already in progress on '{}': {}", resource, message))]
    InProgress {
        /// Name of the resource.
        resource: String,

        /// Message returned by the runtime.
        message: String,
    },

    /// The runtime rejected the request.
    #[snafu(display("Container runtime returned status {}: {}", status_code, message))]
    Api {
        /// Status code of the response.
        status_code: u16,

        /// Message returned by the runtime.
        message: String,
    },

    /// Any other runtime failure.
    #[snafu(display("Container runtime error: {}", message))]
    Other {
        /// Description of the failure.
        message: String,
    },
}

impl RuntimeError {
    /// Returns `true` if the error means the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if the error means a conflicting operation is still running and the request may be retried.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress { .. })
    }

    /// Returns `true` if the error means the runtime could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// A progress event from an image build.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildEvent {
    /// Build output text, if the event carried any.
    pub stream: Option<String>,

    /// Error reported by the build, if any.
    pub error: Option<String>,
}

/// A filesystem mount for a container.
#[derive(Clone, Debug, PartialEq)]
pub struct Mount {
    /// Host path, volume name, or empty for tmpfs.
    pub source: String,

    /// Path inside the container.
    pub target: String,

    /// Mount type.
    pub kind: MountKind,
}

impl Mount {
    /// Creates a bind mount of a host path.
    pub fn bind<S>(source: S, target: impl Into<String>) -> Self
    where
        S: Into<PathBuf>,
    {
        Self {
            source: source.into().display().to_string(),
            target: target.into(),
            kind: MountKind::Bind,
        }
    }
}

/// Network mode of a container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// Share the host's network stack.
    #[default]
    Host,

    /// Start on the default bridge; the private network is connected after launch.
    Bridge,
}

impl NetworkMode {
    /// Name of the mode as the runtime understands it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Bridge => "bridge",
        }
    }
}

/// Everything needed to create and start a container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Command, or the image default when `None`.
    pub command: Option<Vec<String>>,

    /// Environment variables.
    pub env: BTreeMap<String, String>,

    /// Filesystem mounts.
    pub mounts: Vec<Mount>,

    /// TCP ports published on the host under the same number.
    pub published_ports: Vec<u16>,

    /// Memory limit, in bytes.
    pub memory_limit: Option<i64>,

    /// Network mode.
    pub network_mode: NetworkMode,

    /// User to run as.
    pub user: Option<String>,

    /// Labels.
    pub labels: BTreeMap<String, String>,

    /// Maximum size of the container's log file before rotation, such as `100m`.
    pub log_max_size: Option<String>,
}

/// Coarse container status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Created but never started.
    Created,

    /// Running.
    Running,

    /// Stopped, with the exit code if known.
    Exited(Option<i64>),

    /// Any other status (paused, restarting, dead, being removed).
    Other,
}

impl ContainerStatus {
    /// Returns `true` if the container is running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited(Some(code)) => write!(f, "exited ({})", code),
            Self::Exited(None) => write!(f, "exited"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A container as reported by a listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container ID.
    pub id: String,

    /// Container name, without the leading slash.
    pub name: String,
}

/// Filter for listing containers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Exact container name.
    pub name: Option<String>,

    /// Label selector, as `key=value`.
    pub label: Option<String>,

    /// Only list running containers.
    pub running_only: bool,
}

impl ContainerFilter {
    /// Matches running containers with exactly the given name.
    pub fn running_named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            label: None,
            running_only: true,
        }
    }

    /// Matches every container, running or not, carrying the given label.
    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            name: None,
            label: Some(label.into()),
            running_only: false,
        }
    }
}

/// Where a log stream starts and whether it follows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep the stream open and yield new output as it is written.
    pub follow: bool,

    /// Only yield the last `n` existing lines. `None` yields all of them.
    pub tail: Option<usize>,
}

impl LogOptions {
    /// Follow from the very beginning of the container's output.
    pub fn from_start() -> Self {
        Self {
            follow: true,
            tail: None,
        }
    }

    /// Follow output produced from now on.
    pub fn from_latest() -> Self {
        Self {
            follow: true,
            tail: Some(0),
        }
    }

    /// Yield the last `n` lines, then follow.
    pub fn tail_then_follow(n: usize) -> Self {
        Self {
            follow: true,
            tail: Some(n),
        }
    }
}

/// Result of a command run inside a container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, if the runtime reported one.
    pub exit_code: Option<i64>,

    /// Combined standard output and standard error.
    pub output: String,
}

impl ExecOutput {
    /// Returns `true` if the command exited with code zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Parameters of a private bridge network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Network name.
    pub name: String,

    /// Subnet in CIDR notation.
    pub subnet: String,

    /// Gateway address.
    pub gateway: Ipv4Addr,

    /// Labels.
    pub labels: BTreeMap<String, String>,
}

/// A network known to the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkHandle {
    /// Network ID, if reported.
    pub id: Option<String>,

    /// Network name.
    pub name: String,
}

/// A container engine.
///
/// Streams are `'static` so they can be consumed after the call that created them returns, or from another task.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Builds an image from a tar archive of a build directory containing a `Dockerfile`.
    fn build_image(&self, tag: &str, context: Bytes) -> BoxStream<'static, Result<BuildEvent, RuntimeError>>;

    /// Returns `true` if an image with the given reference exists locally.
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Lists containers matching `filter`.
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Creates and starts a container, returning its ID.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Returns the current status of a container.
    async fn container_status(&self, name: &str) -> Result<ContainerStatus, RuntimeError>;

    /// Stops a container, killing it once `timeout` has passed. Stopping an already-stopped container succeeds.
    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<(), RuntimeError>;

    /// Removes a stopped container.
    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Waits for a container to exit and returns its exit code.
    async fn wait_container(&self, name: &str) -> Result<i64, RuntimeError>;

    /// Streams a container's combined standard output and standard error, in arbitrary chunks.
    fn logs(&self, name: &str, options: LogOptions) -> BoxStream<'static, Result<Bytes, RuntimeError>>;

    /// Runs a command inside a running container and waits for it to finish.
    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput, RuntimeError>;

    /// Starts a command inside a running container without waiting for it.
    async fn exec_detached(&self, name: &str, command: &[String]) -> Result<(), RuntimeError>;

    /// Looks up a network by name.
    async fn get_network(&self, name: &str) -> Result<Option<NetworkHandle>, RuntimeError>;

    /// Creates a bridge network.
    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkHandle, RuntimeError>;

    /// Connects a container to a network, optionally at a fixed address.
    async fn connect_network(
        &self, network: &str, container: &str, address: Option<Ipv4Addr>,
    ) -> Result<(), RuntimeError>;

    /// Removes a network.
    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError>;
}
