use std::{path::PathBuf, time::Duration};

use evmstack_config::{template::TemplateError, ConfigurationError, ServiceKind};
use evmstack_error::GenericError;
use snafu::Snafu;

use crate::{chain::ChainError, runtime::RuntimeError};

/// An orchestration error.
///
/// A stack start that fails with any of these unwinds every unit it launched before returning the error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum OrchestratorError {
    /// The image did not exist after its build finished.
    #[snafu(display("Failed to build image '{}' for service '{}'. Build output:\n{}", image, service, output))]
    ImageBuildFailed {
        /// Service being built.
        service: ServiceKind,

        /// Image reference.
        image: String,

        /// Accumulated build output.
        output: String,
    },

    /// The image to launch from does not exist.
    #[snafu(display("Image '{}' for service '{}' not found.", image, service))]
    ImageNotFound {
        /// Service being launched.
        service: ServiceKind,

        /// Image reference.
        image: String,
    },

    /// A container with the same name is already running.
    #[snafu(display("Container '{}' is already running.", container))]
    LaunchConflict {
        /// Container name.
        container: String,
    },

    /// The readiness phrase did not show up in time.
    #[snafu(display(
        "Timed out after {:?} waiting for phrase \"{}\" in the logs of service '{}'.",
        timeout,
        phrase,
        service
    ))]
    ReadinessTimeout {
        /// Service being waited on.
        service: ServiceKind,

        /// Expected phrase.
        phrase: String,

        /// Time waited.
        timeout: Duration,
    },

    /// The log stream ended before the readiness phrase showed up.
    #[snafu(display("Logs of service '{}' ended before phrase \"{}\" appeared.", service, phrase))]
    LogStreamEnded {
        /// Service being waited on.
        service: ServiceKind,

        /// Expected phrase.
        phrase: String,
    },

    /// The container was not running when it had to be.
    #[snafu(display("Service '{}' is not running (container '{}').", service, container))]
    NotRunning {
        /// Service.
        service: ServiceKind,

        /// Container name.
        container: String,
    },

    /// The service is not part of the active service list.
    #[snafu(display("Service '{}' is not active in this stack.", service))]
    UnknownService {
        /// Service.
        service: ServiceKind,
    },

    /// Another daemon holds the run lock of this deployment.
    #[snafu(display("Daemon already running: pid file '{}' exists.", path.display()))]
    AlreadyRunning {
        /// Path of the pid file.
        path: PathBuf,
    },

    /// The HTTP client could not be created.
    #[snafu(display("Failed to create HTTP client."))]
    HttpClient {
        /// Error source.
        source: ChainError,
    },

    /// The configuration could not be loaded, mutated, or written.
    #[snafu(display("Configuration error."))]
    Configuration {
        /// Error source.
        source: ConfigurationError,
    },

    /// A template could not be rendered.
    #[snafu(display("Failed to render template '{}' for service '{}'.", path.display(), service))]
    Template {
        /// Service being configured.
        service: ServiceKind,

        /// Template source path.
        path: PathBuf,

        /// Error source.
        source: TemplateError,
    },

    /// A file or directory of the deployment could not be accessed.
    #[snafu(display("Failed to access '{}'.", path.display()))]
    Filesystem {
        /// Path accessed.
        path: PathBuf,

        /// Error source.
        source: std::io::Error,
    },

    /// The container runtime failed.
    #[snafu(display("Container runtime request failed."))]
    Runtime {
        /// Error source.
        source: RuntimeError,
    },

    /// A service-specific step failed.
    #[snafu(display("Service '{}' failed during {}.", service, step))]
    Service {
        /// Service.
        service: ServiceKind,

        /// Lifecycle step, such as `start`.
        step: &'static str,

        /// Error source.
        source: GenericError,
    },
}
