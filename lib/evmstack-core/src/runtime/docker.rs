use std::{collections::HashMap, net::Ipv4Addr, pin::pin, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StopContainerOptions, WaitContainerOptions,
    },
    errors::Error,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::BuildImageOptions,
    models::{
        ContainerStateStatusEnum, EndpointIpamConfig, EndpointSettings, HostConfig, HostConfigLogConfig, Ipam,
        IpamConfig, Mount as DockerMount, MountTypeEnum, PortBinding,
    },
    network::{ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions},
    Docker,
};
use bytes::Bytes;
use evmstack_config::MountKind;
use futures::{stream::BoxStream, StreamExt as _};
use tracing::{debug, trace};

use super::{
    BuildEvent, ContainerFilter, ContainerRuntime, ContainerSpec, ContainerStatus, ContainerSummary, ExecOutput,
    LogOptions, NetworkHandle, NetworkSpec, RuntimeError,
};

/// Docker Engine runtime.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the Docker daemon using the local defaults (`DOCKER_HOST`, or the platform socket).
    ///
    /// # Errors
    ///
    /// If the client cannot be configured, an error will be returned. The daemon is not contacted until the first
    /// request.
    pub fn connect_with_defaults() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_defaults().map_err(|e| classify("docker", e))?;
        Ok(Self { docker })
    }

    /// Checks that the daemon answers.
    ///
    /// # Errors
    ///
    /// If the daemon cannot be reached, an error will be returned.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(|e| classify("docker", e))?;
        Ok(())
    }
}

/// Maps a `bollard` error onto the runtime error taxonomy.
fn classify(resource: &str, error: Error) -> RuntimeError {
    match error {
        Error::DockerResponseServerError { status_code, message } => match status_code {
            404 => RuntimeError::NotFound {
                resource: resource.to_string(),
                message,
            },
            409 if message.contains("in progress") => RuntimeError::InProgress {
                resource: resource.to_string(),
                message,
            },
            _ => RuntimeError::Api { status_code, message },
        },
        e @ (Error::IOError { .. } | Error::HyperResponseError { .. } | Error::RequestTimeoutError) => {
            RuntimeError::Unreachable { message: e.to_string() }
        }
        e => RuntimeError::Other { message: e.to_string() },
    }
}

fn to_docker_mount(mount: &super::Mount) -> DockerMount {
    let typ = match mount.kind {
        MountKind::Bind => MountTypeEnum::BIND,
        MountKind::Volume => MountTypeEnum::VOLUME,
        MountKind::Tmpfs => MountTypeEnum::TMPFS,
    };

    DockerMount {
        target: Some(mount.target.clone()),
        source: (!mount.source.is_empty()).then(|| mount.source.clone()),
        typ: Some(typ),
        ..Default::default()
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let (exposed_ports, port_bindings) = if spec.published_ports.is_empty() {
        (None, None)
    } else {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.published_ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.to_string()),
                }]),
            );
        }
        (Some(exposed_ports), Some(port_bindings))
    };

    let log_config = spec.log_max_size.as_ref().map(|max_size| HostConfigLogConfig {
        typ: Some("json-file".to_string()),
        config: Some([("max-size".to_string(), max_size.clone())].into_iter().collect()),
    });

    Config {
        image: Some(spec.image.clone()),
        cmd: spec.command.clone(),
        env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
        user: spec.user.clone(),
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports,
        host_config: Some(HostConfig {
            mounts: Some(spec.mounts.iter().map(to_docker_mount).collect()),
            port_bindings,
            memory: spec.memory_limit,
            network_mode: Some(spec.network_mode.as_str().to_string()),
            log_config,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Grace period for a stop request, in whole seconds, saturating at what the API accepts.
fn stop_timeout_secs(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX)
}

fn log_payload(output: LogOutput) -> Bytes {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn build_image(&self, tag: &str, context: Bytes) -> BoxStream<'static, Result<BuildEvent, RuntimeError>> {
        let options = BuildImageOptions {
            t: tag.to_string(),
            dockerfile: "Dockerfile".to_string(),
            rm: true,
            ..Default::default()
        };

        let tag = tag.to_string();
        let docker = self.docker.clone();
        stream! {
            let mut events = pin!(docker.build_image(options, None, Some(context)));
            while let Some(result) = events.next().await {
                yield result
                    .map(|info| BuildEvent {
                        stream: info.stream,
                        error: info.error,
                    })
                    .map_err(|e| classify(&tag, e));
            }
        }
        .boxed()
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match classify(image, e) {
                RuntimeError::NotFound { .. } => Ok(false),
                e => Err(e),
            },
        }
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        if let Some(name) = &filter.name {
            // The name filter is a substring match; exact matching happens below.
            filters.insert("name".to_string(), vec![name.clone()]);
        }
        if let Some(label) = &filter.label {
            filters.insert("label".to_string(), vec![label.clone()]);
        }
        if filter.running_only {
            filters.insert("status".to_string(), vec!["running".to_string()]);
        }

        let options = ListContainersOptions {
            all: !filter.running_only,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| classify("containers", e))?;

        let summaries = containers
            .into_iter()
            .filter_map(|container| {
                let id = container.id?;
                let name = container
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                Some(ContainerSummary { id, name })
            })
            .filter(|summary| filter.name.as_ref().map_or(true, |name| &summary.name == name))
            .collect();

        Ok(summaries)
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        debug!("Creating container '{}' from image '{}'...", spec.name, spec.image);

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(create_options), container_config(spec))
            .await
            .map_err(|e| classify(&spec.name, e))?;

        self.docker
            .start_container::<String>(&spec.name, None)
            .await
            .map_err(|e| classify(&spec.name, e))?;

        debug!("Started container '{}' (ID: {}).", spec.name, response.id);
        Ok(response.id)
    }

    async fn container_status(&self, name: &str) -> Result<ContainerStatus, RuntimeError> {
        let response = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(name, e))?;

        let state = response.state.unwrap_or_default();
        let status = match state.status {
            Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited(state.exit_code),
            _ => ContainerStatus::Other,
        };
        Ok(status)
    }

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: stop_timeout_secs(timeout),
        };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(classify(name, e)),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| classify(name, e))
    }

    async fn wait_container(&self, name: &str) -> Result<i64, RuntimeError> {
        let mut wait_stream = self.docker.wait_container(name, None::<WaitContainerOptions<String>>);
        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exit codes surface as an error from `bollard`.
            Some(Err(Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(classify(name, e)),
            None => Err(RuntimeError::Other {
                message: format!("wait stream for '{}' ended without a status", name),
            }),
        }
    }

    fn logs(&self, name: &str, options: LogOptions) -> BoxStream<'static, Result<Bytes, RuntimeError>> {
        let options = LogsOptions::<String> {
            follow: options.follow,
            stdout: true,
            stderr: true,
            tail: options.tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
            ..Default::default()
        };

        let name = name.to_string();
        let docker = self.docker.clone();
        stream! {
            let mut chunks = pin!(docker.logs(&name, Some(options)));
            while let Some(result) = chunks.next().await {
                yield result.map(log_payload).map_err(|e| classify(&name, e));
            }
        }
        .boxed()
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput, RuntimeError> {
        trace!("Running {:?} in container '{}'.", command, name);

        let options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(name, options)
            .await
            .map_err(|e| classify(name, e))?;

        let mut output = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(name, e))?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| classify(name, e))?;
                    output.push_str(&String::from_utf8_lossy(&log_payload(chunk)));
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(name, e))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            output,
        })
    }

    async fn exec_detached(&self, name: &str, command: &[String]) -> Result<(), RuntimeError> {
        trace!("Starting {:?} detached in container '{}'.", command, name);

        let options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(name, options)
            .await
            .map_err(|e| classify(name, e))?;

        let start_options = StartExecOptions {
            detach: true,
            ..Default::default()
        };
        self.docker
            .start_exec(&exec.id, Some(start_options))
            .await
            .map_err(|e| classify(name, e))?;

        Ok(())
    }

    async fn get_network(&self, name: &str) -> Result<Option<NetworkHandle>, RuntimeError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => Ok(Some(NetworkHandle {
                id: network.id,
                name: network.name.unwrap_or_else(|| name.to_string()),
            })),
            Err(e) => match classify(name, e) {
                RuntimeError::NotFound { .. } => Ok(None),
                e => Err(e),
            },
        }
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkHandle, RuntimeError> {
        debug!("Creating network '{}' ({})...", spec.name, spec.subnet);

        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(spec.subnet.clone()),
                    gateway: Some(spec.gateway.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            labels: spec.labels.clone().into_iter().collect(),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| classify(&spec.name, e))?;

        self.get_network(&spec.name).await?.ok_or_else(|| RuntimeError::NotFound {
            resource: spec.name.clone(),
            message: "network missing right after creation".to_string(),
        })
    }

    async fn connect_network(
        &self, network: &str, container: &str, address: Option<Ipv4Addr>,
    ) -> Result<(), RuntimeError> {
        let endpoint_config = EndpointSettings {
            ipam_config: address.map(|address| EndpointIpamConfig {
                ipv4_address: Some(address.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config,
        };
        self.docker
            .connect_network(network, options)
            .await
            .map_err(|e| classify(container, e))
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker.remove_network(name).await.map_err(|e| classify(name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_classified() {
        let not_found = classify(
            "nodeos",
            Error::DockerResponseServerError {
                status_code: 404,
                message: "No such container: nodeos".to_string(),
            },
        );
        assert!(not_found.is_not_found());

        let in_progress = classify(
            "nodeos",
            Error::DockerResponseServerError {
                status_code: 409,
                message: "removal of container nodeos is already in progress".to_string(),
            },
        );
        assert!(in_progress.is_in_progress());

        let conflict = classify(
            "nodeos",
            Error::DockerResponseServerError {
                status_code: 409,
                message: "Conflict. The container name is already in use".to_string(),
            },
        );
        assert!(matches!(conflict, RuntimeError::Api { status_code: 409, .. }));
    }

    #[test]
    fn transport_errors_are_unreachable() {
        assert!(classify("docker", Error::RequestTimeoutError).is_unreachable());
    }

    #[test]
    fn published_ports_bind_same_number() {
        let spec = ContainerSpec {
            name: "telos-local-1-redis".to_string(),
            image: "tevm:redis-telos-local".to_string(),
            published_ports: vec![6379],
            log_max_size: Some("100m".to_string()),
            ..Default::default()
        };
        let config = container_config(&spec);

        let host_config = config.host_config.unwrap();
        let bindings = host_config.port_bindings.unwrap();
        let binding = bindings["6379/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("6379"));
        assert_eq!(host_config.network_mode.as_deref(), Some("host"));
        assert_eq!(
            host_config.log_config.unwrap().config.unwrap()["max-size"],
            "100m".to_string()
        );
        assert!(config.exposed_ports.unwrap().contains_key("6379/tcp"));
    }

    #[test]
    fn stop_timeout_saturates() {
        assert_eq!(stop_timeout_secs(Duration::from_secs(10)), 10);
        assert_eq!(stop_timeout_secs(Duration::MAX), i64::MAX);
    }

    #[tokio::test]
    async fn streams_outlive_the_runtime_handle() {
        let runtime = DockerRuntime::connect_with_defaults().unwrap();
        let build = runtime.build_image("evmstack:unused", Bytes::new());
        let logs = runtime.logs("evmstack-unused", LogOptions::from_start());
        drop(runtime);

        // Neither stream is polled, so no daemon is needed.
        let streams: (BoxStream<'static, _>, BoxStream<'static, _>) = (build, logs);
        drop(streams);
    }

    /// Needs a reachable Docker daemon with the `busybox` image present.
    #[tokio::test]
    #[ignore]
    async fn runs_container_against_local_daemon() {
        use futures::StreamExt as _;

        use crate::{
            logs::decode_lines,
            runtime::{created_by_selector, default_labels, ContainerFilter, ContainerRuntime as _, LogOptions},
        };

        let runtime = DockerRuntime::connect_with_defaults().unwrap();
        runtime.ping().await.unwrap();

        let spec = ContainerSpec {
            name: format!("evmstack-it-{}", std::process::id()),
            image: "busybox".to_string(),
            command: Some(vec!["echo".to_string(), "ready to go".to_string()]),
            labels: default_labels(),
            ..Default::default()
        };
        runtime.run_container(&spec).await.unwrap();
        assert_eq!(runtime.wait_container(&spec.name).await.unwrap(), 0);

        let options = LogOptions {
            follow: false,
            tail: None,
        };
        let lines: Vec<_> = decode_lines(runtime.logs(&spec.name, options)).collect().await;
        assert!(lines
            .iter()
            .any(|line| line.as_ref().is_ok_and(|line| line.contains("ready to go"))));

        let labelled = runtime
            .list_containers(&ContainerFilter::labelled(created_by_selector()))
            .await
            .unwrap();
        assert!(labelled.iter().any(|c| c.name == spec.name));

        runtime.remove_container(&spec.name).await.unwrap();
        assert!(runtime.container_status(&spec.name).await.unwrap_err().is_not_found());
    }
}
