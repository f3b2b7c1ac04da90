//! In-memory container runtime for tests.
//!
//! Every request is recorded in order. Logs, exec results, and exit codes are scripted per container name; unscripted
//! log streams stay open without producing anything.

use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    stream::{self, BoxStream},
    StreamExt as _,
};

use super::{
    BuildEvent, ContainerFilter, ContainerRuntime, ContainerSpec, ContainerStatus, ContainerSummary, ExecOutput,
    LogOptions, NetworkHandle, NetworkSpec, RuntimeError,
};

/// A recorded request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Build(String),
    Run(String),
    Stop(String),
    Remove(String),
    Logs(String),
    Exec(String, Vec<String>),
    ExecDetached(String, Vec<String>),
    CreateNetwork(String),
    Connect {
        network: String,
        container: String,
        address: Option<Ipv4Addr>,
    },
    RemoveNetwork(String),
}

struct Container {
    spec: ContainerSpec,
    status: ContainerStatus,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    images: HashSet<String>,
    failing_builds: HashSet<String>,
    containers: HashMap<String, Container>,
    logs: HashMap<String, Vec<Bytes>>,
    closing_logs: HashSet<String>,
    exec_results: HashMap<String, ExecOutput>,
    exit_codes: HashMap<String, i64>,
    exit_on_start: HashSet<String>,
    networks: HashMap<String, NetworkHandle>,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryRuntime {
    state: Arc<Mutex<State>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn add_image(&self, image: &str) {
        self.state().images.insert(image.to_string());
    }

    /// Builds of `tag` finish without producing the image.
    pub fn fail_build(&self, tag: &str) {
        self.state().failing_builds.insert(tag.to_string());
    }

    /// Log output of every container whose name ends with `suffix`.
    pub fn script_logs(&self, suffix: &str, lines: &[&str]) {
        let chunks = lines.iter().map(|line| Bytes::from(format!("{}\n", line))).collect();
        self.state().logs.insert(suffix.to_string(), chunks);
    }

    /// Log streams of containers ending with `suffix` end after the scripted output instead of staying open.
    pub fn close_logs(&self, suffix: &str) {
        self.state().closing_logs.insert(suffix.to_string());
    }

    pub fn script_exec(&self, program: &str, output: ExecOutput) {
        self.state().exec_results.insert(program.to_string(), output);
    }

    pub fn script_exit_code(&self, suffix: &str, code: i64) {
        self.state().exit_codes.insert(suffix.to_string(), code);
    }

    /// Containers ending with `suffix` exit right after starting.
    pub fn exit_on_start(&self, suffix: &str) {
        self.state().exit_on_start.insert(suffix.to_string());
    }

    /// Adds a running container that was not started through this runtime.
    pub fn add_running(&self, name: &str) {
        let spec = ContainerSpec {
            name: name.to_string(),
            ..Default::default()
        };
        self.state().containers.insert(
            name.to_string(),
            Container {
                spec,
                status: ContainerStatus::Running,
            },
        );
    }

    pub fn spec(&self, name: &str) -> Option<ContainerSpec> {
        self.state().containers.get(name).map(|c| c.spec.clone())
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }
}

fn by_suffix<'a, V>(map: &'a HashMap<String, V>, name: &str) -> Option<&'a V> {
    map.iter().find(|(suffix, _)| name.ends_with(suffix.as_str())).map(|(_, v)| v)
}

fn not_found(name: &str) -> RuntimeError {
    RuntimeError::NotFound {
        resource: name.to_string(),
        message: "no such container".to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    fn build_image(&self, tag: &str, _context: Bytes) -> BoxStream<'static, Result<BuildEvent, RuntimeError>> {
        let mut state = self.state();
        state.calls.push(Call::Build(tag.to_string()));

        let events = if state.failing_builds.contains(tag) {
            vec![
                Ok(BuildEvent {
                    stream: Some("Step 1/2 : FROM scratch\n".to_string()),
                    error: None,
                }),
                Ok(BuildEvent {
                    stream: None,
                    error: Some("failed to solve".to_string()),
                }),
            ]
        } else {
            state.images.insert(tag.to_string());
            vec![Ok(BuildEvent {
                stream: Some("Successfully built\n".to_string()),
                error: None,
            })]
        };
        stream::iter(events).boxed()
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(self.state().images.contains(image))
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let state = self.state();
        let summaries = state
            .containers
            .iter()
            .filter(|(name, _)| filter.name.as_ref().map_or(true, |wanted| *name == wanted))
            .filter(|(_, c)| !filter.running_only || c.status.is_running())
            .filter(|(_, c)| {
                filter.label.as_ref().map_or(true, |label| {
                    label
                        .split_once('=')
                        .is_some_and(|(k, v)| c.spec.labels.get(k).map(String::as_str) == Some(v))
                })
            })
            .map(|(name, _)| ContainerSummary {
                id: format!("id-{}", name),
                name: name.clone(),
            })
            .collect();
        Ok(summaries)
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::Run(spec.name.clone()));

        if !state.images.contains(&spec.image) {
            return Err(RuntimeError::NotFound {
                resource: spec.image.clone(),
                message: "no such image".to_string(),
            });
        }

        let status = if by_suffix_set(&state.exit_on_start, &spec.name) {
            ContainerStatus::Exited(Some(1))
        } else {
            ContainerStatus::Running
        };
        state.containers.insert(
            spec.name.clone(),
            Container {
                spec: spec.clone(),
                status,
            },
        );
        Ok(format!("id-{}", spec.name))
    }

    async fn container_status(&self, name: &str) -> Result<ContainerStatus, RuntimeError> {
        self.state()
            .containers
            .get(name)
            .map(|c| c.status)
            .ok_or_else(|| not_found(name))
    }

    async fn stop_container(&self, name: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::Stop(name.to_string()));
        let container = state.containers.get_mut(name).ok_or_else(|| not_found(name))?;
        container.status = ContainerStatus::Exited(Some(0));
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::Remove(name.to_string()));
        state.containers.remove(name).map(|_| ()).ok_or_else(|| not_found(name))
    }

    async fn wait_container(&self, name: &str) -> Result<i64, RuntimeError> {
        let mut state = self.state();
        let code = by_suffix(&state.exit_codes, name).copied().unwrap_or(0);
        let container = state.containers.get_mut(name).ok_or_else(|| not_found(name))?;
        container.status = ContainerStatus::Exited(Some(code));
        Ok(code)
    }

    fn logs(&self, name: &str, _options: LogOptions) -> BoxStream<'static, Result<Bytes, RuntimeError>> {
        let mut state = self.state();
        state.calls.push(Call::Logs(name.to_string()));

        let chunks = by_suffix(&state.logs, name).cloned().unwrap_or_default();
        let scripted = stream::iter(chunks.into_iter().map(Ok));
        if by_suffix_set(&state.closing_logs, name) {
            scripted.boxed()
        } else {
            scripted.chain(stream::pending()).boxed()
        }
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput, RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::Exec(name.to_string(), command.to_vec()));
        let program = command.first().map(String::as_str).unwrap_or_default();
        Ok(state.exec_results.get(program).cloned().unwrap_or(ExecOutput {
            exit_code: Some(0),
            output: String::new(),
        }))
    }

    async fn exec_detached(&self, name: &str, command: &[String]) -> Result<(), RuntimeError> {
        self.state()
            .calls
            .push(Call::ExecDetached(name.to_string(), command.to_vec()));
        Ok(())
    }

    async fn get_network(&self, name: &str) -> Result<Option<NetworkHandle>, RuntimeError> {
        Ok(self.state().networks.get(name).cloned())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkHandle, RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::CreateNetwork(spec.name.clone()));
        let handle = NetworkHandle {
            id: Some(format!("net-{}", spec.name)),
            name: spec.name.clone(),
        };
        state.networks.insert(spec.name.clone(), handle.clone());
        Ok(handle)
    }

    async fn connect_network(
        &self, network: &str, container: &str, address: Option<Ipv4Addr>,
    ) -> Result<(), RuntimeError> {
        self.state().calls.push(Call::Connect {
            network: network.to_string(),
            container: container.to_string(),
            address,
        });
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(Call::RemoveNetwork(name.to_string()));
        state.networks.remove(name).map(|_| ()).ok_or_else(|| not_found(name))
    }
}

fn by_suffix_set(set: &HashSet<String>, name: &str) -> bool {
    set.iter().any(|suffix| name.ends_with(suffix.as_str()))
}
