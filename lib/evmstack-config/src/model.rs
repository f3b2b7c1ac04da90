use std::{collections::BTreeMap, fmt, net::Ipv4Addr, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{ChainProfile, ConfigurationError, ServiceKind};

const fn default_true() -> bool {
    true
}

const fn default_remote_head_refresh() -> u64 {
    3600
}

fn default_templates_dir() -> String {
    "templates".to_string()
}

fn default_repair_args() -> Vec<String> {
    vec!["--hard-replay-blockchain".to_string(), "--disable-replay-opts".to_string()]
}

/// The full stack configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StackConfig {
    /// Daemon-level settings, including the ordered list of active services.
    pub daemon: DaemonConfig,

    /// Cache store.
    #[serde(alias = "redis")]
    pub cache: CacheConfig,

    /// Search engine.
    #[serde(alias = "elasticsearch")]
    pub search: SearchConfig,

    /// Dashboard.
    #[serde(alias = "kibana")]
    pub dashboard: DashboardConfig,

    /// Blockchain node.
    #[serde(alias = "nodeos")]
    pub node: NodeConfig,

    /// Log shipper.
    #[serde(alias = "beats")]
    pub shipper: ShipperConfig,

    /// Chain-history indexer.
    #[serde(alias = "translator")]
    pub indexer: IndexerConfig,

    /// JSON-RPC gateway.
    pub rpc: RpcConfig,
}

impl StackConfig {
    /// Returns the settings shared by every service for the given service.
    pub fn common(&self, kind: ServiceKind) -> &ServiceCommon {
        match kind {
            ServiceKind::Cache => &self.cache.common,
            ServiceKind::Search => &self.search.common,
            ServiceKind::Dashboard => &self.dashboard.common,
            ServiceKind::Node => &self.node.common,
            ServiceKind::Shipper => &self.shipper.common,
            ServiceKind::Indexer => &self.indexer.common,
            ServiceKind::Rpc => &self.rpc.common,
        }
    }

    /// Mutable variant of [`common`][Self::common].
    pub fn common_mut(&mut self, kind: ServiceKind) -> &mut ServiceCommon {
        match kind {
            ServiceKind::Cache => &mut self.cache.common,
            ServiceKind::Search => &mut self.search.common,
            ServiceKind::Dashboard => &mut self.dashboard.common,
            ServiceKind::Node => &mut self.node.common,
            ServiceKind::Shipper => &mut self.shipper.common,
            ServiceKind::Indexer => &mut self.indexer.common,
            ServiceKind::Rpc => &mut self.rpc.common,
        }
    }

    /// Name of the chain this stack serves.
    ///
    /// This is the gateway's index prefix, and it namespaces every container and image the stack creates.
    pub fn chain_name(&self) -> &str {
        &self.rpc.index_prefix
    }

    /// Deployment profile derived from the chain name.
    pub fn profile(&self) -> ChainProfile {
        ChainProfile::from_chain_name(self.chain_name())
    }

    /// Checks the cross-field invariants that the typed schema alone cannot express.
    ///
    /// # Errors
    ///
    /// If a service is listed twice in `daemon.services`, or two services share a virtual address, an error is
    /// returned.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut seen = Vec::with_capacity(self.daemon.services.len());
        for service in &self.daemon.services {
            if seen.contains(service) {
                return Err(ConfigurationError::DuplicateService { service: *service });
            }
            seen.push(*service);
        }

        let mut addresses: BTreeMap<Ipv4Addr, ServiceKind> = BTreeMap::new();
        for kind in ServiceKind::ALL {
            if let Some(address) = self.common(kind).virtual_ip {
                if let Some(first) = addresses.insert(address, kind) {
                    return Err(ConfigurationError::DuplicateAddress {
                        address,
                        first,
                        second: kind,
                    });
                }
            }
        }

        Ok(())
    }
}

/// Daemon-level settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DaemonConfig {
    /// Port of the administrative API.
    pub port: u16,

    /// Whether the stack runs under a test harness. No run lock is taken when set.
    #[serde(default)]
    pub testing: bool,

    /// Whether the indexer waits until it has caught up with the remote chain before the stack is considered up.
    #[serde(default)]
    pub wait_sync: bool,

    /// Name of the private network to attach services to. Host networking is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Active services, in startup order.
    pub services: Vec<ServiceKind>,

    /// Directory holding the per-service templates, relative to the stack root unless absolute.
    #[serde(default = "default_templates_dir")]
    pub templates_dir: String,

    /// Seconds between refreshes of the remote chain head while waiting for the indexer to catch up.
    #[serde(default = "default_remote_head_refresh")]
    pub remote_head_refresh: u64,

    /// Reference endpoint for the remote chain head, overriding the profile's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_endpoint: Option<String>,
}

/// Kind of an additional mount.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    /// Host path bind mount.
    #[default]
    Bind,

    /// Named volume.
    Volume,

    /// In-memory filesystem.
    Tmpfs,
}

/// An additional mount declared in configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MountSpec {
    /// Host path or volume name.
    pub source: String,

    /// Path inside the container.
    pub target: String,

    /// Mount kind.
    #[serde(rename = "type", default)]
    pub kind: MountKind,
}

/// Settings shared by every service.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ServiceCommon {
    /// Service name, used as the container name suffix.
    pub name: String,

    /// Image reference. The chain name is appended when the image is built.
    pub tag: String,

    /// Service directory, relative to the stack's `docker` directory.
    pub docker_path: String,

    /// Build context directory, relative to the service directory.
    pub build_path: String,

    /// Configuration directory, relative to the service directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,

    /// Data directory, relative to the service directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,

    /// Logs directory, relative to the service directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_path: Option<String>,

    /// Extra mounts, added to the service's own.
    #[serde(default)]
    pub mounts: Vec<MountSpec>,

    /// Address on the private network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<Ipv4Addr>,

    /// Whether to wait for the service's readiness phrase after launch.
    #[serde(default = "default_true")]
    pub wait_startup: bool,

    /// Whether to echo log lines while waiting for readiness.
    #[serde(default)]
    pub show_startup: bool,

    /// Whether to echo image build output.
    #[serde(default)]
    pub show_build: bool,

    /// Readiness timeout in seconds, overriding the service's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout: Option<u64>,
}

/// Cache store settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CacheConfig {
    /// Shared settings.
    #[serde(flatten)]
    pub common: ServiceCommon,

    /// Host the gateway uses to reach the cache.
    pub host: String,

    /// Listening port.
    pub port: u16,
}

/// Search engine settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SearchConfig {
    /// Shared settings.
    #[serde(flatten)]
    pub common: ServiceCommon,

    /// URL scheme, usually `http`.
    pub protocol: String,

    /// Listening port.
    pub port: u16,
}

/// Dashboard settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DashboardConfig {
    /// Shared settings.
    #[serde(flatten)]
    pub common: ServiceCommon,

    /// Listening host.
    pub host: String,

    /// Listening port.
    pub port: u16,
}

/// Log shipper settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ShipperConfig {
    /// Shared settings.
    #[serde(flatten)]
    pub common: ServiceCommon,
}

/// Blockchain node settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NodeConfig {
    /// Shared settings.
    #[serde(flatten)]
    pub common: ServiceCommon,

    /// Data directory path inside the container.
    pub data_path_guest: String,

    /// Contracts directory, relative to the service directory.
    pub contracts_dir: String,

    /// Genesis file name (without extension) used on first boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis: Option<String>,

    /// Snapshot path used on first boot. Takes precedence over `genesis`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,

    /// Log file name inside the logs directory.
    pub logs_file: String,

    /// Node binary name.
    #[serde(alias = "nodeos_bin")]
    pub node_bin: String,

    /// Path of the EVM contract inside the container.
    #[serde(default, alias = "eosio.evm", skip_serializing_if = "Option::is_none")]
    pub evm_contract: Option<String>,

    /// Whether the node's disk space monitor may shut it down.
    pub space_monitor: bool,

    /// Whether the node produces blocks.
    pub produce: bool,

    /// Whether to bootstrap a fresh local chain on first boot.
    pub initialize: bool,

    /// Whether to wait for the node's HTTP API to answer after launch.
    pub api_check: bool,

    /// Commands run inside the node container, in order, to bootstrap a fresh local chain.
    #[serde(default)]
    pub boot_commands: Vec<Vec<String>>,

    /// Extra arguments for the one-shot repair run.
    #[serde(default = "default_repair_args")]
    pub repair_args: Vec<String>,

    /// Node engine options.
    pub ini: NodeIni,
}

/// Node engine options.
///
/// The listed fields are the ones the stack itself reads. Everything else is carried through `options` untouched and
/// made available to templates.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NodeIni {
    /// HTTP API listen address.
    pub http_addr: HostPort,

    /// Peer-to-peer listen address.
    pub p2p_addr: HostPort,

    /// State history listen address.
    pub history_endpoint: HostPort,

    /// Block signing key pair, as `PUBLIC=KEY:PRIVATE`.
    pub sig_provider: String,

    /// Plugins to enable.
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Peer addresses.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Contract substitutions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subst: Option<Substitution>,

    /// Remaining engine options.
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

/// Contract substitution settings.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Substitution {
    /// Path or URL of a substitution manifest.
    Manifest(String),

    /// Contract account to replacement code path.
    ByName(BTreeMap<String, String>),
}

/// Chain-history indexer settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IndexerConfig {
    /// Shared settings.
    #[serde(flatten)]
    pub common: ServiceCommon,

    /// First block to index.
    #[serde(default)]
    pub start_block: BlockRef,

    /// Block at which the EVM contract was deployed.
    #[serde(default)]
    pub deploy_block: BlockRef,

    /// First EVM block number.
    pub evm_start_block: i64,

    /// Expected hash of the first EVM block, empty to skip validation.
    pub evm_validate_hash: String,

    /// Last block to index.
    pub stop_block: u64,

    /// Hash of the block preceding the first indexed block.
    pub prev_hash: String,

    /// Number of indexing workers.
    pub worker_amount: u32,

    /// Number of documents per bulk write.
    pub elastic_dump_size: u32,

    /// Search engine request timeout in milliseconds.
    pub elastic_timeout: u64,
}

/// A block number, or a marker asking for it to be resolved when the chain is first booted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BlockRef {
    /// Resolved at first boot.
    #[default]
    Override,

    /// A concrete block number.
    At(u64),
}

impl BlockRef {
    /// Returns the block number, if resolved.
    pub fn number(&self) -> Option<u64> {
        match self {
            BlockRef::Override => None,
            BlockRef::At(n) => Some(*n),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::Override => f.write_str("override"),
            BlockRef::At(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for BlockRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BlockRef::Override => serializer.serialize_str("override"),
            BlockRef::At(n) => serializer.serialize_u64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for BlockRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(BlockRef::At(n)),
            Raw::Text(s) if s == "override" => Ok(BlockRef::Override),
            Raw::Text(s) => s.parse().map(BlockRef::At).map_err(|_| {
                serde::de::Error::custom(format!("expected a block number or \"override\", got \"{}\"", s))
            }),
        }
    }
}

/// JSON-RPC gateway settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RpcConfig {
    /// Shared settings.
    #[serde(flatten)]
    pub common: ServiceCommon,

    /// EVM chain ID.
    pub chain_id: u64,

    /// Whether the gateway logs verbosely.
    pub debug: bool,

    /// API listen host.
    pub api_host: String,

    /// API listen port.
    pub api_port: u16,

    /// Endpoint the gateway forwards unsupported calls to.
    pub remote_endpoint: String,

    /// Account signing gateway transactions.
    pub signer_account: String,

    /// Permission used by the signer account.
    pub signer_permission: String,

    /// Private key of the signer account.
    pub signer_key: String,

    /// Contract roles to account names.
    pub contracts: BTreeMap<String, String>,

    /// Indexer broadcast listen host.
    pub indexer_websocket_host: String,

    /// Indexer broadcast listen port.
    pub indexer_websocket_port: u16,

    /// URI the gateway uses to reach the indexer broadcast.
    pub indexer_websocket_uri: String,

    /// Gateway websocket listen host.
    pub websocket_host: String,

    /// Gateway websocket listen port.
    pub websocket_port: u16,

    /// Prefix of the search indices. Doubles as the chain name.
    #[serde(alias = "elastic_prefix")]
    pub index_prefix: String,

    /// Version suffix of the search indices.
    #[serde(alias = "elasitc_index_version", alias = "elastic_index_version")]
    pub index_version: String,
}

/// A `host:port` pair.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct HostPort {
    /// Host part.
    pub host: String,

    /// Port part.
    pub port: u16,
}

impl HostPort {
    /// Creates a new `HostPort`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected 'host:port', got '{}'", s))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in '{}'", s))?;
        Ok(Self::new(host, port))
    }
}

impl Serialize for HostPort {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HostPort {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::StackConfig;

    pub const LOCAL_JSON: &str = include_str!("../testdata/local.json");

    pub fn local() -> StackConfig {
        let config: StackConfig = serde_json::from_str(LOCAL_JSON).unwrap();
        config.validate().unwrap();
        config
    }
}
