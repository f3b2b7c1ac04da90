use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ConfigurationError;

/// The closed set of services an evmstack deployment can run.
///
/// Names coming from outside (configuration files, the command line) are resolved through
/// [`ServiceKind::from_alias`]; everything past that boundary keys on this enum.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ServiceKind {
    /// Key/value cache backing the RPC gateway.
    Cache,

    /// Search engine holding indexed chain history.
    Search,

    /// Dashboard over the search engine.
    Dashboard,

    /// Blockchain node.
    Node,

    /// Log shipper feeding gateway logs into the search engine.
    Shipper,

    /// Chain-history indexer.
    Indexer,

    /// JSON-RPC gateway.
    Rpc,
}

impl ServiceKind {
    /// Every service, in canonical order.
    pub const ALL: [ServiceKind; 7] = [
        ServiceKind::Cache,
        ServiceKind::Search,
        ServiceKind::Dashboard,
        ServiceKind::Node,
        ServiceKind::Shipper,
        ServiceKind::Indexer,
        ServiceKind::Rpc,
    ];

    /// Resolves a service name, including the names of the software commonly filling each role.
    ///
    /// Matching ignores case and surrounding whitespace.
    ///
    /// # Errors
    ///
    /// If the name matches no service, an error is returned.
    pub fn from_alias(alias: &str) -> Result<Self, ConfigurationError> {
        let normalized = alias.trim().to_ascii_lowercase();
        let kind = match normalized.as_str() {
            "cache" | "redis" => ServiceKind::Cache,
            "search" | "elastic" | "elasticsearch" => ServiceKind::Search,
            "dashboard" | "kibana" => ServiceKind::Dashboard,
            "node" | "nodeos" => ServiceKind::Node,
            "shipper" | "beats" | "filebeat" => ServiceKind::Shipper,
            "indexer" | "translator" => ServiceKind::Indexer,
            "rpc" | "telos-evm-rpc" => ServiceKind::Rpc,
            _ => {
                return Err(ConfigurationError::UnknownService {
                    alias: alias.to_string(),
                })
            }
        };

        Ok(kind)
    }

    /// Canonical name, also used as the configuration section key.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Cache => "cache",
            ServiceKind::Search => "search",
            ServiceKind::Dashboard => "dashboard",
            ServiceKind::Node => "node",
            ServiceKind::Shipper => "shipper",
            ServiceKind::Indexer => "indexer",
            ServiceKind::Rpc => "rpc",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_alias(s)
    }
}

impl Serialize for ServiceKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ServiceKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let alias = String::deserialize(deserializer)?;
        Self::from_alias(&alias).map_err(serde::de::Error::custom)
    }
}
