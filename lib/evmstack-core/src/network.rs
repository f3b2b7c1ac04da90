//! Service addressing.
//!
//! Services either share the host's network, reaching each other over loopback, or sit on a private network at fixed
//! addresses.

use std::{collections::BTreeMap, net::Ipv4Addr};

use evmstack_config::{ServiceKind, StackConfig, VIRTUAL_SUBNET};
use snafu::ResultExt as _;
use tracing::{debug, info};

use crate::{
    error::{OrchestratorError, Runtime},
    runtime::{default_labels, ContainerRuntime, NetworkHandle, NetworkSpec},
};

/// Gateway address of the private network.
pub fn virtual_gateway() -> Ipv4Addr {
    let [a, b, c] = VIRTUAL_SUBNET;
    Ipv4Addr::new(a, b, c, 254)
}

/// Subnet of the private network in CIDR notation.
pub fn virtual_subnet() -> String {
    let [a, b, c] = VIRTUAL_SUBNET;
    format!("{}.{}.{}.0/24", a, b, c)
}

/// Addresses of the services in the stack, and the private network connecting them, if any.
///
/// Without a private network every service runs with host networking and is reached on loopback.
#[derive(Clone, Debug, Default)]
pub struct NetworkTopology {
    network: Option<NetworkHandle>,
    bindings: BTreeMap<ServiceKind, Ipv4Addr>,
}

impl NetworkTopology {
    /// Creates a topology using host networking.
    pub fn host(config: &StackConfig) -> Self {
        let mut topology = Self::default();
        topology.rebind(config);
        topology
    }

    /// Creates a topology around the private network named in the configuration, creating the network if it does not
    /// exist yet. Falls back to host networking when no network is configured.
    ///
    /// # Errors
    ///
    /// If the network cannot be looked up or created, an error will be returned.
    pub async fn from_config(
        runtime: &dyn ContainerRuntime, config: &StackConfig,
    ) -> Result<Self, OrchestratorError> {
        let mut topology = Self::host(config);

        if let Some(name) = &config.daemon.network {
            info!("Setting up network '{}'...", name);
            let handle = match runtime.get_network(name).await.context(Runtime)? {
                Some(handle) => {
                    debug!("Network '{}' already exists.", name);
                    handle
                }
                None => {
                    let mut labels = default_labels();
                    labels.insert("chain".to_string(), config.chain_name().to_string());
                    let spec = NetworkSpec {
                        name: name.clone(),
                        subnet: virtual_subnet(),
                        gateway: virtual_gateway(),
                        labels,
                    };
                    runtime.create_network(&spec).await.context(Runtime)?
                }
            };
            info!("Network '{}' online.", handle.name);
            topology.network = Some(handle);
        }

        Ok(topology)
    }

    /// Recomputes the address of every service from the configuration.
    ///
    /// A service with a configured virtual address uses it, everything else is reached on loopback.
    pub fn rebind(&mut self, config: &StackConfig) {
        self.bindings = ServiceKind::ALL
            .iter()
            .map(|kind| (*kind, config.common(*kind).virtual_ip.unwrap_or(Ipv4Addr::LOCALHOST)))
            .collect();
    }

    /// Returns the private network, if there is one.
    pub fn network(&self) -> Option<&NetworkHandle> {
        self.network.as_ref()
    }

    /// Returns `true` if containers attach to a private network rather than sharing the host's.
    pub fn is_private(&self) -> bool {
        self.network.is_some()
    }

    /// Returns the address other services use to reach `kind`.
    pub fn address_of(&self, kind: ServiceKind) -> Ipv4Addr {
        self.bindings.get(&kind).copied().unwrap_or(Ipv4Addr::LOCALHOST)
    }

    /// Connects a launched container to the private network at the address bound to its service. Does nothing under
    /// host networking.
    ///
    /// # Errors
    ///
    /// If the runtime fails to connect the container, an error will be returned.
    pub async fn attach(
        &self, runtime: &dyn ContainerRuntime, kind: ServiceKind, container: &str, config: &StackConfig,
    ) -> Result<(), OrchestratorError> {
        let Some(network) = &self.network else {
            return Ok(());
        };

        let address = config.common(kind).virtual_ip;
        info!("Connecting '{}' to network '{}'...", container, network.name);
        runtime
            .connect_network(&network.name, container, address)
            .await
            .context(Runtime)?;
        info!("'{}' connected.", container);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use evmstack_config::assign_virtual_addresses;

    use super::*;
    use crate::{
        runtime::memory::{Call, MemoryRuntime},
        testing,
    };

    #[test]
    fn host_networking_uses_loopback() {
        let topology = NetworkTopology::host(&testing::local_config());
        for kind in ServiceKind::ALL {
            assert_eq!(topology.address_of(kind), Ipv4Addr::LOCALHOST);
        }
        assert!(!topology.is_private());
    }

    #[tokio::test]
    async fn private_network_is_created_once() {
        let runtime = MemoryRuntime::new();
        let mut config = testing::local_config();
        config.daemon.network = Some("stacknet".to_string());
        assign_virtual_addresses(&mut config);

        let topology = NetworkTopology::from_config(&runtime, &config).await.unwrap();
        let again = NetworkTopology::from_config(&runtime, &config).await.unwrap();

        assert!(topology.is_private());
        assert_eq!(again.network(), topology.network());
        assert_eq!(
            runtime.calls(),
            vec![Call::CreateNetwork("stacknet".to_string())]
        );
        assert_eq!(topology.address_of(ServiceKind::Node), Ipv4Addr::new(192, 168, 123, 5));
    }

    #[tokio::test]
    async fn attach_uses_configured_address() {
        let runtime = MemoryRuntime::new();
        let mut config = testing::local_config();
        config.daemon.network = Some("stacknet".to_string());
        assign_virtual_addresses(&mut config);

        let topology = NetworkTopology::from_config(&runtime, &config).await.unwrap();
        topology
            .attach(&runtime, ServiceKind::Cache, "telos-local-1-redis", &config)
            .await
            .unwrap();

        assert!(runtime.calls().contains(&Call::Connect {
            network: "stacknet".to_string(),
            container: "telos-local-1-redis".to_string(),
            address: Some(Ipv4Addr::new(192, 168, 123, 2)),
        }));
    }
}
