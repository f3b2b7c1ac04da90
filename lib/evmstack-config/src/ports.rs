use std::{
    collections::HashSet,
    net::{Ipv4Addr, TcpListener},
    ops::RangeInclusive,
};

use rand::Rng as _;
use tracing::trace;

use crate::{ConfigurationError, HostPort, ServiceKind, StackConfig};

/// Range from which randomized ports are drawn.
pub const PORT_RANGE: RangeInclusive<u16> = 10000..=60000;

/// Subnet of the private network. Services are assigned `.2` onwards, and `.254` is the gateway.
pub const VIRTUAL_SUBNET: [u8; 3] = [192, 168, 123];

const DEFAULT_ATTEMPTS: usize = 32;

/// Hands out ports that are bindable on loopback at the time of the request and distinct from every port previously
/// handed out by the same allocator.
pub struct PortAllocator {
    issued: HashSet<u16>,
    attempts: usize,
}

impl PortAllocator {
    /// Creates a new `PortAllocator`.
    pub fn new() -> Self {
        Self {
            issued: HashSet::new(),
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    /// Returns every port handed out so far.
    pub fn issued(&self) -> &HashSet<u16> {
        &self.issued
    }

    /// Picks a random free port.
    ///
    /// # Errors
    ///
    /// If no candidate was free after the allocator's attempt budget, an error will be returned.
    pub fn allocate(&mut self) -> Result<u16, ConfigurationError> {
        let mut rng = rand::rng();
        for _ in 0..self.attempts {
            let candidate = rng.random_range(PORT_RANGE);
            if self.issued.contains(&candidate) {
                continue;
            }

            // The listener is dropped immediately; the port only has to be free now.
            match TcpListener::bind((Ipv4Addr::LOCALHOST, candidate)) {
                Ok(_) => {
                    self.issued.insert(candidate);
                    return Ok(candidate);
                }
                Err(e) => trace!(port = candidate, error = %e, "Candidate port not bindable."),
            }
        }

        Err(ConfigurationError::NoFreePort {
            attempts: self.attempts,
        })
    }

    /// Picks `n` distinct random free ports.
    ///
    /// # Errors
    ///
    /// If any allocation fails, an error will be returned.
    pub fn allocate_many(&mut self, n: usize) -> Result<Vec<u16>, ConfigurationError> {
        (0..n).map(|_| self.allocate()).collect()
    }
}

/// Moves every service onto randomly chosen free ports, so several stacks can share a host.
///
/// Derived values follow: the gateway's indexer websocket URI, and its remote endpoint when that points at the local
/// node.
///
/// # Errors
///
/// If not enough free ports can be found, an error will be returned.
pub fn randomize_ports(config: &mut StackConfig) -> Result<(), ConfigurationError> {
    let mut ports = PortAllocator::new();

    config.cache.port = ports.allocate()?;
    config.search.port = ports.allocate()?;
    config.dashboard.port = ports.allocate()?;

    let node_http = ports.allocate()?;
    config.node.ini.http_addr = HostPort::new(config.node.ini.http_addr.host.clone(), node_http);
    config.node.ini.p2p_addr = HostPort::new(config.node.ini.p2p_addr.host.clone(), ports.allocate()?);
    config.node.ini.history_endpoint =
        HostPort::new(config.node.ini.history_endpoint.host.clone(), ports.allocate()?);

    let indexer_ws = ports.allocate()?;
    config.rpc.indexer_websocket_port = indexer_ws;
    config.rpc.indexer_websocket_uri = format!("ws://127.0.0.1:{}/evm", indexer_ws);
    config.rpc.websocket_port = ports.allocate()?;
    config.rpc.api_port = ports.allocate()?;

    if config.rpc.remote_endpoint.contains("127.0.0.1") {
        config.rpc.remote_endpoint = format!("http://127.0.0.1:{}/evm", node_http);
    }

    Ok(())
}

/// Gives every service a fixed address on the private network, in canonical service order starting at `.2`.
///
/// The gateway listens on its own address, and reaches the indexer broadcast on the indexer's address.
pub fn assign_virtual_addresses(config: &mut StackConfig) {
    let [a, b, c] = VIRTUAL_SUBNET;
    for (offset, kind) in (2u8..).zip(ServiceKind::ALL) {
        config.common_mut(kind).virtual_ip = Some(Ipv4Addr::new(a, b, c, offset));
    }

    if let Some(rpc_ip) = config.rpc.common.virtual_ip {
        config.rpc.api_host = rpc_ip.to_string();
    }
    if let Some(indexer_ip) = config.indexer.common.virtual_ip {
        config.rpc.indexer_websocket_uri = format!("ws://{}:{}/evm", indexer_ip, config.rpc.indexer_websocket_port);
    }
}
