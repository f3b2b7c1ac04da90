use std::fmt;

/// Deployment profile of a stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainProfile {
    /// Self-contained chain produced by the local node.
    Local,

    /// Follower of the public test network.
    Testnet,

    /// Follower of the public main network.
    Mainnet,
}

impl ChainProfile {
    /// Derives the profile from a chain name: names containing `testnet` or `mainnet` follow that network, anything
    /// else is local.
    pub fn from_chain_name(chain_name: &str) -> Self {
        if chain_name.contains("testnet") {
            ChainProfile::Testnet
        } else if chain_name.contains("mainnet") {
            ChainProfile::Mainnet
        } else {
            ChainProfile::Local
        }
    }

    /// Public API endpoint of the network being followed, if any.
    pub fn remote_endpoint(&self) -> Option<&'static str> {
        match self {
            ChainProfile::Local => None,
            ChainProfile::Testnet => Some("https://testnet.telos.net"),
            ChainProfile::Mainnet => Some("https://mainnet.telos.net"),
        }
    }

    /// Returns `true` for the local profile.
    pub fn is_local(&self) -> bool {
        matches!(self, ChainProfile::Local)
    }
}

impl fmt::Display for ChainProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainProfile::Local => f.write_str("local"),
            ChainProfile::Testnet => f.write_str("testnet"),
            ChainProfile::Mainnet => f.write_str("mainnet"),
        }
    }
}
