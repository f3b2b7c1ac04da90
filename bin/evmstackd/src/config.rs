use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use evmstack_config::{ConfigurationError, ServiceKind};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Deployment root.
    ///
    /// Holds `evmstack.json`, the service templates, and the per-service build, data, and log directories.
    #[arg(global = true, short = 'r', long, default_value = ".")]
    pub root: PathBuf,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

#[derive(Subcommand)]
pub enum Action {
    /// Bring the stack up and keep it running until interrupted.
    #[command(name = "up")]
    Up(UpConfig),

    /// Remove containers left behind by a daemon that did not stop cleanly.
    #[command(name = "clean")]
    Clean(CleanConfig),

    /// Print the logs of a service run by another daemon.
    #[command(name = "stream")]
    Stream(StreamConfig),

    /// Check the node for dirty state and replay its history if needed.
    #[command(name = "repair")]
    Repair(RepairConfig),
}

/// `up` configuration.
#[derive(Args, Clone)]
pub struct UpConfig {
    /// Services to run, in startup order, overriding the configured list.
    ///
    /// Accepts the same names as the configuration file, such as `redis,elasticsearch,nodeos`.
    #[arg(short = 's', long, value_delimiter = ',', value_parser = parse_service)]
    pub services: Vec<ServiceKind>,

    /// Wait for the indexer to catch up with the remote chain before reporting the stack as up.
    #[arg(long)]
    pub wait_sync: bool,
}

/// `clean` configuration.
#[derive(Args, Clone)]
pub struct CleanConfig {
    /// Private network to remove once its containers are gone.
    #[arg(short = 'n', long)]
    pub network: Option<String>,
}

/// `stream` configuration.
#[derive(Args, Clone)]
pub struct StreamConfig {
    /// Service whose logs to print.
    #[arg(value_parser = parse_service)]
    pub service: ServiceKind,

    /// Number of trailing lines to print before following.
    #[arg(short = 'l', long, default_value_t = 100)]
    pub lines: usize,
}

/// `repair` configuration.
#[derive(Args, Clone)]
pub struct RepairConfig {
    /// Seconds to watch the node's logs for the dirty state marker.
    #[arg(long, default_value_t = 60)]
    pub detect_timeout: u64,

    /// Endpoint to compare the recovered gateway's latest block hash against.
    #[arg(long)]
    pub reference: Option<String>,

    /// Exit after the replay instead of bringing the stack back up.
    #[arg(long)]
    pub no_recover: bool,
}

fn parse_service(value: &str) -> Result<ServiceKind, ConfigurationError> {
    ServiceKind::from_alias(value)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn services_accept_aliases() {
        let cli = Cli::try_parse_from(["evmstackd", "up", "--services", "redis,elasticsearch,nodeos"]).unwrap();
        let Action::Up(config) = cli.action else {
            panic!("expected 'up'");
        };
        assert_eq!(
            config.services,
            vec![ServiceKind::Cache, ServiceKind::Search, ServiceKind::Node]
        );
        assert!(!config.wait_sync);
    }

    #[test]
    fn unknown_service_is_rejected() {
        assert!(Cli::try_parse_from(["evmstackd", "stream", "postgres"]).is_err());
    }

    #[test]
    fn verbosity_maps_to_level() {
        let cli = Cli::try_parse_from(["evmstackd", "-vv", "clean"]).unwrap();
        assert_eq!(cli.log_level(), LevelFilter::TRACE);
        assert_eq!(cli.root, PathBuf::from("."));
    }
}
