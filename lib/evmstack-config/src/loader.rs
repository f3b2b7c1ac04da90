use std::path::Path;

use figment::{
    providers::{Env, Format as _, Json, Serialized},
    Figment,
};
use serde::Serialize as _;
use serde_json::ser::PrettyFormatter;
use snafu::ResultExt as _;
use tracing::debug;

use crate::{ConfigurationError, Encode, Io, StackConfig};

/// Prefix of environment variables that override configuration fields.
pub const DEFAULT_ENV_PREFIX: &str = "EVMSTACK_";

/// Layered configuration loader.
///
/// Sources are applied in the order they are added, later sources overriding earlier ones. The merged result is
/// deserialized into [`StackConfig`] and validated exactly once, in [`into_typed`][Self::into_typed].
#[derive(Default)]
pub struct ConfigurationLoader {
    figment: Figment,
}

impl ConfigurationLoader {
    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, an error will be returned. Syntax errors surface from
    /// [`into_typed`][Self::into_typed].
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(Io { path })?;
        debug!(file_path = %path.display(), "Loaded configuration file.");

        self.figment = self.figment.merge(Json::string(&contents));
        Ok(self)
    }

    /// Loads configuration from an existing value.
    pub fn from_value(mut self, config: &StackConfig) -> Self {
        self.figment = self.figment.merge(Serialized::defaults(config));
        self
    }

    /// Loads overrides from environment variables with the given prefix.
    ///
    /// Nested fields are separated by a double underscore: `EVMSTACK_DAEMON__NETWORK=stacknet` sets `daemon.network`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_string()
        } else {
            format!("{}_", prefix)
        };

        self.figment = self.figment.merge(Env::prefixed(&prefix).split("__"));
        Ok(self)
    }

    /// Deserializes and validates the merged configuration.
    ///
    /// # Errors
    ///
    /// If the merged configuration does not fit the schema or fails validation, an error will be returned.
    pub fn into_typed(self) -> Result<StackConfig, ConfigurationError> {
        let config: StackConfig = self.figment.extract()?;
        config.validate()?;
        Ok(config)
    }
}

/// Reads a configuration file without any environment overrides.
///
/// # Errors
///
/// If the file cannot be read, does not fit the schema, or fails validation, an error will be returned.
pub fn read_config<P>(path: P) -> Result<StackConfig, ConfigurationError>
where
    P: AsRef<Path>,
{
    ConfigurationLoader::default().from_json(path)?.into_typed()
}

/// Writes the configuration as JSON indented by four spaces, fields in declaration order.
///
/// The file is written to a sibling temporary path first and then renamed into place, so readers never observe a
/// partially written document.
///
/// # Errors
///
/// If the configuration cannot be serialized or the file cannot be written, an error will be returned.
pub fn write_config<P>(config: &StackConfig, path: P) -> Result<(), ConfigurationError>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();

    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    config.serialize(&mut serializer).context(Encode)?;
    buf.push(b'\n');

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    std::fs::write(&staging, &buf).context(Io { path })?;
    std::fs::rename(&staging, path).context(Io { path })?;

    debug!(file_path = %path.display(), "Wrote configuration file.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{model::fixtures, BlockRef, HostPort, ServiceKind};

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_config(dir.path().join("evmstack.json"));
        assert!(matches!(result, Err(ConfigurationError::Io { .. })));
    }

    #[test]
    fn missing_field_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evmstack.json");

        let mut raw: serde_json::Value = serde_json::from_str(fixtures::LOCAL_JSON).unwrap();
        raw["daemon"].as_object_mut().unwrap().remove("services");
        std::fs::write(&path, raw.to_string()).unwrap();

        match read_config(&path) {
            Err(ConfigurationError::MissingField { field }) => assert!(field.ends_with("services")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn unknown_service_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evmstack.json");

        let mut raw: serde_json::Value = serde_json::from_str(fixtures::LOCAL_JSON).unwrap();
        raw["daemon"]["services"] = serde_json::json!(["redis", "postgres"]);
        std::fs::write(&path, raw.to_string()).unwrap();

        assert!(read_config(&path).is_err());
    }

    #[test]
    fn written_file_uses_four_space_indent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evmstack.json");
        write_config(&fixtures::local(), &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("{\n    \"daemon\": {\n        \"port\": 12321,"));
        assert!(!dir.path().join("evmstack.json.tmp").exists());
    }

    #[test]
    fn empty_env_prefix_is_rejected() {
        assert!(matches!(
            ConfigurationLoader::default().from_environment(""),
            Err(ConfigurationError::EmptyPrefix)
        ));
    }

    #[test]
    fn environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("evmstack.json", fixtures::LOCAL_JSON)?;
            jail.set_env("EVMSTACK_DAEMON__NETWORK", "stacknet");
            jail.set_env("EVMSTACK_CACHE__PORT", "16379");

            let config = ConfigurationLoader::default()
                .from_json("evmstack.json")
                .and_then(|loader| loader.from_environment(DEFAULT_ENV_PREFIX))
                .and_then(|loader| loader.into_typed())
                .map_err(|e| e.to_string())?;

            assert_eq!(config.daemon.network.as_deref(), Some("stacknet"));
            assert_eq!(config.cache.port, 16379);
            Ok(())
        });
    }

    fn arb_config() -> impl Strategy<Value = StackConfig> {
        (
            any::<u16>(),
            proptest::option::of("[a-z]{1,12}"),
            proptest::sample::subsequence(ServiceKind::ALL.to_vec(), 0..=ServiceKind::ALL.len()),
            proptest::option::of(any::<u64>()),
            any::<bool>(),
            (1024u16..=u16::MAX, 1024u16..=u16::MAX),
            "[a-z]{1,8}-(local|testnet|mainnet)",
            proptest::option::of(1u64..3600),
        )
            .prop_map(
                |(port, network, services, start_block, produce, (http, history), prefix, timeout)| {
                    let mut config = fixtures::local();
                    config.daemon.port = port;
                    config.daemon.network = network;
                    config.daemon.services = services;
                    config.indexer.start_block = start_block.map(BlockRef::At).unwrap_or_default();
                    config.node.produce = produce;
                    config.node.ini.http_addr = HostPort::new("0.0.0.0", http);
                    config.node.ini.history_endpoint = HostPort::new("0.0.0.0", history);
                    config.rpc.index_prefix = prefix;
                    config.node.common.startup_timeout = timeout;
                    config
                },
            )
    }

    proptest! {
        #[test]
        fn property_test_config_round_trip(config in arb_config()) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("evmstack.json");

            write_config(&config, &path).unwrap();
            let loaded = read_config(&path).unwrap();

            prop_assert_eq!(loaded, config);
        }
    }
}
