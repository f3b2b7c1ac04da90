use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use snafu::ResultExt as _;

use crate::{ConfigurationError, Encode, InvalidValue, ServiceKind, StackConfig};

/// Resolves the first segment of a dotted path to its section key, so service aliases work as section names.
fn split_path(path: &str) -> Result<(String, Vec<&str>), ConfigurationError> {
    let mut segments = path.split('.');
    let head = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigurationError::UnknownPath { path: path.to_string() })?;

    let section = if head == "daemon" {
        head.to_string()
    } else {
        ServiceKind::from_alias(head)
            .map_err(|_| ConfigurationError::UnknownPath { path: path.to_string() })?
            .as_str()
            .to_string()
    };

    Ok((section, segments.collect()))
}

impl StackConfig {
    /// Looks up the value at a dotted path, such as `node.ini.http_addr` or `translator.start_block`.
    ///
    /// # Errors
    ///
    /// If the path does not resolve to a field, an error will be returned.
    pub fn get(&self, path: &str) -> Result<Value, ConfigurationError> {
        let (section, rest) = split_path(path)?;
        let root = serde_json::to_value(self).context(Encode)?;

        let mut current = root
            .get(&section)
            .ok_or_else(|| ConfigurationError::UnknownPath { path: path.to_string() })?;
        for segment in rest {
            current = current
                .get(segment)
                .ok_or_else(|| ConfigurationError::UnknownPath { path: path.to_string() })?;
        }

        Ok(current.clone())
    }

    /// Looks up the value at a dotted path and deserializes it.
    ///
    /// # Errors
    ///
    /// If the path does not resolve to a field, or the value does not deserialize into `T`, an error will be returned.
    pub fn get_typed<T>(&self, path: &str) -> Result<T, ConfigurationError>
    where
        T: DeserializeOwned,
    {
        let value = self.get(path)?;
        serde_json::from_value(value).context(InvalidValue { path })
    }

    /// Writes a value at a dotted path.
    ///
    /// The parent of the final segment must already exist. The updated document is checked against the typed schema
    /// and revalidated before it replaces `self`; on error, `self` is left untouched.
    ///
    /// # Errors
    ///
    /// If the path does not resolve, or the resulting configuration does not fit the schema or fails validation, an
    /// error will be returned.
    pub fn set<T>(&mut self, path: &str, value: T) -> Result<(), ConfigurationError>
    where
        T: Serialize,
    {
        let (section, rest) = split_path(path)?;
        let value = serde_json::to_value(value).context(InvalidValue { path })?;
        let mut root = serde_json::to_value(&*self).context(Encode)?;

        let mut current = root
            .get_mut(&section)
            .ok_or_else(|| ConfigurationError::UnknownPath { path: path.to_string() })?;

        match rest.split_last() {
            None => *current = value,
            Some((last, parents)) => {
                for segment in parents {
                    current = current
                        .get_mut(*segment)
                        .ok_or_else(|| ConfigurationError::UnknownPath { path: path.to_string() })?;
                }

                let object = current
                    .as_object_mut()
                    .ok_or_else(|| ConfigurationError::UnknownPath { path: path.to_string() })?;
                object.insert((*last).to_string(), value);
            }
        }

        let updated: StackConfig = serde_json::from_value(root).context(InvalidValue { path })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{model::fixtures, BlockRef, HostPort};

    use super::*;

    #[test]
    fn get_walks_nested_records() {
        let config = fixtures::local();
        assert_eq!(config.get("node.ini.http_addr").unwrap(), json!("0.0.0.0:8888"));
        assert_eq!(config.get("daemon.port").unwrap(), json!(12321));
        assert_eq!(config.get_typed::<HostPort>("nodeos.ini.history_endpoint").unwrap().port, 29999);
    }

    #[test]
    fn get_unknown_path_fails() {
        let config = fixtures::local();
        assert!(matches!(config.get("node.ini.nope"), Err(ConfigurationError::UnknownPath { .. })));
        assert!(matches!(config.get("postgres.port"), Err(ConfigurationError::UnknownPath { .. })));
        assert!(matches!(config.get(""), Err(ConfigurationError::UnknownPath { .. })));
    }

    #[test]
    fn set_through_alias_updates_typed_field() {
        let mut config = fixtures::local();
        config.set("translator.start_block", 1234).unwrap();
        config.set("indexer.deploy_block", 1234).unwrap();

        assert_eq!(config.indexer.start_block, BlockRef::At(1234));
        assert_eq!(config.indexer.deploy_block, BlockRef::At(1234));
    }

    #[test]
    fn set_rejects_values_outside_schema_and_keeps_state() {
        let mut config = fixtures::local();
        let before = config.clone();

        assert!(matches!(
            config.set("cache.port", "not a port"),
            Err(ConfigurationError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set("daemon.services", json!(["redis", "redis"])),
            Err(ConfigurationError::InvalidValue { .. }) | Err(ConfigurationError::DuplicateService { .. })
        ));
        assert_eq!(config, before);
    }

    #[test]
    fn set_may_fill_optional_fields() {
        let mut config = fixtures::local();
        config.set("daemon.network", "stacknet").unwrap();
        assert_eq!(config.daemon.network.as_deref(), Some("stacknet"));
    }
}
