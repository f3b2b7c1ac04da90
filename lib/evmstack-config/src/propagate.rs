use std::collections::BTreeMap;

use serde_json::Value;
use snafu::ResultExt as _;

use crate::{ConfigurationError, Encode, ServiceKind, StackConfig};

/// Renders a configuration value for text substitution.
///
/// Strings are written as-is, booleans as `true`/`false`, `null` as an empty string, and lists and maps as compact
/// JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Returns the configuration section of a service as a structured JSON value.
///
/// # Errors
///
/// If the configuration cannot be serialized, an error will be returned.
pub fn structured_view(config: &StackConfig, kind: ServiceKind) -> Result<Value, ConfigurationError> {
    let root = serde_json::to_value(config).context(Encode)?;
    Ok(root.get(kind.as_str()).cloned().unwrap_or(Value::Null))
}

/// Substitution context for one service's templates.
///
/// Every field of the configuration is available under its dotted path (`node.ini.http_addr`). The fields of the
/// service's own section are also available without the section prefix, with nested records joined by underscores
/// (`port`, `ini_http_addr`), so they can be referenced as bare `$identifier` placeholders.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Substitutions {
    values: BTreeMap<String, Value>,
}

impl Substitutions {
    /// Flattens `config` into the substitution context of `kind`.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be serialized, an error will be returned.
    pub fn for_service(config: &StackConfig, kind: ServiceKind) -> Result<Self, ConfigurationError> {
        let root = serde_json::to_value(config).context(Encode)?;

        let mut values = BTreeMap::new();
        if let Value::Object(sections) = &root {
            for (section, value) in sections {
                flatten_into(&mut values, section, ".", value);
            }
        }

        if let Some(Value::Object(own)) = root.get(kind.as_str()) {
            for (field, value) in own {
                flatten_into(&mut values, field, "_", value);
            }
        }

        Ok(Self { values })
    }

    /// Inserts or replaces a value.
    pub fn insert<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Merges every field of a JSON object into the context without a prefix.
    pub fn extend_unprefixed(&mut self, object: &Value) {
        if let Value::Object(fields) = object {
            for (field, value) in fields {
                self.values.insert(field.clone(), value.clone());
            }
        }
    }

    /// Returns the raw value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns the value for `key` rendered for text substitution.
    pub fn rendered(&self, key: &str) -> Option<String> {
        self.values.get(key).map(render_value)
    }

    /// Returns a copy of the context where every value renders as a JSON literal, for templates that are themselves
    /// JSON documents.
    pub fn jsonized(&self) -> Self {
        let values = self
            .values
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.to_string())))
            .collect();
        Self { values }
    }

    /// Iterates over keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// Flattens nested objects below `prefix`. Lists are kept whole.
fn flatten_into(values: &mut BTreeMap<String, Value>, prefix: &str, separator: &str, value: &Value) {
    match value {
        Value::Object(fields) => {
            values.insert(prefix.to_string(), value.clone());
            for (field, nested) in fields {
                let key = format!("{}{}{}", prefix, separator, field);
                flatten_into(values, &key, separator, nested);
            }
        }
        _ => {
            values.insert(prefix.to_string(), value.clone());
        }
    }
}
