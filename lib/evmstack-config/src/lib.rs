//! Typed configuration for an evmstack deployment.
//!
//! A single JSON document describes the whole stack: one section per service plus a `daemon` section holding the
//! ordered list of active services. The document is validated once when it is loaded into [`StackConfig`]; everything
//! downstream reads typed fields and never goes back to the raw document.
#![deny(missing_docs)]

use std::{borrow::Cow, path::PathBuf};

use evmstack_error::GenericError;
use figment::error::Kind;
use snafu::Snafu;

mod loader;
pub use self::loader::{read_config, write_config, ConfigurationLoader, DEFAULT_ENV_PREFIX};

mod model;
pub use self::model::*;

mod path;

mod ports;
pub use self::ports::{assign_virtual_addresses, randomize_ports, PortAllocator, PORT_RANGE, VIRTUAL_SUBNET};

mod profile;
pub use self::profile::ChainProfile;

mod propagate;
pub use self::propagate::{render_value, structured_view, Substitutions};

mod service;
pub use self::service::ServiceKind;

pub mod template;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// The configuration file could not be read or written.
    #[snafu(display("Failed to access configuration file '{}'.", path.display()))]
    Io {
        /// Path of the configuration file.
        path: PathBuf,

        /// Error source.
        source: std::io::Error,
    },

    /// The configuration could not be serialized.
    #[snafu(display("Failed to serialize configuration."))]
    Encode {
        /// Error source.
        source: serde_json::Error,
    },

    /// A required field was missing.
    #[snafu(display("Missing field '{}' in configuration.", field))]
    MissingField {
        /// Period-separated path to the missing field.
        field: Cow<'static, str>,
    },

    /// A field held a value of the wrong type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the invalid field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// A service name did not match any known service.
    #[snafu(display("Unknown service '{}'.", alias))]
    UnknownService {
        /// Name as given.
        alias: String,
    },

    /// A service was listed more than once in `daemon.services`.
    #[snafu(display("Service '{}' is listed more than once in 'daemon.services'.", service))]
    DuplicateService {
        /// Canonical service name.
        service: ServiceKind,
    },

    /// Two services were assigned the same virtual address.
    #[snafu(display("Services '{}' and '{}' share the virtual address {}.", first, second, address))]
    DuplicateAddress {
        /// The shared address.
        address: std::net::Ipv4Addr,

        /// First service holding the address.
        first: ServiceKind,

        /// Second service holding the address.
        second: ServiceKind,
    },

    /// A dotted path did not resolve to a field.
    #[snafu(display("Configuration has no field at '{}'.", path))]
    UnknownPath {
        /// The dotted path.
        path: String,
    },

    /// A value written through a dotted path did not fit the typed schema.
    #[snafu(display("Value written to '{}' does not fit the configuration schema.", path))]
    InvalidValue {
        /// The dotted path.
        path: String,

        /// Error source.
        source: serde_json::Error,
    },

    /// No bindable port could be found.
    #[snafu(display("No free port found in {}-{} after {} attempts.", PORT_RANGE.start(), PORT_RANGE.end(), attempts))]
    NoFreePort {
        /// Number of candidate ports tried.
        attempts: usize,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to load configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            Kind::MissingField(field) => {
                let mut path = e.path.clone();
                path.push(field.to_string());
                Self::MissingField {
                    field: path.join(".").into(),
                }
            }
            _ => Self::Generic { source: e.into() },
        }
    }
}
