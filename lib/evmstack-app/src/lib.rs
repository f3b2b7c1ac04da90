//! Process-level bootstrapping for evmstack binaries.
#![deny(warnings)]
#![deny(missing_docs)]

#[cfg(feature = "logging")]
pub mod logging;

/// Common imports.
pub mod prelude {
    #[cfg(feature = "logging")]
    pub use super::logging::{fatal_and_exit, initialize_logging};
}
