//! Orchestration engine for an evmstack deployment.
//!
//! An [`Orchestrator`][orchestrator::Orchestrator] owns one [`ServiceUnit`][unit::ServiceUnit] per active service and
//! drives them through build, launch, readiness gating, network attachment, and unit-specific startup, in the order
//! the configuration declares. Containers are managed through the [`ContainerRuntime`][runtime::ContainerRuntime]
//! boundary.
#![deny(missing_docs)]

pub mod build;
pub mod chain;

mod error;
pub use self::error::OrchestratorError;

pub mod lock;
pub mod logs;
pub mod network;
pub mod orchestrator;
pub mod readiness;
pub mod repair;
pub mod runtime;
pub mod unit;
