//! resfilter - declarative resource policy engine
//!
//! Fetches cloud resources, narrows them through a chain of filters and
//! applies actions to what is left.
//!
//! # Module Structure
//!
//! - [`resource`] - Resource definitions, the record model and the fetcher
//! - [`filters`] - Value, age, permission and metrics filters
//! - [`actions`] - Data driven mutating actions
//! - [`policy`] - Policy loading, validation and execution
//! - [`provider`] - Provider collaborators (GCP, fixtures)
//! - [`context`] - Run context with cancellation and call timeouts
//! - [`config`] - Engine configuration
//! - [`error`] - Engine error taxonomy

pub mod actions;
pub mod config;
pub mod context;
pub mod error;
pub mod filters;
pub mod policy;
pub mod provider;
pub mod resource;

/// Version injected at compile time via RESFILTER_VERSION (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("RESFILTER_VERSION") {
    Some(v) => v,
    None => "dev",
};

pub use config::EngineConfig;
pub use context::RunContext;
pub use error::{EngineError, ProviderError, Result};
pub use policy::{Policy, PolicyReport, PolicyRunner};
