//! Resource abstraction layer
//!
//! This module provides a data-driven approach to listing cloud resources.
//! Resource definitions are loaded from JSON files at compile time, allowing
//! new resource types to be added without code changes.
//!
//! # Architecture
//!
//! - [`model`] - The [`Resource`] record and JSON path helpers
//! - [`registry`] - Resource type descriptors from embedded and user JSON
//! - [`fetcher`] - Lists resources through the provider with pagination support
//!
//! # Resource Definitions
//!
//! Resources are defined in JSON files under `src/resources/`:
//! - `compute.json` - Compute Engine resources (VMs, disks, firewalls, addresses)
//! - `storage.json` - Cloud Storage buckets
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(Registry::builtin()?);
//! let manager = ResourceQueryManager::new(registry);
//! let vms = manager.fetch(&ctx, "compute-instances").await?;
//! ```

pub mod fetcher;
pub mod model;
pub mod registry;

pub use fetcher::{describe_resource, extract_items, ResourceQueryManager};
pub use model::{chunks, lookup_path, Resource};
pub use registry::{
    ActionDef, AttrFilter, DirectionFields, FieldLayout, MetricsDef, PermissionLayout, Registry,
    ResourceDef,
};
