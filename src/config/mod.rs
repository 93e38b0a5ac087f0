//! # Configuration
//!
//! - [`ProvisionerConfig`]: engine settings read from environment variables
//! - [`StackConfig`]: YAML description of the data-lake stack

pub mod provisioner;
pub mod stack;

pub use provisioner::{LogFormat, ProvisionerConfig};
pub use stack::{
    CatalogConfig, FeatureFlags, ProjectionConfig, StackConfig, TrailConfig, WorkgroupConfig,
};
