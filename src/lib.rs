//! Compliance Lake Library
//!
//! Declares a compliance data lake as an explicit resource graph and applies
//! it against a cloud control plane: encrypted buckets, an audit trail, a
//! governed catalog and partition-projected query tables.
//!
//! - [`graph`]: typed resource specs and dependency planning
//! - [`provision`]: key, bucket, trail, catalog, permission, table and workgroup provisioners
//! - [`projection`]: partition-projection compiler
//! - [`control_plane`]: Cloud Control and in-memory backends
//! - [`engine`]: plan-then-apply engine with bounded retries
//! - [`stack`]: the canonical data-lake stack
//!
//! Tests are included in the module files and under `tests/`.

pub mod config;
pub mod constants;
pub mod control_plane;
pub mod engine;
pub mod error;
pub mod graph;
pub mod model;
pub mod observability;
pub mod projection;
pub mod provision;
pub mod stack;

pub use config::{ProvisionerConfig, StackConfig};
pub use control_plane::{ControlPlane, DeploymentState, MemoryControlPlane};
pub use engine::{ApplyReport, Provisioner};
pub use error::{ProvisionError, Result};
pub use graph::{Handle, Plan, ResourceGraph};
pub use model::{Environment, LogicalId, Principal, RemovalPolicy, ResourceType};
pub use stack::{build_stack, DataLakeStack};
