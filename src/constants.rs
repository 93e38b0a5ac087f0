//! # Constants
//!
//! Shared constants used throughout the provisioner.
//!
//! These values represent reasonable defaults and can be overridden via
//! environment variables or the stack configuration where applicable.

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default number of attempts per resource operation, including the first
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default number of resource operations in flight within one wave
pub const DEFAULT_MAX_CONCURRENT_APPLIES: usize = 4;

/// Default interval between Cloud Control request status polls (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Default number of status polls before a request counts as transient failure
/// At the default interval this allows roughly 30 minutes per resource
pub const DEFAULT_MAX_POLLS: u32 = 900;

/// Default deployment state file
pub const DEFAULT_STATE_FILE: &str = "compliance-lake.state.json";

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "compliance_lake=info";

/// `CROSS_ACCOUNT_VERSION` data-lake settings parameter
pub const CROSS_ACCOUNT_VERSION: u32 = 4;

/// Audit trail service principal
pub const TRAIL_SERVICE: &str = "cloudtrail.amazonaws.com";

/// Default CloudTrail log retention in days (ten years)
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 3653;

/// Default first year of the projected year partition
pub const DEFAULT_PROJECTION_START_YEAR: u32 = 2025;

/// Default last year of the projected year partition
pub const DEFAULT_PROJECTION_END_YEAR: u32 = 2030;
