//! # Errors
//!
//! Error taxonomy for planning and applying the resource graph.
//!
//! Only [`ProvisionError::TransientControlPlaneError`] is retried by the apply
//! engine. Every other variant is a configuration defect or a hard failure and
//! surfaces immediately with the logical id and resource type involved.

use crate::model::{LogicalId, ResourceType};
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    /// A referenced resource has no resolved identifier at apply time
    #[error("{resource_type} '{logical_id}' references '{missing}', which has no resolved identifier")]
    UnresolvedDependency {
        logical_id: LogicalId,
        resource_type: ResourceType,
        missing: LogicalId,
    },

    /// A grant targets a catalog resource whose backing bucket is not registered
    #[error("grant of {permissions} to '{principal}' on {resource} rejected: backing bucket '{bucket}' is not a registered location")]
    UngovernedLocation {
        principal: String,
        resource: String,
        bucket: String,
        permissions: String,
    },

    /// Partition projection definition is inconsistent
    #[error("invalid projection for table '{table}': {reason}")]
    InvalidProjectionSpec { table: String, reason: String },

    /// Propagation delay or throttling that outlived the retry budget
    #[error("{resource_type} '{logical_id}' failed after {attempts} attempt(s): {message}")]
    TransientControlPlaneError {
        logical_id: LogicalId,
        resource_type: ResourceType,
        attempts: u32,
        message: String,
    },

    /// The executing identity may not create or modify the resource
    #[error("permission denied for {resource_type} '{logical_id}': {message}")]
    PermissionDenied {
        logical_id: LogicalId,
        resource_type: ResourceType,
        message: String,
    },

    /// Principal reference could not be turned into an ARN
    #[error("invalid principal '{principal}': {reason}")]
    InvalidPrincipal { principal: String, reason: String },

    /// Graph or resource declaration violates a structural invariant
    #[error("invalid configuration for '{logical_id}': {reason}")]
    InvalidConfiguration { logical_id: LogicalId, reason: String },

    /// Control plane permanently refused the request
    #[error("control plane rejected {resource_type} '{logical_id}': {message}")]
    ControlPlaneRejected {
        logical_id: LogicalId,
        resource_type: ResourceType,
        message: String,
    },

    /// Apply was cancelled before all resources were applied
    #[error("apply cancelled after {applied} resource(s)")]
    Cancelled { applied: usize },
}

impl ProvisionError {
    /// Whether the engine may retry the failed operation
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::TransientControlPlaneError { .. })
    }

    /// Shorthand for configuration defects on a logical id
    pub fn invalid(logical_id: &LogicalId, reason: impl Into<String>) -> Self {
        ProvisionError::InvalidConfiguration {
            logical_id: logical_id.clone(),
            reason: reason.into(),
        }
    }

    /// Stable label for metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::UnresolvedDependency { .. } => "unresolved_dependency",
            ProvisionError::UngovernedLocation { .. } => "ungoverned_location",
            ProvisionError::InvalidProjectionSpec { .. } => "invalid_projection_spec",
            ProvisionError::TransientControlPlaneError { .. } => "transient",
            ProvisionError::PermissionDenied { .. } => "permission_denied",
            ProvisionError::InvalidPrincipal { .. } => "invalid_principal",
            ProvisionError::InvalidConfiguration { .. } => "invalid_configuration",
            ProvisionError::ControlPlaneRejected { .. } => "rejected",
            ProvisionError::Cancelled { .. } => "cancelled",
        }
    }
}
