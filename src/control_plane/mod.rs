//! # Control Plane
//!
//! The provisioning primitive the apply engine drives: "create, update or
//! delete a resource of type T with properties P", returning the identifier
//! and ARN the cloud assigned.
//!
//! Two implementations exist:
//!
//! - [`cloud_control::CloudControlPlane`] - AWS Cloud Control API
//! - [`memory::MemoryControlPlane`] - in-process backend for dry runs and tests

pub mod cloud_control;
pub mod memory;
pub mod state;

use crate::error::ProvisionError;
use crate::model::{LogicalId, ResourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub use cloud_control::CloudControlPlane;
pub use memory::MemoryControlPlane;
pub use state::{client_token, fingerprint, DeployedResource, DeploymentState};

/// Create or update one resource
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRequest {
    pub logical_id: LogicalId,
    pub resource_type: ResourceType,
    pub properties: Value,
    /// Identifier from a previous apply; `None` creates the resource
    pub physical_id: Option<String>,
    /// Idempotency token, identical across retries of this request
    pub client_token: String,
}

/// Delete one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub logical_id: LogicalId,
    pub resource_type: ResourceType,
    pub physical_id: String,
    /// Empty the bucket before deleting it
    pub purge_objects: bool,
    pub client_token: String,
}

/// What the control plane did for an apply request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyAction {
    Created,
    Updated,
    Unchanged,
}

impl ApplyAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyAction::Created => "create",
            ApplyAction::Updated => "update",
            ApplyAction::Unchanged => "no_change",
        }
    }
}

impl fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub physical_id: String,
    pub arn: Option<String>,
    pub action: ApplyAction,
}

/// Failure reported by a control-plane backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlPlaneError {
    /// Throttling, propagation delay or a timeout; the request may succeed later
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("access denied: {0}")]
    PermissionDenied(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("resource not found: {0}")]
    NotFound(String),
}

impl ControlPlaneError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlPlaneError::Transient(_))
    }

    /// Attach the resource context the engine knows about
    #[must_use]
    pub fn into_provision_error(
        self,
        logical_id: &LogicalId,
        resource_type: ResourceType,
        attempts: u32,
    ) -> ProvisionError {
        match self {
            ControlPlaneError::Transient(message) => ProvisionError::TransientControlPlaneError {
                logical_id: logical_id.clone(),
                resource_type,
                attempts,
                message,
            },
            ControlPlaneError::PermissionDenied(message) => ProvisionError::PermissionDenied {
                logical_id: logical_id.clone(),
                resource_type,
                message,
            },
            ControlPlaneError::Rejected(message) | ControlPlaneError::NotFound(message) => {
                ProvisionError::ControlPlaneRejected {
                    logical_id: logical_id.clone(),
                    resource_type,
                    message,
                }
            }
        }
    }
}

/// Backend that materializes rendered resources
///
/// Applying identical properties to an existing resource must be a no-op
/// reported as [`ApplyAction::Unchanged`].
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Backend name for logs and metrics
    fn name(&self) -> &'static str;

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, ControlPlaneError>;

    async fn delete(&self, request: &DeleteRequest) -> Result<(), ControlPlaneError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_keep_attempt_count() {
        let err = ControlPlaneError::Transient("Throttling".to_string()).into_provision_error(
            &LogicalId::new("CatalogKey"),
            ResourceType::KmsKey,
            5,
        );
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            ProvisionError::TransientControlPlaneError { attempts: 5, .. }
        ));
    }

    #[test]
    fn denied_errors_surface_verbatim() {
        let err = ControlPlaneError::PermissionDenied("not authorized to perform kms:CreateKey".to_string())
            .into_provision_error(&LogicalId::new("CatalogKey"), ResourceType::KmsKey, 1);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("not authorized to perform kms:CreateKey"));
    }
}
