//! # Model
//!
//! Core identifiers shared by every resource in the graph.
//!
//! - [`LogicalId`]: stable name of a node in the resource graph
//! - [`ResourceType`]: the cloud resource type a node materializes as
//! - [`RemovalPolicy`]: what happens to the resource when the stack is destroyed
//! - [`Environment`]: account/partition/region the graph is applied to

pub mod principal;

pub use principal::{Principal, PrincipalKind, ResolvedPrincipal};

use crate::error::{ProvisionError, Result};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static ACCOUNT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{12}$").expect("account id regex is valid"));

/// Logical identifier of a node in the resource graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalId(String);

impl LogicalId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a child id, e.g. `CloudtrailBucket` -> `CloudtrailBucketPolicy`
    #[must_use]
    pub fn child(&self, suffix: &str) -> Self {
        Self(format!("{}{}", self.0, suffix))
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LogicalId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for LogicalId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Cloud resource types the provisioner knows how to render
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    KmsKey,
    Bucket,
    BucketPolicy,
    LogGroup,
    Role,
    Trail,
    CatalogEncryptionSettings,
    DataLakeSettings,
    RegisteredLocation,
    Database,
    Table,
    Permissions,
    WorkGroup,
}

impl ResourceType {
    /// Type name as understood by the control plane
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::KmsKey => "AWS::KMS::Key",
            ResourceType::Bucket => "AWS::S3::Bucket",
            ResourceType::BucketPolicy => "AWS::S3::BucketPolicy",
            ResourceType::LogGroup => "AWS::Logs::LogGroup",
            ResourceType::Role => "AWS::IAM::Role",
            ResourceType::Trail => "AWS::CloudTrail::Trail",
            ResourceType::CatalogEncryptionSettings => "AWS::Glue::DataCatalogEncryptionSettings",
            ResourceType::DataLakeSettings => "AWS::LakeFormation::DataLakeSettings",
            ResourceType::RegisteredLocation => "AWS::LakeFormation::Resource",
            ResourceType::Database => "AWS::Glue::Database",
            ResourceType::Table => "AWS::Glue::Table",
            ResourceType::Permissions => "AWS::LakeFormation::Permissions",
            ResourceType::WorkGroup => "AWS::Athena::WorkGroup",
        }
    }

    /// Whether the control plane assigns an ARN to resources of this type
    #[must_use]
    pub fn has_arn(&self) -> bool {
        matches!(
            self,
            ResourceType::KmsKey
                | ResourceType::Bucket
                | ResourceType::LogGroup
                | ResourceType::Role
                | ResourceType::Trail
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviour of a resource when its owning stack is destroyed
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum RemovalPolicy {
    #[default]
    Destroy,
    Retain,
}

/// Target environment of an apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub account: String,
    pub partition: String,
    pub region: String,
    /// Role the control plane executes deployments with, if known
    #[serde(default)]
    pub execution_role_arn: Option<String>,
}

impl Environment {
    /// Build an environment, validating the account id
    pub fn new(account: &str, partition: &str, region: &str) -> Result<Self> {
        if !ACCOUNT_ID.is_match(account) {
            return Err(ProvisionError::InvalidPrincipal {
                principal: account.to_string(),
                reason: "account id must be exactly 12 digits".to_string(),
            });
        }
        if partition.trim().is_empty() || region.trim().is_empty() {
            return Err(ProvisionError::InvalidConfiguration {
                logical_id: LogicalId::new("Environment"),
                reason: "partition and region cannot be empty".to_string(),
            });
        }
        Ok(Self {
            account: account.to_string(),
            partition: partition.to_string(),
            region: region.to_string(),
            execution_role_arn: None,
        })
    }

    #[must_use]
    pub fn with_execution_role(mut self, arn: impl Into<String>) -> Self {
        self.execution_role_arn = Some(arn.into());
        self
    }

    /// `arn:<partition>:iam::<account>:<resource>`
    #[must_use]
    pub fn iam_arn(&self, resource: &str) -> String {
        format!("arn:{}:iam::{}:{}", self.partition, self.account, resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_rejects_malformed_account() {
        assert!(Environment::new("12345", "aws", "us-east-1").is_err());
        assert!(Environment::new("12345678901a", "aws", "us-east-1").is_err());
        assert!(Environment::new("123456789012", "", "us-east-1").is_err());
        let env = Environment::new("123456789012", "aws", "us-east-1").unwrap();
        assert_eq!(env.iam_arn("root"), "arn:aws:iam::123456789012:root");
    }

    #[test]
    fn child_ids_append_suffix() {
        let id = LogicalId::new("CloudtrailBucket");
        assert_eq!(id.child("Policy").as_str(), "CloudtrailBucketPolicy");
    }
}
