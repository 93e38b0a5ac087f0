//! # Stack Configuration
//!
//! YAML description of one data-lake stack. Everything except the region and
//! the analyst user has a default matching the reference deployment.
//!
//! ```yaml
//! region: us-east-1
//! adminUser: rodrigo
//! executionRoleArn: arn:aws:iam::123456789012:role/cdk-exec
//! projection:
//!   startYear: 2025
//!   endYear: 2030
//! features:
//!   enableLakeFormationPermissions: true
//!   enableCrossAccountGrant: false
//! ```

use crate::constants::{
    DEFAULT_LOG_RETENTION_DAYS, DEFAULT_PROJECTION_END_YEAR, DEFAULT_PROJECTION_START_YEAR,
};
use crate::model::{Environment, RemovalPolicy};
use crate::projection::layout::AWS_REGIONS;
use anyhow::{anyhow, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_partition() -> String {
    "aws".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackConfig {
    /// Target account; resolved from the caller identity when omitted
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default = "default_partition")]
    pub partition: String,
    pub region: String,
    /// Role the deployment runs as; added to the data-lake administrators
    #[serde(default)]
    pub execution_role_arn: Option<String>,
    /// IAM user administering the lake and granted query access
    pub admin_user: String,
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
    /// Empty buckets before deleting them
    #[serde(default = "default_true")]
    pub auto_delete_objects: bool,
    #[serde(default)]
    pub trail: TrailConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub projection: ProjectionConfig,
    #[serde(default)]
    pub workgroup: WorkgroupConfig,
    #[serde(default)]
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrailConfig {
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

fn default_log_retention_days() -> u32 {
    DEFAULT_LOG_RETENTION_DAYS
}

impl Default for TrailConfig {
    fn default() -> Self {
        Self {
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogConfig {
    pub database_name: String,
    pub database_description: String,
    pub table_name: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            database_name: "sample_database".to_string(),
            database_description: "This is the description.".to_string(),
            table_name: "cloudtrail_logs".to_string(),
        }
    }
}

/// Partition projection parameters of the trail table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectionConfig {
    pub start_year: u32,
    pub end_year: u32,
    /// Region partition values; every AWS commercial region when empty
    pub regions: Vec<String>,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            start_year: DEFAULT_PROJECTION_START_YEAR,
            end_year: DEFAULT_PROJECTION_END_YEAR,
            regions: Vec::new(),
        }
    }
}

impl ProjectionConfig {
    #[must_use]
    pub fn regions(&self) -> Vec<String> {
        if self.regions.is_empty() {
            AWS_REGIONS.iter().map(|r| (*r).to_string()).collect()
        } else {
            self.regions.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkgroupConfig {
    pub name: String,
    pub results_prefix: String,
    pub metrics_enabled: bool,
    pub recursive_delete: bool,
}

impl Default for WorkgroupConfig {
    fn default() -> Self {
        Self {
            name: "ReadOnly".to_string(),
            results_prefix: "ReadOnlyWorkGroup".to_string(),
            metrics_enabled: true,
            recursive_delete: true,
        }
    }
}

/// Toggles between the variants of the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureFlags {
    /// Declare the database, the projected table and the catalog grants
    pub enable_lake_formation_permissions: bool,
    /// Issue catalog grants with the grant option
    pub enable_cross_account_grant: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_lake_formation_permissions: true,
            enable_cross_account_grant: false,
        }
    }
}

impl StackConfig {
    /// Minimal configuration for `region` and `admin_user`
    #[must_use]
    pub fn new(region: impl Into<String>, admin_user: impl Into<String>) -> Self {
        Self {
            account: None,
            partition: default_partition(),
            region: region.into(),
            execution_role_arn: None,
            admin_user: admin_user.into(),
            removal_policy: RemovalPolicy::Destroy,
            auto_delete_objects: true,
            trail: TrailConfig::default(),
            catalog: CatalogConfig::default(),
            projection: ProjectionConfig::default(),
            workgroup: WorkgroupConfig::default(),
            features: FeatureFlags::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stack config {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid stack config {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Failed to parse stack config YAML")?;
        if config.region.trim().is_empty() {
            return Err(anyhow!("region cannot be empty"));
        }
        if config.admin_user.trim().is_empty() {
            return Err(anyhow!("adminUser cannot be empty"));
        }
        Ok(config)
    }

    /// Target environment, with `account` used when the config names none
    pub fn environment(&self, account: Option<&str>) -> Result<Environment> {
        let account = self
            .account
            .as_deref()
            .or(account)
            .ok_or_else(|| anyhow!("no account configured and none could be resolved"))?;
        let env = Environment::new(account, &self.partition, &self.region)?;
        Ok(match &self.execution_role_arn {
            Some(arn) => env.with_execution_role(arn.clone()),
            None => env,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_takes_defaults() {
        let config = StackConfig::from_yaml("region: us-east-1\nadminUser: rodrigo\n").unwrap();
        assert_eq!(config, StackConfig::new("us-east-1", "rodrigo"));
        assert_eq!(config.catalog.database_name, "sample_database");
        assert_eq!(config.workgroup.name, "ReadOnly");
        assert_eq!(config.trail.log_retention_days, 3653);
        assert!(config.features.enable_lake_formation_permissions);
        assert!(!config.features.enable_cross_account_grant);
        assert_eq!(config.projection.regions().len(), 17);
    }

    #[test]
    fn features_and_projection_are_read() {
        let config = StackConfig::from_yaml(
            r"
region: eu-west-1
adminUser: analyst
account: '123456789012'
removalPolicy: retain
projection:
  startYear: 2024
  regions: [eu-west-1]
features:
  enableLakeFormationPermissions: false
",
        )
        .unwrap();
        assert_eq!(config.removal_policy, RemovalPolicy::Retain);
        assert_eq!(config.projection.start_year, 2024);
        assert_eq!(config.projection.end_year, 2030);
        assert_eq!(config.projection.regions(), vec!["eu-west-1".to_string()]);
        assert!(!config.features.enable_lake_formation_permissions);
        assert_eq!(config.environment(None).unwrap().account, "123456789012");
    }

    #[test]
    fn configured_account_wins_over_resolved() {
        let mut config = StackConfig::new("us-east-1", "rodrigo");
        assert!(config.environment(None).is_err());
        assert_eq!(config.environment(Some("210987654321")).unwrap().account, "210987654321");
        config.account = Some("123456789012".to_string());
        assert_eq!(config.environment(Some("210987654321")).unwrap().account, "123456789012");
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.yaml");
        std::fs::write(&path, "region: us-west-2\nadminUser: rodrigo\n").unwrap();
        assert_eq!(StackConfig::load(&path).unwrap().region, "us-west-2");
        assert!(StackConfig::load(&dir.path().join("missing.yaml")).is_err());
    }
}
