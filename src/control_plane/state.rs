//! # Deployment State
//!
//! What the last apply materialized: physical ids, ARNs and a fingerprint of
//! the properties each resource was applied with. A later apply whose rendered
//! properties hash to the same fingerprint skips the control plane entirely.

use crate::graph::{Outputs, ResolvedResource};
use crate::model::{LogicalId, RemovalPolicy, ResourceType};
use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Stable hash of rendered properties, independent of object key order
#[must_use]
pub fn fingerprint(properties: &Value) -> String {
    let digest = Sha256::digest(canonical(properties).to_string().as_bytes());
    general_purpose::STANDARD.encode(digest)
}

/// Client token of one control-plane operation
///
/// Retries of the same operation within a run reuse the token, so a request
/// that settled after its response was lost is not issued a second time.
#[must_use]
pub fn client_token(run_id: &str, logical_id: &LogicalId, action: &str, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [run_id, logical_id.as_str(), action, fingerprint] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    general_purpose::STANDARD.encode(hasher.finalize())
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedResource {
    pub resource_type: ResourceType,
    pub physical_id: String,
    #[serde(default)]
    pub arn: Option<String>,
    pub fingerprint: String,
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
    /// Bucket objects are deleted together with the bucket
    #[serde(default)]
    pub purge_on_delete: bool,
    /// Logical ids this resource depended on when it was applied
    #[serde(default)]
    pub depends_on: Vec<LogicalId>,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentState {
    #[serde(default)]
    resources: BTreeMap<LogicalId, DeployedResource>,
}

impl DeploymentState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load state from a JSON file; a missing file is an empty state
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write state file {}", path.display()))
    }

    #[must_use]
    pub fn get(&self, id: &LogicalId) -> Option<&DeployedResource> {
        self.resources.get(id)
    }

    pub fn record(&mut self, id: LogicalId, resource: DeployedResource) {
        self.resources.insert(id, resource);
    }

    pub fn remove(&mut self, id: &LogicalId) -> Option<DeployedResource> {
        self.resources.remove(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LogicalId, &DeployedResource)> {
        self.resources.iter()
    }

    /// Resolved identifiers of everything in state
    #[must_use]
    pub fn outputs(&self) -> Outputs {
        let mut outputs = Outputs::new();
        for (id, resource) in &self.resources {
            outputs.insert(
                id.clone(),
                ResolvedResource {
                    physical_id: resource.physical_id.clone(),
                    arn: resource.arn.clone(),
                },
            );
        }
        outputs
    }
}
