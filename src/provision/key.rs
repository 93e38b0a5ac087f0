//! # Key Manager
//!
//! Per-purpose KMS keys and their grants.
//!
//! Keys are always created with rotation enabled. Grants are accumulated on the
//! key node and rendered into its key policy when the key is applied, so a key
//! and all of its grants land in a single control-plane call.

use crate::error::{ProvisionError, Result};
use crate::graph::{Handle, RenderContext, ResourceDefinition, ResourceGraph, ResourceSpec};
use crate::model::{LogicalId, Principal, RemovalPolicy, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::debug;

pub type KeyHandle = Handle<KmsKeySpec>;

/// What a principal may do with a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyCapability {
    Encrypt,
    Decrypt,
    EncryptDecrypt,
}

impl KeyCapability {
    /// KMS actions the capability expands to
    #[must_use]
    pub fn actions(&self) -> &'static [&'static str] {
        match self {
            KeyCapability::Encrypt => &["kms:Encrypt", "kms:ReEncrypt*", "kms:GenerateDataKey*"],
            KeyCapability::Decrypt => &["kms:Decrypt"],
            KeyCapability::EncryptDecrypt => &[
                "kms:Decrypt",
                "kms:Encrypt",
                "kms:ReEncrypt*",
                "kms:GenerateDataKey*",
            ],
        }
    }
}

/// A (principal, capability) pair on a key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyGrant {
    pub principal: Principal,
    pub capability: KeyCapability,
}

/// Pure grant computation: one grant per principal for `capability`
#[must_use]
pub fn compute_grants(principals: &[Principal], capability: KeyCapability) -> BTreeSet<KeyGrant> {
    principals
        .iter()
        .map(|principal| KeyGrant {
            principal: principal.clone(),
            capability,
        })
        .collect()
}

/// Declared KMS key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsKeySpec {
    rotation_enabled: bool,
    grants: BTreeSet<KeyGrant>,
}

impl KmsKeySpec {
    #[must_use]
    pub fn rotation_enabled(&self) -> bool {
        self.rotation_enabled
    }

    #[must_use]
    pub fn grants(&self) -> &BTreeSet<KeyGrant> {
        &self.grants
    }

    /// Principals holding exactly `capability`
    #[must_use]
    pub fn principals_with(&self, capability: KeyCapability) -> BTreeSet<&Principal> {
        self.grants
            .iter()
            .filter(|g| g.capability == capability)
            .map(|g| &g.principal)
            .collect()
    }
}

impl ResourceDefinition for KmsKeySpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::KmsKey;

    fn references(&self) -> Vec<LogicalId> {
        Vec::new()
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        let mut statements = vec![json!({
            "Sid": "EnableAccountAdministration",
            "Effect": "Allow",
            "Principal": { "AWS": ctx.env().iam_arn("root") },
            "Action": "kms:*",
            "Resource": "*",
        })];

        for grant in &self.grants {
            let principal = ctx.resolve(&grant.principal)?;
            statements.push(json!({
                "Effect": "Allow",
                "Principal": principal.policy_principal(),
                "Action": grant.capability.actions(),
                "Resource": "*",
            }));
        }

        Ok(json!({
            "EnableKeyRotation": self.rotation_enabled,
            "KeyPolicy": {
                "Version": "2012-10-17",
                "Statement": statements,
            },
        }))
    }
}

/// Declares keys and issues grants on them
#[derive(Debug)]
pub struct KeyManager<'g> {
    graph: &'g mut ResourceGraph,
}

impl ResourceGraph {
    pub fn keys(&mut self) -> KeyManager<'_> {
        KeyManager { graph: self }
    }
}

impl KeyManager<'_> {
    /// Declare a key with rotation enabled
    pub fn create_key(
        &mut self,
        id: impl Into<LogicalId>,
        removal_policy: RemovalPolicy,
    ) -> Result<KeyHandle> {
        let spec = KmsKeySpec {
            rotation_enabled: true,
            grants: BTreeSet::new(),
        };
        self.graph
            .add(id.into(), ResourceSpec::Key(spec), removal_policy)
    }

    /// Grant `capability` on `key` to `principal`
    ///
    /// Returns `false` when the identical grant already exists.
    pub fn grant(
        &mut self,
        key: &KeyHandle,
        principal: Principal,
        capability: KeyCapability,
    ) -> Result<bool> {
        let mut batch = BTreeSet::new();
        batch.insert(KeyGrant {
            principal,
            capability,
        });
        Ok(self.grant_all(key, batch)? == 1)
    }

    /// Apply a batch of grants, as produced by [`compute_grants`]
    ///
    /// The batch is validated against the key before any grant is recorded.
    /// Returns the number of grants that were new.
    pub fn grant_all(&mut self, key: &KeyHandle, grants: BTreeSet<KeyGrant>) -> Result<usize> {
        let spec = self.spec_mut(key)?;
        let before = spec.grants.len();
        spec.grants.extend(grants);
        let added = spec.grants.len() - before;
        debug!(key = %key.logical_id(), added, "Recorded key grants");
        Ok(added)
    }

    /// Make `principals` the only holders of `capability` on `key`
    ///
    /// Grants of other capabilities are kept.
    pub fn replace_grants(
        &mut self,
        key: &KeyHandle,
        capability: KeyCapability,
        principals: &[Principal],
    ) -> Result<()> {
        let spec = self.spec_mut(key)?;
        spec.grants.retain(|g| g.capability != capability);
        spec.grants.extend(compute_grants(principals, capability));
        debug!(key = %key.logical_id(), capability = ?capability, holders = principals.len(), "Replaced key grants");
        Ok(())
    }

    /// Current spec of a declared key
    pub fn spec(&self, key: &KeyHandle) -> Result<&KmsKeySpec> {
        match self.graph.node(key.logical_id()).map(|n| &n.spec) {
            Some(ResourceSpec::Key(spec)) => Ok(spec),
            _ => Err(not_a_key(key)),
        }
    }

    fn spec_mut(&mut self, key: &KeyHandle) -> Result<&mut KmsKeySpec> {
        match self.graph.node_mut(key.logical_id()).map(|n| &mut n.spec) {
            Some(ResourceSpec::Key(spec)) => Ok(spec),
            _ => Err(not_a_key(key)),
        }
    }
}

fn not_a_key(key: &KeyHandle) -> ProvisionError {
    ProvisionError::invalid(key.logical_id(), "is not a key declared in this graph")
}
