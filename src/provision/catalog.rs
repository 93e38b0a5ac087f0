//! # Catalog Settings
//!
//! Account-wide catalog encryption at rest. The catalog key's encrypt-decrypt
//! grants follow the data-lake administrator list kept in
//! [`Governance`](super::permissions::Governance): declaring the encryption
//! and every later administrator REPLACE both rewrite them, so the key stays
//! granted to exactly the admin set.

use super::key::KeyHandle;
use crate::error::{ProvisionError, Result};
use crate::graph::{Handle, RenderContext, ResourceDefinition, ResourceGraph, ResourceSpec};
use crate::model::{LogicalId, Principal, RemovalPolicy, ResourceType};
use serde_json::{json, Value};
use tracing::debug;

pub type CatalogEncryptionHandle = Handle<CatalogEncryptionSpec>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEncryptionSpec {
    pub key: KeyHandle,
}

impl ResourceDefinition for CatalogEncryptionSpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::CatalogEncryptionSettings;

    fn references(&self) -> Vec<LogicalId> {
        vec![self.key.logical_id().clone()]
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        Ok(json!({
            "CatalogId": ctx.env().account,
            "DataCatalogEncryptionSettings": {
                "EncryptionAtRest": {
                    "CatalogEncryptionMode": "SSE-KMS",
                    "SseAwsKmsKeyId": ctx.physical_id(self.key.logical_id())?,
                },
            },
        }))
    }
}

#[derive(Debug)]
pub struct CatalogSettingsProvisioner<'g> {
    graph: &'g mut ResourceGraph,
}

impl ResourceGraph {
    pub fn catalog(&mut self) -> CatalogSettingsProvisioner<'_> {
        CatalogSettingsProvisioner { graph: self }
    }
}

impl CatalogSettingsProvisioner<'_> {
    /// Encrypt the catalog with `key` and let every admin use it
    ///
    /// The settings are account-wide, so a graph holds at most one. `admins`
    /// replaces the administrator list, as [`set_admins`] does.
    ///
    /// [`set_admins`]: super::permissions::PermissionGrantEngine::set_admins
    pub fn encrypt_catalog(
        &mut self,
        id: impl Into<LogicalId>,
        key: &KeyHandle,
        admins: &[Principal],
        removal_policy: RemovalPolicy,
    ) -> Result<CatalogEncryptionHandle> {
        let id = id.into();
        if self.graph.count(ResourceType::CatalogEncryptionSettings) > 0 {
            return Err(ProvisionError::invalid(
                &id,
                "catalog encryption settings are account-wide and already declared",
            ));
        }
        let admins = self.graph.validate_admins(&id, admins.to_vec())?;
        self.graph.keys().spec(key)?;

        let handle = self.graph.add(
            id,
            ResourceSpec::CatalogEncryption(CatalogEncryptionSpec { key: key.clone() }),
            removal_policy,
        )?;
        self.graph.governance.catalog_key = Some(key.clone());
        self.graph.replace_admins(admins)?;
        debug!(key = %key.logical_id(), "Catalog key follows the data-lake administrators");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Outputs, ResolvedResource};
    use crate::model::Environment;
    use crate::provision::key::KeyCapability;
    use std::collections::BTreeSet;

    fn env() -> Environment {
        Environment::new("123456789012", "aws", "us-east-1")
            .unwrap()
            .with_execution_role("arn:aws:iam::123456789012:role/deployer")
    }

    fn encrypt_decrypt_holders(g: &mut ResourceGraph, key: &KeyHandle) -> BTreeSet<Principal> {
        let keys = g.keys();
        let spec = keys.spec(key).unwrap();
        spec.principals_with(KeyCapability::EncryptDecrypt)
            .into_iter()
            .cloned()
            .collect()
    }

    #[test]
    fn catalog_key_is_granted_to_exactly_the_admins() {
        let mut g = ResourceGraph::new(env());
        let key = g.keys().create_key("CatalogKmsKey", RemovalPolicy::Destroy).unwrap();
        let admins = vec![Principal::user("rodrigo"), Principal::ExecutionRole];
        let settings = g
            .catalog()
            .encrypt_catalog("CatalogEncryptionSettings", &key, &admins, RemovalPolicy::Destroy)
            .unwrap();

        assert_eq!(
            encrypt_decrypt_holders(&mut g, &key),
            admins.iter().cloned().collect::<BTreeSet<_>>()
        );

        let mut outputs = Outputs::new();
        outputs.insert(
            key.logical_id().clone(),
            ResolvedResource {
                physical_id: "1234abcd".to_string(),
                arn: Some("arn:aws:kms:us-east-1:123456789012:key/1234abcd".to_string()),
            },
        );
        let props = g
            .node(settings.logical_id())
            .unwrap()
            .render(g.env(), &outputs)
            .unwrap();
        assert_eq!(
            props["DataCatalogEncryptionSettings"]["EncryptionAtRest"]["SseAwsKmsKeyId"],
            json!("1234abcd")
        );
        assert_eq!(props["CatalogId"], json!("123456789012"));
    }

    #[test]
    fn replacing_admins_moves_the_catalog_key_grants() {
        let mut g = ResourceGraph::new(env());
        let key = g.keys().create_key("CatalogKmsKey", RemovalPolicy::Destroy).unwrap();
        g.catalog()
            .encrypt_catalog("Settings", &key, &[Principal::user("alice")], RemovalPolicy::Destroy)
            .unwrap();
        g.permissions()
            .set_admins(vec![Principal::user("alice")], RemovalPolicy::Destroy)
            .unwrap();
        g.permissions()
            .set_admins(vec![Principal::user("bob")], RemovalPolicy::Destroy)
            .unwrap();

        assert_eq!(
            encrypt_decrypt_holders(&mut g, &key),
            BTreeSet::from([Principal::user("bob")])
        );
        assert_eq!(g.governance().admins(), &[Principal::user("bob")]);
    }

    #[test]
    fn settings_are_declared_once_and_need_admins() {
        let mut g = ResourceGraph::new(env());
        let key = g.keys().create_key("CatalogKmsKey", RemovalPolicy::Destroy).unwrap();
        let admins = [Principal::user("rodrigo")];
        assert!(g
            .catalog()
            .encrypt_catalog("Settings", &key, &[], RemovalPolicy::Destroy)
            .is_err());
        assert_eq!(g.len(), 1);
        assert!(encrypt_decrypt_holders(&mut g, &key).is_empty());

        g.catalog()
            .encrypt_catalog("Settings", &key, &admins, RemovalPolicy::Retain)
            .unwrap();
        assert!(g
            .catalog()
            .encrypt_catalog("SettingsAgain", &key, &admins, RemovalPolicy::Destroy)
            .is_err());
        assert_eq!(
            g.node(&LogicalId::new("Settings")).unwrap().removal_policy,
            RemovalPolicy::Retain
        );
    }
}
