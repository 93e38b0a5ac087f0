//! # Permission Grant Engine
//!
//! Centralized catalog governance:
//!
//! - data-lake settings: the administrator list (REPLACE semantics), the
//!   cross-account version and empty default permissions for new databases
//!   and tables
//! - registered locations: bucket prefixes handed to the governance layer
//!   through its service-linked role
//! - grants: principal-scoped permission sets on a database or a table
//!
//! A grant is only accepted when the bucket backing its resource is a
//! registered location; otherwise it fails with `UngovernedLocation` at
//! declaration, before anything is sent to the control plane. Each grant
//! carries explicit edges to its location and to the settings node.

use super::bucket::BucketHandle;
use super::key::{KeyCapability, KeyHandle};
use super::table::{DatabaseHandle, TableHandle};
use crate::constants::CROSS_ACCOUNT_VERSION;
use crate::error::{ProvisionError, Result};
use crate::graph::{Handle, RenderContext, ResourceDefinition, ResourceGraph, ResourceSpec};
use crate::model::{Environment, LogicalId, Principal, PrincipalKind, RemovalPolicy, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

pub type DataLakeSettingsHandle = Handle<DataLakeSettingsSpec>;
pub type RegisteredLocationHandle = Handle<RegisteredLocationSpec>;
pub type GrantHandle = Handle<GrantSpec>;

/// Logical id of the account-wide settings node
pub const DATA_LAKE_SETTINGS_ID: &str = "DataLakeSettings";

/// Catalog permission vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    All,
    Select,
    Alter,
    Drop,
    Delete,
    Insert,
    Describe,
    CreateTable,
}

impl Permission {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::All => "ALL",
            Permission::Select => "SELECT",
            Permission::Alter => "ALTER",
            Permission::Drop => "DROP",
            Permission::Delete => "DELETE",
            Permission::Insert => "INSERT",
            Permission::Describe => "DESCRIBE",
            Permission::CreateTable => "CREATE_TABLE",
        }
    }

    /// Whether the permission applies to resources of `scope`
    #[must_use]
    pub fn applies_to(&self, scope: Scope) -> bool {
        match scope {
            Scope::Database => matches!(
                self,
                Permission::All
                    | Permission::Alter
                    | Permission::Drop
                    | Permission::Describe
                    | Permission::CreateTable
            ),
            Scope::Table => !matches!(self, Permission::CreateTable),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Database,
    Table,
}

/// Catalog resource a grant is requested on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRef {
    Database(DatabaseHandle),
    Table(TableHandle),
}

impl CatalogRef {
    fn logical_id(&self) -> &LogicalId {
        match self {
            CatalogRef::Database(h) => h.logical_id(),
            CatalogRef::Table(h) => h.logical_id(),
        }
    }
}

/// Resolved catalog resource as rendered into a grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogResource {
    Database {
        database: DatabaseHandle,
        name: String,
    },
    Table {
        table: TableHandle,
        name: String,
        database_name: String,
    },
}

impl CatalogResource {
    #[must_use]
    pub fn scope(&self) -> Scope {
        match self {
            CatalogResource::Database { .. } => Scope::Database,
            CatalogResource::Table { .. } => Scope::Table,
        }
    }

    fn logical_id(&self) -> &LogicalId {
        match self {
            CatalogResource::Database { database, .. } => database.logical_id(),
            CatalogResource::Table { table, .. } => table.logical_id(),
        }
    }

    fn render(&self, catalog_id: &str) -> Value {
        match self {
            CatalogResource::Database { name, .. } => json!({
                "DatabaseResource": { "CatalogId": catalog_id, "Name": name },
            }),
            CatalogResource::Table {
                name, database_name, ..
            } => json!({
                "TableResource": {
                    "CatalogId": catalog_id,
                    "Name": name,
                    "DatabaseName": database_name,
                },
            }),
        }
    }
}

impl fmt::Display for CatalogResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogResource::Database { name, .. } => write!(f, "database '{name}'"),
            CatalogResource::Table {
                name, database_name, ..
            } => write!(f, "table '{database_name}.{name}'"),
        }
    }
}

/// Account-wide data-lake settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLakeSettingsSpec {
    pub admins: Vec<Principal>,
    pub cross_account_version: u32,
}

impl ResourceDefinition for DataLakeSettingsSpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::DataLakeSettings;

    fn references(&self) -> Vec<LogicalId> {
        Vec::new()
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        let admins = self
            .admins
            .iter()
            .map(|admin| {
                let resolved = ctx.resolve(admin)?;
                Ok(json!({ "DataLakePrincipalIdentifier": resolved.arn()? }))
            })
            .collect::<Result<Vec<Value>>>()?;
        Ok(json!({
            "Admins": admins,
            "Parameters": { "CROSS_ACCOUNT_VERSION": self.cross_account_version },
            "MutationType": "REPLACE",
            "CreateDatabaseDefaultPermissions": [],
            "CreateTableDefaultPermissions": [],
        }))
    }
}

/// A bucket registered with the governance layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredLocationSpec {
    pub bucket: BucketHandle,
    pub role: Principal,
    pub hybrid_access: bool,
}

impl ResourceDefinition for RegisteredLocationSpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::RegisteredLocation;

    fn references(&self) -> Vec<LogicalId> {
        vec![self.bucket.logical_id().clone()]
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        let bucket_arn = ctx.arn(self.bucket.logical_id())?;
        let role = ctx.resolve(&self.role)?;
        Ok(json!({
            "ResourceArn": format!("{bucket_arn}/"),
            "UseServiceLinkedRole": true,
            "HybridAccessEnabled": self.hybrid_access,
            "RoleArn": role.arn()?,
        }))
    }
}

/// Effective permission set of one principal on one catalog resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantSpec {
    pub principal: Principal,
    pub resource: CatalogResource,
    pub permissions: BTreeSet<Permission>,
    /// Also grant the same set with grant option
    pub grantable: bool,
}

impl GrantSpec {
    fn permission_list(&self) -> Vec<&'static str> {
        self.permissions.iter().map(Permission::as_str).collect()
    }
}

impl ResourceDefinition for GrantSpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::Permissions;

    fn references(&self) -> Vec<LogicalId> {
        vec![self.resource.logical_id().clone()]
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        ctx.physical_id(self.resource.logical_id())?;
        let principal = ctx.resolve(&self.principal)?;
        let permissions = self.permission_list();
        let with_grant_option = if self.grantable {
            permissions.clone()
        } else {
            Vec::new()
        };
        Ok(json!({
            "DataLakePrincipal": { "DataLakePrincipalIdentifier": principal.arn()? },
            "Resource": self.resource.render(&ctx.env().account),
            "Permissions": permissions,
            "PermissionsWithGrantOption": with_grant_option,
        }))
    }
}

/// Governance bookkeeping kept alongside the graph
#[derive(Debug, Clone, Default)]
pub struct Governance {
    settings: Option<LogicalId>,
    /// Current administrator set; the settings node and the catalog key
    /// grants are both derived from it
    admins: Vec<Principal>,
    pub(crate) catalog_key: Option<KeyHandle>,
    /// Bucket logical id -> registered location node
    locations: BTreeMap<LogicalId, LogicalId>,
    /// (resolved principal identity, catalog resource) -> grant node
    grants: BTreeMap<(String, LogicalId), LogicalId>,
}

impl Governance {
    #[must_use]
    pub fn is_registered(&self, bucket: &LogicalId) -> bool {
        self.locations.contains_key(bucket)
    }

    #[must_use]
    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }

    #[must_use]
    pub fn admins(&self) -> &[Principal] {
        &self.admins
    }
}

impl ResourceGraph {
    /// Non-empty, IAM-only administrator list with duplicate identities removed
    pub(crate) fn validate_admins(&self, id: &LogicalId, admins: Vec<Principal>) -> Result<Vec<Principal>> {
        if admins.is_empty() {
            return Err(ProvisionError::invalid(id, "at least one data-lake administrator is required"));
        }
        if let Some(service) = admins.iter().find(|a| a.kind() == PrincipalKind::Service) {
            return Err(ProvisionError::InvalidPrincipal {
                principal: service.to_string(),
                reason: "service principals cannot administer the data lake".to_string(),
            });
        }
        Ok(dedup(self.env(), admins))
    }

    /// Make `admins` the administrator set of the settings node and the
    /// only encrypt-decrypt holders of the catalog key
    pub(crate) fn replace_admins(&mut self, admins: Vec<Principal>) -> Result<()> {
        if let Some(key) = self.governance.catalog_key.clone() {
            self.keys()
                .replace_grants(&key, KeyCapability::EncryptDecrypt, &admins)?;
        }
        if let Some(settings) = self.governance.settings.clone() {
            if let Some(ResourceSpec::DataLakeSettings(spec)) = self.node_mut(&settings).map(|n| &mut n.spec) {
                spec.admins.clone_from(&admins);
            }
        }
        self.governance.admins = admins;
        Ok(())
    }
}

#[derive(Debug)]
pub struct PermissionGrantEngine<'g> {
    graph: &'g mut ResourceGraph,
}

impl ResourceGraph {
    pub fn permissions(&mut self) -> PermissionGrantEngine<'_> {
        PermissionGrantEngine { graph: self }
    }

    #[must_use]
    pub fn governance(&self) -> &Governance {
        &self.governance
    }
}

impl PermissionGrantEngine<'_> {
    /// Replace the administrator list
    ///
    /// The catalog key's encrypt-decrypt grants are replaced along with it.
    pub fn set_admins(
        &mut self,
        admins: Vec<Principal>,
        removal_policy: RemovalPolicy,
    ) -> Result<DataLakeSettingsHandle> {
        let id = LogicalId::new(DATA_LAKE_SETTINGS_ID);
        let admins = self.graph.validate_admins(&id, admins)?;

        if let Some(existing) = self.graph.governance.settings.clone() {
            info!(admins = admins.len(), "Replacing data-lake administrators");
            self.graph.replace_admins(admins)?;
            return Ok(Handle::new(existing));
        }

        let handle: DataLakeSettingsHandle = self.graph.add(
            id.clone(),
            ResourceSpec::DataLakeSettings(DataLakeSettingsSpec {
                admins: admins.clone(),
                cross_account_version: CROSS_ACCOUNT_VERSION,
            }),
            removal_policy,
        )?;
        self.graph.governance.settings = Some(id);
        self.graph.replace_admins(admins)?;
        Ok(handle)
    }

    /// Register `bucket` with the governance layer through `role`
    ///
    /// Registering an already registered bucket returns the existing location.
    pub fn register_location(
        &mut self,
        id: impl Into<LogicalId>,
        bucket: &BucketHandle,
        role: Principal,
        removal_policy: RemovalPolicy,
    ) -> Result<RegisteredLocationHandle> {
        let id = id.into();
        if let Some(existing) = self.graph.governance.locations.get(bucket.logical_id()) {
            debug!(bucket = %bucket.logical_id(), location = %existing, "Location already registered");
            return Ok(Handle::new(existing.clone()));
        }
        if !matches!(role, Principal::ServiceLinkedRole { .. }) {
            return Err(ProvisionError::InvalidPrincipal {
                principal: role.to_string(),
                reason: "locations are registered through a service-linked role".to_string(),
            });
        }
        if let Some(node) = self.graph.node(bucket.logical_id()) {
            if node.resource_type() != ResourceType::Bucket {
                return Err(ProvisionError::invalid(&id, format!("'{}' is not a bucket", bucket.logical_id())));
            }
        }

        let handle: RegisteredLocationHandle = self.graph.add(
            id.clone(),
            ResourceSpec::RegisteredLocation(RegisteredLocationSpec {
                bucket: bucket.clone(),
                role,
                hybrid_access: true,
            }),
            removal_policy,
        )?;
        self.graph
            .governance
            .locations
            .insert(bucket.logical_id().clone(), id);
        Ok(handle)
    }

    /// Grant `permissions` on `resource` to `principal`
    ///
    /// A later grant for the same (identity, resource) pair replaces the
    /// earlier permission set and returns the earlier handle; `user/x` and its
    /// full ARN are the same identity. Table grants do not imply `DESCRIBE`
    /// on the database.
    pub fn grant(
        &mut self,
        id: impl Into<LogicalId>,
        principal: Principal,
        resource: CatalogRef,
        permissions: &[Permission],
        grantable: bool,
        removal_policy: RemovalPolicy,
    ) -> Result<GrantHandle> {
        let id = id.into();
        let (resource, bucket) = self.resolve_resource(&id, &resource)?;
        let permissions: BTreeSet<Permission> = permissions.iter().copied().collect();

        if permissions.is_empty() {
            return Err(ProvisionError::invalid(&id, format!("empty permission set on {resource}")));
        }
        if let Some(p) = permissions.iter().find(|p| !p.applies_to(resource.scope())) {
            return Err(ProvisionError::invalid(&id, format!("{p} does not apply to {resource}")));
        }
        if principal.kind() == PrincipalKind::Service {
            return Err(ProvisionError::InvalidPrincipal {
                principal: principal.to_string(),
                reason: "catalog grants need an IAM principal".to_string(),
            });
        }

        let Some(location) = self.graph.governance.locations.get(bucket.logical_id()).cloned() else {
            let bucket_name = self
                .graph
                .bucket_spec(bucket.logical_id())
                .map_or_else(|| bucket.logical_id().to_string(), |b| b.name.clone());
            return Err(ProvisionError::UngovernedLocation {
                principal: principal.to_string(),
                resource: resource.to_string(),
                bucket: bucket_name,
                permissions: permissions.iter().map(Permission::as_str).collect::<Vec<_>>().join(", "),
            });
        };
        let Some(settings) = self.graph.governance.settings.clone() else {
            return Err(ProvisionError::invalid(&id, "data-lake administrators must be set before granting"));
        };

        let identity = principal.resolve(self.graph.env())?.identifier;
        let key = (identity, resource.logical_id().clone());
        if let Some(existing) = self.graph.governance.grants.get(&key).cloned() {
            if let Some(ResourceSpec::Grant(spec)) = self.graph.node_mut(&existing).map(|n| &mut n.spec) {
                warn!(
                    grant = %existing,
                    principal = %principal,
                    resource = %resource,
                    "Replacing earlier permission set for principal and resource"
                );
                spec.permissions = permissions;
                spec.grantable = grantable;
            }
            return Ok(Handle::new(existing));
        }

        let spec = GrantSpec {
            principal,
            resource,
            permissions,
            grantable,
        };
        info!(grant = %id, resource = %spec.resource, permissions = ?spec.permission_list(), "Declared catalog grant");
        let handle: GrantHandle = self
            .graph
            .add(id.clone(), ResourceSpec::Grant(spec), removal_policy)?;
        self.graph.add_dependency(&id, &location)?;
        self.graph.add_dependency(&id, &settings)?;
        self.graph.governance.grants.insert(key, id);
        Ok(handle)
    }

    fn resolve_resource(
        &self,
        id: &LogicalId,
        resource: &CatalogRef,
    ) -> Result<(CatalogResource, BucketHandle)> {
        let missing = || ProvisionError::UnresolvedDependency {
            logical_id: id.clone(),
            resource_type: ResourceType::Permissions,
            missing: resource.logical_id().clone(),
        };
        match resource {
            CatalogRef::Database(database) => {
                let spec = self.graph.database_spec(database.logical_id()).ok_or_else(missing)?;
                Ok((
                    CatalogResource::Database {
                        database: database.clone(),
                        name: spec.name.clone(),
                    },
                    spec.bucket.clone(),
                ))
            }
            CatalogRef::Table(table) => {
                let spec = self.graph.table_spec(table.logical_id()).ok_or_else(missing)?;
                Ok((
                    CatalogResource::Table {
                        table: table.clone(),
                        name: spec.name().to_string(),
                        database_name: spec.database_name.clone(),
                    },
                    spec.bucket.clone(),
                ))
            }
        }
    }
}

/// Identity a principal stands for in `env`, for duplicate detection
fn identity(env: &Environment, principal: &Principal) -> String {
    principal
        .resolve(env)
        .map_or_else(|_| principal.to_string(), |resolved| resolved.identifier)
}

fn dedup(env: &Environment, principals: Vec<Principal>) -> Vec<Principal> {
    let mut seen = BTreeSet::new();
    principals
        .into_iter()
        .filter(|p| seen.insert(identity(env, p)))
        .collect()
}
