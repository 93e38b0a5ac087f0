//! # Catalog Database and Table
//!
//! Glue database and projected table declarations. Tables are compiled with
//! the partition projection compiler when they are declared, so an invalid
//! projection never reaches the graph.

use super::bucket::BucketHandle;
use crate::error::{ProvisionError, Result};
use crate::graph::{Handle, RenderContext, ResourceDefinition, ResourceGraph, ResourceSpec};
use crate::model::{LogicalId, RemovalPolicy, ResourceType};
use crate::projection::{self, CompiledTable, TableDefinition};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;
use tracing::debug;

pub type DatabaseHandle = Handle<DatabaseSpec>;
pub type TableHandle = Handle<TableSpec>;

static CATALOG_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]{1,255}$").expect("catalog name regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSpec {
    pub name: String,
    pub description: Option<String>,
    /// Bucket holding the database location `s3://<bucket>/<name>/`
    pub bucket: BucketHandle,
}

impl ResourceDefinition for DatabaseSpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::Database;

    fn references(&self) -> Vec<LogicalId> {
        vec![self.bucket.logical_id().clone()]
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        let bucket = ctx.physical_id(self.bucket.logical_id())?;
        let mut input = json!({
            "Name": self.name,
            "LocationUri": format!("s3://{bucket}/{}/", self.name),
        });
        if let Some(description) = &self.description {
            input["Description"] = json!(description);
        }
        Ok(json!({
            "CatalogId": ctx.env().account,
            "DatabaseInput": input,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub database: DatabaseHandle,
    pub database_name: String,
    /// Bucket holding the table data
    pub bucket: BucketHandle,
    pub compiled: CompiledTable,
}

impl TableSpec {
    #[must_use]
    pub fn name(&self) -> &str {
        self.compiled.name()
    }
}

impl ResourceDefinition for TableSpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::Table;

    fn references(&self) -> Vec<LogicalId> {
        vec![
            self.database.logical_id().clone(),
            self.bucket.logical_id().clone(),
        ]
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        ctx.physical_id(self.database.logical_id())?;
        let bucket = ctx.physical_id(self.bucket.logical_id())?;
        let definition = self.compiled.definition();
        let format = definition.format;

        let mut input = json!({
            "Name": definition.name,
            "TableType": "EXTERNAL_TABLE",
            "Parameters": self.compiled.parameters(bucket),
            "PartitionKeys": self.compiled.partition_keys(),
            "StorageDescriptor": {
                "Columns": self.compiled.columns(),
                "Location": self.compiled.location(bucket),
                "InputFormat": format.input_format(),
                "OutputFormat": format.output_format(),
                "SerdeInfo": { "SerializationLibrary": format.serialization_library() },
                "Compressed": false,
            },
        });
        if let Some(description) = &definition.description {
            input["Description"] = json!(description);
        }

        Ok(json!({
            "CatalogId": ctx.env().account,
            "DatabaseName": self.database_name,
            "TableInput": input,
        }))
    }
}

/// Declares catalog databases and tables
#[derive(Debug)]
pub struct TableProvisioner<'g> {
    graph: &'g mut ResourceGraph,
}

impl ResourceGraph {
    pub fn tables(&mut self) -> TableProvisioner<'_> {
        TableProvisioner { graph: self }
    }

    pub(crate) fn database_spec(&self, id: &LogicalId) -> Option<&DatabaseSpec> {
        match self.node(id).map(|n| &n.spec) {
            Some(ResourceSpec::Database(spec)) => Some(spec),
            _ => None,
        }
    }

    pub(crate) fn table_spec(&self, id: &LogicalId) -> Option<&TableSpec> {
        match self.node(id).map(|n| &n.spec) {
            Some(ResourceSpec::Table(spec)) => Some(spec),
            _ => None,
        }
    }
}

impl TableProvisioner<'_> {
    pub fn create_database(
        &mut self,
        id: impl Into<LogicalId>,
        name: impl Into<String>,
        description: Option<String>,
        bucket: &BucketHandle,
        removal_policy: RemovalPolicy,
    ) -> Result<DatabaseHandle> {
        let id = id.into();
        let name = name.into();
        check_name(&id, "database", &name)?;
        self.graph.add(
            id,
            ResourceSpec::Database(DatabaseSpec {
                name,
                description,
                bucket: bucket.clone(),
            }),
            removal_policy,
        )
    }

    /// Compile `definition` and declare the table in `database`
    pub fn create_table(
        &mut self,
        id: impl Into<LogicalId>,
        database: &DatabaseHandle,
        bucket: &BucketHandle,
        definition: &TableDefinition,
        removal_policy: RemovalPolicy,
    ) -> Result<TableHandle> {
        let id = id.into();
        check_name(&id, "table", &definition.name)?;
        let database_name = self
            .graph
            .database_spec(database.logical_id())
            .map(|db| db.name.clone())
            .ok_or_else(|| ProvisionError::UnresolvedDependency {
                logical_id: id.clone(),
                resource_type: ResourceType::Table,
                missing: database.logical_id().clone(),
            })?;

        let compiled = projection::compile(definition)?;
        debug!(table = %id, database = %database_name, "Declared projected table");
        self.graph.add(
            id,
            ResourceSpec::Table(TableSpec {
                database: database.clone(),
                database_name,
                bucket: bucket.clone(),
                compiled,
            }),
            removal_policy,
        )
    }
}

fn check_name(id: &LogicalId, what: &str, name: &str) -> Result<()> {
    if CATALOG_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ProvisionError::invalid(
            id,
            format!("{what} name '{name}' must be lowercase letters, digits or underscores"),
        ))
    }
}
