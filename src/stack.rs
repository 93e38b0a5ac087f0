//! # Data-Lake Stack
//!
//! The canonical resource graph of the compliance data lake:
//!
//! 1. Five rotation-enabled keys (data lake, query results, trail bucket,
//!    trail, catalog)
//! 2. An access-log bucket and three key-backed buckets logging into it,
//!    all readable and writable by the Lake Formation service role
//! 3. A multi-region trail with object and function data events, insights and
//!    CloudWatch Logs delivery
//! 4. Catalog encryption, data-lake administrators and registered locations
//!    for the data-lake and trail buckets
//! 5. A read-only query workgroup
//! 6. With `enableLakeFormationPermissions`: a database, the partition-projected
//!    trail table and `DESCRIBE`/`SELECT` grants for the admin user
//!
//! Every node carries the configured removal policy.
//!
//! Variants of the stack are expressed through [`FeatureFlags`](crate::config::FeatureFlags),
//! never through a second builder.

use crate::config::StackConfig;
use crate::error::Result;
use crate::graph::ResourceGraph;
use crate::model::{Environment, Principal};
use crate::projection::layout::cloudtrail_table;
use crate::provision::trail::TrailDeclaration;
use crate::provision::{
    BucketEncryption, BucketHandle, BucketProps, CatalogRef, DataEventScope, DatabaseHandle,
    InsightType, KeyCapability, KeyHandle, ObjectOwnership, Permission, TableHandle, TrailHandle,
    WorkGroupHandle, WorkGroupProps,
};
use tracing::info;

/// The keys of the stack
#[derive(Debug, Clone)]
pub struct StackKeys {
    pub data_lake: KeyHandle,
    pub athena_results: KeyHandle,
    pub cloudtrail_bucket: KeyHandle,
    pub cloudtrail: KeyHandle,
    pub catalog: KeyHandle,
}

#[derive(Debug, Clone)]
pub struct StackBuckets {
    pub logging: BucketHandle,
    pub data_lake: BucketHandle,
    pub athena_results: BucketHandle,
    pub cloudtrail: BucketHandle,
}

/// Catalog objects declared when Lake Formation permissions are enabled
#[derive(Debug, Clone)]
pub struct StackCatalog {
    pub database: DatabaseHandle,
    pub table: TableHandle,
}

/// A built stack: the graph plus handles to its main resources
#[derive(Debug)]
pub struct DataLakeStack {
    pub graph: ResourceGraph,
    pub keys: StackKeys,
    pub buckets: StackBuckets,
    pub trail: TrailHandle,
    pub workgroup: WorkGroupHandle,
    pub catalog: Option<StackCatalog>,
}

/// Declare the whole stack for `env`
pub fn build_stack(config: &StackConfig, env: Environment) -> Result<DataLakeStack> {
    let account = env.account.clone();
    let removal = config.removal_policy;
    let auto_delete = config.auto_delete_objects;
    let lf_role = Principal::lake_formation_service_role();
    let analyst = Principal::user(config.admin_user.clone());

    let mut admins = vec![analyst.clone()];
    if env.execution_role_arn.is_some() {
        admins.push(Principal::ExecutionRole);
    }

    let mut graph = ResourceGraph::new(env);

    let keys = StackKeys {
        data_lake: graph.keys().create_key("DataLakeBucketKmsKey", removal)?,
        athena_results: graph.keys().create_key("AthenaResultsBucketKmsKey", removal)?,
        cloudtrail_bucket: graph.keys().create_key("CloudtrailBucketKmsKey", removal)?,
        cloudtrail: graph.keys().create_key("CloudtrailKmsKey", removal)?,
        catalog: graph.keys().create_key("CatalogKmsKey", removal)?,
    };

    let logging = graph.buckets().create_logging_bucket(
        "LoggingBucket",
        format!("logging-{account}"),
        removal,
        auto_delete,
    )?;
    let key_backed = |graph: &mut ResourceGraph, id: &str, name: String, key: &KeyHandle| {
        graph.buckets().create_bucket(
            id,
            BucketProps {
                name,
                encryption: BucketEncryption::KeyBacked(key.clone()),
                ownership: ObjectOwnership::BucketOwnerEnforced,
                access_logs: Some(logging.clone()),
                removal_policy: removal,
                auto_delete_objects: auto_delete,
            },
        )
    };
    let data_lake = key_backed(
        &mut graph,
        "DataLakeBucket",
        format!("data-lake-bucket-{account}"),
        &keys.data_lake,
    )?;
    let athena_results = key_backed(
        &mut graph,
        "AthenaResultsBucket",
        format!("athena-results-bucket-{account}"),
        &keys.athena_results,
    )?;
    let cloudtrail_bucket = key_backed(
        &mut graph,
        "CloudtrailBucket",
        format!("cloudtrail-bucket-{account}"),
        &keys.cloudtrail_bucket,
    )?;

    for bucket in [&athena_results, &data_lake, &cloudtrail_bucket] {
        graph.buckets().grant_read_write(bucket, lf_role.clone())?;
    }

    let mut trail = TrailDeclaration::new("FullTrail");
    trail
        .bind(cloudtrail_bucket.clone(), keys.cloudtrail.clone())?
        .enable_data_events(&[DataEventScope::S3Object, DataEventScope::LambdaFunction])?
        .enable_insights(&[InsightType::ApiCallRateInsight, InsightType::ApiErrorRateInsight])?
        .apply_removal_policy(removal, config.trail.log_retention_days)?;
    let trail = graph.trails().provision(&mut trail)?;
    graph
        .keys()
        .grant(&keys.cloudtrail, lf_role.clone(), KeyCapability::Decrypt)?;

    graph
        .catalog()
        .encrypt_catalog("CatalogEncryptionSettings", &keys.catalog, &admins, removal)?;
    graph.permissions().set_admins(admins, removal)?;
    graph.permissions().register_location(
        "DataLakeRegisteredLocation",
        &data_lake,
        lf_role.clone(),
        removal,
    )?;
    graph.permissions().register_location(
        "CloudtrailRegisteredLocation",
        &cloudtrail_bucket,
        lf_role,
        removal,
    )?;

    let workgroup = graph.workgroups().create_workgroup(
        "ReadOnlyWorkGroup",
        WorkGroupProps {
            name: config.workgroup.name.clone(),
            results_bucket: athena_results.clone(),
            results_prefix: config.workgroup.results_prefix.clone(),
            metrics_enabled: config.workgroup.metrics_enabled,
            recursive_delete: config.workgroup.recursive_delete,
            removal_policy: removal,
        },
    )?;

    let catalog = if config.features.enable_lake_formation_permissions {
        let database = graph.tables().create_database(
            "SampleDatabase",
            config.catalog.database_name.clone(),
            Some(config.catalog.database_description.clone()),
            &data_lake,
            removal,
        )?;
        let definition = cloudtrail_table(
            config.catalog.table_name.clone(),
            &account,
            config.projection.regions(),
            (config.projection.start_year, config.projection.end_year),
        );
        let table = graph.tables().create_table(
            "CloudtrailTable",
            &database,
            &cloudtrail_bucket,
            &definition,
            removal,
        )?;

        let grantable = config.features.enable_cross_account_grant;
        graph.permissions().grant(
            "DatabasePermission",
            analyst.clone(),
            CatalogRef::Database(database.clone()),
            &[Permission::Describe],
            grantable,
            removal,
        )?;
        graph.permissions().grant(
            "TablePermission",
            analyst,
            CatalogRef::Table(table.clone()),
            &[Permission::Describe, Permission::Select],
            grantable,
            removal,
        )?;
        Some(StackCatalog { database, table })
    } else {
        None
    };

    info!(
        resources = graph.len(),
        lake_formation_permissions = config.features.enable_lake_formation_permissions,
        "Built data-lake stack"
    );

    Ok(DataLakeStack {
        graph,
        keys,
        buckets: StackBuckets {
            logging,
            data_lake,
            athena_results,
            cloudtrail: cloudtrail_bucket,
        },
        trail,
        workgroup,
        catalog,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RemovalPolicy, ResourceType};

    fn env() -> Environment {
        Environment::new("123456789012", "aws", "us-east-1")
            .unwrap()
            .with_execution_role("arn:aws:iam::123456789012:role/cdk-hnb659fds-cfn-exec-role")
    }

    #[test]
    fn full_stack_declares_every_resource() {
        let stack = build_stack(&StackConfig::new("us-east-1", "rodrigo"), env()).unwrap();
        let g = &stack.graph;
        assert_eq!(g.count(ResourceType::KmsKey), 5);
        assert_eq!(g.count(ResourceType::Bucket), 4);
        assert_eq!(g.count(ResourceType::BucketPolicy), 4);
        assert_eq!(g.count(ResourceType::Trail), 1);
        assert_eq!(g.count(ResourceType::RegisteredLocation), 2);
        assert_eq!(g.count(ResourceType::Database), 1);
        assert_eq!(g.count(ResourceType::Table), 1);
        assert_eq!(g.count(ResourceType::Permissions), 2);
        assert_eq!(g.count(ResourceType::WorkGroup), 1);
        assert!(stack.catalog.is_some());
        assert!(g.plan().is_ok());
    }

    #[test]
    fn catalog_objects_follow_the_feature_flag() {
        let mut config = StackConfig::new("us-east-1", "rodrigo");
        config.features.enable_lake_formation_permissions = false;
        let stack = build_stack(&config, env()).unwrap();
        assert!(stack.catalog.is_none());
        assert_eq!(stack.graph.count(ResourceType::Table), 0);
        assert_eq!(stack.graph.count(ResourceType::Permissions), 0);
        assert_eq!(stack.graph.count(ResourceType::RegisteredLocation), 2);
    }

    #[test]
    fn removal_policy_reaches_every_node() {
        let mut config = StackConfig::new("us-east-1", "rodrigo");
        config.removal_policy = RemovalPolicy::Retain;
        config.auto_delete_objects = false;
        let stack = build_stack(&config, env()).unwrap();
        let destroyed: Vec<&str> = stack
            .graph
            .nodes()
            .filter(|n| n.removal_policy != RemovalPolicy::Retain)
            .map(|n| n.logical_id.as_str())
            .collect();
        assert!(destroyed.is_empty(), "not retained: {destroyed:?}");
    }

    #[test]
    fn execution_role_is_only_an_admin_when_known() {
        let plain = Environment::new("123456789012", "aws", "us-east-1").unwrap();
        let stack = build_stack(&StackConfig::new("us-east-1", "rodrigo"), plain).unwrap();
        let key = stack.graph.clone().keys().spec(&stack.keys.catalog).unwrap().clone();
        assert_eq!(key.principals_with(KeyCapability::EncryptDecrypt).len(), 1);
    }
}
