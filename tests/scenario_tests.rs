//! # End-to-End Scenarios
//!
//! Projection parameters, governance ordering and unresolved trail
//! dependencies, checked through the public API.

mod common;

use common::{backend, env, provisioner, stack, stack_config};
use compliance_lake::graph::Handle;
use compliance_lake::projection::layout::cloudtrail_table;
use compliance_lake::projection::{compile, DataType, PartitionKey, ProjectionRule, TableDefinition};
use compliance_lake::projection::{Column, StorageFormat};
use compliance_lake::provision::{
    BucketEncryption, BucketHandle, BucketProps, CatalogRef, DataEventScope, InsightType,
    ObjectOwnership, Permission, TrailDeclaration,
};
use compliance_lake::{
    DeploymentState, Principal, ProvisionError, RemovalPolicy, ResourceGraph, ResourceType,
};

fn region_year_table(digits: Option<u32>) -> TableDefinition {
    TableDefinition {
        name: "t".to_string(),
        description: None,
        columns: vec![Column::string("eventname")],
        partition_keys: vec![
            PartitionKey::new(
                "region",
                ProjectionRule::Enum {
                    values: vec!["us-east-1".to_string(), "us-west-2".to_string()],
                    vocabulary: None,
                },
            ),
            PartitionKey::new(
                "year",
                ProjectionRule::IntegerRange {
                    min: 2025,
                    max: 2030,
                    digits,
                },
            ),
        ],
        location_prefix: "logs/".to_string(),
        location_template: "logs/${region}/${year}".to_string(),
        format: StorageFormat::CloudTrail,
        classification: None,
    }
}

#[test]
fn test_scenario_a_projection_parameters() {
    let table = compile(&region_year_table(None)).unwrap();
    let params = table.parameters("bucket");

    assert_eq!(params["projection.enabled"], "true");
    assert_eq!(params["projection.region.type"], "enum");
    assert_eq!(params["projection.region.values"], "us-east-1,us-west-2");
    assert_eq!(params["projection.year.type"], "integer");
    assert_eq!(params["projection.year.range"], "2025,2030");
    assert!(!params.contains_key("projection.year.digits"));
    assert_eq!(params["storage.location.template"], "s3://bucket/logs/${region}/${year}");
}

#[test]
fn test_scenario_a_digits_are_emitted_only_when_wide_enough() {
    let table = compile(&region_year_table(Some(4))).unwrap();
    assert_eq!(table.parameters("bucket")["projection.year.digits"], "4");

    let err = compile(&region_year_table(Some(2))).unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidProjectionSpec { .. }));
    assert!(err.to_string().contains("needs at least 4 digits"));
}

#[test]
fn test_compilation_is_deterministic() {
    let first = compile(&region_year_table(None)).unwrap();
    let second = compile(&region_year_table(None)).unwrap();
    assert_eq!(first.parameters("b"), second.parameters("b"));
}

#[test]
fn test_template_must_follow_partition_key_order() {
    let mut def = region_year_table(None);
    def.location_template = "logs/${year}/${region}".to_string();
    assert!(matches!(
        compile(&def).unwrap_err(),
        ProvisionError::InvalidProjectionSpec { .. }
    ));

    def.location_template = "logs/${region}".to_string();
    assert!(compile(&def).is_err());
}

#[test]
fn test_nested_columns_are_preserved() {
    let mut def = region_year_table(None);
    def.columns.push(Column::new(
        "resources",
        DataType::array(DataType::structure(vec![
            Column::string("arn"),
            Column::string("type"),
        ])),
    ));
    let table = compile(&def).unwrap();
    let columns = table.columns();
    assert_eq!(columns[1]["Type"], "array<struct<arn:string,type:string>>");
}

#[test]
fn test_trail_table_projects_region_year_month_day() {
    let definition = cloudtrail_table("cloudtrail_logs", "123456789012", vec!["us-east-1".to_string()], (2025, 2030));
    let table = compile(&definition).unwrap();
    let params = table.parameters("cloudtrail-bucket-123456789012");

    assert_eq!(params["projection.region.values"], "us-east-1");
    assert_eq!(params["projection.year.range"], "2025,2030");
    assert_eq!(params["projection.month.range"], "01,12");
    assert_eq!(params["projection.month.digits"], "2");
    assert_eq!(params["projection.day.range"], "01,31");
    assert_eq!(
        params["storage.location.template"],
        "s3://cloudtrail-bucket-123456789012/AWSLogs/123456789012/CloudTrail/${region}/${year}/${month}/${day}"
    );
    assert_eq!(
        table.location("cloudtrail-bucket-123456789012"),
        "s3://cloudtrail-bucket-123456789012/AWSLogs/123456789012/CloudTrail/"
    );
    assert_eq!(table.partition_keys().len(), 4);
}

#[test]
fn test_unknown_region_is_rejected_by_the_vocabulary() {
    let definition = cloudtrail_table("cloudtrail_logs", "123456789012", vec!["mars-north-1".to_string()], (2025, 2030));
    assert!(matches!(
        compile(&definition).unwrap_err(),
        ProvisionError::InvalidProjectionSpec { .. }
    ));
}

fn governed_bucket(graph: &mut ResourceGraph) -> BucketHandle {
    let key = graph.keys().create_key("DataKey", RemovalPolicy::Destroy).unwrap();
    graph
        .buckets()
        .create_bucket(
            "DataBucket",
            BucketProps {
                name: "data-123456789012".to_string(),
                encryption: BucketEncryption::KeyBacked(key),
                ownership: ObjectOwnership::BucketOwnerEnforced,
                access_logs: None,
                removal_policy: RemovalPolicy::Destroy,
                auto_delete_objects: true,
            },
        )
        .unwrap()
}

#[test]
fn test_scenario_b_grant_without_registered_location_is_ungoverned() {
    let mut graph = ResourceGraph::new(env());
    let bucket = governed_bucket(&mut graph);
    let database = graph
        .tables()
        .create_database("Db", "sample_database", None, &bucket, RemovalPolicy::Destroy)
        .unwrap();
    let table = graph
        .tables()
        .create_table("T", &database, &bucket, &region_year_table(None), RemovalPolicy::Destroy)
        .unwrap();
    graph.permissions().set_admins(vec![Principal::user("rodrigo")], RemovalPolicy::Destroy).unwrap();

    let err = graph
        .permissions()
        .grant(
            "TablePermission",
            Principal::user("rodrigo"),
            CatalogRef::Table(table.clone()),
            &[Permission::Describe, Permission::Select],
            false,
            RemovalPolicy::Destroy,
        )
        .unwrap_err();

    match err {
        ProvisionError::UngovernedLocation { bucket, permissions, .. } => {
            assert_eq!(bucket, "data-123456789012");
            assert_eq!(permissions, "DESCRIBE, SELECT");
        }
        other => panic!("expected UngovernedLocation, got {other:?}"),
    }
    assert_eq!(graph.governance().grant_count(), 0);
    assert_eq!(graph.count(ResourceType::Permissions), 0);

    graph
        .permissions()
        .register_location("Location", &bucket, Principal::lake_formation_service_role(), RemovalPolicy::Destroy)
        .unwrap();
    graph
        .permissions()
        .grant(
            "TablePermission",
            Principal::user("rodrigo"),
            CatalogRef::Table(table),
            &[Permission::Describe, Permission::Select],
            false,
            RemovalPolicy::Destroy,
        )
        .unwrap();
    assert_eq!(graph.governance().grant_count(), 1);
}

#[test]
fn test_scenario_c_detached_bucket_fails_before_any_call() {
    let mut graph = ResourceGraph::new(env());
    let key = graph.keys().create_key("TrailKey", RemovalPolicy::Destroy).unwrap();
    let mut decl = TrailDeclaration::new("FullTrail");
    decl.bind(Handle::detached("MissingBucket"), key)
        .unwrap()
        .enable_data_events(&[DataEventScope::S3Object])
        .unwrap()
        .enable_insights(&[InsightType::ApiCallRateInsight])
        .unwrap()
        .apply_removal_policy(RemovalPolicy::Destroy, 3653)
        .unwrap();
    graph.trails().provision(&mut decl).unwrap();

    let err = graph.plan().unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::UnresolvedDependency { ref missing, .. } if missing.as_str() == "MissingBucket"
    ));
}

#[tokio::test]
async fn test_scenario_c_unresolved_bucket_creates_no_trail() {
    let cp = backend();
    cp.leave_unresolved(ResourceType::Bucket);
    let stack = stack(&stack_config());
    let mut state = DeploymentState::new();

    let err = provisioner(&cp).apply(&stack.graph, &mut state).await.unwrap_err();

    assert!(matches!(err, ProvisionError::UnresolvedDependency { .. }));
    assert_eq!(cp.count(ResourceType::Trail), 0);
    assert!(cp.calls().iter().all(|(id, _)| id.as_str() != "FullTrail"));
}
