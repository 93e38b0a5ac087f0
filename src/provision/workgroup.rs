//! # Workgroup Provisioner
//!
//! Query workgroup writing its results under a prefix of the results bucket.

use super::bucket::BucketHandle;
use crate::error::{ProvisionError, Result};
use crate::graph::{Handle, RenderContext, ResourceDefinition, ResourceGraph, ResourceSpec};
use crate::model::{LogicalId, RemovalPolicy, ResourceType};
use serde_json::{json, Value};

pub type WorkGroupHandle = Handle<WorkGroupSpec>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkGroupSpec {
    pub name: String,
    pub results_bucket: BucketHandle,
    pub results_prefix: String,
    pub metrics_enabled: bool,
    pub recursive_delete: bool,
}

impl ResourceDefinition for WorkGroupSpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::WorkGroup;

    fn references(&self) -> Vec<LogicalId> {
        vec![self.results_bucket.logical_id().clone()]
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        let bucket = ctx.physical_id(self.results_bucket.logical_id())?;
        Ok(json!({
            "Name": self.name,
            "WorkGroupConfiguration": {
                "PublishCloudWatchMetricsEnabled": self.metrics_enabled,
                "ResultConfiguration": {
                    "OutputLocation": format!("s3://{bucket}/{}", self.results_prefix),
                },
            },
            "RecursiveDeleteOption": self.recursive_delete,
        }))
    }
}

#[derive(Debug)]
pub struct WorkgroupProvisioner<'g> {
    graph: &'g mut ResourceGraph,
}

impl ResourceGraph {
    pub fn workgroups(&mut self) -> WorkgroupProvisioner<'_> {
        WorkgroupProvisioner { graph: self }
    }
}

/// Inputs of a workgroup declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkGroupProps {
    pub name: String,
    pub results_bucket: BucketHandle,
    /// Key prefix under the results bucket, without a leading slash
    pub results_prefix: String,
    pub metrics_enabled: bool,
    pub recursive_delete: bool,
    pub removal_policy: RemovalPolicy,
}

impl WorkgroupProvisioner<'_> {
    pub fn create_workgroup(&mut self, id: impl Into<LogicalId>, props: WorkGroupProps) -> Result<WorkGroupHandle> {
        let id = id.into();
        let name = props.name;
        if name.is_empty() || name.len() > 128 || !name.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
            return Err(ProvisionError::invalid(&id, format!("'{name}' is not a valid workgroup name")));
        }
        if props.results_prefix.starts_with('/') {
            return Err(ProvisionError::invalid(&id, "results prefix is relative to the bucket root"));
        }
        self.graph.add(
            id,
            ResourceSpec::WorkGroup(WorkGroupSpec {
                name,
                results_bucket: props.results_bucket,
                results_prefix: props.results_prefix,
                metrics_enabled: props.metrics_enabled,
                recursive_delete: props.recursive_delete,
            }),
            props.removal_policy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Outputs, ResolvedResource};
    use crate::model::Environment;

    fn props(name: &str, bucket: &BucketHandle, prefix: &str) -> WorkGroupProps {
        WorkGroupProps {
            name: name.to_string(),
            results_bucket: bucket.clone(),
            results_prefix: prefix.to_string(),
            metrics_enabled: true,
            recursive_delete: true,
            removal_policy: RemovalPolicy::Destroy,
        }
    }

    #[test]
    fn results_land_under_the_prefix() {
        let mut g = ResourceGraph::new(Environment::new("123456789012", "aws", "us-east-1").unwrap());
        let bucket = Handle::detached("AthenaResultsBucket");
        let wg = g
            .workgroups()
            .create_workgroup("ReadOnlyWorkGroup", props("ReadOnly", &bucket, "ReadOnlyWorkGroup"))
            .unwrap();
        let mut outputs = Outputs::new();
        outputs.insert(
            bucket.logical_id().clone(),
            ResolvedResource {
                physical_id: "athena-results-bucket-123456789012".to_string(),
                arn: None,
            },
        );
        let props = g.node(wg.logical_id()).unwrap().render(g.env(), &outputs).unwrap();
        assert_eq!(
            props["WorkGroupConfiguration"]["ResultConfiguration"]["OutputLocation"],
            json!("s3://athena-results-bucket-123456789012/ReadOnlyWorkGroup")
        );
        assert_eq!(props["RecursiveDeleteOption"], json!(true));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut g = ResourceGraph::new(Environment::new("123456789012", "aws", "us-east-1").unwrap());
        let bucket = Handle::detached("AthenaResultsBucket");
        assert!(g
            .workgroups()
            .create_workgroup("Wg", props("read only", &bucket, "out"))
            .is_err());
    }

    #[test]
    fn removal_policy_is_carried_onto_the_node() {
        let mut g = ResourceGraph::new(Environment::new("123456789012", "aws", "us-east-1").unwrap());
        let bucket = Handle::detached("AthenaResultsBucket");
        let wg = g
            .workgroups()
            .create_workgroup(
                "ReadOnlyWorkGroup",
                WorkGroupProps {
                    removal_policy: RemovalPolicy::Retain,
                    ..props("ReadOnly", &bucket, "out")
                },
            )
            .unwrap();
        assert_eq!(g.node(wg.logical_id()).unwrap().removal_policy, RemovalPolicy::Retain);
    }
}
