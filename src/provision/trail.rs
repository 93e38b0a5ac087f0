//! # Trail Provisioner
//!
//! The account audit trail, declared through an explicit sequence of steps:
//!
//! ```text
//! declared -> bound(bucket, key) -> data-events-enabled -> insights-enabled
//!          -> removal-policy-applied -> provisioned
//! ```
//!
//! Each step is idempotent: repeating a completed step with the same arguments
//! is a no-op, while skipping ahead or changing an earlier decision is an
//! `InvalidConfiguration` error. Provisioning adds the trail together with its
//! CloudWatch Logs group and delivery role, grants the trail service encrypt
//! on the key and allows it to deliver into the bucket.

use super::bucket::BucketHandle;
use super::key::{KeyCapability, KeyHandle};
use crate::constants::TRAIL_SERVICE;
use crate::error::{ProvisionError, Result};
use crate::graph::{Handle, Node, RenderContext, ResourceDefinition, ResourceGraph, ResourceSpec};
use crate::model::{LogicalId, Principal, RemovalPolicy, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

pub type TrailHandle = Handle<TrailSpec>;
pub type LogGroupHandle = Handle<LogGroupSpec>;
pub type DeliveryRoleHandle = Handle<DeliveryRoleSpec>;

/// Retention periods CloudWatch Logs accepts, in days
pub const VALID_RETENTION_DAYS: &[u32] = &[
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922,
    3288, 3653,
];

/// Ten years
pub const TEN_YEARS_DAYS: u32 = 3653;

/// Data-event scope; each becomes its own event selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataEventScope {
    /// All object-level operations on all buckets
    S3Object,
    /// All function invocations
    LambdaFunction,
}

impl DataEventScope {
    #[must_use]
    pub fn resource_type(&self) -> &'static str {
        match self {
            DataEventScope::S3Object => "AWS::S3::Object",
            DataEventScope::LambdaFunction => "AWS::Lambda::Function",
        }
    }

    /// Selector value matching every resource of the scope
    #[must_use]
    pub fn all_resources(&self, partition: &str) -> String {
        match self {
            DataEventScope::S3Object => format!("arn:{partition}:s3:::"),
            DataEventScope::LambdaFunction => format!("arn:{partition}:lambda"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InsightType {
    ApiCallRateInsight,
    ApiErrorRateInsight,
}

impl InsightType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::ApiCallRateInsight => "ApiCallRateInsight",
            InsightType::ApiErrorRateInsight => "ApiErrorRateInsight",
        }
    }
}

/// Log group receiving trail events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogGroupSpec {
    pub retention_days: u32,
}

impl ResourceDefinition for LogGroupSpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::LogGroup;

    fn references(&self) -> Vec<LogicalId> {
        Vec::new()
    }

    fn render(&self, _ctx: &RenderContext<'_>) -> Result<Value> {
        Ok(json!({ "RetentionInDays": self.retention_days }))
    }
}

/// Role the trail service assumes to write into the log group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRoleSpec {
    pub log_group: LogGroupHandle,
}

impl ResourceDefinition for DeliveryRoleSpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::Role;

    fn references(&self) -> Vec<LogicalId> {
        vec![self.log_group.logical_id().clone()]
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        let log_group_arn = ctx.arn(self.log_group.logical_id())?;
        Ok(json!({
            "AssumeRolePolicyDocument": {
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "Service": TRAIL_SERVICE },
                    "Action": "sts:AssumeRole",
                }],
            },
            "Policies": [{
                "PolicyName": "TrailLogDelivery",
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Action": ["logs:CreateLogStream", "logs:PutLogEvents"],
                        "Resource": log_group_arn,
                    }],
                },
            }],
        }))
    }
}

/// Provisioned trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrailSpec {
    pub bucket: BucketHandle,
    pub key: KeyHandle,
    pub data_events: BTreeSet<DataEventScope>,
    pub insights: BTreeSet<InsightType>,
    pub log_group: LogGroupHandle,
    pub delivery_role: DeliveryRoleHandle,
}

impl ResourceDefinition for TrailSpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::Trail;

    fn references(&self) -> Vec<LogicalId> {
        vec![
            self.bucket.logical_id().clone(),
            self.key.logical_id().clone(),
            self.log_group.logical_id().clone(),
            self.delivery_role.logical_id().clone(),
        ]
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        let partition = &ctx.env().partition;
        let selectors: Vec<Value> = self
            .data_events
            .iter()
            .map(|scope| {
                json!({
                    "ReadWriteType": "All",
                    "IncludeManagementEvents": true,
                    "DataResources": [{
                        "Type": scope.resource_type(),
                        "Values": [scope.all_resources(partition)],
                    }],
                })
            })
            .collect();
        let insights: Vec<Value> = self
            .insights
            .iter()
            .map(|i| json!({ "InsightType": i.as_str() }))
            .collect();

        Ok(json!({
            "IsLogging": true,
            "S3BucketName": ctx.physical_id(self.bucket.logical_id())?,
            "KMSKeyId": ctx.arn(self.key.logical_id())?,
            "IsMultiRegionTrail": true,
            "IncludeGlobalServiceEvents": true,
            "EnableLogFileValidation": true,
            "EventSelectors": selectors,
            "InsightSelectors": insights,
            "CloudWatchLogsLogGroupArn": ctx.arn(self.log_group.logical_id())?,
            "CloudWatchLogsRoleArn": ctx.arn(self.delivery_role.logical_id())?,
        }))
    }
}

/// Steps of a trail declaration, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrailStage {
    Declared,
    Bound,
    DataEventsEnabled,
    InsightsEnabled,
    RemovalPolicyApplied,
    Provisioned,
}

impl fmt::Display for TrailStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrailStage::Declared => "declared",
            TrailStage::Bound => "bound",
            TrailStage::DataEventsEnabled => "data-events-enabled",
            TrailStage::InsightsEnabled => "insights-enabled",
            TrailStage::RemovalPolicyApplied => "removal-policy-applied",
            TrailStage::Provisioned => "provisioned",
        };
        f.write_str(s)
    }
}

/// A trail being declared step by step
#[derive(Debug, Clone)]
pub struct TrailDeclaration {
    id: LogicalId,
    stage: TrailStage,
    binding: Option<(BucketHandle, KeyHandle)>,
    data_events: BTreeSet<DataEventScope>,
    insights: BTreeSet<InsightType>,
    removal: Option<(RemovalPolicy, u32)>,
    handle: Option<TrailHandle>,
}

impl TrailDeclaration {
    #[must_use]
    pub fn new(id: impl Into<LogicalId>) -> Self {
        Self {
            id: id.into(),
            stage: TrailStage::Declared,
            binding: None,
            data_events: BTreeSet::new(),
            insights: BTreeSet::new(),
            removal: None,
            handle: None,
        }
    }

    #[must_use]
    pub fn stage(&self) -> TrailStage {
        self.stage
    }

    #[must_use]
    pub fn logical_id(&self) -> &LogicalId {
        &self.id
    }

    pub fn bind(&mut self, bucket: BucketHandle, key: KeyHandle) -> Result<&mut Self> {
        let binding = (bucket, key);
        if self.repeat(TrailStage::Bound, self.binding.as_ref() == Some(&binding))? {
            return Ok(self);
        }
        self.binding = Some(binding);
        self.stage = TrailStage::Bound;
        Ok(self)
    }

    pub fn enable_data_events(&mut self, scopes: &[DataEventScope]) -> Result<&mut Self> {
        let scopes: BTreeSet<DataEventScope> = scopes.iter().copied().collect();
        if self.repeat(TrailStage::DataEventsEnabled, self.data_events == scopes)? {
            return Ok(self);
        }
        if scopes.is_empty() {
            return Err(ProvisionError::invalid(&self.id, "at least one data-event scope is required"));
        }
        self.data_events = scopes;
        self.stage = TrailStage::DataEventsEnabled;
        Ok(self)
    }

    pub fn enable_insights(&mut self, insights: &[InsightType]) -> Result<&mut Self> {
        let insights: BTreeSet<InsightType> = insights.iter().copied().collect();
        if self.repeat(TrailStage::InsightsEnabled, self.insights == insights)? {
            return Ok(self);
        }
        self.insights = insights;
        self.stage = TrailStage::InsightsEnabled;
        Ok(self)
    }

    /// Removal policy of the trail and its log group, plus log retention
    pub fn apply_removal_policy(
        &mut self,
        removal_policy: RemovalPolicy,
        log_retention_days: u32,
    ) -> Result<&mut Self> {
        let removal = (removal_policy, log_retention_days);
        if self.repeat(TrailStage::RemovalPolicyApplied, self.removal == Some(removal))? {
            return Ok(self);
        }
        if !VALID_RETENTION_DAYS.contains(&log_retention_days) {
            return Err(ProvisionError::invalid(
                &self.id,
                format!("{log_retention_days} days is not a supported log retention"),
            ));
        }
        self.removal = Some(removal);
        self.stage = TrailStage::RemovalPolicyApplied;
        Ok(self)
    }

    /// Returns `true` when `target` was already reached with identical
    /// arguments, errors when the step is out of order
    fn repeat(&self, target: TrailStage, same: bool) -> Result<bool> {
        if self.stage >= target {
            if same {
                return Ok(true);
            }
            return Err(ProvisionError::invalid(
                &self.id,
                format!("trail is already {}; step '{target}' cannot change it", self.stage),
            ));
        }
        let expected = match target {
            TrailStage::Bound => TrailStage::Declared,
            TrailStage::DataEventsEnabled => TrailStage::Bound,
            TrailStage::InsightsEnabled => TrailStage::DataEventsEnabled,
            TrailStage::RemovalPolicyApplied => TrailStage::InsightsEnabled,
            TrailStage::Declared | TrailStage::Provisioned => TrailStage::RemovalPolicyApplied,
        };
        if self.stage != expected {
            return Err(ProvisionError::invalid(
                &self.id,
                format!("step '{target}' requires a {expected} trail, found {}", self.stage),
            ));
        }
        Ok(false)
    }
}

/// Turns completed declarations into graph nodes
#[derive(Debug)]
pub struct TrailProvisioner<'g> {
    graph: &'g mut ResourceGraph,
}

impl ResourceGraph {
    pub fn trails(&mut self) -> TrailProvisioner<'_> {
        TrailProvisioner { graph: self }
    }
}

impl TrailProvisioner<'_> {
    /// Add the trail and its companions to the graph
    ///
    /// Provisioning an already provisioned declaration returns its handle.
    pub fn provision(&mut self, decl: &mut TrailDeclaration) -> Result<TrailHandle> {
        if let Some(handle) = &decl.handle {
            return Ok(handle.clone());
        }
        let (Some((bucket, key)), Some((removal_policy, retention_days))) =
            (decl.binding.clone(), decl.removal)
        else {
            return Err(ProvisionError::invalid(
                &decl.id,
                format!("trail must be removal-policy-applied to provision, found {}", decl.stage),
            ));
        };
        if decl.stage != TrailStage::RemovalPolicyApplied {
            return Err(ProvisionError::invalid(
                &decl.id,
                format!("trail must be removal-policy-applied to provision, found {}", decl.stage),
            ));
        }
        self.check_binding(&decl.id, &bucket, &key)?;
        let log_group_id = decl.id.child("LogGroup");
        let role_id = decl.id.child("LogsRole");
        self.graph.check_new_ids(&[&log_group_id, &role_id, &decl.id])?;

        let log_group: LogGroupHandle = self.graph.add(
            log_group_id,
            ResourceSpec::LogGroup(LogGroupSpec { retention_days }),
            removal_policy,
        )?;
        let delivery_role: DeliveryRoleHandle = self.graph.add(
            role_id,
            ResourceSpec::DeliveryRole(DeliveryRoleSpec {
                log_group: log_group.clone(),
            }),
            removal_policy,
        )?;

        if self.graph.contains(key.logical_id()) {
            self.graph
                .keys()
                .grant(&key, Principal::service(TRAIL_SERVICE), KeyCapability::Encrypt)?;
        }
        // A bucket without the delivery policy fails trail creation
        if self.graph.contains(bucket.logical_id()) {
            self.graph.buckets().allow_trail_delivery(&bucket)?;
        }

        let spec = TrailSpec {
            bucket: bucket.clone(),
            key,
            data_events: decl.data_events.clone(),
            insights: decl.insights.clone(),
            log_group,
            delivery_role,
        };
        let trail: TrailHandle = self
            .graph
            .add(decl.id.clone(), ResourceSpec::Trail(spec), removal_policy)?;
        let policy = bucket.logical_id().child("Policy");
        if self.graph.contains(&policy) {
            self.graph.add_dependency(trail.logical_id(), &policy)?;
        }

        info!(trail = %trail.logical_id(), bucket = %bucket.logical_id(), "Provisioned trail declaration");
        decl.stage = TrailStage::Provisioned;
        decl.handle = Some(trail.clone());
        Ok(trail)
    }

    fn check_binding(&self, id: &LogicalId, bucket: &BucketHandle, key: &KeyHandle) -> Result<()> {
        if let Some(node) = self.graph.node(bucket.logical_id()) {
            if node.resource_type() != ResourceType::Bucket {
                return Err(ProvisionError::invalid(id, format!("'{}' is not a bucket", bucket.logical_id())));
            }
            let policy = bucket.logical_id().child("Policy");
            if self.graph.node(&policy).map(Node::resource_type) != Some(ResourceType::BucketPolicy) {
                return Err(ProvisionError::invalid(
                    id,
                    format!("bucket '{}' has no companion policy", bucket.logical_id()),
                ));
            }
        }
        match self.graph.node(key.logical_id()) {
            Some(node) if node.resource_type() != ResourceType::KmsKey => Err(ProvisionError::invalid(
                id,
                format!("'{}' is not a key", key.logical_id()),
            )),
            Some(_) => Ok(()),
            None => {
                debug!(trail = %id, key = %key.logical_id(), "Trail bound to an undeclared key");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Outputs, ResolvedResource};
    use crate::model::Environment;
    use crate::provision::bucket::{BucketEncryption, BucketProps, ObjectOwnership};

    fn graph() -> ResourceGraph {
        ResourceGraph::new(Environment::new("123456789012", "aws", "us-east-1").unwrap())
    }

    fn bucket_and_key(g: &mut ResourceGraph) -> (BucketHandle, KeyHandle) {
        let key = g.keys().create_key("CloudtrailKmsKey", RemovalPolicy::Destroy).unwrap();
        let bucket_key = g.keys().create_key("CloudtrailBucketKmsKey", RemovalPolicy::Destroy).unwrap();
        let bucket = g
            .buckets()
            .create_bucket(
                "CloudtrailBucket",
                BucketProps {
                    name: "cloudtrail-bucket-123456789012".to_string(),
                    encryption: BucketEncryption::KeyBacked(bucket_key),
                    ownership: ObjectOwnership::BucketOwnerEnforced,
                    access_logs: None,
                    removal_policy: RemovalPolicy::Destroy,
                    auto_delete_objects: true,
                },
            )
            .unwrap();
        (bucket, key)
    }

    fn full_declaration(bucket: BucketHandle, key: KeyHandle) -> TrailDeclaration {
        let mut decl = TrailDeclaration::new("FullTrail");
        decl.bind(bucket, key)
            .unwrap()
            .enable_data_events(&[DataEventScope::S3Object, DataEventScope::LambdaFunction])
            .unwrap()
            .enable_insights(&[InsightType::ApiCallRateInsight, InsightType::ApiErrorRateInsight])
            .unwrap()
            .apply_removal_policy(RemovalPolicy::Destroy, TEN_YEARS_DAYS)
            .unwrap();
        decl
    }

    #[test]
    fn out_of_order_steps_are_rejected() {
        let mut decl = TrailDeclaration::new("FullTrail");
        let err = decl.enable_insights(&[InsightType::ApiCallRateInsight]).unwrap_err();
        assert!(err.to_string().contains("requires a data-events-enabled trail"));
        assert_eq!(decl.stage(), TrailStage::Declared);
    }

    #[test]
    fn repeating_a_step_is_idempotent_but_changing_it_is_not() {
        let mut decl = TrailDeclaration::new("FullTrail");
        let bucket: BucketHandle = Handle::detached("CloudtrailBucket");
        let key: KeyHandle = Handle::detached("CloudtrailKmsKey");
        decl.bind(bucket.clone(), key.clone()).unwrap();
        decl.bind(bucket, key.clone()).unwrap();
        assert_eq!(decl.stage(), TrailStage::Bound);
        assert!(decl.bind(Handle::detached("OtherBucket"), key).is_err());
    }

    #[test]
    fn provision_wires_key_bucket_and_log_delivery() {
        let mut g = graph();
        let (bucket, key) = bucket_and_key(&mut g);
        let mut decl = full_declaration(bucket.clone(), key.clone());
        let trail = g.trails().provision(&mut decl).unwrap();
        assert_eq!(decl.stage(), TrailStage::Provisioned);
        assert_eq!(g.trails().provision(&mut decl).unwrap(), trail);
        assert_eq!(g.count(ResourceType::Trail), 1);

        assert!(g
            .keys()
            .spec(&key)
            .unwrap()
            .principals_with(KeyCapability::Encrypt)
            .contains(&Principal::service(TRAIL_SERVICE)));

        let plan = g.plan().unwrap();
        assert!(plan.position(&bucket.logical_id().child("Policy")) < plan.position(trail.logical_id()));
    }

    #[test]
    fn failed_provision_declares_no_partial_trail() {
        let mut g = graph();
        let (bucket, key) = bucket_and_key(&mut g);
        g.keys().create_key("FullTrailLogsRole", RemovalPolicy::Destroy).unwrap();
        let before = g.len();
        let mut decl = full_declaration(bucket.clone(), key.clone());

        assert!(g.trails().provision(&mut decl).is_err());

        assert_eq!(g.len(), before);
        assert!(!g.contains(&LogicalId::new("FullTrailLogGroup")));
        assert_eq!(decl.stage(), TrailStage::RemovalPolicyApplied);
        assert!(g.keys().spec(&key).unwrap().grants().is_empty());
        match &g.node(&bucket.logical_id().child("Policy")).unwrap().spec {
            ResourceSpec::BucketPolicy(policy) => assert!(policy.access.is_empty()),
            other => panic!("unexpected spec: {other:?}"),
        }
    }

    #[test]
    fn trail_renders_two_selectors_and_insights() {
        let mut g = graph();
        let (bucket, key) = bucket_and_key(&mut g);
        let mut decl = full_declaration(bucket.clone(), key.clone());
        let trail = g.trails().provision(&mut decl).unwrap();

        let mut outputs = Outputs::new();
        for (id, physical, arn) in [
            (bucket.logical_id().clone(), "cloudtrail-bucket-123456789012", "arn:aws:s3:::cloudtrail-bucket-123456789012"),
            (key.logical_id().clone(), "k-1", "arn:aws:kms:us-east-1:123456789012:key/k-1"),
            (LogicalId::new("FullTrailLogGroup"), "lg", "arn:aws:logs:us-east-1:123456789012:log-group:lg"),
            (LogicalId::new("FullTrailLogsRole"), "role", "arn:aws:iam::123456789012:role/role"),
        ] {
            outputs.insert(
                id,
                ResolvedResource {
                    physical_id: physical.to_string(),
                    arn: Some(arn.to_string()),
                },
            );
        }

        let props = g.node(trail.logical_id()).unwrap().render(g.env(), &outputs).unwrap();
        let selectors = props["EventSelectors"].as_array().unwrap();
        assert_eq!(selectors.len(), 2);
        let data_resources: usize = selectors
            .iter()
            .map(|s| s["DataResources"].as_array().unwrap().len())
            .sum();
        assert_eq!(data_resources, 2);
        assert_eq!(selectors[0]["DataResources"][0]["Values"][0], json!("arn:aws:s3:::"));
        assert_eq!(props["InsightSelectors"].as_array().unwrap().len(), 2);

        let log_group = g
            .node(&LogicalId::new("FullTrailLogGroup"))
            .unwrap()
            .render(g.env(), &outputs)
            .unwrap();
        assert_eq!(log_group["RetentionInDays"], json!(3653));
    }

    #[test]
    fn unresolved_bucket_fails_the_plan() {
        let mut g = graph();
        let key = g.keys().create_key("CloudtrailKmsKey", RemovalPolicy::Destroy).unwrap();
        let mut decl = full_declaration(Handle::detached("MissingBucket"), key);
        g.trails().provision(&mut decl).unwrap();
        assert!(matches!(
            g.plan().unwrap_err(),
            ProvisionError::UnresolvedDependency { .. }
        ));
    }

    #[test]
    fn unsupported_retention_is_rejected() {
        let mut decl = TrailDeclaration::new("FullTrail");
        decl.bind(Handle::detached("B"), Handle::detached("K"))
            .unwrap()
            .enable_data_events(&[DataEventScope::S3Object])
            .unwrap()
            .enable_insights(&[])
            .unwrap();
        assert!(decl.apply_removal_policy(RemovalPolicy::Destroy, 3650).is_err());
    }
}
