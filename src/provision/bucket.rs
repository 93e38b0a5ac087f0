//! # Bucket Provisioner
//!
//! Storage buckets with a fixed hardening policy:
//! - public access fully blocked
//! - TLS enforced through a companion bucket policy
//! - bucket keys enabled whenever the bucket is key-backed
//!
//! The access-log bucket is the one exception to ownership enforcement: it uses
//! provider-managed encryption and `ObjectWriter` ownership with the
//! `LogDeliveryWrite` ACL so the log delivery service can write into it.
//! Every other bucket uses `BucketOwnerEnforced`, which disables ACLs.

use super::key::{KeyCapability, KeyHandle};
use crate::constants::TRAIL_SERVICE;
use crate::error::{ProvisionError, Result};
use crate::graph::{Handle, RenderContext, ResourceDefinition, ResourceGraph, ResourceSpec};
use crate::model::{LogicalId, Principal, RemovalPolicy, ResourceType};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::debug;

pub type BucketHandle = Handle<BucketSpec>;
pub type BucketPolicyHandle = Handle<BucketPolicySpec>;

/// Tag marking buckets whose objects are purged on destroy
pub const AUTO_DELETE_TAG: &str = "compliance-lake:auto-delete-objects";

static BUCKET_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("bucket name regex is valid")
});

const READ_WRITE_ACTIONS: &[&str] = &[
    "s3:GetObject*",
    "s3:GetBucket*",
    "s3:List*",
    "s3:DeleteObject*",
    "s3:PutObject",
    "s3:PutObjectLegalHold",
    "s3:PutObjectRetention",
    "s3:PutObjectTagging",
    "s3:PutObjectVersionTagging",
    "s3:Abort*",
];

/// Server-side encryption mode; a bucket has exactly one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEncryption {
    /// Provider-managed keys (SSE-S3)
    Managed,
    /// Customer-managed KMS key (SSE-KMS with bucket key)
    KeyBacked(KeyHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOwnership {
    ObjectWriter,
    BucketOwnerEnforced,
}

impl ObjectOwnership {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectOwnership::ObjectWriter => "ObjectWriter",
            ObjectOwnership::BucketOwnerEnforced => "BucketOwnerEnforced",
        }
    }
}

/// Everything a caller decides about a bucket
#[derive(Debug, Clone)]
pub struct BucketProps {
    pub name: String,
    pub encryption: BucketEncryption,
    pub ownership: ObjectOwnership,
    /// Bucket receiving server access logs, under the `<name>/` prefix
    pub access_logs: Option<BucketHandle>,
    pub removal_policy: RemovalPolicy,
    pub auto_delete_objects: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogging {
    pub target: BucketHandle,
    pub prefix: String,
}

/// Declared bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSpec {
    pub name: String,
    pub encryption: BucketEncryption,
    pub ownership: ObjectOwnership,
    pub access_logs: Option<AccessLogging>,
    pub auto_delete_objects: bool,
    /// Set once another bucket ships its access logs here
    pub log_delivery_target: bool,
}

impl BucketSpec {
    #[must_use]
    pub fn key(&self) -> Option<&KeyHandle> {
        match &self.encryption {
            BucketEncryption::KeyBacked(key) => Some(key),
            BucketEncryption::Managed => None,
        }
    }
}

impl ResourceDefinition for BucketSpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::Bucket;

    fn references(&self) -> Vec<LogicalId> {
        let mut refs = Vec::new();
        if let Some(key) = self.key() {
            refs.push(key.logical_id().clone());
        }
        if let Some(logging) = &self.access_logs {
            refs.push(logging.target.logical_id().clone());
        }
        refs
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        let encryption = match &self.encryption {
            BucketEncryption::Managed => json!({
                "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" },
            }),
            BucketEncryption::KeyBacked(key) => json!({
                "BucketKeyEnabled": true,
                "ServerSideEncryptionByDefault": {
                    "SSEAlgorithm": "aws:kms",
                    "KMSMasterKeyID": ctx.arn(key.logical_id())?,
                },
            }),
        };

        let mut props = json!({
            "BucketName": self.name,
            "BucketEncryption": { "ServerSideEncryptionConfiguration": [encryption] },
            "PublicAccessBlockConfiguration": {
                "BlockPublicAcls": true,
                "BlockPublicPolicy": true,
                "IgnorePublicAcls": true,
                "RestrictPublicBuckets": true,
            },
            "OwnershipControls": { "Rules": [{ "ObjectOwnership": self.ownership.as_str() }] },
        });

        if self.log_delivery_target {
            props["AccessControl"] = json!("LogDeliveryWrite");
        }
        if let Some(logging) = &self.access_logs {
            props["LoggingConfiguration"] = json!({
                "DestinationBucketName": ctx.physical_id(logging.target.logical_id())?,
                "LogFilePrefix": logging.prefix,
            });
        }
        if self.auto_delete_objects {
            props["Tags"] = json!([{ "Key": AUTO_DELETE_TAG, "Value": "true" }]);
        }
        Ok(props)
    }
}

/// Who besides the owner may touch a bucket
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum BucketAccess {
    ReadWrite(Principal),
    /// Trail service delivery under `AWSLogs/<account>/`
    TrailDelivery,
}

/// Companion policy of a bucket: TLS enforcement plus access grants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPolicySpec {
    pub bucket: BucketHandle,
    pub access: BTreeSet<BucketAccess>,
}

impl ResourceDefinition for BucketPolicySpec {
    const RESOURCE_TYPE: ResourceType = ResourceType::BucketPolicy;

    fn references(&self) -> Vec<LogicalId> {
        vec![self.bucket.logical_id().clone()]
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        let bucket_name = ctx.physical_id(self.bucket.logical_id())?;
        let bucket_arn = ctx.arn(self.bucket.logical_id())?;
        let objects = format!("{bucket_arn}/*");

        let mut statements = vec![json!({
            "Sid": "EnforceSecureTransport",
            "Effect": "Deny",
            "Principal": { "AWS": "*" },
            "Action": "s3:*",
            "Resource": [bucket_arn, objects],
            "Condition": { "Bool": { "aws:SecureTransport": "false" } },
        })];

        for access in &self.access {
            match access {
                BucketAccess::ReadWrite(principal) => {
                    let resolved = ctx.resolve(principal)?;
                    statements.push(json!({
                        "Effect": "Allow",
                        "Principal": resolved.policy_principal(),
                        "Action": READ_WRITE_ACTIONS,
                        "Resource": [bucket_arn, objects],
                    }));
                }
                BucketAccess::TrailDelivery => {
                    statements.push(json!({
                        "Sid": "TrailAclCheck",
                        "Effect": "Allow",
                        "Principal": { "Service": TRAIL_SERVICE },
                        "Action": "s3:GetBucketAcl",
                        "Resource": bucket_arn,
                    }));
                    statements.push(json!({
                        "Sid": "TrailWrite",
                        "Effect": "Allow",
                        "Principal": { "Service": TRAIL_SERVICE },
                        "Action": "s3:PutObject",
                        "Resource": format!("{bucket_arn}/AWSLogs/{}/*", ctx.env().account),
                        "Condition": { "StringEquals": { "s3:x-amz-acl": "bucket-owner-full-control" } },
                    }));
                }
            }
        }

        Ok(json!({
            "Bucket": bucket_name,
            "PolicyDocument": {
                "Version": "2012-10-17",
                "Statement": statements,
            },
        }))
    }
}

/// Declares hardened buckets
#[derive(Debug)]
pub struct BucketProvisioner<'g> {
    graph: &'g mut ResourceGraph,
}

impl ResourceGraph {
    pub fn buckets(&mut self) -> BucketProvisioner<'_> {
        BucketProvisioner { graph: self }
    }

    /// Spec of a declared bucket
    pub(crate) fn bucket_spec(&self, id: &LogicalId) -> Option<&BucketSpec> {
        match self.node(id).map(|n| &n.spec) {
            Some(ResourceSpec::Bucket(spec)) => Some(spec),
            _ => None,
        }
    }
}

impl BucketProvisioner<'_> {
    /// Declare a bucket and its TLS-enforcing policy
    pub fn create_bucket(&mut self, id: impl Into<LogicalId>, props: BucketProps) -> Result<BucketHandle> {
        let id = id.into();
        let policy_id = id.child("Policy");
        self.validate(&id, &props)?;
        self.graph.check_new_ids(&[&id, &policy_id])?;

        let access_logs = props.access_logs.map(|target| AccessLogging {
            target,
            prefix: format!("{}/", props.name),
        });
        if let Some(logging) = &access_logs {
            if let Some(ResourceSpec::Bucket(target)) = self
                .graph
                .node_mut(logging.target.logical_id())
                .map(|n| &mut n.spec)
            {
                target.log_delivery_target = true;
            }
        }

        let spec = BucketSpec {
            name: props.name,
            encryption: props.encryption,
            ownership: props.ownership,
            access_logs,
            auto_delete_objects: props.auto_delete_objects,
            log_delivery_target: false,
        };
        let bucket: BucketHandle =
            self.graph
                .add(id.clone(), ResourceSpec::Bucket(spec), props.removal_policy)?;

        let policy = BucketPolicySpec {
            bucket: bucket.clone(),
            access: BTreeSet::new(),
        };
        let _: BucketPolicyHandle = self.graph.add(
            policy_id,
            ResourceSpec::BucketPolicy(policy),
            props.removal_policy,
        )?;

        debug!(bucket = %id, "Declared hardened bucket");
        Ok(bucket)
    }

    /// Declare the access-log bucket: managed encryption, object-writer ownership
    pub fn create_logging_bucket(
        &mut self,
        id: impl Into<LogicalId>,
        name: impl Into<String>,
        removal_policy: RemovalPolicy,
        auto_delete_objects: bool,
    ) -> Result<BucketHandle> {
        self.create_bucket(
            id,
            BucketProps {
                name: name.into(),
                encryption: BucketEncryption::Managed,
                ownership: ObjectOwnership::ObjectWriter,
                access_logs: None,
                removal_policy,
                auto_delete_objects,
            },
        )
    }

    /// Let `principal` read and write objects; key-backed buckets also grant
    /// encrypt-decrypt on their key
    pub fn grant_read_write(&mut self, bucket: &BucketHandle, principal: Principal) -> Result<()> {
        let key = self.spec(bucket)?.key().cloned();
        self.add_access(bucket, BucketAccess::ReadWrite(principal.clone()))?;
        if let Some(key) = key {
            self.graph
                .keys()
                .grant(&key, principal, KeyCapability::EncryptDecrypt)?;
        }
        Ok(())
    }

    /// Allow the trail service to deliver logs into `bucket`
    pub(crate) fn allow_trail_delivery(&mut self, bucket: &BucketHandle) -> Result<()> {
        self.add_access(bucket, BucketAccess::TrailDelivery)
    }

    pub fn spec(&self, bucket: &BucketHandle) -> Result<&BucketSpec> {
        self.graph
            .bucket_spec(bucket.logical_id())
            .ok_or_else(|| not_a_bucket(bucket.logical_id()))
    }

    fn add_access(&mut self, bucket: &BucketHandle, access: BucketAccess) -> Result<()> {
        let policy_id = bucket.logical_id().child("Policy");
        match self.graph.node_mut(&policy_id).map(|n| &mut n.spec) {
            Some(ResourceSpec::BucketPolicy(policy)) => {
                policy.access.insert(access);
                Ok(())
            }
            _ => Err(not_a_bucket(bucket.logical_id())),
        }
    }

    fn validate(&self, id: &LogicalId, props: &BucketProps) -> Result<()> {
        if !BUCKET_NAME.is_match(&props.name) || props.name.contains("..") {
            return Err(ProvisionError::invalid(
                id,
                format!(
                    "bucket name '{}' must be 3-63 lowercase letters, digits, dots or hyphens",
                    props.name
                ),
            ));
        }
        if props.auto_delete_objects && props.removal_policy == RemovalPolicy::Retain {
            return Err(ProvisionError::invalid(
                id,
                "auto-delete-objects requires the destroy removal policy",
            ));
        }
        if let BucketEncryption::KeyBacked(key) = &props.encryption {
            if let Some(node) = self.graph.node(key.logical_id()) {
                if node.resource_type() != ResourceType::KmsKey {
                    return Err(ProvisionError::invalid(
                        id,
                        format!("encryption key '{}' is not a key", key.logical_id()),
                    ));
                }
            }
        }
        if let Some(target) = &props.access_logs {
            if target.logical_id() == id {
                return Err(ProvisionError::invalid(id, "a bucket cannot receive its own access logs"));
            }
            if let Some(spec) = self.graph.bucket_spec(target.logical_id()) {
                if spec.name == props.name {
                    return Err(ProvisionError::invalid(id, "a bucket cannot receive its own access logs"));
                }
                if spec.ownership != ObjectOwnership::ObjectWriter
                    || spec.encryption != BucketEncryption::Managed
                {
                    return Err(ProvisionError::invalid(
                        id,
                        format!(
                            "access-log target '{}' must use managed encryption and ObjectWriter ownership",
                            target.logical_id()
                        ),
                    ));
                }
            } else if self.graph.contains(target.logical_id()) {
                return Err(not_a_bucket(target.logical_id()));
            }
        }
        Ok(())
    }
}

fn not_a_bucket(id: &LogicalId) -> ProvisionError {
    ProvisionError::invalid(id, "is not a bucket declared in this graph")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Outputs, ResolvedResource};
    use crate::model::Environment;

    fn graph() -> ResourceGraph {
        ResourceGraph::new(Environment::new("123456789012", "aws", "us-east-1").unwrap())
    }

    fn props(name: &str, encryption: BucketEncryption, logs: Option<BucketHandle>) -> BucketProps {
        BucketProps {
            name: name.to_string(),
            encryption,
            ownership: ObjectOwnership::BucketOwnerEnforced,
            access_logs: logs,
            removal_policy: RemovalPolicy::Destroy,
            auto_delete_objects: true,
        }
    }

    fn resolved(outputs: &mut Outputs, id: &LogicalId, physical: &str, arn: &str) {
        outputs.insert(
            id.clone(),
            ResolvedResource {
                physical_id: physical.to_string(),
                arn: Some(arn.to_string()),
            },
        );
    }

    #[test]
    fn key_backed_bucket_enables_bucket_key_and_logging() {
        let mut g = graph();
        let logs = g
            .buckets()
            .create_logging_bucket("LoggingBucket", "logging-123456789012", RemovalPolicy::Destroy, true)
            .unwrap();
        let key = g.keys().create_key("DataKey", RemovalPolicy::Destroy).unwrap();
        let bucket = g
            .buckets()
            .create_bucket(
                "DataLakeBucket",
                props("data-lake-bucket-123456789012", BucketEncryption::KeyBacked(key.clone()), Some(logs.clone())),
            )
            .unwrap();

        let mut outputs = Outputs::new();
        resolved(&mut outputs, key.logical_id(), "key-1", "arn:aws:kms:us-east-1:123456789012:key/key-1");
        resolved(&mut outputs, logs.logical_id(), "logging-123456789012", "arn:aws:s3:::logging-123456789012");

        let props = g.node(bucket.logical_id()).unwrap().render(g.env(), &outputs).unwrap();
        let sse = &props["BucketEncryption"]["ServerSideEncryptionConfiguration"][0];
        assert_eq!(sse["BucketKeyEnabled"], json!(true));
        assert_eq!(sse["ServerSideEncryptionByDefault"]["SSEAlgorithm"], json!("aws:kms"));
        assert_eq!(props["LoggingConfiguration"]["LogFilePrefix"], json!("data-lake-bucket-123456789012/"));
        assert_eq!(props["OwnershipControls"]["Rules"][0]["ObjectOwnership"], json!("BucketOwnerEnforced"));

        let log_props = g.node(logs.logical_id()).unwrap().render(g.env(), &outputs).unwrap();
        assert_eq!(log_props["AccessControl"], json!("LogDeliveryWrite"));
        assert_eq!(log_props["OwnershipControls"]["Rules"][0]["ObjectOwnership"], json!("ObjectWriter"));
        assert_eq!(
            log_props["BucketEncryption"]["ServerSideEncryptionConfiguration"][0]["ServerSideEncryptionByDefault"]["SSEAlgorithm"],
            json!("AES256")
        );
    }

    #[test]
    fn rejected_declaration_leaves_graph_untouched() {
        let mut g = graph();
        let logs = g
            .buckets()
            .create_logging_bucket("LoggingBucket", "logging-123456789012", RemovalPolicy::Destroy, true)
            .unwrap();
        let key = g.keys().create_key("DataKey", RemovalPolicy::Destroy).unwrap();
        g.keys().create_key("DataLakeBucketPolicy", RemovalPolicy::Destroy).unwrap();
        let before = g.len();

        let err = g
            .buckets()
            .create_bucket(
                "DataLakeBucket",
                props("data-lake-bucket-123456789012", BucketEncryption::KeyBacked(key), Some(logs.clone())),
            )
            .unwrap_err();

        assert!(err.to_string().contains("already declared"));
        assert_eq!(g.len(), before);
        assert!(!g.contains(&LogicalId::new("DataLakeBucket")));
        assert!(!g.buckets().spec(&logs).unwrap().log_delivery_target);
    }

    #[test]
    fn log_target_must_allow_log_delivery() {
        let mut g = graph();
        let key = g.keys().create_key("DataKey", RemovalPolicy::Destroy).unwrap();
        let enforced = g
            .buckets()
            .create_bucket("Enforced", props("enforced-bucket", BucketEncryption::KeyBacked(key), None))
            .unwrap();
        let err = g
            .buckets()
            .create_bucket("Other", props("other-bucket", BucketEncryption::Managed, Some(enforced)))
            .unwrap_err();
        assert!(err.to_string().contains("ObjectWriter"));
    }

    #[test]
    fn bucket_cannot_log_to_itself() {
        let mut g = graph();
        let err = g
            .buckets()
            .create_bucket(
                "Selfish",
                props("selfish-bucket", BucketEncryption::Managed, Some(Handle::detached("Selfish"))),
            )
            .unwrap_err();
        assert!(err.to_string().contains("own access logs"));
    }

    #[test]
    fn invalid_names_and_contradictory_lifecycle_are_rejected() {
        let mut g = graph();
        assert!(g
            .buckets()
            .create_bucket("Upper", props("Upper_Case", BucketEncryption::Managed, None))
            .is_err());

        let mut retained = props("retained-bucket", BucketEncryption::Managed, None);
        retained.removal_policy = RemovalPolicy::Retain;
        assert!(g.buckets().create_bucket("Retained", retained).is_err());
    }

    #[test]
    fn policy_enforces_tls_and_read_write_grants_reach_the_key() {
        let mut g = graph();
        let key = g.keys().create_key("DataKey", RemovalPolicy::Destroy).unwrap();
        let bucket = g
            .buckets()
            .create_bucket("DataLakeBucket", props("data-lake-bucket", BucketEncryption::KeyBacked(key.clone()), None))
            .unwrap();
        g.buckets()
            .grant_read_write(&bucket, Principal::lake_formation_service_role())
            .unwrap();

        assert!(g
            .keys()
            .spec(&key)
            .unwrap()
            .principals_with(KeyCapability::EncryptDecrypt)
            .contains(&Principal::lake_formation_service_role()));

        let mut outputs = Outputs::new();
        resolved(&mut outputs, bucket.logical_id(), "data-lake-bucket", "arn:aws:s3:::data-lake-bucket");
        let policy = g
            .node(&bucket.logical_id().child("Policy"))
            .unwrap()
            .render(g.env(), &outputs)
            .unwrap();
        let statements = policy["PolicyDocument"]["Statement"].as_array().unwrap();
        assert_eq!(statements[0]["Condition"]["Bool"]["aws:SecureTransport"], json!("false"));
        assert_eq!(statements.len(), 2);
    }
}
