//! # In-Memory Control Plane
//!
//! Keeps applied resources in a map and assigns identifiers the way the cloud
//! would. Used for `--backend memory` dry runs and throughout the tests.
//!
//! Failures can be injected per logical id, and whole resource types can be
//! made to come back without an identifier to exercise dependency resolution.
//!
//! Like Cloud Control, a request carrying a client token that already
//! completed is answered with the original outcome instead of running again.

use super::{ApplyAction, ApplyOutcome, ApplyRequest, ControlPlane, ControlPlaneError, DeleteRequest};
use crate::model::{Environment, LogicalId, ResourceType};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// A resource as the in-memory backend holds it
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResource {
    pub resource_type: ResourceType,
    pub physical_id: String,
    pub arn: Option<String>,
    pub properties: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Apply,
    Delete,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<LogicalId, StoredResource>,
    failures: HashMap<LogicalId, (ControlPlaneError, u32)>,
    lost_responses: HashMap<LogicalId, u32>,
    completed: HashMap<String, ApplyOutcome>,
    deleted_tokens: BTreeSet<String>,
    tokens: Vec<(LogicalId, String)>,
    creates: HashMap<LogicalId, usize>,
    unresolved: BTreeSet<ResourceType>,
    objects: HashMap<String, usize>,
    calls: Vec<(LogicalId, Operation)>,
    sequence: u64,
}

#[derive(Debug)]
pub struct MemoryControlPlane {
    env: Environment,
    inner: Mutex<Inner>,
}

impl MemoryControlPlane {
    #[must_use]
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` operations on `id` with `error`
    pub fn fail_next(&self, id: impl Into<LogicalId>, error: ControlPlaneError, times: u32) {
        self.lock().failures.insert(id.into(), (error, times));
    }

    /// Carry out the next `times` applies of `id` but answer them with a
    /// transient timeout, as when a response is lost in transit
    pub fn lose_response_next(&self, id: impl Into<LogicalId>, times: u32) {
        self.lock().lost_responses.insert(id.into(), times);
    }

    /// Resources of this type are applied but come back without an identifier
    pub fn leave_unresolved(&self, resource_type: ResourceType) {
        self.lock().unresolved.insert(resource_type);
    }

    /// Pretend `count` objects were written into a bucket
    pub fn put_objects(&self, bucket_name: &str, count: usize) {
        *self.lock().objects.entry(bucket_name.to_string()).or_default() += count;
    }

    #[must_use]
    pub fn object_count(&self, bucket_name: &str) -> usize {
        self.lock().objects.get(bucket_name).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn resource(&self, id: &LogicalId) -> Option<StoredResource> {
        self.lock().resources.get(id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &LogicalId) -> bool {
        self.lock().resources.contains_key(id)
    }

    /// Number of live resources of a type
    #[must_use]
    pub fn count(&self, resource_type: ResourceType) -> usize {
        self.lock()
            .resources
            .values()
            .filter(|r| r.resource_type == resource_type)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().resources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().resources.is_empty()
    }

    /// Every operation that reached the backend, in arrival order
    #[must_use]
    pub fn calls(&self) -> Vec<(LogicalId, Operation)> {
        self.lock().calls.clone()
    }

    /// Client tokens received for `id`, in arrival order
    #[must_use]
    pub fn client_tokens(&self, id: &LogicalId) -> Vec<String> {
        self.lock()
            .tokens
            .iter()
            .filter(|(logical_id, _)| logical_id == id)
            .map(|(_, token)| token.clone())
            .collect()
    }

    /// How many times `id` was actually created
    #[must_use]
    pub fn creates(&self, id: &LogicalId) -> usize {
        self.lock().creates.get(id).copied().unwrap_or(0)
    }

    fn take_lost_response(inner: &mut Inner, id: &LogicalId) -> bool {
        let Some(remaining) = inner.lost_responses.get_mut(id) else {
            return false;
        };
        *remaining -= 1;
        if *remaining == 0 {
            inner.lost_responses.remove(id);
        }
        true
    }

    fn take_failure(inner: &mut Inner, id: &LogicalId) -> Option<ControlPlaneError> {
        let (error, remaining) = inner.failures.get_mut(id)?;
        let error = error.clone();
        *remaining -= 1;
        if *remaining == 0 {
            inner.failures.remove(id);
        }
        Some(error)
    }

    fn identify(env: &Environment, request: &ApplyRequest, sequence: u64) -> (String, Option<String>) {
        let props = &request.properties;
        let named = |key: &str| {
            props
                .get(key)
                .and_then(Value::as_str)
                .map_or_else(|| request.logical_id.as_str().to_string(), str::to_string)
        };
        let suffix = format!("{sequence:08x}");
        match request.resource_type {
            ResourceType::KmsKey => {
                let key_id = uuid::Uuid::new_v4().to_string();
                let arn = format!(
                    "arn:{}:kms:{}:{}:key/{key_id}",
                    env.partition, env.region, env.account
                );
                (key_id, Some(arn))
            }
            ResourceType::Bucket => {
                let name = named("BucketName");
                let arn = format!("arn:{}:s3:::{name}", env.partition);
                (name, Some(arn))
            }
            ResourceType::LogGroup => {
                let name = format!("{}-{suffix}", request.logical_id);
                let arn = format!(
                    "arn:{}:logs:{}:{}:log-group:{name}:*",
                    env.partition, env.region, env.account
                );
                (name, Some(arn))
            }
            ResourceType::Role => {
                let name = format!("{}-{suffix}", request.logical_id);
                let arn = env.iam_arn(&format!("role/{name}"));
                (name, Some(arn))
            }
            ResourceType::Trail => {
                let name = format!("{}-{suffix}", request.logical_id);
                let arn = format!(
                    "arn:{}:cloudtrail:{}:{}:trail/{name}",
                    env.partition, env.region, env.account
                );
                (name, Some(arn))
            }
            ResourceType::Database => {
                let name = props
                    .pointer("/DatabaseInput/Name")
                    .and_then(Value::as_str)
                    .unwrap_or(request.logical_id.as_str());
                (name.to_string(), None)
            }
            ResourceType::Table => {
                let database = props.get("DatabaseName").and_then(Value::as_str).unwrap_or_default();
                let name = props
                    .pointer("/TableInput/Name")
                    .and_then(Value::as_str)
                    .unwrap_or(request.logical_id.as_str());
                (format!("{database}|{name}"), None)
            }
            ResourceType::WorkGroup => (named("Name"), None),
            ResourceType::CatalogEncryptionSettings
            | ResourceType::DataLakeSettings
            | ResourceType::RegisteredLocation
            | ResourceType::Permissions
            | ResourceType::BucketPolicy => (format!("{}-{suffix}", request.logical_id), None),
        }
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, ControlPlaneError> {
        let mut inner = self.lock();
        inner.calls.push((request.logical_id.clone(), Operation::Apply));
        inner
            .tokens
            .push((request.logical_id.clone(), request.client_token.clone()));
        if let Some(error) = Self::take_failure(&mut inner, &request.logical_id) {
            return Err(error);
        }
        if let Some(outcome) = inner.completed.get(&request.client_token) {
            debug!(logical_id = %request.logical_id, "Replaying completed request");
            return Ok(outcome.clone());
        }

        let outcome = Self::apply_locked(&self.env, &mut inner, request)?;
        inner
            .completed
            .insert(request.client_token.clone(), outcome.clone());
        if Self::take_lost_response(&mut inner, &request.logical_id) {
            return Err(ControlPlaneError::Transient(
                "request timed out waiting for a response".to_string(),
            ));
        }
        Ok(outcome)
    }

    async fn delete(&self, request: &DeleteRequest) -> Result<(), ControlPlaneError> {
        let mut inner = self.lock();
        inner.calls.push((request.logical_id.clone(), Operation::Delete));
        inner
            .tokens
            .push((request.logical_id.clone(), request.client_token.clone()));
        if let Some(error) = Self::take_failure(&mut inner, &request.logical_id) {
            return Err(error);
        }
        if inner.deleted_tokens.contains(&request.client_token) {
            return Ok(());
        }
        Self::delete_locked(&mut inner, request)?;
        inner.deleted_tokens.insert(request.client_token.clone());
        Ok(())
    }
}

impl MemoryControlPlane {
    fn apply_locked(
        env: &Environment,
        inner: &mut Inner,
        request: &ApplyRequest,
    ) -> Result<ApplyOutcome, ControlPlaneError> {
        let unresolved = inner.unresolved.contains(&request.resource_type);
        if let Some(existing) = inner.resources.get_mut(&request.logical_id) {
            if existing.resource_type != request.resource_type {
                return Err(ControlPlaneError::Rejected(format!(
                    "'{}' already exists as {}",
                    request.logical_id, existing.resource_type
                )));
            }
            let action = if existing.properties == request.properties {
                ApplyAction::Unchanged
            } else {
                existing.properties = request.properties.clone();
                ApplyAction::Updated
            };
            debug!(logical_id = %request.logical_id, action = %action, "Memory apply");
            return Ok(ApplyOutcome {
                physical_id: if unresolved { String::new() } else { existing.physical_id.clone() },
                arn: existing.arn.clone(),
                action,
            });
        }

        inner.sequence += 1;
        let (physical_id, arn) = Self::identify(env, request, inner.sequence);
        if request.resource_type == ResourceType::Bucket
            && inner
                .resources
                .values()
                .any(|r| r.resource_type == ResourceType::Bucket && r.physical_id == physical_id)
        {
            return Err(ControlPlaneError::Rejected(format!(
                "bucket '{physical_id}' already exists"
            )));
        }
        inner.resources.insert(
            request.logical_id.clone(),
            StoredResource {
                resource_type: request.resource_type,
                physical_id: physical_id.clone(),
                arn: arn.clone(),
                properties: request.properties.clone(),
            },
        );
        *inner.creates.entry(request.logical_id.clone()).or_default() += 1;
        debug!(logical_id = %request.logical_id, physical_id = %physical_id, "Memory create");
        Ok(ApplyOutcome {
            physical_id: if unresolved { String::new() } else { physical_id },
            arn: if unresolved { None } else { arn },
            action: ApplyAction::Created,
        })
    }

    fn delete_locked(inner: &mut Inner, request: &DeleteRequest) -> Result<(), ControlPlaneError> {
        let Some(stored) = inner.resources.get(&request.logical_id) else {
            return Err(ControlPlaneError::NotFound(request.logical_id.to_string()));
        };
        if stored.resource_type == ResourceType::Bucket {
            let bucket = stored.physical_id.clone();
            let objects = inner.objects.get(&bucket).copied().unwrap_or(0);
            if objects > 0 {
                if !request.purge_objects {
                    return Err(ControlPlaneError::Rejected(format!(
                        "bucket '{bucket}' is not empty ({objects} objects)"
                    )));
                }
                inner.objects.remove(&bucket);
            }
        }
        inner.resources.remove(&request.logical_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> MemoryControlPlane {
        MemoryControlPlane::new(Environment::new("123456789012", "aws", "us-east-1").unwrap())
    }

    fn request(id: &str, resource_type: ResourceType, properties: Value) -> ApplyRequest {
        ApplyRequest {
            logical_id: LogicalId::new(id),
            resource_type,
            properties,
            physical_id: None,
            client_token: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn retried(request: &ApplyRequest) -> ApplyRequest {
        ApplyRequest {
            client_token: uuid::Uuid::new_v4().to_string(),
            ..request.clone()
        }
    }

    #[tokio::test]
    async fn identical_properties_are_a_no_op() {
        let cp = backend();
        let req = request("LogBucket", ResourceType::Bucket, json!({"BucketName": "logs-123"}));
        let first = cp.apply(&req).await.unwrap();
        assert_eq!(first.action, ApplyAction::Created);
        assert_eq!(first.physical_id, "logs-123");
        assert_eq!(first.arn.as_deref(), Some("arn:aws:s3:::logs-123"));

        let second = cp.apply(&retried(&req)).await.unwrap();
        assert_eq!(second.action, ApplyAction::Unchanged);
        assert_eq!(second.physical_id, first.physical_id);

        let changed = request("LogBucket", ResourceType::Bucket, json!({"BucketName": "logs-123", "Tags": []}));
        assert_eq!(cp.apply(&changed).await.unwrap().action, ApplyAction::Updated);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let cp = backend();
        cp.fail_next("CatalogKey", ControlPlaneError::Transient("Throttling".to_string()), 2);
        let req = request("CatalogKey", ResourceType::KmsKey, json!({}));
        assert!(cp.apply(&req).await.unwrap_err().is_transient());
        assert!(cp.apply(&req).await.is_err());
        assert!(cp.apply(&req).await.is_ok());
        assert_eq!(cp.calls().len(), 3);
    }

    #[tokio::test]
    async fn completed_tokens_are_replayed() {
        let cp = backend();
        cp.lose_response_next("CatalogKey", 1);
        let req = request("CatalogKey", ResourceType::KmsKey, json!({"EnableKeyRotation": true}));
        assert!(cp.apply(&req).await.unwrap_err().is_transient());

        let replayed = cp.apply(&req).await.unwrap();
        assert_eq!(replayed.action, ApplyAction::Created);
        assert_eq!(cp.creates(&req.logical_id), 1);
        assert_eq!(cp.count(ResourceType::KmsKey), 1);
        assert_eq!(
            cp.client_tokens(&req.logical_id),
            vec![req.client_token.clone(), req.client_token.clone()]
        );
    }

    #[tokio::test]
    async fn non_empty_buckets_need_purge() {
        let cp = backend();
        cp.apply(&request("DataLakeBucket", ResourceType::Bucket, json!({"BucketName": "dl"})))
            .await
            .unwrap();
        cp.put_objects("dl", 3);

        let mut delete = DeleteRequest {
            logical_id: LogicalId::new("DataLakeBucket"),
            resource_type: ResourceType::Bucket,
            physical_id: "dl".to_string(),
            purge_objects: false,
            client_token: "delete-dl".to_string(),
        };
        assert!(matches!(
            cp.delete(&delete).await,
            Err(ControlPlaneError::Rejected(_))
        ));
        delete.purge_objects = true;
        cp.delete(&delete).await.unwrap();
        assert!(cp.is_empty());
        assert_eq!(cp.object_count("dl"), 0);
    }

    #[tokio::test]
    async fn unresolved_types_come_back_without_identifier() {
        let cp = backend();
        cp.leave_unresolved(ResourceType::Bucket);
        let outcome = cp
            .apply(&request("CloudtrailBucket", ResourceType::Bucket, json!({"BucketName": "ct"})))
            .await
            .unwrap();
        assert!(outcome.physical_id.is_empty());
        assert!(outcome.arn.is_none());
        assert_eq!(cp.count(ResourceType::Bucket), 1);
    }
}
