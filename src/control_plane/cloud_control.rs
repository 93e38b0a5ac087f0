//! # AWS Cloud Control Backend
//!
//! Applies resources through the AWS Cloud Control API.
//!
//! Cloud Control requests are asynchronous: create, update and delete return
//! a request token that is polled until the operation settles. Handler error
//! codes and SDK error codes are mapped onto [`ControlPlaneError`] so the
//! engine can tell throttling and propagation delays apart from hard failures.
//!
//! Buckets declared with auto-delete are emptied through S3 before deletion,
//! since Cloud Control refuses to delete a bucket that still holds objects.

use super::{ApplyAction, ApplyOutcome, ApplyRequest, ControlPlane, ControlPlaneError, DeleteRequest};
use crate::config::ProvisionerConfig;
use crate::model::ResourceType;
use async_trait::async_trait;
use aws_sdk_cloudcontrol::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_cloudcontrol::types::{HandlerErrorCode, OperationStatus, ProgressEvent};
use aws_sdk_cloudcontrol::Client as CloudControlClient;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, info_span, Instrument};

/// Error codes that indicate throttling or eventual consistency
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ConcurrentOperationException",
    "ServiceInternalError",
    "ServiceInternalErrorException",
    "InternalFailure",
    "NetworkFailure",
    "NetworkFailureException",
    "ServiceUnavailable",
    "NotStabilized",
    "ResourceConflict",
    "ResourceConflictException",
];

const DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "InvalidCredentials",
    "UnauthorizedOperation",
    "UnauthorizedTaggingOperation",
];

const NOT_FOUND_CODES: &[&str] = &["NotFound", "ResourceNotFoundException"];

/// Messages of requests that fail because a dependency has not propagated yet
const PROPAGATION_HINTS: &[&str] = &[
    "Invalid principal",
    "has not yet been created",
    "cannot be assumed",
    "does not exist or is not accessible",
    "Insufficient Lake Formation permission",
];

/// Map an error code and message onto the engine's error classes
#[must_use]
pub fn classify(code: Option<&str>, message: &str) -> ControlPlaneError {
    let message = match code {
        Some(code) => format!("{code}: {message}"),
        None => message.to_string(),
    };
    match code {
        Some(code) if TRANSIENT_CODES.contains(&code) => ControlPlaneError::Transient(message),
        Some(code) if DENIED_CODES.contains(&code) => ControlPlaneError::PermissionDenied(message),
        Some(code) if NOT_FOUND_CODES.contains(&code) => ControlPlaneError::NotFound(message),
        _ if PROPAGATION_HINTS.iter().any(|hint| message.contains(hint)) => {
            ControlPlaneError::Transient(message)
        }
        _ => ControlPlaneError::Rejected(message),
    }
}

fn sdk_error<E, R>(err: &SdkError<E, R>) -> ControlPlaneError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            ControlPlaneError::Transient(DisplayErrorContext(err).to_string())
        }
        _ => classify(err.code(), &DisplayErrorContext(err).to_string()),
    }
}

fn handler_error(event: &ProgressEvent) -> ControlPlaneError {
    let message = event.status_message().unwrap_or("operation failed");
    let code = event.error_code().map(HandlerErrorCode::as_str);
    classify(code, message)
}

/// Writable top-level properties the provisioners render for a type
///
/// Only these are removed by a patch; everything else in the current model
/// is read-only or owned by the cloud.
fn managed_properties(resource_type: ResourceType) -> &'static [&'static str] {
    match resource_type {
        ResourceType::KmsKey => &["EnableKeyRotation", "KeyPolicy"],
        ResourceType::Bucket => &[
            "BucketName",
            "BucketEncryption",
            "OwnershipControls",
            "PublicAccessBlockConfiguration",
            "AccessControl",
            "LoggingConfiguration",
            "Tags",
        ],
        ResourceType::BucketPolicy => &["Bucket", "PolicyDocument"],
        ResourceType::LogGroup => &["RetentionInDays"],
        ResourceType::Role => &["AssumeRolePolicyDocument", "Policies"],
        ResourceType::Trail => &[
            "IsLogging",
            "S3BucketName",
            "KMSKeyId",
            "IsMultiRegionTrail",
            "IncludeGlobalServiceEvents",
            "EnableLogFileValidation",
            "EventSelectors",
            "InsightSelectors",
            "CloudWatchLogsLogGroupArn",
            "CloudWatchLogsRoleArn",
        ],
        ResourceType::CatalogEncryptionSettings => &["CatalogId", "DataCatalogEncryptionSettings"],
        ResourceType::DataLakeSettings => &[
            "Admins",
            "Parameters",
            "MutationType",
            "CreateDatabaseDefaultPermissions",
            "CreateTableDefaultPermissions",
        ],
        ResourceType::RegisteredLocation => &["ResourceArn", "UseServiceLinkedRole", "HybridAccessEnabled", "RoleArn"],
        ResourceType::Database => &["CatalogId", "DatabaseInput"],
        ResourceType::Table => &["CatalogId", "DatabaseName", "TableInput"],
        ResourceType::Permissions => &[
            "DataLakePrincipal",
            "Resource",
            "Permissions",
            "PermissionsWithGrantOption",
        ],
        ResourceType::WorkGroup => &["Name", "WorkGroupConfiguration", "RecursiveDeleteOption"],
    }
}

/// Build a JSON patch from the current model to the desired properties
///
/// Changed or new properties are replaced; managed properties that the
/// desired state no longer carries are removed.
fn patch_document(resource_type: ResourceType, current: &Value, desired: &Value) -> Option<String> {
    let desired = desired.as_object()?;
    let mut ops: Vec<Value> = desired
        .iter()
        .filter(|(key, value)| current.get(key.as_str()) != Some(*value))
        .map(|(key, value)| json!({ "op": "add", "path": format!("/{key}"), "value": value }))
        .collect();
    if let Some(current) = current.as_object() {
        ops.extend(
            managed_properties(resource_type)
                .iter()
                .filter(|key| current.contains_key(**key) && !desired.contains_key(**key))
                .map(|key| json!({ "op": "remove", "path": format!("/{key}") })),
        );
    }
    if ops.is_empty() {
        None
    } else {
        Some(Value::Array(ops).to_string())
    }
}

/// AWS Cloud Control API backend
pub struct CloudControlPlane {
    client: CloudControlClient,
    s3: S3Client,
    region: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl std::fmt::Debug for CloudControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudControlPlane")
            .field("region", &self.region)
            .field("poll_interval", &self.poll_interval)
            .field("max_polls", &self.max_polls)
            .finish_non_exhaustive()
    }
}

impl CloudControlPlane {
    /// Create clients using the default credential chain
    pub async fn new(region: &str, config: &ProvisionerConfig) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;

        Self {
            client: CloudControlClient::new(&sdk_config),
            s3: S3Client::new(&sdk_config),
            region: region.to_string(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls,
        }
    }

    /// Poll a request token until the operation settles
    async fn wait_for(&self, event: Option<&ProgressEvent>) -> Result<ProgressEvent, ControlPlaneError> {
        let mut event = event
            .cloned()
            .ok_or_else(|| ControlPlaneError::Rejected("response carried no progress event".to_string()))?;

        for _ in 0..self.max_polls {
            match event.operation_status() {
                Some(OperationStatus::Success) => return Ok(event),
                Some(OperationStatus::Failed) => return Err(handler_error(&event)),
                Some(OperationStatus::CancelComplete) => {
                    return Err(ControlPlaneError::Rejected("operation was cancelled".to_string()))
                }
                _ => {}
            }
            let token = event
                .request_token()
                .ok_or_else(|| ControlPlaneError::Rejected("progress event carried no request token".to_string()))?
                .to_string();
            tokio::time::sleep(self.poll_interval).await;
            let status = self
                .client
                .get_resource_request_status()
                .request_token(&token)
                .send()
                .await
                .map_err(|e| sdk_error(&e))?;
            event = status
                .progress_event()
                .cloned()
                .ok_or_else(|| ControlPlaneError::Rejected(format!("request {token} has no status")))?;
        }

        Err(ControlPlaneError::Transient(format!(
            "operation did not settle after {} polls",
            self.max_polls
        )))
    }

    async fn current_properties(&self, type_name: &str, identifier: &str) -> Result<Value, ControlPlaneError> {
        let output = self
            .client
            .get_resource()
            .type_name(type_name)
            .identifier(identifier)
            .send()
            .await
            .map_err(|e| sdk_error(&e))?;
        let properties = output
            .resource_description()
            .and_then(|d| d.properties())
            .unwrap_or("{}");
        serde_json::from_str(properties)
            .map_err(|e| ControlPlaneError::Rejected(format!("unreadable resource properties: {e}")))
    }

    fn arn_of(resource_type: ResourceType, properties: &Value) -> Option<String> {
        if !resource_type.has_arn() {
            return None;
        }
        properties.get("Arn").and_then(Value::as_str).map(str::to_string)
    }

    /// Delete every object in a bucket
    async fn purge_bucket(&self, bucket: &str) -> Result<usize, ControlPlaneError> {
        let mut deleted = 0usize;
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .s3
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| sdk_error(&e))?;

            let objects = page
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ControlPlaneError::Rejected(e.to_string()))?;

            if !objects.is_empty() {
                deleted += objects.len();
                let delete = Delete::builder()
                    .set_objects(Some(objects))
                    .quiet(true)
                    .build()
                    .map_err(|e| ControlPlaneError::Rejected(e.to_string()))?;
                self.s3
                    .delete_objects()
                    .bucket(bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| sdk_error(&e))?;
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl ControlPlane for CloudControlPlane {
    fn name(&self) -> &'static str {
        "cloud-control"
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, ControlPlaneError> {
        let type_name = request.resource_type.as_str();
        let span = info_span!(
            "cloudcontrol.apply",
            logical_id = %request.logical_id,
            resource_type = type_name,
            region = %self.region
        );

        async move {
            let (identifier, action) = if let Some(physical_id) = &request.physical_id {
                let current = self.current_properties(type_name, physical_id).await?;
                let Some(patch) = patch_document(request.resource_type, &current, &request.properties) else {
                    debug!("Resource {} unchanged, skipping update", request.logical_id);
                    return Ok(ApplyOutcome {
                        physical_id: physical_id.clone(),
                        arn: Self::arn_of(request.resource_type, &current),
                        action: ApplyAction::Unchanged,
                    });
                };
                info!("Updating {} {}", type_name, request.logical_id);
                let output = self
                    .client
                    .update_resource()
                    .type_name(type_name)
                    .identifier(physical_id)
                    .patch_document(patch)
                    .client_token(&request.client_token)
                    .send()
                    .await
                    .map_err(|e| sdk_error(&e))?;
                self.wait_for(output.progress_event()).await?;
                (physical_id.clone(), ApplyAction::Updated)
            } else {
                info!("Creating {} {}", type_name, request.logical_id);
                let output = self
                    .client
                    .create_resource()
                    .type_name(type_name)
                    .desired_state(request.properties.to_string())
                    .client_token(&request.client_token)
                    .send()
                    .await
                    .map_err(|e| sdk_error(&e))?;
                let event = self.wait_for(output.progress_event()).await?;
                let identifier = event
                    .identifier()
                    .ok_or_else(|| ControlPlaneError::Rejected("create returned no identifier".to_string()))?
                    .to_string();
                (identifier, ApplyAction::Created)
            };

            let arn = if request.resource_type.has_arn() {
                let current = self.current_properties(type_name, &identifier).await?;
                Self::arn_of(request.resource_type, &current)
            } else {
                None
            };

            Ok(ApplyOutcome {
                physical_id: identifier,
                arn,
                action,
            })
        }
        .instrument(span)
        .await
    }

    async fn delete(&self, request: &DeleteRequest) -> Result<(), ControlPlaneError> {
        let type_name = request.resource_type.as_str();
        let span = info_span!(
            "cloudcontrol.delete",
            logical_id = %request.logical_id,
            resource_type = type_name,
            region = %self.region
        );

        async move {
            if request.purge_objects && request.resource_type == ResourceType::Bucket {
                let deleted = self.purge_bucket(&request.physical_id).await?;
                info!("Emptied bucket {} ({} objects)", request.physical_id, deleted);
            }
            info!("Deleting {} {}", type_name, request.logical_id);
            let output = self
                .client
                .delete_resource()
                .type_name(type_name)
                .identifier(&request.physical_id)
                .client_token(&request.client_token)
                .send()
                .await
                .map_err(|e| sdk_error(&e))?;
            self.wait_for(output.progress_event()).await?;
            Ok(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_is_transient() {
        assert!(classify(Some("Throttling"), "Rate exceeded").is_transient());
        assert!(classify(Some("ThrottlingException"), "Rate exceeded").is_transient());
    }

    #[test]
    fn access_denied_is_not_retried() {
        assert!(matches!(
            classify(Some("AccessDenied"), "not authorized to perform: kms:CreateKey"),
            ControlPlaneError::PermissionDenied(_)
        ));
    }

    #[test]
    fn propagation_delays_are_transient() {
        assert!(classify(Some("InvalidRequest"), "Invalid principal in policy").is_transient());
        assert!(matches!(
            classify(Some("InvalidRequest"), "Property BucketName is invalid"),
            ControlPlaneError::Rejected(_)
        ));
    }

    #[test]
    fn patch_only_touches_changed_properties() {
        let current = json!({"Name": "ReadOnly", "RecursiveDeleteOption": false, "Arn": "x"});
        let desired = json!({"Name": "ReadOnly", "RecursiveDeleteOption": true});
        let patch: Value =
            serde_json::from_str(&patch_document(ResourceType::WorkGroup, &current, &desired).unwrap()).unwrap();
        assert_eq!(
            patch,
            json!([{ "op": "add", "path": "/RecursiveDeleteOption", "value": true }])
        );
        assert!(patch_document(ResourceType::WorkGroup, &desired, &desired).is_none());
    }

    #[test]
    fn dropped_properties_are_removed() {
        let current = json!({
            "BucketName": "logging-123456789012",
            "Tags": [{ "Key": "compliance-lake:auto-delete-objects", "Value": "true" }],
            "LoggingConfiguration": { "DestinationBucketName": "logging-123456789012" },
            "Arn": "arn:aws:s3:::logging-123456789012",
            "DomainName": "logging-123456789012.s3.amazonaws.com",
        });
        let desired = json!({ "BucketName": "logging-123456789012" });
        let patch: Value =
            serde_json::from_str(&patch_document(ResourceType::Bucket, &current, &desired).unwrap()).unwrap();
        assert_eq!(
            patch,
            json!([
                { "op": "remove", "path": "/LoggingConfiguration" },
                { "op": "remove", "path": "/Tags" },
            ])
        );
    }
}
