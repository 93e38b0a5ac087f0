//! # Apply Engine
//!
//! Materializes a [`ResourceGraph`] against a [`ControlPlane`].
//!
//! The graph is planned once into dependency waves. Each wave is rendered in
//! full before any of it reaches the control plane, so a resource whose
//! dependencies did not resolve stops the apply without a partially
//! configured sibling. Resources inside a wave are applied concurrently, up
//! to `max_concurrent_applies` at a time.
//!
//! Only transient control-plane failures are retried, with bounded
//! exponential backoff. Everything else aborts the apply once the wave's
//! in-flight operations have settled. Resources that were already applied
//! stay in place and in the deployment state.

pub mod backoff;
pub mod report;

pub use report::{ApplyReport, ReportEntry, ResourceAction};

use crate::config::ProvisionerConfig;
use crate::control_plane::{
    client_token, fingerprint, ApplyOutcome, ApplyRequest, ControlPlane, ControlPlaneError, DeleteRequest,
    DeployedResource, DeploymentState,
};
use crate::error::{ProvisionError, Result};
use crate::graph::{Node, ResolvedResource, ResourceGraph, ResourceSpec};
use crate::model::{LogicalId, RemovalPolicy, ResourceType};
use crate::observability::metrics;
use backoff::ExponentialBackoff;
use chrono::Utc;
use futures::{stream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Shared flag that stops an apply before its next wave
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A change an apply would make
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedChange {
    pub logical_id: LogicalId,
    pub resource_type: ResourceType,
    pub action: ResourceAction,
}

/// Compare a graph with deployment state without touching the control plane
///
/// Resources whose properties cannot be rendered yet because a dependency is
/// still missing from state are reported as updates.
pub fn preview(graph: &ResourceGraph, state: &DeploymentState) -> Result<Vec<PlannedChange>> {
    let plan = graph.plan()?;
    let outputs = state.outputs();
    let mut changes = Vec::with_capacity(plan.len());

    for id in plan.order() {
        let node = declared(graph, id)?;
        let action = match state.get(id).filter(|d| d.resource_type == node.resource_type()) {
            None => ResourceAction::Created,
            Some(deployed) => match node.render(graph.env(), &outputs) {
                Ok(props) if fingerprint(&props) == deployed.fingerprint => ResourceAction::Unchanged,
                Ok(_) | Err(ProvisionError::UnresolvedDependency { .. }) => ResourceAction::Updated,
                Err(e) => return Err(e),
            },
        };
        changes.push(PlannedChange {
            logical_id: id.clone(),
            resource_type: node.resource_type(),
            action,
        });
    }

    for (id, deployed) in orphans(graph, state) {
        changes.push(PlannedChange {
            logical_id: id,
            resource_type: deployed.resource_type,
            action: match deployed.removal_policy {
                RemovalPolicy::Destroy => ResourceAction::Deleted,
                RemovalPolicy::Retain => ResourceAction::Retained,
            },
        });
    }
    Ok(changes)
}

fn declared<'g>(graph: &'g ResourceGraph, id: &LogicalId) -> Result<&'g Node> {
    graph
        .node(id)
        .ok_or_else(|| ProvisionError::invalid(id, "planned resource is not declared"))
}

/// Resources in state that the graph no longer declares, dependents first
///
/// Ordering follows the dependencies recorded at apply time. Recorded cycles
/// cannot come from a planned graph; if one shows up the rest is taken as is.
fn orphans(graph: &ResourceGraph, state: &DeploymentState) -> Vec<(LogicalId, DeployedResource)> {
    let mut remaining: BTreeMap<LogicalId, DeployedResource> = state
        .iter()
        .filter(|(id, _)| !graph.contains(id))
        .map(|(id, d)| (id.clone(), d.clone()))
        .collect();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready: Vec<LogicalId> = remaining
            .keys()
            .filter(|id| !remaining.values().any(|d| d.depends_on.contains(id)))
            .cloned()
            .collect();
        let batch = if ready.is_empty() {
            remaining.keys().cloned().collect()
        } else {
            ready
        };
        for id in batch {
            if let Some(deployed) = remaining.remove(&id) {
                ordered.push((id, deployed));
            }
        }
    }
    ordered
}

fn purge_on_delete(node: &Node) -> bool {
    matches!(&node.spec, ResourceSpec::Bucket(bucket) if bucket.auto_delete_objects)
}

/// Applies and destroys resource graphs
pub struct Provisioner {
    control_plane: Arc<dyn ControlPlane>,
    config: ProvisionerConfig,
    cancel: CancelHandle,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("backend", &self.control_plane.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    #[must_use]
    pub fn new(control_plane: Arc<dyn ControlPlane>, config: ProvisionerConfig) -> Self {
        Self {
            control_plane,
            config,
            cancel: CancelHandle::default(),
        }
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Apply every declared resource in dependency order
    ///
    /// Successfully applied resources are recorded in `state` even when the
    /// apply fails, so the caller can persist them.
    pub async fn apply(&self, graph: &ResourceGraph, state: &mut DeploymentState) -> Result<ApplyReport> {
        let span = info_span!(
            "engine.apply",
            backend = self.control_plane.name(),
            resources = graph.len()
        );
        let start = Instant::now();
        metrics::increment_applies();

        let result = self.apply_graph(graph, state).instrument(span).await;

        metrics::observe_apply_duration(start.elapsed().as_secs_f64());
        metrics::set_resources_managed(i64::try_from(state.len()).unwrap_or(i64::MAX));
        match &result {
            Ok(report) => info!(
                run_id = %report.run_id,
                changes = report.changes().count(),
                duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Apply complete"
            ),
            Err(e) => {
                metrics::increment_apply_errors(e.kind());
                error!(error = %e, kind = e.kind(), "Apply failed");
            }
        }
        result
    }

    async fn apply_graph(&self, graph: &ResourceGraph, state: &mut DeploymentState) -> Result<ApplyReport> {
        let plan = graph.plan()?;
        let mut outputs = state.outputs();
        let mut report = ApplyReport::start();
        let run_id = report.run_id.to_string();
        let mut applied = 0usize;
        info!(
            run_id = %report.run_id,
            waves = plan.waves.len(),
            resources = plan.len(),
            "Applying resource graph"
        );

        for (wave_index, wave) in plan.waves.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(applied, wave = wave_index, "Apply cancelled");
                return Err(ProvisionError::Cancelled { applied });
            }

            let mut pending = Vec::with_capacity(wave.len());
            for id in wave {
                let node = declared(graph, id)?;
                let resource_type = node.resource_type();
                let properties = node.render(graph.env(), &outputs)?;
                let digest = fingerprint(&properties);
                let previous = state.get(id).filter(|d| d.resource_type == resource_type);

                if let Some(deployed) =
                    previous.filter(|d| d.fingerprint == digest && !d.physical_id.is_empty())
                {
                    debug!(logical_id = %id, "Resource unchanged, skipping");
                    metrics::record_resource_operation(resource_type.as_str(), "no_change", 0.0);
                    report.push(
                        id.clone(),
                        resource_type,
                        Some(deployed.physical_id.clone()),
                        ResourceAction::Unchanged,
                    );
                    continue;
                }

                let physical_id = previous
                    .map(|d| d.physical_id.clone())
                    .filter(|p| !p.is_empty());
                let action = if physical_id.is_some() { "update" } else { "create" };
                let request = ApplyRequest {
                    logical_id: id.clone(),
                    resource_type,
                    properties,
                    physical_id,
                    client_token: client_token(&run_id, id, action, &digest),
                };
                pending.push((node, request, digest));
            }

            debug!(wave = wave_index, operations = pending.len(), "Applying wave");
            let mut results: Vec<_> = stream::iter(pending.into_iter().enumerate())
                .map(|(index, (node, request, digest))| async move {
                    let result = self.apply_resource(&request).await;
                    (index, node, request, digest, result)
                })
                .buffer_unordered(self.config.max_concurrent_applies.max(1))
                .collect()
                .await;
            results.sort_by_key(|r| r.0);

            let mut failure = None;
            for (_, node, request, digest, result) in results {
                match result {
                    Ok(outcome) => {
                        applied += 1;
                        outputs.insert(
                            request.logical_id.clone(),
                            ResolvedResource {
                                physical_id: outcome.physical_id.clone(),
                                arn: outcome.arn.clone(),
                            },
                        );
                        state.record(
                            request.logical_id.clone(),
                            DeployedResource {
                                resource_type: request.resource_type,
                                physical_id: outcome.physical_id.clone(),
                                arn: outcome.arn,
                                fingerprint: digest,
                                removal_policy: node.removal_policy,
                                purge_on_delete: purge_on_delete(node),
                                depends_on: node.dependencies().into_iter().collect(),
                                applied_at: Utc::now(),
                            },
                        );
                        report.push(
                            request.logical_id,
                            request.resource_type,
                            Some(outcome.physical_id),
                            outcome.action.into(),
                        );
                    }
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }
        }

        self.remove_orphans(graph, state, &mut report).await?;
        report.finish();
        Ok(report)
    }

    /// Delete every declared resource in reverse dependency order
    ///
    /// Resources with a retain removal policy are dropped from state but left
    /// in the cloud.
    pub async fn destroy(&self, graph: &ResourceGraph, state: &mut DeploymentState) -> Result<ApplyReport> {
        let span = info_span!("engine.destroy", backend = self.control_plane.name());
        let result = self.destroy_graph(graph, state).instrument(span).await;
        metrics::set_resources_managed(i64::try_from(state.len()).unwrap_or(i64::MAX));
        if let Err(e) = &result {
            metrics::increment_apply_errors(e.kind());
            error!(error = %e, kind = e.kind(), "Destroy failed");
        }
        result
    }

    async fn destroy_graph(&self, graph: &ResourceGraph, state: &mut DeploymentState) -> Result<ApplyReport> {
        let plan = graph.plan()?;
        let mut report = ApplyReport::start();
        self.remove_orphans(graph, state, &mut report).await?;

        for wave in plan.waves.iter().rev() {
            if self.cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled {
                    applied: report.count(ResourceAction::Deleted),
                });
            }

            let mut requests = Vec::new();
            for id in wave {
                let node = declared(graph, id)?;
                let Some(deployed) = state.get(id).cloned() else {
                    continue;
                };
                if node.removal_policy == RemovalPolicy::Retain {
                    info!(logical_id = %id, "Retaining resource");
                    state.remove(id);
                    report.push(id.clone(), deployed.resource_type, Some(deployed.physical_id), ResourceAction::Retained);
                    continue;
                }
                requests.push(DeleteRequest {
                    logical_id: id.clone(),
                    resource_type: deployed.resource_type,
                    physical_id: deployed.physical_id,
                    purge_objects: purge_on_delete(node),
                    client_token: client_token(&report.run_id.to_string(), id, "delete", &deployed.fingerprint),
                });
            }

            let failure = self.delete_all(requests, state, &mut report).await;
            if let Some(e) = failure {
                return Err(e);
            }
        }

        report.finish();
        Ok(report)
    }

    /// Delete resources the graph no longer declares
    async fn remove_orphans(
        &self,
        graph: &ResourceGraph,
        state: &mut DeploymentState,
        report: &mut ApplyReport,
    ) -> Result<()> {
        for (id, deployed) in orphans(graph, state) {
            if deployed.removal_policy == RemovalPolicy::Retain {
                info!(logical_id = %id, "Forgetting retained resource no longer declared");
                state.remove(&id);
                report.push(id, deployed.resource_type, Some(deployed.physical_id), ResourceAction::Retained);
                continue;
            }
            info!(logical_id = %id, resource_type = %deployed.resource_type, "Deleting resource no longer declared");
            let request = DeleteRequest {
                client_token: client_token(&report.run_id.to_string(), &id, "delete", &deployed.fingerprint),
                logical_id: id,
                resource_type: deployed.resource_type,
                physical_id: deployed.physical_id,
                purge_objects: deployed.purge_on_delete,
            };
            if let Some(e) = self.delete_all(vec![request], state, report).await {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Delete a batch concurrently; returns the first failure in batch order
    async fn delete_all(
        &self,
        requests: Vec<DeleteRequest>,
        state: &mut DeploymentState,
        report: &mut ApplyReport,
    ) -> Option<ProvisionError> {
        let mut results: Vec<_> = stream::iter(requests.into_iter().enumerate())
            .map(|(index, request)| async move {
                let result = self.delete_resource(&request).await;
                (index, request, result)
            })
            .buffer_unordered(self.config.max_concurrent_applies.max(1))
            .collect()
            .await;
        results.sort_by_key(|r| r.0);

        let mut failure = None;
        for (_, request, result) in results {
            match result {
                Ok(()) => {
                    state.remove(&request.logical_id);
                    report.push(
                        request.logical_id,
                        request.resource_type,
                        Some(request.physical_id),
                        ResourceAction::Deleted,
                    );
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        failure
    }

    async fn apply_resource(&self, request: &ApplyRequest) -> Result<ApplyOutcome> {
        let span = info_span!(
            "resource.apply",
            logical_id = %request.logical_id,
            resource_type = %request.resource_type
        );
        let start = Instant::now();
        let outcome = self
            .with_retry(&request.logical_id, request.resource_type, move || {
                self.control_plane.apply(request)
            })
            .instrument(span)
            .await?;
        metrics::record_resource_operation(
            request.resource_type.as_str(),
            outcome.action.as_str(),
            start.elapsed().as_secs_f64(),
        );
        info!(
            logical_id = %request.logical_id,
            physical_id = %outcome.physical_id,
            action = %outcome.action,
            "Applied resource"
        );
        Ok(outcome)
    }

    async fn delete_resource(&self, request: &DeleteRequest) -> Result<()> {
        let span = info_span!(
            "resource.delete",
            logical_id = %request.logical_id,
            resource_type = %request.resource_type
        );
        let start = Instant::now();
        let existed = self
            .with_retry(&request.logical_id, request.resource_type, move || async move {
                match self.control_plane.delete(request).await {
                    Ok(()) => Ok(true),
                    Err(ControlPlaneError::NotFound(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .instrument(span)
            .await?;
        if !existed {
            debug!(logical_id = %request.logical_id, "Resource already gone");
        }
        metrics::record_resource_operation(
            request.resource_type.as_str(),
            "delete",
            start.elapsed().as_secs_f64(),
        );
        Ok(())
    }

    async fn with_retry<T, F, Fut>(
        &self,
        logical_id: &LogicalId,
        resource_type: ResourceType,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ControlPlaneError>>,
    {
        let mut backoff = ExponentialBackoff::new(self.config.backoff_start_ms, self.config.backoff_max_ms);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff.next_backoff();
                    warn!(
                        logical_id = %logical_id,
                        resource_type = %resource_type,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient control-plane failure, retrying"
                    );
                    metrics::increment_retries(resource_type.as_str());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into_provision_error(logical_id, resource_type, attempt)),
            }
        }
    }
}
