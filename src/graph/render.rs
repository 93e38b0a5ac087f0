//! # Render Context
//!
//! Resolved identifiers of already-applied resources, and the view a resource
//! spec gets of them while rendering its control-plane properties.

use crate::error::{ProvisionError, Result};
use crate::model::{Environment, LogicalId, Principal, ResolvedPrincipal, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifiers the control plane returned for an applied resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedResource {
    pub physical_id: String,
    #[serde(default)]
    pub arn: Option<String>,
}

/// Resolved identifiers keyed by logical id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Outputs(BTreeMap<LogicalId, ResolvedResource>);

impl Outputs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resolved resource; an empty physical id leaves it unresolved
    pub fn insert(&mut self, id: LogicalId, resolved: ResolvedResource) {
        if resolved.physical_id.is_empty() {
            self.0.remove(&id);
        } else {
            self.0.insert(id, resolved);
        }
    }

    #[must_use]
    pub fn get(&self, id: &LogicalId) -> Option<&ResolvedResource> {
        self.0.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &LogicalId) -> bool {
        self.0.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LogicalId, &ResolvedResource)> {
        self.0.iter()
    }
}

/// What a resource spec sees while rendering its properties
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    env: &'a Environment,
    outputs: &'a Outputs,
    logical_id: &'a LogicalId,
    resource_type: ResourceType,
}

impl<'a> RenderContext<'a> {
    #[must_use]
    pub fn new(
        env: &'a Environment,
        outputs: &'a Outputs,
        logical_id: &'a LogicalId,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            env,
            outputs,
            logical_id,
            resource_type,
        }
    }

    #[must_use]
    pub fn env(&self) -> &Environment {
        self.env
    }

    #[must_use]
    pub fn logical_id(&self) -> &LogicalId {
        self.logical_id
    }

    /// Physical id of a dependency
    pub fn physical_id(&self, id: &LogicalId) -> Result<&'a str> {
        self.outputs
            .get(id)
            .map(|r| r.physical_id.as_str())
            .ok_or_else(|| self.unresolved(id))
    }

    /// ARN of a dependency
    pub fn arn(&self, id: &LogicalId) -> Result<&'a str> {
        self.outputs
            .get(id)
            .and_then(|r| r.arn.as_deref())
            .filter(|arn| !arn.is_empty())
            .ok_or_else(|| self.unresolved(id))
    }

    pub fn resolve(&self, principal: &Principal) -> Result<ResolvedPrincipal> {
        principal.resolve(self.env)
    }

    fn unresolved(&self, missing: &LogicalId) -> ProvisionError {
        ProvisionError::UnresolvedDependency {
            logical_id: self.logical_id.clone(),
            resource_type: self.resource_type,
            missing: missing.clone(),
        }
    }
}
