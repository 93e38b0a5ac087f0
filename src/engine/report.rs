//! Outcome of an apply or destroy run.

use crate::control_plane::ApplyAction;
use crate::model::{LogicalId, ResourceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What happened to one resource during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    Created,
    Updated,
    Unchanged,
    Deleted,
    /// Left in place by a retain removal policy
    Retained,
}

impl ResourceAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceAction::Created => "create",
            ResourceAction::Updated => "update",
            ResourceAction::Unchanged => "no_change",
            ResourceAction::Deleted => "delete",
            ResourceAction::Retained => "retain",
        }
    }
}

impl From<ApplyAction> for ResourceAction {
    fn from(action: ApplyAction) -> Self {
        match action {
            ApplyAction::Created => ResourceAction::Created,
            ApplyAction::Updated => ResourceAction::Updated,
            ApplyAction::Unchanged => ResourceAction::Unchanged,
        }
    }
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEntry {
    pub logical_id: LogicalId,
    pub resource_type: ResourceType,
    pub physical_id: Option<String>,
    pub action: ResourceAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub entries: Vec<ReportEntry>,
}

impl ApplyReport {
    #[must_use]
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            entries: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        logical_id: LogicalId,
        resource_type: ResourceType,
        physical_id: Option<String>,
        action: ResourceAction,
    ) {
        self.entries.push(ReportEntry {
            logical_id,
            resource_type,
            physical_id,
            action,
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Entries that changed something
    pub fn changes(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|e| !matches!(e.action, ResourceAction::Unchanged | ResourceAction::Retained))
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.changes().next().is_none()
    }

    #[must_use]
    pub fn count(&self, action: ResourceAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    #[must_use]
    pub fn entry(&self, id: &LogicalId) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| &e.logical_id == id)
    }
}
