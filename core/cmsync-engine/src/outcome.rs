//! Run outcomes and the error collector shared by the batch operators.

use chrono::{DateTime, Utc};
use cmsync_types::{RemoteId, RunId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Where in a run an issue occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStage {
    Setup,
    Validate,
    Fetch,
    Create,
    Update,
    Delete,
    Publish,
    Reference,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Setup => "setup",
            SyncStage::Validate => "validate",
            SyncStage::Fetch => "fetch",
            SyncStage::Create => "create",
            SyncStage::Update => "update",
            SyncStage::Delete => "delete",
            SyncStage::Publish => "publish",
            SyncStage::Reference => "reference",
        };
        f.write_str(name)
    }
}

/// One recorded failure or warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub stage: SyncStage,
    pub message: String,
    /// External or remote id of the affected entity, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl SyncIssue {
    pub fn new(stage: SyncStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            entity_id: None,
        }
    }

    #[must_use]
    pub fn for_entity(mut self, entity_id: impl fmt::Display) -> Self {
        self.entity_id = Some(entity_id.to_string());
        self
    }
}

impl fmt::Display for SyncIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity_id {
            Some(id) => write!(f, "[{}] {} ({})", self.stage, self.message, id),
            None => write!(f, "[{}] {}", self.stage, self.message),
        }
    }
}

/// Collects errors and warnings during a run. Batch operators append here
/// instead of returning early, so one failed chunk never aborts its
/// siblings.
#[derive(Debug, Clone, Default)]
pub struct IssueLog {
    errors: Vec<SyncIssue>,
    warnings: Vec<SyncIssue>,
}

impl IssueLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, issue: SyncIssue) {
        self.errors.push(issue);
    }

    pub fn warn(&mut self, issue: SyncIssue) {
        self.warnings.push(issue);
    }

    pub fn errors(&self) -> &[SyncIssue] {
        &self.errors
    }

    pub fn warnings(&self) -> &[SyncIssue] {
        &self.warnings
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn into_parts(self) -> (Vec<SyncIssue>, Vec<SyncIssue>) {
        (self.errors, self.warnings)
    }
}

/// Result of one collection sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Plan key of the collection.
    pub collection: String,
    pub run_id: RunId,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub published: usize,
    /// Items in dependent collections whose references to deleted items
    /// were stripped.
    #[serde(default)]
    pub references_updated: usize,
    pub errors: Vec<SyncIssue>,
    /// Non-blocking conditions, such as publishing skipped on a site that
    /// was never published.
    pub warnings: Vec<SyncIssue>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncOutcome {
    /// An outcome for a run aborted by a fatal pre-condition.
    pub fn fatal(
        collection: impl Into<String>,
        run_id: RunId,
        started_at: DateTime<Utc>,
        issue: SyncIssue,
    ) -> Self {
        Self {
            collection: collection.into(),
            run_id,
            created: 0,
            updated: 0,
            deleted: 0,
            published: 0,
            references_updated: 0,
            errors: vec![issue],
            warnings: Vec::new(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// True if the run changed nothing remotely (publishing aside).
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Result of removing dangling references from one referencing collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCleanupOutcome {
    /// Items whose reference fields were patched.
    pub updated: usize,
    pub errors: Vec<SyncIssue>,
    /// Ids that are still referenced by an item that could not be patched.
    /// Deleting them would violate referential integrity.
    pub unsafe_ids: BTreeSet<RemoteId>,
}

/// Result of an orphan cleanup of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOutcome {
    pub collection: String,
    pub run_id: RunId,
    pub deleted: usize,
    /// Items in dependent collections whose references were stripped.
    pub references_updated: usize,
    /// Orphans left in place because a referrer could not be patched.
    pub skipped: usize,
    pub errors: Vec<SyncIssue>,
    pub warnings: Vec<SyncIssue>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CleanupOutcome {
    pub fn fatal(
        collection: impl Into<String>,
        run_id: RunId,
        started_at: DateTime<Utc>,
        issue: SyncIssue,
    ) -> Self {
        Self {
            collection: collection.into(),
            run_id,
            deleted: 0,
            references_updated: 0,
            skipped: 0,
            errors: vec![issue],
            warnings: Vec::new(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
