//! Reference Cleaner.
//!
//! Strips remote ids that are about to be deleted from the reference fields
//! of a referencing collection. Patches go straight to the live site so a
//! dangling reference is never published, and they must land before the
//! referenced items are deleted: the CMS refuses to delete an item that is
//! still referenced.

use crate::batch::{BatchOperator, ItemUpdate};
use crate::cms::CmsApi;
use crate::outcome::{IssueLog, ReferenceCleanupOutcome, SyncIssue, SyncStage};
use crate::reader::RemoteStateReader;
use crate::scheduler::Scheduler;
use cmsync_types::{
    CollectionId, FieldData, LocaleId, Multiplicity, ReferenceDescriptor, RemoteId, RemoteRow,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Returns the patch that removes every id of `doomed` from `row`'s
/// reference fields, or `None` if the row holds none of them.
pub fn strip_row(
    row: &RemoteRow,
    descriptors: &[ReferenceDescriptor],
    doomed: &BTreeSet<RemoteId>,
) -> Option<FieldData> {
    let mut patch = FieldData::new();

    for descriptor in descriptors {
        match descriptor.multiplicity {
            Multiplicity::Single => {
                if row
                    .field_data
                    .reference(&descriptor.field_key)
                    .is_some_and(|id| doomed.contains(&id))
                {
                    patch.set(descriptor.field_key.clone(), Value::Null);
                }
            }
            Multiplicity::Multiple => {
                let current = row.field_data.references(&descriptor.field_key);
                let kept: Vec<Value> = current
                    .iter()
                    .filter(|id| !doomed.contains(*id))
                    .map(|id| Value::String(id.to_string()))
                    .collect();
                if kept.len() != current.len() {
                    patch.set(descriptor.field_key.clone(), Value::Array(kept));
                }
            }
        }
    }

    (!patch.is_empty()).then_some(patch)
}

/// Removes dangling references from one collection.
pub struct ReferenceCleaner<'a> {
    api: &'a dyn CmsApi,
    scheduler: &'a Scheduler,
    page_size: usize,
    max_items: usize,
}

impl<'a> ReferenceCleaner<'a> {
    pub fn new(api: &'a dyn CmsApi, scheduler: &'a Scheduler, page_size: usize, max_items: usize) -> Self {
        Self {
            api,
            scheduler,
            page_size,
            max_items,
        }
    }

    /// Scans every item of `referencing` in all `locale_ids`, and for each
    /// descriptor filters (multiple) or nulls (single) references to any id
    /// in `ids_being_deleted`. Changed items are pushed live in batched
    /// calls; unchanged items are skipped.
    ///
    /// Ids still referenced by an item whose patch failed are returned in
    /// `unsafe_ids`. If the scan itself fails, every id is unsafe.
    pub async fn remove_references(
        &self,
        referencing: &CollectionId,
        locale_ids: &[LocaleId],
        descriptors: &[ReferenceDescriptor],
        ids_being_deleted: &BTreeSet<RemoteId>,
    ) -> ReferenceCleanupOutcome {
        let mut outcome = ReferenceCleanupOutcome::default();
        if ids_being_deleted.is_empty() || descriptors.is_empty() {
            return outcome;
        }

        let reader = RemoteStateReader::new(self.api, self.scheduler, self.page_size);
        let rows = match reader.read_rows(referencing, locale_ids).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(collection = %referencing, error = %e, "could not scan referencing items");
                outcome.errors.push(SyncIssue::new(
                    SyncStage::Reference,
                    format!("scan of {referencing} failed: {e}"),
                ));
                outcome.unsafe_ids = ids_being_deleted.clone();
                return outcome;
            }
        };

        // Item → (patches, ids it still points at).
        let mut changes: BTreeMap<RemoteId, (Vec<(LocaleId, FieldData)>, BTreeSet<RemoteId>)> =
            BTreeMap::new();
        for row in &rows {
            let Some(patch) = strip_row(row, descriptors, ids_being_deleted) else {
                continue;
            };
            let entry = changes.entry(row.remote_id.clone()).or_default();
            entry.1.extend(
                descriptors
                    .iter()
                    .flat_map(|d| d.referenced_ids(&row.field_data))
                    .filter(|id| ids_being_deleted.contains(id)),
            );
            entry.0.push((row.locale_id.clone(), patch));
        }

        if changes.is_empty() {
            debug!(collection = %referencing, scanned = rows.len(), "no references to strip");
            return outcome;
        }

        let mut held: BTreeMap<RemoteId, BTreeSet<RemoteId>> = BTreeMap::new();
        let updates: Vec<ItemUpdate> = changes
            .into_iter()
            .map(|(remote_id, (patches, referenced))| {
                held.insert(remote_id.clone(), referenced);
                ItemUpdate {
                    remote_id,
                    identifier: None,
                    patches,
                }
            })
            .collect();

        let mut issues = IssueLog::new();
        let operator =
            BatchOperator::new(self.api, self.scheduler, referencing, locale_ids, self.max_items);
        let report = operator.update(&updates, true, &mut issues).await;

        outcome.updated = report.succeeded;
        for failed in &report.failed {
            if let Some(referenced) = held.remove(failed) {
                outcome.unsafe_ids.extend(referenced);
            }
        }
        let (errors, _) = issues.into_parts();
        outcome.errors = errors;

        info!(
            collection = %referencing,
            updated = outcome.updated,
            unsafe_ids = outcome.unsafe_ids.len(),
            "references stripped"
        );
        outcome
    }
}
