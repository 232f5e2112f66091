//! Chunked remote operations.
//!
//! Every operator splits its input to the CMS per-request item limit, routes
//! each chunk through the [`Scheduler`], and records chunk failures in an
//! [`IssueLog`] instead of returning early. Reports only count items of
//! chunks that succeeded and list the items of chunks that did not.

use crate::cms::{CmsApi, ItemPatch, ItemTarget};
use crate::outcome::{IssueLog, SyncIssue, SyncStage};
use crate::scheduler::Scheduler;
use cmsync_types::{CollectionId, ExternalId, FieldData, LocaleId, RemoteId};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Field data for one new item.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub identifier: ExternalId,
    /// Primary-locale field data, slug included.
    pub field_data: FieldData,
}

/// Patches for every locale variant of one item that needs a change.
#[derive(Debug, Clone)]
pub struct ItemUpdate {
    pub remote_id: RemoteId,
    pub identifier: Option<ExternalId>,
    pub patches: Vec<(LocaleId, FieldData)>,
}

/// Per-item result of a batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport<T> {
    pub succeeded: usize,
    /// Items of failed chunks.
    pub failed: Vec<T>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            succeeded: 0,
            failed: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

fn join_ids<T: std::fmt::Display>(ids: impl IntoIterator<Item = T>) -> String {
    ids.into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Batch operations against one collection in every configured locale.
pub struct BatchOperator<'a> {
    api: &'a dyn CmsApi,
    scheduler: &'a Scheduler,
    collection: &'a CollectionId,
    locale_ids: &'a [LocaleId],
    max_items: usize,
    slug_field: Option<&'a str>,
    publish_blocked: AtomicBool,
}

impl<'a> BatchOperator<'a> {
    pub fn new(
        api: &'a dyn CmsApi,
        scheduler: &'a Scheduler,
        collection: &'a CollectionId,
        locale_ids: &'a [LocaleId],
        max_items: usize,
    ) -> Self {
        Self {
            api,
            scheduler,
            collection,
            locale_ids,
            max_items: max_items.max(1),
            slug_field: None,
            publish_blocked: AtomicBool::new(false),
        }
    }

    /// Field stripped from every update patch.
    #[must_use]
    pub fn with_slug_field(mut self, slug_field: &'a str) -> Self {
        self.slug_field = Some(slug_field);
        self
    }

    /// Logical items per update request: each item expands to one entry
    /// per locale.
    pub fn update_chunk_size(&self) -> usize {
        (self.max_items / self.locale_ids.len().max(1)).max(1)
    }

    /// Whether publishing was switched off by a soft conflict.
    pub fn publish_blocked(&self) -> bool {
        self.publish_blocked.load(Ordering::Relaxed)
    }

    /// Double delete: unpublish from every locale, then delete from every
    /// locale. Both calls name the locales explicitly; left out, the CMS
    /// only touches the primary locale and leaves the other variants behind.
    ///
    /// The delete phase runs even when the unpublish phase fails.
    pub async fn delete(&self, ids: &[RemoteId], issues: &mut IssueLog) -> BatchReport<RemoteId> {
        let mut report = BatchReport::default();

        for chunk in ids.chunks(self.max_items) {
            let targets: Vec<ItemTarget> = chunk
                .iter()
                .map(|id| ItemTarget::new(id.clone(), self.locale_ids))
                .collect();

            match self
                .scheduler
                .schedule(self.api.unpublish_items(self.collection, &targets))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(collection = %self.collection, items = chunk.len(), "items were not live");
                }
                Err(e) => {
                    warn!(collection = %self.collection, error = %e, "unpublish failed");
                    issues.error(
                        SyncIssue::new(SyncStage::Delete, format!("unpublish failed: {e}"))
                            .for_entity(join_ids(chunk)),
                    );
                }
            }

            match self
                .scheduler
                .schedule(self.api.delete_items(self.collection, &targets))
                .await
            {
                Ok(()) => {
                    report.succeeded += chunk.len();
                    debug!(collection = %self.collection, items = chunk.len(), "deleted chunk");
                }
                Err(e) => {
                    warn!(collection = %self.collection, error = %e, "delete failed");
                    issues.error(
                        SyncIssue::new(SyncStage::Delete, format!("delete failed: {e}"))
                            .for_entity(join_ids(chunk)),
                    );
                    report.failed.extend(chunk.iter().cloned());
                }
            }
        }

        if !ids.is_empty() {
            info!(collection = %self.collection, requested = ids.len(), deleted = report.succeeded, "delete finished");
        }
        report
    }

    /// Creates items with primary-locale content. The CMS instantiates every
    /// locale of the set under one new remote id; secondary content is
    /// written by the update phase.
    pub async fn create(&self, items: &[NewItem], issues: &mut IssueLog) -> BatchReport<ExternalId> {
        let mut report = BatchReport::default();

        for chunk in items.chunks(self.max_items) {
            let rows: Vec<FieldData> = chunk.iter().map(|i| i.field_data.clone()).collect();
            match self
                .scheduler
                .schedule(self.api.create_items(self.collection, self.locale_ids, &rows))
                .await
            {
                Ok(_) => {
                    report.succeeded += chunk.len();
                    debug!(collection = %self.collection, items = chunk.len(), "created chunk");
                }
                Err(e) => {
                    warn!(collection = %self.collection, error = %e, "create failed");
                    issues.error(
                        SyncIssue::new(SyncStage::Create, format!("create failed: {e}"))
                            .for_entity(join_ids(chunk.iter().map(|i| &i.identifier))),
                    );
                    report.failed.extend(chunk.iter().map(|i| i.identifier.clone()));
                }
            }
        }

        if !items.is_empty() {
            info!(collection = %self.collection, requested = items.len(), created = report.succeeded, "create finished");
        }
        report
    }

    /// Patches locale variants, one entry per (item, locale).
    ///
    /// The slug field is removed from every patch: the CMS checks slug
    /// uniqueness across the whole request, so the same slug on two locale
    /// variants of one item is rejected.
    pub async fn update(
        &self,
        items: &[ItemUpdate],
        live: bool,
        issues: &mut IssueLog,
    ) -> BatchReport<RemoteId> {
        let stage = if live {
            SyncStage::Reference
        } else {
            SyncStage::Update
        };
        let mut report = BatchReport::default();

        for chunk in items.chunks(self.update_chunk_size()) {
            let patches: Vec<ItemPatch> = chunk
                .iter()
                .flat_map(|item| {
                    item.patches.iter().map(|(locale_id, data)| {
                        let mut field_data = data.clone();
                        if let Some(slug) = self.slug_field {
                            field_data.remove(slug);
                        }
                        ItemPatch {
                            remote_id: item.remote_id.clone(),
                            locale_id: locale_id.clone(),
                            field_data,
                        }
                    })
                })
                .collect();
            if patches.is_empty() {
                continue;
            }

            match self
                .scheduler
                .schedule(self.api.update_items(self.collection, &patches, live))
                .await
            {
                Ok(()) => {
                    report.succeeded += chunk.len();
                    debug!(collection = %self.collection, items = chunk.len(), entries = patches.len(), live, "updated chunk");
                }
                Err(e) => {
                    warn!(collection = %self.collection, error = %e, live, "update failed");
                    let ids = chunk.iter().map(|i| match &i.identifier {
                        Some(identifier) => identifier.to_string(),
                        None => i.remote_id.to_string(),
                    });
                    issues.error(
                        SyncIssue::new(stage, format!("update failed: {e}")).for_entity(join_ids(ids)),
                    );
                    report.failed.extend(chunk.iter().map(|i| i.remote_id.clone()));
                }
            }
        }

        if !items.is_empty() {
            info!(collection = %self.collection, requested = items.len(), updated = report.succeeded, live, "update finished");
        }
        report
    }

    /// Publishes items in every locale.
    ///
    /// A conflict means the site was never published. That is expected on a
    /// fresh site: a warning is recorded and publishing is skipped for the
    /// rest of this operator's run. Staged content stays correct.
    pub async fn publish(&self, ids: &BTreeSet<RemoteId>, issues: &mut IssueLog) -> usize {
        if self.publish_blocked() || ids.is_empty() {
            return 0;
        }

        let ids: Vec<&RemoteId> = ids.iter().collect();
        let mut published = 0;

        for chunk in ids.chunks(self.max_items) {
            let targets: Vec<ItemTarget> = chunk
                .iter()
                .map(|id| ItemTarget::new((*id).clone(), self.locale_ids))
                .collect();
            match self
                .scheduler
                .schedule(self.api.publish_items(self.collection, &targets))
                .await
            {
                Ok(count) => published += count,
                Err(e) if e.is_conflict() => {
                    self.publish_blocked.store(true, Ordering::Relaxed);
                    warn!(collection = %self.collection, "site has never been published; skipping publish");
                    issues.warn(SyncIssue::new(
                        SyncStage::Publish,
                        format!("publishing skipped, the site has never been published: {e}"),
                    ));
                    break;
                }
                Err(e) => {
                    warn!(collection = %self.collection, error = %e, "publish failed");
                    issues.error(
                        SyncIssue::new(SyncStage::Publish, format!("publish failed: {e}"))
                            .for_entity(join_ids(chunk.iter())),
                    );
                }
            }
        }

        info!(collection = %self.collection, requested = ids.len(), published, "publish finished");
        published
    }
}
