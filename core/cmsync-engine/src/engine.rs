//! Reconciliation engine.
//!
//! Exposes the per-collection primitives: [`SyncEngine::sync_collection`],
//! [`SyncEngine::cleanup_collection`] and [`SyncEngine::remove_references`].
//! The engine holds no state between runs; each call re-reads the remote
//! collection and converges it on the local entity set. Sequencing
//! collections that reference each other is the caller's job.
//!
//! A sync run goes through these phases:
//!
//! 1. **Validate** the local entity set
//! 2. **Read** the remote state and categorize it
//! 3. **Delete** stale, duplicate, corrupted, incomplete and orphaned groups,
//!    stripping references to them from dependent collections first
//! 4. **Create** new and recreated entities with primary-locale content
//! 5. **Re-read** so new items are addressed by their definitive remote ids
//! 6. **Update** every locale variant whose content differs
//! 7. **Publish** everything changed in this run or still pending

use crate::batch::{BatchOperator, ItemUpdate, NewItem};
use crate::builder::FieldBuilder;
use crate::categorize::categorize;
use crate::cms::CmsApi;
use crate::config::{EngineConfig, SyncPlan};
use crate::context::{CollectionContext, SiteContext};
use crate::error::{SyncError, SyncResult};
use crate::outcome::{
    CleanupOutcome, IssueLog, ReferenceCleanupOutcome, SyncIssue, SyncOutcome, SyncStage,
};
use crate::reader::{RemoteState, RemoteStateReader};
use crate::references::ReferenceCleaner;
use crate::scheduler::Scheduler;
use chrono::Utc;
use cmsync_types::{ExternalId, FieldData, LocalEntity, LocaleId, ReferenceDescriptor, RemoteId, RunId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};

/// Checks the local entity set before anything is deleted.
///
/// An entity with a blank id, or sharing its id or slug with another entity,
/// would be skipped or mismatched; its remote group would then look like
/// an orphan and be deleted. Identifiers are read back from the CMS trimmed,
/// so an id with surrounding whitespace would never match its own item.
/// Any such problem aborts the run.
pub fn validate_entities(entities: &[LocalEntity]) -> SyncResult<()> {
    let invalid = |message: String| -> SyncResult<()> { Err(SyncError::Validation(message)) };
    let mut ids: HashSet<&ExternalId> = HashSet::new();
    let mut slugs: HashSet<&str> = HashSet::new();

    for (index, entity) in entities.iter().enumerate() {
        if entity.id.is_blank() {
            return invalid(format!("entity #{index} has an empty identifier"));
        }
        if entity.id.as_str() != entity.id.as_str().trim() {
            return invalid(format!(
                "identifier '{}' has leading or trailing whitespace",
                entity.id
            ));
        }
        if entity.slug.trim().is_empty() {
            return invalid(format!("entity '{}' has an empty slug", entity.id));
        }
        if !ids.insert(&entity.id) {
            return invalid(format!("identifier '{}' is used by more than one entity", entity.id));
        }
        if !slugs.insert(entity.slug.as_str()) {
            return invalid(format!(
                "slug '{}' is used by more than one entity (last: '{}')",
                entity.slug, entity.id
            ));
        }
    }
    Ok(())
}

/// What a guarded delete did.
#[derive(Debug, Default)]
struct DeletionReport {
    deleted: usize,
    references_updated: usize,
    /// Ids left in place: still referenced, or their delete chunk failed.
    kept: BTreeSet<RemoteId>,
    /// Ids skipped because a referrer could not be patched.
    unsafe_count: usize,
}

/// Reconciles collections of one site against a CMS.
pub struct SyncEngine {
    api: Arc<dyn CmsApi>,
    scheduler: Arc<Scheduler>,
    config: EngineConfig,
}

impl SyncEngine {
    /// Creates an engine with its own scheduler built from
    /// `config.rate_limit`.
    pub fn new(api: Arc<dyn CmsApi>, config: EngineConfig) -> Self {
        let scheduler = Arc::new(Scheduler::new(config.rate_limit));
        Self::with_scheduler(api, scheduler, config)
    }

    /// Creates an engine sharing an existing scheduler. Every engine talking
    /// to the same CMS account must share one.
    pub fn with_scheduler(api: Arc<dyn CmsApi>, scheduler: Arc<Scheduler>, config: EngineConfig) -> Self {
        Self {
            api,
            scheduler,
            config,
        }
    }

    pub fn api(&self) -> &dyn CmsApi {
        self.api.as_ref()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn reader(&self) -> RemoteStateReader<'_> {
        RemoteStateReader::new(self.api.as_ref(), &self.scheduler, self.config.page_size)
    }

    fn cleaner(&self) -> ReferenceCleaner<'_> {
        ReferenceCleaner::new(
            self.api.as_ref(),
            &self.scheduler,
            self.config.page_size,
            self.config.max_items_per_request,
        )
    }

    fn operator<'a>(&'a self, ctx: &'a CollectionContext, locale_ids: &'a [LocaleId]) -> BatchOperator<'a> {
        BatchOperator::new(
            self.api.as_ref(),
            &self.scheduler,
            &ctx.collection_id,
            locale_ids,
            self.config.max_items_per_request,
        )
        .with_slug_field(&ctx.slug_field)
    }

    // ── Context ──────────────────────────────────────────────────

    /// Resolves locales and collections for `plan`.
    pub async fn resolve_site(&self, plan: &SyncPlan) -> SyncResult<SiteContext> {
        SiteContext::resolve(self.api.as_ref(), &self.scheduler, plan).await
    }

    /// Local id → remote id for every healthy group of a collection, for
    /// translating references in collections that point at it.
    pub async fn resolve_remote_ids(
        &self,
        site: &SiteContext,
        key: &str,
    ) -> SyncResult<HashMap<ExternalId, RemoteId>> {
        let ctx = site.collection(key)?;
        let state = self
            .reader()
            .read(&ctx.collection_id, site.locale_ids(), &ctx.identifier_field)
            .await?;
        Ok(state.healthy_ids())
    }

    // ── Sync ─────────────────────────────────────────────────────

    /// Converges the remote collection `key` on `entities`.
    ///
    /// Never fails: setup, validation and listing problems produce a
    /// single-error outcome; chunk failures are collected and the run
    /// continues.
    pub async fn sync_collection(
        &self,
        site: &SiteContext,
        key: &str,
        entities: &[LocalEntity],
        builder: &dyn FieldBuilder,
    ) -> SyncOutcome {
        let run_id = RunId::new();
        let span = info_span!("sync_collection", collection = key, run_id = %run_id);
        self.run_sync(site, key, entities, builder, run_id)
            .instrument(span)
            .await
    }

    async fn run_sync(
        &self,
        site: &SiteContext,
        key: &str,
        entities: &[LocalEntity],
        builder: &dyn FieldBuilder,
        run_id: RunId,
    ) -> SyncOutcome {
        let started_at = Utc::now();
        let fatal = |stage: SyncStage, message: String| {
            warn!(%stage, %message, "collection run aborted");
            SyncOutcome::fatal(key, run_id, started_at, SyncIssue::new(stage, message))
        };

        let ctx = match site.collection(key) {
            Ok(ctx) => ctx,
            Err(e) => return fatal(SyncStage::Setup, e.to_string()),
        };
        if let Err(e) = validate_entities(entities) {
            return fatal(SyncStage::Validate, e.to_string());
        }

        let locale_ids = site.locale_ids();
        let primary_tag = site.locales().primary().tag.as_str();
        let reader = self.reader();

        let state = match reader
            .read(&ctx.collection_id, locale_ids, &ctx.identifier_field)
            .await
        {
            Ok(state) => state,
            Err(e) => return fatal(SyncStage::Fetch, format!("listing failed: {e}")),
        };

        let mut issues = IssueLog::new();
        note_identifier_changes(ctx, entities, &state, &mut issues);

        let plan = categorize(entities, &state, locale_ids);
        info!(
            local = entities.len(),
            remote = state.group_count(),
            create = plan.to_create.len(),
            recreate = plan.to_recreate.len(),
            update = plan.to_update.len(),
            delete = plan.to_delete.len(),
            "categorized"
        );

        let operator = self.operator(ctx, locale_ids);

        // Delete
        let deletion = self
            .delete_guarded(site, ctx, &operator, plan.delete_ids(), &mut issues)
            .await;

        // Create
        let recreatable = plan.to_recreate.iter().filter(|r| {
            let blocked = r.stale.iter().any(|id| deletion.kept.contains(id));
            if blocked {
                warn!(entity = %r.entity.id, "stale remote items could not be removed; not recreating");
                issues.warn(
                    SyncIssue::new(SyncStage::Create, "recreate postponed, stale items are still present")
                        .for_entity(&r.entity.id),
                );
            }
            !blocked
        });
        let new_items: Vec<NewItem> = plan
            .to_create
            .iter()
            .copied()
            .chain(recreatable.map(|r| r.entity))
            .map(|entity| NewItem {
                identifier: entity.id.clone(),
                field_data: desired_fields(ctx, builder, entity, primary_tag),
            })
            .collect();
        let created = operator.create(&new_items, &mut issues).await;
        let failed_creates: HashSet<&ExternalId> = created.failed.iter().collect();
        let created_ids: HashSet<&ExternalId> = new_items
            .iter()
            .map(|i| &i.identifier)
            .filter(|id| !failed_creates.contains(id))
            .collect();

        // Re-read
        let refreshed = if created.succeeded > 0 {
            match reader
                .read(&ctx.collection_id, locale_ids, &ctx.identifier_field)
                .await
            {
                Ok(fresh) => Some(fresh),
                Err(e) => {
                    issues.error(SyncIssue::new(
                        SyncStage::Fetch,
                        format!("re-read after create failed, new items were not localized: {e}"),
                    ));
                    None
                }
            }
        } else {
            None
        };
        let current = refreshed.as_ref().unwrap_or(&state);

        // Update
        let targets = plan
            .to_update
            .iter()
            .map(|u| u.entity)
            .chain(entities.iter().filter(|e| created_ids.contains(&e.id)));

        let mut publish: BTreeSet<RemoteId> = BTreeSet::new();
        let mut updates: Vec<ItemUpdate> = Vec::new();
        for entity in targets {
            let group = match current.get(&entity.id) {
                [group] if !group.corrupted => group,
                [] => {
                    if refreshed.is_some() {
                        warn!(entity = %entity.id, "created item not listed yet; localized on the next run");
                        issues.warn(
                            SyncIssue::new(SyncStage::Update, "created item not listed yet")
                                .for_entity(&entity.id),
                        );
                    }
                    continue;
                }
                _ => {
                    warn!(entity = %entity.id, "identifier is ambiguous after create");
                    issues.warn(
                        SyncIssue::new(SyncStage::Update, "identifier is ambiguous, healed on the next run")
                            .for_entity(&entity.id),
                    );
                    continue;
                }
            };

            if created_ids.contains(&entity.id) || group.needs_publish() {
                publish.insert(group.remote_id.clone());
            }

            let mut patches: Vec<(LocaleId, FieldData)> = Vec::new();
            for locale in site.locales().iter() {
                let Some(variant) = group.variant(&locale.id) else {
                    continue;
                };
                let mut desired = desired_fields(ctx, builder, entity, &locale.tag);
                desired.remove(&ctx.slug_field);
                if desired.differs_from(&variant.field_data) {
                    patches.push((locale.id.clone(), desired));
                }
            }
            if !patches.is_empty() {
                debug!(entity = %entity.id, remote_id = %group.remote_id, locales = patches.len(), "variants differ");
                updates.push(ItemUpdate {
                    remote_id: group.remote_id.clone(),
                    identifier: Some(entity.id.clone()),
                    patches,
                });
            }
        }

        let update_report = operator.update(&updates, false, &mut issues).await;
        let failed_updates: HashSet<&RemoteId> = update_report.failed.iter().collect();
        let mut updated = 0;
        for update in updates.iter().filter(|u| !failed_updates.contains(&u.remote_id)) {
            publish.insert(update.remote_id.clone());
            if update
                .identifier
                .as_ref()
                .is_some_and(|id| !created_ids.contains(id))
            {
                updated += 1;
            }
        }

        // Publish
        let published = operator.publish(&publish, &mut issues).await;

        let (errors, warnings) = issues.into_parts();
        let outcome = SyncOutcome {
            collection: key.to_string(),
            run_id,
            created: created.succeeded,
            updated,
            deleted: deletion.deleted,
            published,
            references_updated: deletion.references_updated,
            errors,
            warnings,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            created = outcome.created,
            updated = outcome.updated,
            deleted = outcome.deleted,
            published = outcome.published,
            references_updated = outcome.references_updated,
            errors = outcome.errors.len(),
            warnings = outcome.warnings.len(),
            "collection synced"
        );
        outcome
    }

    // ── Cleanup ──────────────────────────────────────────────────

    /// Deletes every remote group of `key` whose identifier is not in
    /// `live_local_ids`, stripping references from dependent collections
    /// first. Orphans still referenced by an item that could not be patched
    /// are left in place and counted as skipped.
    pub async fn cleanup_collection(
        &self,
        site: &SiteContext,
        key: &str,
        live_local_ids: &HashSet<ExternalId>,
    ) -> CleanupOutcome {
        let run_id = RunId::new();
        let span = info_span!("cleanup_collection", collection = key, run_id = %run_id);
        self.run_cleanup(site, key, live_local_ids, run_id)
            .instrument(span)
            .await
    }

    async fn run_cleanup(
        &self,
        site: &SiteContext,
        key: &str,
        live_local_ids: &HashSet<ExternalId>,
        run_id: RunId,
    ) -> CleanupOutcome {
        let started_at = Utc::now();
        let ctx = match site.collection(key) {
            Ok(ctx) => ctx,
            Err(e) => {
                return CleanupOutcome::fatal(
                    key,
                    run_id,
                    started_at,
                    SyncIssue::new(SyncStage::Setup, e.to_string()),
                );
            }
        };

        let locale_ids = site.locale_ids();
        let state = match self
            .reader()
            .read(&ctx.collection_id, locale_ids, &ctx.identifier_field)
            .await
        {
            Ok(state) => state,
            Err(e) => {
                return CleanupOutcome::fatal(
                    key,
                    run_id,
                    started_at,
                    SyncIssue::new(SyncStage::Fetch, format!("listing failed: {e}")),
                );
            }
        };

        let orphans: Vec<RemoteId> = state
            .iter()
            .filter(|(identifier, _)| !live_local_ids.contains(*identifier))
            .flat_map(|(_, groups)| groups.iter().map(|g| g.remote_id.clone()))
            .collect();
        debug!(orphans = orphans.len(), remote = state.group_count(), "orphans found");

        let mut issues = IssueLog::new();
        let operator = self.operator(ctx, locale_ids);
        let deletion = self
            .delete_guarded(site, ctx, &operator, orphans, &mut issues)
            .await;

        let (errors, warnings) = issues.into_parts();
        let outcome = CleanupOutcome {
            collection: key.to_string(),
            run_id,
            deleted: deletion.deleted,
            references_updated: deletion.references_updated,
            skipped: deletion.unsafe_count,
            errors,
            warnings,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            deleted = outcome.deleted,
            references_updated = outcome.references_updated,
            skipped = outcome.skipped,
            errors = outcome.errors.len(),
            "collection cleaned up"
        );
        outcome
    }

    // ── References ───────────────────────────────────────────────

    /// Strips `ids_being_deleted` from the reference fields `descriptors`
    /// (desired keys) of collection `referencing_key`.
    pub async fn remove_references(
        &self,
        site: &SiteContext,
        referencing_key: &str,
        descriptors: &[ReferenceDescriptor],
        ids_being_deleted: &BTreeSet<RemoteId>,
    ) -> ReferenceCleanupOutcome {
        let ctx = match site.collection(referencing_key) {
            Ok(ctx) => ctx,
            Err(e) => {
                return ReferenceCleanupOutcome {
                    updated: 0,
                    errors: vec![SyncIssue::new(SyncStage::Setup, e.to_string())],
                    unsafe_ids: ids_being_deleted.clone(),
                };
            }
        };
        let descriptors: Vec<ReferenceDescriptor> = descriptors
            .iter()
            .map(|d| ReferenceDescriptor {
                field_key: ctx.field_map.actual(&d.field_key).to_string(),
                multiplicity: d.multiplicity,
            })
            .collect();

        self.cleaner()
            .remove_references(&ctx.collection_id, site.locale_ids(), &descriptors, ids_being_deleted)
            .await
    }

    /// Strips references to `ids` from every dependent of `ctx`, then
    /// deletes the ids that are no longer referenced.
    async fn delete_guarded(
        &self,
        site: &SiteContext,
        ctx: &CollectionContext,
        operator: &BatchOperator<'_>,
        ids: Vec<RemoteId>,
        issues: &mut IssueLog,
    ) -> DeletionReport {
        let mut report = DeletionReport::default();
        if ids.is_empty() {
            return report;
        }

        let doomed: BTreeSet<RemoteId> = ids.iter().cloned().collect();
        let mut unsafe_ids: BTreeSet<RemoteId> = BTreeSet::new();

        if !ctx.unresolved_dependents.is_empty() {
            warn!(dependents = ?ctx.unresolved_dependents, "referencing collections unavailable; skipping deletes");
            issues.error(SyncIssue::new(
                SyncStage::Reference,
                format!(
                    "referencing collections {} could not be resolved, deletes skipped",
                    ctx.unresolved_dependents.join(", ")
                ),
            ));
            unsafe_ids = doomed.clone();
        } else {
            for dependent in &ctx.dependents {
                let outcome = self
                    .cleaner()
                    .remove_references(
                        &dependent.collection_id,
                        site.locale_ids(),
                        &dependent.descriptors,
                        &doomed,
                    )
                    .await;
                report.references_updated += outcome.updated;
                unsafe_ids.extend(outcome.unsafe_ids);
                for issue in outcome.errors {
                    issues.error(issue);
                }
            }
            for id in &unsafe_ids {
                issues.error(
                    SyncIssue::new(SyncStage::Reference, "still referenced, delete skipped").for_entity(id),
                );
            }
        }

        let safe: Vec<RemoteId> = ids.into_iter().filter(|id| !unsafe_ids.contains(id)).collect();
        let deleted = operator.delete(&safe, issues).await;

        report.deleted = deleted.succeeded;
        report.unsafe_count = unsafe_ids.len();
        report.kept = unsafe_ids;
        report.kept.extend(deleted.failed);
        report
    }
}

/// Field data for `entity` in one locale: builder output remapped to actual
/// slugs, with identifier and slug set.
fn desired_fields(
    ctx: &CollectionContext,
    builder: &dyn FieldBuilder,
    entity: &LocalEntity,
    locale_tag: &str,
) -> FieldData {
    let mut data = ctx.field_map.remap(builder.build(entity, locale_tag));
    data.set(ctx.identifier_field.clone(), entity.id.as_str());
    data.set(ctx.slug_field.clone(), entity.slug.as_str());
    data
}

/// Warns about orphans whose slug now belongs to a differently identified
/// local entity. The old group is still deleted and a new one created.
fn note_identifier_changes(
    ctx: &CollectionContext,
    entities: &[LocalEntity],
    state: &RemoteState,
    issues: &mut IssueLog,
) {
    let local_ids: HashSet<&ExternalId> = entities.iter().map(|e| &e.id).collect();
    let by_slug: HashMap<&str, &ExternalId> = entities
        .iter()
        .map(|e| (e.slug.as_str(), &e.id))
        .collect();

    for group in state.groups() {
        if local_ids.contains(&group.identifier) {
            continue;
        }
        let Some(slug) = group.slug(&ctx.slug_field) else {
            continue;
        };
        if let Some(local) = by_slug.get(slug) {
            warn!(
                remote_id = %group.remote_id,
                old = %group.identifier,
                new = %local,
                slug,
                "identifier changed for an existing slug"
            );
            issues.warn(
                SyncIssue::new(
                    SyncStage::Validate,
                    format!(
                        "slug '{slug}' moved from identifier '{}' to '{local}', item is replaced",
                        group.identifier
                    ),
                )
                .for_entity(local),
            );
        }
    }
}
