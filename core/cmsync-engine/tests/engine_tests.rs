//! End-to-end reconciliation scenarios against the in-memory CMS.

mod common;

use cmsync_engine::cms::mock::MockOp;
use cmsync_engine::{LocalizedFieldBuilder, SyncStage};
use cmsync_types::{ExternalId, LocalEntity, ReferenceDescriptor, RemoteId, RemoteRow};
use common::*;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashSet};

fn builder() -> LocalizedFieldBuilder {
    LocalizedFieldBuilder::new("en")
}

fn studio_row(remote_id: &str, locale: &str, city: &str, categories: &[&str]) -> RemoteRow {
    RemoteRow::new(
        remote_id,
        locale,
        fields(json!({
            "external-id": "s1",
            "slug": "studio-one",
            "name": "Studio One",
            "city": city,
            "categories": categories,
        })),
    )
}

// ── Creation ────────────────────────────────────────────────────

#[tokio::test]
async fn creates_one_group_with_every_locale() {
    let fx = Fixture::new();
    let site = fx.site().await;

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[entity("c1", "barre")], &builder())
        .await;

    assert_eq!(outcome.created, 1);
    assert_eq!(outcome.updated, 0);
    assert_eq!(outcome.deleted, 0);
    assert_eq!(outcome.published, 1);
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);

    let groups = fx.groups_for(CATEGORIES, "c1");
    assert_eq!(groups.len(), 1);
    let variants = fx.variants(CATEGORIES, &groups[0]);
    assert_eq!(variants.len(), 2);
    for variant in variants {
        assert_eq!(variant.field_data.get("external-id"), Some(&json!("c1")));
    }
}

#[tokio::test]
async fn secondary_locale_content_is_written_after_create() {
    let fx = Fixture::new();
    let site = fx.site().await;
    let entity = LocalEntity::new("c1", "barre")
        .with_fields("en", json!({"name": "Barre"}).as_object().cloned().unwrap())
        .with_fields("fr", json!({"name": "Barre (fr)"}).as_object().cloned().unwrap());

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[entity], &builder())
        .await;
    assert_eq!(outcome.created, 1);
    assert_eq!(outcome.updated, 0);
    assert_eq!(fx.cms.calls_of(MockOp::UpdateItems).len(), 1);

    let remote_id = &fx.groups_for(CATEGORIES, "c1")[0];
    let fr = fx
        .variants(CATEGORIES, remote_id)
        .into_iter()
        .find(|r| r.locale_id.as_str() == FR)
        .unwrap();
    assert_eq!(fr.field_data.get("name"), Some(&json!("Barre (fr)")));
}

#[tokio::test]
async fn create_sends_primary_content_for_every_locale() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.engine
        .sync_collection(&site, "categories", &[entity("c1", "barre")], &builder())
        .await;

    let creates = fx.cms.calls_of(MockOp::CreateItems);
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].size, 1);
}

// ── Idempotence ─────────────────────────────────────────────────

#[tokio::test]
async fn second_run_changes_nothing() {
    let fx = Fixture::new();
    let site = fx.site().await;
    let local = vec![entity("c1", "barre"), entity("c2", "yoga")];

    fx.engine
        .sync_collection(&site, "categories", &local, &builder())
        .await;
    fx.cms.clear_calls();
    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &local, &builder())
        .await;

    assert_eq!((outcome.created, outcome.updated, outcome.deleted), (0, 0, 0));
    assert_eq!(outcome.published, 0);
    assert!(fx.cms.calls_of(MockOp::UpdateItems).is_empty());
    assert!(fx.cms.calls_of(MockOp::DeleteItems).is_empty());
    assert!(outcome.is_noop());
}

#[tokio::test]
async fn changed_field_is_updated_in_place() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("r1", "c1", "barre"));

    let renamed = LocalEntity::new("c1", "barre")
        .with_fields("en", json!({"name": "Barre Fitness"}).as_object().cloned().unwrap());
    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[renamed], &builder())
        .await;

    assert_eq!(outcome.created, 0);
    assert_eq!(outcome.updated, 1);
    assert_eq!(outcome.deleted, 0);
    for variant in fx.variants(CATEGORIES, &RemoteId::new("r1")) {
        assert_eq!(variant.field_data.get("name"), Some(&json!("Barre Fitness")));
    }
    let updates = fx.cms.calls_of(MockOp::UpdateItems);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].size, 2);
}

#[tokio::test]
async fn pending_changes_are_published_without_updates() {
    let fx = Fixture::new();
    let site = fx.site().await;
    // Never published, content already correct.
    fx.cms.insert_rows(CATEGORIES, item("r1", "c1", "barre"));

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[entity("c1", "barre")], &builder())
        .await;
    assert_eq!(outcome.updated, 0);
    assert_eq!(outcome.published, 1);
}

// ── Convergence ─────────────────────────────────────────────────

#[tokio::test]
async fn incomplete_group_is_recreated() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, vec![row("old", EN, "c1", "barre")]);

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[entity("c1", "barre")], &builder())
        .await;

    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.created, 1);
    let groups = fx.groups_for(CATEGORIES, "c1");
    assert_eq!(groups.len(), 1);
    assert_ne!(groups[0], RemoteId::new("old"));
    assert_eq!(fx.variants(CATEGORIES, &groups[0]).len(), 2);
}

#[tokio::test]
async fn orphan_is_deleted() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("r1", "c1", "barre"));

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[], &builder())
        .await;

    assert_eq!(outcome.deleted, 1);
    assert_eq!((outcome.created, outcome.updated), (0, 0));
    assert!(fx.cms.rows(CATEGORIES).is_empty());
}

#[tokio::test]
async fn delete_removes_every_locale_variant() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("r1", "c1", "barre"));

    fx.engine
        .sync_collection(&site, "categories", &[], &builder())
        .await;

    let unpublish = fx.cms.calls_of(MockOp::UnpublishItems);
    let delete = fx.cms.calls_of(MockOp::DeleteItems);
    assert_eq!(unpublish.len(), 1);
    assert_eq!(delete.len(), 1);
    assert!(fx.cms.rows(CATEGORIES).iter().all(|r| r.remote_id.as_str() != "r1"));
}

#[tokio::test]
async fn duplicates_converge_to_one_group() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("dup-1", "c1", "barre"));
    fx.cms.insert_rows(CATEGORIES, item("dup-2", "c1", "barre"));

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[entity("c1", "barre")], &builder())
        .await;
    assert_eq!(outcome.deleted, 2);
    assert_eq!(outcome.created, 1);

    let groups = fx.groups_for(CATEGORIES, "c1");
    assert_eq!(groups.len(), 1);
    assert!(!groups.contains(&RemoteId::new("dup-1")));
    assert!(!groups.contains(&RemoteId::new("dup-2")));

    let next = fx
        .engine
        .sync_collection(&site, "categories", &[entity("c1", "barre")], &builder())
        .await;
    assert_eq!((next.created, next.updated, next.deleted), (0, 0, 0));
}

#[tokio::test]
async fn orphaned_duplicates_are_all_deleted() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("dup-1", "c1", "barre"));
    fx.cms.insert_rows(CATEGORIES, item("dup-2", "c1", "barre"));

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[], &builder())
        .await;
    assert_eq!(outcome.deleted, 2);
    assert!(fx.cms.rows(CATEGORIES).is_empty());
}

#[tokio::test]
async fn corrupted_group_is_healed() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(
        CATEGORIES,
        vec![row("bad", EN, "c1", "barre"), row("bad", FR, "c9", "barre")],
    );

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[entity("c1", "barre")], &builder())
        .await;
    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.created, 1);

    let groups = fx.groups_for(CATEGORIES, "c1");
    assert_eq!(groups.len(), 1);
    for variant in fx.variants(CATEGORIES, &groups[0]) {
        assert_eq!(variant.field_data.get("external-id"), Some(&json!("c1")));
    }
}

#[tokio::test]
async fn items_without_identifier_are_left_alone() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(
        CATEGORIES,
        vec![RemoteRow::new("manual", EN, fields(json!({"slug": "manual"})))],
    );

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[], &builder())
        .await;
    assert_eq!(outcome.deleted, 0);
    assert_eq!(fx.cms.rows(CATEGORIES).len(), 1);
}

// ── Publishing ──────────────────────────────────────────────────

#[tokio::test]
async fn unpublished_site_yields_warning_not_error() {
    let fx = Fixture::new();
    fx.cms.set_site_published(false);
    let site = fx.site().await;

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[entity("c1", "barre")], &builder())
        .await;

    assert_eq!(outcome.created, 1);
    assert_eq!(outcome.published, 0);
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].stage, SyncStage::Publish);
}

#[tokio::test]
async fn publish_resumes_once_site_is_published() {
    let fx = Fixture::new();
    fx.cms.set_site_published(false);
    let site = fx.site().await;
    let local = [entity("c1", "barre")];

    fx.engine
        .sync_collection(&site, "categories", &local, &builder())
        .await;
    fx.cms.set_site_published(true);
    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &local, &builder())
        .await;

    assert_eq!((outcome.created, outcome.updated, outcome.deleted), (0, 0, 0));
    assert_eq!(outcome.published, 1);
}

// ── Referential integrity ───────────────────────────────────────

#[tokio::test]
async fn references_are_stripped_before_delete() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CITIES, item("city-r1", "city-1", "paris"));
    fx.cms.insert_rows(
        STUDIOS,
        vec![
            studio_row("studio-r1", EN, "city-r1", &[]),
            studio_row("studio-r1", FR, "city-r1", &[]),
        ],
    );

    let outcome = fx
        .engine
        .sync_collection(&site, "cities", &[], &builder())
        .await;

    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    assert_eq!(outcome.deleted, 1);
    assert!(outcome.references_updated >= 1);
    for studio in fx.cms.rows(STUDIOS) {
        assert_eq!(studio.field_data.get("city"), Some(&Value::Null));
    }

    let calls = fx.cms.calls();
    let strip = calls
        .iter()
        .position(|c| c.op == MockOp::UpdateLiveItems)
        .expect("references were stripped");
    let delete = calls
        .iter()
        .position(|c| c.op == MockOp::DeleteItems)
        .expect("city was deleted");
    assert!(strip < delete, "cleanup must precede the delete");
}

#[tokio::test]
async fn multi_references_are_filtered() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("cat-r1", "c1", "barre"));
    fx.cms.insert_rows(CATEGORIES, item("cat-r2", "c2", "yoga"));
    fx.cms.insert_rows(
        STUDIOS,
        vec![
            studio_row("studio-r1", EN, "", &["cat-r1", "cat-r2"]),
            studio_row("studio-r1", FR, "", &["cat-r1", "cat-r2"]),
        ],
    );

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[entity("c2", "yoga")], &builder())
        .await;
    assert_eq!(outcome.deleted, 1);
    for studio in fx.cms.rows(STUDIOS) {
        assert_eq!(studio.field_data.get("categories"), Some(&json!(["cat-r2"])));
    }
}

#[tokio::test]
async fn failed_reference_patch_blocks_delete() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CITIES, item("city-r1", "city-1", "paris"));
    fx.cms.insert_rows(
        STUDIOS,
        vec![
            studio_row("studio-r1", EN, "city-r1", &[]),
            studio_row("studio-r1", FR, "city-r1", &[]),
        ],
    );
    fx.cms.fail_next(MockOp::UpdateLiveItems, 500, 1);

    let outcome = fx
        .engine
        .sync_collection(&site, "cities", &[], &builder())
        .await;

    assert_eq!(outcome.deleted, 0);
    assert!(outcome.errors.iter().any(|e| e.stage == SyncStage::Reference));
    assert!(fx.cms.calls_of(MockOp::DeleteItems).is_empty());
    assert_eq!(fx.groups_for(CITIES, "city-1"), vec![RemoteId::new("city-r1")]);
}

#[tokio::test]
async fn remove_references_reports_updates() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(
        STUDIOS,
        vec![
            studio_row("studio-r1", EN, "city-r1", &["cat-r1"]),
            studio_row("studio-r1", FR, "city-r1", &["cat-r1"]),
            studio_row("studio-r2", EN, "city-r2", &[]),
            studio_row("studio-r2", FR, "city-r2", &[]),
        ],
    );
    let doomed = BTreeSet::from([RemoteId::new("city-r1")]);

    let outcome = fx
        .engine
        .remove_references(
            &site,
            "studios",
            &[ReferenceDescriptor::single("city")],
            &doomed,
        )
        .await;

    assert_eq!(outcome.updated, 1);
    assert!(outcome.errors.is_empty());
    assert!(outcome.unsafe_ids.is_empty());
    let live = fx.cms.calls_of(MockOp::UpdateLiveItems);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].size, 2);
}

// ── Fatal pre-conditions ────────────────────────────────────────

#[tokio::test]
async fn missing_collection_aborts_run() {
    let fx = Fixture::with_plan(cmsync_engine::SyncPlan::new(
        SITE,
        vec![cmsync_engine::CollectionSpec::new("ghosts", "coll-missing")],
    ));
    let site = fx.site().await;

    let outcome = fx
        .engine
        .sync_collection(&site, "ghosts", &[entity("g1", "boo")], &builder())
        .await;

    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].stage, SyncStage::Setup);
    assert!(fx.cms.calls_of(MockOp::ListItems).is_empty());
}

#[tokio::test]
async fn listing_failure_aborts_run() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.fail_next(MockOp::ListItems, 500, 1);

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[entity("c1", "barre")], &builder())
        .await;

    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].stage, SyncStage::Fetch);
    assert!(fx.cms.calls_of(MockOp::CreateItems).is_empty());
}

#[tokio::test]
async fn duplicate_local_slug_aborts_before_any_delete() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("r1", "c1", "barre"));

    let outcome = fx
        .engine
        .sync_collection(
            &site,
            "categories",
            &[entity("c1", "barre"), entity("c2", "barre")],
            &builder(),
        )
        .await;

    assert_eq!(outcome.errors[0].stage, SyncStage::Validate);
    assert!(fx.cms.calls_of(MockOp::DeleteItems).is_empty());
    assert_eq!(fx.cms.rows(CATEGORIES).len(), 2);
}

#[tokio::test]
async fn padded_identifier_is_rejected_on_every_run() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("r1", "c1", "barre"));

    for _ in 0..2 {
        let outcome = fx
            .engine
            .sync_collection(&site, "categories", &[entity("c1 ", "barre")], &builder())
            .await;

        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.deleted, 0);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].stage, SyncStage::Validate);
        assert!(outcome.errors[0].message.contains("whitespace"));
    }

    assert!(fx.cms.calls_of(MockOp::CreateItems).is_empty());
    assert!(fx.cms.calls_of(MockOp::DeleteItems).is_empty());
    assert_eq!(fx.cms.item_ids(CATEGORIES), HashSet::from([RemoteId::new("r1")]));
}

#[tokio::test]
async fn identifier_change_is_reported() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("r1", "old-id", "barre"));

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[entity("new-id", "barre")], &builder())
        .await;

    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.created, 1);
    assert!(
        outcome
            .warnings
            .iter()
            .any(|w| w.stage == SyncStage::Validate && w.entity_id.as_deref() == Some("new-id"))
    );
}

// ── Partial failure ─────────────────────────────────────────────

#[tokio::test]
async fn failed_create_chunk_is_recorded_and_run_continues() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("r1", "c1", "barre"));
    fx.cms.fail_next(MockOp::CreateItems, 500, 1);

    let renamed = LocalEntity::new("c1", "barre")
        .with_fields("en", json!({"name": "Renamed"}).as_object().cloned().unwrap());
    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[renamed, entity("c2", "yoga")], &builder())
        .await;

    assert_eq!(outcome.created, 0);
    assert_eq!(outcome.updated, 1);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].stage, SyncStage::Create);
    assert_eq!(outcome.errors[0].entity_id.as_deref(), Some("c2"));

    let retry = fx
        .engine
        .sync_collection(
            &site,
            "categories",
            &[
                LocalEntity::new("c1", "barre")
                    .with_fields("en", json!({"name": "Renamed"}).as_object().cloned().unwrap()),
                entity("c2", "yoga"),
            ],
            &builder(),
        )
        .await;
    assert_eq!(retry.created, 1);
    assert!(retry.errors.is_empty());
}

#[tokio::test]
async fn resolve_remote_ids_skips_ambiguous_identifiers() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("r1", "c1", "barre"));
    fx.cms.insert_rows(CATEGORIES, item("r2", "c2", "yoga"));
    fx.cms.insert_rows(CATEGORIES, item("r3", "c2", "yoga-2"));

    let ids = fx.engine.resolve_remote_ids(&site, "categories").await.unwrap();
    assert_eq!(ids.get(&ExternalId::new("c1")), Some(&RemoteId::new("r1")));
    assert!(!ids.contains_key(&ExternalId::new("c2")));
}

#[tokio::test]
async fn cleanup_deletes_only_orphans() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CATEGORIES, item("r1", "c1", "barre"));
    fx.cms.insert_rows(CATEGORIES, item("r2", "c2", "yoga"));

    let live: HashSet<ExternalId> = HashSet::from([ExternalId::new("c1")]);
    let outcome = fx.engine.cleanup_collection(&site, "categories", &live).await;

    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.skipped, 0);
    assert!(outcome.errors.is_empty());
    assert_eq!(fx.cms.item_ids(CATEGORIES), HashSet::from([RemoteId::new("r1")]));
}

#[tokio::test]
async fn cleanup_skips_orphans_with_unpatchable_referrers() {
    let fx = Fixture::new();
    let site = fx.site().await;
    fx.cms.insert_rows(CITIES, item("city-r1", "city-1", "paris"));
    fx.cms.insert_rows(
        STUDIOS,
        vec![
            studio_row("studio-r1", EN, "city-r1", &[]),
            studio_row("studio-r1", FR, "city-r1", &[]),
        ],
    );
    fx.cms.fail_next(MockOp::UpdateLiveItems, 503, 1);

    let outcome = fx
        .engine
        .cleanup_collection(&site, "cities", &HashSet::new())
        .await;

    assert_eq!(outcome.deleted, 0);
    assert_eq!(outcome.skipped, 1);
    assert!(outcome.has_errors());
}

#[tokio::test]
async fn invalidated_context_is_refused() {
    let fx = Fixture::new();
    let mut site = fx.site().await;
    site.invalidate();
    assert!(!site.is_valid());

    let outcome = fx
        .engine
        .sync_collection(&site, "categories", &[entity("c1", "barre")], &builder())
        .await;
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].stage, SyncStage::Setup);
    assert!(fx.cms.calls_of(MockOp::CreateItems).is_empty());

    let cleanup = fx
        .engine
        .cleanup_collection(&site, "categories", &HashSet::new())
        .await;
    assert_eq!(cleanup.errors[0].stage, SyncStage::Setup);
}
