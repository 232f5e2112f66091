//! Shared fixtures for engine tests.

#![allow(dead_code)]

use cmsync_engine::cms::mock::MockCms;
use cmsync_engine::{
    CollectionSpec, EngineConfig, RateLimitConfig, SiteContext, SyncEngine, SyncPlan,
};
use cmsync_types::{
    FieldData, LocalEntity, Locale, LocaleId, LocaleSet, Multiplicity, RemoteId, RemoteRow,
};
use serde_json::{Value, json};
use std::sync::Arc;

pub const SITE: &str = "site-1";
pub const CATEGORIES: &str = "coll-categories";
pub const CITIES: &str = "coll-cities";
pub const STUDIOS: &str = "coll-studios";
pub const EN: &str = "loc-en";
pub const FR: &str = "loc-fr";

/// English primary, French secondary.
pub fn locales() -> LocaleSet {
    LocaleSet::new(vec![Locale::primary(EN, "en"), Locale::new(FR, "fr")]).unwrap()
}

pub fn locale_ids() -> Vec<LocaleId> {
    vec![LocaleId::new(EN), LocaleId::new(FR)]
}

/// Engine settings with no throttling, so tests run in real time.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        rate_limit: RateLimitConfig {
            bucket_capacity: 10_000,
            refill_interval_ms: 1,
            min_interval_ms: 0,
        },
        ..EngineConfig::default()
    }
}

pub fn fields(value: Value) -> FieldData {
    FieldData::from_map(value.as_object().cloned().unwrap_or_default())
}

/// A remote row carrying an identifier and slug.
pub fn row(remote_id: &str, locale: &str, external_id: &str, slug: &str) -> RemoteRow {
    RemoteRow::new(
        remote_id,
        locale,
        fields(json!({"external-id": external_id, "slug": slug, "name": slug})),
    )
}

/// Rows for one item in both locales.
pub fn item(remote_id: &str, external_id: &str, slug: &str) -> Vec<RemoteRow> {
    vec![row(remote_id, EN, external_id, slug), row(remote_id, FR, external_id, slug)]
}

/// A local entity whose `name` is its slug in every locale.
pub fn entity(id: &str, slug: &str) -> LocalEntity {
    LocalEntity::new(id, slug).with_fields(
        "en",
        json!({"name": slug}).as_object().cloned().unwrap_or_default(),
    )
}

pub fn categories_spec() -> CollectionSpec {
    CollectionSpec::new("categories", CATEGORIES)
}

pub fn cities_spec() -> CollectionSpec {
    CollectionSpec::new("cities", CITIES)
}

pub fn studios_spec() -> CollectionSpec {
    CollectionSpec::new("studios", STUDIOS)
        .with_reference("city", Multiplicity::Single, "cities")
        .with_reference("categories", Multiplicity::Multiple, "categories")
}

/// Categories, cities and studios, studios referencing both others.
pub fn full_plan() -> SyncPlan {
    SyncPlan::new(SITE, vec![categories_spec(), cities_spec(), studios_spec()])
}

/// A mock site with the three collections of [`full_plan`].
pub fn mock_site() -> MockCms {
    let cms = MockCms::new();
    cms.set_locales(locales());
    cms.add_collection(CATEGORIES, &["name", "slug", "external-id"]);
    cms.add_collection(CITIES, &["name", "slug", "external-id"]);
    cms.add_collection(STUDIOS, &["name", "slug", "external-id", "city", "categories"]);
    cms.add_reference_field(STUDIOS, "city", CITIES);
    cms.add_reference_field(STUDIOS, "categories", CATEGORIES);
    cms
}

pub struct Fixture {
    pub cms: MockCms,
    pub engine: SyncEngine,
    pub plan: SyncPlan,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_plan(full_plan())
    }

    pub fn with_plan(plan: SyncPlan) -> Self {
        let cms = mock_site();
        let engine = SyncEngine::new(Arc::new(cms.clone()), fast_config());
        Self { cms, engine, plan }
    }

    pub async fn site(&self) -> SiteContext {
        self.engine.resolve_site(&self.plan).await.unwrap()
    }

    /// Distinct remote ids carrying `external_id` in a collection.
    pub fn groups_for(&self, collection: &str, external_id: &str) -> Vec<RemoteId> {
        let mut ids: Vec<RemoteId> = self
            .cms
            .rows(collection)
            .into_iter()
            .filter(|r| {
                r.field_data.get("external-id").and_then(Value::as_str) == Some(external_id)
            })
            .map(|r| r.remote_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Rows of one remote item.
    pub fn variants(&self, collection: &str, remote_id: &RemoteId) -> Vec<RemoteRow> {
        self.cms
            .rows(collection)
            .into_iter()
            .filter(|r| &r.remote_id == remote_id)
            .collect()
    }
}
