//! CMS API abstraction trait.
//!
//! Defines the remote operations the engine consumes. Implementations do no
//! rate limiting of their own; callers route every call through the shared
//! [`Scheduler`](crate::Scheduler).

use crate::error::SyncResult;
use async_trait::async_trait;
use cmsync_types::{CollectionId, FieldData, LocaleId, LocaleSet, RemoteId, RemoteRow, SiteId};
use serde::{Deserialize, Serialize};

/// One page of an item listing.
#[derive(Debug, Clone, Default)]
pub struct ItemPage {
    /// Rows on this page, one per (item, locale).
    pub items: Vec<RemoteRow>,
    /// Rows the server sent for this page, including any that could not be
    /// mapped. Paging advances by this count.
    pub received: usize,
    /// Total number of rows across all pages.
    pub total: usize,
}

/// A staged or live patch of one locale variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub remote_id: RemoteId,
    pub locale_id: LocaleId,
    pub field_data: FieldData,
}

/// An item together with the locales an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTarget {
    pub remote_id: RemoteId,
    pub locale_ids: Vec<LocaleId>,
}

impl ItemTarget {
    pub fn new(remote_id: RemoteId, locale_ids: &[LocaleId]) -> Self {
        Self {
            remote_id,
            locale_ids: locale_ids.to_vec(),
        }
    }
}

/// A field of a collection schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub slug: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
}

/// Structure of a remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub id: CollectionId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub slug: String,
    pub fields: Vec<SchemaField>,
}

impl CollectionSchema {
    pub fn field(&self, slug: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.slug == slug)
    }
}

/// Remote content-repository operations.
#[async_trait]
pub trait CmsApi: Send + Sync {
    /// Returns the name of the backend, for logs.
    fn provider_name(&self) -> &'static str;

    /// Lists the site's locales, one of them primary.
    async fn list_locales(&self, site: &SiteId) -> SyncResult<LocaleSet>;

    /// Fetches a collection's schema. `NotFound` if it does not exist.
    async fn get_collection(&self, collection: &CollectionId) -> SyncResult<CollectionSchema>;

    /// Lists one page of items in all of `locale_ids`.
    async fn list_items(
        &self,
        collection: &CollectionId,
        locale_ids: &[LocaleId],
        offset: usize,
        limit: usize,
    ) -> SyncResult<ItemPage>;

    /// Creates one item per entry of `rows`, each instantiated in every
    /// locale of `locale_ids` under a single new remote id.
    async fn create_items(
        &self,
        collection: &CollectionId,
        locale_ids: &[LocaleId],
        rows: &[FieldData],
    ) -> SyncResult<Vec<RemoteRow>>;

    /// Patches locale variants, staged or directly live.
    async fn update_items(
        &self,
        collection: &CollectionId,
        patches: &[ItemPatch],
        live: bool,
    ) -> SyncResult<()>;

    /// Removes items from the live site in the given locales.
    async fn unpublish_items(
        &self,
        collection: &CollectionId,
        targets: &[ItemTarget],
    ) -> SyncResult<()>;

    /// Permanently deletes items in the given locales.
    async fn delete_items(&self, collection: &CollectionId, targets: &[ItemTarget])
    -> SyncResult<()>;

    /// Publishes items in the given locales. Returns how many were published.
    /// A site that was never published answers with `Conflict`.
    async fn publish_items(
        &self,
        collection: &CollectionId,
        targets: &[ItemTarget],
    ) -> SyncResult<usize>;
}
