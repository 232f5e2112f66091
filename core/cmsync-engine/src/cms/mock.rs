//! An in-memory CMS for testing.
//!
//! Emulates the behaviours the engine has to cope with:
//! - one remote id shared by every locale variant of an item
//! - deletes that only touch the locales they name (primary if none)
//! - 409 when deleting an item another collection still references
//! - 409 when one update batch carries the same slug twice
//! - 409 on publish until the site has been published once
//! - injected failures per operation

use super::api::{CmsApi, CollectionSchema, ItemPage, ItemPatch, ItemTarget, SchemaField};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use cmsync_types::{CollectionId, FieldData, LocaleId, LocaleSet, RemoteId, RemoteRow, SiteId};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Operations recorded by the mock, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ListLocales,
    GetCollection,
    ListItems,
    CreateItems,
    UpdateItems,
    UpdateLiveItems,
    UnpublishItems,
    DeleteItems,
    PublishItems,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub collection: Option<CollectionId>,
    /// Entries in the request (items, patches or targets).
    pub size: usize,
}

#[derive(Debug, Default)]
struct MockCollection {
    schema: Option<CollectionSchema>,
    rows: Vec<RemoteRow>,
}

#[derive(Debug)]
struct ReferenceField {
    holder: CollectionId,
    field_key: String,
    target: CollectionId,
}

#[derive(Debug)]
struct MockState {
    locales: Option<LocaleSet>,
    collections: HashMap<CollectionId, MockCollection>,
    references: Vec<ReferenceField>,
    site_published: bool,
    next_id: u64,
    clock: i64,
    calls: Vec<MockCall>,
    failures: HashMap<MockOp, VecDeque<u16>>,
}

impl MockState {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        Utc.timestamp_opt(1_700_000_000 + self.clock, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn record(&mut self, op: MockOp, collection: Option<&CollectionId>, size: usize) -> SyncResult<()> {
        self.calls.push(MockCall {
            op,
            collection: collection.cloned(),
            size,
        });
        if let Some(status) = self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(match status {
                404 => SyncError::NotFound(format!("injected failure for {op:?}")),
                409 => SyncError::Conflict(format!("injected failure for {op:?}")),
                429 => SyncError::RateLimited { retry_after_secs: 1 },
                status => SyncError::Api {
                    status,
                    message: format!("injected failure for {op:?}"),
                },
            });
        }
        Ok(())
    }

    fn primary_locale(&self) -> Option<LocaleId> {
        self.locales.as_ref().map(|l| l.primary().id.clone())
    }

    fn is_referenced(&self, target: &CollectionId, remote_id: &RemoteId) -> Option<CollectionId> {
        self.references
            .iter()
            .filter(|r| &r.target == target)
            .find(|r| {
                self.collections.get(&r.holder).is_some_and(|c| {
                    c.rows.iter().any(|row| match row.field_data.get(&r.field_key) {
                        Some(Value::String(s)) => s == remote_id.as_str(),
                        Some(Value::Array(items)) => items
                            .iter()
                            .any(|v| v.as_str() == Some(remote_id.as_str())),
                        _ => false,
                    })
                })
            })
            .map(|r| r.holder.clone())
    }
}

/// In-memory CMS. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct MockCms {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockCms {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCms {
    /// Creates an empty CMS with no locales and no collections.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                locales: None,
                collections: HashMap::new(),
                references: Vec::new(),
                site_published: true,
                next_id: 0,
                clock: 0,
                calls: Vec::new(),
                failures: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sets the site's locales.
    pub fn set_locales(&self, locales: LocaleSet) {
        self.lock().locales = Some(locales);
    }

    /// Adds a collection whose schema has the given field slugs.
    pub fn add_collection(&self, id: impl Into<CollectionId>, field_slugs: &[&str]) {
        let id = id.into();
        let schema = CollectionSchema {
            id: id.clone(),
            display_name: id.to_string(),
            slug: id.to_string(),
            fields: field_slugs
                .iter()
                .map(|slug| SchemaField {
                    slug: (*slug).to_string(),
                    display_name: (*slug).to_string(),
                    field_type: "PlainText".to_string(),
                    required: false,
                })
                .collect(),
        };
        self.lock().collections.insert(
            id,
            MockCollection {
                schema: Some(schema),
                rows: Vec::new(),
            },
        );
    }

    /// Declares that `holder.field_key` stores remote ids of `target` items,
    /// so deleting a referenced target item fails with 409.
    pub fn add_reference_field(
        &self,
        holder: impl Into<CollectionId>,
        field_key: impl Into<String>,
        target: impl Into<CollectionId>,
    ) {
        self.lock().references.push(ReferenceField {
            holder: holder.into(),
            field_key: field_key.into(),
            target: target.into(),
        });
    }

    /// Whether the site has ever been published.
    pub fn set_site_published(&self, published: bool) {
        self.lock().site_published = published;
    }

    /// Inserts raw rows, bypassing every check. Used to stage duplicates,
    /// corrupted groups and missing locale variants.
    pub fn insert_rows(&self, collection: impl Into<CollectionId>, rows: Vec<RemoteRow>) {
        let mut state = self.lock();
        state
            .collections
            .entry(collection.into())
            .or_default()
            .rows
            .extend(rows);
    }

    /// A snapshot of every row in a collection.
    pub fn rows(&self, collection: impl Into<CollectionId>) -> Vec<RemoteRow> {
        self.lock()
            .collections
            .get(&collection.into())
            .map(|c| c.rows.clone())
            .unwrap_or_default()
    }

    /// Distinct remote ids in a collection.
    pub fn item_ids(&self, collection: impl Into<CollectionId>) -> HashSet<RemoteId> {
        self.rows(collection)
            .into_iter()
            .map(|r| r.remote_id)
            .collect()
    }

    /// Makes the next `count` calls of `op` fail with `status`.
    pub fn fail_next(&self, op: MockOp, status: u16, count: usize) {
        let mut state = self.lock();
        let queue = state.failures.entry(op).or_default();
        queue.extend(std::iter::repeat_n(status, count));
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Calls of one kind.
    pub fn calls_of(&self, op: MockOp) -> Vec<MockCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl CmsApi for MockCms {
    fn provider_name(&self) -> &'static str {
        "Mock"
    }

    async fn list_locales(&self, _site: &SiteId) -> SyncResult<LocaleSet> {
        let mut state = self.lock();
        state.record(MockOp::ListLocales, None, 0)?;
        state
            .locales
            .clone()
            .ok_or_else(|| SyncError::Setup("site has no primary locale".to_string()))
    }

    async fn get_collection(&self, collection: &CollectionId) -> SyncResult<CollectionSchema> {
        let mut state = self.lock();
        state.record(MockOp::GetCollection, Some(collection), 0)?;
        state
            .collections
            .get(collection)
            .and_then(|c| c.schema.clone())
            .ok_or_else(|| SyncError::NotFound(format!("collection {collection}")))
    }

    async fn list_items(
        &self,
        collection: &CollectionId,
        locale_ids: &[LocaleId],
        offset: usize,
        limit: usize,
    ) -> SyncResult<ItemPage> {
        let mut state = self.lock();
        state.record(MockOp::ListItems, Some(collection), limit)?;
        let coll = state
            .collections
            .get(collection)
            .ok_or_else(|| SyncError::NotFound(format!("collection {collection}")))?;

        let matching: Vec<&RemoteRow> = coll
            .rows
            .iter()
            .filter(|r| locale_ids.contains(&r.locale_id))
            .collect();
        let total = matching.len();
        let items: Vec<RemoteRow> = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(ItemPage {
            received: items.len(),
            items,
            total,
        })
    }

    async fn create_items(
        &self,
        collection: &CollectionId,
        locale_ids: &[LocaleId],
        rows: &[FieldData],
    ) -> SyncResult<Vec<RemoteRow>> {
        let mut state = self.lock();
        state.record(MockOp::CreateItems, Some(collection), rows.len())?;
        if !state.collections.contains_key(collection) {
            return Err(SyncError::NotFound(format!("collection {collection}")));
        }

        let mut created = Vec::new();
        for data in rows {
            state.next_id += 1;
            let remote_id = RemoteId::new(format!("item-{:04}", state.next_id));
            let now = state.tick();
            for locale_id in locale_ids {
                let mut row = RemoteRow::new(remote_id.clone(), locale_id.clone(), data.clone());
                row.last_updated = Some(now);
                created.push(row);
            }
        }
        if let Some(coll) = state.collections.get_mut(collection) {
            coll.rows.extend(created.iter().cloned());
        }
        Ok(created)
    }

    async fn update_items(
        &self,
        collection: &CollectionId,
        patches: &[ItemPatch],
        live: bool,
    ) -> SyncResult<()> {
        let mut state = self.lock();
        let op = if live {
            MockOp::UpdateLiveItems
        } else {
            MockOp::UpdateItems
        };
        state.record(op, Some(collection), patches.len())?;

        let mut slugs = HashSet::new();
        for patch in patches {
            if let Some(Value::String(slug)) = patch.field_data.get("slug") {
                if !slugs.insert(slug.clone()) {
                    return Err(SyncError::Conflict(format!(
                        "slug '{slug}' is used more than once in this request"
                    )));
                }
            }
        }

        let now = state.tick();
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| SyncError::NotFound(format!("collection {collection}")))?;

        for patch in patches {
            let exists = coll
                .rows
                .iter()
                .any(|r| r.remote_id == patch.remote_id && r.locale_id == patch.locale_id);
            if !exists {
                return Err(SyncError::NotFound(format!(
                    "item {} in locale {}",
                    patch.remote_id, patch.locale_id
                )));
            }
        }

        for patch in patches {
            if let Some(row) = coll
                .rows
                .iter_mut()
                .find(|r| r.remote_id == patch.remote_id && r.locale_id == patch.locale_id)
            {
                for (key, value) in patch.field_data.as_map() {
                    row.field_data.set(key.clone(), value.clone());
                }
                row.last_updated = Some(now);
                if live {
                    row.last_published = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn unpublish_items(
        &self,
        collection: &CollectionId,
        targets: &[ItemTarget],
    ) -> SyncResult<()> {
        let mut state = self.lock();
        state.record(MockOp::UnpublishItems, Some(collection), targets.len())?;
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| SyncError::NotFound(format!("collection {collection}")))?;
        for target in targets {
            for row in coll
                .rows
                .iter_mut()
                .filter(|r| r.remote_id == target.remote_id && target.locale_ids.contains(&r.locale_id))
            {
                row.last_published = None;
            }
        }
        Ok(())
    }

    async fn delete_items(
        &self,
        collection: &CollectionId,
        targets: &[ItemTarget],
    ) -> SyncResult<()> {
        let mut state = self.lock();
        state.record(MockOp::DeleteItems, Some(collection), targets.len())?;

        for target in targets {
            if let Some(holder) = state.is_referenced(collection, &target.remote_id) {
                return Err(SyncError::Conflict(format!(
                    "item {} is still referenced by {holder}",
                    target.remote_id
                )));
            }
        }

        let primary = state.primary_locale();
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| SyncError::NotFound(format!("collection {collection}")))?;
        for target in targets {
            let scope: Vec<LocaleId> = if target.locale_ids.is_empty() {
                primary.iter().cloned().collect()
            } else {
                target.locale_ids.clone()
            };
            coll.rows
                .retain(|r| !(r.remote_id == target.remote_id && scope.contains(&r.locale_id)));
        }
        Ok(())
    }

    async fn publish_items(
        &self,
        collection: &CollectionId,
        targets: &[ItemTarget],
    ) -> SyncResult<usize> {
        let mut state = self.lock();
        state.record(MockOp::PublishItems, Some(collection), targets.len())?;
        if !state.site_published {
            return Err(SyncError::Conflict(
                "site must be published before publishing items".to_string(),
            ));
        }

        let now = state.tick();
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| SyncError::NotFound(format!("collection {collection}")))?;
        let mut published = HashSet::new();
        for target in targets {
            for row in coll
                .rows
                .iter_mut()
                .filter(|r| r.remote_id == target.remote_id && target.locale_ids.contains(&r.locale_id))
            {
                row.last_published = Some(now);
                published.insert(row.remote_id.clone());
            }
        }
        Ok(published.len())
    }
}
