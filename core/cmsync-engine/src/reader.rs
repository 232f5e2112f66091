//! Remote state reader.
//!
//! Pages through a collection's items in every locale at once and groups
//! the rows by remote id. Groups are then indexed by the identifier they
//! carry. An identifier can map to several groups (an item created twice
//! by an interrupted run); those are surfaced as-is, never merged.

use crate::cms::CmsApi;
use crate::error::SyncResult;
use crate::scheduler::Scheduler;
use cmsync_types::{
    CollectionId, ExternalId, LocaleId, LocaleVariant, RemoteId, RemoteIdentityGroup, RemoteRow,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Remote groups of one collection, indexed by identifier.
#[derive(Debug, Clone, Default)]
pub struct RemoteState {
    groups: BTreeMap<ExternalId, Vec<RemoteIdentityGroup>>,
    rows: usize,
    discarded: usize,
}

impl RemoteState {
    /// Builds the index from already-grouped identity groups.
    pub fn from_groups(groups: impl IntoIterator<Item = RemoteIdentityGroup>) -> Self {
        let mut state = Self::default();
        for group in groups {
            state.rows += group.variants.len();
            state.insert(group);
        }
        state
    }

    fn insert(&mut self, group: RemoteIdentityGroup) {
        self.groups
            .entry(group.identifier.clone())
            .or_default()
            .push(group);
    }

    /// Every group carrying `identifier`.
    pub fn get(&self, identifier: &ExternalId) -> &[RemoteIdentityGroup] {
        self.groups
            .get(identifier)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ExternalId, &Vec<RemoteIdentityGroup>)> {
        self.groups.iter()
    }

    /// Every group, in identifier order.
    pub fn groups(&self) -> impl Iterator<Item = &RemoteIdentityGroup> {
        self.groups.values().flatten()
    }

    /// Number of distinct identifiers.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of groups (at least `len()`).
    pub fn group_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Rows read from the remote listing.
    pub fn row_count(&self) -> usize {
        self.rows
    }

    /// Groups dropped because no variant carried an identifier.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Identifier → remote id for every identifier backed by exactly one
    /// uncorrupted group. Ambiguous identifiers are left out.
    pub fn healthy_ids(&self) -> HashMap<ExternalId, RemoteId> {
        self.groups
            .iter()
            .filter_map(|(identifier, groups)| match groups.as_slice() {
                [group] if !group.corrupted => Some((identifier.clone(), group.remote_id.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Reads and groups remote rows for one collection.
pub struct RemoteStateReader<'a> {
    api: &'a dyn CmsApi,
    scheduler: &'a Scheduler,
    page_size: usize,
}

impl<'a> RemoteStateReader<'a> {
    pub fn new(api: &'a dyn CmsApi, scheduler: &'a Scheduler, page_size: usize) -> Self {
        Self {
            api,
            scheduler,
            page_size: page_size.max(1),
        }
    }

    /// Pages through every row of `collection` in all of `locale_ids`.
    pub async fn read_rows(
        &self,
        collection: &CollectionId,
        locale_ids: &[LocaleId],
    ) -> SyncResult<Vec<RemoteRow>> {
        let mut rows = Vec::new();
        let mut offset = 0;

        loop {
            let page = self
                .scheduler
                .schedule(self.api.list_items(collection, locale_ids, offset, self.page_size))
                .await?;

            let received = page.received;
            debug!(
                %collection,
                offset,
                received,
                kept = page.items.len(),
                total = page.total,
                "read item page"
            );
            rows.extend(page.items);

            offset += received;
            if offset >= page.total {
                break;
            }
            if received == 0 {
                warn!(
                    %collection,
                    offset,
                    total = page.total,
                    "listing returned an empty page before the reported total"
                );
                break;
            }
        }
        Ok(rows)
    }

    /// Reads every row of `collection` in all of `locale_ids` and groups
    /// them by remote id, then by the value of `identifier_field`.
    ///
    /// A listing failure is returned as an error; the caller treats it as
    /// fatal for the run.
    pub async fn read(
        &self,
        collection: &CollectionId,
        locale_ids: &[LocaleId],
        identifier_field: &str,
    ) -> SyncResult<RemoteState> {
        let listing = self.read_rows(collection, locale_ids).await?;
        let rows = listing.len();

        let mut order: Vec<RemoteId> = Vec::new();
        let mut variants: HashMap<RemoteId, Vec<LocaleVariant>> = HashMap::new();
        for row in listing {
            let (remote_id, variant) = row.into_variant();
            variants
                .entry(remote_id.clone())
                .or_insert_with(|| {
                    order.push(remote_id);
                    Vec::new()
                })
                .push(variant);
        }

        let mut state = RemoteState {
            rows,
            ..RemoteState::default()
        };
        for remote_id in order {
            let group_variants = variants.remove(&remote_id).unwrap_or_default();
            match RemoteIdentityGroup::from_variants(remote_id.clone(), group_variants, identifier_field) {
                Some(group) => {
                    if group.corrupted {
                        warn!(%collection, remote_id = %group.remote_id, identifier = %group.identifier, "locale variants disagree on identifier");
                    }
                    state.insert(group);
                }
                None => {
                    debug!(%collection, %remote_id, "discarding item without identifier");
                    state.discarded += 1;
                }
            }
        }

        debug!(
            %collection,
            rows,
            identifiers = state.len(),
            groups = state.group_count(),
            discarded = state.discarded,
            "remote state loaded"
        );
        Ok(state)
    }
}
