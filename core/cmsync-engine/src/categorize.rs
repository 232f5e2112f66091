//! Diffs local entities against remote state.
//!
//! Pure: no I/O, no clock. Produces four disjoint action sets. Rules, in
//! order of precedence:
//! 1. several groups share an identifier: every group is deleted
//! 2. a single corrupted group: deleted
//! 3. a group missing some required locale: deleted and recreated
//! 4. a complete, consistent group: updated
//! 5. no group: created
//!
//! A local entity whose groups fall under 1–3 is recreated in the same run.
//! Groups whose identifier has no local entity are deleted as orphans
//! (or under 1–2 if they are also duplicated or corrupted).

use crate::reader::RemoteState;
use cmsync_types::{ExternalId, LocalEntity, LocaleId, RemoteId, RemoteIdentityGroup};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Why a remote group is scheduled for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteReason {
    /// No local entity carries this identifier.
    Orphan,
    /// Locale variants disagree on the identifier.
    Corrupted,
    /// Another group carries the same identifier.
    Duplicate,
    /// Some required locale has no variant.
    Incomplete,
}

/// One remote group to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCandidate {
    pub remote_id: RemoteId,
    pub identifier: ExternalId,
    pub reason: DeleteReason,
}

/// A local entity whose remote groups are purged and rebuilt.
#[derive(Debug, Clone)]
pub struct Recreate<'a> {
    pub entity: &'a LocalEntity,
    /// Remote ids deleted before the entity is created again. Also listed
    /// in `to_delete`.
    pub stale: Vec<RemoteId>,
    pub reason: DeleteReason,
}

/// A local entity matched to its single healthy group.
#[derive(Debug, Clone)]
pub struct Update<'a> {
    pub entity: &'a LocalEntity,
    pub group: &'a RemoteIdentityGroup,
}

/// Result of [`categorize`].
#[derive(Debug, Clone, Default)]
pub struct Categorization<'a> {
    pub to_create: Vec<&'a LocalEntity>,
    pub to_recreate: Vec<Recreate<'a>>,
    pub to_update: Vec<Update<'a>>,
    pub to_delete: Vec<DeleteCandidate>,
}

impl Categorization<'_> {
    /// Remote ids of every group to delete, in categorization order.
    pub fn delete_ids(&self) -> Vec<RemoteId> {
        self.to_delete.iter().map(|d| d.remote_id.clone()).collect()
    }

    /// Entities to create: new ones first, then recreated ones.
    pub fn entities_to_create(&self) -> Vec<&LocalEntity> {
        self.to_create
            .iter()
            .copied()
            .chain(self.to_recreate.iter().map(|r| r.entity))
            .collect()
    }

    /// Number of delete candidates with the given reason.
    pub fn count(&self, reason: DeleteReason) -> usize {
        self.to_delete.iter().filter(|d| d.reason == reason).count()
    }
}

fn candidate(group: &RemoteIdentityGroup, reason: DeleteReason) -> DeleteCandidate {
    DeleteCandidate {
        remote_id: group.remote_id.clone(),
        identifier: group.identifier.clone(),
        reason,
    }
}

/// Classifies every local entity and every remote group.
///
/// `local` must not contain two entities with the same id; callers
/// validate this first.
pub fn categorize<'a>(
    local: &'a [LocalEntity],
    remote: &'a RemoteState,
    required_locales: &[LocaleId],
) -> Categorization<'a> {
    let mut result = Categorization::default();
    let local_ids: HashSet<&ExternalId> = local.iter().map(|e| &e.id).collect();

    for entity in local {
        match remote.get(&entity.id) {
            [] => result.to_create.push(entity),
            [group] if group.corrupted => {
                result.to_delete.push(candidate(group, DeleteReason::Corrupted));
                result.to_recreate.push(Recreate {
                    entity,
                    stale: vec![group.remote_id.clone()],
                    reason: DeleteReason::Corrupted,
                });
            }
            [group] if !group.missing_locales(required_locales).is_empty() => {
                result.to_delete.push(candidate(group, DeleteReason::Incomplete));
                result.to_recreate.push(Recreate {
                    entity,
                    stale: vec![group.remote_id.clone()],
                    reason: DeleteReason::Incomplete,
                });
            }
            [group] => result.to_update.push(Update { entity, group }),
            groups => {
                result.to_delete.extend(
                    groups
                        .iter()
                        .map(|g| candidate(g, DeleteReason::Duplicate)),
                );
                result.to_recreate.push(Recreate {
                    entity,
                    stale: groups.iter().map(|g| g.remote_id.clone()).collect(),
                    reason: DeleteReason::Duplicate,
                });
            }
        }
    }

    for (identifier, groups) in remote.iter() {
        if local_ids.contains(identifier) {
            continue;
        }
        match groups.as_slice() {
            [group] if group.corrupted => {
                result.to_delete.push(candidate(group, DeleteReason::Corrupted));
            }
            [group] => result.to_delete.push(candidate(group, DeleteReason::Orphan)),
            groups => result.to_delete.extend(
                groups
                    .iter()
                    .map(|g| candidate(g, DeleteReason::Duplicate)),
            ),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmsync_types::{FieldData, LocaleVariant};
    use serde_json::json;

    fn group(remote_id: &str, identifier: &str, locales: &[&str]) -> RemoteIdentityGroup {
        let variants = locales
            .iter()
            .map(|l| {
                LocaleVariant::new(
                    *l,
                    FieldData::from_map(json!({"external-id": identifier}).as_object().cloned().unwrap()),
                )
            })
            .collect();
        RemoteIdentityGroup::from_variants(RemoteId::new(remote_id), variants, "external-id").unwrap()
    }

    fn locales() -> Vec<LocaleId> {
        vec![LocaleId::new("en"), LocaleId::new("fr")]
    }

    #[test]
    fn empty_inputs_produce_nothing() {
        let remote = RemoteState::default();
        let result = categorize(&[], &remote, &locales());
        assert!(result.to_create.is_empty());
        assert!(result.to_delete.is_empty());
        assert!(result.to_update.is_empty());
        assert!(result.to_recreate.is_empty());
    }

    #[test]
    fn corrupted_orphan_is_deleted_as_corrupted() {
        let mut g = group("r1", "x", &["en", "fr"]);
        g.corrupted = true;
        let remote = RemoteState::from_groups([g]);
        let result = categorize(&[], &remote, &locales());
        assert_eq!(result.count(DeleteReason::Corrupted), 1);
        assert_eq!(result.count(DeleteReason::Orphan), 0);
    }

    #[test]
    fn extra_locale_with_all_required_present_is_update() {
        let local = vec![LocalEntity::new("c1", "barre")];
        let remote = RemoteState::from_groups([group("r1", "c1", &["en", "fr", "de"])]);
        let result = categorize(&local, &remote, &locales());
        assert_eq!(result.to_update.len(), 1);
    }
}
