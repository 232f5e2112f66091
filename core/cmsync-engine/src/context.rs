//! Caller-owned site context.
//!
//! Collection ids, locales and desired → actual field slugs are resolved
//! once per site and passed explicitly into every engine entry point. The
//! context is never refreshed behind the caller's back: after a structural
//! change on the CMS, call [`SiteContext::invalidate`] and resolve again.

use crate::cms::{CmsApi, CollectionSchema};
use crate::config::{CollectionSpec, SyncPlan};
use crate::error::{SyncError, SyncResult};
use crate::scheduler::Scheduler;
use cmsync_types::{CollectionId, FieldData, LocaleId, LocaleSet, ReferenceDescriptor, SiteId};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Splits `address-2` into (`address`, 2).
fn numeric_suffix(slug: &str) -> Option<(&str, u64)> {
    let (base, suffix) = slug.rsplit_once('-')?;
    if base.is_empty() || suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok().map(|n| (base, n))
}

/// Desired field key → actual field slug on the CMS.
///
/// When a field is deleted and recreated the CMS gives the new field a
/// numeric suffix (`address-2`). An exact slug always wins; otherwise the
/// suffixed field with the largest number is used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    map: BTreeMap<String, String>,
}

impl FieldMap {
    /// Builds the map from every field of a collection schema.
    pub fn from_schema(schema: &CollectionSchema) -> Self {
        let slugs: Vec<&str> = schema.fields.iter().map(|f| f.slug.as_str()).collect();
        Self::from_slugs(&slugs)
    }

    pub fn from_slugs(slugs: &[&str]) -> Self {
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        let mut best_suffix: BTreeMap<&str, u64> = BTreeMap::new();

        for slug in slugs {
            map.insert((*slug).to_string(), (*slug).to_string());
        }
        for slug in slugs {
            let Some((base, n)) = numeric_suffix(slug) else {
                continue;
            };
            if slugs.contains(&base) {
                continue;
            }
            if best_suffix.get(base).is_none_or(|best| n > *best) {
                best_suffix.insert(base, n);
                map.insert(base.to_string(), (*slug).to_string());
            }
        }
        Self { map }
    }

    /// Actual slug for `desired`, if the schema has one.
    pub fn resolve(&self, desired: &str) -> Option<&str> {
        self.map.get(desired).map(String::as_str)
    }

    /// Actual slug for `desired`, falling back to `desired` itself.
    pub fn actual<'a>(&'a self, desired: &'a str) -> &'a str {
        self.resolve(desired).unwrap_or(desired)
    }

    /// Rewrites every key of `data` to its actual slug.
    pub fn remap(&self, data: FieldData) -> FieldData {
        data.into_map()
            .into_iter()
            .map(|(key, value)| (self.actual(&key).to_string(), value))
            .collect()
    }

    /// Desired keys that resolve to a different slug.
    pub fn renamed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map
            .iter()
            .filter(|(desired, actual)| desired != actual)
            .map(|(d, a)| (d.as_str(), a.as_str()))
    }
}

/// A collection that references another one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    pub key: String,
    pub collection_id: CollectionId,
    /// Reference fields (actual slugs) pointing at the referenced collection.
    pub descriptors: Vec<ReferenceDescriptor>,
}

/// A reference field of a collection, with the plan key of its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    pub descriptor: ReferenceDescriptor,
    pub target: String,
}

/// Everything the engine needs to know about one resolved collection.
#[derive(Debug, Clone)]
pub struct CollectionContext {
    pub key: String,
    pub collection_id: CollectionId,
    pub display_name: String,
    pub field_map: FieldMap,
    /// Actual slug of the identifier field.
    pub identifier_field: String,
    /// Actual slug of the slug field.
    pub slug_field: String,
    /// Outgoing reference fields, actual slugs.
    pub references: Vec<ResolvedReference>,
    /// Resolved collections holding references to this one.
    pub dependents: Vec<Dependent>,
    /// Plan keys of referencing collections that failed to resolve. Their
    /// items cannot be scanned, so deleting from this collection is unsafe.
    pub unresolved_dependents: Vec<String>,
}

impl CollectionContext {
    fn resolve(spec: &CollectionSpec, schema: &CollectionSchema) -> SyncResult<Self> {
        let field_map = FieldMap::from_schema(schema);

        let require = |desired: &str| -> SyncResult<String> {
            field_map.resolve(desired).map(str::to_string).ok_or_else(|| {
                SyncError::Setup(format!(
                    "collection '{}' has no field '{desired}'",
                    spec.key
                ))
            })
        };

        let identifier_field = require(&spec.identifier_field)?;
        let slug_field = require(&spec.slug_field)?;
        for field in &spec.required_fields {
            require(field)?;
        }
        let references = spec
            .references
            .iter()
            .map(|r| {
                Ok(ResolvedReference {
                    descriptor: ReferenceDescriptor {
                        field_key: require(&r.field_key)?,
                        multiplicity: r.multiplicity,
                    },
                    target: r.target.clone(),
                })
            })
            .collect::<SyncResult<Vec<_>>>()?;

        for (desired, actual) in field_map.renamed() {
            debug!(collection = %spec.key, desired, actual, "field resolves to suffixed slug");
        }

        Ok(Self {
            key: spec.key.clone(),
            collection_id: schema.id.clone(),
            display_name: schema.display_name.clone(),
            field_map,
            identifier_field,
            slug_field,
            references,
            dependents: Vec::new(),
            unresolved_dependents: Vec::new(),
        })
    }

    pub fn has_dependents(&self) -> bool {
        !self.dependents.is_empty() || !self.unresolved_dependents.is_empty()
    }

    /// Outgoing reference descriptors pointing at `target`.
    pub fn descriptors_for(&self, target: &str) -> Vec<ReferenceDescriptor> {
        self.references
            .iter()
            .filter(|r| r.target == target)
            .map(|r| r.descriptor.clone())
            .collect()
    }
}

/// Resolved site: locales plus every collection of a plan.
#[derive(Debug, Clone)]
pub struct SiteContext {
    site_id: SiteId,
    locales: LocaleSet,
    locale_ids: Vec<LocaleId>,
    collections: Vec<CollectionContext>,
    failures: BTreeMap<String, String>,
    valid: bool,
}

impl SiteContext {
    /// Resolves locales and every collection of `plan`.
    ///
    /// Fails as a whole if the plan is inconsistent or the site has no
    /// primary locale. A collection that is missing, or lacks a required
    /// field, is recorded as a setup failure for that collection only.
    pub async fn resolve(api: &dyn CmsApi, scheduler: &Scheduler, plan: &SyncPlan) -> SyncResult<Self> {
        plan.validate()?;

        let locales = scheduler
            .schedule(api.list_locales(&plan.site_id))
            .await
            .map_err(|e| SyncError::Setup(format!("could not load locales of site {}: {e}", plan.site_id)))?;
        info!(
            site = %plan.site_id,
            primary = %locales.primary().tag,
            locales = locales.len(),
            "site locales resolved"
        );

        let mut collections = Vec::new();
        let mut failures = BTreeMap::new();
        for spec in &plan.collections {
            let resolved = match scheduler.schedule(api.get_collection(&spec.collection_id)).await {
                Ok(schema) => CollectionContext::resolve(spec, &schema),
                Err(e) if e.is_not_found() => Err(SyncError::Setup(format!(
                    "collection '{}' ({}) does not exist",
                    spec.key, spec.collection_id
                ))),
                Err(e) => Err(SyncError::Setup(format!(
                    "could not load collection '{}': {e}",
                    spec.key
                ))),
            };
            match resolved {
                Ok(ctx) => collections.push(ctx),
                Err(e) => {
                    warn!(collection = %spec.key, error = %e, "collection setup failed");
                    failures.insert(spec.key.clone(), e.to_string());
                }
            }
        }

        let edges: Vec<(String, String, CollectionId, Vec<ReferenceDescriptor>)> = collections
            .iter()
            .flat_map(|holder| {
                let mut targets: Vec<&str> = holder.references.iter().map(|r| r.target.as_str()).collect();
                targets.sort_unstable();
                targets.dedup();
                targets.into_iter().map(move |target| {
                    (
                        target.to_string(),
                        holder.key.clone(),
                        holder.collection_id.clone(),
                        holder.descriptors_for(target),
                    )
                })
            })
            .collect();
        for (target, key, collection_id, descriptors) in edges {
            if let Some(ctx) = collections.iter_mut().find(|c| c.key == target) {
                if !ctx.dependents.iter().any(|d| d.key == key) {
                    ctx.dependents.push(Dependent {
                        key,
                        collection_id,
                        descriptors,
                    });
                }
            }
        }
        for ctx in &mut collections {
            ctx.unresolved_dependents = plan
                .dependents_of(&ctx.key)
                .into_iter()
                .map(|(spec, _)| spec.key.clone())
                .filter(|key| failures.contains_key(key))
                .collect();
        }

        Ok(Self {
            site_id: plan.site_id.clone(),
            locale_ids: locales.ids(),
            locales,
            collections,
            failures,
            valid: true,
        })
    }

    pub fn site_id(&self) -> &SiteId {
        &self.site_id
    }

    pub fn locales(&self) -> &LocaleSet {
        &self.locales
    }

    /// Every locale id, primary first.
    pub fn locale_ids(&self) -> &[LocaleId] {
        &self.locale_ids
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The resolved collection for `key`, or the reason it is unusable.
    pub fn collection(&self, key: &str) -> SyncResult<&CollectionContext> {
        if !self.valid {
            return Err(SyncError::Setup(
                "site context was invalidated; resolve it again".to_string(),
            ));
        }
        if let Some(reason) = self.failures.get(key) {
            return Err(SyncError::Setup(reason.clone()));
        }
        self.collections
            .iter()
            .find(|c| c.key == key)
            .ok_or_else(|| SyncError::Setup(format!("collection '{key}' is not part of the plan")))
    }

    /// Resolved collections, in plan order.
    pub fn collections(&self) -> &[CollectionContext] {
        &self.collections
    }

    /// Setup failures by collection key.
    pub fn failures(&self) -> &BTreeMap<String, String> {
        &self.failures
    }

    /// Drops every resolved collection. Entry points refuse an invalidated
    /// context until it is resolved again.
    pub fn invalidate(&mut self) {
        self.collections.clear();
        self.failures.clear();
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_slug_beats_suffixed() {
        let map = FieldMap::from_slugs(&["address", "address-2"]);
        assert_eq!(map.actual("address"), "address");
    }

    #[test]
    fn largest_suffix_wins() {
        let map = FieldMap::from_slugs(&["address-2", "address-10", "address-3"]);
        assert_eq!(map.actual("address"), "address-10");
    }

    #[test]
    fn unknown_key_passes_through() {
        let map = FieldMap::from_slugs(&["name"]);
        assert_eq!(map.actual("summary"), "summary");
        assert_eq!(map.resolve("summary"), None);
    }

    #[test]
    fn remap_rewrites_keys() {
        let map = FieldMap::from_slugs(&["name", "city-2"]);
        let data: FieldData = json!({"name": "Barre", "city": "c1"})
            .as_object()
            .cloned()
            .unwrap()
            .into();
        let remapped = map.remap(data);
        assert_eq!(remapped.get("city-2"), Some(&json!("c1")));
        assert!(!remapped.contains_key("city"));
    }

    #[test]
    fn suffix_parsing() {
        assert_eq!(numeric_suffix("a-12"), Some(("a", 12)));
        assert_eq!(numeric_suffix("a-b"), None);
        assert_eq!(numeric_suffix("-3"), None);
        assert_eq!(numeric_suffix("plain"), None);
    }
}
