//! Engine, API and plan configuration.

use crate::error::{SyncError, SyncResult};
use cmsync_types::{CollectionId, Multiplicity, SiteId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Maximum items the CMS accepts in one request.
pub const MAX_ITEMS_PER_REQUEST: usize = 100;

/// Page size for item listings.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Connection settings for the CMS REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CmsApiConfig {
    /// Base URL (e.g. `https://api.webflow.com`).
    pub api_base_url: String,
    /// Bearer token. Usually injected from the environment.
    pub api_token: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for CmsApiConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.webflow.com".to_string(),
            api_token: String::new(),
            timeout_secs: 60,
        }
    }
}

/// Token-bucket and spacing limits applied to every remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum burst size.
    pub bucket_capacity: u32,
    /// One token is added per interval.
    pub refill_interval_ms: u64,
    /// Minimum spacing between the starts of two consecutive calls.
    pub min_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // 60 requests/minute steady state with a burst of 10.
        Self {
            bucket_capacity: 10,
            refill_interval_ms: 1_000,
            min_interval_ms: 250,
        }
    }
}

impl RateLimitConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms.max(1))
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Tuning for the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Items requested per listing page.
    pub page_size: usize,
    /// Per-request item limit of the CMS.
    pub max_items_per_request: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_items_per_request: MAX_ITEMS_PER_REQUEST,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// A reference field declared on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSpec {
    /// Desired field key (remapped to the actual slug at resolve time).
    pub field_key: String,
    pub multiplicity: Multiplicity,
    /// Key of the referenced collection in the plan.
    pub target: String,
}

/// Declarative description of one collection to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Plan-local key (e.g. `cities`), also the dataset key.
    pub key: String,
    pub collection_id: CollectionId,
    #[serde(default = "default_identifier_field")]
    pub identifier_field: String,
    #[serde(default = "default_slug_field")]
    pub slug_field: String,
    /// Fields that must exist on the remote schema before syncing.
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub references: Vec<ReferenceSpec>,
}

fn default_identifier_field() -> String {
    "external-id".to_string()
}

fn default_slug_field() -> String {
    "slug".to_string()
}

impl CollectionSpec {
    pub fn new(key: impl Into<String>, collection_id: impl Into<CollectionId>) -> Self {
        Self {
            key: key.into(),
            collection_id: collection_id.into(),
            identifier_field: default_identifier_field(),
            slug_field: default_slug_field(),
            required_fields: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Builder-style reference declaration.
    #[must_use]
    pub fn with_reference(
        mut self,
        field_key: impl Into<String>,
        multiplicity: Multiplicity,
        target: impl Into<String>,
    ) -> Self {
        self.references.push(ReferenceSpec {
            field_key: field_key.into(),
            multiplicity,
            target: target.into(),
        });
        self
    }

    /// Returns true if any reference field points at `key`.
    pub fn references_collection(&self, key: &str) -> bool {
        self.references.iter().any(|r| r.target == key)
    }
}

/// The collections of one site, in dependency order: referenced
/// collections are declared before the collections that reference them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub site_id: SiteId,
    pub collections: Vec<CollectionSpec>,
}

impl SyncPlan {
    pub fn new(site_id: impl Into<SiteId>, collections: Vec<CollectionSpec>) -> Self {
        Self {
            site_id: site_id.into(),
            collections,
        }
    }

    /// Checks that keys are unique and that every reference points at a
    /// collection declared earlier (or at itself). The declared order is
    /// never changed.
    pub fn validate(&self) -> SyncResult<()> {
        let mut declared: HashSet<&str> = HashSet::new();
        for spec in &self.collections {
            if !declared.insert(spec.key.as_str()) {
                return Err(SyncError::Setup(format!(
                    "collection key '{}' is declared twice",
                    spec.key
                )));
            }
            for reference in &spec.references {
                if reference.target != spec.key && !declared.contains(reference.target.as_str()) {
                    return Err(SyncError::Setup(format!(
                        "collection '{}' references '{}' which is not declared before it",
                        spec.key, reference.target
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&CollectionSpec> {
        self.collections.iter().find(|c| c.key == key)
    }

    /// Collections that hold references to `key`, with the matching fields.
    pub fn dependents_of(&self, key: &str) -> Vec<(&CollectionSpec, Vec<&ReferenceSpec>)> {
        self.collections
            .iter()
            .filter_map(|spec| {
                let fields: Vec<&ReferenceSpec> =
                    spec.references.iter().filter(|r| r.target == key).collect();
                (!fields.is_empty()).then_some((spec, fields))
            })
            .collect()
    }

    /// Splits the declared order into stages of consecutive collections that
    /// do not reference each other. Collections within a stage may be
    /// reconciled concurrently.
    pub fn stages(&self) -> Vec<Vec<&CollectionSpec>> {
        let mut stages: Vec<Vec<&CollectionSpec>> = Vec::new();
        let mut current: Vec<&CollectionSpec> = Vec::new();

        for spec in &self.collections {
            let depends_on_current = current.iter().any(|other| {
                spec.references_collection(&other.key) || other.references_collection(&spec.key)
            });
            if depends_on_current {
                stages.push(std::mem::take(&mut current));
            }
            current.push(spec);
        }
        if !current.is_empty() {
            stages.push(current);
        }
        stages
    }
}
