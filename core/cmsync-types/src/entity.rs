//! Local entities, the declarative source of truth.

use crate::ExternalId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Field values for one locale, keyed by desired field key.
pub type Fields = Map<String, Value>;

/// One business object as described locally.
///
/// Supplied fresh by the caller on every run and never mutated by the
/// engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    /// Stable external identifier.
    pub id: ExternalId,
    /// Human-readable path segment.
    pub slug: String,
    /// Locale tag → field values.
    #[serde(default)]
    pub localized_fields: BTreeMap<String, Fields>,
}

impl LocalEntity {
    /// Creates an entity with no field values.
    pub fn new(id: impl Into<ExternalId>, slug: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slug: slug.into(),
            localized_fields: BTreeMap::new(),
        }
    }

    /// Builder-style setter for one locale's fields.
    #[must_use]
    pub fn with_fields(mut self, tag: impl Into<String>, fields: Fields) -> Self {
        self.localized_fields.insert(tag.into(), fields);
        self
    }

    /// Fields for `tag`, falling back to `fallback_tag` when the entity has
    /// no content for that locale.
    pub fn fields_for(&self, tag: &str, fallback_tag: &str) -> Option<&Fields> {
        self.localized_fields
            .get(tag)
            .or_else(|| self.localized_fields.get(fallback_tag))
    }
}
