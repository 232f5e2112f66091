//! Field data builders.
//!
//! A builder turns a local entity into the field data for one locale, keyed
//! by desired field keys. The engine remaps keys to actual slugs and sets
//! the identifier and slug fields itself.

use cmsync_types::{ExternalId, FieldData, LocalEntity, Multiplicity, RemoteId};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Builds field data for `(entity, locale tag)`.
pub trait FieldBuilder: Send + Sync {
    fn build(&self, entity: &LocalEntity, locale_tag: &str) -> FieldData;
}

impl<F> FieldBuilder for F
where
    F: Fn(&LocalEntity, &str) -> FieldData + Send + Sync,
{
    fn build(&self, entity: &LocalEntity, locale_tag: &str) -> FieldData {
        self(entity, locale_tag)
    }
}

#[derive(Debug, Clone)]
struct ReferenceTranslation {
    field_key: String,
    multiplicity: Multiplicity,
    ids: HashMap<ExternalId, RemoteId>,
}

/// Takes `localized_fields[tag]` as-is (falling back to the primary tag)
/// and rewrites reference fields from local ids to remote ids.
///
/// Local ids with no remote counterpart are dropped with a warning; the
/// referenced item is expected to exist after its own collection syncs.
#[derive(Debug, Clone)]
pub struct LocalizedFieldBuilder {
    fallback_tag: String,
    references: Vec<ReferenceTranslation>,
}

impl LocalizedFieldBuilder {
    pub fn new(fallback_tag: impl Into<String>) -> Self {
        Self {
            fallback_tag: fallback_tag.into(),
            references: Vec::new(),
        }
    }

    /// Translates `field_key` through `ids` (local id → remote id).
    #[must_use]
    pub fn with_reference(
        mut self,
        field_key: impl Into<String>,
        multiplicity: Multiplicity,
        ids: HashMap<ExternalId, RemoteId>,
    ) -> Self {
        self.references.push(ReferenceTranslation {
            field_key: field_key.into(),
            multiplicity,
            ids,
        });
        self
    }

    fn translate(&self, entity: &LocalEntity, reference: &ReferenceTranslation, value: &Value) -> Value {
        let lookup = |raw: &Value| -> Option<Value> {
            let local = raw.as_str().filter(|s| !s.trim().is_empty())?;
            match reference.ids.get(&ExternalId::new(local)) {
                Some(remote) => Some(Value::String(remote.to_string())),
                None => {
                    warn!(
                        entity = %entity.id,
                        field = %reference.field_key,
                        reference = local,
                        "dropping unresolved reference"
                    );
                    None
                }
            }
        };

        match (reference.multiplicity, value) {
            (Multiplicity::Multiple, Value::Array(items)) => {
                Value::Array(items.iter().filter_map(lookup).collect())
            }
            (Multiplicity::Multiple, single) => {
                Value::Array(lookup(single).into_iter().collect())
            }
            (Multiplicity::Single, Value::Array(items)) => {
                items.iter().find_map(lookup).unwrap_or(Value::Null)
            }
            (Multiplicity::Single, single) => lookup(single).unwrap_or(Value::Null),
        }
    }
}

impl FieldBuilder for LocalizedFieldBuilder {
    fn build(&self, entity: &LocalEntity, locale_tag: &str) -> FieldData {
        let mut data: FieldData = entity
            .fields_for(locale_tag, &self.fallback_tag)
            .cloned()
            .unwrap_or_default()
            .into();

        for reference in &self.references {
            if let Some(value) = data.get(&reference.field_key) {
                let translated = self.translate(entity, reference, value);
                data.set(reference.field_key.clone(), translated);
            }
        }
        data
    }
}
