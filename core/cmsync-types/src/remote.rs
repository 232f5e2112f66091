//! Remote rows, identity groups and reference descriptors.

use crate::{ExternalId, LocaleId, RemoteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Field data of one item in one locale, keyed by actual remote field slug.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldData(Map<String, Value>);

impl FieldData {
    /// Creates empty field data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Borrows the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consumes the wrapper, returning the JSON object.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Sets a field, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The identifier stored in `key`, if it is a non-blank string.
    pub fn identifier(&self, key: &str) -> Option<ExternalId> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(ExternalId::new(s.trim())),
            _ => None,
        }
    }

    /// A single-reference field: the referenced remote id, if set.
    pub fn reference(&self, key: &str) -> Option<RemoteId> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(RemoteId::new(s.as_str())),
            _ => None,
        }
    }

    /// A multi-reference field: every referenced remote id, in order.
    /// Non-string entries are ignored.
    pub fn references(&self, key: &str) -> Vec<RemoteId> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(RemoteId::new)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Returns true if any field in `self` has a different value in
    /// `current`.
    ///
    /// Only keys present in `self` are compared, so extra fields the remote
    /// side reports are ignored. Null, empty strings and empty arrays are
    /// treated as absent. Nested objects are compared as subsets.
    pub fn differs_from(&self, current: &FieldData) -> bool {
        self.0
            .iter()
            .any(|(key, desired)| !values_match(desired, current.0.get(key)))
    }
}

impl From<Map<String, Value>> for FieldData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for FieldData {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn values_match(desired: &Value, current: Option<&Value>) -> bool {
    let current = match current {
        Some(v) if !is_blank(v) => v,
        _ => return is_blank(desired),
    };

    match (desired, current) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_match(x, Some(y)))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.iter().all(|(key, value)| values_match(value, b.get(key)))
        }
        (a, b) => !is_blank(a) && a == b,
    }
}

/// One row of the remote listing: a single locale variant of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub remote_id: RemoteId,
    pub locale_id: LocaleId,
    pub field_data: FieldData,
    #[serde(default)]
    pub last_published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(default)]
    pub is_archived: bool,
}

impl RemoteRow {
    /// Creates a row with no publish metadata.
    pub fn new(remote_id: impl Into<RemoteId>, locale_id: impl Into<LocaleId>, field_data: FieldData) -> Self {
        Self {
            remote_id: remote_id.into(),
            locale_id: locale_id.into(),
            field_data,
            last_published: None,
            last_updated: None,
            is_draft: false,
            is_archived: false,
        }
    }

    /// Whether the staged content of this row is ahead of the live site.
    pub fn needs_publish(&self) -> bool {
        if self.is_archived || self.is_draft {
            return false;
        }
        match (self.last_published, self.last_updated) {
            (None, _) => true,
            (Some(published), Some(updated)) => updated > published,
            (Some(_), None) => false,
        }
    }

    /// Splits the row into its item id and locale variant.
    pub fn into_variant(self) -> (RemoteId, LocaleVariant) {
        let pending_publish = self.needs_publish();
        (
            self.remote_id,
            LocaleVariant {
                locale_id: self.locale_id,
                field_data: self.field_data,
                pending_publish,
            },
        )
    }
}

/// One localized copy of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocaleVariant {
    pub locale_id: LocaleId,
    pub field_data: FieldData,
    /// Staged content not yet live.
    #[serde(default)]
    pub pending_publish: bool,
}

impl LocaleVariant {
    pub fn new(locale_id: impl Into<LocaleId>, field_data: FieldData) -> Self {
        Self {
            locale_id: locale_id.into(),
            field_data,
            pending_publish: false,
        }
    }
}

/// The set of locale variants sharing one remote id.
///
/// `corrupted` is true iff the variants disagree on the identifier field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteIdentityGroup {
    pub remote_id: RemoteId,
    /// First identifier value observed across the variants.
    pub identifier: ExternalId,
    pub variants: Vec<LocaleVariant>,
    pub corrupted: bool,
}

impl RemoteIdentityGroup {
    /// Builds a group from its variants, reading the identifier from
    /// `identifier_field`.
    ///
    /// Returns `None` if no variant carries an identifier; such a group
    /// cannot be mapped to any local entity.
    pub fn from_variants(
        remote_id: RemoteId,
        variants: Vec<LocaleVariant>,
        identifier_field: &str,
    ) -> Option<Self> {
        let mut distinct: Vec<ExternalId> = Vec::new();
        for variant in &variants {
            if let Some(value) = variant.field_data.identifier(identifier_field) {
                if !distinct.contains(&value) {
                    distinct.push(value);
                }
            }
        }

        let corrupted = distinct.len() > 1;
        let identifier = distinct.into_iter().next()?;

        Some(Self {
            remote_id,
            identifier,
            variants,
            corrupted,
        })
    }

    /// The locale ids this group has variants for.
    pub fn locale_ids(&self) -> BTreeSet<&LocaleId> {
        self.variants.iter().map(|v| &v.locale_id).collect()
    }

    pub fn variant(&self, locale_id: &LocaleId) -> Option<&LocaleVariant> {
        self.variants.iter().find(|v| &v.locale_id == locale_id)
    }

    /// Required locales with no variant in this group.
    pub fn missing_locales<'a>(&self, required: &'a [LocaleId]) -> Vec<&'a LocaleId> {
        let present = self.locale_ids();
        required.iter().filter(|l| !present.contains(l)).collect()
    }

    /// True if any variant has staged content that is not live yet.
    pub fn needs_publish(&self) -> bool {
        self.variants.iter().any(|v| v.pending_publish)
    }

    /// The slug of the first variant that has one.
    pub fn slug(&self, slug_field: &str) -> Option<&str> {
        self.variants
            .iter()
            .find_map(|v| v.field_data.get(slug_field).and_then(Value::as_str))
    }
}

/// How many remote ids a reference field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Multiplicity {
    Single,
    Multiple,
}

/// A field on a referencing collection that stores remote id(s) of another
/// collection's items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceDescriptor {
    pub field_key: String,
    pub multiplicity: Multiplicity,
}

impl ReferenceDescriptor {
    pub fn single(field_key: impl Into<String>) -> Self {
        Self {
            field_key: field_key.into(),
            multiplicity: Multiplicity::Single,
        }
    }

    pub fn multiple(field_key: impl Into<String>) -> Self {
        Self {
            field_key: field_key.into(),
            multiplicity: Multiplicity::Multiple,
        }
    }

    /// Remote ids this field currently holds in `data`.
    pub fn referenced_ids(&self, data: &FieldData) -> Vec<RemoteId> {
        match self.multiplicity {
            Multiplicity::Single => data.reference(&self.field_key).into_iter().collect(),
            Multiplicity::Multiple => data.references(&self.field_key),
        }
    }
}
