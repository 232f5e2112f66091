//! Site locales.

use crate::{Error, LocaleId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One locale configured on the remote site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locale {
    /// CMS locale id, used in every item request.
    pub id: LocaleId,
    /// Language tag (e.g. `en`, `fr-CA`), used to pick local field values.
    pub tag: String,
    /// Whether this is the site's primary locale.
    #[serde(default)]
    pub primary: bool,
}

impl Locale {
    /// Creates a secondary locale.
    pub fn new(id: impl Into<LocaleId>, tag: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tag: tag.into(),
            primary: false,
        }
    }

    /// Creates the primary locale.
    pub fn primary(id: impl Into<LocaleId>, tag: impl Into<String>) -> Self {
        Self {
            primary: true,
            ..Self::new(id, tag)
        }
    }
}

/// The configured locales of a site. Always holds exactly one primary
/// locale, stored first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Locale>", into = "Vec<Locale>")]
pub struct LocaleSet {
    locales: Vec<Locale>,
}

impl LocaleSet {
    /// Builds a locale set, moving the primary locale to the front.
    ///
    /// Fails if there is not exactly one primary locale or if a locale id
    /// appears twice.
    pub fn new(mut locales: Vec<Locale>) -> crate::Result<Self> {
        let primaries = locales.iter().filter(|l| l.primary).count();
        if primaries != 1 {
            return Err(Error::InvalidLocales(format!(
                "expected exactly one primary locale, found {primaries}"
            )));
        }

        let mut seen = HashSet::new();
        for locale in &locales {
            if !seen.insert(&locale.id) {
                return Err(Error::InvalidLocales(format!(
                    "duplicate locale id {}",
                    locale.id
                )));
            }
        }

        if let Some(pos) = locales.iter().position(|l| l.primary) {
            let primary = locales.remove(pos);
            locales.insert(0, primary);
        }

        Ok(Self { locales })
    }

    /// The primary locale.
    pub fn primary(&self) -> &Locale {
        &self.locales[0]
    }

    /// All non-primary locales, in configured order.
    pub fn secondary(&self) -> impl Iterator<Item = &Locale> {
        self.locales.iter().skip(1)
    }

    /// All locales, primary first.
    pub fn iter(&self) -> impl Iterator<Item = &Locale> {
        self.locales.iter()
    }

    /// All locale ids, primary first.
    pub fn ids(&self) -> Vec<LocaleId> {
        self.locales.iter().map(|l| l.id.clone()).collect()
    }

    /// Looks up a locale by id.
    pub fn get(&self, id: &LocaleId) -> Option<&Locale> {
        self.locales.iter().find(|l| &l.id == id)
    }

    /// Returns true if the locale id is configured.
    pub fn contains(&self, id: &LocaleId) -> bool {
        self.get(id).is_some()
    }

    /// Number of configured locales (never zero).
    pub fn len(&self) -> usize {
        self.locales.len()
    }

    /// Always false; a locale set holds at least the primary locale.
    pub fn is_empty(&self) -> bool {
        self.locales.is_empty()
    }
}

impl TryFrom<Vec<Locale>> for LocaleSet {
    type Error = Error;

    fn try_from(locales: Vec<Locale>) -> Result<Self, Self::Error> {
        Self::new(locales)
    }
}

impl From<LocaleSet> for Vec<Locale> {
    fn from(set: LocaleSet) -> Self {
        set.locales
    }
}
