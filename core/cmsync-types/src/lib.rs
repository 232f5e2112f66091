//! Core type definitions for cmsync.
//!
//! This crate defines the plain data model shared by the reconciliation
//! engine and its callers:
//! - Remote and local identifiers (opaque strings, UUID v7 run ids)
//! - Site locales, with exactly one primary locale
//! - Local entities (the declarative source of truth)
//! - Remote rows and the identity groups built from them
//!
//! Nothing here performs I/O. Fetching, diffing and pushing live in
//! `cmsync-engine`.

mod entity;
mod ids;
mod locale;
mod remote;

pub use entity::{Fields, LocalEntity};
pub use ids::{CollectionId, ExternalId, LocaleId, RemoteId, RunId, SiteId};
pub use locale::{Locale, LocaleSet};
pub use remote::{
    FieldData, LocaleVariant, Multiplicity, ReferenceDescriptor, RemoteIdentityGroup, RemoteRow,
};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid locale set: {0}")]
    InvalidLocales(String),
}
