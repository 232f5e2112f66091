//! CMS backends.
//!
//! [`CmsApi`] is the only seam between the engine and the remote service.
//! [`HttpCmsClient`] talks to the Webflow-style v2 REST API; [`mock::MockCms`]
//! is an in-memory stand-in for tests and dry runs.

pub mod api;
pub mod http;
pub mod mock;

pub use api::{CmsApi, CollectionSchema, ItemPage, ItemPatch, ItemTarget, SchemaField};
pub use http::HttpCmsClient;
