//! Reconciliation engine for a rate-limited, multi-locale headless CMS.
//!
//! Converges remote collections on a declarative local dataset. Every
//! remote item exists once per locale under a shared remote id; items
//! reference each other, and the CMS refuses to delete a referenced item.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Scheduler**: token bucket plus minimum spacing, one call at a time
//! - **Remote State Reader**: pages through a collection and groups rows
//!   into identity groups, flagging corrupted ones
//! - **Categorizer**: decides create, recreate, update or delete
//! - **Batch Operators**: chunked create, update, double delete and publish
//! - **Reference Cleaner**: strips dangling references before a delete
//! - **Orchestrator**: runs a whole plan in dependency order
//!
//! The engine holds no state across runs. Every run re-reads the remote
//! collection, so repeated runs heal partial failures and manual edits.
//!
//! # Example
//!
//! ```no_run
//! use cmsync_engine::{EngineConfig, Orchestrator, SyncEngine, SyncPlan};
//! use cmsync_engine::cms::mock::MockCms;
//! use std::sync::Arc;
//!
//! # async fn run(plan: SyncPlan) -> cmsync_engine::SyncResult<()> {
//! let engine = SyncEngine::new(Arc::new(MockCms::new()), EngineConfig::default());
//! let site = engine.resolve_site(&plan).await?;
//! let report = Orchestrator::new(&engine, &plan)
//!     .run(&site, &Default::default())
//!     .await;
//! assert!(!report.has_errors());
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod builder;
pub mod categorize;
pub mod cms;
pub mod config;
pub mod context;
mod engine;
mod error;
mod orchestrator;
pub mod outcome;
pub mod reader;
pub mod references;
pub mod scheduler;

pub use batch::{BatchOperator, BatchReport, ItemUpdate, NewItem};
pub use builder::{FieldBuilder, LocalizedFieldBuilder};
pub use categorize::{Categorization, DeleteCandidate, DeleteReason, Recreate, Update, categorize};
pub use cms::{CmsApi, HttpCmsClient};
pub use config::{
    CmsApiConfig, CollectionSpec, EngineConfig, RateLimitConfig, ReferenceSpec, SyncPlan,
    DEFAULT_PAGE_SIZE, MAX_ITEMS_PER_REQUEST,
};
pub use context::{CollectionContext, Dependent, FieldMap, ResolvedReference, SiteContext};
pub use engine::{SyncEngine, validate_entities};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{Datasets, Orchestrator, RunReport};
pub use outcome::{
    CleanupOutcome, IssueLog, ReferenceCleanupOutcome, SyncIssue, SyncOutcome, SyncStage,
};
pub use reader::{RemoteState, RemoteStateReader};
pub use references::ReferenceCleaner;
pub use scheduler::Scheduler;
