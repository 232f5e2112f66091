//! Sequences collection runs for a whole plan.
//!
//! Stages of mutually independent collections run concurrently; their calls
//! interleave inside the engine's shared scheduler. After each stage the
//! remote ids of its collections are resolved so that later stages can
//! translate their references.

use crate::builder::LocalizedFieldBuilder;
use crate::config::{CollectionSpec, SyncPlan};
use crate::context::SiteContext;
use crate::engine::SyncEngine;
use crate::outcome::{CleanupOutcome, SyncOutcome};
use cmsync_types::{ExternalId, LocalEntity, RemoteId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Local entities per collection key.
pub type Datasets = HashMap<String, Vec<LocalEntity>>;

/// Outcomes of one orchestrated run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcomes: Vec<SyncOutcome>,
    pub cleanups: Vec<CleanupOutcome>,
    /// Plan keys with no dataset; left untouched.
    #[serde(default)]
    pub skipped: Vec<String>,
}

impl RunReport {
    pub fn has_errors(&self) -> bool {
        self.outcomes.iter().any(SyncOutcome::has_errors)
            || self.cleanups.iter().any(CleanupOutcome::has_errors)
    }

    pub fn outcome(&self, key: &str) -> Option<&SyncOutcome> {
        self.outcomes.iter().find(|o| o.collection == key)
    }

    pub fn cleanup(&self, key: &str) -> Option<&CleanupOutcome> {
        self.cleanups.iter().find(|o| o.collection == key)
    }
}

/// Runs a [`SyncPlan`] through a [`SyncEngine`].
pub struct Orchestrator<'a> {
    engine: &'a SyncEngine,
    plan: &'a SyncPlan,
    cleanup: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(engine: &'a SyncEngine, plan: &'a SyncPlan) -> Self {
        Self {
            engine,
            plan,
            cleanup: false,
        }
    }

    /// Also delete orphans after syncing, dependents first.
    #[must_use]
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Syncs every collection with a dataset, stage by stage, then runs the
    /// optional cleanup pass in reverse plan order.
    ///
    /// A collection without a dataset is skipped rather than treated as
    /// empty, which would delete all of its items.
    pub async fn run(&self, site: &SiteContext, datasets: &Datasets) -> RunReport {
        let mut report = RunReport::default();
        let mut id_maps: HashMap<String, HashMap<ExternalId, RemoteId>> = HashMap::new();
        let primary_tag = site.locales().primary().tag.clone();

        for (index, stage) in self.plan.stages().into_iter().enumerate() {
            let mut runnable: Vec<(&CollectionSpec, &Vec<LocalEntity>)> = Vec::new();
            for spec in stage {
                match datasets.get(&spec.key) {
                    Some(entities) => runnable.push((spec, entities)),
                    None => {
                        warn!(collection = %spec.key, "no dataset; skipping");
                        report.skipped.push(spec.key.clone());
                    }
                }
            }
            if runnable.is_empty() {
                continue;
            }

            for (spec, _) in &runnable {
                for reference in &spec.references {
                    if !id_maps.contains_key(&reference.target) {
                        self.load_ids(site, &reference.target, &mut id_maps).await;
                    }
                }
            }

            let builders: Vec<LocalizedFieldBuilder> = runnable
                .iter()
                .map(|(spec, _)| {
                    spec.references.iter().fold(
                        LocalizedFieldBuilder::new(primary_tag.clone()),
                        |builder, reference| {
                            let ids = id_maps.get(&reference.target).cloned().unwrap_or_default();
                            builder.with_reference(reference.field_key.clone(), reference.multiplicity, ids)
                        },
                    )
                })
                .collect();

            info!(
                stage = index,
                collections = ?runnable.iter().map(|(s, _)| s.key.as_str()).collect::<Vec<_>>(),
                "syncing stage"
            );
            let outcomes = join_all(runnable.iter().zip(&builders).map(|((spec, entities), builder)| {
                self.engine
                    .sync_collection(site, &spec.key, entities.as_slice(), builder)
            }))
            .await;
            report.outcomes.extend(outcomes);

            for (spec, _) in &runnable {
                self.load_ids(site, &spec.key, &mut id_maps).await;
            }
        }

        if self.cleanup {
            for spec in self.plan.collections.iter().rev() {
                let Some(entities) = datasets.get(&spec.key) else {
                    continue;
                };
                let live: HashSet<ExternalId> = entities.iter().map(|e| e.id.clone()).collect();
                let outcome = self.engine.cleanup_collection(site, &spec.key, &live).await;
                report.cleanups.push(outcome);
            }
        }

        report
    }

    async fn load_ids(
        &self,
        site: &SiteContext,
        key: &str,
        id_maps: &mut HashMap<String, HashMap<ExternalId, RemoteId>>,
    ) {
        match self.engine.resolve_remote_ids(site, key).await {
            Ok(ids) => {
                id_maps.insert(key.to_string(), ids);
            }
            Err(e) => {
                warn!(collection = %key, error = %e, "could not resolve remote ids; references to it are dropped");
                id_maps.insert(key.to_string(), HashMap::new());
            }
        }
    }
}
