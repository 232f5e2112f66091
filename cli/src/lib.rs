//! Config loading, dataset loading and report rendering for the `cmsync`
//! binary.

use anyhow::{Context, Result, bail};
use cmsync_engine::{
    CmsApi, CmsApiConfig, Datasets, EngineConfig, HttpCmsClient, Orchestrator, RunReport,
    SyncEngine, SyncPlan,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Environment variable that overrides `api.api_token`.
pub const TOKEN_ENV: &str = "CMSYNC_API_TOKEN";

/// Everything the binary needs besides the dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub api: CmsApiConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub plan: SyncPlan,
}

impl CliConfig {
    /// Reads a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: CliConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config
            .plan
            .validate()
            .with_context(|| format!("invalid plan in {}", path.display()))?;
        Ok(config)
    }

    /// Replaces the API token when `token` is set and non-empty.
    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            self.api.api_token = token;
        }
        self
    }
}

/// Reads `{ "<collection key>": [LocalEntity, ...] }`.
pub fn load_datasets(path: &Path) -> Result<Datasets> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read dataset {}", path.display()))?;
    let datasets: Datasets = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse dataset {}", path.display()))?;
    Ok(datasets)
}

/// Keys of `datasets` that the plan does not know about.
pub fn unknown_keys<'a>(plan: &SyncPlan, datasets: &'a Datasets) -> Vec<&'a str> {
    let mut keys: Vec<&str> = datasets
        .keys()
        .map(String::as_str)
        .filter(|key| plan.get(key).is_none())
        .collect();
    keys.sort_unstable();
    keys
}

/// Resolves the site and runs the whole plan against `api`.
pub async fn run_plan(
    api: Arc<dyn CmsApi>,
    config: &CliConfig,
    datasets: &Datasets,
    cleanup: bool,
) -> Result<RunReport> {
    for key in unknown_keys(&config.plan, datasets) {
        warn!(collection = key, "dataset has no matching plan entry; ignored");
    }

    let engine = SyncEngine::new(api, config.engine.clone());
    let site = engine
        .resolve_site(&config.plan)
        .await
        .with_context(|| format!("failed to resolve site {}", config.plan.site_id))?;
    for (key, reason) in site.failures() {
        warn!(collection = %key, %reason, "collection unavailable");
    }

    let report = Orchestrator::new(&engine, &config.plan)
        .with_cleanup(cleanup)
        .run(&site, datasets)
        .await;
    info!(
        collections = report.outcomes.len(),
        cleanups = report.cleanups.len(),
        skipped = report.skipped.len(),
        errors = report.has_errors(),
        "run finished"
    );
    Ok(report)
}

/// Runs the plan against the configured HTTP API.
pub async fn run(config: &CliConfig, datasets: &Datasets, cleanup: bool) -> Result<RunReport> {
    if config.api.api_token.trim().is_empty() {
        bail!("no API token: set {TOKEN_ENV} or api.api_token in the config");
    }
    let client = HttpCmsClient::new(config.api.clone()).context("failed to build HTTP client")?;
    run_plan(Arc::new(client), config, datasets, cleanup).await
}

/// Human-readable per-collection summary.
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();

    for outcome in &report.outcomes {
        let _ = writeln!(
            out,
            "{:<16} created {:>4}  updated {:>4}  deleted {:>4}  published {:>4}  refs {:>4}",
            outcome.collection,
            outcome.created,
            outcome.updated,
            outcome.deleted,
            outcome.published,
            outcome.references_updated,
        );
        for issue in &outcome.errors {
            let _ = writeln!(out, "  error: {issue}");
        }
        for issue in &outcome.warnings {
            let _ = writeln!(out, "  warning: {issue}");
        }
    }

    for cleanup in &report.cleanups {
        let _ = writeln!(
            out,
            "{:<16} cleanup: deleted {:>4}  refs {:>4}  skipped {:>4}",
            cleanup.collection, cleanup.deleted, cleanup.references_updated, cleanup.skipped,
        );
        for issue in &cleanup.errors {
            let _ = writeln!(out, "  error: {issue}");
        }
    }

    for key in &report.skipped {
        let _ = writeln!(out, "{key:<16} skipped (no dataset)");
    }

    out
}
