//! Build orchestration.
//!
//! A build runs every selected plugin concurrently, then writes all of
//! their output and the new manifest in one store transaction:
//!
//! ```text
//! Idle ─▶ Running ─┬─▶ Committed
//!                  └─▶ Failed      (store and manifest untouched)
//! ```
//!
//! A plugin that errors, panics or times out is reported in the summary and
//! keeps its previous cursor; the rest of the build still commits. Only a
//! failure of the store transaction itself fails the build.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, TrailError};
use crate::manifest::{load_manifest, save_manifest, BuildManifest, Cursor};
use crate::migrate;
use crate::plugin::{IngestContext, IngestOutput, PluginRegistry};
use crate::store::GraphStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Idle,
    Running,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginReport {
    pub name: String,
    pub status: PluginStatus,
    pub nodes_processed: usize,
    pub edges_processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    /// Growth of the node table during this build.
    pub total_nodes_added: i64,
    /// Growth of the edge table during this build.
    pub total_edges_added: i64,
    pub per_plugin: Vec<PluginReport>,
    pub build_timestamp: DateTime<Utc>,
    pub state: BuildState,
}

impl BuildSummary {
    pub fn failed_plugins(&self) -> impl Iterator<Item = &PluginReport> {
        self.per_plugin
            .iter()
            .filter(|p| p.status != PluginStatus::Succeeded)
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Ignore stored cursors and hand every plugin an empty one.
    pub full: bool,
    /// Plugins to run; empty means all registered.
    pub plugins: Vec<String>,
    pub plugin_timeout: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            full: false,
            plugins: Vec::new(),
            plugin_timeout: Duration::from_secs(300),
        }
    }
}

/// Advisory lock held for the whole of a build.
///
/// The lock lives on `<db>.lock` next to the store, so a second build
/// against the same store fails instead of interleaving writes.
pub struct BuildLock {
    _file: File,
    path: PathBuf,
}

impl BuildLock {
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let path = lock_path(db_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| TrailError::store(format!("{}: {}", path.display(), e)))?;

        file.try_lock_exclusive().map_err(|_| {
            TrailError::StoreUnavailable(format!(
                "another build is running (lock held on {})",
                path.display()
            ))
        })?;

        debug!(lock = %path.display(), "build lock acquired");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Run one build. See the module docs for the failure model.
pub async fn run_build(
    store: &GraphStore,
    registry: &PluginRegistry,
    options: &BuildOptions,
) -> Result<BuildSummary> {
    let selected = select_plugins(registry, &options.plugins)?;
    let _lock = BuildLock::acquire(store.path())?;

    let mut state = BuildState::Idle;
    let prior = load_manifest(store).await?.unwrap_or_else(BuildManifest::empty);
    let now = Utc::now();
    let ctx = IngestContext::new(now);

    state = transition(state, BuildState::Running);
    info!(
        plugins = ?selected,
        full = options.full,
        "build started"
    );

    let mut handles = Vec::with_capacity(selected.len());
    for name in &selected {
        let Some(plugin) = registry.get(name) else {
            continue;
        };
        let cursor = if options.full {
            Cursor::new()
        } else {
            prior.cursor_for(name)
        };
        let ctx = ctx.clone();
        let timeout = options.plugin_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::timeout(timeout, plugin.ingest(&cursor, &ctx)).await
        });
        handles.push((name.clone(), handle));
    }

    // Handles are in name order, so the aggregate is too.
    let mut reports = Vec::with_capacity(handles.len());
    let mut outputs: Vec<(String, IngestOutput)> = Vec::new();
    for (name, handle) in handles {
        let (status, result) = match handle.await {
            Ok(Ok(Ok(output))) => (PluginStatus::Succeeded, Ok(output)),
            Ok(Ok(Err(e))) => (
                PluginStatus::Failed,
                Err(TrailError::SourceUnavailable {
                    plugin: name.clone(),
                    message: format!("{:#}", e),
                }),
            ),
            Ok(Err(_elapsed)) => (
                PluginStatus::TimedOut,
                Err(TrailError::SourceUnavailable {
                    plugin: name.clone(),
                    message: format!("timed out after {:?}", options.plugin_timeout),
                }),
            ),
            Err(join) => (
                PluginStatus::Failed,
                Err(TrailError::SourceUnavailable {
                    plugin: name.clone(),
                    message: format!("plugin task aborted: {}", join),
                }),
            ),
        };

        match result {
            Ok(output) => {
                debug!(
                    plugin = %name,
                    nodes = output.nodes.len(),
                    edges = output.edges.len(),
                    "plugin finished"
                );
                reports.push(PluginReport {
                    name: name.clone(),
                    status,
                    nodes_processed: output.nodes.len(),
                    edges_processed: output.edges.len(),
                    error_message: None,
                });
                outputs.push((name, output));
            }
            Err(e) => {
                warn!(plugin = %name, error = %e, "plugin failed; keeping previous cursor");
                reports.push(PluginReport {
                    name,
                    status,
                    nodes_processed: 0,
                    edges_processed: 0,
                    error_message: Some(e.to_string()),
                });
            }
        }
    }

    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    let mut manifest = BuildManifest {
        schema_version: migrate::schema_version_string(),
        built_at: now,
        node_count: 0,
        edge_count: 0,
        cursors: prior.cursors.clone(),
    };
    for (name, output) in outputs {
        for node in &output.nodes {
            for problem in node.validate() {
                warn!(plugin = %name, "{}", problem);
            }
        }
        nodes.extend(output.nodes);
        edges.extend(output.edges);
        manifest.set_cursor(&name, output.cursor);
    }

    let committed = store
        .with_transaction(move |txn| {
            Box::pin(async move {
                let before = txn.stats().await?;
                txn.upsert_nodes(&nodes).await?;
                txn.upsert_edges(&edges).await?;
                let after = txn.stats().await?;
                manifest.node_count = after.nodes;
                manifest.edge_count = after.edges;
                save_manifest(txn, &manifest).await?;
                Ok::<_, TrailError>((before, after))
            })
        })
        .await;

    let (before, after) = match committed {
        Ok(counts) => counts,
        Err(e) => {
            transition(state, BuildState::Failed);
            warn!(error = %e, "build rolled back");
            return Err(match e {
                TrailError::TransactionFailure(_) => e,
                other => TrailError::transaction(other),
            });
        }
    };
    state = transition(state, BuildState::Committed);

    let summary = BuildSummary {
        total_nodes_added: after.nodes - before.nodes,
        total_edges_added: after.edges - before.edges,
        per_plugin: reports,
        build_timestamp: now,
        state,
    };
    info!(
        nodes_added = summary.total_nodes_added,
        edges_added = summary.total_edges_added,
        failed = summary.failed_plugins().count(),
        "build committed"
    );
    Ok(summary)
}

/// CLI entry point: build from the configured plugins and print a summary.
pub async fn run_build_command(config: &Config, full: bool, plugins: Vec<String>) -> anyhow::Result<()> {
    let store = GraphStore::open(&config.db.path).await?;
    let registry = PluginRegistry::from_config(config);
    if registry.is_empty() {
        anyhow::bail!("no plugins configured; add a [plugins.git], [plugins.github] or [plugins.adr] section");
    }

    let options = BuildOptions {
        full,
        plugins,
        plugin_timeout: Duration::from_secs(config.build.plugin_timeout_secs),
    };
    let summary = run_build(&store, &registry, &options).await;
    store.close().await;
    let summary = summary?;

    println!("build{}", if full { " (full)" } else { "" });
    for p in &summary.per_plugin {
        match &p.error_message {
            None => println!(
                "  {:<10} ok      {} nodes, {} edges",
                p.name, p.nodes_processed, p.edges_processed
            ),
            Some(msg) => println!("  {:<10} {:<7} {}", p.name, status_label(p.status), msg),
        }
    }
    println!("  nodes added: {}", summary.total_nodes_added);
    println!("  edges added: {}", summary.total_edges_added);
    println!("ok");
    Ok(())
}

fn status_label(status: PluginStatus) -> &'static str {
    match status {
        PluginStatus::Succeeded => "ok",
        PluginStatus::Failed => "failed",
        PluginStatus::TimedOut => "timeout",
    }
}

fn transition(from: BuildState, to: BuildState) -> BuildState {
    debug!(?from, ?to, "build state");
    to
}

/// Requested plugin names, validated against the registry, in name order.
fn select_plugins(registry: &PluginRegistry, requested: &[String]) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(registry.names());
    }

    let mut selected = Vec::with_capacity(requested.len());
    for name in requested {
        if registry.get(name).is_none() {
            return Err(TrailError::Config(format!(
                "unknown plugin '{}'; available: {}",
                name,
                registry.names().join(", ")
            )));
        }
        selected.push(name.clone());
    }
    selected.sort();
    selected.dedup();
    Ok(selected)
}
