//! Store statistics.
//!
//! A quick summary of what the graph holds: totals, per-type and
//! per-relation counts, and what the last build left behind. Used by
//! `trail stats` and `GET /stats`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::error;
use crate::manifest::load_manifest;
use crate::store::GraphStore;

#[derive(Debug, Clone, Serialize)]
pub struct LastBuild {
    pub built_at: DateTime<Utc>,
    pub schema_version: String,
    /// Cursor keys per plugin, e.g. `git: [last_commit_hash]`.
    pub cursor_keys: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub nodes: i64,
    pub edges: i64,
    pub nodes_by_type: BTreeMap<String, i64>,
    pub edges_by_relation: BTreeMap<String, i64>,
    pub last_build: Option<LastBuild>,
}

pub async fn collect_stats(store: &GraphStore) -> error::Result<StatsReport> {
    let totals = store.stats().await?;
    let last_build = load_manifest(store).await?.map(|m| LastBuild {
        built_at: m.built_at,
        schema_version: m.schema_version,
        cursor_keys: m
            .cursors
            .into_iter()
            .map(|(plugin, cursor)| (plugin, cursor.into_keys().collect()))
            .collect(),
    });

    Ok(StatsReport {
        nodes: totals.nodes,
        edges: totals.edges,
        nodes_by_type: store.count_by_type().await?.into_iter().collect(),
        edges_by_relation: store.count_by_relation().await?.into_iter().collect(),
        last_build,
    })
}

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = GraphStore::open(&config.db.path).await?;
    let report = collect_stats(&store).await?;
    let db_size = db_size(&config.db.path);

    println!("codetrail: store stats");
    println!("======================");
    println!();
    println!("  Store:       {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Nodes:       {}", report.nodes);
    for (node_type, count) in &report.nodes_by_type {
        println!("    {:<12} {:>8}", node_type, count);
    }
    println!("  Edges:       {}", report.edges);
    for (relation, count) in &report.edges_by_relation {
        println!("    {:<12} {:>8}", relation, count);
    }
    println!();

    match &report.last_build {
        Some(build) => {
            println!(
                "  Last build:  {} (schema {})",
                format_ts_relative(build.built_at.timestamp()),
                build.schema_version
            );
            for (plugin, keys) in &build.cursor_keys {
                let shown = if keys.is_empty() {
                    "(empty)".to_string()
                } else {
                    keys.join(", ")
                };
                println!("    {:<12} {}", plugin, shown);
            }
        }
        None => println!("  Last build:  never"),
    }
    println!();

    store.close().await;
    Ok(())
}

/// Store file plus its WAL sidecar.
fn db_size(path: &Path) -> u64 {
    let mut wal = path.as_os_str().to_owned();
    wal.push("-wal");
    [path.to_path_buf(), wal.into()]
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub(crate) fn format_ts_relative(ts: i64) -> String {
    let now = Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

pub(crate) fn format_ts_iso(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{save_manifest, BuildManifest, Cursor};
    use crate::models::{Edge, Node, NodeType, Relation};
    use serde_json::json;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative_future_is_absolute() {
        let future = Utc::now().timestamp() + 3600;
        assert_eq!(format_ts_relative(future), format_ts_iso(future));
    }

    #[tokio::test]
    async fn test_collect_stats() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = GraphStore::create(&tmp.path().join("s.sqlite")).await.unwrap();
        assert!(collect_stats(&store).await.unwrap().last_build.is_none());

        store
            .upsert_nodes(vec![
                Node::new(NodeType::Commit, "a"),
                Node::new(NodeType::File, "x.rs"),
                Node::new(NodeType::File, "y.rs"),
            ])
            .await
            .unwrap();
        store
            .upsert_edges(vec![Edge::new("commit:a", "file:x.rs", Relation::Modifies)])
            .await
            .unwrap();

        let mut manifest = BuildManifest::empty();
        let mut cursor = Cursor::new();
        cursor.insert("last_commit_hash".to_string(), json!("a"));
        manifest.set_cursor("git", cursor);
        let mut txn = store.begin().await.unwrap();
        save_manifest(&mut txn, &manifest).await.unwrap();
        txn.commit().await.unwrap();

        let report = collect_stats(&store).await.unwrap();
        assert_eq!(report.nodes, 3);
        assert_eq!(report.nodes_by_type.get("file"), Some(&2));
        assert_eq!(report.edges_by_relation.get("MODIFIES"), Some(&1));
        let build = report.last_build.unwrap();
        assert_eq!(build.cursor_keys.get("git").unwrap(), &vec!["last_commit_hash"]);
    }
}
