//! "Why does this line exist?" traces.
//!
//! Starting from a commit, a trace walks a fixed chain of typed hops:
//!
//! ```text
//! commit ◀─MERGES── pr ──MENTIONS─▶ issue ◀─DECIDES── adr
//! ```
//!
//! The walk is breadth-first and stops after `max_hops` levels or
//! `max_results` hits. Each level is ordered newest first, and closer
//! levels come before farther ones, so the same graph always yields the
//! same trace. The seed itself is never part of the result.

use anyhow::Context;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::config::{Config, TraceConfig};
use crate::error::Result;
use crate::models::{Edge, Node, NodeType, Relation};
use crate::plugin_git::GitBlameResolver;
use crate::store::GraphStore;

/// Maps a source location to the commit node that last changed it.
pub trait SeedResolver: Send + Sync {
    /// `Ok(None)` for lines that are not committed yet.
    fn resolve_file_line(&self, path: &Path, line: usize) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceOptions {
    pub max_hops: usize,
    pub max_results: usize,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            max_hops: 3,
            max_results: 3,
        }
    }
}

impl From<&TraceConfig> for TraceOptions {
    fn from(cfg: &TraceConfig) -> Self {
        Self {
            max_hops: cfg.max_hops,
            max_results: cfg.max_results,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

/// One hop rule: from a node of some type, follow `relation` in
/// `direction` to a node of type `target`.
struct Step {
    direction: Direction,
    relation: Relation,
    target: NodeType,
}

fn step_from(node_type: &NodeType) -> Option<Step> {
    match node_type {
        NodeType::Commit => Some(Step {
            direction: Direction::Inbound,
            relation: Relation::Merges,
            target: NodeType::PullRequest,
        }),
        NodeType::PullRequest => Some(Step {
            direction: Direction::Outbound,
            relation: Relation::Mentions,
            target: NodeType::Issue,
        }),
        NodeType::Issue => Some(Step {
            direction: Direction::Inbound,
            relation: Relation::Decides,
            target: NodeType::Adr,
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceHit {
    /// Distance from the seed, starting at 1.
    pub hop: usize,
    pub relation: Relation,
    /// Id of the node this hit was reached from.
    pub via: String,
    pub node: Node,
}

/// Trace from `seed`. Unknown seeds and seeds with no matching edges
/// yield an empty trace.
pub async fn trace(store: &GraphStore, seed: &str, options: TraceOptions) -> Result<Vec<TraceHit>> {
    let mut results = Vec::new();
    if options.max_hops == 0 || options.max_results == 0 {
        return Ok(results);
    }

    let Some(seed_node) = store.get_node(seed).await? else {
        debug!(seed, "trace seed not in store");
        return Ok(results);
    };

    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(seed_node.id.clone());
    let mut frontier = vec![seed_node];

    for hop in 1..=options.max_hops {
        let mut level: Vec<TraceHit> = Vec::new();

        for node in &frontier {
            let Some(step) = step_from(&node.node_type) else {
                continue;
            };
            let edges = match step.direction {
                Direction::Inbound => store.edges_to(&node.id, Some(step.relation)).await?,
                Direction::Outbound => store.edges_from(&node.id, Some(step.relation)).await?,
            };

            for edge in edges {
                let other = far_end(&edge, step.direction);
                if visited.contains(other) {
                    continue;
                }
                let Some(found) = store.get_node(other).await? else {
                    debug!(from = %node.id, to = other, "skipping dangling edge");
                    continue;
                };
                if found.node_type != step.target {
                    continue;
                }
                visited.insert(found.id.clone());
                level.push(TraceHit {
                    hop,
                    relation: step.relation,
                    via: node.id.clone(),
                    node: found,
                });
            }
        }

        if level.is_empty() {
            break;
        }
        sort_newest_first(&mut level);

        frontier = Vec::with_capacity(level.len());
        for hit in level {
            frontier.push(hit.node.clone());
            results.push(hit);
            if results.len() >= options.max_results {
                return Ok(results);
            }
        }
    }

    Ok(results)
}

/// Run `resolver` on the blocking pool; blame shells out to git.
pub async fn resolve_seed(
    resolver: Arc<dyn SeedResolver>,
    path: &Path,
    line: usize,
) -> anyhow::Result<Option<String>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || resolver.resolve_file_line(&path, line))
        .await
        .context("seed resolution task failed")?
}

/// Resolve `path:line` through `resolver`, then trace from the commit.
/// Returns the resolved seed alongside the hits.
pub async fn trace_file_line(
    store: &GraphStore,
    resolver: Arc<dyn SeedResolver>,
    path: &Path,
    line: usize,
    options: TraceOptions,
) -> anyhow::Result<(Option<String>, Vec<TraceHit>)> {
    let Some(seed) = resolve_seed(resolver, path, line).await? else {
        return Ok((None, Vec::new()));
    };
    let hits = trace(store, &seed, options).await?;
    Ok((Some(seed), hits))
}

/// What `trail trace` starts from.
#[derive(Debug, Clone)]
pub enum TraceTarget {
    Node(String),
    FileLine { path: PathBuf, line: usize },
}

/// CLI entry point: run a trace and print it to stdout.
pub async fn run_trace(
    config: &Config,
    target: &TraceTarget,
    options: TraceOptions,
    json: bool,
) -> anyhow::Result<()> {
    let store = GraphStore::open(&config.db.path).await?;
    let timeout = std::time::Duration::from_secs(config.query.timeout_secs);

    let (seed, hits) = match target {
        TraceTarget::Node(id) => {
            let hits = tokio::time::timeout(timeout, trace(&store, id, options)).await??;
            (Some(id.clone()), hits)
        }
        TraceTarget::FileLine { path, line } => {
            let repo = config
                .plugins
                .git
                .as_ref()
                .map(|g| g.repo.clone())
                .unwrap_or_else(|| PathBuf::from("."));
            let resolver: Arc<dyn SeedResolver> = Arc::new(GitBlameResolver::new(repo));
            tokio::time::timeout(timeout, trace_file_line(&store, resolver, path, *line, options))
                .await??
        }
    };
    store.close().await;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "seed": seed, "results": hits }))?
        );
        return Ok(());
    }

    match &seed {
        Some(seed) => println!("trace {}", seed),
        None => println!("trace: line is not committed yet"),
    }
    if hits.is_empty() {
        println!("  (no linked pull requests, issues or decisions)");
    }
    for hit in &hits {
        println!(
            "  {}{} {}  {}",
            "  ".repeat(hit.hop - 1),
            hit.relation,
            hit.node.id,
            hit.node.title.as_deref().unwrap_or("(untitled)")
        );
    }
    Ok(())
}

fn far_end(edge: &Edge, direction: Direction) -> &str {
    match direction {
        Direction::Inbound => &edge.src,
        Direction::Outbound => &edge.dst,
    }
}

/// Newest first; undated nodes last; ties by id.
fn sort_newest_first(level: &mut [TraceHit]) {
    level.sort_by(|a, b| {
        b.node
            .timestamp
            .cmp(&a.node.timestamp)
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
}
