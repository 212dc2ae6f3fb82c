//! Ingestor plugin contract and registry.
//!
//! Every source (git history, GitHub, ADR files, or anything custom) is an
//! [`IngestPlugin`]. The build orchestrator hands each plugin its previous
//! cursor and receives nodes, edges and a new cursor back. Plugins never
//! write to the store themselves.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               PluginRegistry               │
//! │  ┌───────┐ ┌────────┐ ┌─────┐ ┌─────────┐  │
//! │  │  git  │ │ github │ │ adr │ │ custom  │  │
//! │  └───────┘ └────────┘ └─────┘ └─────────┘  │
//! └──────────────────────┬─────────────────────┘
//!                        ▼
//!            run_build() → one store transaction
//! ```
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use anyhow::Result;
//! use codetrail::manifest::Cursor;
//! use codetrail::models::{Node, NodeType, Relation};
//! use codetrail::plugin::{IngestContext, IngestOutput, IngestPlugin};
//!
//! pub struct TicketPlugin;
//!
//! #[async_trait]
//! impl IngestPlugin for TicketPlugin {
//!     fn name(&self) -> &str { "tickets" }
//!     fn description(&self) -> &str { "Ingest tickets from an internal tracker" }
//!     fn node_types(&self) -> Vec<NodeType> { vec![NodeType::Issue] }
//!     fn edge_types(&self) -> Vec<Relation> { vec![] }
//!
//!     async fn ingest(&self, prior: &Cursor, _ctx: &IngestContext) -> Result<IngestOutput> {
//!         Ok(IngestOutput::unchanged(prior))
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::manifest::Cursor;
use crate::models::{Edge, Node, NodeType, Relation};

/// What one plugin produced in one pass.
#[derive(Debug, Clone, Default)]
pub struct IngestOutput {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// State to resume from next time. Becomes visible only if the build commits.
    pub cursor: Cursor,
}

impl IngestOutput {
    /// No new items; keep the prior cursor as it is.
    pub fn unchanged(prior: &Cursor) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            cursor: prior.clone(),
        }
    }
}

/// Externally supplied inputs shared by every plugin in a build.
#[derive(Debug, Clone)]
pub struct IngestContext {
    /// Build start time. Plugins use it instead of the wall clock so age
    /// bounds are consistent across a build.
    pub now: DateTime<Utc>,
}

impl IngestContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

/// A source of graph nodes and edges.
///
/// # Contract
///
/// - [`name`](IngestPlugin::name) is stable and unique; it keys the
///   plugin's cursor in the build manifest.
/// - [`ingest`](IngestPlugin::ingest) is a function of the prior cursor
///   and the context. It returns a complete output for everything it
///   processed, or an error and nothing at all.
/// - An empty prior cursor means "full pass".
#[async_trait]
pub trait IngestPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// One-line description, shown by `trail plugins`.
    fn description(&self) -> &str;

    /// Node types this plugin emits. Informational.
    fn node_types(&self) -> Vec<NodeType>;

    /// Relations this plugin emits. Informational.
    fn edge_types(&self) -> Vec<Relation>;

    async fn ingest(&self, prior: &Cursor, ctx: &IngestContext) -> Result<IngestOutput>;
}

/// Name-keyed set of plugins, populated at startup.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn IngestPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with one built-in plugin per configured `[plugins.*]` section.
    pub fn from_config(config: &Config) -> Self {
        use crate::plugin_adr::AdrPlugin;
        use crate::plugin_git::GitPlugin;
        use crate::plugin_github::GitHubPlugin;

        let mut registry = Self::new();

        if let Some(cfg) = &config.plugins.git {
            registry.register(Arc::new(GitPlugin::from_config(cfg)));
        }
        if let Some(cfg) = &config.plugins.github {
            registry.register(Arc::new(GitHubPlugin::from_config(cfg)));
        }
        if let Some(cfg) = &config.plugins.adr {
            registry.register(Arc::new(AdrPlugin::new(cfg.clone())));
        }

        registry
    }

    /// Register a plugin, replacing any earlier one with the same name.
    pub fn register(&mut self, plugin: Arc<dyn IngestPlugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IngestPlugin>> {
        self.plugins.get(name).cloned()
    }

    /// All plugins, ordered by name.
    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn IngestPlugin>> {
        self.plugins.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl IngestPlugin for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test"
        }
        fn node_types(&self) -> Vec<NodeType> {
            vec![]
        }
        fn edge_types(&self) -> Vec<Relation> {
            vec![]
        }
        async fn ingest(&self, prior: &Cursor, _ctx: &IngestContext) -> Result<IngestOutput> {
            Ok(IngestOutput::unchanged(prior))
        }
    }

    #[test]
    fn test_registry_orders_by_name_and_replaces_duplicates() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Named("zeta")));
        registry.register(Arc::new(Named("alpha")));
        registry.register(Arc::new(Named("alpha")));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
        assert!(registry.get("zeta").is_some());
        assert!(registry.get("beta").is_none());
    }

    #[test]
    fn test_from_config_registers_configured_sections() {
        let cfg = crate::config::parse_config(
            "[db]\npath = \"x\"\n[plugins.git]\nrepo = \".\"\n[plugins.adr]\nroot = \".\"\n",
        )
        .unwrap();
        let registry = PluginRegistry::from_config(&cfg);
        assert_eq!(registry.names(), vec!["adr", "git"]);
    }
}
