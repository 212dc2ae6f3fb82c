//! # codetrail
//!
//! A local-first history graph of commits, pull requests, issues and
//! Architecture Decision Records.
//!
//! Ingestor plugins read git history, GitHub and ADR files incrementally and
//! feed a SQLite node/edge store with a full-text index. A trace engine then
//! answers "why does this line exist?" by walking from a commit to the PR
//! that merged it, the issues that PR mentions, and the ADRs that decided
//! them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌───────────────┐
//! │   Plugins    │──▶│    Build    │──▶│    SQLite     │
//! │ git/gh/adr/… │   │ one txn/run │   │ nodes+edges   │
//! └──────────────┘   └─────────────┘   │ FTS5, builds  │
//!                                      └───────┬───────┘
//!                      ┌───────────────────────┤
//!                      ▼                       ▼
//!                 ┌──────────┐           ┌──────────┐
//!                 │   CLI    │           │   HTTP   │
//!                 │ (trail)  │           │ (axum)   │
//!                 └──────────┘           └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! trail init                          # create the store
//! trail build                         # incremental build from all plugins
//! trail search "cache invalidation"
//! trail trace --file src/cache.rs --line 42
//! trail serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Nodes, edges and relations |
//! | [`error`] | Error taxonomy |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation and version checks |
//! | [`store`] | Graph store and full-text search |
//! | [`manifest`] | Build manifest and plugin cursors |
//! | [`plugin`] | Ingestor plugin trait and registry |
//! | [`plugin_git`] | Git history plugin |
//! | [`plugin_github`] | GitHub PR/issue plugin |
//! | [`plugin_adr`] | ADR file plugin |
//! | [`build`] | Build orchestration |
//! | [`trace`] | Trace engine |
//! | [`search`] | `trail search` |
//! | [`get`] | Node lookup |
//! | [`stats`] | Store statistics |
//! | [`server`] | Read-only HTTP server |

pub mod build;
pub mod config;
pub mod db;
pub mod error;
pub mod get;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod plugin;
pub mod plugin_adr;
pub mod plugin_git;
pub mod plugin_github;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
pub mod trace;
