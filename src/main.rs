//! # codetrail CLI (`trail`)
//!
//! ## Usage
//!
//! ```bash
//! trail --config ./config/trail.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trail init` | Create the SQLite store and run schema migrations |
//! | `trail build` | Run the configured plugins and commit their output |
//! | `trail search "<query>"` | Full-text search over titles and bodies |
//! | `trail trace <id>` | Trace a node to its PRs, issues and ADRs |
//! | `trail get <id>` | Show one node and its edges |
//! | `trail stats` | Store statistics |
//! | `trail plugins` | List configured plugins |
//! | `trail history` | List past builds |
//! | `trail serve` | Start the read-only HTTP server |
//!
//! Logs go to stderr and are controlled by `RUST_LOG`
//! (default `codetrail=info`).

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codetrail::build::run_build_command;
use codetrail::config;
use codetrail::get::run_get;
use codetrail::manifest::build_history;
use codetrail::plugin::PluginRegistry;
use codetrail::search::run_search;
use codetrail::server::run_server;
use codetrail::stats::run_stats;
use codetrail::store::GraphStore;
use codetrail::trace::{run_trace, TraceOptions, TraceTarget};

/// codetrail: a local history graph of commits, PRs, issues and ADRs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "trail",
    about = "codetrail: trace code back to the pull requests, issues and decisions behind it",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/trail.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and its schema. Safe to run more than once.
    Init,

    /// Run plugins and commit their output in one transaction.
    Build {
        /// Ignore stored cursors and re-ingest everything.
        #[arg(long)]
        full: bool,

        /// Only run these plugins (repeatable).
        #[arg(long = "plugin")]
        plugins: Vec<String>,
    },

    /// Full-text search over node titles and bodies.
    Search {
        query: String,

        #[arg(long)]
        limit: Option<i64>,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Trace a node, or the commit behind a file line, to its context.
    Trace {
        /// Node id, e.g. `commit:<sha>`.
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        id: Option<String>,

        /// File to blame, relative to the git plugin's repository.
        #[arg(long, requires = "line")]
        file: Option<PathBuf>,

        /// 1-based line number in `--file`.
        #[arg(long, requires = "file")]
        line: Option<usize>,

        #[arg(long)]
        max_hops: Option<usize>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Show one node and its edges.
    Get {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Show store statistics.
    Stats,

    /// List configured plugins.
    Plugins,

    /// List past builds, newest first.
    History {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Start the read-only HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codetrail=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = GraphStore::create(&cfg.db.path).await?;
            store.close().await;
            println!("initialized {}", cfg.db.path.display());
        }
        Commands::Build { full, plugins } => {
            run_build_command(&cfg, full, plugins).await?;
        }
        Commands::Search { query, limit, json } => {
            run_search(&cfg, &query, limit, json).await?;
        }
        Commands::Trace {
            id,
            file,
            line,
            max_hops,
            limit,
            json,
        } => {
            let target = match (id, file, line) {
                (Some(id), None, _) => TraceTarget::Node(id),
                (None, Some(path), Some(line)) => TraceTarget::FileLine { path, line },
                _ => bail!("pass either a node id or --file with --line"),
            };
            let defaults = TraceOptions::from(&cfg.trace);
            let options = TraceOptions {
                max_hops: max_hops.unwrap_or(defaults.max_hops),
                max_results: limit.unwrap_or(defaults.max_results),
            };
            run_trace(&cfg, &target, options, json).await?;
        }
        Commands::Get { id, json } => {
            run_get(&cfg, &id, json).await?;
        }
        Commands::Stats => {
            run_stats(&cfg).await?;
        }
        Commands::Plugins => {
            let registry = PluginRegistry::from_config(&cfg);
            if registry.is_empty() {
                println!("No plugins configured.");
            }
            for plugin in registry.plugins() {
                let nodes: Vec<String> = plugin.node_types().iter().map(|t| t.to_string()).collect();
                let edges: Vec<String> = plugin.edge_types().iter().map(|r| r.to_string()).collect();
                println!("{:<10} {}", plugin.name(), plugin.description());
                println!("{:<10} nodes: {}  edges: {}", "", nodes.join(", "), edges.join(", "));
            }
        }
        Commands::History { limit } => {
            let store = GraphStore::open(&cfg.db.path).await?;
            let builds = build_history(&store, limit).await?;
            store.close().await;
            if builds.is_empty() {
                println!("No builds yet.");
            }
            for record in builds {
                let m = &record.manifest;
                let plugins: Vec<&str> = m.cursors.keys().map(String::as_str).collect();
                println!(
                    "#{:<4} {}  nodes={} edges={}  schema={}  plugins=[{}]",
                    record.id,
                    m.built_at.format("%Y-%m-%d %H:%M:%S"),
                    m.node_count,
                    m.edge_count,
                    m.schema_version,
                    plugins.join(", ")
                );
            }
        }
        Commands::Serve => {
            run_server(&cfg).await?;
        }
    }

    Ok(())
}
