//! TOML configuration.
//!
//! Only `[db]` is required. Every plugin section is optional; a plugin is
//! registered for builds exactly when its section is present.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildConfig {
    #[serde(default = "default_plugin_timeout_secs")]
    pub plugin_timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            plugin_timeout_secs: default_plugin_timeout_secs(),
        }
    }
}

fn default_plugin_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct TraceConfig {
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            max_results: default_max_results(),
        }
    }
}

fn default_max_hops() -> usize {
    3
}
fn default_max_results() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_limit() -> i64 {
    20
}
fn default_query_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PluginsConfig {
    pub git: Option<GitPluginConfig>,
    pub github: Option<GitHubPluginConfig>,
    pub adr: Option<AdrPluginConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitPluginConfig {
    #[serde(default = "default_repo")]
    pub repo: PathBuf,
    #[serde(default = "default_max_commits")]
    pub max_commits: usize,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
}

fn default_repo() -> PathBuf {
    PathBuf::from(".")
}
fn default_max_commits() -> usize {
    5000
}
fn default_max_age_days() -> i64 {
    365
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubPluginConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_per_page() -> u32 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdrPluginConfig {
    #[serde(default = "default_repo")]
    pub root: PathBuf,
    #[serde(default = "default_adr_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_adr_globs() -> Vec<String> {
    vec![
        "docs/adr/**/*.md".to_string(),
        "doc/adr/**/*.md".to_string(),
        "adr/**/*.md".to_string(),
    ]
}

impl Config {
    /// A config with defaults everywhere and the given database path.
    pub fn with_db(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            build: BuildConfig::default(),
            trace: TraceConfig::default(),
            query: QueryConfig::default(),
            server: ServerConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.trace.max_hops == 0 {
        anyhow::bail!("trace.max_hops must be >= 1");
    }
    if config.trace.max_results == 0 {
        anyhow::bail!("trace.max_results must be >= 1");
    }
    if config.build.plugin_timeout_secs == 0 {
        anyhow::bail!("build.plugin_timeout_secs must be >= 1");
    }
    if config.query.default_limit < 1 {
        anyhow::bail!("query.default_limit must be >= 1");
    }
    if config.query.timeout_secs == 0 {
        anyhow::bail!("query.timeout_secs must be >= 1");
    }

    if let Some(git) = &config.plugins.git {
        if git.max_commits == 0 {
            anyhow::bail!("plugins.git.max_commits must be >= 1");
        }
        if git.max_age_days < 1 {
            anyhow::bail!("plugins.git.max_age_days must be >= 1");
        }
    }

    if let Some(gh) = &config.plugins.github {
        if !(1..=100).contains(&gh.per_page) {
            anyhow::bail!("plugins.github.per_page must be in [1, 100]");
        }
        if gh.owner.trim().is_empty() || gh.repo.trim().is_empty() {
            anyhow::bail!("plugins.github.owner and plugins.github.repo must be set");
        }
    }

    Ok(config)
}
