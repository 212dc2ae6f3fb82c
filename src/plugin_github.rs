//! GitHub pull request and issue plugin.
//!
//! Reads the repository's issues endpoint, which lists both issues and pull
//! requests. Each item becomes a `pr:N` or `issue:N` node. `#N` references
//! in a title or body become `MENTIONS` edges, and every merged PR gets
//! `MERGES` edges to its commits and its merge commit.
//!
//! The cursor is a high-water mark `(last_timestamp, last_id)` over
//! `(updated_at, number)`. The API's `since` filter is inclusive, so items
//! at or below the mark are dropped after fetching.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::config::GitHubPluginConfig;
use crate::manifest::{decode_cursor, encode_cursor, Cursor};
use crate::models::{Edge, Node, NodeType, Relation};
use crate::plugin::{IngestContext, IngestOutput, IngestPlugin};

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w&/])#(\d+)\b").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Issue,
    PullRequest,
}

/// One issue or pull request as listed by the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerItem {
    pub number: u64,
    pub kind: ItemKind,
    pub title: String,
    pub body: String,
    pub state: String,
    pub author: Option<String>,
    pub url: String,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
}

/// Commit links of a merged pull request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeInfo {
    pub merge_commit_sha: Option<String>,
    pub commits: Vec<String>,
}

/// Remote issue tracker.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Every issue and PR updated at or after `since` (all when `None`).
    async fn list_items(&self, since: Option<DateTime<Utc>>) -> Result<Vec<TrackerItem>>;

    /// Merge commit and commit list for a merged PR.
    async fn merge_info(&self, number: u64) -> Result<MergeInfo>;
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitHubCursor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_id: Option<u64>,
}

impl GitHubCursor {
    fn is_above(&self, item: &TrackerItem) -> bool {
        match self.last_timestamp {
            None => true,
            Some(ts) => (item.updated_at, item.number) > (ts, self.last_id.unwrap_or(0)),
        }
    }
}

pub struct GitHubPlugin {
    tracker: Arc<dyn IssueTracker>,
}

impl GitHubPlugin {
    pub fn new(tracker: Arc<dyn IssueTracker>) -> Self {
        Self { tracker }
    }

    pub fn from_config(cfg: &GitHubPluginConfig) -> Self {
        Self::new(Arc::new(GitHubClient::new(cfg.clone())))
    }
}

#[async_trait]
impl IngestPlugin for GitHubPlugin {
    fn name(&self) -> &str {
        "github"
    }

    fn description(&self) -> &str {
        "Pull requests and issues from the GitHub REST API"
    }

    fn node_types(&self) -> Vec<NodeType> {
        vec![NodeType::PullRequest, NodeType::Issue]
    }

    fn edge_types(&self) -> Vec<Relation> {
        vec![Relation::Mentions, Relation::Merges]
    }

    async fn ingest(&self, prior: &Cursor, _ctx: &IngestContext) -> Result<IngestOutput> {
        let cursor: GitHubCursor = decode_cursor(self.name(), prior);

        let mut items: Vec<TrackerItem> = self
            .tracker
            .list_items(cursor.last_timestamp)
            .await?
            .into_iter()
            .filter(|item| cursor.is_above(item))
            .collect();
        items.sort_by_key(|item| (item.updated_at, item.number));
        debug!(count = items.len(), "github items above high-water mark");

        let Some(last) = items.last() else {
            return Ok(IngestOutput::unchanged(prior));
        };
        let next = GitHubCursor {
            last_timestamp: Some(last.updated_at),
            last_id: Some(last.number),
        };

        let mut output = IngestOutput::default();
        for item in &items {
            let node = item_to_node(item);
            output.edges.extend(mention_edges(&node.id, item));

            if item.kind == ItemKind::PullRequest && item.merged_at.is_some() {
                let info = self
                    .tracker
                    .merge_info(item.number)
                    .await
                    .with_context(|| format!("fetching merge info for PR #{}", item.number))?;
                output.edges.extend(merge_edges(&node.id, &info));
                output.nodes.push(match info.merge_commit_sha {
                    Some(sha) => node.with_meta("merge_commit_sha", sha),
                    None => node,
                });
            } else {
                output.nodes.push(node);
            }
        }

        output.cursor = encode_cursor(&next);
        Ok(output)
    }
}

fn item_to_node(item: &TrackerItem) -> Node {
    let node_type = match item.kind {
        ItemKind::Issue => NodeType::Issue,
        ItemKind::PullRequest => NodeType::PullRequest,
    };

    let mut node = Node::new(node_type, item.number)
        .with_title(item.title.clone())
        .with_body(item.body.clone())
        .with_timestamp(item.created_at)
        .with_meta("number", item.number)
        .with_meta("url", item.url.clone())
        .with_meta("state", item.state.clone())
        .with_meta("updated_at", item.updated_at.to_rfc3339());
    if let Some(author) = &item.author {
        node = node.with_meta("author", author.clone());
    }
    if !item.labels.is_empty() {
        node = node.with_meta("labels", item.labels.clone());
    }
    if let Some(merged_at) = item.merged_at {
        node = node.with_meta("merged_at", merged_at.to_rfc3339());
    }
    node
}

/// Issue numbers referenced as `#N` in free text.
pub fn mentioned_numbers(text: &str) -> BTreeSet<u64> {
    MENTION_RE
        .captures_iter(text)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

fn mention_edges(src: &str, item: &TrackerItem) -> Vec<Edge> {
    let text = format!("{}\n{}", item.title, item.body);
    mentioned_numbers(&text)
        .into_iter()
        .filter(|n| *n != item.number)
        .map(|n| Edge::new(src, NodeType::Issue.node_id(n), Relation::Mentions))
        .collect()
}

fn merge_edges(src: &str, info: &MergeInfo) -> Vec<Edge> {
    let shas: BTreeSet<&String> = info
        .commits
        .iter()
        .chain(info.merge_commit_sha.iter())
        .collect();
    shas.into_iter()
        .map(|sha| Edge::new(src, NodeType::Commit.node_id(sha), Relation::Merges))
        .collect()
}

/// [`IssueTracker`] over the GitHub REST API.
pub struct GitHubClient {
    config: GitHubPluginConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Deserialize)]
struct ApiPullRef {
    merged_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ApiIssue {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    html_url: String,
    user: Option<ApiUser>,
    #[serde(default)]
    labels: Vec<ApiLabel>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    pull_request: Option<ApiPullRef>,
}

#[derive(Deserialize)]
struct ApiPull {
    merge_commit_sha: Option<String>,
}

#[derive(Deserialize)]
struct ApiCommit {
    sha: String,
}

impl From<ApiIssue> for TrackerItem {
    fn from(issue: ApiIssue) -> Self {
        TrackerItem {
            number: issue.number,
            kind: if issue.pull_request.is_some() {
                ItemKind::PullRequest
            } else {
                ItemKind::Issue
            },
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            state: issue.state,
            author: issue.user.map(|u| u.login),
            url: issue.html_url,
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            created_at: issue.created_at,
            updated_at: issue.updated_at,
            merged_at: issue.pull_request.and_then(|p| p.merged_at),
        }
    }
}

impl GitHubClient {
    pub fn new(config: GitHubPluginConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path
        )
    }

    async fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let mut req = self
            .http
            .get(url)
            .query(query)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", concat!("codetrail/", env!("CARGO_PKG_VERSION")));

        match std::env::var(&self.config.token_env) {
            Ok(token) if !token.is_empty() => {
                req = req.header("Authorization", format!("Bearer {}", token));
            }
            _ => debug!(env = %self.config.token_env, "no GitHub token set; using anonymous access"),
        }

        let response = req
            .send()
            .await
            .with_context(|| format!("GitHub request failed: {}", url))?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("GitHub API error {}: {}", status, body_text);
        }
        Ok(response.json().await?)
    }

    /// Fetch every page of a list endpoint.
    async fn get_all<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let per_page = self.config.per_page.max(1);
        let mut all = Vec::new();

        for page in 1.. {
            let mut q = query.to_vec();
            q.push(("per_page", per_page.to_string()));
            q.push(("page", page.to_string()));

            let batch: Vec<T> = self.get_page(url, &q).await?;
            let done = batch.len() < per_page as usize;
            all.extend(batch);
            if done {
                break;
            }
        }

        Ok(all)
    }
}

#[async_trait]
impl IssueTracker for GitHubClient {
    async fn list_items(&self, since: Option<DateTime<Utc>>) -> Result<Vec<TrackerItem>> {
        let mut query = vec![
            ("state", "all".to_string()),
            ("sort", "updated".to_string()),
            ("direction", "asc".to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339()));
        }

        let issues: Vec<ApiIssue> = self.get_all(&self.repo_url("issues"), &query).await?;
        Ok(issues.into_iter().map(TrackerItem::from).collect())
    }

    async fn merge_info(&self, number: u64) -> Result<MergeInfo> {
        let pull: ApiPull = self
            .get_page(&self.repo_url(&format!("pulls/{}", number)), &[])
            .await?;
        let commits: Vec<ApiCommit> = self
            .get_all(&self.repo_url(&format!("pulls/{}/commits", number)), &[])
            .await?;

        Ok(MergeInfo {
            merge_commit_sha: pull.merge_commit_sha,
            commits: commits.into_iter().map(|c| c.sha).collect(),
        })
    }
}
