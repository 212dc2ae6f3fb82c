//! Git history plugin.
//!
//! Turns commits into `Commit` nodes, touched paths into `File` nodes with
//! `MODIFIES` edges, and merge/squash subjects (`Merge pull request #12`,
//! `Fix login (#12)`) into `MERGES` edges from the PR.
//!
//! Incremental policy: with a `last_commit_hash` cursor only commits
//! strictly after it are read, oldest first. Without one (or when the hash
//! has vanished from history after a rewrite) the most recent
//! `max_commits` commits no older than `max_age_days` are read.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::config::GitPluginConfig;
use crate::manifest::{decode_cursor, encode_cursor, Cursor};
use crate::models::{Edge, Node, NodeType, Relation};
use crate::plugin::{IngestContext, IngestOutput, IngestPlugin};
use crate::trace::SeedResolver;

static MERGE_PR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Merge pull request #(\d+)\b").expect("valid regex"));
static SQUASH_PR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(#(\d+)\)\s*$").expect("valid regex"));

const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';
const LOG_FORMAT: &str = "--format=%x1e%H%x1f%P%x1f%an%x1f%ae%x1f%ct%x1f%s%x1f%b%x1f";

/// One commit as read from the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCommit {
    pub sha: String,
    pub parents: Vec<String>,
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub body: String,
    pub files: Vec<String>,
}

/// A resolved repository handle. Lists are newest-first, like `git log`.
pub trait CommitSource: Send + Sync {
    /// Whether `sha` names a commit in this repository.
    fn contains(&self, sha: &str) -> Result<bool>;

    /// Commits reachable from HEAD but not from `sha`.
    fn commits_after(&self, sha: &str) -> Result<Vec<RawCommit>>;

    /// At most `max_count` commits from HEAD, none older than `since`.
    fn recent_commits(&self, max_count: usize, since: DateTime<Utc>) -> Result<Vec<RawCommit>>;
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitCursor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit_hash: Option<String>,
}

pub struct GitPlugin {
    source: Arc<dyn CommitSource>,
    max_commits: usize,
    max_age_days: i64,
}

impl GitPlugin {
    pub fn new(source: Arc<dyn CommitSource>, max_commits: usize, max_age_days: i64) -> Self {
        Self {
            source,
            max_commits,
            max_age_days,
        }
    }

    pub fn from_config(cfg: &GitPluginConfig) -> Self {
        Self::new(
            Arc::new(GitCli::new(cfg.repo.clone())),
            cfg.max_commits,
            cfg.max_age_days,
        )
    }
}

#[async_trait]
impl IngestPlugin for GitPlugin {
    fn name(&self) -> &str {
        "git"
    }

    fn description(&self) -> &str {
        "Commits, touched files and PR merge links from local git history"
    }

    fn node_types(&self) -> Vec<NodeType> {
        vec![NodeType::Commit, NodeType::File]
    }

    fn edge_types(&self) -> Vec<Relation> {
        vec![Relation::Modifies, Relation::Merges]
    }

    async fn ingest(&self, prior: &Cursor, ctx: &IngestContext) -> Result<IngestOutput> {
        let cursor: GitCursor = decode_cursor(self.name(), prior);
        let source = self.source.clone();
        let max_commits = self.max_commits;
        let since = ctx.now - Duration::days(self.max_age_days);
        let last = cursor.last_commit_hash.clone();

        let mut commits = tokio::task::spawn_blocking(move || {
            select_commits(source.as_ref(), last.as_deref(), max_commits, since)
        })
        .await
        .context("git scan task failed")??;

        // git lists newest first; process oldest first.
        commits.reverse();
        debug!(count = commits.len(), "git commits selected");

        let next = GitCursor {
            last_commit_hash: commits
                .last()
                .map(|c| c.sha.clone())
                .or(cursor.last_commit_hash),
        };

        let (nodes, edges) = commits_to_graph(&commits);
        Ok(IngestOutput {
            nodes,
            edges,
            cursor: encode_cursor(&next),
        })
    }
}

fn select_commits(
    source: &dyn CommitSource,
    last: Option<&str>,
    max_commits: usize,
    since: DateTime<Utc>,
) -> Result<Vec<RawCommit>> {
    match last {
        Some(hash) if source.contains(hash)? => source.commits_after(hash),
        Some(hash) => {
            warn!(hash, "last ingested commit no longer in history; rescanning recent commits");
            source.recent_commits(max_commits, since)
        }
        None => source.recent_commits(max_commits, since),
    }
}

/// Build nodes and edges for commits given oldest first.
pub fn commits_to_graph(commits: &[RawCommit]) -> (Vec<Node>, Vec<Edge>) {
    let mut nodes: Vec<Node> = Vec::new();
    let mut files: BTreeMap<String, Node> = BTreeMap::new();
    let mut edges: Vec<Edge> = Vec::new();

    for commit in commits {
        let commit_id = NodeType::Commit.node_id(&commit.sha);
        let message = if commit.body.trim().is_empty() {
            commit.subject.clone()
        } else {
            format!("{}\n\n{}", commit.subject, commit.body.trim_end())
        };

        nodes.push(
            Node::new(NodeType::Commit, &commit.sha)
                .with_title(commit.subject.clone())
                .with_body(message)
                .with_timestamp(commit.timestamp)
                .with_meta("sha", commit.sha.clone())
                .with_meta("author", commit.author.clone())
                .with_meta("email", commit.email.clone())
                .with_meta("parents", commit.parents.clone())
                .with_meta("files", commit.files.clone()),
        );

        for path in &commit.files {
            let file = files.entry(path.clone()).or_insert_with(|| {
                Node::new(NodeType::File, path)
                    .with_title(path.clone())
                    .with_meta("path", path.clone())
            });
            edges.push(Edge::new(&commit_id, &file.id, Relation::Modifies));
        }

        if let Some(pr) = pr_number_from_subject(&commit.subject) {
            edges.push(
                Edge::new(NodeType::PullRequest.node_id(pr), &commit_id, Relation::Merges)
                    .with_property("inferred_from", "commit_message"),
            );
        }
    }

    nodes.extend(files.into_values());
    (nodes, edges)
}

fn pr_number_from_subject(subject: &str) -> Option<u64> {
    MERGE_PR_RE
        .captures(subject)
        .or_else(|| SQUASH_PR_RE.captures(subject))
        .and_then(|c| c[1].parse().ok())
}

/// [`CommitSource`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo: PathBuf,
}

impl GitCli {
    pub fn new(repo: PathBuf) -> Self {
        Self { repo }
    }

    fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(["-c", "core.quotepath=off"])
            .args(args)
            .current_dir(&self.repo)
            .output()
            .with_context(|| "Failed to execute git. Is git installed?")
    }

    fn log(&self, args: &[&str]) -> Result<Vec<RawCommit>> {
        let mut full = vec!["log", LOG_FORMAT, "--name-only"];
        full.extend_from_slice(args);
        let output = self.git(&full)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git log failed in {}: {}", self.repo.display(), stderr.trim());
        }
        parse_log(&String::from_utf8_lossy(&output.stdout))
    }
}

impl CommitSource for GitCli {
    fn contains(&self, sha: &str) -> Result<bool> {
        let rev = format!("{}^{{commit}}", sha);
        Ok(self.git(&["cat-file", "-e", &rev])?.status.success())
    }

    fn commits_after(&self, sha: &str) -> Result<Vec<RawCommit>> {
        let range = format!("{}..HEAD", sha);
        self.log(&[&range])
    }

    fn recent_commits(&self, max_count: usize, since: DateTime<Utc>) -> Result<Vec<RawCommit>> {
        let count = format!("--max-count={}", max_count);
        let since = format!("--since={}", since.to_rfc3339());
        self.log(&[&count, &since, "HEAD"])
    }
}

/// Resolves `file:line` trace seeds with `git blame`.
#[derive(Debug, Clone)]
pub struct GitBlameResolver {
    git: GitCli,
}

impl GitBlameResolver {
    pub fn new(repo: PathBuf) -> Self {
        Self {
            git: GitCli::new(repo),
        }
    }
}

impl SeedResolver for GitBlameResolver {
    /// Blame one line and return the commit node id that last touched it.
    fn resolve_file_line(&self, path: &Path, line: usize) -> Result<Option<String>> {
        if line == 0 {
            bail!("line numbers start at 1");
        }
        let range = format!("{},{}", line, line);
        let path_str = path.to_string_lossy();
        let output = self.git.git(&["blame", "--porcelain", "-L", &range, "--", &path_str])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git blame failed: {}", stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let sha = stdout
            .lines()
            .next()
            .and_then(|l| l.split_whitespace().next())
            .map(|s| s.trim_start_matches('^').to_string());

        Ok(sha
            .filter(|s| !s.chars().all(|c| c == '0'))
            .map(|s| NodeType::Commit.node_id(s)))
    }
}

/// Parse `git log` output produced with [`LOG_FORMAT`] and `--name-only`.
pub fn parse_log(output: &str) -> Result<Vec<RawCommit>> {
    let mut commits = Vec::new();

    for record in output.split(RECORD_SEP) {
        if record.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.splitn(8, FIELD_SEP).collect();
        if fields.len() < 8 {
            bail!("unexpected git log record: {:?}", record);
        }

        let secs: i64 = fields[4]
            .trim()
            .parse()
            .with_context(|| format!("bad commit timestamp {:?}", fields[4]))?;
        let timestamp = DateTime::from_timestamp(secs, 0)
            .with_context(|| format!("commit timestamp out of range: {}", secs))?;

        commits.push(RawCommit {
            sha: fields[0].trim().to_string(),
            parents: fields[1].split_whitespace().map(str::to_string).collect(),
            author: fields[2].to_string(),
            email: fields[3].to_string(),
            timestamp,
            subject: fields[5].to_string(),
            body: fields[6].trim().to_string(),
            files: fields[7]
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        });
    }

    Ok(commits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    /// In-memory repository: a single linear history, newest first.
    struct FakeRepo {
        history: Vec<RawCommit>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRepo {
        fn new(history: Vec<RawCommit>) -> Self {
            Self {
                history,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl CommitSource for FakeRepo {
        fn contains(&self, sha: &str) -> Result<bool> {
            Ok(self.history.iter().any(|c| c.sha == sha))
        }

        fn commits_after(&self, sha: &str) -> Result<Vec<RawCommit>> {
            self.calls.lock().unwrap().push(format!("after:{}", sha));
            Ok(self
                .history
                .iter()
                .take_while(|c| c.sha != sha)
                .cloned()
                .collect())
        }

        fn recent_commits(&self, max_count: usize, since: DateTime<Utc>) -> Result<Vec<RawCommit>> {
            self.calls.lock().unwrap().push("recent".to_string());
            Ok(self
                .history
                .iter()
                .filter(|c| c.timestamp >= since)
                .take(max_count)
                .cloned()
                .collect())
        }
    }

    fn commit(sha: &str, parent: Option<&str>, secs: i64, subject: &str) -> RawCommit {
        RawCommit {
            sha: sha.to_string(),
            parents: parent.map(|p| vec![p.to_string()]).unwrap_or_default(),
            author: "Dev".to_string(),
            email: "dev@example.com".to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            subject: subject.to_string(),
            body: String::new(),
            files: vec!["src/lib.rs".to_string()],
        }
    }

    fn ctx() -> IngestContext {
        IngestContext::new(Utc.timestamp_opt(1_700_100_000, 0).unwrap())
    }

    fn history() -> Vec<RawCommit> {
        vec![
            commit("ghi789", Some("def456"), 1_700_000_300, "Add cache (#12)"),
            commit("def456", Some("abc123"), 1_700_000_200, "Fix parser"),
            commit("abc123", None, 1_700_000_100, "Initial commit"),
        ]
    }

    #[tokio::test]
    async fn test_incremental_ingests_only_newer_commits_oldest_first() {
        let repo = Arc::new(FakeRepo::new(history()));
        let plugin = GitPlugin::new(repo.clone(), 100, 365);

        let mut prior = Cursor::new();
        prior.insert("last_commit_hash".to_string(), json!("abc123"));

        let out = plugin.ingest(&prior, &ctx()).await.unwrap();
        let commit_ids: Vec<&str> = out
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Commit)
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(commit_ids, vec!["commit:def456", "commit:ghi789"]);
        assert_eq!(out.cursor.get("last_commit_hash"), Some(&json!("ghi789")));
        assert_eq!(repo.calls.lock().unwrap().as_slice(), ["after:abc123"]);
    }

    #[tokio::test]
    async fn test_no_new_commits_keeps_cursor() {
        let plugin = GitPlugin::new(Arc::new(FakeRepo::new(history())), 100, 365);
        let mut prior = Cursor::new();
        prior.insert("last_commit_hash".to_string(), json!("ghi789"));

        let out = plugin.ingest(&prior, &ctx()).await.unwrap();
        assert!(out.nodes.is_empty());
        assert_eq!(out.cursor, prior);
    }

    #[tokio::test]
    async fn test_full_scan_is_bounded_by_count() {
        let plugin = GitPlugin::new(Arc::new(FakeRepo::new(history())), 2, 365);
        let out = plugin.ingest(&Cursor::new(), &ctx()).await.unwrap();
        let commits = out
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Commit)
            .count();
        assert_eq!(commits, 2);
        assert_eq!(out.cursor.get("last_commit_hash"), Some(&json!("ghi789")));
    }

    #[tokio::test]
    async fn test_full_scan_is_bounded_by_age() {
        let plugin = GitPlugin::new(Arc::new(FakeRepo::new(history())), 100, 1);
        // ctx().now is ~1.15 days after the newest commit
        let out = plugin.ingest(&Cursor::new(), &ctx()).await.unwrap();
        assert!(out.nodes.is_empty());
        assert!(out.cursor.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_cursor_hash_falls_back_to_scan() {
        let repo = Arc::new(FakeRepo::new(history()));
        let plugin = GitPlugin::new(repo.clone(), 100, 365);
        let mut prior = Cursor::new();
        prior.insert("last_commit_hash".to_string(), json!("rewritten"));

        let out = plugin.ingest(&prior, &ctx()).await.unwrap();
        assert_eq!(repo.calls.lock().unwrap().as_slice(), ["recent"]);
        assert_eq!(out.cursor.get("last_commit_hash"), Some(&json!("ghi789")));
    }

    #[test]
    fn test_graph_shape() {
        let mut commits = history();
        commits.reverse();
        let (nodes, edges) = commits_to_graph(&commits);

        // three commits plus one deduplicated file node
        assert_eq!(nodes.len(), 4);
        assert_eq!(
            edges
                .iter()
                .filter(|e| e.relation == Relation::Modifies)
                .count(),
            3
        );
        let merges: Vec<&Edge> = edges
            .iter()
            .filter(|e| e.relation == Relation::Merges)
            .collect();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].src, "pr:12");
        assert_eq!(merges[0].dst, "commit:ghi789");
        assert!(nodes.iter().all(|n| n.validate().is_empty()));
    }

    #[test]
    fn test_pr_number_from_subject() {
        assert_eq!(
            pr_number_from_subject("Merge pull request #41 from org/feature"),
            Some(41)
        );
        assert_eq!(pr_number_from_subject("Speed up startup (#7)"), Some(7));
        assert_eq!(pr_number_from_subject("Refs #7 in the middle"), None);
    }

    #[test]
    fn test_parse_log() {
        let out = "\x1eaaa\x1fppp qqq\x1fAnn\x1fann@x.io\x1f1700000000\x1fMerge things\x1fLonger\nbody\x1f\n\nsrc/a.rs\nREADME.md\n\x1ebbb\x1f\x1fBob\x1fbob@x.io\x1f1699999999\x1fInit\x1f\x1f\n\nCargo.toml\n";
        let commits = parse_log(out).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].sha, "aaa");
        assert_eq!(commits[0].parents, vec!["ppp", "qqq"]);
        assert_eq!(commits[0].body, "Longer\nbody");
        assert_eq!(commits[0].files, vec!["src/a.rs", "README.md"]);
        assert!(commits[1].parents.is_empty());
        assert_eq!(commits[1].files, vec!["Cargo.toml"]);
    }

    #[test]
    fn test_parse_log_rejects_truncated_record() {
        assert!(parse_log("\x1eaaa\x1fonly two").is_err());
    }
}
