//! Architecture Decision Record plugin.
//!
//! Walks the configured ADR globs under `root` and parses each markdown
//! file into an `adr:*` node. Only files that are new or modified since the
//! last build are parsed; the cursor keeps one mtime per relative path.
//!
//! References in the text become `DECIDES` edges:
//!
//! | Text            | Target              |
//! |-----------------|---------------------|
//! | `#42`           | `issue:42`          |
//! | 40-hex SHA      | `commit:<sha>`      |
//! | `` `src/x.rs` `` | `file:src/x.rs` (only if it exists under `root`) |
//!
//! Ids come from the numeric file prefix, qualified by the subdirectory
//! below the literal base of the include glob: with `docs/adr/**/*.md`,
//! `docs/adr/0003-x.md` is `adr:3` and `docs/adr/api/0003-x.md` is
//! `adr:api/3`. When two files still share an id, the first path keeps it
//! and the others are keyed by their path.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::AdrPluginConfig;
use crate::manifest::{decode_cursor, encode_cursor, Cursor};
use crate::models::{Edge, Node, NodeType, Relation};
use crate::plugin::{IngestContext, IngestOutput, IngestPlugin};
use crate::plugin_github::mentioned_numbers;

static NUMBER_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(?:[-_.\s]|$)").expect("valid regex"));
static SHA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-f]{40}\b").expect("valid regex"));
static BACKTICK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\s]+)`").expect("valid regex"));
static HEADING_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:ADR[-\s]?)?\d+[.:]\s*").expect("valid regex"));

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdrCursor {
    #[serde(default)]
    pub file_mtimes: BTreeMap<String, i64>,
}

/// One candidate file on disk.
#[derive(Debug, Clone)]
struct Candidate {
    rel_path: String,
    mtime_ms: i64,
    qualifier: String,
    number: Option<u64>,
    /// Another file derives the same numbered id; re-parsed on every pass.
    contested: bool,
}

pub struct AdrPlugin {
    config: AdrPluginConfig,
}

impl AdrPlugin {
    pub fn new(config: AdrPluginConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl IngestPlugin for AdrPlugin {
    fn name(&self) -> &str {
        "adr"
    }

    fn description(&self) -> &str {
        "Architecture Decision Records from markdown files"
    }

    fn node_types(&self) -> Vec<NodeType> {
        vec![NodeType::Adr]
    }

    fn edge_types(&self) -> Vec<Relation> {
        vec![Relation::Decides]
    }

    async fn ingest(&self, prior: &Cursor, _ctx: &IngestContext) -> Result<IngestOutput> {
        let mut cursor: AdrCursor = decode_cursor(self.name(), prior);
        let config = self.config.clone();
        let known = cursor.file_mtimes.clone();

        let (changed, candidates) = tokio::task::spawn_blocking(move || {
            let candidates = scan_candidates(&config)?;
            let mut changed = Vec::new();
            for c in &candidates {
                let is_newer = known.get(&c.rel_path).map_or(true, |seen| *seen < c.mtime_ms);
                if is_newer || c.contested {
                    let text = std::fs::read_to_string(config.root.join(&c.rel_path))
                        .with_context(|| format!("reading {}", c.rel_path))?;
                    changed.push(parse_adr(&config.root, c, &text));
                }
            }
            Ok::<_, anyhow::Error>((changed, candidates))
        })
        .await
        .context("ADR scan task failed")??;

        debug!(
            candidates = candidates.len(),
            changed = changed.len(),
            "adr files scanned"
        );

        let mut output = IngestOutput::default();
        for (node, edges) in changed {
            output.nodes.push(node);
            output.edges.extend(edges);
        }
        for c in candidates {
            let seen = cursor.file_mtimes.entry(c.rel_path).or_insert(c.mtime_ms);
            *seen = (*seen).max(c.mtime_ms);
        }
        output.cursor = encode_cursor(&cursor);
        Ok(output)
    }
}

fn scan_candidates(config: &AdrPluginConfig) -> Result<Vec<Candidate>> {
    let root = &config.root;
    if !root.exists() {
        bail!("ADR root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let bases: Vec<String> = config.include_globs.iter().map(|g| glob_base(g)).collect();
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut candidates = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_path = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_path) || !include_set.is_match(&rel_path) {
            continue;
        }

        let modified = entry.metadata()?.modified().unwrap_or(UNIX_EPOCH);
        let mtime_ms = modified
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        let (qualifier, number) = adr_qualifier(&rel_path, &bases);
        candidates.push(Candidate {
            rel_path,
            mtime_ms,
            qualifier,
            number,
            contested: false,
        });
    }

    candidates.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    resolve_collisions(&mut candidates);
    Ok(candidates)
}

/// Files sharing a qualifier: the first path keeps it, the rest are keyed
/// by their extension-less path. Expects `candidates` sorted by path.
fn resolve_collisions(candidates: &mut [Candidate]) {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, c) in candidates.iter().enumerate() {
        groups.entry(c.qualifier.clone()).or_default().push(i);
    }

    for (qualifier, members) in groups {
        if members.len() < 2 {
            continue;
        }
        let paths: Vec<String> = members
            .iter()
            .map(|&i| candidates[i].rel_path.clone())
            .collect();
        warn!(
            id = %NodeType::Adr.node_id(&qualifier),
            ?paths,
            "ADR id derived from more than one file; keying later paths by path"
        );
        for (rank, &i) in members.iter().enumerate() {
            let c = &mut candidates[i];
            c.contested = true;
            if rank > 0 {
                c.qualifier = Path::new(&c.rel_path)
                    .with_extension("")
                    .to_string_lossy()
                    .to_string();
            }
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Literal directory prefix of a glob: `docs/adr/**/*.md` is `docs/adr`.
fn glob_base(pattern: &str) -> String {
    let parts: Vec<&str> = pattern.split('/').collect();
    parts[..parts.len().saturating_sub(1)]
        .iter()
        .take_while(|p| !p.contains(['*', '?', '[', '{']))
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Directory of `rel_path` below the deepest base that contains it.
fn adr_scope<'a>(rel_path: &'a str, bases: &[String]) -> &'a str {
    let dir = rel_path.rsplit_once('/').map_or("", |(d, _)| d);
    bases
        .iter()
        .filter_map(|base| {
            if base.is_empty() {
                Some(dir)
            } else if dir == base.as_str() {
                Some("")
            } else {
                dir.strip_prefix(base.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
            }
        })
        .min_by_key(|rest| rest.len())
        .unwrap_or(dir)
}

/// `0003-use-sqlite.md` is `adr:3`; `use-sqlite.md` is `adr:use-sqlite`;
/// `api/0003-x.md` below a base is `adr:api/3`.
fn adr_qualifier(rel_path: &str, bases: &[String]) -> (String, Option<u64>) {
    let stem = Path::new(rel_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| rel_path.to_string());

    let (local, number) = match NUMBER_PREFIX_RE
        .captures(&stem)
        .and_then(|c| c[1].parse::<u64>().ok())
    {
        Some(n) => (n.to_string(), Some(n)),
        None => (stem, None),
    };

    match adr_scope(rel_path, bases) {
        "" => (local, number),
        scope => (format!("{}/{}", scope, local), number),
    }
}

fn parse_adr(root: &Path, candidate: &Candidate, text: &str) -> (Node, Vec<Edge>) {
    let qualifier = &candidate.qualifier;

    let title = text
        .lines()
        .find_map(|l| l.strip_prefix("# "))
        .map(|h| HEADING_NUMBER_RE.replace(h.trim(), "").to_string())
        .unwrap_or_else(|| qualifier.clone());

    let timestamp = header_value(text, "date")
        .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .or_else(|| DateTime::from_timestamp_millis(candidate.mtime_ms));

    let mut node = Node::new(NodeType::Adr, qualifier)
        .with_title(title)
        .with_body(text.to_string())
        .with_meta("path", candidate.rel_path.clone());
    if let Some(ts) = timestamp {
        node = node.with_timestamp(ts);
    }
    if let Some(status) = parse_status(text) {
        node = node.with_meta("status", status);
    }
    if let Some(n) = candidate.number {
        node = node.with_meta("number", n);
    }

    let edges = decision_edges(&node.id, root, text);
    (node, edges)
}

/// Value of a `Key: value` line, matched case-insensitively.
fn header_value(text: &str, key: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (k, v) = line.trim().trim_start_matches(['*', '-', ' ']).split_once(':')?;
        let k = k.trim().trim_end_matches('*');
        (k.eq_ignore_ascii_case(key) && !v.trim().is_empty())
            .then(|| v.trim().trim_matches('*').trim().to_string())
    })
}

/// `Status: Accepted`, or the first line under a `## Status` heading.
fn parse_status(text: &str) -> Option<String> {
    if let Some(v) = header_value(text, "status") {
        return Some(v);
    }

    let mut lines = text.lines();
    lines.find(|l| {
        let l = l.trim();
        l.starts_with('#') && l.trim_start_matches('#').trim().eq_ignore_ascii_case("status")
    })?;
    lines
        .map(str::trim)
        .find(|l| !l.is_empty())
        .filter(|l| !l.starts_with('#'))
        .map(str::to_string)
}

fn decision_edges(src: &str, root: &Path, text: &str) -> Vec<Edge> {
    let mut targets: BTreeSet<String> = BTreeSet::new();

    targets.extend(
        mentioned_numbers(text)
            .into_iter()
            .map(|n| NodeType::Issue.node_id(n)),
    );
    targets.extend(
        SHA_RE
            .find_iter(text)
            .map(|m| NodeType::Commit.node_id(m.as_str())),
    );
    targets.extend(
        BACKTICK_RE
            .captures_iter(text)
            .map(|c| c[1].trim_start_matches("./").to_string())
            .filter(|p| root.join(p).is_file())
            .map(|p| NodeType::File.node_id(p)),
    );

    targets
        .into_iter()
        .map(|dst| Edge::new(src, dst, Relation::Decides))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    fn setup() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("docs/adr")).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/store.rs"), "// store").unwrap();
        fs::write(
            root.join("docs/adr/0003-use-sqlite.md"),
            format!(
                "# 3. Use SQLite for the graph\n\nDate: 2024-03-01\n\n## Status\n\nAccepted\n\n\
                 ## Context\n\nSee #42 and {}. Applies to `src/store.rs`, not `src/gone.rs`.\n",
                SHA
            ),
        )
        .unwrap();
        fs::write(
            root.join("docs/adr/record-format.md"),
            "# Record format\n\nStatus: Proposed\n",
        )
        .unwrap();
        fs::write(root.join("docs/notes.txt"), "not an adr").unwrap();
        tmp
    }

    fn plugin(root: &Path) -> AdrPlugin {
        AdrPlugin::new(AdrPluginConfig {
            root: root.to_path_buf(),
            include_globs: vec!["docs/adr/**/*.md".to_string()],
            exclude_globs: vec![],
        })
    }

    fn ctx() -> IngestContext {
        IngestContext::new(Utc::now())
    }

    #[tokio::test]
    async fn test_first_pass_parses_every_record() {
        let tmp = setup();
        let out = plugin(tmp.path()).ingest(&Cursor::new(), &ctx()).await.unwrap();

        let ids: Vec<&str> = out.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["adr:3", "adr:record-format"]);

        let adr = &out.nodes[0];
        assert_eq!(adr.title.as_deref(), Some("Use SQLite for the graph"));
        assert_eq!(adr.metadata.get("status"), Some(&json!("Accepted")));
        assert_eq!(adr.timestamp, Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        assert_eq!(out.nodes[1].metadata.get("status"), Some(&json!("Proposed")));

        let dsts: Vec<&str> = out.edges.iter().map(|e| e.dst.as_str()).collect();
        let commit = format!("commit:{}", SHA);
        assert_eq!(dsts, vec![commit.as_str(), "file:src/store.rs", "issue:42"]);
        assert!(out.edges.iter().all(|e| e.src == "adr:3"));

        let files = out.cursor.get("file_mtimes").unwrap().as_object().unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_files_are_skipped() {
        let tmp = setup();
        let p = plugin(tmp.path());
        let first = p.ingest(&Cursor::new(), &ctx()).await.unwrap();
        let second = p.ingest(&first.cursor, &ctx()).await.unwrap();
        assert!(second.nodes.is_empty());
        assert_eq!(second.cursor, first.cursor);
    }

    #[tokio::test]
    async fn test_modified_file_is_reparsed() {
        let tmp = setup();
        let p = plugin(tmp.path());
        let first = p.ingest(&Cursor::new(), &ctx()).await.unwrap();

        let path = tmp.path().join("docs/adr/record-format.md");
        fs::write(&path, "# Record format\n\nStatus: Accepted\n").unwrap();
        touch_later(&path);

        let second = p.ingest(&first.cursor, &ctx()).await.unwrap();
        let ids: Vec<&str> = second.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["adr:record-format"]);
        assert_eq!(second.nodes[0].metadata.get("status"), Some(&json!("Accepted")));
    }

    #[tokio::test]
    async fn test_removed_file_keeps_cursor_entry() {
        let tmp = setup();
        let p = plugin(tmp.path());
        let first = p.ingest(&Cursor::new(), &ctx()).await.unwrap();

        fs::remove_file(tmp.path().join("docs/adr/record-format.md")).unwrap();
        let second = p.ingest(&first.cursor, &ctx()).await.unwrap();
        assert!(second.nodes.is_empty());
        assert_eq!(second.cursor, first.cursor);
    }

    #[tokio::test]
    async fn test_missing_root_fails() {
        let tmp = TempDir::new().unwrap();
        let p = plugin(&tmp.path().join("nope"));
        assert!(p.ingest(&Cursor::new(), &ctx()).await.is_err());
    }

    #[test]
    fn test_adr_qualifier() {
        let bases = vec!["docs/adr".to_string(), "adr".to_string()];
        let q = |p: &str| adr_qualifier(p, &bases);
        assert_eq!(q("docs/adr/0003-x.md"), ("3".to_string(), Some(3)));
        assert_eq!(q("adr/12_y.md"), ("12".to_string(), Some(12)));
        assert_eq!(q("adr/y.md"), ("y".to_string(), None));
        assert_eq!(q("adr/2024plan.md"), ("2024plan".to_string(), None));
        assert_eq!(q("docs/adr/api/0001-x.md"), ("api/1".to_string(), Some(1)));
        assert_eq!(q("design/0002-z.md"), ("design/2".to_string(), Some(2)));
    }

    #[test]
    fn test_glob_base() {
        assert_eq!(glob_base("docs/adr/**/*.md"), "docs/adr");
        assert_eq!(glob_base("adr/*.md"), "adr");
        assert_eq!(glob_base("**/*.md"), "");
        assert_eq!(glob_base("docs/0001-x.md"), "docs");
    }

    fn write_adr(root: &Path, rel: &str, title: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("# 1. {}\n\nStatus: Accepted\n", title)).unwrap();
    }

    fn touch_later(path: &Path) {
        let later = SystemTime::now() + Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(later)
            .unwrap();
    }

    fn id_titles(out: &IngestOutput) -> Vec<(String, String)> {
        out.nodes
            .iter()
            .map(|n| (n.id.clone(), n.title.clone().unwrap_or_default()))
            .collect()
    }

    #[tokio::test]
    async fn test_same_number_in_sibling_directories() {
        let tmp = TempDir::new().unwrap();
        write_adr(tmp.path(), "docs/adr/backend/0001-db.md", "Use Postgres");
        write_adr(tmp.path(), "docs/adr/frontend/0001-ui.md", "Use React");
        let p = plugin(tmp.path());

        let first = p.ingest(&Cursor::new(), &ctx()).await.unwrap();
        assert_eq!(
            id_titles(&first),
            vec![
                ("adr:backend/1".to_string(), "Use Postgres".to_string()),
                ("adr:frontend/1".to_string(), "Use React".to_string()),
            ]
        );

        touch_later(&tmp.path().join("docs/adr/backend/0001-db.md"));
        let second = p.ingest(&first.cursor, &ctx()).await.unwrap();
        assert_eq!(
            id_titles(&second),
            vec![("adr:backend/1".to_string(), "Use Postgres".to_string())]
        );
    }

    #[tokio::test]
    async fn test_duplicate_number_in_one_directory_is_stable() {
        let tmp = TempDir::new().unwrap();
        write_adr(tmp.path(), "docs/adr/0001-postgres.md", "Use Postgres");
        write_adr(tmp.path(), "docs/adr/0001-react.md", "Use React");
        let p = plugin(tmp.path());

        let expected = vec![
            ("adr:1".to_string(), "Use Postgres".to_string()),
            ("adr:docs/adr/0001-react".to_string(), "Use React".to_string()),
        ];
        let first = p.ingest(&Cursor::new(), &ctx()).await.unwrap();
        assert_eq!(id_titles(&first), expected);

        // only the second file changed, but both keep their ids
        touch_later(&tmp.path().join("docs/adr/0001-react.md"));
        let second = p.ingest(&first.cursor, &ctx()).await.unwrap();
        assert_eq!(id_titles(&second), expected);
    }

    #[tokio::test]
    async fn test_cursor_mtimes_never_move_backwards() {
        let tmp = setup();
        let p = plugin(tmp.path());
        let first = p.ingest(&Cursor::new(), &ctx()).await.unwrap();

        let mut cursor: AdrCursor = decode_cursor("adr", &first.cursor);
        let ahead = i64::MAX / 2;
        cursor
            .file_mtimes
            .insert("docs/adr/record-format.md".to_string(), ahead);

        let second = p.ingest(&encode_cursor(&cursor), &ctx()).await.unwrap();
        assert!(second.nodes.is_empty());
        let after: AdrCursor = decode_cursor("adr", &second.cursor);
        assert_eq!(after.file_mtimes["docs/adr/record-format.md"], ahead);
    }

    #[test]
    fn test_parse_status_variants() {
        assert_eq!(parse_status("**Status:** Superseded"), Some("Superseded".to_string()));
        assert_eq!(parse_status("## Status\n\nDeprecated\n"), Some("Deprecated".to_string()));
        assert_eq!(parse_status("## Status\n\n## Context\n"), None);
        assert_eq!(parse_status("# Title only"), None);
    }
}
