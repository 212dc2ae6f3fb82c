//! SQLite-backed graph store.
//!
//! Nodes, edges and the FTS5 index live in one SQLite file. All writes go
//! through a [`GraphTxn`], so a node row and its full-text entry always
//! change together and a reader never sees one without the other.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`with_transaction`](GraphStore::with_transaction) | Run writes atomically |
//! | [`get_node`](GraphStore::get_node) | Point lookup |
//! | [`edges_from`](GraphStore::edges_from) / [`edges_to`](GraphStore::edges_to) | Adjacency, optionally by relation |
//! | [`search_text`](GraphStore::search_text) | FTS5 search with substring fallback |
//! | [`stats`](GraphStore::stats) | Node and edge counts |

use chrono::DateTime;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tracing::{debug, warn};

use crate::db;
use crate::error::{Result, TrailError};
use crate::migrate;
use crate::models::{Edge, Metadata, Node, NodeType, Relation};

/// Future returned by the closure passed to [`GraphStore::with_transaction`].
pub type TxnFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>;

const NODE_COLUMNS: &str = "n.id, n.type, n.title, n.body, n.timestamp, n.metadata_json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub nodes: i64,
    pub edges: i64,
}

/// How a search hit was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    FullText,
    Substring,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub node: Node,
    /// bm25-derived relevance (higher is better); `None` for substring hits.
    pub score: Option<f64>,
    pub matched_by: MatchMode,
}

pub struct GraphStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl GraphStore {
    /// Create the store file if needed and bring the schema up to date.
    pub async fn create(path: &Path) -> Result<Self> {
        let pool = db::connect(path, true).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing store, failing if it is missing or incompatible.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path, false).await?;
        if let Err(e) = migrate::check_schema_version(&pool).await {
            pool.close().await;
            return Err(e);
        }
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Start a write transaction. Dropping the guard without
    /// [`commit`](GraphTxn::commit) rolls everything back.
    pub async fn begin(&self) -> Result<GraphTxn> {
        let tx = self.pool.begin().await.map_err(TrailError::store)?;
        Ok(GraphTxn { tx })
    }

    /// Run `f` inside one transaction; commit on `Ok`, roll back on `Err`.
    ///
    /// ```rust,no_run
    /// # use codetrail::store::GraphStore;
    /// # use codetrail::models::{Node, NodeType};
    /// # async fn example(store: &GraphStore) -> codetrail::error::Result<()> {
    /// let nodes = vec![Node::new(NodeType::Issue, 42).with_title("Slow startup")];
    /// store
    ///     .with_transaction(move |txn| Box::pin(async move { txn.upsert_nodes(&nodes).await }))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut GraphTxn) -> TxnFuture<'t, T>,
    {
        let mut txn = self.begin().await?;
        match f(&mut txn).await {
            Ok(value) => {
                txn.commit().await?;
                Ok(value)
            }
            Err(e) => {
                txn.rollback().await;
                Err(e)
            }
        }
    }

    /// Upsert nodes in a transaction of their own.
    pub async fn upsert_nodes(&self, nodes: Vec<Node>) -> Result<()> {
        self.with_transaction(move |txn| Box::pin(async move { txn.upsert_nodes(&nodes).await }))
            .await
    }

    /// Upsert edges in a transaction of their own.
    pub async fn upsert_edges(&self, edges: Vec<Edge>) -> Result<()> {
        self.with_transaction(move |txn| Box::pin(async move { txn.upsert_edges(&edges).await }))
            .await
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let row = sqlx::query(&format!("SELECT {} FROM nodes n WHERE n.id = ?", NODE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(TrailError::store)?;

        Ok(row.as_ref().map(node_from_row))
    }

    /// Outbound edges of `id`, optionally restricted to one relation.
    pub async fn edges_from(&self, id: &str, relation: Option<Relation>) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            r#"
            SELECT src, dst, relation, properties_json FROM edges
            WHERE src = ?1 AND (?2 IS NULL OR relation = ?2)
            ORDER BY dst, relation
            "#,
        )
        .bind(id)
        .bind(relation.map(|r| r.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(TrailError::store)?;

        Ok(rows.iter().filter_map(edge_from_row).collect())
    }

    /// Inbound edges of `id`, optionally restricted to one relation.
    pub async fn edges_to(&self, id: &str, relation: Option<Relation>) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            r#"
            SELECT src, dst, relation, properties_json FROM edges
            WHERE dst = ?1 AND (?2 IS NULL OR relation = ?2)
            ORDER BY src, relation
            "#,
        )
        .bind(id)
        .bind(relation.map(|r| r.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(TrailError::store)?;

        Ok(rows.iter().filter_map(edge_from_row).collect())
    }

    /// Full-text search over node titles and bodies.
    ///
    /// Uses the FTS5 index when the query parses as FTS5 syntax. When it
    /// does not (stray punctuation such as `parser.rs`), or when the index
    /// is missing, falls back to case-insensitive substring matching. An
    /// empty query returns no hits.
    pub async fn search_text(&self, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() || limit < 1 {
            return Ok(Vec::new());
        }

        match self.fts_search(query, limit).await {
            Ok(hits) => Ok(hits),
            Err(sqlx::Error::Database(e)) => {
                debug!(query, error = %e, "full-text query rejected, using substring match");
                self.substring_search(query, limit).await
            }
            Err(e) => Err(TrailError::store(e)),
        }
    }

    async fn fts_search(&self, query: &str, limit: i64) -> std::result::Result<Vec<SearchHit>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}, bm25(nodes_fts) AS rank
            FROM nodes_fts
            JOIN nodes n ON n.id = nodes_fts.node_id
            WHERE nodes_fts MATCH ?
            ORDER BY rank ASC, n.id ASC
            LIMIT ?
            "#,
            NODE_COLUMNS
        ))
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                SearchHit {
                    node: node_from_row(row),
                    score: Some(-rank),
                    matched_by: MatchMode::FullText,
                }
            })
            .collect())
    }

    async fn substring_search(&self, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM nodes n
            WHERE instr(lower(coalesce(n.title, '')), lower(?1)) > 0
               OR instr(lower(coalesce(n.body, '')), lower(?1)) > 0
            ORDER BY n.timestamp IS NULL, n.timestamp DESC, n.id ASC
            LIMIT ?2
            "#,
            NODE_COLUMNS
        ))
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(TrailError::store)?;

        Ok(rows
            .iter()
            .map(|row| SearchHit {
                node: node_from_row(row),
                score: None,
                matched_by: MatchMode::Substring,
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let mut conn = self.pool.acquire().await.map_err(TrailError::store)?;
        count_rows(&mut *conn).await.map_err(TrailError::store)
    }

    /// Node counts grouped by type, largest first.
    pub async fn count_by_type(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT type, COUNT(*) AS n FROM nodes GROUP BY type ORDER BY n DESC, type ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(TrailError::store)?;

        Ok(rows.iter().map(|r| (r.get("type"), r.get("n"))).collect())
    }

    /// Edge counts grouped by relation, largest first.
    pub async fn count_by_relation(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT relation, COUNT(*) AS n FROM edges GROUP BY relation ORDER BY n DESC, relation ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(TrailError::store)?;

        Ok(rows.iter().map(|r| (r.get("relation"), r.get("n"))).collect())
    }
}

/// An open write transaction on the store.
pub struct GraphTxn {
    tx: Transaction<'static, Sqlite>,
}

impl GraphTxn {
    /// Insert or fully replace each node, refreshing its FTS entry.
    pub async fn upsert_nodes(&mut self, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            let metadata_json = encode_map(&node.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO nodes (id, type, title, body, timestamp, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    type = excluded.type,
                    title = excluded.title,
                    body = excluded.body,
                    timestamp = excluded.timestamp,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(&node.id)
            .bind(node.node_type.as_str())
            .bind(&node.title)
            .bind(&node.body)
            .bind(node.timestamp.map(|t| t.timestamp()))
            .bind(&metadata_json)
            .execute(&mut *self.tx)
            .await
            .map_err(TrailError::transaction)?;

            sqlx::query("DELETE FROM nodes_fts WHERE node_id = ?")
                .bind(&node.id)
                .execute(&mut *self.tx)
                .await
                .map_err(TrailError::transaction)?;

            if node.title.is_some() || node.body.is_some() {
                sqlx::query("INSERT INTO nodes_fts (node_id, title, body) VALUES (?, ?, ?)")
                    .bind(&node.id)
                    .bind(node.title.as_deref().unwrap_or(""))
                    .bind(node.body.as_deref().unwrap_or(""))
                    .execute(&mut *self.tx)
                    .await
                    .map_err(TrailError::transaction)?;
            }
        }
        Ok(())
    }

    /// Insert edges; an already-present triple is left as it is.
    pub async fn upsert_edges(&mut self, edges: &[Edge]) -> Result<()> {
        for edge in edges {
            let properties_json = encode_map(&edge.properties)?;
            sqlx::query(
                r#"
                INSERT INTO edges (src, dst, relation, properties_json)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(src, dst, relation) DO NOTHING
                "#,
            )
            .bind(&edge.src)
            .bind(&edge.dst)
            .bind(edge.relation.as_str())
            .bind(&properties_json)
            .execute(&mut *self.tx)
            .await
            .map_err(TrailError::transaction)?;
        }
        Ok(())
    }

    /// Counts as seen from inside the transaction.
    pub async fn stats(&mut self) -> Result<StoreStats> {
        count_rows(&mut *self.tx).await.map_err(TrailError::transaction)
    }

    pub(crate) fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(TrailError::transaction)
    }

    pub async fn rollback(self) {
        if let Err(e) = self.tx.rollback().await {
            warn!(error = %e, "rollback failed; connection will be discarded");
        }
    }
}

async fn count_rows(conn: &mut SqliteConnection) -> std::result::Result<StoreStats, sqlx::Error> {
    let nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
        .fetch_one(&mut *conn)
        .await?;
    let edges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edges")
        .fetch_one(&mut *conn)
        .await?;
    Ok(StoreStats { nodes, edges })
}

fn encode_map(map: &Metadata) -> Result<String> {
    serde_json::to_string(map).map_err(TrailError::transaction)
}

/// Decode a stored JSON map; malformed blobs become empty maps.
pub(crate) fn decode_map(json: &str, what: &str, owner: &str) -> Metadata {
    match serde_json::from_str::<Metadata>(json) {
        Ok(map) => map,
        Err(e) => {
            let err = TrailError::malformed(what, e);
            warn!(owner, "{}; treating as empty", err);
            Metadata::new()
        }
    }
}

fn node_from_row(row: &SqliteRow) -> Node {
    let id: String = row.get("id");
    let node_type: String = row.get("type");
    let timestamp: Option<i64> = row.get("timestamp");
    let metadata_json: String = row.get("metadata_json");
    let metadata = decode_map(&metadata_json, "node metadata", &id);

    Node {
        node_type: NodeType::from(node_type),
        title: row.get("title"),
        body: row.get("body"),
        timestamp: timestamp.and_then(|secs| DateTime::from_timestamp(secs, 0)),
        metadata,
        id,
    }
}

fn edge_from_row(row: &SqliteRow) -> Option<Edge> {
    let src: String = row.get("src");
    let dst: String = row.get("dst");
    let relation: String = row.get("relation");
    let properties_json: String = row.get("properties_json");

    let relation = match relation.parse::<Relation>() {
        Ok(r) => r,
        Err(e) => {
            warn!(src = %src, dst = %dst, "{}; skipping edge", TrailError::malformed("edge", e));
            return None;
        }
    };

    let owner = format!("{} -{}-> {}", src, relation, dst);
    Some(Edge {
        properties: decode_map(&properties_json, "edge properties", &owner),
        src,
        dst,
        relation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    async fn temp_store() -> (TempDir, GraphStore) {
        let tmp = TempDir::new().unwrap();
        let store = GraphStore::create(&tmp.path().join("trail.sqlite"))
            .await
            .unwrap();
        (tmp, store)
    }

    fn issue(n: i64, title: &str, body: &str) -> Node {
        Node::new(NodeType::Issue, n)
            .with_title(title)
            .with_body(body)
            .with_timestamp(Utc.timestamp_opt(1_700_000_000 + n, 0).unwrap())
            .with_meta("number", n)
    }

    #[tokio::test]
    async fn test_upsert_replaces_whole_row() {
        let (_tmp, store) = temp_store().await;

        let first = issue(1, "Crash on start", "stack trace").with_meta("state", "open");
        store.upsert_nodes(vec![first]).await.unwrap();

        let second = issue(1, "Crash on start", "fixed");
        store.upsert_nodes(vec![second.clone()]).await.unwrap();

        let got = store.get_node("issue:1").await.unwrap().unwrap();
        assert_eq!(got, second);
        assert!(!got.metadata.contains_key("state"), "fields must not merge");
        assert_eq!(store.stats().await.unwrap().nodes, 1);
    }

    #[tokio::test]
    async fn test_edges_are_deduplicated() {
        let (_tmp, store) = temp_store().await;
        let e = Edge::new("pr:7", "commit:abc", Relation::Merges);
        store.upsert_edges(vec![e.clone(), e.clone()]).await.unwrap();
        store.upsert_edges(vec![e]).await.unwrap();
        assert_eq!(store.stats().await.unwrap().edges, 1);
    }

    #[tokio::test]
    async fn test_edge_queries_filter_by_relation() {
        let (_tmp, store) = temp_store().await;
        store
            .upsert_edges(vec![
                Edge::new("pr:7", "commit:abc", Relation::Merges),
                Edge::new("pr:7", "issue:42", Relation::Mentions),
                Edge::new("pr:8", "commit:abc", Relation::Merges),
            ])
            .await
            .unwrap();

        assert_eq!(store.edges_from("pr:7", None).await.unwrap().len(), 2);
        let mentions = store.edges_from("pr:7", Some(Relation::Mentions)).await.unwrap();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].dst, "issue:42");

        let merged_by: Vec<String> = store
            .edges_to("commit:abc", Some(Relation::Merges))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.src)
            .collect();
        assert_eq!(merged_by, vec!["pr:7", "pr:8"]);
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back_everything() {
        let (_tmp, store) = temp_store().await;
        let nodes = vec![issue(1, "a", "b")];
        let result: Result<()> = store
            .with_transaction(move |txn| {
                Box::pin(async move {
                    txn.upsert_nodes(&nodes).await?;
                    txn.upsert_edges(&[Edge::new("issue:1", "issue:2", Relation::Mentions)])
                        .await?;
                    Err::<(), _>(TrailError::TransactionFailure("injected".to_string()))
                })
            })
            .await;

        assert!(result.is_err());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats, StoreStats { nodes: 0, edges: 0 });
        assert!(store.search_text("a", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_uses_full_text_index() {
        let (_tmp, store) = temp_store().await;
        store
            .upsert_nodes(vec![
                issue(1, "Login timeout", "Sessions expire after five minutes"),
                issue(2, "Dark mode", "Add a theme toggle"),
            ])
            .await
            .unwrap();

        let hits = store.search_text("sessions", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node.id, "issue:1");
        assert_eq!(hits[0].matched_by, MatchMode::FullText);
    }

    #[tokio::test]
    async fn test_search_falls_back_on_invalid_syntax() {
        let (_tmp, store) = temp_store().await;
        store
            .upsert_nodes(vec![issue(1, "Refactor", "split parser.rs into modules")])
            .await
            .unwrap();

        let hits = store.search_text("parser.rs", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matched_by, MatchMode::Substring);
    }

    #[tokio::test]
    async fn test_search_falls_back_without_index() {
        let (_tmp, store) = temp_store().await;
        store
            .upsert_nodes(vec![issue(1, "Flaky test", "retry the network call")])
            .await
            .unwrap();
        sqlx::query("DROP TABLE nodes_fts")
            .execute(store.pool())
            .await
            .unwrap();

        let hits = store.search_text("NETWORK", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matched_by, MatchMode::Substring);
    }

    #[tokio::test]
    async fn test_search_empty_query() {
        let (_tmp, store) = temp_store().await;
        assert!(store.search_text("   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_follows_node_replacement() {
        let (_tmp, store) = temp_store().await;
        store
            .upsert_nodes(vec![issue(1, "Old title", "obsolete wording")])
            .await
            .unwrap();
        store
            .upsert_nodes(vec![issue(1, "New title", "fresh wording")])
            .await
            .unwrap();

        assert!(store.search_text("obsolete", 10).await.unwrap().is_empty());
        assert_eq!(store.search_text("fresh", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_metadata_reads_as_empty() {
        let (_tmp, store) = temp_store().await;
        store
            .upsert_nodes(vec![issue(1, "t", "b").with_meta("url", json!("https://x"))])
            .await
            .unwrap();
        sqlx::query("UPDATE nodes SET metadata_json = '{not json' WHERE id = 'issue:1'")
            .execute(store.pool())
            .await
            .unwrap();

        let node = store.get_node("issue:1").await.unwrap().unwrap();
        assert!(node.metadata.is_empty());
        assert_eq!(node.title.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_unknown_relation_rows_are_skipped() {
        let (_tmp, store) = temp_store().await;
        sqlx::query("INSERT INTO edges (src, dst, relation) VALUES ('a', 'b', 'BLOCKS')")
            .execute(store.pool())
            .await
            .unwrap();
        store
            .upsert_edges(vec![Edge::new("a", "c", Relation::Mentions)])
            .await
            .unwrap();

        let edges = store.edges_from("a", None).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].dst, "c");
    }

    #[tokio::test]
    async fn test_open_missing_store_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let err = GraphStore::open(&tmp.path().join("nope.sqlite"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TrailError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_open_rejects_major_version_mismatch() {
        let (tmp, store) = temp_store().await;
        sqlx::query("UPDATE meta SET value = '9.0' WHERE key = 'schema_version'")
            .execute(store.pool())
            .await
            .unwrap();
        store.close().await;

        let err = GraphStore::open(&tmp.path().join("trail.sqlite"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TrailError::SchemaVersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_open_accepts_older_minor_version() {
        let (tmp, store) = temp_store().await;
        sqlx::query("UPDATE meta SET value = '1.0' WHERE key = 'schema_version'")
            .execute(store.pool())
            .await
            .unwrap();
        store.close().await;

        assert!(GraphStore::open(&tmp.path().join("trail.sqlite")).await.is_ok());
    }
}
