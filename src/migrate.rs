//! Schema creation and version checks.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::{Result, TrailError};

/// Schema version written by this engine, as `(major, minor)`.
pub const SCHEMA_VERSION: (u32, u32) = (1, 1);

pub fn schema_version_string() -> String {
    format!("{}.{}", SCHEMA_VERSION.0, SCHEMA_VERSION.1)
}

/// Create every table and index. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            title TEXT,
            body TEXT,
            timestamp INTEGER,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS edges (
            src TEXT NOT NULL,
            dst TEXT NOT NULL,
            relation TEXT NOT NULL,
            properties_json TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (src, dst, relation)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            built_at INTEGER NOT NULL,
            schema_version TEXT NOT NULL,
            node_count INTEGER NOT NULL,
            edge_count INTEGER NOT NULL,
            cursors_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(type)",
        "CREATE INDEX IF NOT EXISTS idx_nodes_timestamp ON nodes(timestamp DESC)",
        "CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges(dst, relation)",
    ];

    for sql in statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(TrailError::store)?;
    }

    // virtual table; created once, looked up by name
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='nodes_fts'",
    )
    .fetch_one(pool)
    .await
    .map_err(TrailError::store)?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE nodes_fts USING fts5(
                node_id UNINDEXED,
                title,
                body
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(TrailError::store)?;
    }

    sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?)")
        .bind(schema_version_string())
        .execute(pool)
        .await
        .map_err(TrailError::store)?;

    check_schema_version(pool).await?;
    Ok(())
}

/// Compare the store's schema version with the engine's.
///
/// A major mismatch is fatal. Any minor difference is readable: older
/// stores lack only additive changes, newer ones only add what we ignore.
pub async fn check_schema_version(pool: &SqlitePool) -> Result<()> {
    let stored: Option<String> = sqlx::query_scalar(
        "SELECT value FROM meta WHERE key = 'schema_version'",
    )
    .fetch_optional(pool)
    .await
    .map_err(|e| TrailError::StoreUnavailable(format!("not a codetrail store: {}", e)))?;

    let stored = stored.ok_or_else(|| {
        TrailError::StoreUnavailable("store has no schema_version record".to_string())
    })?;

    let (major, minor) = parse_version(&stored).ok_or_else(|| {
        TrailError::StoreUnavailable(format!("unreadable schema version '{}'", stored))
    })?;

    if major != SCHEMA_VERSION.0 {
        return Err(TrailError::SchemaVersionMismatch {
            store: stored,
            engine: schema_version_string(),
        });
    }

    if minor != SCHEMA_VERSION.1 {
        info!(
            store = %stored,
            engine = %schema_version_string(),
            "store minor schema version differs from engine; reading anyway"
        );
    }

    Ok(())
}

fn parse_version(s: &str) -> Option<(u32, u32)> {
    let (major, minor) = s.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.1"), Some((1, 1)));
        assert_eq!(parse_version(" 2.0 "), Some((2, 0)));
        assert_eq!(parse_version("1"), None);
        assert_eq!(parse_version("a.b"), None);
    }
}
