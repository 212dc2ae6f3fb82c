//! Build manifest: per-build counts plus each plugin's resume cursor.
//!
//! Each successful build appends one row to `builds`, written inside the
//! same transaction as the build's node and edge upserts. The latest row is
//! the current manifest. Cursor contents are opaque here; plugins map them
//! to typed structs with [`decode_cursor`] and [`encode_cursor`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{Result, TrailError};
use crate::migrate;
use crate::store::{GraphStore, GraphTxn};

/// Opaque per-plugin ingestion state.
pub type Cursor = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub schema_version: String,
    pub built_at: DateTime<Utc>,
    pub node_count: i64,
    pub edge_count: i64,
    pub cursors: BTreeMap<String, Cursor>,
}

impl BuildManifest {
    /// The manifest a store starts from before its first build.
    pub fn empty() -> Self {
        Self {
            schema_version: migrate::schema_version_string(),
            built_at: DateTime::<Utc>::default(),
            node_count: 0,
            edge_count: 0,
            cursors: BTreeMap::new(),
        }
    }

    /// Prior state for `plugin`, or an empty cursor if it never ran.
    pub fn cursor_for(&self, plugin: &str) -> Cursor {
        self.cursors.get(plugin).cloned().unwrap_or_default()
    }

    pub fn set_cursor(&mut self, plugin: &str, cursor: Cursor) {
        self.cursors.insert(plugin.to_string(), cursor);
    }
}

/// A past build as listed by `trail history`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildRecord {
    pub id: i64,
    pub manifest: BuildManifest,
}

/// Load the latest manifest, or `None` before the first build.
pub async fn load_manifest(store: &GraphStore) -> Result<Option<BuildManifest>> {
    Ok(build_history(store, 1).await?.into_iter().next().map(|r| r.manifest))
}

/// Most recent builds first.
pub async fn build_history(store: &GraphStore, limit: i64) -> Result<Vec<BuildRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, built_at, schema_version, node_count, edge_count, cursors_json
        FROM builds ORDER BY id DESC LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(store.pool())
    .await
    .map_err(TrailError::store)?;

    Ok(rows
        .iter()
        .map(|row| {
            let id: i64 = row.get("id");
            let built_at: i64 = row.get("built_at");
            let cursors_json: String = row.get("cursors_json");
            let cursors = serde_json::from_str(&cursors_json).unwrap_or_else(|e| {
                let err = TrailError::malformed("manifest cursors", e);
                warn!(build = id, "{}; using empty cursors", err);
                BTreeMap::new()
            });

            BuildRecord {
                id,
                manifest: BuildManifest {
                    schema_version: row.get("schema_version"),
                    built_at: DateTime::from_timestamp(built_at, 0).unwrap_or_default(),
                    node_count: row.get("node_count"),
                    edge_count: row.get("edge_count"),
                    cursors,
                },
            }
        })
        .collect())
}

/// Persist `manifest` as the newest build row, inside the caller's transaction.
pub async fn save_manifest(txn: &mut GraphTxn, manifest: &BuildManifest) -> Result<()> {
    let cursors_json =
        serde_json::to_string(&manifest.cursors).map_err(TrailError::transaction)?;

    sqlx::query(
        r#"
        INSERT INTO builds (built_at, schema_version, node_count, edge_count, cursors_json)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(manifest.built_at.timestamp())
    .bind(&manifest.schema_version)
    .bind(manifest.node_count)
    .bind(manifest.edge_count)
    .bind(&cursors_json)
    .execute(txn.conn())
    .await
    .map_err(TrailError::transaction)?;

    Ok(())
}

/// Map an opaque cursor onto a plugin's typed cursor.
///
/// A cursor that does not fit `T` is treated as empty, which makes the
/// plugin fall back to a full pass instead of failing.
pub fn decode_cursor<T: DeserializeOwned + Default>(plugin: &str, cursor: &Cursor) -> T {
    if cursor.is_empty() {
        return T::default();
    }
    let value = Value::Object(cursor.clone().into_iter().collect());
    match serde_json::from_value(value) {
        Ok(typed) => typed,
        Err(e) => {
            warn!(plugin, "{}; starting from scratch", TrailError::malformed("cursor", e));
            T::default()
        }
    }
}

pub fn encode_cursor<T: Serialize>(typed: &T) -> Cursor {
    match serde_json::to_value(typed) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => Cursor::new(),
    }
}
