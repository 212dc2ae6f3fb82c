//! `trail search`: full-text lookup over node titles and bodies.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::{Config, QueryConfig};
use crate::store::{GraphStore, MatchMode, SearchHit};

/// Search with the configured default limit, bounded by `[query].timeout_secs`.
pub async fn search_nodes(
    store: &GraphStore,
    query_cfg: &QueryConfig,
    query: &str,
    limit: Option<i64>,
) -> Result<Vec<SearchHit>> {
    let limit = limit.unwrap_or(query_cfg.default_limit);
    let timeout = Duration::from_secs(query_cfg.timeout_secs);
    let hits = tokio::time::timeout(timeout, store.search_text(query, limit))
        .await
        .with_context(|| format!("search timed out after {:?}", timeout))??;
    Ok(hits)
}

pub async fn run_search(config: &Config, query: &str, limit: Option<i64>, json: bool) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let store = GraphStore::open(&config.db.path).await?;
    let hits = search_nodes(&store, &config.query, query, limit).await;
    store.close().await;
    let hits = hits?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    if hits.iter().any(|h| h.matched_by == MatchMode::Substring) {
        println!("(full-text index unavailable for this query; showing substring matches)");
    }
    for (i, hit) in hits.iter().enumerate() {
        let score = hit
            .score
            .map(|s| format!("{:.2}", s))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}. [{}] {}  {}",
            i + 1,
            score,
            hit.node.id,
            hit.node.title.as_deref().unwrap_or("(untitled)")
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Node, NodeType};

    #[tokio::test]
    async fn test_search_nodes_applies_default_limit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = GraphStore::create(&tmp.path().join("s.sqlite")).await.unwrap();
        store
            .upsert_nodes(
                (1..=5)
                    .map(|n| Node::new(NodeType::Issue, n).with_title(format!("cache bug {}", n)))
                    .collect(),
            )
            .await
            .unwrap();

        let cfg = QueryConfig {
            default_limit: 2,
            timeout_secs: 5,
        };
        assert_eq!(search_nodes(&store, &cfg, "cache", None).await.unwrap().len(), 2);
        assert_eq!(search_nodes(&store, &cfg, "cache", Some(4)).await.unwrap().len(), 4);
    }
}
