//! Node retrieval by id.
//!
//! Fetches one node plus its incident edges. Used by both `trail get` and
//! `GET /node`.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::error;
use crate::models::{Edge, Node};
use crate::stats::format_ts_iso;
use crate::store::GraphStore;

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub node: Node,
    pub outgoing: Vec<Edge>,
    pub incoming: Vec<Edge>,
}

/// Core lookup returning structured data (used by CLI and server).
pub async fn get_node_view(store: &GraphStore, id: &str) -> error::Result<Option<NodeView>> {
    let Some(node) = store.get_node(id).await? else {
        return Ok(None);
    };
    Ok(Some(NodeView {
        outgoing: store.edges_from(id, None).await?,
        incoming: store.edges_to(id, None).await?,
        node,
    }))
}

/// CLI entry point: look up `id` and print it to stdout.
pub async fn run_get(config: &Config, id: &str, json: bool) -> Result<()> {
    let store = GraphStore::open(&config.db.path).await?;
    let view = get_node_view(&store, id).await?;
    store.close().await;

    let Some(view) = view else {
        bail!("node not found: {}", id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let node = &view.node;
    println!("--- Node ---");
    println!("id:         {}", node.id);
    println!("type:       {}", node.node_type);
    println!("title:      {}", node.title.as_deref().unwrap_or("(untitled)"));
    if let Some(ts) = node.timestamp {
        println!("timestamp:  {}", format_ts_iso(ts.timestamp()));
    }
    for (key, value) in &node.metadata {
        println!("{:<11} {}", format!("{}:", key), value);
    }
    println!();

    if let Some(body) = &node.body {
        println!("--- Body ---");
        println!("{}", body);
        println!();
    }

    println!("--- Edges ({} out, {} in) ---", view.outgoing.len(), view.incoming.len());
    for edge in &view.outgoing {
        println!("  -{}-> {}", edge.relation, edge.dst);
    }
    for edge in &view.incoming {
        println!("  <-{}- {}", edge.relation, edge.src);
    }

    Ok(())
}
