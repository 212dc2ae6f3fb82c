//! Core data models for the history graph.
//!
//! Nodes and edges are what plugins produce and what the store persists.
//! Metadata and edge properties are open maps with JSON-typed values; each
//! node type also has a small table of well-known keys whose value shape
//! is checked by [`Node::validate`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Open string-keyed map of variant-typed values.
///
/// `BTreeMap` keeps serialization order stable, so re-ingesting identical
/// source state produces byte-identical JSON blobs.
pub type Metadata = BTreeMap<String, Value>;

/// Type of a node. Closed for the built-in sources, open for plugins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Commit,
    PullRequest,
    Issue,
    Adr,
    File,
    Other(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Commit => "commit",
            NodeType::PullRequest => "pr",
            NodeType::Issue => "issue",
            NodeType::Adr => "adr",
            NodeType::File => "file",
            NodeType::Other(s) => s.as_str(),
        }
    }

    /// Build the conventional `{type}:{qualifier}` id.
    pub fn node_id(&self, qualifier: impl fmt::Display) -> String {
        format!("{}:{}", self.as_str(), qualifier)
    }

    /// Well-known metadata keys for this type and the value shape each must have.
    pub fn known_metadata_keys(&self) -> &'static [(&'static str, ValueShape)] {
        match self {
            NodeType::Commit => &[
                ("sha", ValueShape::String),
                ("author", ValueShape::String),
                ("email", ValueShape::String),
                ("parents", ValueShape::StringArray),
                ("files", ValueShape::StringArray),
            ],
            NodeType::PullRequest => &[
                ("number", ValueShape::Integer),
                ("url", ValueShape::String),
                ("state", ValueShape::String),
                ("author", ValueShape::String),
                ("merge_commit_sha", ValueShape::String),
            ],
            NodeType::Issue => &[
                ("number", ValueShape::Integer),
                ("url", ValueShape::String),
                ("state", ValueShape::String),
                ("author", ValueShape::String),
            ],
            NodeType::Adr => &[("path", ValueShape::String), ("status", ValueShape::String)],
            NodeType::File => &[("path", ValueShape::String)],
            NodeType::Other(_) => &[],
        }
    }
}

impl From<String> for NodeType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "commit" => NodeType::Commit,
            "pr" => NodeType::PullRequest,
            "issue" => NodeType::Issue,
            "adr" => NodeType::Adr,
            "file" => NodeType::File,
            _ => NodeType::Other(s),
        }
    }
}

impl From<NodeType> for String {
    fn from(t: NodeType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape a well-known metadata value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    String,
    Integer,
    StringArray,
}

impl ValueShape {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ValueShape::String => value.is_string(),
            ValueShape::Integer => value.is_i64() || value.is_u64(),
            ValueShape::StringArray => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
        }
    }
}

/// Directed edge relation. Closed per engine version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Relation {
    /// commit → file
    Modifies,
    /// PR → commit
    Merges,
    /// PR/issue → issue
    Mentions,
    /// ADR → file/commit/issue
    Decides,
}

impl Relation {
    pub const ALL: [Relation; 4] = [
        Relation::Modifies,
        Relation::Merges,
        Relation::Mentions,
        Relation::Decides,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Modifies => "MODIFIES",
            Relation::Merges => "MERGES",
            Relation::Mentions => "MENTIONS",
            Relation::Decides => "DECIDES",
        }
    }
}

impl FromStr for Relation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Relation::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown relation '{}'", s))
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed entity in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub title: Option<String>,
    pub body: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Node {
    pub fn new(node_type: NodeType, qualifier: impl fmt::Display) -> Self {
        Self {
            id: node_type.node_id(qualifier),
            node_type,
            title: None,
            body: None,
            timestamp: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Check well-known metadata keys for the right value shape.
    ///
    /// Unknown keys pass through untouched. Returns one message per problem.
    pub fn validate(&self) -> Vec<String> {
        self.node_type
            .known_metadata_keys()
            .iter()
            .filter_map(|(key, shape)| match self.metadata.get(*key) {
                Some(v) if !shape.matches(v) => Some(format!(
                    "{}: metadata key '{}' should be {:?}, got {}",
                    self.id, key, shape, v
                )),
                _ => None,
            })
            .collect()
    }
}

/// A directed, typed relationship. `(src, dst, relation)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub src: String,
    pub dst: String,
    pub relation: Relation,
    #[serde(default)]
    pub properties: Metadata,
}

impl Edge {
    pub fn new(src: impl Into<String>, dst: impl Into<String>, relation: Relation) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            relation,
            properties: Metadata::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}
