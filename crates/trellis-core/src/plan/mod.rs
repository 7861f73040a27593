//! Query planning.
//!
//! The resolver maps a request against the parsed configuration and
//! produces two trees: the resolved resource tree guiding result
//! assembly, and the data-source tree (DST) the executor walks.

mod resolver;

pub use resolver::resolve;

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::cast::CastOptions;
use crate::datasource::SourceQuery;
use crate::request::AttrPath;

/// The resolver's output for one request.
#[derive(Clone, Debug)]
pub struct ResolvedRequest {
    pub resource: String,
    /// Single object vs collection at the root.
    pub many: bool,
    /// Guides result assembly.
    pub root: ResolvedResource,
    /// The executable plan.
    pub dst: DstNode,
}

/// One resource frame of the resolved tree: the selected attributes
/// of a resource, annotated with the data sources serving them.
#[derive(Clone, Debug, Serialize)]
pub struct ResolvedResource {
    /// Absolute attribute path of this frame; empty at the root.
    pub attr_path: AttrPath,
    /// The iteration data source of this frame.
    pub primary_source: String,
    /// Primary-key columns in the primary source's rows.
    pub primary_key_columns: Vec<String>,
    /// Secondary sources serving selected attributes, in declaration
    /// order. Join sources are carried by the relation instead.
    pub secondary_sources: Vec<String>,
    pub children: Vec<ResolvedChild>,
}

/// A selected attribute in a resolved frame.
#[derive(Clone, Debug, Serialize)]
pub enum ResolvedChild {
    Leaf(ResolvedLeaf),
    Nested {
        name: String,
        hidden: bool,
        children: Vec<ResolvedChild>,
    },
    Sub(ResolvedSubResource),
}

impl ResolvedChild {
    pub fn name(&self) -> &str {
        match self {
            Self::Leaf(leaf) => &leaf.name,
            Self::Nested { name, .. } => name,
            Self::Sub(sub) => &sub.name,
        }
    }

    /// Internal selections are fetched but not emitted.
    pub fn is_internal(&self) -> bool {
        match self {
            Self::Leaf(leaf) => leaf.internal,
            Self::Nested { .. } => false,
            Self::Sub(sub) => sub.internal,
        }
    }
}

/// A selected value attribute.
#[derive(Clone, Debug, Serialize)]
pub struct ResolvedLeaf {
    pub name: String,
    /// Fetched for joining or `depends`, not part of the response.
    pub internal: bool,
    /// Static value; mapped leaves carry source and column instead.
    pub value: Option<Value>,
    /// Data source serving this leaf (a frame source or a join
    /// source carried by the enclosing relation).
    pub source: Option<String>,
    pub column: Option<String>,
    pub cast: CastOptions,
}

/// A selected relation.
#[derive(Clone, Debug, Serialize)]
pub struct ResolvedSubResource {
    pub name: String,
    pub internal: bool,
    pub many: bool,
    /// Columns holding the parent-side key values.
    pub parent_key_columns: Vec<String>,
    /// The parent-frame source those columns live in.
    pub parent_key_source: String,
    /// The single parent-key column holds a list; dereference per
    /// element.
    pub multi_valued_parent_key: bool,
    /// Child rows are unique per key.
    pub unique_child_key: bool,
    /// Join-table hop for m:n relations.
    pub join: Option<ResolvedJoin>,
    /// The child frame.
    pub resource: ResolvedResource,
}

/// The join-table hop of an m:n relation.
#[derive(Clone, Debug, Serialize)]
pub struct ResolvedJoin {
    /// The join data source.
    pub source: String,
    /// Join-row columns matched against the parent key.
    pub parent_columns: Vec<String>,
    /// Join-row columns pointing at child rows.
    pub child_columns: Vec<String>,
}

/// One executable query of the data-source tree.
#[derive(Clone, Debug, Serialize)]
pub struct DstNode {
    /// Resource-frame path this query belongs to.
    pub attr_path: AttrPath,
    /// Data-source name within the frame.
    pub source: String,
    pub query: SourceQuery,
    /// Cast options per storage column, used for casting rows and
    /// filter values.
    pub cast_options: HashMap<String, CastOptions>,
    /// Columns in the parent node's rows whose values key this query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<Vec<String>>,
    /// Columns in this node's rows the parent joins on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_key: Option<Vec<String>>,
    pub multi_valued_parent_key: bool,
    pub unique_child_key: bool,
    /// Key-collecting queries that must finish before this query runs.
    pub sub_filters: Vec<DstNode>,
    /// Dependent queries keyed by this query's rows.
    pub sub_requests: Vec<DstNode>,
}

impl DstNode {
    /// Diagnostic name: `attributePath:dataSourceName`.
    pub fn request_name(&self) -> String {
        let path = if self.attr_path.is_empty() {
            "root".to_string()
        } else {
            self.attr_path.join(".")
        };
        format!("{path}:{}", self.source)
    }
}
