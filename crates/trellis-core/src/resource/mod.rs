//! Parsed resource configuration.
//!
//! A raw config tree (JSON) goes through two passes: option parsing
//! with local validation ([`parser`]), then relation resolution with
//! every resource visible ([`relations`]). The types here are the
//! parsed form both passes produce; they are built once at engine
//! init and immutable afterwards.

pub mod parser;
pub mod relations;

pub use parser::parse_resources;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::cast::CastOptions;
use crate::request::{AttrPath, FilterOperator, OrderDirection, OrderSpec, Select};

/// A parsed resource: primary key, data-source bindings, and the
/// attribute tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Name, or dotted path for embedded sub-resources.
    pub name: String,
    /// Ordered attribute paths; composite keys allowed.
    pub primary_key: Vec<AttrPath>,
    /// Storage columns of the primary key, per data source. Complete
    /// for every non-join data source after pass 2.
    pub resolved_primary_key: HashMap<String, Vec<String>>,
    pub data_sources: IndexMap<String, DataSourceDescriptor>,
    /// Overrides which data source iteration starts from.
    pub primary_name: Option<String>,
    pub sub_filters: Vec<SubFilterSpec>,
    pub attributes: IndexMap<String, AttributeNode>,
    pub default_limit: Option<u64>,
    pub max_limit: Option<u64>,
    pub default_order: Vec<OrderSpec>,
    pub permission: Option<String>,
}

impl ResourceConfig {
    /// Look up an attribute node by path.
    pub fn attribute(&self, path: &[String]) -> Option<&AttributeNode> {
        let (first, rest) = path.split_first()?;
        let mut node = self.attributes.get(first)?;
        for segment in rest {
            node = match node {
                AttributeNode::Nested(nested) => nested.attributes.get(segment)?,
                AttributeNode::SubResource(sub) => sub.config.attributes.get(segment)?,
                AttributeNode::Leaf(_) => return None,
            };
        }
        Some(node)
    }

    /// Look up a leaf attribute by path.
    pub fn leaf(&self, path: &[String]) -> Option<&LeafAttribute> {
        match self.attribute(path)? {
            AttributeNode::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// Iterate the names of data sources that are not join tables.
    pub fn non_join_sources(&self) -> impl Iterator<Item = &str> {
        self.data_sources
            .iter()
            .filter(|(_, descriptor)| !descriptor.is_join)
            .map(|(name, _)| name.as_str())
    }

    /// The conventional primary source name, honoring `primaryName`.
    pub fn default_primary_source(&self) -> &str {
        self.primary_name
            .as_deref()
            .unwrap_or(parser::PRIMARY_SOURCE)
    }
}

/// An attribute node: a mapped value, a namespace, or a relation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AttributeNode {
    Leaf(LeafAttribute),
    Nested(NestedAttribute),
    SubResource(Box<SubResourceAttribute>),
}

impl AttributeNode {
    pub fn is_hidden(&self) -> bool {
        match self {
            Self::Leaf(leaf) => leaf.hidden,
            Self::Nested(nested) => nested.hidden,
            Self::SubResource(sub) => sub.hidden,
        }
    }

    pub fn is_deprecated(&self) -> bool {
        match self {
            Self::Leaf(leaf) => leaf.deprecated,
            Self::Nested(_) => false,
            Self::SubResource(sub) => sub.deprecated,
        }
    }
}

/// A value-bearing attribute, either static or mapped onto data-source
/// columns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeafAttribute {
    /// Logical/stored type, multiValued, delimiter.
    pub cast: CastOptions,
    /// Data source name → storage column.
    pub mapping: IndexMap<String, String>,
    /// Allowed filter operators; None means not filterable.
    pub filter: Option<Vec<FilterOperator>>,
    /// Allowed order directions; None means not orderable.
    pub order: Option<Vec<OrderDirection>>,
    /// Static value instead of a mapping.
    pub value: Option<Value>,
    pub hidden: bool,
    pub deprecated: bool,
    /// Extra projection fetched whenever this attribute is selected,
    /// without appearing in the response.
    pub depends: Option<Select>,
}

impl LeafAttribute {
    /// The storage column in the given data source, if mapped there.
    pub fn column(&self, source: &str) -> Option<&str> {
        self.mapping.get(source).map(String::as_str)
    }

    pub fn allows_filter(&self, op: FilterOperator) -> bool {
        self.filter
            .as_ref()
            .is_some_and(|ops| ops.contains(&op))
    }

    pub fn allows_order(&self, dir: OrderDirection) -> bool {
        self.order
            .as_ref()
            .is_some_and(|dirs| dirs.contains(&dir))
    }
}

/// A pure namespace grouping further attributes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NestedAttribute {
    pub attributes: IndexMap<String, AttributeNode>,
    pub hidden: bool,
}

/// A related resource reachable through parent/child keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubResourceAttribute {
    /// The embedded resource config (expanded from `resource:` when a
    /// reference was used).
    pub config: ResourceConfig,
    /// Unexpanded `resource:` reference, cleared by pass 2.
    pub resource_ref: Option<String>,
    /// Attribute paths in the parent resource.
    pub parent_key: Vec<AttrPath>,
    /// Attribute paths in this resource.
    pub child_key: Vec<AttrPath>,
    /// Parent-key storage columns per parent data source.
    pub resolved_parent_key: HashMap<String, Vec<String>>,
    /// Child-key storage columns per child data source.
    pub resolved_child_key: HashMap<String, Vec<String>>,
    /// Collection relation (1:n, m:n) vs single-valued.
    pub many: bool,
    /// Data source acting as join table for m:n.
    pub join_via: Option<String>,
    /// Child-key rows are unique per key value.
    pub unique_child_key: bool,
    /// The single parent-key attribute is multi-valued.
    pub multi_valued_parent_key: bool,
    pub hidden: bool,
    pub deprecated: bool,
}

/// A data-source binding of one resource.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    /// Driver type name.
    pub kind: String,
    /// Can serve full-text search.
    pub searchable: bool,
    /// Inherits connection settings from the primary source.
    pub inherit: bool,
    /// Marked when another relation uses this source via `joinVia`.
    pub is_join: bool,
    /// Join-table side of the parent key (attribute paths).
    pub join_parent_key: Option<Vec<AttrPath>>,
    /// Join-table side of the child key (attribute paths).
    pub join_child_key: Option<Vec<AttrPath>>,
    /// Storage columns for `join_parent_key`.
    pub resolved_join_parent_key: Option<Vec<String>>,
    /// Storage columns for `join_child_key`.
    pub resolved_join_child_key: Option<Vec<String>>,
    /// Driver-specific options, passed through to the driver.
    pub options: serde_json::Map<String, Value>,
    /// State stashed by the driver's `prepare`.
    pub prepared: Option<Value>,
}

/// A filter across a sub-resource boundary, served by a separate
/// key-collecting query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubFilterSpec {
    pub attribute: AttrPath,
    pub operators: Vec<FilterOperator>,
    /// Inline the filter as a plain condition on this attribute
    /// instead of running a sub-query.
    pub rewrite_to: Option<AttrPath>,
}
