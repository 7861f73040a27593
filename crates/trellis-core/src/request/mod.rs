//! The logical request model.
//!
//! A request names a resource and an action plus a projection tree
//! with optional filter, search, order, limit, page, and id. Parsing
//! the transport representation (URL, headers) is the caller's
//! concern; this module defines the domain types and the select-tree
//! syntax.

pub mod select;

pub use select::{Select, SelectItem, SelectItemOptions};

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// An attribute path: `author.group.name` as segments.
pub type AttrPath = Vec<String>;

/// Split a dotted path into segments.
pub fn parse_attr_path(s: &str) -> AttrPath {
    s.split('.').map(str::to_string).collect()
}

/// Join path segments with dots for display and error messages.
pub fn attr_path_str(path: &[String]) -> String {
    path.join(".")
}

// ============================================================================
// Request
// ============================================================================

/// A fully parsed request ready for resolution.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Request {
    pub resource: String,
    pub action: Action,
    pub format: Format,
    /// Primary-key equality shortcut; only legal at the root.
    pub id: Option<Value>,
    pub select: Option<Select>,
    pub filter: Option<FilterTree>,
    pub search: Option<String>,
    #[serde(deserialize_with = "deserialize_order", default)]
    pub order: Vec<OrderSpec>,
    pub limit: Option<u64>,
    pub page: Option<u64>,
    /// Attach the executed plan to the response (`_explain`).
    #[serde(rename = "_explain")]
    pub explain: bool,
    /// Attach profiler timings to the response (`_profile`).
    #[serde(rename = "_profile")]
    pub profile: ProfileMode,
    /// Internal requests may select hidden attributes.
    #[serde(skip)]
    pub internal: bool,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            resource: String::new(),
            action: Action::Retrieve,
            format: Format::Json,
            id: None,
            select: None,
            filter: None,
            search: None,
            order: Vec::new(),
            limit: None,
            page: None,
            explain: false,
            profile: ProfileMode::Off,
            internal: false,
        }
    }
}

impl Request {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_select(mut self, select: Select) -> Self {
        self.select = Some(select);
        self
    }

    pub fn with_filter(mut self, filter: FilterTree) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn with_order(mut self, attribute: &str, direction: OrderDirection) -> Self {
        self.order.push(OrderSpec {
            attribute: parse_attr_path(attribute),
            direction,
        });
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_page(mut self, page: u64) -> Self {
        self.page = Some(page);
        self
    }
}

/// The requested action. Only retrieval is served by the core engine;
/// other actions are routed to extensions by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Retrieve,
}

/// The response format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
}

/// Profiling detail requested via `_profile`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProfileMode {
    #[default]
    Off,
    /// `_profile=1`: durations aggregated by span name.
    Aggregated,
    /// `_profile=raw`: the full span tree.
    Raw,
}

impl<'de> Deserialize<'de> for ProfileMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Null => Ok(Self::Off),
            Value::Bool(false) => Ok(Self::Off),
            Value::Bool(true) => Ok(Self::Aggregated),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Self::Off),
            Value::Number(_) => Ok(Self::Aggregated),
            Value::String(s) => match s.as_str() {
                "" | "0" => Ok(Self::Off),
                "raw" => Ok(Self::Raw),
                _ => Ok(Self::Aggregated),
            },
            other => Err(de::Error::custom(format!("invalid _profile value {other}"))),
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Filter operators accepted on leaf attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Like,
    Between,
    NotBetween,
}

impl FilterOperator {
    pub const ALL: &'static [FilterOperator] = &[
        Self::Equal,
        Self::NotEqual,
        Self::Greater,
        Self::GreaterOrEqual,
        Self::Less,
        Self::LessOrEqual,
        Self::Like,
        Self::Between,
        Self::NotBetween,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "equal",
            Self::NotEqual => "notEqual",
            Self::Greater => "greater",
            Self::GreaterOrEqual => "greaterOrEqual",
            Self::Less => "less",
            Self::LessOrEqual => "lessOrEqual",
            Self::Like => "like",
            Self::Between => "between",
            Self::NotBetween => "notBetween",
        }
    }
}

impl FromStr for FilterOperator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| Error::Request(format!("invalid filter operator \"{s}\"")))
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `attribute operator value` condition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterPart {
    #[serde(deserialize_with = "deserialize_attr_path")]
    pub attribute: AttrPath,
    pub operator: FilterOperator,
    pub value: Value,
}

impl FilterPart {
    pub fn new(attribute: &str, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            attribute: parse_attr_path(attribute),
            operator,
            value: value.into(),
        }
    }
}

/// A filter in disjunctive normal form: OR over AND-groups.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterTree(pub Vec<Vec<FilterPart>>);

impl FilterTree {
    /// A tree holding a single condition.
    pub fn single(part: FilterPart) -> Self {
        Self(vec![vec![part]])
    }

    /// One AND-group of conditions.
    pub fn and(parts: Vec<FilterPart>) -> Self {
        Self(vec![parts])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Conjoin two DNF trees by cross-producting their OR branches.
    pub fn cross(self, other: FilterTree) -> FilterTree {
        if self.0.is_empty() {
            return other;
        }
        if other.0.is_empty() {
            return self;
        }
        let mut branches = Vec::with_capacity(self.0.len() * other.0.len());
        for left in &self.0 {
            for right in &other.0 {
                let mut branch = left.clone();
                branch.extend(right.iter().cloned());
                branches.push(branch);
            }
        }
        FilterTree(branches)
    }

    /// Iterate every leaf condition.
    pub fn parts(&self) -> impl Iterator<Item = &FilterPart> {
        self.0.iter().flatten()
    }
}

// ============================================================================
// Ordering
// ============================================================================

/// Sort directions accepted on orderable attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Asc,
    Desc,
    Random,
    Topflop,
}

impl OrderDirection {
    pub const ALL: &'static [OrderDirection] =
        &[Self::Asc, Self::Desc, Self::Random, Self::Topflop];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
            Self::Random => "random",
            Self::Topflop => "topflop",
        }
    }
}

impl FromStr for OrderDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|dir| dir.as_str() == s)
            .ok_or_else(|| Error::Request(format!("invalid order direction \"{s}\"")))
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ORDER term.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    #[serde(deserialize_with = "deserialize_attr_path")]
    pub attribute: AttrPath,
    pub direction: OrderDirection,
}

impl OrderSpec {
    pub fn new(attribute: &str, direction: OrderDirection) -> Self {
        Self {
            attribute: parse_attr_path(attribute),
            direction,
        }
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

/// Attribute paths deserialize from `"a.b"` or `["a", "b"]`.
fn deserialize_attr_path<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<AttrPath, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Dotted(String),
        Segments(Vec<String>),
    }
    Ok(match Repr::deserialize(deserializer)? {
        Repr::Dotted(s) => parse_attr_path(&s),
        Repr::Segments(v) => v,
    })
}

/// Order deserializes from a list of specs or a single `"attr:dir"` string.
fn deserialize_order<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<OrderSpec>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Compact(String),
        Specs(Vec<OrderSpec>),
    }
    match Option::<Repr>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(Repr::Specs(specs)) => Ok(specs),
        Some(Repr::Compact(s)) => s
            .split(',')
            .map(|term| {
                let (attr, dir) = term.split_once(':').unwrap_or((term, "asc"));
                Ok(OrderSpec {
                    attribute: parse_attr_path(attr),
                    direction: dir.parse().map_err(de::Error::custom)?,
                })
            })
            .collect(),
    }
}
