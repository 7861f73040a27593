//! The data-source driver interface.
//!
//! Drivers are external collaborators: the engine prepares them once
//! at config-parse time and calls [`DataSource::process`] with fully
//! substituted queries at request time. Drivers must be safe for
//! concurrent `process` calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::request::{FilterOperator, OrderDirection};
use crate::resource::DataSourceDescriptor;

/// One backend row.
pub type Row = serde_json::Map<String, Value>;

/// A projection + selection handed to a driver.
///
/// By the time a query reaches a driver, every filter value is
/// [`SourceValue::Plain`]; the marker variants only occur inside the
/// data-source tree before substitution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceQuery {
    /// Driver type name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Storage-level columns to fetch.
    pub attributes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<SourceFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<SourceOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Group columns for per-group limiting of nested collections.
    #[serde(rename = "limitPer", skip_serializing_if = "Option::is_none")]
    pub limit_per: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u64>,
    /// Driver-specific descriptor options, passed through verbatim.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, Value>,
    /// Whatever the driver stashed at prepare time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepared: Option<Value>,
}

impl SourceQuery {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
            filter: None,
            search: None,
            order: Vec::new(),
            limit: None,
            limit_per: None,
            page: None,
            options: serde_json::Map::new(),
            prepared: None,
        }
    }
}

/// Selection in disjunctive normal form: OR over AND-groups.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceFilter(pub Vec<Vec<SourceCondition>>);

impl SourceFilter {
    pub fn single(condition: SourceCondition) -> Self {
        Self(vec![vec![condition]])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn conditions(&self) -> impl Iterator<Item = &SourceCondition> {
        self.0.iter().flatten()
    }

    pub fn conditions_mut(&mut self) -> impl Iterator<Item = &mut SourceCondition> {
        self.0.iter_mut().flatten()
    }
}

/// One storage-level condition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceCondition {
    pub attribute: FilterKey,
    pub operator: FilterOperator,
    pub value: SourceValue,
}

/// A condition target: one column, or several for composite keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterKey {
    Column(String),
    Composite(Vec<String>),
}

impl FilterKey {
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Self::Column(c) => vec![c.as_str()],
            Self::Composite(cs) => cs.iter().map(String::as_str).collect(),
        }
    }
}

/// A condition value, tagged by where it comes from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SourceValue {
    /// An immediate value.
    Plain(Value),
    /// Substituted from the parent node's result rows.
    #[serde(rename = "valueFromParentKey")]
    FromParentKey,
    /// Substituted from the sub-filter at this index.
    #[serde(rename = "valueFromSubFilter")]
    FromSubFilter(usize),
}

impl SourceValue {
    /// The immediate value; markers resolve to null.
    pub fn as_plain(&self) -> Option<&Value> {
        match self {
            Self::Plain(v) => Some(v),
            _ => None,
        }
    }
}

/// One ORDER term at the storage level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceOrder {
    pub column: String,
    pub direction: OrderDirection,
}

/// What a driver returns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceResult {
    pub rows: Vec<Row>,
    /// Null when the driver cannot cheaply count and no pagination
    /// was requested.
    pub total_count: Option<u64>,
}

impl SourceResult {
    pub fn empty() -> Self {
        Self {
            rows: Vec::new(),
            total_count: Some(0),
        }
    }
}

/// A data-source driver.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Invoked once per descriptor at config-parse time with every
    /// storage column the configuration references. May stash
    /// prepared state on the descriptor; must be deterministic for
    /// equal inputs.
    fn prepare(&self, descriptor: &mut DataSourceDescriptor, columns: &[String]) -> Result<()>;

    /// Execute a query. The cancellation token is the caller's
    /// handle; long-running drivers should observe it.
    async fn process(
        &self,
        query: &SourceQuery,
        cancel: &CancellationToken,
    ) -> Result<SourceResult>;

    /// Graceful shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Registry of initialized drivers, established at engine init and
/// read-only afterwards.
#[derive(Clone, Default)]
pub struct DataSourceRegistry {
    drivers: HashMap<String, Arc<dyn DataSource>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its type name.
    pub fn register(&mut self, kind: impl Into<String>, driver: Arc<dyn DataSource>) {
        self.drivers.insert(kind.into(), driver);
    }

    /// Look up a driver by type name.
    pub fn get(&self, kind: &str) -> Result<&Arc<dyn DataSource>> {
        self.drivers
            .get(kind)
            .ok_or_else(|| Error::Implementation(format!("unknown data source type \"{kind}\"")))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.drivers.contains_key(kind)
    }

    /// Close every registered driver.
    pub async fn close_all(&self) -> Result<()> {
        for driver in self.drivers.values() {
            driver.close().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = DataSourceRegistry::new();
        assert!(registry.get("mysql").is_err());
        assert!(!registry.contains("mysql"));
    }

    #[test]
    fn test_filter_key_columns() {
        assert_eq!(FilterKey::Column("id".into()).columns(), vec!["id"]);
        assert_eq!(
            FilterKey::Composite(vec!["a".into(), "b".into()]).columns(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_source_query_serialization() {
        let mut query = SourceQuery::new("memory");
        query.attributes = vec!["id".into(), "name".into()];
        query.filter = Some(SourceFilter::single(SourceCondition {
            attribute: FilterKey::Column("id".into()),
            operator: crate::request::FilterOperator::Equal,
            value: SourceValue::Plain(serde_json::json!(1)),
        }));

        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(json["type"], "memory");
        assert_eq!(json["filter"][0][0]["attribute"], "id");
    }
}
