//! In-memory data source.
//!
//! Rows live in the descriptor's `data` option. The driver implements
//! the full query surface and serves as the reference for driver
//! semantics; production deployments use it for fixtures and tests.

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use tokio_util::sync::CancellationToken;

use trellis_core::datasource::{
    DataSource, FilterKey, Row, SourceCondition, SourceFilter, SourceQuery, SourceResult,
    SourceValue,
};
use trellis_core::error::{Error, Result};
use trellis_core::request::{FilterOperator, OrderDirection};
use trellis_core::resource::DataSourceDescriptor;

/// The driver type name.
pub const MEMORY_SOURCE: &str = "memory";

/// A driver answering queries from rows embedded in the descriptor.
#[derive(Debug, Default)]
pub struct MemoryDataSource;

#[async_trait]
impl DataSource for MemoryDataSource {
    fn prepare(&self, descriptor: &mut DataSourceDescriptor, _columns: &[String]) -> Result<()> {
        match descriptor.options.get("data") {
            Some(Value::Array(_)) => Ok(()),
            Some(other) => Err(Error::Implementation(format!(
                "memory data source: \"data\" must be a list of rows, got {other}"
            ))),
            None => Err(Error::Implementation(
                "memory data source: missing \"data\" option".into(),
            )),
        }
    }

    async fn process(
        &self,
        query: &SourceQuery,
        cancel: &CancellationToken,
    ) -> Result<SourceResult> {
        if cancel.is_cancelled() {
            return Err(Error::Connection("query cancelled".into()));
        }

        let rows = query
            .options
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Implementation("memory data source: missing rows".into()))?;

        let mut matching: Vec<Row> = rows
            .iter()
            .filter_map(Value::as_object)
            .filter(|row| matches_filter(row, query.filter.as_ref()))
            .filter(|row| matches_search(row, query))
            .cloned()
            .collect();

        sort_rows(&mut matching, &query.order);
        let total = matching.len() as u64;
        let mut matching = apply_limits(matching, query);

        for row in &mut matching {
            project(row, &query.attributes);
        }

        Ok(SourceResult {
            rows: matching,
            total_count: Some(total),
        })
    }
}

// ============================================================================
// Filtering
// ============================================================================

fn matches_filter(row: &Row, filter: Option<&SourceFilter>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    if filter.0.is_empty() {
        return true;
    }
    filter
        .0
        .iter()
        .any(|branch| branch.iter().all(|condition| matches_condition(row, condition)))
}

fn matches_condition(row: &Row, condition: &SourceCondition) -> bool {
    let value = match &condition.value {
        SourceValue::Plain(value) => value,
        // Markers are substituted before a driver sees the query.
        _ => return false,
    };
    match &condition.attribute {
        FilterKey::Column(column) => {
            let cell = row.get(column).unwrap_or(&Value::Null);
            matches_operator(cell, condition.operator, value)
        }
        // Composite conditions are tuple membership tests; the value
        // is a list of tuples.
        FilterKey::Composite(columns) => {
            let tuple = Value::Array(
                columns
                    .iter()
                    .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
                    .collect(),
            );
            let matched = value
                .as_array()
                .is_some_and(|tuples| tuples.iter().any(|candidate| scalar_eq(&tuple, candidate)));
            match condition.operator {
                FilterOperator::Equal => matched,
                FilterOperator::NotEqual => !matched,
                _ => false,
            }
        }
    }
}

fn matches_operator(cell: &Value, operator: FilterOperator, value: &Value) -> bool {
    match operator {
        FilterOperator::Equal => values_match(cell, value),
        FilterOperator::NotEqual => !values_match(cell, value),
        FilterOperator::Greater => compare(cell, value) == Some(Ordering::Greater),
        FilterOperator::GreaterOrEqual => {
            matches!(compare(cell, value), Some(Ordering::Greater | Ordering::Equal))
        }
        FilterOperator::Less => compare(cell, value) == Some(Ordering::Less),
        FilterOperator::LessOrEqual => {
            matches!(compare(cell, value), Some(Ordering::Less | Ordering::Equal))
        }
        FilterOperator::Like => like(cell, value),
        FilterOperator::Between => between(cell, value),
        FilterOperator::NotBetween => !between(cell, value),
    }
}

/// Equality with membership semantics: a list value matches any of
/// its elements, a multi-valued cell matches on any element.
fn values_match(cell: &Value, value: &Value) -> bool {
    match value {
        Value::Array(candidates) => candidates
            .iter()
            .any(|candidate| values_match(cell, candidate)),
        _ => match cell {
            Value::Array(elements) => elements.iter().any(|element| scalar_eq(element, value)),
            _ => scalar_eq(cell, value),
        },
    }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => match (a, b) {
            (Value::Array(xs), Value::Array(ys)) => {
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| scalar_eq(x, y))
            }
            _ => a == b,
        },
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL LIKE with `%` wildcards, case-insensitive.
fn like(cell: &Value, pattern: &Value) -> bool {
    let (Some(text), Some(pattern)) = (cell.as_str(), pattern.as_str()) else {
        return false;
    };
    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();

    if !pattern.contains('%') {
        return text == pattern;
    }
    let segments: Vec<&str> = pattern.split('%').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return true;
    }
    if !pattern.starts_with('%') && !text.starts_with(segments[0]) {
        return false;
    }
    if !pattern.ends_with('%')
        && !segments.last().is_some_and(|last| text.ends_with(last))
    {
        return false;
    }
    let mut position = 0;
    for segment in segments {
        match text[position..].find(segment) {
            Some(found) => position += found + segment.len(),
            None => return false,
        }
    }
    true
}

fn between(cell: &Value, bounds: &Value) -> bool {
    let Some(bounds) = bounds.as_array() else {
        return false;
    };
    if bounds.len() != 2 {
        return false;
    }
    matches!(
        compare(cell, &bounds[0]),
        Some(Ordering::Greater | Ordering::Equal)
    ) && matches!(
        compare(cell, &bounds[1]),
        Some(Ordering::Less | Ordering::Equal)
    )
}

// ============================================================================
// Search, order, limits
// ============================================================================

/// Case-insensitive substring search over the configured search
/// columns, or every string column.
fn matches_search(row: &Row, query: &SourceQuery) -> bool {
    let Some(term) = &query.search else {
        return true;
    };
    let term = term.to_lowercase();
    let configured: Option<Vec<&str>> = query
        .options
        .get("searchColumns")
        .and_then(Value::as_array)
        .map(|columns| columns.iter().filter_map(Value::as_str).collect());

    row.iter()
        .filter(|(column, _)| {
            configured
                .as_ref()
                .map(|columns| columns.contains(&column.as_str()))
                .unwrap_or(true)
        })
        .filter_map(|(_, value)| value.as_str())
        .any(|value| value.to_lowercase().contains(&term))
}

fn sort_rows(rows: &mut [Row], order: &[trellis_core::datasource::SourceOrder]) {
    if order.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for term in order {
            let left = a.get(&term.column).unwrap_or(&Value::Null);
            let right = b.get(&term.column).unwrap_or(&Value::Null);
            let ordering = compare(left, right).unwrap_or(Ordering::Equal);
            let ordering = match term.direction {
                OrderDirection::Asc | OrderDirection::Random => ordering,
                // Top-flop degrades to a plain descending sort here.
                OrderDirection::Desc | OrderDirection::Topflop => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn apply_limits(rows: Vec<Row>, query: &SourceQuery) -> Vec<Row> {
    if let (Some(limit), Some(group_columns)) = (query.limit, &query.limit_per) {
        // Per-group top-N keyed by the group columns.
        let mut counts: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        return rows
            .into_iter()
            .filter(|row| {
                let key: Vec<String> = group_columns
                    .iter()
                    .map(|column| row.get(column).cloned().unwrap_or(Value::Null).to_string())
                    .collect();
                let count = counts.entry(key.join("-")).or_insert(0);
                *count += 1;
                *count <= limit
            })
            .collect();
    }

    let offset = match (query.page, query.limit) {
        (Some(page), Some(limit)) if page > 0 => ((page - 1) * limit) as usize,
        _ => 0,
    };
    let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    rows.into_iter().skip(offset).take(limit).collect()
}

fn project(row: &mut Row, attributes: &[String]) {
    if attributes.is_empty() {
        return;
    }
    row.retain(|column, _| attributes.iter().any(|attr| attr == column));
}
