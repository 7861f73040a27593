//! Result assembly.
//!
//! Joins the flat raw-result list into the response shape, guided by
//! the resolved resource tree: rows are indexed by their child keys,
//! items are built recursively, and relations are stitched through
//! parent-key values (via the join row for m:n).

use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

use trellis_core::datasource::Row;
use trellis_core::error::{Error, Result};
use trellis_core::plan::{ResolvedChild, ResolvedResource, ResolvedSubResource};
use trellis_core::request::AttrPath;

use crate::executor::RawResult;
use crate::extension::ExtensionRegistry;

/// The assembled root payload.
#[derive(Debug)]
pub struct BuiltResult {
    pub data: Value,
    /// Total row count of the root query, for the cursor.
    pub total_count: Option<u64>,
}

/// Assemble the response data from raw results.
pub fn build(
    resource: &str,
    root: &ResolvedResource,
    many: bool,
    results: &[RawResult],
    extensions: &ExtensionRegistry,
) -> Result<BuiltResult> {
    let assembler = Assembler::new(resource, results, extensions)?;
    let main = assembler.require_result(&root.attr_path, &root.primary_source)?;

    if many {
        let mut items = Vec::with_capacity(main.rows.len());
        for row in &main.rows {
            items.push(Value::Object(assembler.build_item(
                root,
                row,
                &HashMap::new(),
            )?));
        }
        Ok(BuiltResult {
            data: Value::Array(items),
            total_count: main.total_count,
        })
    } else {
        let row = main.rows.first().ok_or_else(|| {
            Error::NotFound(format!("no matching \"{resource}\" item"))
        })?;
        if main.rows.len() > 1 {
            warn!(
                resource = %resource,
                rows = main.rows.len(),
                "single-valued request matched more than one row"
            );
        }
        Ok(BuiltResult {
            data: Value::Object(assembler.build_item(root, row, &HashMap::new())?),
            total_count: None,
        })
    }
}

/// Rows of one raw result, indexed by their child-key string.
enum RowIndex {
    Unique(HashMap<String, usize>),
    Multi(HashMap<String, Vec<usize>>),
}

struct Assembler<'a> {
    resource: &'a str,
    results: &'a [RawResult],
    /// (attribute path, source) to result position; declaration
    /// order wins for duplicates.
    by_name: HashMap<(String, String), usize>,
    indexes: Vec<Option<RowIndex>>,
    extensions: &'a ExtensionRegistry,
    dispatch_items: bool,
}

impl<'a> Assembler<'a> {
    fn new(
        resource: &'a str,
        results: &'a [RawResult],
        extensions: &'a ExtensionRegistry,
    ) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut indexes = Vec::with_capacity(results.len());
        for (position, result) in results.iter().enumerate() {
            by_name
                .entry((result.attr_path.join("."), result.source.clone()))
                .or_insert(position);
            indexes.push(match &result.child_key {
                Some(columns) => Some(index_rows(result, columns)?),
                None => None,
            });
        }
        Ok(Self {
            resource,
            results,
            by_name,
            indexes,
            dispatch_items: extensions.has_handlers(resource),
            extensions,
        })
    }

    fn require_result(&self, attr_path: &AttrPath, source: &str) -> Result<&'a RawResult> {
        let position = self
            .by_name
            .get(&(attr_path.join("."), source.to_string()))
            .ok_or_else(|| {
                Error::Implementation(format!(
                    "missing result for \"{}\"",
                    request_name(attr_path, source)
                ))
            })?;
        Ok(&self.results[*position])
    }

    fn position(&self, attr_path: &AttrPath, source: &str) -> Result<usize> {
        self.by_name
            .get(&(attr_path.join("."), source.to_string()))
            .copied()
            .ok_or_else(|| {
                Error::Implementation(format!(
                    "missing result for \"{}\"",
                    request_name(attr_path, source)
                ))
            })
    }

    // ========================================================================
    // Item assembly
    // ========================================================================

    fn build_item(
        &self,
        frame: &ResolvedResource,
        row: &Row,
        carried_rows: &HashMap<String, Row>,
    ) -> Result<Map<String, Value>> {
        // The item's identity: primary-key values from the main row.
        let primary_key = row_key(row, &frame.primary_key_columns).map_err(|err| {
            err.at_attribute(&frame_name(&frame.attr_path))
                .at_data_source(&frame.primary_source)
        })?;

        // Rows of secondary sources, joined over the primary key.
        let mut secondary_rows: HashMap<String, Option<Row>> = HashMap::new();
        for source in &frame.secondary_sources {
            let position = self.position(&frame.attr_path, source)?;
            let row = self.unique_row(position, &primary_key)?;
            if row.is_none() {
                warn!(
                    request = %request_name(&frame.attr_path, source),
                    key = %primary_key,
                    "missing secondary row"
                );
            }
            secondary_rows.insert(source.clone(), row.cloned());
        }
        for (source, carried) in carried_rows {
            secondary_rows.insert(source.clone(), Some(carried.clone()));
        }

        let mut item = Map::new();
        self.build_children(frame, &frame.children, row, &secondary_rows, &mut item)?;

        if self.dispatch_items {
            self.extensions.fire_item(
                self.resource,
                &frame.attr_path,
                &mut item,
                row,
                &secondary_rows,
            )?;
        }
        Ok(item)
    }

    fn build_children(
        &self,
        frame: &ResolvedResource,
        children: &[ResolvedChild],
        row: &Row,
        secondary_rows: &HashMap<String, Option<Row>>,
        item: &mut Map<String, Value>,
    ) -> Result<()> {
        for child in children {
            if child.is_internal() {
                continue;
            }
            match child {
                ResolvedChild::Leaf(leaf) => {
                    let value = match (&leaf.value, &leaf.source) {
                        (Some(value), _) => value.clone(),
                        (None, Some(source)) => {
                            let column =
                                leaf.column.as_deref().expect("mapped leaves carry a column");
                            if source == &frame.primary_source {
                                row.get(column).cloned().unwrap_or(Value::Null)
                            } else {
                                secondary_rows
                                    .get(source)
                                    .and_then(|maybe| maybe.as_ref())
                                    .and_then(|secondary| secondary.get(column))
                                    .cloned()
                                    .unwrap_or(Value::Null)
                            }
                        }
                        (None, None) => Value::Null,
                    };
                    item.insert(leaf.name.clone(), value);
                }
                ResolvedChild::Nested { name, children, .. } => {
                    let mut nested = Map::new();
                    self.build_children(frame, children, row, secondary_rows, &mut nested)?;
                    item.insert(name.clone(), Value::Object(nested));
                }
                ResolvedChild::Sub(sub) => {
                    let value = self.build_relation(frame, sub, row, secondary_rows)?;
                    item.insert(sub.name.clone(), value);
                }
            }
        }
        Ok(())
    }

    fn build_relation(
        &self,
        frame: &ResolvedResource,
        sub: &ResolvedSubResource,
        row: &Row,
        secondary_rows: &HashMap<String, Option<Row>>,
    ) -> Result<Value> {
        // The parent side of the key may live in a secondary row.
        let key_row: Option<&Row> = if sub.parent_key_source == frame.primary_source {
            Some(row)
        } else {
            secondary_rows
                .get(&sub.parent_key_source)
                .and_then(|maybe| maybe.as_ref())
        };
        let key_parts: Vec<Value> = match key_row {
            Some(source_row) => sub
                .parent_key_columns
                .iter()
                .map(|column| source_row.get(column).cloned().unwrap_or(Value::Null))
                .collect(),
            None => vec![Value::Null],
        };

        // An all-null key means "no relation", not an error.
        if key_parts.iter().all(Value::is_null) {
            return Ok(if sub.many {
                Value::Array(Vec::new())
            } else {
                Value::Null
            });
        }

        let keys: Vec<String> = if sub.multi_valued_parent_key {
            match &key_parts[0] {
                Value::Array(elements) => elements.iter().map(value_key_part).collect(),
                single => vec![value_key_part(single)],
            }
        } else {
            vec![key_parts.iter().map(value_key_part).collect::<Vec<_>>().join("-")]
        };

        let items = match &sub.join {
            Some(join) => self.resolve_through_join(sub, join, &keys)?,
            None => self.resolve_direct(sub, &keys)?,
        };

        Ok(if sub.many {
            Value::Array(items)
        } else {
            items.into_iter().next().unwrap_or(Value::Null)
        })
    }

    fn resolve_direct(&self, sub: &ResolvedSubResource, keys: &[String]) -> Result<Vec<Value>> {
        let position = self.position(&sub.resource.attr_path, &sub.resource.primary_source)?;
        let mut items = Vec::new();
        for key in keys {
            for child_row in self.rows_for_key(position, key)? {
                items.push(Value::Object(self.build_item(
                    &sub.resource,
                    child_row,
                    &HashMap::new(),
                )?));
            }
        }
        Ok(items)
    }

    /// m:n: walk the join rows in sequence, carry each join row into
    /// the child item so join-mapped attributes resolve.
    fn resolve_through_join(
        &self,
        sub: &ResolvedSubResource,
        join: &trellis_core::plan::ResolvedJoin,
        keys: &[String],
    ) -> Result<Vec<Value>> {
        let join_position = self.position(&sub.resource.attr_path, &join.source)?;
        let child_position =
            self.position(&sub.resource.attr_path, &sub.resource.primary_source)?;

        let mut items = Vec::new();
        for key in keys {
            for join_row in self.rows_for_key(join_position, key)? {
                let child_key = row_key(join_row, &join.child_columns).map_err(|err| {
                    err.at_attribute(&frame_name(&sub.resource.attr_path))
                        .at_data_source(&join.source)
                })?;
                let mut carried = HashMap::new();
                carried.insert(join.source.clone(), join_row.clone());
                for child_row in self.rows_for_key(child_position, &child_key)? {
                    items.push(Value::Object(self.build_item(
                        &sub.resource,
                        child_row,
                        &carried,
                    )?));
                }
            }
        }
        Ok(items)
    }

    // ========================================================================
    // Row lookup
    // ========================================================================

    fn unique_row(&self, position: usize, key: &str) -> Result<Option<&'a Row>> {
        match &self.indexes[position] {
            Some(RowIndex::Unique(map)) => {
                Ok(map.get(key).map(|&row| &self.results[position].rows[row]))
            }
            Some(RowIndex::Multi(map)) => Ok(map
                .get(key)
                .and_then(|rows| rows.first())
                .map(|&row| &self.results[position].rows[row])),
            None => Err(Error::Implementation(format!(
                "result \"{}\" carries no child key",
                self.results[position].attr_path.join(".")
            ))),
        }
    }

    fn rows_for_key(&self, position: usize, key: &str) -> Result<Vec<&'a Row>> {
        let result = &self.results[position];
        match &self.indexes[position] {
            Some(RowIndex::Unique(map)) => {
                Ok(map.get(key).map(|&row| &result.rows[row]).into_iter().collect())
            }
            Some(RowIndex::Multi(map)) => Ok(map
                .get(key)
                .map(|rows| rows.iter().map(|&row| &result.rows[row]).collect())
                .unwrap_or_default()),
            None => Err(Error::Implementation(format!(
                "result \"{}\" carries no child key",
                result.attr_path.join(".")
            ))),
        }
    }
}

// ============================================================================
// Indexing
// ============================================================================

fn index_rows(result: &RawResult, columns: &[String]) -> Result<RowIndex> {
    if result.unique_child_key {
        let mut map = HashMap::with_capacity(result.rows.len());
        for (position, row) in result.rows.iter().enumerate() {
            let key = row_key(row, columns).map_err(|err| {
                err.at_attribute(&frame_name(&result.attr_path))
                    .at_data_source(&result.source)
            })?;
            if map.insert(key.clone(), position).is_some() {
                return Err(Error::Data(format!(
                    "duplicate unique child key \"{key}\" in \"{}\"",
                    request_name(&result.attr_path, &result.source)
                )));
            }
        }
        Ok(RowIndex::Unique(map))
    } else {
        let mut map: HashMap<String, Vec<usize>> = HashMap::new();
        for (position, row) in result.rows.iter().enumerate() {
            // Multi-valued child keys index the row once per element.
            if columns.len() == 1 {
                match row.get(&columns[0]) {
                    Some(Value::Array(elements)) => {
                        for element in elements {
                            map.entry(value_key_part(element)).or_default().push(position);
                        }
                        continue;
                    }
                    Some(_) => {}
                    None => {
                        return Err(Error::Data(format!(
                            "missing child key column \"{}\" in \"{}\"",
                            columns[0],
                            request_name(&result.attr_path, &result.source)
                        )))
                    }
                }
            }
            let key = row_key(row, columns).map_err(|err| {
                err.at_attribute(&frame_name(&result.attr_path))
                    .at_data_source(&result.source)
            })?;
            map.entry(key).or_default().push(position);
        }
        Ok(RowIndex::Multi(map))
    }
}

/// Composite-key string: parts joined by '-'.
fn row_key(row: &Row, columns: &[String]) -> Result<String> {
    let mut parts = Vec::with_capacity(columns.len());
    for column in columns {
        let value = row.get(column).ok_or_else(|| {
            Error::Data(format!("missing key column \"{column}\""))
        })?;
        parts.push(value_key_part(value));
    }
    Ok(parts.join("-"))
}

fn value_key_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn frame_name(attr_path: &[String]) -> String {
    if attr_path.is_empty() {
        "root".to_string()
    } else {
        attr_path.join(".")
    }
}

fn request_name(attr_path: &[String], source: &str) -> String {
    format!("{}:{source}", frame_name(attr_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use trellis_core::cast::{CastOptions, LogicalType};
    use trellis_core::plan::ResolvedLeaf;

    fn raw(
        attr_path: &[&str],
        source: &str,
        child_key: Option<Vec<&str>>,
        unique: bool,
        rows: Value,
    ) -> RawResult {
        let rows: Vec<Row> = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect();
        let total = rows.len() as u64;
        RawResult {
            attr_path: attr_path.iter().map(|s| s.to_string()).collect(),
            source: source.to_string(),
            child_key: child_key.map(|cols| cols.iter().map(|s| s.to_string()).collect()),
            unique_child_key: unique,
            rows,
            total_count: Some(total),
            skipped: false,
        }
    }

    fn leaf(name: &str, column: &str) -> ResolvedChild {
        ResolvedChild::Leaf(ResolvedLeaf {
            name: name.to_string(),
            internal: false,
            value: None,
            source: Some("primary".to_string()),
            column: Some(column.to_string()),
            cast: CastOptions::new(LogicalType::String),
        })
    }

    fn article_frame() -> ResolvedResource {
        ResolvedResource {
            attr_path: vec![],
            primary_source: "primary".into(),
            primary_key_columns: vec!["id".into()],
            secondary_sources: vec![],
            children: vec![
                leaf("id", "id"),
                ResolvedChild::Sub(ResolvedSubResource {
                    name: "comments".into(),
                    internal: false,
                    many: true,
                    parent_key_columns: vec!["id".into()],
                    parent_key_source: "primary".into(),
                    multi_valued_parent_key: false,
                    unique_child_key: false,
                    join: None,
                    resource: ResolvedResource {
                        attr_path: vec!["comments".into()],
                        primary_source: "primary".into(),
                        primary_key_columns: vec!["id".into()],
                        secondary_sources: vec![],
                        children: vec![leaf("content", "content")],
                    },
                }),
            ],
        }
    }

    #[test]
    fn test_one_to_many_assembly() {
        let frame = article_frame();
        let results = vec![
            raw(&[], "primary", None, false, json!([
                {"id": 1}, {"id": 2}, {"id": 3},
            ])),
            raw(&["comments"], "primary", Some(vec!["articleId"]), false, json!([
                {"id": 10, "articleId": 1, "content": "c1"},
                {"id": 11, "articleId": 1, "content": "c2"},
                {"id": 12, "articleId": 2, "content": "c3"},
            ])),
        ];

        let built = build(
            "article",
            &frame,
            true,
            &results,
            &ExtensionRegistry::new(),
        )
        .unwrap();

        assert_eq!(built.total_count, Some(3));
        assert_eq!(
            built.data,
            json!([
                {"id": 1, "comments": [{"content": "c1"}, {"content": "c2"}]},
                {"id": 2, "comments": [{"content": "c3"}]},
                {"id": 3, "comments": []},
            ])
        );
    }

    #[test]
    fn test_single_item_not_found() {
        let frame = ResolvedResource {
            attr_path: vec![],
            primary_source: "primary".into(),
            primary_key_columns: vec!["id".into()],
            secondary_sources: vec![],
            children: vec![leaf("id", "id")],
        };
        let results = vec![raw(&[], "primary", None, false, json!([]))];

        let err = build("article", &frame, false, &results, &ExtensionRegistry::new())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_duplicate_unique_child_key_is_a_data_error() {
        let frame = ResolvedResource {
            attr_path: vec![],
            primary_source: "primary".into(),
            primary_key_columns: vec!["id".into()],
            secondary_sources: vec![],
            children: vec![
                leaf("id", "id"),
                ResolvedChild::Sub(ResolvedSubResource {
                    name: "author".into(),
                    internal: false,
                    many: false,
                    parent_key_columns: vec!["authorId".into()],
                    parent_key_source: "primary".into(),
                    multi_valued_parent_key: false,
                    unique_child_key: true,
                    join: None,
                    resource: ResolvedResource {
                        attr_path: vec!["author".into()],
                        primary_source: "primary".into(),
                        primary_key_columns: vec!["id".into()],
                        secondary_sources: vec![],
                        children: vec![leaf("name", "name")],
                    },
                }),
            ],
        };
        let results = vec![
            raw(&[], "primary", None, false, json!([{"id": 1, "authorId": 7}])),
            raw(&["author"], "primary", Some(vec!["id"]), true, json!([
                {"id": 7, "name": "a"},
                {"id": 7, "name": "b"},
            ])),
        ];

        let err = build("article", &frame, true, &results, &ExtensionRegistry::new())
            .unwrap_err();
        assert!(matches!(err, Error::Data(_)));
        assert!(err.to_string().contains("duplicate unique child key"));
    }

    #[test]
    fn test_missing_primary_key_column_is_a_data_error() {
        let frame = ResolvedResource {
            attr_path: vec![],
            primary_source: "primary".into(),
            primary_key_columns: vec!["id".into()],
            secondary_sources: vec![],
            children: vec![leaf("id", "id")],
        };
        let results = vec![raw(&[], "primary", None, false, json!([{"name": "x"}]))];

        let err = build("article", &frame, true, &results, &ExtensionRegistry::new())
            .unwrap_err();
        assert!(matches!(err, Error::Data(_)));
    }

    #[test]
    fn test_null_parent_key_yields_empty_relation() {
        let frame = ResolvedResource {
            attr_path: vec![],
            primary_source: "primary".into(),
            primary_key_columns: vec!["id".into()],
            secondary_sources: vec![],
            children: vec![
                leaf("id", "id"),
                ResolvedChild::Sub(ResolvedSubResource {
                    name: "author".into(),
                    internal: false,
                    many: false,
                    parent_key_columns: vec!["authorId".into()],
                    parent_key_source: "primary".into(),
                    multi_valued_parent_key: false,
                    unique_child_key: true,
                    join: None,
                    resource: ResolvedResource {
                        attr_path: vec!["author".into()],
                        primary_source: "primary".into(),
                        primary_key_columns: vec!["id".into()],
                        secondary_sources: vec![],
                        children: vec![leaf("name", "name")],
                    },
                }),
            ],
        };
        let results = vec![
            raw(&[], "primary", None, false, json!([{"id": 1, "authorId": null}])),
            raw(&["author"], "primary", Some(vec!["id"]), true, json!([])),
        ];

        let built = build("article", &frame, true, &results, &ExtensionRegistry::new())
            .unwrap();
        assert_eq!(built.data, json!([{"id": 1, "author": null}]));
    }

    #[test]
    fn test_join_traversal_carries_join_row() {
        use trellis_core::plan::ResolvedJoin;

        let frame = ResolvedResource {
            attr_path: vec![],
            primary_source: "primary".into(),
            primary_key_columns: vec!["id".into()],
            secondary_sources: vec![],
            children: vec![
                leaf("id", "id"),
                ResolvedChild::Sub(ResolvedSubResource {
                    name: "categories".into(),
                    internal: false,
                    many: true,
                    parent_key_columns: vec!["id".into()],
                    parent_key_source: "primary".into(),
                    multi_valued_parent_key: false,
                    unique_child_key: true,
                    join: Some(ResolvedJoin {
                        source: "articleCategories".into(),
                        parent_columns: vec!["articleId".into()],
                        child_columns: vec!["categoryId".into()],
                    }),
                    resource: ResolvedResource {
                        attr_path: vec!["categories".into()],
                        primary_source: "primary".into(),
                        primary_key_columns: vec!["id".into()],
                        secondary_sources: vec![],
                        children: vec![
                            leaf("name", "name"),
                            ResolvedChild::Leaf(ResolvedLeaf {
                                name: "order".into(),
                                internal: false,
                                value: None,
                                source: Some("articleCategories".into()),
                                column: Some("sortOrder".into()),
                                cast: CastOptions::new(LogicalType::Int),
                            }),
                        ],
                    },
                }),
            ],
        };
        let results = vec![
            raw(&[], "primary", None, false, json!([{"id": 1}])),
            raw(
                &["categories"],
                "articleCategories",
                Some(vec!["articleId"]),
                false,
                json!([
                    {"articleId": 1, "categoryId": 20, "sortOrder": 2},
                    {"articleId": 1, "categoryId": 10, "sortOrder": 1},
                ]),
            ),
            raw(&["categories"], "primary", Some(vec!["id"]), true, json!([
                {"id": 10, "name": "rust"},
                {"id": 20, "name": "engines"},
            ])),
        ];

        let built = build("article", &frame, true, &results, &ExtensionRegistry::new())
            .unwrap();
        // Join-row sequence is preserved and the join row's own
        // column is exposed on each child.
        assert_eq!(
            built.data,
            json!([{
                "id": 1,
                "categories": [
                    {"name": "engines", "order": 2},
                    {"name": "rust", "order": 1},
                ],
            }])
        );
    }
}
