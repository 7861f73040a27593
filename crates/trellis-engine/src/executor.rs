//! Data-source tree execution.
//!
//! Walks the DST depth-first: sub-filters run concurrently and gate
//! the node's main query; sub-requests run concurrently after it,
//! keyed by the main rows. The output is a flat list of raw results
//! ordered depth-first, main before subs, siblings in declaration
//! order - the order result assembly depends on.

use futures::future::{try_join_all, BoxFuture, FutureExt};
use indexmap::IndexSet;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trellis_core::cast::{cast, CastContext, CastOptions, LogicalType};
use trellis_core::datasource::{
    DataSourceRegistry, FilterKey, Row, SourceFilter, SourceValue,
};
use trellis_core::error::Result;
use trellis_core::plan::DstNode;
use trellis_core::profiler::Profiler;
use trellis_core::request::AttrPath;

use crate::extension::ExtensionRegistry;

/// One executed (or skipped) query of the DST.
#[derive(Clone, Debug)]
pub struct RawResult {
    pub attr_path: AttrPath,
    pub source: String,
    pub child_key: Option<Vec<String>>,
    pub unique_child_key: bool,
    pub rows: Vec<Row>,
    pub total_count: Option<u64>,
    /// The backend was never called (empty sub-filter or no parent
    /// keys).
    pub skipped: bool,
}

/// Everything a DST walk needs besides the tree itself.
pub struct ExecutionContext<'a> {
    pub registry: &'a DataSourceRegistry,
    pub extensions: &'a ExtensionRegistry,
    /// Root resource name, for extension scoping.
    pub resource: &'a str,
    pub cast: CastContext,
    pub profiler: Profiler,
    pub cancel: CancellationToken,
}

/// Execute the whole tree and return the flat raw-result list.
pub async fn execute(ctx: &ExecutionContext<'_>, dst: DstNode) -> Result<Vec<RawResult>> {
    execute_node(ctx, dst, None).await
}

fn execute_node<'a>(
    ctx: &'a ExecutionContext<'a>,
    mut node: DstNode,
    parent_values: Option<Vec<Value>>,
) -> BoxFuture<'a, Result<Vec<RawResult>>> {
    async move {
        // Sub-filters first, concurrently; the main query waits for
        // all of them.
        let sub_filters = std::mem::take(&mut node.sub_filters);
        let sub_filter_results = try_join_all(
            sub_filters
                .into_iter()
                .map(|sub_filter| execute_node(ctx, sub_filter, None)),
        )
        .await?;
        let collected: Vec<Vec<Value>> = sub_filter_results
            .iter()
            .map(|results| {
                let main = results.first().expect("every node yields its main result");
                key_values(
                    &main.rows,
                    main.child_key.as_deref().unwrap_or_default(),
                    false,
                )
            })
            .collect();

        // Substitute collected keys and parent keys into the filter;
        // a branch whose key set is empty is dead.
        let alive = substitute_filter(&mut node.query.filter, &collected, parent_values.as_deref());
        if !alive {
            debug!(request = %node.request_name(), "skipping empty request");
            return Ok(empty_subtree(&node));
        }

        // Filter values travel in storage representation.
        if let Some(filter) = &mut node.query.filter {
            cast_filter_values(filter, &node.cast_options, &ctx.cast);
        }

        ctx.extensions.fire_pre_execute(ctx.resource, &mut node)?;

        // The main query.
        let driver = ctx.registry.get(&node.query.kind)?;
        let span = ctx.profiler.child(node.request_name());
        let processed = driver.process(&node.query, &ctx.cancel).await;
        span.end();
        let mut result = processed.map_err(|err| {
            err.at_attribute(&frame_name(&node.attr_path))
                .at_data_source(&node.source)
        })?;

        cast_rows(&mut result.rows, &node.cast_options, &ctx.cast);

        ctx.extensions.fire_post_execute(
            ctx.resource,
            &node.attr_path,
            &node.source,
            &mut result,
        )?;

        // Fan out sub-requests, keyed by the main rows.
        let sub_requests = std::mem::take(&mut node.sub_requests);
        let mut pending = Vec::new();
        let mut placements: Vec<SubPlacement> = Vec::new();
        for sub_request in sub_requests {
            let values = key_values(
                &result.rows,
                sub_request.parent_key.as_deref().unwrap_or_default(),
                sub_request.multi_valued_parent_key,
            );
            if values.is_empty() {
                placements.push(SubPlacement::Skipped(empty_subtree(&sub_request)));
            } else {
                placements.push(SubPlacement::Pending(pending.len()));
                pending.push(execute_node(ctx, sub_request, Some(values)));
            }
        }
        let mut executed = try_join_all(pending).await?;

        let mut output = vec![RawResult {
            attr_path: node.attr_path,
            source: node.source,
            child_key: node.child_key,
            unique_child_key: node.unique_child_key,
            rows: result.rows,
            total_count: result.total_count,
            skipped: false,
        }];
        for placement in placements {
            match placement {
                SubPlacement::Skipped(results) => output.extend(results),
                SubPlacement::Pending(index) => {
                    output.extend(std::mem::take(&mut executed[index]))
                }
            }
        }
        Ok(output)
    }
    .boxed()
}

enum SubPlacement {
    Skipped(Vec<RawResult>),
    Pending(usize),
}

/// Raw results for a node and its subtree without touching a backend.
fn empty_subtree(node: &DstNode) -> Vec<RawResult> {
    let mut output = vec![RawResult {
        attr_path: node.attr_path.clone(),
        source: node.source.clone(),
        child_key: node.child_key.clone(),
        unique_child_key: node.unique_child_key,
        rows: Vec::new(),
        total_count: Some(0),
        skipped: true,
    }];
    for sub_request in &node.sub_requests {
        output.extend(empty_subtree(sub_request));
    }
    output
}

// ============================================================================
// Substitution
// ============================================================================

/// Install sub-filter key sets and parent-key values. Returns false
/// when every OR branch died, meaning the query must be skipped.
fn substitute_filter(
    filter: &mut Option<SourceFilter>,
    collected: &[Vec<Value>],
    parent_values: Option<&[Value]>,
) -> bool {
    let Some(tree) = filter else {
        return true;
    };
    if tree.0.is_empty() {
        return true;
    }

    let mut branches = Vec::with_capacity(tree.0.len());
    'branch: for branch in tree.0.drain(..) {
        let mut substituted = Vec::with_capacity(branch.len());
        for mut condition in branch {
            match &condition.value {
                SourceValue::FromSubFilter(index) => {
                    let values = collected.get(*index).map(Vec::as_slice).unwrap_or(&[]);
                    if values.is_empty() {
                        // A dead AND-clause drops its whole branch.
                        continue 'branch;
                    }
                    condition.value = SourceValue::Plain(Value::Array(values.to_vec()));
                }
                SourceValue::FromParentKey => {
                    let values = parent_values.unwrap_or(&[]);
                    if values.is_empty() {
                        continue 'branch;
                    }
                    condition.value = SourceValue::Plain(Value::Array(values.to_vec()));
                }
                SourceValue::Plain(_) => {}
            }
            substituted.push(condition);
        }
        branches.push(substituted);
    }

    let alive = !branches.is_empty();
    tree.0 = branches;
    alive
}

/// Distinct key values projected from rows: scalars for single
/// columns (flattened when multi-valued), tuples for composite keys.
/// Null keys never fan out.
fn key_values(rows: &[Row], columns: &[String], multi_valued: bool) -> Vec<Value> {
    let mut seen: IndexSet<String> = IndexSet::new();
    let mut values = Vec::new();
    let mut push = |value: Value, seen: &mut IndexSet<String>, values: &mut Vec<Value>| {
        if value.is_null() {
            return;
        }
        if seen.insert(value.to_string()) {
            values.push(value);
        }
    };

    for row in rows {
        if columns.len() == 1 {
            let cell = row.get(&columns[0]).cloned().unwrap_or(Value::Null);
            match cell {
                Value::Array(elements) if multi_valued => {
                    for element in elements {
                        push(element, &mut seen, &mut values);
                    }
                }
                other => push(other, &mut seen, &mut values),
            }
        } else {
            let tuple: Vec<Value> = columns
                .iter()
                .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
                .collect();
            if tuple.iter().all(|value| !value.is_null()) {
                push(Value::Array(tuple), &mut seen, &mut values);
            }
        }
    }
    values
}

// ============================================================================
// Casting
// ============================================================================

fn cast_rows(
    rows: &mut [Row],
    cast_options: &std::collections::HashMap<String, CastOptions>,
    ctx: &CastContext,
) {
    for row in rows {
        for (column, options) in cast_options {
            if let Some(value) = row.get_mut(column) {
                let taken = value.take();
                *value = cast(taken, options, ctx);
            }
        }
    }
}

/// Cast filter values toward the storage representation: the target
/// type is the column's stored type, emitted in the stored zone.
fn cast_filter_values(
    filter: &mut SourceFilter,
    cast_options: &std::collections::HashMap<String, CastOptions>,
    ctx: &CastContext,
) {
    for condition in filter.conditions_mut() {
        let SourceValue::Plain(value) = &mut condition.value else {
            continue;
        };
        match &condition.attribute {
            FilterKey::Column(column) => {
                if let Some(options) = cast_options.get(column) {
                    let taken = value.take();
                    *value = cast_toward_storage(taken, options, ctx);
                }
            }
            FilterKey::Composite(columns) => {
                // The value is a list of tuples; cast per column.
                if let Value::Array(tuples) = value {
                    for tuple in tuples {
                        let Value::Array(parts) = tuple else { continue };
                        for (part, column) in parts.iter_mut().zip(columns) {
                            if let Some(options) = cast_options.get(column) {
                                let taken = part.take();
                                *part = cast_toward_storage_scalar(taken, options, ctx);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn cast_toward_storage(value: Value, options: &CastOptions, ctx: &CastContext) -> Value {
    match value {
        // Membership lists and between-bounds cast element-wise.
        Value::Array(elements) => Value::Array(
            elements
                .into_iter()
                .map(|element| cast_toward_storage_scalar(element, options, ctx))
                .collect(),
        ),
        scalar => cast_toward_storage_scalar(scalar, options, ctx),
    }
}

fn cast_toward_storage_scalar(value: Value, options: &CastOptions, ctx: &CastContext) -> Value {
    let target = options
        .stored_type
        .as_ref()
        .and_then(|stored| stored.name.parse::<LogicalType>().ok())
        .unwrap_or(options.logical_type);
    let emit_zone = options
        .stored_type
        .as_ref()
        .and_then(|stored| stored.timezone())
        .and_then(|name| name.parse().ok())
        .unwrap_or(ctx.stored_timezone);
    cast(
        value,
        &CastOptions::new(target),
        &CastContext {
            timezone: emit_zone,
            stored_timezone: ctx.timezone,
        },
    )
}

fn frame_name(attr_path: &[String]) -> String {
    if attr_path.is_empty() {
        "root".to_string()
    } else {
        attr_path.join(".")
    }
}
