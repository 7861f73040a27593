//! Config parsing, pass 1: option recognition and local validation.
//!
//! Every node is parsed against the option schema of its context
//! (root resource, sub-resource, nested attribute, leaf attribute).
//! Unknown options and malformed values fail with an error naming the
//! resource and attribute path. Relations are resolved afterwards by
//! [`super::relations`].

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

use super::relations;
use super::{
    AttributeNode, DataSourceDescriptor, LeafAttribute, NestedAttribute, ResourceConfig,
    SubFilterSpec, SubResourceAttribute,
};
use crate::cast::{CastOptions, LogicalType, StoredType};
use crate::datasource::DataSourceRegistry;
use crate::error::{Error, Result};
use crate::request::{
    parse_attr_path, AttrPath, FilterOperator, OrderDirection, OrderSpec, Select,
};

/// The conventional name of the iteration data source.
pub const PRIMARY_SOURCE: &str = "primary";

const ROOT_OPTIONS: &[&str] = &[
    "primaryKey",
    "dataSources",
    "primaryName",
    "attributes",
    "subFilters",
    "defaultLimit",
    "maxLimit",
    "defaultOrder",
    "permission",
];

const SUB_RESOURCE_OPTIONS: &[&str] = &[
    "resource",
    "parentKey",
    "childKey",
    "many",
    "joinVia",
    "hidden",
    "deprecated",
    "primaryKey",
    "dataSources",
    "primaryName",
    "attributes",
    "subFilters",
    "defaultLimit",
    "maxLimit",
    "defaultOrder",
    "permission",
];

const NESTED_OPTIONS: &[&str] = &["attributes", "hidden"];

const LEAF_OPTIONS: &[&str] = &[
    "type",
    "storedType",
    "multiValued",
    "delimiter",
    "map",
    "filter",
    "order",
    "value",
    "hidden",
    "deprecated",
    "depends",
];

/// Parse and resolve a full set of raw resource configs.
///
/// Runs both passes and invokes every driver's `prepare`.
pub fn parse_resources(
    raw: &Map<String, Value>,
    registry: &DataSourceRegistry,
) -> Result<IndexMap<String, ResourceConfig>> {
    let mut configs = IndexMap::new();
    for (name, value) in raw {
        debug!(resource = %name, "parsing resource config");
        configs.insert(name.clone(), parse_resource(name, value)?);
    }
    relations::resolve(&mut configs, registry)?;
    Ok(configs)
}

/// Pass 1 for a single resource.
pub fn parse_resource(name: &str, raw: &Value) -> Result<ResourceConfig> {
    let ctx = Ctx::new(name);
    let obj = expect_object(&ctx, raw)?;
    check_options(&ctx, obj, ROOT_OPTIONS)?;
    parse_resource_body(&ctx, obj, name)
}

// ============================================================================
// Error context
// ============================================================================

#[derive(Clone)]
struct Ctx {
    resource: String,
    path: Vec<String>,
}

impl Ctx {
    fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            path: Vec::new(),
        }
    }

    fn descend(&self, segment: &str) -> Self {
        let mut path = self.path.clone();
        path.push(segment.to_string());
        Self {
            resource: self.resource.clone(),
            path,
        }
    }

    fn error(&self, message: impl std::fmt::Display) -> Error {
        let location = if self.path.is_empty() {
            format!("resource \"{}\"", self.resource)
        } else {
            format!(
                "resource \"{}\", attribute \"{}\"",
                self.resource,
                self.path.join(".")
            )
        };
        Error::Implementation(format!("{location}: {message}"))
    }
}

fn check_options(ctx: &Ctx, obj: &Map<String, Value>, allowed: &[&str]) -> Result<()> {
    for key in obj.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(ctx.error(format_args!("unknown option \"{key}\"")));
        }
    }
    Ok(())
}

// ============================================================================
// Resource body (shared by root and sub-resource contexts)
// ============================================================================

fn parse_resource_body(ctx: &Ctx, obj: &Map<String, Value>, name: &str) -> Result<ResourceConfig> {
    let mut config = ResourceConfig {
        name: name.to_string(),
        ..Default::default()
    };

    if let Some(value) = obj.get("primaryKey") {
        config.primary_key = parse_key_list(ctx, value, "primaryKey")?;
    }
    if let Some(value) = obj.get("dataSources") {
        config.data_sources = parse_data_sources(ctx, value)?;
    }
    if let Some(value) = obj.get("primaryName") {
        config.primary_name = Some(expect_str(ctx, value, "primaryName")?.to_string());
    }
    if let Some(value) = obj.get("subFilters") {
        config.sub_filters = parse_sub_filters(ctx, value)?;
    }
    if let Some(value) = obj.get("defaultLimit") {
        config.default_limit = Some(expect_u64(ctx, value, "defaultLimit")?);
    }
    if let Some(value) = obj.get("maxLimit") {
        config.max_limit = Some(expect_u64(ctx, value, "maxLimit")?);
    }
    if let Some(value) = obj.get("defaultOrder") {
        config.default_order = parse_order_specs(ctx, value)?;
    }
    if let Some(value) = obj.get("permission") {
        config.permission = Some(expect_str(ctx, value, "permission")?.to_string());
    }
    if let Some(value) = obj.get("attributes") {
        let attributes = expect_object(ctx, value)?;
        for (attr_name, attr_value) in attributes {
            let child_ctx = ctx.descend(attr_name);
            config
                .attributes
                .insert(attr_name.clone(), parse_attribute(&child_ctx, attr_value)?);
        }
    }

    Ok(config)
}

fn parse_attribute(ctx: &Ctx, raw: &Value) -> Result<AttributeNode> {
    let obj = expect_object(ctx, raw)?;

    let is_sub_resource = [
        "resource",
        "dataSources",
        "parentKey",
        "childKey",
        "many",
        "joinVia",
        "primaryKey",
    ]
    .iter()
    .any(|key| obj.contains_key(*key));

    if is_sub_resource {
        parse_sub_resource(ctx, obj).map(|sub| AttributeNode::SubResource(Box::new(sub)))
    } else if obj.contains_key("attributes") {
        parse_nested(ctx, obj).map(AttributeNode::Nested)
    } else {
        parse_leaf(ctx, obj).map(AttributeNode::Leaf)
    }
}

// ============================================================================
// Leaf attributes
// ============================================================================

fn parse_leaf(ctx: &Ctx, obj: &Map<String, Value>) -> Result<LeafAttribute> {
    check_options(ctx, obj, LEAF_OPTIONS)?;

    let logical_type = match obj.get("type") {
        Some(value) => {
            let name = expect_str(ctx, value, "type")?;
            name.parse::<LogicalType>()
                .map_err(|_| ctx.error(format_args!("invalid type \"{name}\"")))?
        }
        None => LogicalType::String,
    };

    let stored_type = match obj.get("storedType") {
        Some(value) => {
            let syntax = expect_str(ctx, value, "storedType")?;
            Some(
                StoredType::parse(syntax)
                    .map_err(|_| ctx.error(format_args!("invalid storedType \"{syntax}\"")))?,
            )
        }
        None => None,
    };

    let mut leaf = LeafAttribute {
        cast: CastOptions {
            logical_type,
            stored_type,
            multi_valued: opt_bool(ctx, obj, "multiValued")?,
            delimiter: obj
                .get("delimiter")
                .map(|v| expect_str(ctx, v, "delimiter").map(str::to_string))
                .transpose()?,
        },
        mapping: IndexMap::new(),
        filter: obj
            .get("filter")
            .map(|v| parse_filter_operators(ctx, v))
            .transpose()?,
        order: obj
            .get("order")
            .map(|v| parse_order_directions(ctx, v))
            .transpose()?,
        value: obj.get("value").cloned(),
        hidden: opt_bool(ctx, obj, "hidden")?,
        deprecated: opt_bool(ctx, obj, "deprecated")?,
        depends: obj
            .get("depends")
            .map(|v| {
                serde_json::from_value::<Select>(v.clone())
                    .map_err(|err| ctx.error(format_args!("invalid depends: {err}")))
            })
            .transpose()?,
    };

    if let Some(value) = obj.get("map") {
        leaf.mapping = parse_mapping(ctx, value)?;
    } else if leaf.value.is_none() {
        // Unmapped, non-static leaves default to their dotted sub-path
        // on the primary data source.
        leaf.mapping
            .insert(PRIMARY_SOURCE.to_string(), ctx.path.join("."));
    }

    Ok(leaf)
}

/// Mapping forms: `"column"`, `"ds:col;ds2:col2"`, or
/// `{"primary": "column", ...}`.
fn parse_mapping(ctx: &Ctx, raw: &Value) -> Result<IndexMap<String, String>> {
    let mut mapping = IndexMap::new();
    match raw {
        Value::String(s) if s.contains(':') => {
            for pair in s.split(';') {
                let (source, column) = pair
                    .split_once(':')
                    .ok_or_else(|| ctx.error(format_args!("invalid map entry \"{pair}\"")))?;
                mapping.insert(source.trim().to_string(), column.trim().to_string());
            }
        }
        Value::String(column) => {
            mapping.insert(PRIMARY_SOURCE.to_string(), column.clone());
        }
        Value::Object(entries) => {
            for (source, column) in entries {
                mapping.insert(
                    source.clone(),
                    expect_str(ctx, column, "map")?.to_string(),
                );
            }
        }
        other => return Err(ctx.error(format_args!("invalid map {other}"))),
    }
    if mapping.is_empty() {
        return Err(ctx.error("empty map"));
    }
    Ok(mapping)
}

/// Filter forms: `true` (equality only), `false` (none), or a token
/// list as array or comma-separated string.
fn parse_filter_operators(ctx: &Ctx, raw: &Value) -> Result<Vec<FilterOperator>> {
    match raw {
        Value::Bool(true) => Ok(vec![FilterOperator::Equal]),
        Value::Bool(false) => Ok(vec![]),
        other => parse_tokens(ctx, other, "filter"),
    }
}

/// Order forms: `true` (asc and desc), `false`, or a token list.
fn parse_order_directions(ctx: &Ctx, raw: &Value) -> Result<Vec<OrderDirection>> {
    match raw {
        Value::Bool(true) => Ok(vec![OrderDirection::Asc, OrderDirection::Desc]),
        Value::Bool(false) => Ok(vec![]),
        other => parse_tokens(ctx, other, "order"),
    }
}

fn parse_tokens<T>(ctx: &Ctx, raw: &Value, option: &str) -> Result<Vec<T>>
where
    T: std::str::FromStr,
{
    let tokens: Vec<String> = match raw {
        Value::String(s) => s.split(',').map(|t| t.trim().to_string()).collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| expect_str(ctx, item, option).map(str::to_string))
            .collect::<Result<_>>()?,
        other => return Err(ctx.error(format_args!("invalid {option} {other}"))),
    };
    tokens
        .iter()
        .map(|token| {
            token
                .parse::<T>()
                .map_err(|_| ctx.error(format_args!("invalid {option} token \"{token}\"")))
        })
        .collect()
}

// ============================================================================
// Nested attributes
// ============================================================================

fn parse_nested(ctx: &Ctx, obj: &Map<String, Value>) -> Result<NestedAttribute> {
    check_options(ctx, obj, NESTED_OPTIONS)?;
    let mut nested = NestedAttribute {
        attributes: IndexMap::new(),
        hidden: opt_bool(ctx, obj, "hidden")?,
    };
    let attributes = expect_object(ctx, obj.get("attributes").unwrap_or(&Value::Null))?;
    for (name, value) in attributes {
        let child_ctx = ctx.descend(name);
        nested
            .attributes
            .insert(name.clone(), parse_attribute(&child_ctx, value)?);
    }
    Ok(nested)
}

// ============================================================================
// Sub-resources
// ============================================================================

fn parse_sub_resource(ctx: &Ctx, obj: &Map<String, Value>) -> Result<SubResourceAttribute> {
    check_options(ctx, obj, SUB_RESOURCE_OPTIONS)?;

    let resource_ref = obj
        .get("resource")
        .map(|v| expect_str(ctx, v, "resource").map(str::to_string))
        .transpose()?;

    let sub_name = format!("{}.{}", ctx.resource, ctx.path.join("."));
    let mut config = parse_resource_body(ctx, obj, &sub_name)?;
    config.name = sub_name;

    Ok(SubResourceAttribute {
        config,
        resource_ref,
        parent_key: obj
            .get("parentKey")
            .map(|v| parse_key_list(ctx, v, "parentKey"))
            .transpose()?
            .unwrap_or_default(),
        child_key: obj
            .get("childKey")
            .map(|v| parse_key_list(ctx, v, "childKey"))
            .transpose()?
            .unwrap_or_default(),
        resolved_parent_key: Default::default(),
        resolved_child_key: Default::default(),
        many: opt_bool(ctx, obj, "many")?,
        join_via: obj
            .get("joinVia")
            .map(|v| expect_str(ctx, v, "joinVia").map(str::to_string))
            .transpose()?,
        unique_child_key: false,
        multi_valued_parent_key: false,
        hidden: opt_bool(ctx, obj, "hidden")?,
        deprecated: opt_bool(ctx, obj, "deprecated")?,
    })
}

// ============================================================================
// Data sources
// ============================================================================

fn parse_data_sources(
    ctx: &Ctx,
    raw: &Value,
) -> Result<IndexMap<String, DataSourceDescriptor>> {
    let obj = expect_object(ctx, raw)?;
    let mut sources = IndexMap::new();
    for (name, value) in obj {
        let descriptor_obj = expect_object(ctx, value)?;
        let mut descriptor = DataSourceDescriptor::default();
        for (key, option) in descriptor_obj {
            match key.as_str() {
                "type" => descriptor.kind = expect_str(ctx, option, "type")?.to_string(),
                "searchable" => {
                    descriptor.searchable = expect_bool(ctx, option, "searchable")?;
                }
                "inherit" => descriptor.inherit = expect_bool(ctx, option, "inherit")?,
                "joinParentKey" => {
                    descriptor.join_parent_key = Some(parse_key_list(ctx, option, key)?);
                }
                "joinChildKey" => {
                    descriptor.join_child_key = Some(parse_key_list(ctx, option, key)?);
                }
                // Everything else is driver-specific and passed through.
                _ => {
                    descriptor.options.insert(key.clone(), option.clone());
                }
            }
        }
        if descriptor.kind.is_empty() {
            return Err(ctx.error(format_args!("data source \"{name}\" is missing a type")));
        }
        sources.insert(name.clone(), descriptor);
    }
    Ok(sources)
}

// ============================================================================
// Keys, sub-filters, order
// ============================================================================

/// Key lists: `"id"`, `"userId,groupId"`, `["a.b", "c"]`, or the
/// literal `"{primary}"` kept for pass-2 expansion.
fn parse_key_list(ctx: &Ctx, raw: &Value, option: &str) -> Result<Vec<AttrPath>> {
    match raw {
        Value::String(s) => Ok(s
            .split(',')
            .map(|part| {
                let part = part.trim();
                if part == "{primary}" {
                    vec![part.to_string()]
                } else {
                    parse_attr_path(part)
                }
            })
            .collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let s = expect_str(ctx, item, option)?;
                Ok(if s == "{primary}" {
                    vec![s.to_string()]
                } else {
                    parse_attr_path(s)
                })
            })
            .collect(),
        other => Err(ctx.error(format_args!("invalid {option} {other}"))),
    }
}

fn parse_sub_filters(ctx: &Ctx, raw: &Value) -> Result<Vec<SubFilterSpec>> {
    let items = raw
        .as_array()
        .ok_or_else(|| ctx.error("subFilters must be a list"))?;
    items
        .iter()
        .map(|item| {
            let obj = expect_object(ctx, item)?;
            check_options(ctx, obj, &["attribute", "filter", "rewriteTo"])?;
            let attribute = obj
                .get("attribute")
                .ok_or_else(|| ctx.error("subFilter is missing an attribute"))?;
            Ok(SubFilterSpec {
                attribute: parse_attr_path(expect_str(ctx, attribute, "attribute")?),
                operators: obj
                    .get("filter")
                    .map(|v| parse_filter_operators(ctx, v))
                    .transpose()?
                    .unwrap_or_else(|| vec![FilterOperator::Equal]),
                rewrite_to: obj
                    .get("rewriteTo")
                    .map(|v| expect_str(ctx, v, "rewriteTo").map(|s| parse_attr_path(s)))
                    .transpose()?,
            })
        })
        .collect()
}

/// Order specs: `"date:desc,name"` or a list of
/// `{attribute, direction}` objects.
fn parse_order_specs(ctx: &Ctx, raw: &Value) -> Result<Vec<OrderSpec>> {
    match raw {
        Value::String(s) => s
            .split(',')
            .map(|term| {
                let (attr, dir) = term.trim().split_once(':').unwrap_or((term.trim(), "asc"));
                Ok(OrderSpec {
                    attribute: parse_attr_path(attr),
                    direction: dir
                        .parse()
                        .map_err(|_| ctx.error(format_args!("invalid order \"{term}\"")))?,
                })
            })
            .collect(),
        other => serde_json::from_value(other.clone())
            .map_err(|err| ctx.error(format_args!("invalid defaultOrder: {err}"))),
    }
}

// ============================================================================
// Value checkers
// ============================================================================

fn expect_object<'a>(ctx: &Ctx, raw: &'a Value) -> Result<&'a Map<String, Value>> {
    raw.as_object()
        .ok_or_else(|| ctx.error(format_args!("expected an object, got {raw}")))
}

fn expect_str<'a>(ctx: &Ctx, raw: &'a Value, option: &str) -> Result<&'a str> {
    raw.as_str()
        .ok_or_else(|| ctx.error(format_args!("option \"{option}\" must be a string")))
}

fn expect_bool(ctx: &Ctx, raw: &Value, option: &str) -> Result<bool> {
    raw.as_bool()
        .ok_or_else(|| ctx.error(format_args!("option \"{option}\" must be a boolean")))
}

fn expect_u64(ctx: &Ctx, raw: &Value, option: &str) -> Result<u64> {
    raw.as_u64()
        .ok_or_else(|| ctx.error(format_args!("option \"{option}\" must be a non-negative integer")))
}

fn opt_bool(ctx: &Ctx, obj: &Map<String, Value>, option: &str) -> Result<bool> {
    match obj.get(option) {
        Some(value) => expect_bool(ctx, value, option),
        None => Ok(false),
    }
}
