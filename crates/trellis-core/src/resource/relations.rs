//! Config parsing, pass 2: relation resolution.
//!
//! With every resource visible, sub-resource nodes are walked to
//! expand `resource:` inclusions, resolve primary/parent/child/join
//! keys into per-source column lists, and prepare every data-source
//! descriptor.

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use super::{AttributeNode, LeafAttribute, ResourceConfig, SubResourceAttribute};
use crate::datasource::DataSourceRegistry;
use crate::error::{Error, Result};
use crate::request::{attr_path_str, AttrPath, FilterOperator};

/// Inclusions may nest this deep; genuine cycles exhaust the bound.
const MAX_INCLUSION_DEPTH: usize = 10;

const PRIMARY_LITERAL: &str = "{primary}";

/// Resolve relations across all parsed resources and prepare their
/// data sources.
pub fn resolve(
    configs: &mut IndexMap<String, ResourceConfig>,
    registry: &DataSourceRegistry,
) -> Result<()> {
    let originals = configs.clone();
    for (_, config) in configs.iter_mut() {
        resolve_resource(config, &originals, registry, 0)?;
    }
    Ok(())
}

fn resolve_resource(
    config: &mut ResourceConfig,
    originals: &IndexMap<String, ResourceConfig>,
    registry: &DataSourceRegistry,
    depth: usize,
) -> Result<()> {
    // Inclusions and join marks affect everything after, so they come
    // first.
    for_each_sub_resource(&mut config.attributes, &mut |sub| {
        expand_inclusion(sub, originals, depth)?;
        mark_join_source(sub)
    })?;

    let primary = config.default_primary_source().to_string();
    if !config.data_sources.contains_key(&primary) {
        return Err(Error::Implementation(format!(
            "resource \"{}\": missing data source \"{primary}\"",
            config.name
        )));
    }

    resolve_primary_key(config)?;

    // Relation keys need the parent's final leaf mappings.
    let parent_view = config.clone();
    for_each_sub_resource(&mut config.attributes, &mut |sub| {
        resolve_resource(&mut sub.config, originals, registry, depth + 1)?;
        resolve_relation_keys(&parent_view, sub)
    })?;

    prepare_sources(config, registry)
}

/// Visit every sub-resource node at this resource level, descending
/// through nested namespaces but not into sub-resource configs.
fn for_each_sub_resource(
    attributes: &mut IndexMap<String, AttributeNode>,
    visit: &mut impl FnMut(&mut SubResourceAttribute) -> Result<()>,
) -> Result<()> {
    for (_, node) in attributes.iter_mut() {
        match node {
            AttributeNode::SubResource(sub) => visit(sub)?,
            AttributeNode::Nested(nested) => for_each_sub_resource(&mut nested.attributes, visit)?,
            AttributeNode::Leaf(_) => {}
        }
    }
    Ok(())
}

// ============================================================================
// Inclusions
// ============================================================================

fn expand_inclusion(
    sub: &mut SubResourceAttribute,
    originals: &IndexMap<String, ResourceConfig>,
    depth: usize,
) -> Result<()> {
    let Some(target_name) = sub.resource_ref.take() else {
        return Ok(());
    };
    if depth >= MAX_INCLUSION_DEPTH {
        return Err(Error::Implementation(format!(
            "resource \"{}\": inclusion depth exceeds {MAX_INCLUSION_DEPTH} (cyclic resource references?)",
            sub.config.name
        )));
    }
    let target = originals.get(&target_name).ok_or_else(|| {
        Error::Implementation(format!(
            "resource \"{}\": included resource \"{target_name}\" does not exist",
            sub.config.name
        ))
    })?;
    debug!(sub = %sub.config.name, target = %target_name, "expanding resource inclusion");
    merge_included(&mut sub.config, target)
}

/// Merge an inclusion target under the including node. The including
/// node may add attributes and data sources but not overwrite the
/// target's.
fn merge_included(config: &mut ResourceConfig, target: &ResourceConfig) -> Result<()> {
    let mut attributes = target.attributes.clone();
    for (name, node) in config.attributes.drain(..) {
        if attributes.contains_key(&name) {
            return Err(Error::Implementation(format!(
                "resource \"{}\": inclusion of \"{}\" may not overwrite attribute \"{name}\"",
                config.name, target.name
            )));
        }
        attributes.insert(name, node);
    }
    config.attributes = attributes;

    let mut data_sources = target.data_sources.clone();
    for (name, descriptor) in config.data_sources.drain(..) {
        if data_sources.contains_key(&name) {
            return Err(Error::Implementation(format!(
                "resource \"{}\": inclusion of \"{}\" may not overwrite data source \"{name}\"",
                config.name, target.name
            )));
        }
        data_sources.insert(name, descriptor);
    }
    config.data_sources = data_sources;

    if config.primary_key.is_empty() {
        config.primary_key = target.primary_key.clone();
    }
    if config.primary_name.is_none() {
        config.primary_name = target.primary_name.clone();
    }
    if config.sub_filters.is_empty() {
        config.sub_filters = target.sub_filters.clone();
    }
    if config.default_limit.is_none() {
        config.default_limit = target.default_limit;
    }
    if config.max_limit.is_none() {
        config.max_limit = target.max_limit;
    }
    if config.default_order.is_empty() {
        config.default_order = target.default_order.clone();
    }
    if config.permission.is_none() {
        config.permission = target.permission.clone();
    }
    Ok(())
}

fn mark_join_source(sub: &mut SubResourceAttribute) -> Result<()> {
    let Some(join_name) = sub.join_via.clone() else {
        return Ok(());
    };
    let descriptor = sub.config.data_sources.get_mut(&join_name).ok_or_else(|| {
        Error::Implementation(format!(
            "resource \"{}\": joinVia names unknown data source \"{join_name}\"",
            sub.config.name
        ))
    })?;
    descriptor.is_join = true;
    Ok(())
}

// ============================================================================
// Primary key
// ============================================================================

fn resolve_primary_key(config: &mut ResourceConfig) -> Result<()> {
    if config.primary_key.is_empty() {
        return Err(Error::Implementation(format!(
            "resource \"{}\": missing primaryKey",
            config.name
        )));
    }

    check_composite_parts(config, &config.primary_key.clone(), "primaryKey")?;

    let mut resolved = std::collections::HashMap::new();
    for source in config.non_join_sources().map(str::to_string).collect::<Vec<_>>() {
        let mut columns = Vec::with_capacity(config.primary_key.len());
        for path in &config.primary_key {
            let leaf = require_leaf(config, path, "primaryKey")?;
            let column = leaf.column(&source).ok_or_else(|| {
                Error::Implementation(format!(
                    "resource \"{}\": primary key attribute \"{}\" is not mapped in data source \"{source}\"",
                    config.name,
                    attr_path_str(path)
                ))
            })?;
            columns.push(column.to_string());
        }
        resolved.insert(source, columns);
    }
    if resolved.is_empty() {
        return Err(Error::Implementation(format!(
            "resource \"{}\": primary key is not mapped in any data source",
            config.name
        )));
    }
    config.resolved_primary_key = resolved;

    // Visible scalar primary keys get an equality filter by default.
    if config.primary_key.len() == 1 {
        let path = config.primary_key[0].clone();
        if let Some(leaf) = leaf_mut(&mut config.attributes, &path) {
            if !leaf.hidden && leaf.filter.is_none() {
                leaf.filter = Some(vec![FilterOperator::Equal]);
            }
        }
    }

    Ok(())
}

// ============================================================================
// Relation keys
// ============================================================================

fn resolve_relation_keys(
    parent: &ResourceConfig,
    sub: &mut SubResourceAttribute,
) -> Result<()> {
    let name = sub.config.name.clone();

    sub.parent_key = expand_primary_literal(sub.parent_key.clone(), parent, &name, "parentKey")?;
    sub.child_key =
        expand_primary_literal(sub.child_key.clone(), &sub.config, &name, "childKey")?;

    if sub.parent_key.is_empty() || sub.child_key.is_empty() {
        return Err(Error::Implementation(format!(
            "resource \"{name}\": parentKey and childKey are required"
        )));
    }
    if sub.parent_key.len() != sub.child_key.len() {
        return Err(Error::Implementation(format!(
            "resource \"{name}\": parentKey has {} part(s) but childKey has {}",
            sub.parent_key.len(),
            sub.child_key.len()
        )));
    }

    check_composite_parts(parent, &sub.parent_key, "parentKey")?;
    check_composite_parts(&sub.config, &sub.child_key, "childKey")?;

    // A multi-valued parent key dereferences per element; only single
    // keys support that.
    if sub.parent_key.len() == 1 {
        let leaf = require_leaf(parent, &sub.parent_key[0], "parentKey")?;
        sub.multi_valued_parent_key = leaf.cast.multi_valued || leaf.cast.delimiter.is_some();
    }

    sub.resolved_parent_key = resolve_key_columns(parent, &sub.parent_key, "parentKey")?;
    sub.resolved_child_key = resolve_key_columns(&sub.config, &sub.child_key, "childKey")?;

    sub.unique_child_key = key_matches_primary(&sub.child_key, &sub.config.primary_key)
        && !sub
            .child_key
            .iter()
            .any(|path| leaf_is_multi_valued(&sub.config, path));

    if let Some(join_name) = sub.join_via.clone() {
        resolve_join_keys(sub, &join_name)?;
    }

    Ok(())
}

/// Expand the `{primary}` literal into the respective primary key.
fn expand_primary_literal(
    key: Vec<AttrPath>,
    config: &ResourceConfig,
    name: &str,
    option: &str,
) -> Result<Vec<AttrPath>> {
    let is_literal = |path: &AttrPath| path.len() == 1 && path[0] == PRIMARY_LITERAL;
    if key.len() == 1 && is_literal(&key[0]) {
        return Ok(config.primary_key.clone());
    }
    if key.iter().any(is_literal) {
        return Err(Error::Implementation(format!(
            "resource \"{name}\": {option} may not mix {PRIMARY_LITERAL} with attribute paths"
        )));
    }
    Ok(key)
}

/// Storage columns of a key, for every non-join data source that maps
/// all its parts.
fn resolve_key_columns(
    config: &ResourceConfig,
    key: &[AttrPath],
    option: &str,
) -> Result<std::collections::HashMap<String, Vec<String>>> {
    let mut resolved = std::collections::HashMap::new();
    for source in config.non_join_sources() {
        let columns: Option<Vec<String>> = key
            .iter()
            .map(|path| {
                config
                    .leaf(path)
                    .and_then(|leaf| leaf.column(source))
                    .map(str::to_string)
            })
            .collect();
        if let Some(columns) = columns {
            resolved.insert(source.to_string(), columns);
        }
    }
    if resolved.is_empty() {
        return Err(Error::Implementation(format!(
            "resource \"{}\": {option} [{}] is not fully mapped in any data source",
            config.name,
            key.iter().map(|p| attr_path_str(p)).collect::<Vec<_>>().join(", ")
        )));
    }
    Ok(resolved)
}

fn resolve_join_keys(sub: &mut SubResourceAttribute, join_name: &str) -> Result<()> {
    let name = sub.config.name.clone();

    let descriptor = sub.config.data_sources.get(join_name).ok_or_else(|| {
        Error::Implementation(format!(
            "resource \"{name}\": joinVia names unknown data source \"{join_name}\""
        ))
    })?;
    let join_parent_key = descriptor.join_parent_key.clone().ok_or_else(|| {
        Error::Implementation(format!(
            "resource \"{name}\": data source \"{join_name}\" is missing joinParentKey"
        ))
    })?;
    let join_child_key = descriptor.join_child_key.clone().ok_or_else(|| {
        Error::Implementation(format!(
            "resource \"{name}\": data source \"{join_name}\" is missing joinChildKey"
        ))
    })?;

    if join_parent_key.len() != sub.parent_key.len() {
        return Err(Error::Implementation(format!(
            "resource \"{name}\": joinParentKey has {} part(s) but parentKey has {}",
            join_parent_key.len(),
            sub.parent_key.len()
        )));
    }
    if join_child_key.len() != sub.child_key.len() {
        return Err(Error::Implementation(format!(
            "resource \"{name}\": joinChildKey has {} part(s) but childKey has {}",
            join_child_key.len(),
            sub.child_key.len()
        )));
    }

    let resolve = |key: &[AttrPath], option: &str| -> Result<Vec<String>> {
        key.iter()
            .map(|path| {
                sub.config
                    .leaf(path)
                    .and_then(|leaf| leaf.column(join_name))
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::Implementation(format!(
                            "resource \"{name}\": {option} attribute \"{}\" is not mapped in data source \"{join_name}\"",
                            attr_path_str(path)
                        ))
                    })
            })
            .collect()
    };
    let resolved_parent = resolve(&join_parent_key, "joinParentKey")?;
    let resolved_child = resolve(&join_child_key, "joinChildKey")?;

    let descriptor = sub
        .config
        .data_sources
        .get_mut(join_name)
        .expect("join data source checked above");
    descriptor.resolved_join_parent_key = Some(resolved_parent);
    descriptor.resolved_join_child_key = Some(resolved_child);
    Ok(())
}

// ============================================================================
// Prepare
// ============================================================================

/// Validate that every mapping names a declared data source, collect
/// the unique columns per source, and hand them to the driver.
fn prepare_sources(config: &mut ResourceConfig, registry: &DataSourceRegistry) -> Result<()> {
    let mut columns: IndexMap<String, IndexSet<String>> = config
        .data_sources
        .keys()
        .map(|name| (name.clone(), IndexSet::new()))
        .collect();
    collect_columns(&config.name, &config.attributes, &mut columns, &mut Vec::new())?;

    for (source_name, descriptor) in config.data_sources.iter_mut() {
        let used: Vec<String> = columns
            .get(source_name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let driver = registry.get(&descriptor.kind).map_err(|err| {
            err.at_data_source(source_name)
        })?;
        debug!(
            resource = %config.name,
            source = %source_name,
            columns = used.len(),
            "preparing data source"
        );
        driver.prepare(descriptor, &used)?;
    }
    Ok(())
}

fn collect_columns(
    resource: &str,
    attributes: &IndexMap<String, AttributeNode>,
    columns: &mut IndexMap<String, IndexSet<String>>,
    path: &mut Vec<String>,
) -> Result<()> {
    for (name, node) in attributes {
        path.push(name.clone());
        match node {
            AttributeNode::Leaf(leaf) => {
                for (source, column) in &leaf.mapping {
                    let set = columns.get_mut(source).ok_or_else(|| {
                        Error::Implementation(format!(
                            "resource \"{resource}\", attribute \"{}\": maps to undeclared data source \"{source}\"",
                            path.join(".")
                        ))
                    })?;
                    set.insert(column.clone());
                }
            }
            AttributeNode::Nested(nested) => {
                collect_columns(resource, &nested.attributes, columns, path)?;
            }
            // Sub-resources collect their own columns.
            AttributeNode::SubResource(_) => {}
        }
        path.pop();
    }
    Ok(())
}

// ============================================================================
// Lookups
// ============================================================================

fn require_leaf<'a>(
    config: &'a ResourceConfig,
    path: &[String],
    option: &str,
) -> Result<&'a LeafAttribute> {
    config.leaf(path).ok_or_else(|| {
        Error::Implementation(format!(
            "resource \"{}\": {option} references unknown attribute \"{}\"",
            config.name,
            attr_path_str(path)
        ))
    })
}

fn leaf_mut<'a>(
    attributes: &'a mut IndexMap<String, AttributeNode>,
    path: &[String],
) -> Option<&'a mut LeafAttribute> {
    let (first, rest) = path.split_first()?;
    match attributes.get_mut(first)? {
        AttributeNode::Leaf(leaf) if rest.is_empty() => Some(leaf),
        AttributeNode::Nested(nested) if !rest.is_empty() => leaf_mut(&mut nested.attributes, rest),
        _ => None,
    }
}

fn leaf_is_multi_valued(config: &ResourceConfig, path: &[String]) -> bool {
    config
        .leaf(path)
        .is_some_and(|leaf| leaf.cast.multi_valued || leaf.cast.delimiter.is_some())
}

/// Composite keys forbid multi-valued parts.
fn check_composite_parts(
    config: &ResourceConfig,
    key: &[AttrPath],
    option: &str,
) -> Result<()> {
    if key.len() <= 1 {
        return Ok(());
    }
    for path in key {
        if leaf_is_multi_valued(config, path) {
            return Err(Error::Implementation(format!(
                "resource \"{}\": composite {option} part \"{}\" may not be multiValued",
                config.name,
                attr_path_str(path)
            )));
        }
    }
    Ok(())
}

fn key_matches_primary(key: &[AttrPath], primary: &[AttrPath]) -> bool {
    if key.len() != primary.len() {
        return false;
    }
    let mut a: Vec<String> = key.iter().map(|p| attr_path_str(p)).collect();
    let mut b: Vec<String> = primary.iter().map(|p| attr_path_str(p)).collect();
    a.sort();
    b.sort();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{
        DataSource, DataSourceRegistry, SourceQuery, SourceResult,
    };
    use crate::resource::{parse_resources, DataSourceDescriptor};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    /// Records prepare calls and stashes a marker on the descriptor.
    #[derive(Default)]
    struct RecordingDriver {
        prepared: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl DataSource for RecordingDriver {
        fn prepare(
            &self,
            descriptor: &mut DataSourceDescriptor,
            columns: &[String],
        ) -> crate::error::Result<()> {
            self.prepared
                .lock()
                .unwrap()
                .push((descriptor.kind.clone(), columns.to_vec()));
            descriptor.prepared = Some(json!({"columns": columns}));
            Ok(())
        }

        async fn process(
            &self,
            _query: &SourceQuery,
            _cancel: &CancellationToken,
        ) -> crate::error::Result<SourceResult> {
            Ok(SourceResult::empty())
        }
    }

    fn registry() -> (Arc<RecordingDriver>, DataSourceRegistry) {
        let driver = Arc::new(RecordingDriver::default());
        let mut registry = DataSourceRegistry::new();
        registry.register("memory", driver.clone());
        (driver, registry)
    }

    fn user_config() -> serde_json::Value {
        json!({
            "primaryKey": "id",
            "dataSources": {"primary": {"type": "memory"}},
            "attributes": {
                "id": {"type": "int"},
                "name": {"map": "username"},
                "groupId": {"type": "int", "filter": "equal"},
            },
        })
    }

    #[test]
    fn test_primary_key_resolution_and_default_filter() {
        let (_, registry) = registry();
        let raw = json!({"user": user_config()});
        let configs = parse_resources(raw.as_object().unwrap(), &registry).unwrap();

        let user = configs.get("user").unwrap();
        assert_eq!(
            user.resolved_primary_key.get("primary").unwrap(),
            &vec!["id".to_string()]
        );
        // Visible scalar primary key got the default equality filter.
        let id = user.leaf(&["id".into()]).unwrap();
        assert_eq!(id.filter, Some(vec![FilterOperator::Equal]));
    }

    #[test]
    fn test_unmapped_primary_key_fails() {
        let (_, registry) = registry();
        let raw = json!({
            "broken": {
                "primaryKey": "id",
                "dataSources": {
                    "primary": {"type": "memory"},
                    "search": {"type": "memory"},
                },
                "attributes": {
                    "id": {"type": "int", "map": {"primary": "id"}},
                },
            },
        });
        let err = parse_resources(raw.as_object().unwrap(), &registry).unwrap_err();
        assert!(err
            .to_string()
            .contains("not mapped in data source \"search\""));
    }

    #[test]
    fn test_primary_literal_and_unique_child_key() {
        let (_, registry) = registry();
        let raw = json!({
            "user": user_config(),
            "article": {
                "primaryKey": "id",
                "dataSources": {"primary": {"type": "memory"}},
                "attributes": {
                    "id": {"type": "int"},
                    "authorId": {"type": "int", "hidden": true},
                    "author": {
                        "resource": "user",
                        "parentKey": "authorId",
                        "childKey": "{primary}",
                    },
                    "comments": {
                        "primaryKey": "id",
                        "parentKey": "id",
                        "childKey": "articleId",
                        "many": true,
                        "dataSources": {"primary": {"type": "memory"}},
                        "attributes": {
                            "id": {"type": "int"},
                            "articleId": {"type": "int", "hidden": true},
                            "content": {},
                        },
                    },
                },
            },
        });
        let configs = parse_resources(raw.as_object().unwrap(), &registry).unwrap();
        let article = configs.get("article").unwrap();

        let author = match article.attribute(&["author".into()]).unwrap() {
            AttributeNode::SubResource(sub) => sub,
            other => panic!("expected sub-resource, got {other:?}"),
        };
        // {primary} expanded to the included resource's key.
        assert_eq!(author.child_key, vec![vec!["id"]]);
        assert!(author.unique_child_key);
        assert!(!author.multi_valued_parent_key);
        // Inclusion brought the target's attributes along.
        assert!(author.config.leaf(&["name".into()]).is_some());

        let comments = match article.attribute(&["comments".into()]).unwrap() {
            AttributeNode::SubResource(sub) => sub,
            other => panic!("expected sub-resource, got {other:?}"),
        };
        assert!(!comments.unique_child_key);
        assert_eq!(
            comments.resolved_child_key.get("primary").unwrap(),
            &vec!["articleId".to_string()]
        );
        assert_eq!(
            comments.resolved_parent_key.get("primary").unwrap(),
            &vec!["id".to_string()]
        );
    }

    #[test]
    fn test_key_length_mismatch() {
        let (_, registry) = registry();
        let raw = json!({
            "article": {
                "primaryKey": "id",
                "dataSources": {"primary": {"type": "memory"}},
                "attributes": {
                    "id": {"type": "int"},
                    "versions": {
                        "primaryKey": "id",
                        "parentKey": "id",
                        "childKey": "articleId,versionNo",
                        "many": true,
                        "dataSources": {"primary": {"type": "memory"}},
                        "attributes": {
                            "id": {"type": "int"},
                            "articleId": {"type": "int"},
                            "versionNo": {"type": "int"},
                        },
                    },
                },
            },
        });
        let err = parse_resources(raw.as_object().unwrap(), &registry).unwrap_err();
        assert!(err.to_string().contains("parentKey has 1 part(s) but childKey has 2"));
    }

    #[test]
    fn test_inclusion_may_not_overwrite() {
        let (_, registry) = registry();
        let raw = json!({
            "user": user_config(),
            "article": {
                "primaryKey": "id",
                "dataSources": {"primary": {"type": "memory"}},
                "attributes": {
                    "id": {"type": "int"},
                    "authorId": {"type": "int", "hidden": true},
                    "author": {
                        "resource": "user",
                        "parentKey": "authorId",
                        "childKey": "{primary}",
                        "attributes": {
                            "name": {"map": "other"},
                        },
                    },
                },
            },
        });
        let err = parse_resources(raw.as_object().unwrap(), &registry).unwrap_err();
        assert!(err.to_string().contains("may not overwrite attribute \"name\""));
    }

    #[test]
    fn test_join_via_resolution() {
        let (_, registry) = registry();
        let raw = json!({
            "article": {
                "primaryKey": "id",
                "dataSources": {"primary": {"type": "memory"}},
                "attributes": {
                    "id": {"type": "int"},
                    "categories": {
                        "primaryKey": "id",
                        "parentKey": "id",
                        "childKey": "id",
                        "many": true,
                        "joinVia": "articleCategories",
                        "dataSources": {
                            "primary": {"type": "memory"},
                            "articleCategories": {
                                "type": "memory",
                                "joinParentKey": "articleId",
                                "joinChildKey": "categoryId",
                            },
                        },
                        "attributes": {
                            "id": {"type": "int"},
                            "name": {},
                            "articleId": {
                                "type": "int",
                                "hidden": true,
                                "map": {"articleCategories": "articleId"},
                            },
                            "categoryId": {
                                "type": "int",
                                "hidden": true,
                                "map": {"articleCategories": "categoryId"},
                            },
                            "order": {
                                "type": "int",
                                "map": {"articleCategories": "sortOrder"},
                            },
                        },
                    },
                },
            },
        });
        let configs = parse_resources(raw.as_object().unwrap(), &registry).unwrap();
        let article = configs.get("article").unwrap();
        let categories = match article.attribute(&["categories".into()]).unwrap() {
            AttributeNode::SubResource(sub) => sub,
            other => panic!("expected sub-resource, got {other:?}"),
        };
        let join = categories
            .config
            .data_sources
            .get("articleCategories")
            .unwrap();
        assert!(join.is_join);
        assert_eq!(
            join.resolved_join_parent_key,
            Some(vec!["articleId".to_string()])
        );
        assert_eq!(
            join.resolved_join_child_key,
            Some(vec!["categoryId".to_string()])
        );
        // The join source is excluded from primary-key resolution.
        assert!(!categories
            .config
            .resolved_primary_key
            .contains_key("articleCategories"));
    }

    #[test]
    fn test_multi_valued_parent_key_flag() {
        let (_, registry) = registry();
        let raw = json!({
            "article": {
                "primaryKey": "id",
                "dataSources": {"primary": {"type": "memory"}},
                "attributes": {
                    "id": {"type": "int"},
                    "tagIds": {"type": "int", "multiValued": true, "hidden": true},
                    "tags": {
                        "primaryKey": "id",
                        "parentKey": "tagIds",
                        "childKey": "id",
                        "many": true,
                        "dataSources": {"primary": {"type": "memory"}},
                        "attributes": {
                            "id": {"type": "int"},
                            "name": {},
                        },
                    },
                },
            },
        });
        let configs = parse_resources(raw.as_object().unwrap(), &registry).unwrap();
        let article = configs.get("article").unwrap();
        let tags = match article.attribute(&["tags".into()]).unwrap() {
            AttributeNode::SubResource(sub) => sub,
            other => panic!("expected sub-resource, got {other:?}"),
        };
        assert!(tags.multi_valued_parent_key);
    }

    #[test]
    fn test_composite_key_forbids_multi_valued_parts() {
        let (_, registry) = registry();
        let raw = json!({
            "broken": {
                "primaryKey": "a,b",
                "dataSources": {"primary": {"type": "memory"}},
                "attributes": {
                    "a": {"type": "int"},
                    "b": {"type": "int", "multiValued": true},
                },
            },
        });
        let err = parse_resources(raw.as_object().unwrap(), &registry).unwrap_err();
        assert!(err.to_string().contains("may not be multiValued"));
    }

    #[test]
    fn test_cyclic_inclusion_is_rejected() {
        let (_, registry) = registry();
        let raw = json!({
            "a": {
                "primaryKey": "id",
                "dataSources": {"primary": {"type": "memory"}},
                "attributes": {
                    "id": {"type": "int"},
                    "parentId": {"type": "int", "hidden": true},
                    "parent": {
                        "resource": "a",
                        "parentKey": "parentId",
                        "childKey": "{primary}",
                    },
                },
            },
        });
        let err = parse_resources(raw.as_object().unwrap(), &registry).unwrap_err();
        assert!(err.to_string().contains("inclusion depth"));
    }

    #[test]
    fn test_prepare_receives_collected_columns() {
        let (driver, registry) = registry();
        let raw = json!({"user": user_config()});
        let configs = parse_resources(raw.as_object().unwrap(), &registry).unwrap();

        let calls = driver.prepared.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (_, columns) = &calls[0];
        assert!(columns.contains(&"id".to_string()));
        assert!(columns.contains(&"username".to_string()));

        // The driver's stash survived on the descriptor.
        let user = configs.get("user").unwrap();
        assert!(user.data_sources.get("primary").unwrap().prepared.is_some());
    }

    #[test]
    fn test_mapping_to_undeclared_source_fails() {
        let (_, registry) = registry();
        let raw = json!({
            "user": {
                "primaryKey": "id",
                "dataSources": {"primary": {"type": "memory"}},
                "attributes": {
                    "id": {"type": "int"},
                    "name": {"map": {"fulltext": "name"}},
                },
            },
        });
        let err = parse_resources(raw.as_object().unwrap(), &registry).unwrap_err();
        assert!(err.to_string().contains("undeclared data source \"fulltext\""));
    }
}
