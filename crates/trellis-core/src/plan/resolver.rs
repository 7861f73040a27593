//! The request resolver.
//!
//! Walks the projection against the parsed config, validates every
//! request option, distributes selected attributes across data
//! sources, and emits the data-source tree.

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

use super::{
    DstNode, ResolvedChild, ResolvedJoin, ResolvedLeaf, ResolvedRequest, ResolvedResource,
    ResolvedSubResource,
};
use crate::cast::CastOptions;
use crate::datasource::{
    FilterKey, SourceCondition, SourceFilter, SourceOrder, SourceQuery, SourceValue,
};
use crate::error::{Error, Result};
use crate::request::{
    attr_path_str, AttrPath, FilterOperator, FilterTree, OrderSpec, Request, Select, SelectItem,
};
use crate::resource::{
    AttributeNode, LeafAttribute, ResourceConfig, SubResourceAttribute,
};

/// Collections default to this page size at the root when neither the
/// request nor the config limits them.
const ROOT_DEFAULT_LIMIT: u64 = 10;

/// Resolve a request into the resolved resource tree and the DST.
pub fn resolve(
    request: &Request,
    configs: &IndexMap<String, ResourceConfig>,
) -> Result<ResolvedRequest> {
    let config = configs.get(&request.resource).ok_or_else(|| {
        Error::NotFound(format!("unknown resource \"{}\"", request.resource))
    })?;

    let many = request.id.is_none();
    let mut filter = request.filter.clone().unwrap_or_default();

    if let Some(id) = &request.id {
        if config.primary_key.len() != 1 {
            return Err(Error::Request(format!(
                "resource \"{}\" has a composite primary key; retrieval by id is not supported",
                request.resource
            )));
        }
        let id_filter = FilterTree(vec![vec![crate::request::FilterPart {
            attribute: config.primary_key[0].clone(),
            operator: FilterOperator::Equal,
            value: id.clone(),
        }]]);
        filter = filter.cross(id_filter);
    }

    let resolver = Resolver {
        allow_hidden: request.internal,
    };
    let input = FrameInput {
        select_all: request.select.is_none(),
        items: request
            .select
            .as_ref()
            .map(|s| s.items.clone())
            .unwrap_or_default(),
        filter: (!filter.is_empty()).then_some(filter),
        search: request.search.clone(),
        order: request.order.clone(),
        limit: request.limit,
        page: request.page,
        many,
        is_root: true,
    };
    let output = resolver.resolve_frame(config, Vec::new(), input)?;

    Ok(ResolvedRequest {
        resource: request.resource.clone(),
        many,
        root: output.resolved,
        dst: output.dst,
    })
}

struct Resolver {
    allow_hidden: bool,
}

struct FrameInput {
    select_all: bool,
    items: Vec<SelectItem>,
    filter: Option<FilterTree>,
    search: Option<String>,
    order: Vec<OrderSpec>,
    limit: Option<u64>,
    page: Option<u64>,
    many: bool,
    is_root: bool,
}

struct FrameOutput {
    resolved: ResolvedResource,
    dst: DstNode,
    /// Columns this frame needs from join sources of its own config;
    /// the enclosing relation adds them to the join query.
    join_uses: IndexMap<String, SourceUse>,
}

/// Column and cast bookkeeping for one data source of a frame.
#[derive(Default)]
struct SourceUse {
    columns: IndexSet<String>,
    cast: HashMap<String, CastOptions>,
}

impl SourceUse {
    fn add(&mut self, column: &str, cast: &CastOptions) {
        self.columns.insert(column.to_string());
        self.cast.insert(column.to_string(), cast.clone());
    }

    /// Record the cast without projecting the column.
    fn add_cast(&mut self, column: &str, cast: &CastOptions) {
        self.cast.insert(column.to_string(), cast.clone());
    }
}

// ============================================================================
// Selection tree
// ============================================================================

#[derive(Default)]
struct Selection {
    entries: IndexMap<String, SelEntry>,
}

enum SelEntry {
    Leaf { internal: bool },
    Nested(Selection),
    Sub(SubSelection),
}

#[derive(Default)]
struct SubSelection {
    items: Vec<SelectItem>,
    select_all: bool,
    limit: Option<u64>,
    page: Option<u64>,
    order: Vec<OrderSpec>,
    internal: bool,
    selected: bool,
}

/// A leaf filter condition or a sub-filter marker, before column
/// translation.
enum PlannedCondition {
    Leaf {
        path: AttrPath,
        operator: FilterOperator,
        value: Value,
    },
    SubFilter {
        index: usize,
        sub_path: AttrPath,
    },
}

/// One pending key-collecting query.
struct SubFilterPlan {
    sub_path: AttrPath,
    remainder: AttrPath,
    operator: FilterOperator,
    value: Value,
}

impl Resolver {
    // ========================================================================
    // Frame resolution
    // ========================================================================

    fn resolve_frame(
        &self,
        config: &ResourceConfig,
        attr_path: AttrPath,
        input: FrameInput,
    ) -> Result<FrameOutput> {
        // Limits are only meaningful on collections.
        if !input.many && (input.limit.is_some() || input.page.is_some()) {
            return Err(Error::Request(format!(
                "\"{}\": limit and page are not allowed on single-valued resources",
                frame_name(&attr_path)
            )));
        }
        if input.page.is_some() && input.limit.is_none() {
            return Err(Error::Request(format!(
                "\"{}\": page requires an explicit limit",
                frame_name(&attr_path)
            )));
        }
        let limit = if input.many {
            match input.limit {
                Some(requested) => {
                    if let Some(max) = config.max_limit {
                        if requested > max {
                            return Err(Error::Request(format!(
                                "\"{}\": limit {requested} exceeds maxLimit {max}",
                                frame_name(&attr_path)
                            )));
                        }
                    }
                    Some(requested)
                }
                None => config
                    .default_limit
                    .or(input.is_root.then_some(ROOT_DEFAULT_LIMIT)),
            }
        } else {
            None
        };

        // Projection.
        let mut selection = Selection::default();
        let mut pending_depends: Vec<Select> = Vec::new();
        if input.select_all {
            self.select_all_leaves(&config.attributes, &mut selection, &mut pending_depends);
        }
        for item in &input.items {
            self.apply_item(config, &config.attributes, &mut selection, item, &[], false,
                &mut pending_depends)?;
        }
        while let Some(depends) = pending_depends.pop() {
            let mut queued = Vec::new();
            for item in &depends.items {
                self.apply_item(config, &config.attributes, &mut selection, item, &[], true,
                    &mut queued)?;
            }
            pending_depends.extend(queued);
        }

        // Search needs a source that can serve it.
        if input.search.is_some()
            && !config.data_sources.values().any(|d| d.searchable)
        {
            return Err(Error::Request(format!(
                "\"{}\": search is not supported",
                frame_name(&attr_path)
            )));
        }

        // Primary-source election.
        let primary_source = self.elect_primary(config, input.search.is_some());
        let primary_key_columns = config
            .resolved_primary_key
            .get(&primary_source)
            .cloned()
            .ok_or_else(|| {
                Error::Request(format!(
                    "\"{}\": primary key is not available in data source \"{primary_source}\"",
                    frame_name(&attr_path)
                ))
            })?;

        // Filter planning.
        let mut sub_filter_plans: Vec<SubFilterPlan> = Vec::new();
        let planned_filter = match &input.filter {
            Some(tree) => Some(self.plan_filter(config, tree, &mut sub_filter_plans)?),
            None => None,
        };

        // Attribute distribution and child frames.
        let mut uses: IndexMap<String, SourceUse> = IndexMap::new();
        uses.insert(primary_source.clone(), SourceUse::default());
        let mut join_uses: IndexMap<String, SourceUse> = IndexMap::new();
        let mut deferred: Vec<(String, DstNode)> = Vec::new();
        let children = self.build_children(
            config,
            &config.attributes,
            &selection,
            &attr_path,
            &[],
            &primary_source,
            &mut uses,
            &mut join_uses,
            &mut deferred,
        )?;

        // Sub-filter queries, in marker-index order.
        let mut sub_filters = Vec::with_capacity(sub_filter_plans.len());
        for plan in &sub_filter_plans {
            sub_filters.push(self.build_sub_filter(
                config,
                &attr_path,
                &primary_source,
                uses.get_mut(&primary_source).expect("primary use exists"),
                plan,
            )?);
        }

        // Order.
        let order_specs = if input.order.is_empty() {
            config.default_order.clone()
        } else {
            input.order.clone()
        };
        let mut order = Vec::with_capacity(order_specs.len());
        for spec in &order_specs {
            let leaf = lookup_leaf(config, &spec.attribute).ok_or_else(|| {
                Error::Request(format!(
                    "unknown order attribute \"{}\"",
                    attr_path_str(&spec.attribute)
                ))
            })?;
            if !leaf.allows_order(spec.direction) {
                return Err(Error::Request(format!(
                    "attribute \"{}\" cannot be ordered {}",
                    attr_path_str(&spec.attribute),
                    spec.direction
                )));
            }
            let column = leaf.column(&primary_source).ok_or_else(|| {
                Error::Request(format!(
                    "attribute \"{}\" cannot be ordered here",
                    attr_path_str(&spec.attribute)
                ))
            })?;
            order.push(SourceOrder {
                column: column.to_string(),
                direction: spec.direction,
            });
        }

        // Every used source fetches the primary key for joining.
        for (source, using) in uses.iter_mut() {
            let key_columns = config.resolved_primary_key.get(source).ok_or_else(|| {
                Error::Request(format!(
                    "\"{}\": primary key is not available in data source \"{source}\"",
                    frame_name(&attr_path)
                ))
            })?;
            for (path, column) in config.primary_key.iter().zip(key_columns) {
                let cast = lookup_leaf(config, path)
                    .map(|leaf| leaf.cast.clone())
                    .unwrap_or(CastOptions::new(crate::cast::LogicalType::String));
                using.add(column, &cast);
            }
        }

        // Main query.
        let filter = planned_filter
            .map(|planned| self.translate_filter(config, &primary_source, planned))
            .transpose()?;
        let descriptor = config
            .data_sources
            .get(&primary_source)
            .expect("primary source checked during election");
        let primary_use = uses
            .get(&primary_source)
            .expect("primary use inserted above");
        let mut main = DstNode {
            attr_path: attr_path.clone(),
            source: primary_source.clone(),
            query: SourceQuery {
                kind: descriptor.kind.clone(),
                attributes: primary_use.columns.iter().cloned().collect(),
                filter,
                search: input.search.clone(),
                order,
                limit,
                limit_per: None,
                page: input.page,
                options: descriptor.options.clone(),
                prepared: descriptor.prepared.clone(),
            },
            cast_options: primary_use.cast.clone(),
            parent_key: None,
            child_key: None,
            multi_valued_parent_key: false,
            unique_child_key: false,
            sub_filters,
            sub_requests: Vec::new(),
        };

        // Secondary queries join back over the primary key.
        let mut secondary_sources = Vec::new();
        for (source, using) in &uses {
            if source == &primary_source {
                continue;
            }
            secondary_sources.push(source.clone());
            let descriptor = config
                .data_sources
                .get(source)
                .expect("uses only reference declared sources");
            let secondary_key = config
                .resolved_primary_key
                .get(source)
                .expect("checked while adding key columns")
                .clone();
            main.sub_requests.push(DstNode {
                attr_path: attr_path.clone(),
                source: source.clone(),
                query: SourceQuery {
                    kind: descriptor.kind.clone(),
                    attributes: using.columns.iter().cloned().collect(),
                    filter: Some(SourceFilter::single(SourceCondition {
                        attribute: filter_key(&secondary_key),
                        operator: FilterOperator::Equal,
                        value: SourceValue::FromParentKey,
                    })),
                    search: None,
                    order: Vec::new(),
                    limit: None,
                    limit_per: None,
                    page: None,
                    options: descriptor.options.clone(),
                    prepared: descriptor.prepared.clone(),
                },
                cast_options: using.cast.clone(),
                parent_key: Some(primary_key_columns.clone()),
                child_key: Some(secondary_key),
                multi_valued_parent_key: false,
                unique_child_key: true,
                sub_filters: Vec::new(),
                sub_requests: Vec::new(),
            });
        }

        // Child frames attach under whichever node carries their
        // parent-key columns.
        for (source, node) in deferred {
            if source == primary_source {
                main.sub_requests.push(node);
            } else {
                let carrier = main
                    .sub_requests
                    .iter_mut()
                    .find(|candidate| candidate.source == source)
                    .ok_or_else(|| {
                        Error::Implementation(format!(
                            "\"{}\": no query for data source \"{source}\" to attach a relation to",
                            frame_name(&attr_path)
                        ))
                    })?;
                carrier.sub_requests.push(node);
            }
        }

        Ok(FrameOutput {
            resolved: ResolvedResource {
                attr_path,
                primary_source,
                primary_key_columns,
                secondary_sources,
                children,
            },
            dst: main,
            join_uses,
        })
    }

    fn elect_primary(&self, config: &ResourceConfig, search: bool) -> String {
        let conventional = config.default_primary_source();
        if search {
            let default_searches = config
                .data_sources
                .get(conventional)
                .is_some_and(|d| d.searchable);
            if !default_searches {
                if let Some((name, _)) =
                    config.data_sources.iter().find(|(_, d)| d.searchable)
                {
                    return name.clone();
                }
            }
        }
        conventional.to_string()
    }

    // ========================================================================
    // Projection walk
    // ========================================================================

    fn select_all_leaves(
        &self,
        attrs: &IndexMap<String, AttributeNode>,
        selection: &mut Selection,
        pending_depends: &mut Vec<Select>,
    ) {
        for (name, node) in attrs {
            if node.is_hidden() && !self.allow_hidden {
                continue;
            }
            match node {
                AttributeNode::Leaf(leaf) => {
                    if !selection.entries.contains_key(name) {
                        if let Some(depends) = &leaf.depends {
                            pending_depends.push(depends.clone());
                        }
                        selection
                            .entries
                            .insert(name.clone(), SelEntry::Leaf { internal: false });
                    }
                }
                AttributeNode::Nested(nested) => {
                    let entry = selection
                        .entries
                        .entry(name.clone())
                        .or_insert_with(|| SelEntry::Nested(Selection::default()));
                    if let SelEntry::Nested(inner) = entry {
                        self.select_all_leaves(&nested.attributes, inner, pending_depends);
                    }
                }
                // Relations are never selected implicitly.
                AttributeNode::SubResource(_) => {}
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_item(
        &self,
        config: &ResourceConfig,
        attrs: &IndexMap<String, AttributeNode>,
        selection: &mut Selection,
        item: &SelectItem,
        prefix: &[String],
        internal: bool,
        pending_depends: &mut Vec<Select>,
    ) -> Result<()> {
        let (segment, rest) = item
            .path
            .split_first()
            .ok_or_else(|| Error::Request("empty select path".into()))?;
        let mut walked = prefix.to_vec();
        walked.push(segment.clone());

        let node = attrs.get(segment).ok_or_else(|| {
            Error::Request(format!("unknown attribute \"{}\"", walked.join(".")))
        })?;
        if node.is_hidden() && !internal && !self.allow_hidden {
            return Err(Error::Request(format!(
                "hidden attribute \"{}\" cannot be selected",
                walked.join(".")
            )));
        }
        if node.is_deprecated() {
            warn!(attribute = %walked.join("."), "deprecated attribute selected");
        }

        match node {
            AttributeNode::Leaf(leaf) => {
                if !rest.is_empty() || item.children.is_some() {
                    return Err(Error::Request(format!(
                        "attribute \"{}\" has no sub-attributes",
                        walked.join(".")
                    )));
                }
                if !item.options.is_empty() {
                    return Err(Error::Request(format!(
                        "attribute \"{}\" does not accept options",
                        walked.join(".")
                    )));
                }
                match selection.entries.get_mut(segment) {
                    Some(SelEntry::Leaf {
                        internal: existing,
                    }) => *existing = *existing && internal,
                    Some(_) => {
                        return Err(Error::Request(format!(
                            "attribute \"{}\" selected twice with different shapes",
                            walked.join(".")
                        )))
                    }
                    None => {
                        if let Some(depends) = &leaf.depends {
                            pending_depends.push(depends.clone());
                        }
                        selection
                            .entries
                            .insert(segment.clone(), SelEntry::Leaf { internal });
                    }
                }
            }
            AttributeNode::Nested(nested) => {
                let entry = selection
                    .entries
                    .entry(segment.clone())
                    .or_insert_with(|| SelEntry::Nested(Selection::default()));
                let SelEntry::Nested(inner) = entry else {
                    return Err(Error::Request(format!(
                        "attribute \"{}\" selected twice with different shapes",
                        walked.join(".")
                    )));
                };
                if rest.is_empty() {
                    if !item.options.is_empty() {
                        return Err(Error::Request(format!(
                            "attribute \"{}\" does not accept options",
                            walked.join(".")
                        )));
                    }
                    match &item.children {
                        Some(children) => {
                            for child in &children.items {
                                self.apply_item(
                                    config,
                                    &nested.attributes,
                                    inner,
                                    child,
                                    &walked,
                                    internal,
                                    pending_depends,
                                )?;
                            }
                        }
                        None => {
                            self.select_all_leaves(&nested.attributes, inner, pending_depends)
                        }
                    }
                } else {
                    let descendant = SelectItem {
                        path: rest.to_vec(),
                        options: item.options.clone(),
                        children: item.children.clone(),
                    };
                    self.apply_item(
                        config,
                        &nested.attributes,
                        inner,
                        &descendant,
                        &walked,
                        internal,
                        pending_depends,
                    )?;
                }
            }
            AttributeNode::SubResource(_) => {
                let entry = selection
                    .entries
                    .entry(segment.clone())
                    .or_insert_with(|| SelEntry::Sub(SubSelection::default()));
                let SelEntry::Sub(sub) = entry else {
                    return Err(Error::Request(format!(
                        "attribute \"{}\" selected twice with different shapes",
                        walked.join(".")
                    )));
                };
                if sub.selected {
                    sub.internal = sub.internal && internal;
                } else {
                    sub.internal = internal;
                    sub.selected = true;
                }
                if rest.is_empty() {
                    if let Some(limit) = item.options.limit {
                        sub.limit = Some(limit);
                    }
                    if let Some(page) = item.options.page {
                        sub.page = Some(page);
                    }
                    sub.order.extend(item.options.order.iter().cloned());
                    match &item.children {
                        Some(children) => sub.items.extend(children.items.iter().cloned()),
                        None => sub.select_all = true,
                    }
                } else {
                    sub.items.push(SelectItem {
                        path: rest.to_vec(),
                        options: item.options.clone(),
                        children: item.children.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Children and child frames
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn build_children(
        &self,
        config: &ResourceConfig,
        attrs: &IndexMap<String, AttributeNode>,
        selection: &Selection,
        attr_path: &[String],
        prefix: &[String],
        primary_source: &str,
        uses: &mut IndexMap<String, SourceUse>,
        join_uses: &mut IndexMap<String, SourceUse>,
        deferred: &mut Vec<(String, DstNode)>,
    ) -> Result<Vec<ResolvedChild>> {
        let mut children = Vec::with_capacity(selection.entries.len());
        for (name, entry) in &selection.entries {
            let node = attrs
                .get(name)
                .expect("selection entries are validated against the config");
            let mut here = prefix.to_vec();
            here.push(name.clone());
            match (entry, node) {
                (SelEntry::Leaf { internal }, AttributeNode::Leaf(leaf)) => {
                    children.push(ResolvedChild::Leaf(self.resolve_leaf(
                        config,
                        name,
                        leaf,
                        *internal,
                        &here,
                        primary_source,
                        uses,
                        join_uses,
                    )?));
                }
                (SelEntry::Nested(inner), AttributeNode::Nested(nested)) => {
                    children.push(ResolvedChild::Nested {
                        name: name.clone(),
                        hidden: nested.hidden,
                        children: self.build_children(
                            config,
                            &nested.attributes,
                            inner,
                            attr_path,
                            &here,
                            primary_source,
                            uses,
                            join_uses,
                            deferred,
                        )?,
                    });
                }
                (SelEntry::Sub(sub_sel), AttributeNode::SubResource(sub)) => {
                    children.push(ResolvedChild::Sub(self.resolve_sub_resource(
                        config,
                        name,
                        sub,
                        sub_sel,
                        attr_path,
                        &here,
                        primary_source,
                        uses,
                        deferred,
                    )?));
                }
                _ => {
                    return Err(Error::Implementation(format!(
                        "selection shape diverged from config at \"{}\"",
                        here.join(".")
                    )))
                }
            }
        }
        Ok(children)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_leaf(
        &self,
        config: &ResourceConfig,
        name: &str,
        leaf: &LeafAttribute,
        internal: bool,
        here: &[String],
        primary_source: &str,
        uses: &mut IndexMap<String, SourceUse>,
        join_uses: &mut IndexMap<String, SourceUse>,
    ) -> Result<ResolvedLeaf> {
        if let Some(value) = &leaf.value {
            return Ok(ResolvedLeaf {
                name: name.to_string(),
                internal,
                value: Some(value.clone()),
                source: None,
                column: None,
                cast: leaf.cast.clone(),
            });
        }

        // Prefer the frame's primary source, then declaration order.
        let (source, column) = if let Some(column) = leaf.column(primary_source) {
            (primary_source.to_string(), column.to_string())
        } else {
            config
                .data_sources
                .keys()
                .find_map(|candidate| {
                    leaf.column(candidate)
                        .map(|col| (candidate.clone(), col.to_string()))
                })
                .ok_or_else(|| {
                    Error::Implementation(format!(
                        "attribute \"{}\" has no usable mapping",
                        here.join(".")
                    ))
                })?
        };

        let is_join = config
            .data_sources
            .get(&source)
            .is_some_and(|d| d.is_join);
        let target = if is_join { &mut *join_uses } else { &mut *uses };
        target
            .entry(source.clone())
            .or_default()
            .add(&column, &leaf.cast);

        Ok(ResolvedLeaf {
            name: name.to_string(),
            internal,
            value: None,
            source: Some(source),
            column: Some(column),
            cast: leaf.cast.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_sub_resource(
        &self,
        config: &ResourceConfig,
        name: &str,
        sub: &SubResourceAttribute,
        sub_sel: &SubSelection,
        attr_path: &[String],
        here: &[String],
        primary_source: &str,
        uses: &mut IndexMap<String, SourceUse>,
        deferred: &mut Vec<(String, DstNode)>,
    ) -> Result<ResolvedSubResource> {
        let mut child_path = attr_path.to_vec();
        child_path.extend(here.iter().cloned());

        let child_input = FrameInput {
            select_all: sub_sel.select_all || sub_sel.items.is_empty(),
            items: sub_sel.items.clone(),
            filter: None,
            search: None,
            order: sub_sel.order.clone(),
            limit: sub_sel.limit,
            page: sub_sel.page,
            many: sub.many,
            is_root: false,
        };
        let mut child = self.resolve_frame(&sub.config, child_path, child_input)?;

        // Parent side: one source must cover every key column.
        let parent_key_source = if sub.resolved_parent_key.contains_key(primary_source) {
            primary_source.to_string()
        } else {
            config
                .data_sources
                .keys()
                .find(|candidate| sub.resolved_parent_key.contains_key(*candidate))
                .cloned()
                .ok_or_else(|| {
                    Error::Implementation(format!(
                        "relation \"{}\": parent key is not available in any data source",
                        here.join(".")
                    ))
                })?
        };
        let parent_key_columns = sub.resolved_parent_key[&parent_key_source].clone();
        {
            let using = uses.entry(parent_key_source.clone()).or_default();
            for (path, column) in sub.parent_key.iter().zip(&parent_key_columns) {
                let cast = lookup_leaf(config, path)
                    .map(|leaf| leaf.cast.clone())
                    .unwrap_or(CastOptions::new(crate::cast::LogicalType::String));
                using.add(column, &cast);
            }
        }

        // Child side: the child's elected primary must carry the key.
        let child_primary = child.dst.source.clone();
        let child_key_columns = sub
            .resolved_child_key
            .get(&child_primary)
            .cloned()
            .ok_or_else(|| {
                Error::Request(format!(
                    "relation \"{}\" cannot be joined through data source \"{child_primary}\"",
                    here.join(".")
                ))
            })?;
        ensure_columns(&mut child.dst, &sub.config, &sub.child_key, &child_key_columns);

        let join = match &sub.join_via {
            Some(join_name) => Some(self.build_join_node(
                sub,
                join_name,
                &mut child,
                &parent_key_columns,
                &child_key_columns,
            )?),
            None => {
                add_and_condition(
                    &mut child.dst.query.filter,
                    SourceCondition {
                        attribute: filter_key(&child_key_columns),
                        operator: FilterOperator::Equal,
                        value: SourceValue::FromParentKey,
                    },
                );
                child.dst.parent_key = Some(parent_key_columns.clone());
                child.dst.child_key = Some(child_key_columns.clone());
                child.dst.multi_valued_parent_key = sub.multi_valued_parent_key;
                child.dst.unique_child_key = sub.unique_child_key;
                if sub.many && child.dst.query.limit.is_some() {
                    child.dst.query.limit_per = Some(child_key_columns.clone());
                }
                None
            }
        };

        let child_node = match join {
            Some((join_node, resolved_join)) => {
                deferred.push((parent_key_source.clone(), join_node));
                Some(resolved_join)
            }
            None => {
                let node = std::mem::replace(&mut child.dst, placeholder_node());
                deferred.push((parent_key_source.clone(), node));
                None
            }
        };

        Ok(ResolvedSubResource {
            name: name.to_string(),
            internal: sub_sel.internal,
            many: sub.many,
            parent_key_columns,
            parent_key_source,
            multi_valued_parent_key: sub.multi_valued_parent_key,
            unique_child_key: sub.unique_child_key,
            join: child_node,
            resource: child.resolved,
        })
    }

    /// Wrap a child frame behind its join-table hop.
    fn build_join_node(
        &self,
        sub: &SubResourceAttribute,
        join_name: &str,
        child: &mut FrameOutput,
        parent_key_columns: &[String],
        child_key_columns: &[String],
    ) -> Result<(DstNode, ResolvedJoin)> {
        let descriptor = sub.config.data_sources.get(join_name).ok_or_else(|| {
            Error::Implementation(format!(
                "relation \"{}\": join data source \"{join_name}\" is missing",
                sub.config.name
            ))
        })?;
        let join_parent = descriptor
            .resolved_join_parent_key
            .clone()
            .ok_or_else(|| {
                Error::Implementation(format!(
                    "relation \"{}\": joinParentKey was not resolved",
                    sub.config.name
                ))
            })?;
        let join_child = descriptor
            .resolved_join_child_key
            .clone()
            .ok_or_else(|| {
                Error::Implementation(format!(
                    "relation \"{}\": joinChildKey was not resolved",
                    sub.config.name
                ))
            })?;

        // The join query fetches both key sides plus whatever
        // attributes map onto the join row.
        let mut using = SourceUse::default();
        let key_paths = descriptor
            .join_parent_key
            .iter()
            .flatten()
            .chain(descriptor.join_child_key.iter().flatten());
        let key_columns = join_parent.iter().chain(join_child.iter());
        for (path, column) in key_paths.zip(key_columns) {
            let cast = sub
                .config
                .leaf(path)
                .map(|leaf| leaf.cast.clone())
                .unwrap_or(CastOptions::new(crate::cast::LogicalType::String));
            using.add(column, &cast);
        }
        if let Some(extra) = child.join_uses.shift_remove(join_name) {
            for column in &extra.columns {
                using.columns.insert(column.clone());
            }
            using.cast.extend(extra.cast);
        }

        let join_node = DstNode {
            attr_path: child.dst.attr_path.clone(),
            source: join_name.to_string(),
            query: SourceQuery {
                kind: descriptor.kind.clone(),
                attributes: using.columns.iter().cloned().collect(),
                filter: Some(SourceFilter::single(SourceCondition {
                    attribute: filter_key(&join_parent),
                    operator: FilterOperator::Equal,
                    value: SourceValue::FromParentKey,
                })),
                search: None,
                order: Vec::new(),
                limit: None,
                limit_per: None,
                page: None,
                options: descriptor.options.clone(),
                prepared: descriptor.prepared.clone(),
            },
            cast_options: using.cast.clone(),
            parent_key: Some(parent_key_columns.to_vec()),
            child_key: Some(join_parent.clone()),
            multi_valued_parent_key: sub.multi_valued_parent_key,
            unique_child_key: false,
            sub_filters: Vec::new(),
            sub_requests: Vec::new(),
        };

        // The child query hangs off the join rows.
        add_and_condition(
            &mut child.dst.query.filter,
            SourceCondition {
                attribute: filter_key(child_key_columns),
                operator: FilterOperator::Equal,
                value: SourceValue::FromParentKey,
            },
        );
        child.dst.parent_key = Some(join_child.clone());
        child.dst.child_key = Some(child_key_columns.to_vec());
        child.dst.unique_child_key = sub.unique_child_key;

        let mut join_node = join_node;
        let inner = std::mem::replace(&mut child.dst, placeholder_node());
        join_node.sub_requests.push(inner);

        Ok((
            join_node,
            ResolvedJoin {
                source: join_name.to_string(),
                parent_columns: join_parent,
                child_columns: join_child,
            },
        ))
    }

    // ========================================================================
    // Filters
    // ========================================================================

    fn plan_filter(
        &self,
        config: &ResourceConfig,
        tree: &FilterTree,
        plans: &mut Vec<SubFilterPlan>,
    ) -> Result<Vec<Vec<PlannedCondition>>> {
        let mut planned = Vec::with_capacity(tree.0.len());
        for branch in &tree.0 {
            let mut conditions = Vec::with_capacity(branch.len());
            for part in branch {
                conditions.push(self.plan_filter_part(
                    config,
                    &part.attribute,
                    part.operator,
                    &part.value,
                    plans,
                )?);
            }
            planned.push(conditions);
        }
        Ok(planned)
    }

    fn plan_filter_part(
        &self,
        config: &ResourceConfig,
        attribute: &[String],
        operator: FilterOperator,
        value: &Value,
        plans: &mut Vec<SubFilterPlan>,
    ) -> Result<PlannedCondition> {
        // Walk the path; crossing a relation turns the condition into
        // a sub-filter.
        let mut attrs = &config.attributes;
        for (index, segment) in attribute.iter().enumerate() {
            let node = attrs.get(segment).ok_or_else(|| {
                Error::Request(format!(
                    "unknown filter attribute \"{}\"",
                    attr_path_str(attribute)
                ))
            })?;
            match node {
                AttributeNode::Leaf(leaf) => {
                    if index + 1 != attribute.len() {
                        return Err(Error::Request(format!(
                            "unknown filter attribute \"{}\"",
                            attr_path_str(attribute)
                        )));
                    }
                    if !leaf.allows_filter(operator) {
                        return Err(Error::Request(format!(
                            "attribute \"{}\" is not filterable with operator {operator}",
                            attr_path_str(attribute)
                        )));
                    }
                    return Ok(PlannedCondition::Leaf {
                        path: attribute.to_vec(),
                        operator,
                        value: value.clone(),
                    });
                }
                AttributeNode::Nested(nested) => {
                    attrs = &nested.attributes;
                }
                AttributeNode::SubResource(_) => {
                    let sub_path = attribute[..=index].to_vec();
                    let remainder = attribute[index + 1..].to_vec();
                    return self.plan_cross_filter(
                        config, attribute, sub_path, remainder, operator, value, plans,
                    );
                }
            }
        }
        Err(Error::Request(format!(
            "unknown filter attribute \"{}\"",
            attr_path_str(attribute)
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_cross_filter(
        &self,
        config: &ResourceConfig,
        attribute: &[String],
        sub_path: AttrPath,
        remainder: AttrPath,
        operator: FilterOperator,
        value: &Value,
        plans: &mut Vec<SubFilterPlan>,
    ) -> Result<PlannedCondition> {
        let spec = config
            .sub_filters
            .iter()
            .find(|candidate| candidate.attribute == attribute)
            .ok_or_else(|| {
                Error::Request(format!(
                    "cannot filter by \"{}\"",
                    attr_path_str(attribute)
                ))
            })?;

        if let Some(rewrite) = &spec.rewrite_to {
            // The sub-filter is served by a plain attribute instead.
            return self.plan_filter_part(config, rewrite, operator, value, plans);
        }

        if !spec.operators.contains(&operator) {
            return Err(Error::Request(format!(
                "attribute \"{}\" is not filterable with operator {operator}",
                attr_path_str(attribute)
            )));
        }
        if remainder.is_empty() {
            return Err(Error::Request(format!(
                "cannot filter by \"{}\"",
                attr_path_str(attribute)
            )));
        }

        let index = plans.len();
        plans.push(SubFilterPlan {
            sub_path: sub_path.clone(),
            remainder,
            operator,
            value: value.clone(),
        });
        Ok(PlannedCondition::SubFilter { index, sub_path })
    }

    fn translate_filter(
        &self,
        config: &ResourceConfig,
        primary_source: &str,
        planned: Vec<Vec<PlannedCondition>>,
    ) -> Result<SourceFilter> {
        let mut branches = Vec::with_capacity(planned.len());
        for branch in planned {
            let mut conditions = Vec::with_capacity(branch.len());
            for condition in branch {
                conditions.push(match condition {
                    PlannedCondition::Leaf {
                        path,
                        operator,
                        value,
                    } => {
                        let leaf = lookup_leaf(config, &path)
                            .expect("planned filters reference existing leaves");
                        let column = leaf.column(primary_source).ok_or_else(|| {
                            Error::Request(format!(
                                "attribute \"{}\" cannot be filtered here",
                                attr_path_str(&path)
                            ))
                        })?;
                        SourceCondition {
                            attribute: FilterKey::Column(column.to_string()),
                            operator,
                            value: SourceValue::Plain(value),
                        }
                    }
                    PlannedCondition::SubFilter { index, sub_path } => {
                        let sub = lookup_sub(config, &sub_path)
                            .expect("planned sub-filters reference existing relations");
                        let parent_columns = sub
                            .resolved_parent_key
                            .get(primary_source)
                            .ok_or_else(|| {
                                Error::Request(format!(
                                    "cannot filter by \"{}\" here",
                                    sub_path.join(".")
                                ))
                            })?;
                        SourceCondition {
                            attribute: filter_key(parent_columns),
                            operator: FilterOperator::Equal,
                            value: SourceValue::FromSubFilter(index),
                        }
                    }
                });
            }
            branches.push(conditions);
        }
        Ok(SourceFilter(branches))
    }

    /// Build the key-collecting query for one cross-resource filter.
    fn build_sub_filter(
        &self,
        config: &ResourceConfig,
        attr_path: &[String],
        primary_source: &str,
        primary_use: &mut SourceUse,
        plan: &SubFilterPlan,
    ) -> Result<DstNode> {
        let sub = lookup_sub(config, &plan.sub_path).ok_or_else(|| {
            Error::Request(format!("cannot filter by \"{}\"", plan.sub_path.join(".")))
        })?;

        // The substituted condition compares the frame's parent-key
        // columns; remember their casts for the substitution step.
        let parent_columns = sub
            .resolved_parent_key
            .get(primary_source)
            .ok_or_else(|| {
                Error::Request(format!(
                    "cannot filter by \"{}\" here",
                    plan.sub_path.join(".")
                ))
            })?;
        for (path, column) in sub.parent_key.iter().zip(parent_columns) {
            if let Some(leaf) = lookup_leaf(config, path) {
                primary_use.add_cast(column, &leaf.cast);
            }
        }

        let child_primary = sub.config.default_primary_source().to_string();
        let child_key_columns = sub
            .resolved_child_key
            .get(&child_primary)
            .cloned()
            .ok_or_else(|| {
                Error::Request(format!(
                    "cannot filter by \"{}\" here",
                    plan.sub_path.join(".")
                ))
            })?;

        let target_leaf = match sub.config.attribute(&plan.remainder) {
            Some(AttributeNode::Leaf(leaf)) => leaf,
            _ => {
                return Err(Error::Request(format!(
                    "cannot filter by \"{}.{}\"",
                    plan.sub_path.join("."),
                    attr_path_str(&plan.remainder)
                )))
            }
        };
        let target_column = target_leaf.column(&child_primary).ok_or_else(|| {
            Error::Request(format!(
                "cannot filter by \"{}.{}\"",
                plan.sub_path.join("."),
                attr_path_str(&plan.remainder)
            ))
        })?;

        let mut child_path = attr_path.to_vec();
        child_path.extend(plan.sub_path.iter().cloned());

        let descriptor = sub
            .config
            .data_sources
            .get(&child_primary)
            .ok_or_else(|| {
                Error::Implementation(format!(
                    "relation \"{}\": missing data source \"{child_primary}\"",
                    sub.config.name
                ))
            })?;
        let mut using = SourceUse::default();
        for (path, column) in sub.child_key.iter().zip(&child_key_columns) {
            let cast = sub
                .config
                .leaf(path)
                .map(|leaf| leaf.cast.clone())
                .unwrap_or(CastOptions::new(crate::cast::LogicalType::String));
            using.add(column, &cast);
        }
        using.add_cast(target_column, &target_leaf.cast);

        let target_node = DstNode {
            attr_path: child_path.clone(),
            source: child_primary.clone(),
            query: SourceQuery {
                kind: descriptor.kind.clone(),
                attributes: using.columns.iter().cloned().collect(),
                filter: Some(SourceFilter::single(SourceCondition {
                    attribute: FilterKey::Column(target_column.to_string()),
                    operator: plan.operator,
                    value: SourceValue::Plain(plan.value.clone()),
                })),
                search: None,
                order: Vec::new(),
                limit: None,
                limit_per: None,
                page: None,
                options: descriptor.options.clone(),
                prepared: descriptor.prepared.clone(),
            },
            cast_options: using.cast.clone(),
            parent_key: None,
            child_key: Some(child_key_columns),
            multi_valued_parent_key: false,
            unique_child_key: false,
            sub_filters: Vec::new(),
            sub_requests: Vec::new(),
        };

        // m:n relations collect keys through the join table, a
        // two-level chain.
        if let Some(join_name) = &sub.join_via {
            let join_descriptor = sub.config.data_sources.get(join_name).ok_or_else(|| {
                Error::Implementation(format!(
                    "relation \"{}\": join data source \"{join_name}\" is missing",
                    sub.config.name
                ))
            })?;
            let join_parent = join_descriptor
                .resolved_join_parent_key
                .clone()
                .unwrap_or_default();
            let join_child = join_descriptor
                .resolved_join_child_key
                .clone()
                .unwrap_or_default();

            let mut join_use = SourceUse::default();
            let key_paths = join_descriptor
                .join_parent_key
                .iter()
                .flatten()
                .chain(join_descriptor.join_child_key.iter().flatten());
            for (path, column) in key_paths.zip(join_parent.iter().chain(join_child.iter())) {
                let cast = sub
                    .config
                    .leaf(path)
                    .map(|leaf| leaf.cast.clone())
                    .unwrap_or(CastOptions::new(crate::cast::LogicalType::String));
                join_use.add(column, &cast);
            }

            return Ok(DstNode {
                attr_path: child_path,
                source: join_name.clone(),
                query: SourceQuery {
                    kind: join_descriptor.kind.clone(),
                    attributes: join_use.columns.iter().cloned().collect(),
                    filter: Some(SourceFilter::single(SourceCondition {
                        attribute: filter_key(&join_child),
                        operator: FilterOperator::Equal,
                        value: SourceValue::FromSubFilter(0),
                    })),
                    search: None,
                    order: Vec::new(),
                    limit: None,
                    limit_per: None,
                    page: None,
                    options: join_descriptor.options.clone(),
                    prepared: join_descriptor.prepared.clone(),
                },
                cast_options: join_use.cast.clone(),
                parent_key: None,
                child_key: Some(join_parent),
                multi_valued_parent_key: false,
                unique_child_key: false,
                sub_filters: vec![target_node],
                sub_requests: Vec::new(),
            });
        }

        Ok(target_node)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn frame_name(attr_path: &[String]) -> String {
    if attr_path.is_empty() {
        "root".to_string()
    } else {
        attr_path.join(".")
    }
}

fn filter_key(columns: &[String]) -> FilterKey {
    if columns.len() == 1 {
        FilterKey::Column(columns[0].clone())
    } else {
        FilterKey::Composite(columns.to_vec())
    }
}

fn lookup_leaf<'a>(config: &'a ResourceConfig, path: &[String]) -> Option<&'a LeafAttribute> {
    config.leaf(path)
}

fn lookup_sub<'a>(
    config: &'a ResourceConfig,
    path: &[String],
) -> Option<&'a SubResourceAttribute> {
    match config.attribute(path)? {
        AttributeNode::SubResource(sub) => Some(sub),
        _ => None,
    }
}

/// Append a condition to every OR branch (creating one if none).
fn add_and_condition(filter: &mut Option<SourceFilter>, condition: SourceCondition) {
    match filter {
        Some(existing) if !existing.0.is_empty() => {
            for branch in existing.0.iter_mut() {
                branch.push(condition.clone());
            }
        }
        _ => *filter = Some(SourceFilter::single(condition)),
    }
}

/// Make sure key columns are fetched and cast-known on a child node.
fn ensure_columns(
    node: &mut DstNode,
    config: &ResourceConfig,
    key_paths: &[AttrPath],
    columns: &[String],
) {
    for (path, column) in key_paths.iter().zip(columns) {
        if !node.query.attributes.iter().any(|c| c == column) {
            node.query.attributes.push(column.clone());
        }
        if let Some(leaf) = config.leaf(path) {
            node.cast_options
                .entry(column.clone())
                .or_insert_with(|| leaf.cast.clone());
        }
    }
}

fn placeholder_node() -> DstNode {
    DstNode {
        attr_path: Vec::new(),
        source: String::new(),
        query: SourceQuery::new(""),
        cast_options: HashMap::new(),
        parent_key: None,
        child_key: None,
        multi_valued_parent_key: false,
        unique_child_key: false,
        sub_filters: Vec::new(),
        sub_requests: Vec::new(),
    }
}
