//! The select-tree syntax.
//!
//! A projection is a comma-separated list of items; every item is a
//! dotted attribute path, optionally followed by per-node options in
//! parentheses and a bracketed child projection:
//!
//! ```text
//! id,title,author[name],comments(limit=5,order=ts:desc)[content,author[name]]
//! ```

use nom::{
    branch::alt,
    bytes::complete::{is_not, take_while1},
    character::complete::{char, digit1, multispace0},
    combinator::{all_consuming, map, opt},
    multi::separated_list1,
    sequence::{delimited, preceded},
    IResult,
};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_attr_path, AttrPath, OrderDirection, OrderSpec};
use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// A projection tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Select {
    pub items: Vec<SelectItem>,
}

impl Select {
    /// Parse the select syntax.
    pub fn parse(input: &str) -> Result<Self> {
        let (_, items) = all_consuming(select_list)(input).map_err(|err| {
            let position = match &err {
                nom::Err::Error(e) | nom::Err::Failure(e) => input.len() - e.input.len(),
                nom::Err::Incomplete(_) => input.len(),
            };
            Error::Request(format!("invalid select syntax at position {position}"))
        })?;
        Ok(Self { items })
    }

    /// A flat projection of plain fields, mostly for tests and config
    /// `depends` declarations.
    pub fn fields<const N: usize>(names: [&str; N]) -> Self {
        Self {
            items: names.into_iter().map(SelectItem::field).collect(),
        }
    }

    pub fn push(&mut self, item: SelectItem) {
        self.items.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// One projection item.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SelectItem {
    pub path: AttrPath,
    pub options: SelectItemOptions,
    pub children: Option<Select>,
}

impl SelectItem {
    pub fn field(path: &str) -> Self {
        Self {
            path: parse_attr_path(path),
            options: SelectItemOptions::default(),
            children: None,
        }
    }

    pub fn with_children(path: &str, children: Select) -> Self {
        Self {
            path: parse_attr_path(path),
            options: SelectItemOptions::default(),
            children: Some(children),
        }
    }

    pub fn with_options(mut self, options: SelectItemOptions) -> Self {
        self.options = options;
        self
    }
}

/// Per-node projection options.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SelectItemOptions {
    pub limit: Option<u64>,
    pub page: Option<u64>,
    pub order: Vec<OrderSpec>,
}

impl SelectItemOptions {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.page.is_none() && self.order.is_empty()
    }
}

// ============================================================================
// Grammar
// ============================================================================

enum ItemOption {
    Limit(u64),
    Page(u64),
    Order(OrderSpec),
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn attr_path(input: &str) -> IResult<&str, AttrPath> {
    map(separated_list1(char('.'), ident), |segments| {
        segments.into_iter().map(str::to_string).collect()
    })(input)
}

fn integer(input: &str) -> IResult<&str, u64> {
    let (input, digits) = digit1(input)?;
    match digits.parse() {
        Ok(n) => Ok((input, n)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Digit,
        ))),
    }
}

fn limit_option(input: &str) -> IResult<&str, ItemOption> {
    map(preceded(ws(nom::bytes::complete::tag("limit=")), integer), ItemOption::Limit)(input)
}

fn page_option(input: &str) -> IResult<&str, ItemOption> {
    map(preceded(ws(nom::bytes::complete::tag("page=")), integer), ItemOption::Page)(input)
}

fn order_option(input: &str) -> IResult<&str, ItemOption> {
    let (input, term) = preceded(ws(nom::bytes::complete::tag("order=")), is_not(",)"))(input)?;
    let (attr, dir) = term.split_once(':').unwrap_or((term, "asc"));
    let direction: OrderDirection = dir.trim().parse().map_err(|_| {
        nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Tag))
    })?;
    Ok((
        input,
        ItemOption::Order(OrderSpec {
            attribute: parse_attr_path(attr.trim()),
            direction,
        }),
    ))
}

fn item_options(input: &str) -> IResult<&str, SelectItemOptions> {
    let (input, raw) = delimited(
        char('('),
        separated_list1(char(','), alt((limit_option, page_option, order_option))),
        char(')'),
    )(input)?;
    let mut options = SelectItemOptions::default();
    for entry in raw {
        match entry {
            ItemOption::Limit(n) => options.limit = Some(n),
            ItemOption::Page(n) => options.page = Some(n),
            ItemOption::Order(spec) => options.order.push(spec),
        }
    }
    Ok((input, options))
}

fn select_item(input: &str) -> IResult<&str, SelectItem> {
    let (input, path) = ws(attr_path)(input)?;
    let (input, options) = opt(item_options)(input)?;
    let (input, children) = opt(delimited(ws(char('[')), select_list, ws(char(']'))))(input)?;
    Ok((
        input,
        SelectItem {
            path,
            options: options.unwrap_or_default(),
            children: children.map(|items| Select { items }),
        },
    ))
}

fn select_list(input: &str) -> IResult<&str, Vec<SelectItem>> {
    separated_list1(ws(char(',')), select_item)(input)
}

// ============================================================================
// Serde
// ============================================================================

/// A select deserializes from its string syntax or a structured tree
/// (list of path strings or `{path, limit, page, order, select}`
/// objects).
impl<'de> Deserialize<'de> for Select {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        select_from_value(&value).map_err(de::Error::custom)
    }
}

fn select_from_value(value: &Value) -> Result<Select> {
    match value {
        Value::String(s) => Select::parse(s),
        Value::Array(entries) => {
            let mut select = Select::default();
            for entry in entries {
                select.push(item_from_value(entry)?);
            }
            Ok(select)
        }
        other => Err(Error::Request(format!("invalid select value {other}"))),
    }
}

fn item_from_value(value: &Value) -> Result<SelectItem> {
    match value {
        Value::String(s) => {
            let parsed = Select::parse(s)?;
            parsed
                .items
                .into_iter()
                .next()
                .ok_or_else(|| Error::Request("empty select item".into()))
        }
        Value::Object(entry) => {
            let path = entry
                .get("path")
                .or_else(|| entry.get("attribute"))
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Request("select item requires a path".into()))?;
            let mut item = SelectItem::field(path);
            if let Some(limit) = entry.get("limit").and_then(Value::as_u64) {
                item.options.limit = Some(limit);
            }
            if let Some(page) = entry.get("page").and_then(Value::as_u64) {
                item.options.page = Some(page);
            }
            if let Some(order) = entry.get("order") {
                item.options.order =
                    serde_json::from_value(order.clone()).map_err(|err| {
                        Error::Request(format!("invalid select order: {err}"))
                    })?;
            }
            if let Some(children) = entry.get("select") {
                item.children = Some(select_from_value(children)?);
            }
            Ok(item)
        }
        other => Err(Error::Request(format!("invalid select item {other}"))),
    }
}
