//! Value coercion between stored and logical types.
//!
//! Backends return values in their storage shape (`storedType`); the
//! engine presents them in the attribute's logical type. Casting also
//! runs in the other direction when filter values are handed to a
//! backend.
//!
//! Date-family coercion failures yield null; numeric failures yield
//! null as well (the JSON rendering of a failed numeric parse).

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use nom::{
    bytes::complete::{is_not, tag, take_while1},
    character::complete::char,
    combinator::{all_consuming, opt},
    multi::separated_list0,
    sequence::{delimited, separated_pair},
    IResult,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// Logical attribute types presented to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    String,
    Int,
    Float,
    Boolean,
    Date,
    Datetime,
    Time,
    Unixtime,
    Raw,
    Object,
    Json,
}

impl LogicalType {
    /// Whether this type goes through date parsing.
    pub fn is_date_family(self) -> bool {
        matches!(
            self,
            Self::Date | Self::Datetime | Self::Time | Self::Unixtime
        )
    }
}

impl FromStr for LogicalType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "string" => Self::String,
            "int" => Self::Int,
            "float" => Self::Float,
            "boolean" => Self::Boolean,
            "date" => Self::Date,
            "datetime" => Self::Datetime,
            "time" => Self::Time,
            "unixtime" => Self::Unixtime,
            "raw" => Self::Raw,
            "object" => Self::Object,
            "json" => Self::Json,
            other => return Err(Error::Request(format!("invalid attribute type \"{other}\""))),
        })
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Datetime => "datetime",
            Self::Time => "time",
            Self::Unixtime => "unixtime",
            Self::Raw => "raw",
            Self::Object => "object",
            Self::Json => "json",
        };
        f.write_str(s)
    }
}

/// How a value is stored in the backend, with driver options.
///
/// Parsed from `name(key=value;key=value)` syntax, e.g.
/// `datetime(timezone=Europe/Berlin)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredType {
    pub name: String,
    pub options: HashMap<String, String>,
}

impl StoredType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: HashMap::new(),
        }
    }

    /// Parse the `name(k=v;k=v)` syntax.
    pub fn parse(input: &str) -> Result<Self> {
        let (_, parsed) = all_consuming(stored_type)(input)
            .map_err(|_| Error::Request(format!("invalid storedType \"{input}\"")))?;
        Ok(parsed)
    }

    /// The stored time zone option, if declared.
    pub fn timezone(&self) -> Option<&str> {
        self.options.get("timezone").map(|s| s.as_str())
    }
}

fn stored_type(input: &str) -> IResult<&str, StoredType> {
    let (input, name) = take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)?;
    let (input, options) = opt(delimited(
        char('('),
        separated_list0(char(';'), stored_type_option),
        char(')'),
    ))(input)?;
    Ok((
        input,
        StoredType {
            name: name.to_string(),
            options: options.unwrap_or_default().into_iter().collect(),
        },
    ))
}

fn stored_type_option(input: &str) -> IResult<&str, (String, String)> {
    let (input, (key, value)) =
        separated_pair(is_not("=;)"), tag("="), is_not(";)"))(input)?;
    Ok((input, (key.to_string(), value.to_string())))
}

/// Everything the cast step needs to know about one column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CastOptions {
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    #[serde(rename = "storedType", skip_serializing_if = "Option::is_none")]
    pub stored_type: Option<StoredType>,
    #[serde(rename = "multiValued", default, skip_serializing_if = "std::ops::Not::not")]
    pub multi_valued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
}

impl CastOptions {
    pub fn new(logical_type: LogicalType) -> Self {
        Self {
            logical_type,
            stored_type: None,
            multi_valued: false,
            delimiter: None,
        }
    }

    fn stored_type_name(&self) -> Option<&str> {
        self.stored_type.as_ref().map(|st| st.name.as_str())
    }
}

/// Engine-level zone defaults the cast step runs under.
#[derive(Clone, Copy, Debug)]
pub struct CastContext {
    /// Zone values are re-emitted in.
    pub timezone: Tz,
    /// Fallback zone stored dates are interpreted in.
    pub stored_timezone: Tz,
}

impl Default for CastContext {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            stored_timezone: chrono_tz::UTC,
        }
    }
}

// ============================================================================
// Casting
// ============================================================================

/// Coerce a stored value into its logical type.
pub fn cast(value: Value, opts: &CastOptions, ctx: &CastContext) -> Value {
    // Delimited strings become ordered lists of coerced parts.
    if let (Some(delimiter), Value::String(s)) = (&opts.delimiter, &value) {
        return Value::Array(
            s.split(delimiter.as_str())
                .map(|part| cast_scalar(Value::String(part.to_string()), opts, ctx))
                .collect(),
        );
    }

    if opts.multi_valued {
        return match value {
            Value::Null => Value::Array(vec![]),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| cast_scalar(item, opts, ctx))
                    .collect(),
            ),
            scalar => Value::Array(vec![cast_scalar(scalar, opts, ctx)]),
        };
    }

    cast_scalar(value, opts, ctx)
}

/// Decode a driver-supplied byte buffer into a string value. String
/// coercion routes byte-array cells through here; drivers holding
/// real buffers can call it directly.
pub fn bytes_to_value(bytes: &Bytes) -> Value {
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

fn cast_scalar(value: Value, opts: &CastOptions, ctx: &CastContext) -> Value {
    if value.is_null() {
        return Value::Null;
    }

    match opts.logical_type {
        LogicalType::Raw => value,
        LogicalType::String => cast_string(value),
        LogicalType::Boolean => cast_boolean(value),
        LogicalType::Int => cast_int(value),
        LogicalType::Float => cast_float(value),
        LogicalType::Date | LogicalType::Datetime | LogicalType::Time => {
            match parse_stored_date(&value, opts, ctx) {
                Some(dt) => emit_date(dt, opts.logical_type, ctx),
                None => Value::Null,
            }
        }
        LogicalType::Unixtime => match parse_stored_date(&value, opts, ctx) {
            Some(dt) => Value::Number(dt.timestamp().into()),
            None => Value::Null,
        },
        LogicalType::Object => cast_object(value, opts),
        LogicalType::Json => cast_json(value, opts),
    }
}

fn cast_string(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        // Drivers hand binary columns over as arrays of byte values.
        Value::Array(items) => match byte_buffer(&items) {
            Some(buffer) => bytes_to_value(&buffer),
            None => Value::String(Value::Array(items).to_string()),
        },
        other => Value::String(other.to_string()),
    }
}

fn byte_buffer(items: &[Value]) -> Option<Bytes> {
    if items.is_empty() {
        return None;
    }
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .filter(|byte| *byte <= u8::MAX as u64)
                .map(|byte| byte as u8)
        })
        .collect::<Option<Vec<u8>>>()
        .map(Bytes::from)
}

fn cast_boolean(value: Value) -> Value {
    let b = match &value {
        Value::String(s) => !(s == "0" || s.is_empty()),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::Bool(b) => *b,
        _ => true,
    };
    Value::Bool(b)
}

fn cast_int(value: Value) -> Value {
    let parsed = match &value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f.trunc() as i64)),
        _ => None,
    };
    match parsed {
        Some(n) => Value::Number(n.into()),
        None => Value::Null,
    }
}

fn cast_float(value: Value) -> Value {
    let parsed = match &value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed.and_then(serde_json::Number::from_f64) {
        Some(n) => Value::Number(n),
        None => Value::Null,
    }
}

fn cast_object(value: Value, opts: &CastOptions) -> Value {
    match opts.stored_type_name() {
        Some("json") => match value {
            Value::String(s) => serde_json::from_str(&s).unwrap_or_else(|err| {
                warn!(error = %err, "failed to parse stored JSON value");
                Value::Null
            }),
            already_parsed => already_parsed,
        },
        Some("object") => value,
        other => {
            warn!(
                stored_type = other.unwrap_or("<none>"),
                "object attribute requires a json or object storedType"
            );
            Value::Null
        }
    }
}

fn cast_json(value: Value, opts: &CastOptions) -> Value {
    match opts.stored_type_name() {
        Some("json") => value,
        _ => Value::String(value.to_string()),
    }
}

// ============================================================================
// Date handling
// ============================================================================

/// The zone a stored date value is interpreted in.
fn stored_zone(opts: &CastOptions, ctx: &CastContext) -> Tz {
    opts.stored_type
        .as_ref()
        .and_then(StoredType::timezone)
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(ctx.stored_timezone)
}

fn parse_stored_date(value: &Value, opts: &CastOptions, ctx: &CastContext) -> Option<DateTime<Utc>> {
    // Integer seconds since epoch when stored as unixtime.
    if opts.stored_type_name() == Some("unixtime") {
        let secs = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }?;
        return Utc.timestamp_opt(secs, 0).single();
    }

    let s = value.as_str()?.trim();

    // Zero dates denote "no value" in several SQL backends.
    if s.starts_with("0000-00-00") || s.is_empty() {
        return None;
    }

    // Offset-carrying inputs are absolute already.
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    // Naive inputs are interpreted in the stored zone.
    let zone = stored_zone(opts, ctx);
    let naive = parse_naive(s)?;
    zone.from_local_datetime(&naive)
        .single()
        .or_else(|| zone.from_local_datetime(&naive).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
        return NaiveDate::from_ymd_opt(1970, 1, 1).map(|d| d.and_time(time));
    }
    None
}

fn emit_date(dt: DateTime<Utc>, target: LogicalType, ctx: &CastContext) -> Value {
    let iso = dt
        .with_timezone(&ctx.timezone)
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    let s = match target {
        LogicalType::Date => iso.chars().take(10).collect(),
        LogicalType::Time => iso.chars().skip(11).collect(),
        _ => iso,
    };
    Value::String(s)
}
