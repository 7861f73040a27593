//! Response envelope for Trellis.
//!
//! Every request answers with `{meta, cursor, error, data}`. The
//! envelope is transport-agnostic; the HTTP layer maps `meta` onto
//! status and headers.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use trellis_core::error::Error;

/// A complete response.
#[derive(Clone, Debug, Serialize)]
pub struct Response {
    pub meta: Meta,
    pub cursor: Option<Cursor>,
    pub error: Option<ErrorBody>,
    pub data: Value,
}

impl Response {
    /// A successful response around shaped data.
    pub fn ok(data: Value) -> Self {
        Self {
            meta: Meta::default(),
            cursor: None,
            error: None,
            data,
        }
    }

    /// An error response. Internal messages are masked unless
    /// exposure is enabled.
    pub fn from_error(error: &Error, expose_errors: bool) -> Self {
        Self {
            meta: Meta {
                status_code: error.status_code().as_u16(),
                ..Default::default()
            },
            cursor: None,
            error: Some(ErrorBody {
                message: error.public_message(expose_errors),
            }),
            data: Value::Null,
        }
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Serialize the envelope to a JSON string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Response metadata.
#[derive(Clone, Debug, Serialize)]
pub struct Meta {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
    /// Wall duration of the request in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Profiler timings, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
    /// The executed plan, when requested and allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<Value>,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: IndexMap::new(),
            duration: None,
            profile: None,
            explain: None,
        }
    }
}

/// Pagination information for collection responses.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Cursor {
    #[serde(rename = "totalCount")]
    pub total_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(rename = "totalPage", skip_serializing_if = "Option::is_none")]
    pub total_page: Option<u64>,
}

impl Cursor {
    /// Build a cursor from the root query's totals and paging.
    pub fn new(total_count: Option<u64>, page: Option<u64>, limit: Option<u64>) -> Self {
        let total_page = match (total_count, limit, page) {
            // Total pages only make sense when paging was requested.
            (Some(total), Some(limit), Some(_)) if limit > 0 => {
                Some(total.div_ceil(limit))
            }
            _ => None,
        };
        Self {
            total_count,
            page,
            limit: page.and(limit),
            total_page,
        }
    }
}

/// The client-facing error body.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}
