//! Error types for Trellis.
//!
//! A closed set of error kinds, each mapped to an HTTP status hint.
//! Internal kinds (implementation, data) never leak their message to
//! clients unless error exposure is switched on.

use http::StatusCode;
use thiserror::Error;

/// Result type for Trellis operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Trellis.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Malformed request: unknown resource options, hidden attribute,
    /// unsupported operator, illegal limit/page combination.
    #[error("Request error: {0}")]
    Request(String),

    /// Missing or invalid credentials (surfaced by extensions).
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Insufficient permissions (surfaced by extensions).
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Unknown resource, or a single-valued request matched no row.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration bug detected at init or during resolution.
    #[error("Implementation error: {0}")]
    Implementation(String),

    /// Backend returned malformed rows (missing key column, duplicate
    /// unique child key).
    #[error("Data error: {0}")]
    Data(String),

    /// Backend unreachable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Catch-all engine failure.
    #[error("Engine error: {0}")]
    Engine(String),
}

impl Error {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Request(_) => StatusCode::BAD_REQUEST,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Implementation(_) | Self::Data(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Connection(_) | Self::Engine(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether the message is safe to show to clients.
    ///
    /// Implementation and data errors describe configuration or
    /// backend internals and are masked unless exposure is enabled.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Self::Request(_) | Self::Authentication(_) | Self::Authorization(_) | Self::NotFound(_)
        )
    }

    /// The message shown to clients, honoring `expose_errors`.
    pub fn public_message(&self, expose_errors: bool) -> String {
        if self.is_public() || expose_errors {
            self.to_string()
        } else {
            "Internal Server Error".to_string()
        }
    }

    /// Annotate the message with an attribute path for diagnosis.
    pub fn at_attribute(self, path: &str) -> Self {
        self.annotate(&format!("attribute={path}"))
    }

    /// Annotate the message with a data-source name for diagnosis.
    pub fn at_data_source(self, name: &str) -> Self {
        self.annotate(&format!("dataSource={name}"))
    }

    fn annotate(self, ctx: &str) -> Self {
        let wrap = |msg: String| format!("{msg} ({ctx})");
        match self {
            Self::Request(m) => Self::Request(wrap(m)),
            Self::Authentication(m) => Self::Authentication(wrap(m)),
            Self::Authorization(m) => Self::Authorization(wrap(m)),
            Self::NotFound(m) => Self::NotFound(wrap(m)),
            Self::Implementation(m) => Self::Implementation(wrap(m)),
            Self::Data(m) => Self::Data(wrap(m)),
            Self::Connection(m) => Self::Connection(wrap(m)),
            Self::Engine(m) => Self::Engine(wrap(m)),
        }
    }

    /// Convert to a JSON error body.
    pub fn to_json(&self, expose_errors: bool) -> serde_json::Value {
        serde_json::json!({
            "message": self.public_message(expose_errors),
        })
    }
}
