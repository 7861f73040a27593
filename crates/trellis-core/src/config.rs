//! Engine configuration for Trellis.
//!
//! These are the process-level options; per-resource configuration
//! lives in [`crate::resource`].

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Main engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineOptions {
    /// Directory the resource configs are loaded from.
    pub resources_path: Option<String>,

    /// Data-source driver configuration by driver name.
    pub data_sources: HashMap<String, DriverOptions>,

    /// Time zone values are re-emitted in.
    pub timezone: String,

    /// Default zone stored date values are interpreted in, when the
    /// attribute's stored type does not name one.
    pub default_stored_timezone: Option<String>,

    /// Allow `_explain` to attach the executed plan to responses.
    pub allow_explain: bool,

    /// Expose internal error messages to clients.
    pub expose_errors: bool,

    /// Seconds a hanging response is waited on before being dropped.
    /// Enforced by the transport layer, carried here for it.
    pub post_timeout: Option<u64>,

    /// Port the transport layer binds to. Carried for the transport.
    pub port: Option<u16>,

    /// Static file directory. Carried for the transport.
    pub static_path: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            resources_path: None,
            data_sources: HashMap::new(),
            timezone: default_timezone(),
            default_stored_timezone: None,
            allow_explain: false,
            expose_errors: false,
            post_timeout: None,
            port: None,
            static_path: None,
        }
    }
}

impl EngineOptions {
    /// Parse and validate the configured time zones.
    pub fn validate(&self) -> Result<()> {
        self.parse_timezone()?;
        self.parse_default_stored_timezone()?;
        Ok(())
    }

    /// The engine zone values are emitted in.
    pub fn parse_timezone(&self) -> Result<Tz> {
        parse_tz(&self.timezone)
    }

    /// The fallback zone stored dates are interpreted in.
    pub fn parse_default_stored_timezone(&self) -> Result<Tz> {
        match &self.default_stored_timezone {
            Some(tz) => parse_tz(tz),
            None => self.parse_timezone(),
        }
    }
}

fn parse_tz(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| Error::Implementation(format!("invalid timezone \"{name}\"")))
}

/// Options for one data-source driver.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DriverOptions {
    /// Driver-specific settings, passed through at registration.
    #[serde(flatten)]
    pub options: HashMap<String, Value>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}
