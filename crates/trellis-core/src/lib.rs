//! Trellis Core - declarative resource queries over heterogeneous
//! data sources.
//!
//! A resource configuration describes attributes, their mapping onto
//! one or more backing data sources, and relations to other
//! resources. A request names a resource and a projection tree with
//! optional filter, search, order, limit, page, and id; the engine
//! answers with a shaped JSON document.
//!
//! # Architecture
//!
//! The request pipeline:
//!
//! 1. **Configuration** (`resource`) - two-pass parsing of raw
//!    resource configs into an immutable model
//! 2. **Request model** (`request`) - domain types plus the
//!    select-tree syntax
//! 3. **Planning** (`plan`) - resolve a request into the data-source
//!    tree (DST)
//! 4. **Drivers** (`datasource`) - the `prepare`/`process`/`close`
//!    interface backends implement
//! 5. **Casting** (`cast`) - stored-to-logical value coercion
//!
//! Execution and result assembly live in the `trellis-engine` crate.

pub mod cast;
pub mod config;
pub mod datasource;
pub mod error;
pub mod plan;
pub mod profiler;
pub mod request;
pub mod resource;

// Re-export main types
pub use cast::{cast, CastContext, CastOptions, LogicalType, StoredType};
pub use config::EngineOptions;
pub use datasource::{
    DataSource, DataSourceRegistry, FilterKey, Row, SourceCondition, SourceFilter, SourceOrder,
    SourceQuery, SourceResult, SourceValue,
};
pub use error::{Error, Result};
pub use plan::{resolve, DstNode, ResolvedRequest, ResolvedResource};
pub use profiler::Profiler;
pub use request::{
    FilterOperator, FilterPart, FilterTree, OrderDirection, OrderSpec, ProfileMode, Request,
    Select, SelectItem,
};
pub use resource::{parse_resources, AttributeNode, ResourceConfig};

/// Prelude for common imports.
pub mod prelude {
    pub use super::cast::{CastContext, CastOptions, LogicalType};
    pub use super::config::EngineOptions;
    pub use super::datasource::{DataSource, DataSourceRegistry, SourceQuery, SourceResult};
    pub use super::error::{Error, Result};
    pub use super::plan::{resolve, ResolvedRequest};
    pub use super::request::{Request, Select};
    pub use super::resource::{parse_resources, ResourceConfig};
}
