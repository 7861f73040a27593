//! Trellis Engine - query execution and result assembly.
//!
//! This crate drives the pipeline defined by `trellis-core`: it walks
//! the data-source tree concurrently ([`executor`]), joins the raw
//! results into the response shape ([`builder`]), and wraps both
//! behind the [`Engine`] façade with extension hooks and the engine
//! lifecycle. The in-memory driver ([`memory`]) doubles as fixture
//! backend and reference for driver semantics.

pub mod builder;
pub mod engine;
pub mod executor;
pub mod extension;
pub mod memory;

pub use builder::{build, BuiltResult};
pub use engine::{Engine, EngineBuilder};
pub use executor::{execute, ExecutionContext, RawResult};
pub use extension::{
    Extension, ExtensionRegistry, ItemEvent, PostExecuteEvent, PreExecuteEvent, RequestEvent,
    ResponseEvent,
};
pub use memory::{MemoryDataSource, MEMORY_SOURCE};

/// Prelude for common imports.
pub mod prelude {
    pub use super::engine::{Engine, EngineBuilder};
    pub use super::extension::{Extension, ExtensionRegistry};
    pub use super::memory::MemoryDataSource;
    pub use trellis_core::prelude::*;
    pub use trellis_response::{Cursor, Response};
}
