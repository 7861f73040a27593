//! Extension surface.
//!
//! A registry of typed handlers per phase replaces ad-hoc event
//! hooks: handlers receive a mutable event struct and run
//! sequentially within a phase, so observable mutation ordering is
//! deterministic. Backend calls are the engine's only suspension
//! points, which keeps the handlers themselves synchronous.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use trellis_core::datasource::{Row, SourceResult};
use trellis_core::error::Result;
use trellis_core::plan::DstNode;
use trellis_core::request::{AttrPath, Request};
use trellis_response::Response;

/// Resource- or engine-scoped hooks into the request pipeline.
///
/// Every method defaults to a no-op; implement the phases you need.
pub trait Extension: Send + Sync {
    /// Engine startup.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Engine shutdown.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Before a request is resolved.
    fn request(&self, _event: &mut RequestEvent<'_>) -> Result<()> {
        Ok(())
    }

    /// After the plan is built, once per data-source-tree node,
    /// before the backend call.
    fn pre_execute(&self, _event: &mut PreExecuteEvent<'_>) -> Result<()> {
        Ok(())
    }

    /// After a backend call, before assembly.
    fn post_execute(&self, _event: &mut PostExecuteEvent<'_>) -> Result<()> {
        Ok(())
    }

    /// Per assembled row; may mutate the item in place.
    fn item(&self, _event: &mut ItemEvent<'_>) -> Result<()> {
        Ok(())
    }

    /// Before the response is returned.
    fn response(&self, _event: &mut ResponseEvent<'_>) -> Result<()> {
        Ok(())
    }
}

pub struct RequestEvent<'a> {
    pub request: &'a mut Request,
}

pub struct PreExecuteEvent<'a> {
    pub resource: &'a str,
    pub node: &'a mut DstNode,
}

pub struct PostExecuteEvent<'a> {
    pub resource: &'a str,
    pub attr_path: &'a AttrPath,
    pub source: &'a str,
    pub result: &'a mut SourceResult,
}

pub struct ItemEvent<'a> {
    pub resource: &'a str,
    pub attr_path: &'a AttrPath,
    /// The assembled item; mutations land in the response.
    pub item: &'a mut serde_json::Map<String, Value>,
    /// The backing primary-source row.
    pub row: &'a Row,
    /// Rows of secondary sources, by source name.
    pub secondary_rows: &'a HashMap<String, Option<Row>>,
}

pub struct ResponseEvent<'a> {
    pub response: &'a mut Response,
}

/// Handlers registered globally or per resource. Global handlers run
/// first, then resource-scoped ones, each in registration order.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    global: Vec<Arc<dyn Extension>>,
    by_resource: HashMap<String, Vec<Arc<dyn Extension>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_global(&mut self, extension: Arc<dyn Extension>) {
        self.global.push(extension);
    }

    pub fn register(&mut self, resource: impl Into<String>, extension: Arc<dyn Extension>) {
        self.by_resource
            .entry(resource.into())
            .or_default()
            .push(extension);
    }

    fn scoped(&self, resource: &str) -> impl Iterator<Item = &Arc<dyn Extension>> {
        self.global
            .iter()
            .chain(self.by_resource.get(resource).into_iter().flatten())
    }

    fn all(&self) -> impl Iterator<Item = &Arc<dyn Extension>> {
        self.global
            .iter()
            .chain(self.by_resource.values().flatten())
    }

    pub fn fire_init(&self) -> Result<()> {
        for extension in self.all() {
            extension.init()?;
        }
        Ok(())
    }

    pub fn fire_close(&self) -> Result<()> {
        for extension in self.all() {
            extension.close()?;
        }
        Ok(())
    }

    pub fn fire_request(&self, resource: &str, request: &mut Request) -> Result<()> {
        let mut event = RequestEvent { request };
        for extension in self.scoped(resource) {
            extension.request(&mut event)?;
        }
        Ok(())
    }

    pub fn fire_pre_execute(&self, resource: &str, node: &mut DstNode) -> Result<()> {
        let mut event = PreExecuteEvent { resource, node };
        for extension in self.scoped(resource) {
            extension.pre_execute(&mut event)?;
        }
        Ok(())
    }

    pub fn fire_post_execute(
        &self,
        resource: &str,
        attr_path: &AttrPath,
        source: &str,
        result: &mut SourceResult,
    ) -> Result<()> {
        let mut event = PostExecuteEvent {
            resource,
            attr_path,
            source,
            result,
        };
        for extension in self.scoped(resource) {
            extension.post_execute(&mut event)?;
        }
        Ok(())
    }

    pub fn fire_item(
        &self,
        resource: &str,
        attr_path: &AttrPath,
        item: &mut serde_json::Map<String, Value>,
        row: &Row,
        secondary_rows: &HashMap<String, Option<Row>>,
    ) -> Result<()> {
        let mut event = ItemEvent {
            resource,
            attr_path,
            item,
            row,
            secondary_rows,
        };
        for extension in self.scoped(resource) {
            extension.item(&mut event)?;
        }
        Ok(())
    }

    pub fn fire_response(&self, resource: &str, response: &mut Response) -> Result<()> {
        let mut event = ResponseEvent { response };
        for extension in self.scoped(resource) {
            extension.response(&mut event)?;
        }
        Ok(())
    }

    /// Whether any handler is interested in item events; assembly
    /// skips the dispatch entirely otherwise.
    pub fn has_handlers(&self, resource: &str) -> bool {
        self.scoped(resource).next().is_some()
    }
}
