//! The engine façade.
//!
//! An [`Engine`] owns the parsed configuration, the driver registry,
//! the extension registry, and the zone defaults; one instance serves
//! many concurrent requests. [`Engine::execute`] runs the full
//! pipeline for one request and always answers with a response
//! envelope; errors are folded into it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use trellis_core::cast::CastContext;
use trellis_core::config::EngineOptions;
use trellis_core::datasource::{DataSource, DataSourceRegistry};
use trellis_core::error::{Error, Result};
use trellis_core::plan::{resolve, DstNode};
use trellis_core::profiler::Profiler;
use trellis_core::request::{ProfileMode, Request};
use trellis_core::resource::{parse_resources, ResourceConfig};
use trellis_response::{Cursor, Response};

use crate::builder::build;
use crate::executor::{execute, ExecutionContext, RawResult};
use crate::extension::{Extension, ExtensionRegistry};
use crate::memory::{MemoryDataSource, MEMORY_SOURCE};

/// Builds an [`Engine`]: drivers, extensions, and resource configs.
pub struct EngineBuilder {
    options: EngineOptions,
    registry: DataSourceRegistry,
    extensions: ExtensionRegistry,
    resources: Map<String, Value>,
}

impl EngineBuilder {
    pub fn new(options: EngineOptions) -> Self {
        let mut registry = DataSourceRegistry::new();
        // The in-memory driver ships with the engine.
        registry.register(MEMORY_SOURCE, Arc::new(MemoryDataSource));
        Self {
            options,
            registry,
            extensions: ExtensionRegistry::new(),
            resources: Map::new(),
        }
    }

    /// Register a driver under its type name.
    pub fn data_source(mut self, kind: impl Into<String>, driver: Arc<dyn DataSource>) -> Self {
        self.registry.register(kind, driver);
        self
    }

    /// Register an engine-wide extension.
    pub fn extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.register_global(extension);
        self
    }

    /// Register an extension scoped to one resource.
    pub fn extension_for(
        mut self,
        resource: impl Into<String>,
        extension: Arc<dyn Extension>,
    ) -> Self {
        self.extensions.register(resource, extension);
        self
    }

    /// Add one raw resource config.
    pub fn resource(mut self, name: impl Into<String>, raw: Value) -> Self {
        self.resources.insert(name.into(), raw);
        self
    }

    /// Load `<name>.json` resource configs from a directory.
    pub fn load_resources(mut self, directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref();
        let entries = std::fs::read_dir(directory).map_err(|err| {
            Error::Implementation(format!(
                "cannot read resources from {}: {err}",
                directory.display()
            ))
        })?;
        for entry in entries {
            let path = entry
                .map_err(|err| Error::Implementation(format!("cannot list resources: {err}")))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .ok_or_else(|| {
                    Error::Implementation(format!("invalid resource file {}", path.display()))
                })?
                .to_string();
            let text = std::fs::read_to_string(&path).map_err(|err| {
                Error::Implementation(format!("cannot read {}: {err}", path.display()))
            })?;
            let raw: Value = serde_json::from_str(&text).map_err(|err| {
                Error::Implementation(format!("invalid JSON in {}: {err}", path.display()))
            })?;
            debug!(resource = %name, file = %path.display(), "loaded resource config");
            self.resources.insert(name, raw);
        }
        Ok(self)
    }

    /// Parse and resolve all configs, prepare every data source, and
    /// fire the `init` extensions.
    pub fn build(mut self) -> Result<Engine> {
        self.options.validate()?;
        let cast = CastContext {
            timezone: self.options.parse_timezone()?,
            stored_timezone: self.options.parse_default_stored_timezone()?,
        };

        if self.resources.is_empty() {
            if let Some(path) = self.options.resources_path.clone() {
                self = self.load_resources(path)?;
            }
        }

        let configs = parse_resources(&self.resources, &self.registry)?;
        info!(resources = configs.len(), "engine configuration parsed");

        self.extensions.fire_init()?;

        Ok(Engine {
            options: self.options,
            configs,
            registry: self.registry,
            extensions: self.extensions,
            cast,
            closed: AtomicBool::new(false),
        })
    }
}

/// The query engine. Cheap to share behind an `Arc`; all state is
/// read-only after construction.
pub struct Engine {
    options: EngineOptions,
    configs: IndexMap<String, ResourceConfig>,
    registry: DataSourceRegistry,
    extensions: ExtensionRegistry,
    cast: CastContext,
    closed: AtomicBool,
}

impl Engine {
    pub fn builder(options: EngineOptions) -> EngineBuilder {
        EngineBuilder::new(options)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn config(&self, resource: &str) -> Option<&ResourceConfig> {
        self.configs.get(resource)
    }

    /// Process one request end to end. Errors are folded into the
    /// envelope; this never fails transport-side.
    pub async fn execute(&self, request: Request) -> Response {
        self.execute_cancellable(request, CancellationToken::new())
            .await
    }

    /// Like [`Engine::execute`], with a caller-supplied cancellation
    /// handle that is passed to every backend call.
    pub async fn execute_cancellable(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Response {
        let started = Instant::now();
        let profiler = Profiler::new("request");
        let profile = request.profile;

        let mut response = match self
            .process(request, cancel, profiler.clone())
            .await
        {
            Ok(response) => response,
            Err(err) => {
                if err.is_public() {
                    debug!(error = %err, "request failed");
                } else {
                    error!(error = %err, "request failed");
                }
                Response::from_error(&err, self.options.expose_errors)
            }
        };

        profiler.end();
        response.meta.duration = Some(started.elapsed().as_secs_f64() * 1000.0);
        match profile {
            ProfileMode::Off => {}
            ProfileMode::Aggregated => response.meta.profile = Some(profiler.to_aggregated()),
            ProfileMode::Raw => response.meta.profile = Some(profiler.to_raw()),
        }
        response
    }

    async fn process(
        &self,
        mut request: Request,
        cancel: CancellationToken,
        profiler: Profiler,
    ) -> Result<Response> {
        self.extensions
            .fire_request(&request.resource.clone(), &mut request)?;
        let resource = request.resource.clone();

        let resolved = resolve(&request, &self.configs)?;
        let wants_explain = request.explain && self.options.allow_explain;
        let explain_plan = wants_explain.then(|| resolved.dst.clone());

        let ctx = ExecutionContext {
            registry: &self.registry,
            extensions: &self.extensions,
            resource: &resource,
            cast: self.cast,
            profiler,
            cancel,
        };
        let page = resolved.dst.query.page;
        let limit = resolved.dst.query.limit;
        let results = execute(&ctx, resolved.dst).await?;

        let built = build(
            &resource,
            &resolved.root,
            resolved.many,
            &results,
            &self.extensions,
        )?;

        let mut response = Response::ok(built.data);
        if resolved.many {
            response = response.with_cursor(Cursor::new(built.total_count, page, limit));
        }
        if let Some(plan) = explain_plan {
            response.meta.explain = Some(render_explain(&plan, &results));
        }

        self.extensions.fire_response(&resource, &mut response)?;
        Ok(response)
    }

    /// Shut down drivers and extensions. Safe to call twice.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("engine shutting down");
        self.extensions.fire_close()?;
        self.registry.close_all().await
    }
}

/// A JSON rendering of the executed plan: per node the query shape,
/// whether the backend was called, and how many rows came back.
fn render_explain(node: &DstNode, results: &[RawResult]) -> Value {
    let outcome = results
        .iter()
        .find(|result| result.attr_path == node.attr_path && result.source == node.source);
    json!({
        "request": node.request_name(),
        "type": node.query.kind,
        "attributes": node.query.attributes,
        "filter": node.query.filter,
        "search": node.query.search,
        "order": node.query.order,
        "limit": node.query.limit,
        "limitPer": node.query.limit_per,
        "page": node.query.page,
        "skipped": outcome.map(|result| result.skipped),
        "rows": outcome.map(|result| result.rows.len()),
        "subFilters": node
            .sub_filters
            .iter()
            .map(|sub| render_explain(sub, &[]))
            .collect::<Vec<_>>(),
        "subRequests": node
            .sub_requests
            .iter()
            .map(|sub| render_explain(sub, results))
            .collect::<Vec<_>>(),
    })
}
