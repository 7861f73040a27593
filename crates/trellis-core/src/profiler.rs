//! Hierarchical request timing.
//!
//! Every request owns a profiler tree; the executor opens one child
//! per backend call. Durations ship in the response when profiling is
//! requested.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One timed span in the profiler tree.
///
/// Cheap to clone; clones share the underlying span.
#[derive(Clone, Debug)]
pub struct Profiler {
    inner: Arc<Span>,
}

#[derive(Debug)]
struct Span {
    name: String,
    start: Instant,
    duration: Mutex<Option<Duration>>,
    children: Mutex<Vec<Profiler>>,
}

impl Profiler {
    /// Open a root span.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Span {
                name: name.into(),
                start: Instant::now(),
                duration: Mutex::new(None),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open a child span under this one.
    pub fn child(&self, name: impl Into<String>) -> Profiler {
        let child = Profiler::new(name);
        self.inner.children.lock().unwrap().push(child.clone());
        child
    }

    /// Close the span, recording its wall duration. Idempotent.
    pub fn end(&self) {
        let mut duration = self.inner.duration.lock().unwrap();
        if duration.is_none() {
            *duration = Some(self.inner.start.elapsed());
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The recorded duration; spans still open report elapsed time.
    pub fn duration(&self) -> Duration {
        self.inner
            .duration
            .lock()
            .unwrap()
            .unwrap_or_else(|| self.inner.start.elapsed())
    }

    /// Full span tree with per-span durations in milliseconds.
    pub fn to_raw(&self) -> Value {
        let children: Vec<Value> = self
            .inner
            .children
            .lock()
            .unwrap()
            .iter()
            .map(Profiler::to_raw)
            .collect();
        json!({
            "name": self.inner.name,
            "durationMs": duration_ms(self.duration()),
            "children": children,
        })
    }

    /// Durations aggregated by span name across the whole tree.
    pub fn to_aggregated(&self) -> Value {
        let mut totals: BTreeMap<String, (u64, f64)> = BTreeMap::new();
        self.aggregate_into(&mut totals);
        Value::Object(
            totals
                .into_iter()
                .map(|(name, (count, total))| {
                    (name, json!({ "count": count, "totalMs": total }))
                })
                .collect(),
        )
    }

    fn aggregate_into(&self, totals: &mut BTreeMap<String, (u64, f64)>) {
        let entry = totals.entry(self.inner.name.clone()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += duration_ms(self.duration());
        for child in self.inner.children.lock().unwrap().iter() {
            child.aggregate_into(totals);
        }
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
