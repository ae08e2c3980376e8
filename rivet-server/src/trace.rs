//! Distributed tracing boundary.
//!
//! Every dispatched request runs inside a [`ServerSpan`]. [`ServerObserver`]s
//! registered with [`Telemetry`] are told about each new span and may attach
//! [`SpanObserver`]s that receive its start, tags, logs and finish.

use crate::context::RequestContext;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rivet_protocol::RequestHeader;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Identifies a span within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceInfo {
    pub trace_id: u64,
    pub parent_id: Option<u64>,
    pub span_id: u64,
}

/// Reasons an upstream trace header cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {field}: {value}")]
    Negative { field: &'static str, value: i64 },
}

fn upstream_id(field: &'static str, value: i64) -> Result<u64, TraceError> {
    u64::try_from(value).map_err(|_| TraceError::Negative { field, value })
}

fn random_id() -> u64 {
    // Keep ids within the positive i64 range so they survive the wire.
    Uuid::new_v4().as_u64_pair().0 >> 1
}

impl TraceInfo {
    /// Starts a new trace with random ids.
    pub fn new_root() -> Self {
        let id = random_id();
        Self {
            trace_id: id,
            parent_id: None,
            span_id: id,
        }
    }

    /// Builds trace info from ids received from upstream. Trace and span ids
    /// are required; no id may be negative.
    pub fn from_upstream(
        trace_id: Option<i64>,
        parent_id: Option<i64>,
        span_id: Option<i64>,
    ) -> Result<Self, TraceError> {
        let trace_id = upstream_id("trace_id", trace_id.ok_or(TraceError::Missing("trace_id"))?)?;
        let span_id = upstream_id("span_id", span_id.ok_or(TraceError::Missing("span_id"))?)?;
        let parent_id = parent_id
            .map(|id| upstream_id("parent_span_id", id))
            .transpose()?;
        Ok(Self {
            trace_id,
            parent_id,
            span_id,
        })
    }

    pub fn from_header(header: &RequestHeader) -> Result<Self, TraceError> {
        Self::from_upstream(header.trace_id, header.parent_span_id, header.span_id)
    }
}

impl fmt::Display for TraceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}:{:016x}", self.trace_id, self.span_id)
    }
}

/// Receives the lifecycle of one span.
///
/// Callbacks run while the span is locked; an observer must not call back
/// into the span it observes.
pub trait SpanObserver: Send {
    fn on_start(&mut self, _span: &SpanInfo) {}

    fn on_set_tag(&mut self, _key: &str, _value: &serde_json::Value) {}

    fn on_log(&mut self, _name: &str, _payload: &serde_json::Value) {}

    fn on_finish(&mut self, _span: &SpanInfo, _error: Option<&(dyn Error + 'static)>) {}
}

/// Told about every server span as it is created.
pub trait ServerObserver: Send + Sync {
    fn on_server_span_created(&self, context: &mut RequestContext, span: &ServerSpan);
}

/// Read-only view of a span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanInfo {
    pub name: String,
    pub trace: TraceInfo,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SpanInfo {
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }
}

struct SpanState {
    info: SpanInfo,
    observers: Vec<Box<dyn SpanObserver>>,
    finished: bool,
}

/// The span covering one server request. Cloning shares the span.
#[derive(Clone)]
pub struct ServerSpan {
    state: Arc<Mutex<SpanState>>,
}

impl ServerSpan {
    pub fn new(name: impl Into<String>, trace: TraceInfo) -> Self {
        Self {
            state: Arc::new(Mutex::new(SpanState {
                info: SpanInfo {
                    name: name.into(),
                    trace,
                    started_at: None,
                    finished_at: None,
                },
                observers: Vec::new(),
                finished: false,
            })),
        }
    }

    pub fn register(&self, observer: Box<dyn SpanObserver>) {
        self.state.lock().observers.push(observer);
    }

    pub fn info(&self) -> SpanInfo {
        self.state.lock().info.clone()
    }

    pub fn trace(&self) -> TraceInfo {
        self.state.lock().info.trace
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        state.info.started_at = Some(Utc::now());
        let SpanState {
            info, observers, ..
        } = &mut *state;
        for observer in observers.iter_mut() {
            observer.on_start(info);
        }
    }

    pub fn set_tag(&self, key: &str, value: impl Into<serde_json::Value>) {
        let value = value.into();
        for observer in self.state.lock().observers.iter_mut() {
            observer.on_set_tag(key, &value);
        }
    }

    pub fn log(&self, name: &str, payload: impl Into<serde_json::Value>) {
        let payload = payload.into();
        for observer in self.state.lock().observers.iter_mut() {
            observer.on_log(name, &payload);
        }
    }

    /// Finishes the span. Only the first call notifies observers.
    pub fn finish(&self, error: Option<&(dyn Error + 'static)>) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        state.info.finished_at = Some(Utc::now());
        let SpanState {
            info, observers, ..
        } = &mut *state;
        for observer in observers.iter_mut() {
            observer.on_finish(info, error);
        }
    }
}

impl fmt::Debug for ServerSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ServerSpan")
            .field("name", &state.info.name)
            .field("trace", &state.info.trace)
            .field("finished", &state.finished)
            .finish()
    }
}

/// Creates server spans and notifies the registered observers.
#[derive(Default, Clone)]
pub struct Telemetry {
    observers: Vec<Arc<dyn ServerObserver>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: impl ServerObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Creates the span for a request and attaches it, with its trace info,
    /// to `context`.
    pub fn make_server_span(
        &self,
        context: &mut RequestContext,
        name: &str,
        trace: TraceInfo,
    ) -> ServerSpan {
        let span = ServerSpan::new(name, trace);
        context.insert(trace);
        context.insert(span.clone());
        for observer in &self.observers {
            observer.on_server_span_created(context, &span);
        }
        span
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Logs every server span through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl ServerObserver for LoggingObserver {
    fn on_server_span_created(&self, _context: &mut RequestContext, span: &ServerSpan) {
        span.register(Box::new(LoggingSpanObserver));
    }
}

struct LoggingSpanObserver;

impl SpanObserver for LoggingSpanObserver {
    fn on_start(&mut self, span: &SpanInfo) {
        tracing::debug!("[{}] {} started", span.trace, span.name);
    }

    fn on_set_tag(&mut self, key: &str, value: &serde_json::Value) {
        tracing::trace!("tag {}={}", key, value);
    }

    fn on_log(&mut self, name: &str, payload: &serde_json::Value) {
        tracing::debug!("log {}: {}", name, payload);
    }

    fn on_finish(&mut self, span: &SpanInfo, error: Option<&(dyn Error + 'static)>) {
        let elapsed = span.duration().unwrap_or_default();
        match error {
            Some(e) => tracing::info!(
                "[{}] {} failed after {:?}: {}",
                span.trace,
                span.name,
                elapsed,
                e
            ),
            None => tracing::info!("[{}] {} finished in {:?}", span.trace, span.name, elapsed),
        }
    }
}
