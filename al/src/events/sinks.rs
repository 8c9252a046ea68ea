//! Fire-and-forget sinks: tracer and analytics
//!
//! Both are consumed, never awaited. A sink that panics or blocks would
//! stall the run, so implementations must be cheap and infallible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use super::types::{TraceEvent, TraceKind};

/// Diagnostic trace sink.
pub trait Tracer: Send + Sync {
    fn trace(&self, event: &TraceEvent);
}

/// Product analytics sink.
pub trait Analytics: Send + Sync {
    fn track(&self, event: &str, payload: serde_json::Value);
}

/// Tracer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn trace(&self, _event: &TraceEvent) {}
}

/// Analytics sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAnalytics;

impl Analytics for NullAnalytics {
    fn track(&self, _event: &str, _payload: serde_json::Value) {}
}

/// Tracer that retains events in memory, for tests and the CLI's debug dump.
#[derive(Default)]
pub struct CollectingTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl CollectingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().expect("trace buffer poisoned").clone()
    }
}

impl Tracer for CollectingTracer {
    fn trace(&self, event: &TraceEvent) {
        self.events.lock().expect("trace buffer poisoned").push(event.clone());
    }
}

/// Analytics sink that retains tracked events in memory.
#[derive(Default)]
pub struct CollectingAnalytics {
    tracked: Mutex<Vec<(String, serde_json::Value)>>,
}

impl CollectingAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked(&self) -> Vec<(String, serde_json::Value)> {
        self.tracked.lock().expect("analytics buffer poisoned").clone()
    }
}

impl Analytics for CollectingAnalytics {
    fn track(&self, event: &str, payload: serde_json::Value) {
        self.tracked
            .lock()
            .expect("analytics buffer poisoned")
            .push((event.to_string(), payload));
    }
}

/// Per-run trace log: stamps sequence numbers, forwards to the tracer, and
/// retains a copy for the run's `TaskResult::trace`.
pub struct TraceLog {
    seq: Arc<AtomicU64>,
    tracer: Arc<dyn Tracer>,
    collected: Mutex<Vec<TraceEvent>>,
}

impl TraceLog {
    pub fn new(seq: Arc<AtomicU64>, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            seq,
            tracer,
            collected: Mutex::new(Vec::new()),
        }
    }

    /// Record one trace event.
    pub fn record(&self, kind: TraceKind, data: serde_json::Value) {
        let event = TraceEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            at: Utc::now(),
            kind,
            data,
        };
        self.tracer.trace(&event);
        self.collected.lock().expect("trace log poisoned").push(event);
    }

    /// Everything recorded so far.
    pub fn collected(&self) -> Vec<TraceEvent> {
        self.collected.lock().expect("trace log poisoned").clone()
    }
}
