//! Observer capability
//!
//! Structured events emitted by the pipeline: spans, errors, counters.
//! The shipped implementation forwards to `tracing` and the `metrics`
//! recorder; a no-op and an in-memory recorder exist for embedding and
//! tests.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info};

/// Attribute list attached to an observation.
pub type Attributes = Vec<(String, String)>;

/// Sink for structured observability events.
pub trait Observer: Send + Sync + 'static {
    /// Record a completed span.
    fn emit_span(&self, name: &str, attributes: Attributes, duration: Duration);

    /// Record an error occurrence.
    fn emit_error(&self, kind: &str, message: &str, attributes: Attributes);

    /// Increment a counter.
    fn emit_counter(&self, name: &'static str, tags: Attributes, delta: u64);
}

/// Observer that forwards to `tracing` and the global metrics recorder.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn emit_span(&self, name: &str, attributes: Attributes, duration: Duration) {
        info!(
            span = %name,
            duration_ms = duration.as_millis() as u64,
            attributes = ?attributes,
            "span completed"
        );
        telemetry_metrics::histogram!("rgw_span_duration_seconds", "span" => name.to_string())
            .record(duration.as_secs_f64());
    }

    fn emit_error(&self, kind: &str, message: &str, attributes: Attributes) {
        error!(kind = %kind, attributes = ?attributes, "{message}");
        telemetry_metrics::counter!("rgw_errors_total", "kind" => kind.to_string()).increment(1);
    }

    fn emit_counter(&self, name: &'static str, tags: Attributes, delta: u64) {
        let labels: Vec<telemetry_metrics::Label> = tags
            .into_iter()
            .map(|(k, v)| telemetry_metrics::Label::new(k, v))
            .collect();
        telemetry_metrics::counter!(name, labels).increment(delta);
    }
}

/// Observer that drops everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn emit_span(&self, _: &str, _: Attributes, _: Duration) {}
    fn emit_error(&self, _: &str, _: &str, _: Attributes) {}
    fn emit_counter(&self, _: &'static str, _: Attributes, _: u64) {}
}

/// A recorded observation (see [`MemoryObserver`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// A span with name and attributes
    Span(String, Attributes),
    /// An error with kind and message
    Error(String, String),
    /// A counter increment with name and delta
    Counter(&'static str, u64),
}

/// Observer that records events in memory for later inspection.
#[derive(Debug, Default)]
pub struct MemoryObserver {
    events: RwLock<Vec<Recorded>>,
}

impl MemoryObserver {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<Recorded> {
        self.events.read().clone()
    }

    /// Number of counter increments recorded for `name`.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                Recorded::Counter(n, delta) if *n == name => Some(*delta),
                _ => None,
            })
            .sum()
    }
}

impl Observer for MemoryObserver {
    fn emit_span(&self, name: &str, attributes: Attributes, _duration: Duration) {
        self.events
            .write()
            .push(Recorded::Span(name.to_string(), attributes));
    }

    fn emit_error(&self, kind: &str, message: &str, _attributes: Attributes) {
        self.events
            .write()
            .push(Recorded::Error(kind.to_string(), message.to_string()));
    }

    fn emit_counter(&self, name: &'static str, _tags: Attributes, delta: u64) {
        self.events.write().push(Recorded::Counter(name, delta));
    }
}

/// Shared observer handle.
pub type ObserverHandle = Arc<dyn Observer>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_observer_records_in_order() {
        let obs = MemoryObserver::new();
        obs.emit_counter("calls", vec![], 1);
        obs.emit_error("RetrieverError", "down", vec![]);
        obs.emit_counter("calls", vec![], 2);

        assert_eq!(obs.counter_total("calls"), 3);
        assert_eq!(obs.events().len(), 3);
        assert_eq!(
            obs.events()[1],
            Recorded::Error("RetrieverError".to_string(), "down".to_string())
        );
    }

    #[test]
    fn noop_observer_accepts_everything() {
        let obs = NoopObserver;
        obs.emit_span("request", vec![("method".into(), "tools/call".into())], Duration::ZERO);
        obs.emit_error("InternalError", "x", vec![]);
        obs.emit_counter("n", vec![], 1);
    }
}
