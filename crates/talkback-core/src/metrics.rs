//! Latency instrumentation for the voice loop.
//!
//! The recorder is handed to the orchestrator as an `Arc<dyn MetricsRecorder>`
//! so tests can swap in [`NoopRecorder`] or inspect an [`InMemoryRecorder`].
//! Recording is advisory: nothing here may fail the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// A recorded entry. Last write for a given name wins.
#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    /// A timer. `end` and `duration` are set once it has been stopped.
    Interval {
        start: Instant,
        end: Option<Instant>,
        duration: Option<Duration>,
    },
    /// A one-off timestamp.
    Mark(Instant),
    /// A directly logged scalar.
    Value(f64),
}

impl Metric {
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Metric::Interval { duration, .. } => *duration,
            _ => None,
        }
    }
}

/// Formats a metric the way it appears in reports.
pub struct MetricLine<'a>(pub &'a str, pub &'a Metric);

impl fmt::Display for MetricLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let MetricLine(name, metric) = self;
        match metric {
            Metric::Interval {
                duration: Some(d), ..
            } => write!(f, "{name}: {:.3} seconds", d.as_secs_f64()),
            Metric::Interval { .. } => write!(f, "{name}: running"),
            Metric::Mark(at) => write!(f, "{name}: marked {:.3}s ago", at.elapsed().as_secs_f64()),
            Metric::Value(v) => write!(f, "{name}: {v}"),
        }
    }
}

pub trait MetricsRecorder: Send + Sync {
    /// Start (or restart) a named timer.
    fn start(&self, name: &str);

    /// Stop a named timer and compute its duration.
    fn stop(&self, name: &str);

    /// Record a completed interval measured by the caller.
    fn record_interval(&self, name: &str, start: Instant, end: Instant);

    /// Record a one-off timestamp.
    fn mark(&self, name: &str);

    /// Record a scalar value.
    fn log(&self, name: &str, value: f64);

    fn get(&self, name: &str) -> Option<Metric>;

    /// Render every metric, one per line, between report banners.
    fn report(&self) -> String;

    /// Render a single metric, or a not-found line.
    fn report_metric(&self, name: &str) -> String {
        match self.get(name) {
            Some(metric) => MetricLine(name, &metric).to_string(),
            None => format!("Metric '{name}' not found."),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn start(&self, _name: &str) {}
    fn stop(&self, _name: &str) {}
    fn record_interval(&self, _name: &str, _start: Instant, _end: Instant) {}
    fn mark(&self, _name: &str) {}
    fn log(&self, _name: &str, _value: f64) {}

    fn get(&self, _name: &str) -> Option<Metric> {
        None
    }

    fn report(&self) -> String {
        String::new()
    }
}

/// Keeps the latest value per name in memory and forwards completed
/// intervals to the `metrics` facade as `voice_phase_duration_seconds`.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    entries: Mutex<BTreeMap<String, Metric>>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut BTreeMap<String, Metric>) -> R) -> R {
        // A poisoned lock only means a panic elsewhere; the map is still usable.
        let mut guard = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn export(name: &str, duration: Duration) {
        let labels = [("phase", name.to_string())];
        metrics::histogram!("voice_phase_duration_seconds", &labels)
            .record(duration.as_secs_f64());
    }
}

impl MetricsRecorder for InMemoryRecorder {
    fn start(&self, name: &str) {
        self.with_entries(|entries| {
            entries.insert(
                name.to_string(),
                Metric::Interval {
                    start: Instant::now(),
                    end: None,
                    duration: None,
                },
            );
        });
    }

    fn stop(&self, name: &str) {
        let stopped = self.with_entries(|entries| match entries.get_mut(name) {
            Some(Metric::Interval {
                start,
                end,
                duration,
            }) => {
                let now = Instant::now();
                let elapsed = now.saturating_duration_since(*start);
                *end = Some(now);
                *duration = Some(elapsed);
                Some(elapsed)
            }
            _ => None,
        });

        match stopped {
            Some(elapsed) => Self::export(name, elapsed),
            None => warn!(metric = name, "Metric was not started properly"),
        }
    }

    fn record_interval(&self, name: &str, start: Instant, end: Instant) {
        let elapsed = end.saturating_duration_since(start);
        self.with_entries(|entries| {
            entries.insert(
                name.to_string(),
                Metric::Interval {
                    start,
                    end: Some(end),
                    duration: Some(elapsed),
                },
            );
        });
        Self::export(name, elapsed);
    }

    fn mark(&self, name: &str) {
        self.with_entries(|entries| {
            entries.insert(name.to_string(), Metric::Mark(Instant::now()));
        });
    }

    fn log(&self, name: &str, value: f64) {
        self.with_entries(|entries| {
            entries.insert(name.to_string(), Metric::Value(value));
        });
    }

    fn get(&self, name: &str) -> Option<Metric> {
        self.with_entries(|entries| entries.get(name).cloned())
    }

    fn report(&self) -> String {
        self.with_entries(|entries| {
            let mut out = String::from("==== Performance Metrics Report ====\n");
            for (name, metric) in entries.iter() {
                out.push_str(&MetricLine(name, metric).to_string());
                out.push('\n');
            }
            out.push_str("====================================");
            out
        })
    }
}
