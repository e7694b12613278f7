//! Kiln Metrics - Counters and latency tracking for the unit engine
//!
//! Provides zero-cost abstractions for metrics collection that completely
//! vanish in production builds via feature flags.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable metrics collection (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use kiln_metrics::{Counter, Event, LatencyWindow};
//!
//! let counter = Counter::new();
//! counter.increment(Event::Compile);
//!
//! let window = LatencyWindow::new(128);
//! let started = window.begin();
//! // ... execute a unit ...
//! window.end(started);
//! println!("avg exec: {:.2}ms", window.average_ms());
//! ```
//!
//! All types here are `Sync`: the engine records from many request threads
//! at once. In production builds (without `metrics` feature) every call is a
//! no-op and `snapshot()` reports zeros.

#[cfg(feature = "metrics")]
mod counter;
#[cfg(feature = "metrics")]
mod latency;

#[cfg(feature = "metrics")]
pub use counter::Counter;
#[cfg(feature = "metrics")]
pub use latency::LatencyWindow;

/// Engine events that are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Compile,
    CompileFailure,
    Execute,
    ErrorPage,
    Renewal,
    Invalidation,
    Eviction,
    ShutdownRace,
}

impl Event {
    pub const COUNT: usize = 8;

    pub const ALL: [Event; Event::COUNT] = [
        Event::Compile,
        Event::CompileFailure,
        Event::Execute,
        Event::ErrorPage,
        Event::Renewal,
        Event::Invalidation,
        Event::Eviction,
        Event::ShutdownRace,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Event::Compile => "compile",
            Event::CompileFailure => "compile_failure",
            Event::Execute => "execute",
            Event::ErrorPage => "error_page",
            Event::Renewal => "renewal",
            Event::Invalidation => "invalidation",
            Event::Eviction => "eviction",
            Event::ShutdownRace => "shutdown_race",
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    values: [u64; Event::COUNT],
}

impl Snapshot {
    pub fn from_values(values: [u64; Event::COUNT]) -> Self {
        Self { values }
    }

    pub fn get(&self, event: Event) -> u64 {
        self.values[event.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Event, u64)> + '_ {
        Event::ALL.iter().map(move |&event| (event, self.get(event)))
    }
}

// ============================================================================
// Macros for conditional compilation
// ============================================================================

/// Execute code only when metrics are enabled
#[macro_export]
macro_rules! metrics {
    ($($tt:tt)*) => {
        #[cfg(feature = "metrics")]
        {
            $($tt)*
        }
    };
}

/// Time a scope into a latency window (zero-cost when metrics disabled)
#[macro_export]
macro_rules! time_scope {
    ($window:expr, $body:block) => {{
        let started = $window.begin();
        let result = $body;
        $window.end(started);
        result
    }};
}

// ============================================================================
// No-op stubs when metrics disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Default)]
pub struct Counter;

#[cfg(not(feature = "metrics"))]
impl Counter {
    pub fn new() -> Self { Self }
    pub fn increment(&self, _event: Event) {}
    pub fn add(&self, _event: Event, _value: u64) {}
    pub fn get(&self, _event: Event) -> u64 { 0 }
    pub fn reset_all(&self) {}
    pub fn snapshot(&self) -> Snapshot { Snapshot::default() }
}

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Default)]
pub struct LatencyWindow;

#[cfg(not(feature = "metrics"))]
impl LatencyWindow {
    pub fn new(_capacity: usize) -> Self { Self }
    pub fn begin(&self) {}
    pub fn end(&self, _started: ()) {}
    pub fn record(&self, _elapsed: std::time::Duration) {}
    pub fn len(&self) -> usize { 0 }
    pub fn is_empty(&self) -> bool { true }
    pub fn average_ms(&self) -> f64 { 0.0 }
    pub fn range_ms(&self) -> (f64, f64) { (0.0, 0.0) }
}
