//! Execution latency window
//!
//! Keeps the last `capacity` execution times and a running total, so the
//! average costs nothing to read while request threads keep recording.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Samples {
    recent: VecDeque<Duration>,
    capacity: usize,
    total: Duration,
}

impl Samples {
    fn push(&mut self, elapsed: Duration) {
        if self.recent.len() == self.capacity {
            if let Some(oldest) = self.recent.pop_front() {
                self.total -= oldest;
            }
        }
        self.recent.push_back(elapsed);
        self.total += elapsed;
    }

    fn average(&self) -> Duration {
        match self.recent.len() {
            0 => Duration::ZERO,
            n => self.total / n as u32,
        }
    }
}

pub struct LatencyWindow {
    samples: Mutex<Samples>,
}

impl LatencyWindow {
    /// Window over the last `capacity` executions, at least one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(Samples {
                recent: VecDeque::with_capacity(capacity),
                capacity,
                total: Duration::ZERO,
            }),
        }
    }

    pub fn begin(&self) -> Instant {
        Instant::now()
    }

    pub fn end(&self, started: Instant) {
        self.record(started.elapsed());
    }

    pub fn record(&self, elapsed: Duration) {
        // A panic while holding this lock leaves the samples intact.
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.push(elapsed);
    }

    pub fn len(&self) -> usize {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn average_ms(&self) -> f64 {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.average().as_secs_f64() * 1000.0
    }

    /// Fastest and slowest execution in the window; zeros when empty.
    pub fn range_ms(&self) -> (f64, f64) {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let min = samples.recent.iter().min().copied().unwrap_or_default();
        let max = samples.recent.iter().max().copied().unwrap_or_default();
        (min.as_secs_f64() * 1000.0, max.as_secs_f64() * 1000.0)
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(128)
    }
}
