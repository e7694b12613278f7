//! Event counters shared across request threads

use crate::{Event, Snapshot};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter {
    slots: [AtomicU64; Event::COUNT],
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, event: Event) {
        self.add(event, 1);
    }

    pub fn add(&self, event: Event, value: u64) {
        self.slots[event.index()].fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self, event: Event) -> u64 {
        self.slots[event.index()].load(Ordering::Relaxed)
    }

    pub fn reset_all(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut values = [0; Event::COUNT];
        for (value, slot) in values.iter_mut().zip(&self.slots) {
            *value = slot.load(Ordering::Relaxed);
        }
        Snapshot::from_values(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_from_many_threads() {
        let counter = Counter::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        counter.increment(Event::Execute);
                    }
                });
            }
        });
        assert_eq!(counter.get(Event::Execute), 4000);
        assert_eq!(counter.snapshot().get(Event::Compile), 0);

        counter.reset_all();
        assert_eq!(counter.get(Event::Execute), 0);
    }
}
