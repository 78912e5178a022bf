//! Atomic metric primitives.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can move in both directions.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sub(&self, n: i64) {
        self.value.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter split by a single label (for example an error kind).
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    help: &'static str,
    label_name: &'static str,
    counters: RwLock<BTreeMap<&'static str, AtomicU64>>,
}

impl LabeledCounter {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str, label_name: &'static str) -> Self {
        Self {
            name,
            help,
            label_name,
            counters: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn label_name(&self) -> &'static str {
        self.label_name
    }

    /// Increment the series for `label` by 1.
    pub fn inc(&self, label: &'static str) {
        self.inc_by(label, 1);
    }

    /// Increment the series for `label` by `n`.
    pub fn inc_by(&self, label: &'static str, n: u64) {
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(label) {
                counter.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }

        self.counters
            .write()
            .entry(label)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Value for one label, zero if never incremented.
    pub fn get(&self, label: &str) -> u64 {
        self.counters
            .read()
            .get(label)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// All series, ordered by label.
    pub fn get_all(&self) -> Vec<(&'static str, u64)> {
        self.counters
            .read()
            .iter()
            .map(|(label, v)| (*label, v.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "A test counter");
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge", "A test gauge");
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
        gauge.set(10);
        gauge.sub(3);
        assert_eq!(gauge.get(), 7);
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::new("failures", "Failures by kind", "kind");
        counter.inc("timeout");
        counter.inc("timeout");
        counter.inc("source_not_ready");

        assert_eq!(counter.get("timeout"), 2);
        assert_eq!(counter.get("source_not_ready"), 1);
        assert_eq!(counter.get("aborted"), 0);
        assert_eq!(counter.get_all().len(), 2);
    }
}
