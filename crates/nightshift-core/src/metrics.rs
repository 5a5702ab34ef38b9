//! Execution counters and timers.
//!
//! Counters are lock-free atomics; duration stats take a short per-map
//! mutex. The whole collector exports as a single JSON snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

/// Aggregated duration statistics for one named timer.
#[derive(Debug, Clone, Copy)]
pub struct DurationStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl DurationStats {
    fn record(&mut self, d: Duration) {
        self.count += 1;
        self.total += d;
        self.min = self.min.min(d);
        self.max = self.max.max(d);
    }

    fn single(d: Duration) -> Self {
        Self {
            count: 1,
            total: d,
            min: d,
            max: d,
        }
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }

    fn to_json(self) -> Value {
        json!({
            "count": self.count,
            "min_ms": self.min.as_millis() as u64,
            "max_ms": self.max.as_millis() as u64,
            "mean_ms": self.mean().as_millis() as u64,
        })
    }
}

/// Thread-safe counters and timers for tasks and targets.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    tasks_started: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
    targets_started: AtomicU64,
    targets_completed: AtomicU64,
    targets_failed: AtomicU64,
    targets_skipped: AtomicU64,
    targets_cancelled: AtomicU64,
    task_timers: Mutex<HashMap<String, DurationStats>>,
    target_timers: Mutex<HashMap<String, DurationStats>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- counters -----------------------------------------------------------

    pub fn add_tasks_started(&self, n: u64) {
        self.tasks_started.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tasks_completed(&self, n: u64) {
        self.tasks_completed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tasks_failed(&self, n: u64) {
        self.tasks_failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tasks_cancelled(&self, n: u64) {
        self.tasks_cancelled.fetch_add(n, Ordering::Relaxed);
    }

    pub fn target_started(&self) {
        self.targets_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn target_completed(&self) {
        self.targets_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn target_failed(&self) {
        self.targets_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn target_skipped(&self) {
        self.targets_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn target_cancelled(&self) {
        self.targets_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn targets_completed(&self) -> u64 {
        self.targets_completed.load(Ordering::Relaxed)
    }

    pub fn targets_failed(&self) -> u64 {
        self.targets_failed.load(Ordering::Relaxed)
    }

    pub fn targets_skipped(&self) -> u64 {
        self.targets_skipped.load(Ordering::Relaxed)
    }

    pub fn targets_cancelled(&self) -> u64 {
        self.targets_cancelled.load(Ordering::Relaxed)
    }

    /// Total targets that reached any terminal status.
    pub fn targets_terminal(&self) -> u64 {
        self.targets_completed()
            + self.targets_failed()
            + self.targets_skipped()
            + self.targets_cancelled()
    }

    // -- timers -------------------------------------------------------------

    pub fn record_task_duration(&self, name: &str, duration: Duration) {
        let mut timers = self.task_timers.lock().expect("task timers poisoned");
        timers
            .entry(name.to_owned())
            .and_modify(|s| s.record(duration))
            .or_insert_with(|| DurationStats::single(duration));
    }

    pub fn record_target_duration(&self, name: &str, duration: Duration) {
        let mut timers = self.target_timers.lock().expect("target timers poisoned");
        timers
            .entry(name.to_owned())
            .and_modify(|s| s.record(duration))
            .or_insert_with(|| DurationStats::single(duration));
    }

    pub fn task_stats(&self, name: &str) -> Option<DurationStats> {
        self.task_timers
            .lock()
            .expect("task timers poisoned")
            .get(name)
            .copied()
    }

    pub fn target_stats(&self, name: &str) -> Option<DurationStats> {
        self.target_timers
            .lock()
            .expect("target timers poisoned")
            .get(name)
            .copied()
    }

    /// Export the full collector as one JSON object.
    pub fn snapshot(&self) -> Value {
        let task_timers = self.task_timers.lock().expect("task timers poisoned");
        let target_timers = self.target_timers.lock().expect("target timers poisoned");

        let timers_json = |timers: &HashMap<String, DurationStats>| -> Value {
            let mut map = serde_json::Map::new();
            let mut names: Vec<&String> = timers.keys().collect();
            names.sort();
            for name in names {
                map.insert(name.clone(), timers[name].to_json());
            }
            Value::Object(map)
        };

        json!({
            "counters": {
                "tasks": {
                    "started": self.tasks_started.load(Ordering::Relaxed),
                    "completed": self.tasks_completed.load(Ordering::Relaxed),
                    "failed": self.tasks_failed.load(Ordering::Relaxed),
                    "cancelled": self.tasks_cancelled.load(Ordering::Relaxed),
                },
                "targets": {
                    "started": self.targets_started.load(Ordering::Relaxed),
                    "completed": self.targets_completed(),
                    "failed": self.targets_failed(),
                    "skipped": self.targets_skipped(),
                    "cancelled": self.targets_cancelled(),
                },
            },
            "timers": {
                "tasks": timers_json(&task_timers),
                "targets": timers_json(&target_timers),
            },
        })
    }
}
