//! Resource admission checks for dispatch throttling.
//!
//! The guard samples process RSS and global CPU usage via `sysinfo` and
//! compares them against configured ceilings. Samples are cached for a
//! short TTL so a busy dispatch loop does not hammer the OS.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Ceilings and polling knobs for the guard.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Admission fails when sampled global CPU usage reaches this percentage.
    pub cpu_ceiling_pct: f32,
    /// Admission fails when process RSS reaches this many bytes.
    pub rss_ceiling_bytes: u64,
    /// How long a sample stays fresh.
    pub cache_ttl: Duration,
    /// How long dispatch stalls on denial when nothing is running.
    pub dispatch_poll: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_ceiling_pct: 90.0,
            rss_ceiling_bytes: u64::MAX,
            cache_ttl: Duration::from_millis(200),
            dispatch_poll: Duration::from_millis(250),
        }
    }
}

/// One point-in-time resource sample.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub cpu_pct: f32,
    pub rss_bytes: u64,
    pub taken_at: Instant,
}

struct GuardInner {
    system: System,
    pid: Option<Pid>,
    last: Option<ResourceSample>,
}

/// Admission gate consulted before each target dispatch.
pub struct ResourceGuard {
    limits: ResourceLimits,
    inner: Mutex<GuardInner>,
}

impl ResourceGuard {
    pub fn new(limits: ResourceLimits) -> Self {
        let pid = sysinfo::get_current_pid().ok();
        Self {
            limits,
            inner: Mutex::new(GuardInner {
                system: System::new(),
                pid,
                last: None,
            }),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn dispatch_poll(&self) -> Duration {
        self.limits.dispatch_poll
    }

    /// Take (or reuse) a sample of CPU and RSS.
    pub fn sample(&self) -> ResourceSample {
        let mut inner = self.inner.lock().expect("resource guard poisoned");
        if let Some(last) = inner.last {
            if last.taken_at.elapsed() < self.limits.cache_ttl {
                return last;
            }
        }

        inner.system.refresh_cpu_usage();
        let cpu_pct = inner.system.global_cpu_usage();

        let rss_bytes = match inner.pid {
            Some(pid) => {
                inner
                    .system
                    .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                inner.system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => 0,
        };

        let sample = ResourceSample {
            cpu_pct,
            rss_bytes,
            taken_at: Instant::now(),
        };
        inner.last = Some(sample);
        sample
    }

    /// Admission test: both CPU and RSS must be under their ceilings.
    pub fn admit(&self) -> bool {
        let sample = self.sample();
        let admitted = sample.cpu_pct < self.limits.cpu_ceiling_pct
            && sample.rss_bytes < self.limits.rss_ceiling_bytes;
        if !admitted {
            tracing::debug!(
                cpu_pct = sample.cpu_pct,
                rss_bytes = sample.rss_bytes,
                "resource admission denied"
            );
        }
        admitted
    }

    /// Whether the machine is comfortably idle: sampled CPU below half the
    /// ceiling. The adaptive strategy widens only under this condition.
    pub fn cpu_low(&self) -> bool {
        self.sample().cpu_pct < self.limits.cpu_ceiling_pct / 2.0
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("limits", &self.limits)
            .finish()
    }
}
