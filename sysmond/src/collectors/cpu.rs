//! Processor utilisation from cumulative kernel tick counters.
//!
//! `/proc/stat` reports ticks spent per mode since boot. A single read carries
//! no rate information, so the sampler keeps the previous reading and reports
//! each bucket's share of the ticks elapsed between two consecutive calls.

use crate::error::Result;
use crate::types::CpuSnapshot;
use chrono::Utc;
use log::{debug, warn};
use procfs::{CurrentSI, KernelStats};
use std::sync::{Mutex, PoisonError};

/// Cumulative ticks since boot, grouped into the four buckets the sampler reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTicks {
    pub user: u64,
    pub system: u64,
    pub idle: u64,
    pub nice: u64,
}

pub trait CpuTickSource: Send + Sync {
    fn read_ticks(&self) -> Result<CpuTicks>;
}

/// Aggregate `cpu` line of `/proc/stat`.
pub struct ProcStatTicks;

impl CpuTickSource for ProcStatTicks {
    fn read_ticks(&self) -> Result<CpuTicks> {
        let stats = KernelStats::current()?;
        let t = stats.total;
        Ok(CpuTicks {
            user: t.user,
            system: t.system + t.irq.unwrap_or(0) + t.softirq.unwrap_or(0),
            idle: t.idle + t.iowait.unwrap_or(0),
            nice: t.nice,
        })
    }
}

#[derive(Default)]
struct CpuBaseline {
    previous: Option<CpuTicks>,
    last_good: Option<CpuSnapshot>,
}

pub struct CpuSampler {
    source: Box<dyn CpuTickSource>,
    baseline: Mutex<CpuBaseline>,
}

impl CpuSampler {
    pub fn new(source: Box<dyn CpuTickSource>) -> Self {
        Self {
            source,
            baseline: Mutex::new(CpuBaseline::default()),
        }
    }

    pub fn procfs() -> Self {
        Self::new(Box::new(ProcStatTicks))
    }

    /// Usage over the interval since the previous call to this sampler.
    ///
    /// The first call only records a baseline and returns an all-zero snapshot.
    pub fn sample(&self) -> Result<CpuSnapshot> {
        let mut baseline = self.baseline.lock().unwrap_or_else(PoisonError::into_inner);

        let current = match self.source.read_ticks() {
            Ok(ticks) => ticks,
            Err(err) => {
                warn!("[cpu] tick query failed: {err}");
                return match &baseline.last_good {
                    Some(snapshot) => {
                        debug!("[cpu] returning last good snapshot");
                        Ok(snapshot.clone())
                    }
                    None => Err(err),
                };
            }
        };

        let snapshot = match baseline.previous {
            None => CpuSnapshot::zero(),
            Some(previous) => compute_usage(previous, current),
        };

        baseline.previous = Some(current);
        baseline.last_good = Some(snapshot.clone());
        Ok(snapshot)
    }
}

fn compute_usage(previous: CpuTicks, current: CpuTicks) -> CpuSnapshot {
    let user_diff = current.user.wrapping_sub(previous.user);
    let system_diff = current.system.wrapping_sub(previous.system);
    let idle_diff = current.idle.wrapping_sub(previous.idle);
    let nice_diff = current.nice.wrapping_sub(previous.nice);

    // Niced time is user-mode time; it counts toward the user share so the
    // three reported shares cover the whole interval.
    let user_diff = user_diff.wrapping_add(nice_diff);
    let total_diff = user_diff
        .wrapping_add(system_diff)
        .wrapping_add(idle_diff);

    let share = |diff: u64| {
        if total_diff == 0 {
            0.0
        } else {
            (diff as f64 / total_diff as f64 * 100.0).clamp(0.0, 100.0)
        }
    };

    let user = share(user_diff);
    let system = share(system_diff);
    let idle = share(idle_diff);

    CpuSnapshot {
        timestamp: Utc::now(),
        total_usage_percent: (user + system).min(100.0),
        system_usage_percent: system,
        user_usage_percent: user,
        idle_percent: idle,
    }
}
