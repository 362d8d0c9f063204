//! Watches the daemon's own resident memory.
//!
//! The process table is the only cache that grows with the host, so it is the
//! one dropped when our footprint crosses the pressure threshold.

use crate::clock::Clock;
use crate::config::FootprintConfig;
use log::{info, warn};
use procfs::process::Process;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

pub type ResidentProbe = Box<dyn Fn() -> Option<u64> + Send + Sync>;

/// Resident bytes of the current process from `/proc/self/stat`.
pub fn own_resident_bytes() -> Option<u64> {
    let stat = Process::myself().ok()?.stat().ok()?;
    Some(stat.rss.saturating_mul(procfs::page_size()))
}

pub struct FootprintWatch {
    probe: ResidentProbe,
    clock: Arc<dyn Clock>,
    report_interval: Duration,
    warn_bytes: u64,
    pressure_bytes: u64,
    last_report: Mutex<Option<Duration>>,
}

impl FootprintWatch {
    pub fn new(cfg: &FootprintConfig, clock: Arc<dyn Clock>, probe: ResidentProbe) -> Self {
        Self {
            probe,
            clock,
            report_interval: Duration::from_secs(cfg.report_interval_secs),
            warn_bytes: cfg.warn_mib.saturating_mul(MIB),
            pressure_bytes: cfg.pressure_mib.saturating_mul(MIB),
            last_report: Mutex::new(None),
        }
    }

    /// Log the footprint if a report is due and return whether the caller
    /// should shed caches.
    pub fn check(&self) -> bool {
        let Some(resident) = (self.probe)() else {
            return false;
        };

        let now = self.clock.now();
        let mut last = self.last_report.lock().unwrap_or_else(PoisonError::into_inner);
        let due = last.is_none_or(|at| now.saturating_sub(at) > self.report_interval);
        if due {
            let mib = resident as f64 / MIB as f64;
            info!("[footprint] resident {mib:.2} MiB");
            if resident > self.warn_bytes {
                warn!("[footprint] high memory usage: {mib:.2} MiB");
            }
            *last = Some(now);
        }

        resident > self.pressure_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn watch(resident: Arc<AtomicU64>, clock: Arc<ManualClock>) -> FootprintWatch {
        let probe: ResidentProbe = Box::new(move || Some(resident.load(Ordering::SeqCst)));
        FootprintWatch::new(&FootprintConfig::default(), clock, probe)
    }

    #[test]
    fn pressure_above_threshold() {
        let resident = Arc::new(AtomicU64::new(10 * MIB));
        let w = watch(resident.clone(), Arc::new(ManualClock::new()));
        assert!(!w.check());
        resident.store(51 * MIB, Ordering::SeqCst);
        assert!(w.check());
    }

    #[test]
    fn report_is_rate_limited() {
        let clock = Arc::new(ManualClock::new());
        let w = watch(Arc::new(AtomicU64::new(MIB)), clock.clone());
        w.check();
        let first = *w.last_report.lock().unwrap();
        clock.advance(Duration::from_secs(30));
        w.check();
        assert_eq!(*w.last_report.lock().unwrap(), first);
        clock.advance(Duration::from_secs(31));
        w.check();
        assert_eq!(*w.last_report.lock().unwrap(), Some(Duration::from_secs(61)));
    }

    #[test]
    fn probe_failure_never_signals_pressure() {
        let probe: ResidentProbe = Box::new(|| None);
        let w = FootprintWatch::new(
            &FootprintConfig::default(),
            Arc::new(ManualClock::new()),
            probe,
        );
        assert!(!w.check());
    }

    #[test]
    fn reads_own_footprint() {
        assert!(own_resident_bytes().unwrap_or(0) > 0);
    }
}
