//! Physical memory breakdown from paging statistics.
//!
//! Format of /proc/vmstat, one counter per line, values in pages:
//!   nr_free_pages 123456
//!   nr_active_anon 2345
//!   ...

use crate::error::{MetricsError, Result};
use crate::types::MemorySnapshot;
use chrono::Utc;
use log::{debug, error, warn};
use procfs::{Current, Meminfo};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::sync::{Mutex, PoisonError};

/// Page counts from the kernel's paging statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmPages {
    pub free: u64,
    pub active: u64,
    pub inactive: u64,
    pub wired: u64,
}

pub trait MemoryStatsSource: Send + Sync {
    /// Installed physical memory in bytes.
    fn total_memory(&self) -> Result<u64>;
    fn vm_pages(&self) -> Result<VmPages>;
    fn page_size(&self) -> u64;
}

/// Alternate vmstat file, for hosts that expose it somewhere other than /proc.
fn vmstat_override() -> Option<String> {
    env::var("SYSMOND_VMSTAT_PATH").ok()
}

/// `/proc/meminfo` for the total, `/proc/vmstat` for page counts.
pub struct ProcMemoryStats;

impl MemoryStatsSource for ProcMemoryStats {
    fn total_memory(&self) -> Result<u64> {
        Ok(Meminfo::current()?.mem_total)
    }

    fn vm_pages(&self) -> Result<VmPages> {
        if let Some(path) = vmstat_override() {
            let content = fs::read_to_string(&path)
                .map_err(|e| MetricsError::KernelApi(format!("failed to read {path}: {e}")))?;
            return parse_vmstat(&content);
        }
        let table = procfs::vmstat()?;
        pages_from(|key| table.get(key).and_then(|v| u64::try_from(*v).ok()))
    }

    fn page_size(&self) -> u64 {
        procfs::page_size()
    }
}

/// Extract the counters the sampler needs from `/proc/vmstat` text.
///
/// `nr_free_pages` is mandatory; the LRU counters default to zero on kernels
/// that do not split them.
pub fn parse_vmstat(content: &str) -> Result<VmPages> {
    let counters: HashMap<&str, u64> = content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let value = parts.next()?.parse::<u64>().ok()?;
            Some((key, value))
        })
        .collect();

    pages_from(|key| counters.get(key).copied())
}

fn pages_from(lookup: impl Fn(&str) -> Option<u64>) -> Result<VmPages> {
    let get = |key: &str| lookup(key).unwrap_or(0);

    let free = lookup("nr_free_pages")
        .ok_or_else(|| MetricsError::InvalidData("vmstat lacks nr_free_pages".to_string()))?;

    Ok(VmPages {
        free,
        active: get("nr_active_anon") + get("nr_active_file"),
        inactive: get("nr_inactive_anon") + get("nr_inactive_file"),
        wired: get("nr_unevictable"),
    })
}

pub struct MemorySampler {
    source: Box<dyn MemoryStatsSource>,
    last_good: Mutex<Option<MemorySnapshot>>,
}

impl MemorySampler {
    pub fn new(source: Box<dyn MemoryStatsSource>) -> Self {
        Self {
            source,
            last_good: Mutex::new(None),
        }
    }

    pub fn procfs() -> Self {
        Self::new(Box::new(ProcMemoryStats))
    }

    pub fn sample(&self) -> Result<MemorySnapshot> {
        match self.read() {
            Ok(snapshot) => {
                *self.last_good.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(err) => {
                error!("[memory] failed to collect memory statistics: {err}");
                match self
                    .last_good
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                {
                    Some(fallback) => {
                        warn!("[memory] returning cached snapshot");
                        Ok(fallback)
                    }
                    None => Err(err),
                }
            }
        }
    }

    fn read(&self) -> Result<MemorySnapshot> {
        let pages = self.source.vm_pages()?;
        let total_bytes = self.source.total_memory()?;
        if total_bytes == 0 {
            return Err(MetricsError::InvalidData(
                "total physical memory reported as zero".to_string(),
            ));
        }
        let page_size = self.source.page_size();

        let available_bytes = pages.free.saturating_mul(page_size).min(total_bytes);
        let used_bytes = total_bytes - available_bytes;
        let usage_percent = used_bytes as f64 / total_bytes as f64 * 100.0;

        debug!(
            "[memory] used={} total={} ({usage_percent:.1}%)",
            used_bytes, total_bytes
        );

        Ok(MemorySnapshot {
            timestamp: Utc::now(),
            used_bytes,
            available_bytes,
            total_bytes,
            usage_percent,
            active_bytes: pages.active.saturating_mul(page_size),
            inactive_bytes: pages.inactive.saturating_mul(page_size),
            wired_bytes: pages.wired.saturating_mul(page_size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedMemoryStats;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn pages(free: u64) -> VmPages {
        VmPages {
            free,
            active: 1000,
            inactive: 500,
            wired: 200,
        }
    }

    #[test]
    fn test_parse_vmstat() {
        let content = "nr_free_pages 2048\nnr_zone_inactive_anon 1\nnr_inactive_anon 10\n\
                       nr_active_anon 20\nnr_inactive_file 30\nnr_active_file 40\n\
                       nr_unevictable 5\npgfault 999999\n";
        let pages = parse_vmstat(content).unwrap();
        assert_eq!(pages.free, 2048);
        assert_eq!(pages.active, 60);
        assert_eq!(pages.inactive, 40);
        assert_eq!(pages.wired, 5);
    }

    #[test]
    fn test_parse_vmstat_missing_free() {
        let content = "nr_active_anon 20\n";
        assert!(matches!(
            parse_vmstat(content),
            Err(MetricsError::InvalidData(_))
        ));
    }

    #[test]
    fn test_parse_vmstat_skips_garbage() {
        let content = "nr_free_pages 7\nbroken\nnr_active_file abc\n";
        let pages = parse_vmstat(content).unwrap();
        assert_eq!(pages.free, 7);
        assert_eq!(pages.active, 0);
    }

    #[test]
    fn converts_pages_to_bytes() {
        let source = ScriptedMemoryStats::new(8 * GIB, 4096, vec![Ok(pages(262_144))]);
        let sampler = MemorySampler::new(Box::new(source));
        let snap = sampler.sample().unwrap();

        assert_eq!(snap.available_bytes, GIB);
        assert_eq!(snap.used_bytes, 7 * GIB);
        assert_eq!(snap.used_bytes + snap.available_bytes, snap.total_bytes);
        assert_eq!(snap.active_bytes, 1000 * 4096);
        assert_eq!(snap.wired_bytes, 200 * 4096);
        let expected = snap.used_bytes as f64 / snap.total_bytes as f64 * 100.0;
        assert!((snap.usage_percent - expected).abs() < 1e-9);
        assert!((0.0..=100.0).contains(&snap.usage_percent));
    }

    #[test]
    fn second_call_failure_returns_first_snapshot() {
        let source = ScriptedMemoryStats::new(
            4 * GIB,
            4096,
            vec![
                Ok(pages(1000)),
                Err(MetricsError::KernelApi("/proc/vmstat unreadable".into())),
            ],
        );
        let sampler = MemorySampler::new(Box::new(source));
        let first = sampler.sample().unwrap();
        let second = sampler.sample().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn first_call_failure_propagates() {
        let source = ScriptedMemoryStats::new(
            4 * GIB,
            4096,
            vec![Err(MetricsError::KernelApi("vmstat".into()))],
        );
        let sampler = MemorySampler::new(Box::new(source));
        assert!(matches!(sampler.sample(), Err(MetricsError::KernelApi(_))));
    }

    #[test]
    fn zero_total_is_invalid() {
        let source = ScriptedMemoryStats::new(0, 4096, vec![Ok(pages(0))]);
        let sampler = MemorySampler::new(Box::new(source));
        assert!(matches!(sampler.sample(), Err(MetricsError::InvalidData(_))));
    }

    #[test]
    fn free_exceeding_total_is_clamped() {
        let source = ScriptedMemoryStats::new(4096 * 10, 4096, vec![Ok(pages(50))]);
        let sampler = MemorySampler::new(Box::new(source));
        let snap = sampler.sample().unwrap();
        assert_eq!(snap.used_bytes, 0);
        assert_eq!(snap.usage_percent, 0.0);
    }

    #[test]
    fn reads_live_vmstat() {
        let pages = ProcMemoryStats.vm_pages().unwrap();
        assert!(pages.free > 0);
        assert!(pages.active + pages.inactive > 0);
    }

    #[test]
    fn samples_live_memory() {
        let snap = MemorySampler::procfs().sample().unwrap();
        assert!(snap.total_bytes > 0);
        assert!(snap.available_bytes <= snap.total_bytes);
        assert_eq!(snap.used_bytes + snap.available_bytes, snap.total_bytes);
        assert!((0.0..=100.0).contains(&snap.usage_percent));
    }
}
