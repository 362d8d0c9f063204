//! Top-N process table with a two-speed refresh.
//!
//! A full refresh lists every PID, ranks them by resident memory and keeps the
//! heaviest `max_tracked_pids`. A quick refresh only re-reads the PIDs already
//! tracked. New processes therefore stay invisible until the next full
//! refresh.

use super::process_source::{ProcessDataProvider, TaskUsage};
use crate::clock::{Clock, elapsed_exceeds};
use crate::config::ProcessConfig;
use crate::types::{ProcessRecord, SortMetric};
use log::{debug, info};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const UNKNOWN_NAME: &str = "Unknown";

#[derive(Debug, Clone)]
pub struct ProcessSamplerSettings {
    pub full_refresh_interval: Duration,
    pub quick_refresh_interval: Duration,
    pub name_cache_ttl: Duration,
    pub max_tracked_pids: usize,
    pub max_cached_processes: usize,
    pub cpu_ceiling_percent: f64,
}

impl Default for ProcessSamplerSettings {
    fn default() -> Self {
        Self {
            full_refresh_interval: Duration::from_secs(10),
            quick_refresh_interval: Duration::from_secs(1),
            name_cache_ttl: Duration::from_secs(60),
            max_tracked_pids: 200,
            max_cached_processes: 100,
            cpu_ceiling_percent: 800.0,
        }
    }
}

impl From<&ProcessConfig> for ProcessSamplerSettings {
    fn from(cfg: &ProcessConfig) -> Self {
        Self {
            full_refresh_interval: Duration::from_millis(cfg.full_refresh_ms),
            quick_refresh_interval: Duration::from_millis(cfg.quick_refresh_ms),
            name_cache_ttl: Duration::from_secs(cfg.name_cache_ttl_secs),
            max_tracked_pids: cfg.max_tracked_pids,
            max_cached_processes: cfg.max_cached_processes,
            cpu_ceiling_percent: cfg.cpu_ceiling_percent,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CpuBaseline {
    total_user_ns: u64,
    total_system_ns: u64,
    sampled_at: Duration,
}

#[derive(Debug, Clone)]
struct CachedName {
    name: String,
    cached_at: Duration,
}

#[derive(Default)]
struct ProcessCache {
    baselines: HashMap<i32, CpuBaseline>,
    names: HashMap<i32, CachedName>,
    records: Vec<ProcessRecord>,
    /// Tracked PIDs in memory-rank order from the last full refresh.
    tracked: Vec<i32>,
    last_full_refresh: Option<Duration>,
    last_quick_refresh: Option<Duration>,
}

pub struct ProcessSampler {
    provider: Arc<dyn ProcessDataProvider>,
    clock: Arc<dyn Clock>,
    settings: ProcessSamplerSettings,
    cache: Mutex<ProcessCache>,
}

impl ProcessSampler {
    pub fn new(
        provider: Arc<dyn ProcessDataProvider>,
        clock: Arc<dyn Clock>,
        settings: ProcessSamplerSettings,
    ) -> Self {
        Self {
            provider,
            clock,
            settings,
            cache: Mutex::new(ProcessCache::default()),
        }
    }

    pub fn settings(&self) -> &ProcessSamplerSettings {
        &self.settings
    }

    /// Up to `limit` records, ordered descending by `sort_by`. Never fails;
    /// processes that cannot be read are simply left out.
    pub fn top_processes(&self, limit: usize, sort_by: SortMetric) -> Vec<ProcessRecord> {
        // Held across the refresh. A full refresh reads every /proc/<pid>/stat,
        // and `reset_cache` or `tracked_count` callers wait for it to finish.
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();

        if elapsed_exceeds(now, cache.last_full_refresh, self.settings.full_refresh_interval) {
            debug!("[process] performing full refresh");
            self.full_refresh(&mut cache, now);
        } else if elapsed_exceeds(
            now,
            cache.last_quick_refresh,
            self.settings.quick_refresh_interval,
        ) {
            debug!("[process] performing quick refresh");
            self.quick_refresh(&mut cache, now);
        }

        let mut sorted = cache.records.clone();
        drop(cache);

        sorted.sort_by(|a, b| compare_desc(a, b, sort_by));
        sorted.truncate(limit);
        sorted
    }

    /// Forget every baseline, name and record. The next call performs a full
    /// refresh and reports 0% CPU for every process.
    pub fn reset_cache(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.baselines.clear();
        cache.names.clear();
        cache.records.clear();
        cache.tracked.clear();
        cache.last_full_refresh = None;
        cache.last_quick_refresh = None;
        info!("[process] cache reset");
    }

    /// Size of the tracked set chosen by the last full refresh.
    pub fn tracked_count(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tracked
            .len()
    }

    fn full_refresh(&self, cache: &mut ProcessCache, now: Duration) {
        let started = Instant::now();

        let all = self.provider.all_pids();
        debug!("[process] found {} total processes", all.len());

        let mut by_memory: Vec<(i32, u64)> = all
            .into_iter()
            .filter_map(|pid| {
                let usage = self.provider.task_usage(pid)?;
                (usage.resident_bytes > 0).then_some((pid, usage.resident_bytes))
            })
            .collect();
        by_memory.sort_by(|a, b| b.1.cmp(&a.1));
        by_memory.truncate(self.settings.max_tracked_pids);

        let tracked: Vec<i32> = by_memory.into_iter().map(|(pid, _)| pid).collect();
        debug!("[process] tracking top {} processes by memory", tracked.len());

        self.evict(cache, &tracked, now);
        cache.tracked = tracked.clone();
        self.update_metrics(cache, &tracked, now);

        cache.last_full_refresh = Some(now);
        cache.last_quick_refresh = Some(now);

        debug!(
            "[process] full refresh completed in {:.3}s",
            started.elapsed().as_secs_f64()
        );
    }

    fn quick_refresh(&self, cache: &mut ProcessCache, now: Duration) {
        let started = Instant::now();

        let pids: Vec<i32> = cache
            .tracked
            .iter()
            .copied()
            .filter(|pid| cache.baselines.contains_key(pid))
            .collect();
        self.update_metrics(cache, &pids, now);
        cache.last_quick_refresh = Some(now);

        debug!(
            "[process] quick refresh completed in {:.3}s, {} processes",
            started.elapsed().as_secs_f64(),
            pids.len()
        );
    }

    fn evict(&self, cache: &mut ProcessCache, tracked: &[i32], now: Duration) {
        let keep: HashSet<i32> = tracked.iter().copied().collect();

        let states_before = cache.baselines.len();
        cache.baselines.retain(|pid, _| keep.contains(pid));

        let names_before = cache.names.len();
        let stale_after = self.settings.name_cache_ttl * 2;
        cache.names.retain(|pid, cached| {
            keep.contains(pid) && now.saturating_sub(cached.cached_at) <= stale_after
        });

        debug!(
            "[process] cleaned up {} old process states, {} old names",
            states_before - cache.baselines.len(),
            names_before - cache.names.len()
        );
    }

    fn update_metrics(&self, cache: &mut ProcessCache, pids: &[i32], now: Duration) {
        let mut records = Vec::with_capacity(pids.len().min(self.settings.max_cached_processes));

        for &pid in pids {
            if records.len() >= self.settings.max_cached_processes {
                break;
            }
            let Some(usage) = self.provider.task_usage(pid) else {
                continue;
            };
            let cpu_usage_percent = self.cpu_percent(cache, pid, &usage, now);
            let name = self.resolve_name(cache, pid, now);

            records.push(ProcessRecord {
                pid,
                name,
                cpu_usage_percent,
                memory_usage_bytes: usage.resident_bytes,
                network_bytes_sent: None,
                network_bytes_received: None,
            });
        }

        debug!("[process] cached {} process metrics", records.len());
        cache.records = records;
    }

    fn cpu_percent(
        &self,
        cache: &mut ProcessCache,
        pid: i32,
        usage: &TaskUsage,
        now: Duration,
    ) -> f64 {
        let previous = cache.baselines.insert(
            pid,
            CpuBaseline {
                total_user_ns: usage.total_user_ns,
                total_system_ns: usage.total_system_ns,
                sampled_at: now,
            },
        );

        let Some(prev) = previous else {
            return 0.0;
        };
        let wall_ns = now.saturating_sub(prev.sampled_at).as_nanos() as f64;
        if wall_ns <= 0.0 {
            return 0.0;
        }

        let cpu_ns = usage.total_user_ns.saturating_sub(prev.total_user_ns) as f64
            + usage.total_system_ns.saturating_sub(prev.total_system_ns) as f64;
        (cpu_ns / wall_ns * 100.0).clamp(0.0, self.settings.cpu_ceiling_percent)
    }

    fn resolve_name(&self, cache: &mut ProcessCache, pid: i32, now: Duration) -> String {
        if let Some(cached) = cache.names.get(&pid)
            && now.saturating_sub(cached.cached_at) < self.settings.name_cache_ttl
        {
            return cached.name.clone();
        }

        let name = self
            .provider
            .process_name(pid)
            .unwrap_or_else(|| UNKNOWN_NAME.to_string());
        cache.names.insert(
            pid,
            CachedName {
                name: name.clone(),
                cached_at: now,
            },
        );
        name
    }
}

fn compare_desc(a: &ProcessRecord, b: &ProcessRecord, metric: SortMetric) -> Ordering {
    match metric {
        SortMetric::Cpu => b.cpu_usage_percent.total_cmp(&a.cpu_usage_percent),
        SortMetric::Memory => b.memory_usage_bytes.cmp(&a.memory_usage_bytes),
        SortMetric::Network => b.network_total().cmp(&a.network_total()),
    }
}
