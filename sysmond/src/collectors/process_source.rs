use log::debug;
use procfs::process::{Process, all_processes};

/// Resource usage of one process at the moment it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskUsage {
    pub resident_bytes: u64,
    /// Cumulative user-mode CPU time, nanoseconds.
    pub total_user_ns: u64,
    /// Cumulative kernel-mode CPU time, nanoseconds.
    pub total_system_ns: u64,
}

/// Boundary between the process sampler and the OS process table.
///
/// Every lookup is best effort: a process can exit between being listed and
/// being queried, which shows up as `None`.
pub trait ProcessDataProvider: Send + Sync {
    fn all_pids(&self) -> Vec<i32>;
    fn task_usage(&self, pid: i32) -> Option<TaskUsage>;
    fn process_name(&self, pid: i32) -> Option<String>;
}

/// Reads `/proc/<pid>/stat`.
pub struct ProcfsProcessProvider {
    page_size: u64,
    ticks_per_second: u64,
}

impl ProcfsProcessProvider {
    pub fn new() -> Self {
        Self {
            page_size: procfs::page_size(),
            ticks_per_second: procfs::ticks_per_second().max(1),
        }
    }

    fn ticks_to_ns(&self, ticks: u64) -> u64 {
        (ticks as u128 * 1_000_000_000 / self.ticks_per_second as u128) as u64
    }
}

impl Default for ProcfsProcessProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessDataProvider for ProcfsProcessProvider {
    fn all_pids(&self) -> Vec<i32> {
        match all_processes() {
            Ok(iter) => iter.filter_map(|p| p.ok()).map(|p| p.pid()).collect(),
            Err(err) => {
                debug!("[process] failed to list /proc: {err}");
                Vec::new()
            }
        }
    }

    fn task_usage(&self, pid: i32) -> Option<TaskUsage> {
        let stat = Process::new(pid).ok()?.stat().ok()?;
        Some(TaskUsage {
            resident_bytes: stat.rss.saturating_mul(self.page_size),
            total_user_ns: self.ticks_to_ns(stat.utime),
            total_system_ns: self.ticks_to_ns(stat.stime),
        })
    }

    fn process_name(&self, pid: i32) -> Option<String> {
        Process::new(pid).ok()?.stat().ok().map(|s| s.comm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversion_uses_clock_rate() {
        let provider = ProcfsProcessProvider {
            page_size: 4096,
            ticks_per_second: 100,
        };
        assert_eq!(provider.ticks_to_ns(150), 1_500_000_000);
    }

    #[test]
    fn reads_own_process() {
        let provider = ProcfsProcessProvider::new();
        let me = std::process::id() as i32;
        assert!(provider.all_pids().contains(&me));
        let usage = provider.task_usage(me).expect("own stat readable");
        assert!(usage.resident_bytes > 0);
        assert!(provider.process_name(me).is_some());
    }
}
