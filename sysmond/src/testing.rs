//! Scripted in-memory sources for driving the samplers without a live kernel.

use crate::collectors::cpu::{CpuTickSource, CpuTicks};
use crate::collectors::memory::{MemoryStatsSource, VmPages};
use crate::collectors::network::{InterfaceSource, LinkCounters, LinkRecord};
use crate::collectors::process_source::{ProcessDataProvider, TaskUsage};
use crate::error::{MetricsError, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Replays a fixed sequence of results, then repeats the last one forever.
struct Script<T: Clone> {
    queue: Mutex<VecDeque<Result<T>>>,
    last: Mutex<Option<Result<T>>>,
}

impl<T: Clone> Script<T> {
    fn new(entries: Vec<Result<T>>) -> Self {
        Self {
            queue: Mutex::new(entries.into()),
            last: Mutex::new(None),
        }
    }

    fn push(&self, entry: Result<T>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(entry);
    }

    fn next(&self) -> Result<T> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            *last = Some(entry.clone());
            return entry;
        }
        last.clone()
            .unwrap_or_else(|| Err(MetricsError::Unknown("script exhausted".to_string())))
    }
}

pub struct ScriptedCpuTicks {
    script: Script<CpuTicks>,
}

impl ScriptedCpuTicks {
    pub fn new(entries: Vec<Result<CpuTicks>>) -> Self {
        Self {
            script: Script::new(entries),
        }
    }

    pub fn push(&self, entry: Result<CpuTicks>) {
        self.script.push(entry);
    }
}

impl CpuTickSource for ScriptedCpuTicks {
    fn read_ticks(&self) -> Result<CpuTicks> {
        self.script.next()
    }
}

pub struct ScriptedMemoryStats {
    total: u64,
    page_size: u64,
    script: Script<VmPages>,
}

impl ScriptedMemoryStats {
    pub fn new(total: u64, page_size: u64, entries: Vec<Result<VmPages>>) -> Self {
        Self {
            total,
            page_size,
            script: Script::new(entries),
        }
    }

    pub fn push(&self, entry: Result<VmPages>) {
        self.script.push(entry);
    }
}

impl MemoryStatsSource for ScriptedMemoryStats {
    fn total_memory(&self) -> Result<u64> {
        Ok(self.total)
    }

    fn vm_pages(&self) -> Result<VmPages> {
        self.script.next()
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }
}

pub struct ScriptedInterfaces {
    records: Script<Vec<LinkRecord>>,
    counters: Script<HashMap<String, LinkCounters>>,
}

impl ScriptedInterfaces {
    /// Counter table defaults to an empty, always successful read.
    pub fn new(entries: Vec<Result<Vec<LinkRecord>>>) -> Self {
        Self {
            records: Script::new(entries),
            counters: Script::new(vec![Ok(HashMap::new())]),
        }
    }

    pub fn with_counters(self, counters: HashMap<String, LinkCounters>) -> Self {
        self.with_counter_script(vec![Ok(counters)])
    }

    /// Replay counter table reads in order, repeating the last.
    pub fn with_counter_script(
        mut self,
        entries: Vec<Result<HashMap<String, LinkCounters>>>,
    ) -> Self {
        self.counters = Script::new(entries);
        self
    }

    pub fn push(&self, entry: Result<Vec<LinkRecord>>) {
        self.records.push(entry);
    }

    pub fn push_counters(&self, entry: Result<HashMap<String, LinkCounters>>) {
        self.counters.push(entry);
    }
}

impl InterfaceSource for ScriptedInterfaces {
    fn link_records(&self) -> Result<Vec<LinkRecord>> {
        self.records.next()
    }

    fn counter_table(&self) -> Result<HashMap<String, LinkCounters>> {
        self.counters.next()
    }
}

/// Process table whose contents tests mutate between sampler calls.
#[derive(Default)]
pub struct ScriptedProcessProvider {
    usage: Mutex<BTreeMap<i32, TaskUsage>>,
    names: Mutex<HashMap<i32, String>>,
}

impl ScriptedProcessProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pid: i32, name: &str, resident_bytes: u64) {
        self.set_usage(
            pid,
            TaskUsage {
                resident_bytes,
                ..TaskUsage::default()
            },
        );
        self.set_name(pid, name);
    }

    pub fn set_usage(&self, pid: i32, usage: TaskUsage) {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, usage);
    }

    pub fn set_name(&self, pid: i32, name: &str) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, name.to_string());
    }

    /// Simulate the process exiting.
    pub fn remove(&self, pid: i32) {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }
}

impl ProcessDataProvider for ScriptedProcessProvider {
    fn all_pids(&self) -> Vec<i32> {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    fn task_usage(&self, pid: i32) -> Option<TaskUsage> {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .copied()
    }

    fn process_name(&self, pid: i32) -> Option<String> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_repeats_last_entry() {
        let source = ScriptedCpuTicks::new(vec![Ok(CpuTicks::default())]);
        assert!(source.read_ticks().is_ok());
        assert!(source.read_ticks().is_ok());

        source.push(Err(MetricsError::KernelApi("x".into())));
        assert!(source.read_ticks().is_err());
        assert!(source.read_ticks().is_err());
    }

    #[test]
    fn counter_table_follows_its_script() {
        let source = ScriptedInterfaces::new(Vec::new()).with_counter_script(vec![
            Ok(HashMap::new()),
            Err(MetricsError::PermissionDenied("/proc/net/dev".into())),
        ]);
        assert!(source.counter_table().is_ok());
        assert!(source.counter_table().is_err());
        source.push_counters(Ok(HashMap::new()));
        assert!(source.counter_table().is_ok());
    }

    #[test]
    fn empty_script_errors() {
        let source = ScriptedCpuTicks::new(Vec::new());
        assert!(matches!(source.read_ticks(), Err(MetricsError::Unknown(_))));
    }
}
