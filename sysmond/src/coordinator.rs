//! Owns one sampler per source and keeps the last good snapshot of each.
//!
//! A background task runs [`MetricsCoordinator::collect_one_pass`] every
//! sampling interval. Each source has its own minimum refresh interval, so a
//! pass only touches the sources that are due. Readers never wait on a kernel
//! query: cached values are served from a single mutex-guarded state.

use crate::clock::{Clock, MonotonicClock};
use crate::collectors::cpu::CpuSampler;
use crate::collectors::memory::MemorySampler;
use crate::collectors::network::NetworkSampler;
use crate::collectors::process::{ProcessSampler, ProcessSamplerSettings};
use crate::collectors::process_source::ProcfsProcessProvider;
use crate::config::Config;
use crate::error::{MetricsError, Result};
use crate::footprint::{self, FootprintWatch};
use crate::types::{
    CpuSnapshot, HealthStatus, MemorySnapshot, NetworkSnapshot, ProcessRecord, Snapshot,
    SnapshotKind, SortMetric,
};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Outcome of one collection pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub refreshed: Vec<SnapshotKind>,
    pub failed: Vec<(SnapshotKind, MetricsError)>,
}

impl PassReport {
    /// Nothing was due.
    pub fn is_idle(&self) -> bool {
        self.refreshed.is_empty() && self.failed.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Stamped<T> {
    value: T,
    at: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Cadence {
    cpu: Duration,
    memory: Duration,
    network: Duration,
}

impl Cadence {
    fn of(&self, kind: SnapshotKind) -> Duration {
        match kind {
            SnapshotKind::Cpu => self.cpu,
            SnapshotKind::Memory => self.memory,
            SnapshotKind::Network => self.network,
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

struct CoordinatorState {
    cpu: Option<Stamped<CpuSnapshot>>,
    memory: Option<Stamped<MemorySnapshot>>,
    network: Option<Stamped<NetworkSnapshot>>,
    sampling_interval: Duration,
    consecutive_errors: u32,
    in_error_state: bool,
    worker: Option<Worker>,
}

impl CoordinatorState {
    fn last_update(&self, kind: SnapshotKind) -> Option<Duration> {
        match kind {
            SnapshotKind::Cpu => self.cpu.as_ref().map(|s| s.at),
            SnapshotKind::Memory => self.memory.as_ref().map(|s| s.at),
            SnapshotKind::Network => self.network.as_ref().map(|s| s.at),
        }
    }

    fn snapshot(&self, kind: SnapshotKind) -> Option<Snapshot> {
        match kind {
            SnapshotKind::Cpu => self.cpu.as_ref().map(|s| Snapshot::Cpu(s.value.clone())),
            SnapshotKind::Memory => self
                .memory
                .as_ref()
                .map(|s| Snapshot::Memory(s.value.clone())),
            SnapshotKind::Network => self
                .network
                .as_ref()
                .map(|s| Snapshot::Network(s.value.clone())),
        }
    }

    fn store(&mut self, snapshot: Snapshot, at: Duration) {
        match snapshot {
            Snapshot::Cpu(value) => self.cpu = Some(Stamped { value, at }),
            Snapshot::Memory(value) => self.memory = Some(Stamped { value, at }),
            Snapshot::Network(value) => self.network = Some(Stamped { value, at }),
        }
    }
}

struct Shared {
    cpu: CpuSampler,
    memory: MemorySampler,
    network: NetworkSampler,
    processes: ProcessSampler,
    clock: Arc<dyn Clock>,
    cadence: Cadence,
    min_interval: Duration,
    max_consecutive_errors: u32,
    footprint: Option<FootprintWatch>,
    state: Mutex<CoordinatorState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sample(&self, kind: SnapshotKind) -> Result<Snapshot> {
        match kind {
            SnapshotKind::Cpu => self.cpu.sample().map(Snapshot::Cpu),
            SnapshotKind::Memory => self.memory.sample().map(Snapshot::Memory),
            SnapshotKind::Network => self.network.sample().map(Snapshot::Network),
        }
    }

    fn collect_one_pass(&self) -> PassReport {
        let now = self.clock.now();
        let due: Vec<SnapshotKind> = {
            let state = self.state();
            SnapshotKind::ALL
                .into_iter()
                .filter(|&kind| match state.last_update(kind) {
                    None => true,
                    Some(at) => now.saturating_sub(at) >= self.cadence.of(kind),
                })
                .collect()
        };

        let mut report = PassReport::default();
        let mut fresh = Vec::with_capacity(due.len());
        for kind in due {
            match self.sample(kind) {
                Ok(snapshot) => {
                    report.refreshed.push(kind);
                    fresh.push(snapshot);
                }
                Err(err) => {
                    error!("[coordinator] failed to collect {} metrics: {err}", kind.as_str());
                    report.failed.push((kind, err));
                }
            }
        }

        {
            let mut state = self.state();
            for snapshot in fresh {
                state.store(snapshot, now);
            }
            self.account(&mut state, &report);
        }

        if !report.is_idle() && report.is_clean() {
            self.check_footprint();
        }
        report
    }

    fn account(&self, state: &mut CoordinatorState, report: &PassReport) {
        if report.is_idle() {
            return;
        }
        if report.is_clean() {
            if state.in_error_state || state.consecutive_errors > 0 {
                info!("[coordinator] recovered after {} failed passes", state.consecutive_errors);
            }
            state.consecutive_errors = 0;
            state.in_error_state = false;
            return;
        }

        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        if state.consecutive_errors > self.max_consecutive_errors && !state.in_error_state {
            state.in_error_state = true;
            error!(
                "[coordinator] entering error state after {} consecutive failed passes",
                state.consecutive_errors
            );
        }
    }

    fn check_footprint(&self) {
        let Some(watch) = &self.footprint else {
            return;
        };
        if watch.check() {
            warn!("[footprint] memory pressure, dropping process cache");
            self.processes.reset_cache();
        }
    }

    fn next_delay(&self) -> Duration {
        let state = self.state();
        let backoff = self.max_consecutive_errors.saturating_mul(2);
        if state.consecutive_errors > backoff {
            state.sampling_interval.saturating_mul(3)
        } else {
            state.sampling_interval
        }
    }
}

async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    info!("[coordinator] monitoring started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let report = shared.collect_one_pass();
        debug!(
            "[coordinator] pass refreshed {:?}, {} failed",
            report.refreshed,
            report.failed.len()
        );

        let delay = shared.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("[coordinator] monitoring stopped");
}

pub struct MetricsCoordinator {
    shared: Arc<Shared>,
}

impl MetricsCoordinator {
    /// Coordinator over the live kernel interfaces.
    pub fn new(config: &Config) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let processes = ProcessSampler::new(
            Arc::new(ProcfsProcessProvider::new()),
            clock.clone(),
            ProcessSamplerSettings::from(&config.processes),
        );
        let coordinator = Self::with_parts(
            config,
            CpuSampler::procfs(),
            MemorySampler::procfs(),
            NetworkSampler::sysfs(),
            processes,
            clock.clone(),
        );
        if config.footprint.enabled {
            coordinator.with_footprint(FootprintWatch::new(
                &config.footprint,
                clock,
                Box::new(footprint::own_resident_bytes),
            ))
        } else {
            coordinator
        }
    }

    pub fn with_parts(
        config: &Config,
        cpu: CpuSampler,
        memory: MemorySampler,
        network: NetworkSampler,
        processes: ProcessSampler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sampling = &config.sampling;
        let state = CoordinatorState {
            cpu: None,
            memory: None,
            network: None,
            sampling_interval: sampling.interval(),
            consecutive_errors: 0,
            in_error_state: false,
            worker: None,
        };
        Self {
            shared: Arc::new(Shared {
                cpu,
                memory,
                network,
                processes,
                clock,
                cadence: Cadence {
                    cpu: Duration::from_millis(sampling.cpu_interval_ms),
                    memory: Duration::from_millis(sampling.memory_interval_ms),
                    network: Duration::from_millis(sampling.network_interval_ms),
                },
                min_interval: sampling.min_interval(),
                max_consecutive_errors: sampling.max_consecutive_errors,
                footprint: None,
                state: Mutex::new(state),
            }),
        }
    }

    /// Attach a footprint watch. Only takes effect before `start`.
    pub fn with_footprint(mut self, watch: FootprintWatch) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.footprint = Some(watch),
            None => warn!("[footprint] coordinator already running, watch not attached"),
        }
        self
    }

    /// Spawn the background loop on the current tokio runtime. Does nothing if
    /// the loop is already running.
    pub fn start(&self) {
        let mut state = self.shared.state();
        if state.worker.is_some() {
            debug!("[coordinator] already monitoring");
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!("[coordinator] cannot start without a tokio runtime: {err}");
                return;
            }
        };

        let (shutdown, rx) = watch::channel(false);
        let handle = runtime.spawn(run(self.shared.clone(), rx));
        state.worker = Some(Worker { handle, shutdown });
    }

    pub fn stop(&self) {
        let worker = self.shared.state().worker.take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            worker.handle.abort();
            info!("[coordinator] stop requested");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.shared.state().worker.is_some()
    }

    /// Takes effect from the next sleep of the loop.
    pub fn set_sampling_interval(&self, interval: Duration) {
        let clamped = interval.max(self.shared.min_interval);
        if clamped != interval {
            debug!(
                "[coordinator] sampling interval {:?} raised to floor {:?}",
                interval, clamped
            );
        }
        self.shared.state().sampling_interval = clamped;
    }

    pub fn sampling_interval(&self) -> Duration {
        self.shared.state().sampling_interval
    }

    pub fn collect_one_pass(&self) -> PassReport {
        self.shared.collect_one_pass()
    }

    pub fn last_snapshot(&self, kind: SnapshotKind) -> Option<Snapshot> {
        self.shared.state().snapshot(kind)
    }

    /// CPU, memory and network snapshots read under one lock.
    pub fn last_snapshots(&self) -> [Option<Snapshot>; 3] {
        let state = self.shared.state();
        SnapshotKind::ALL.map(|kind| state.snapshot(kind))
    }

    /// Sample `kind` right now, ignoring cadence. The cached value is left
    /// untouched.
    pub fn on_demand(&self, kind: SnapshotKind) -> Result<Snapshot> {
        self.shared.sample(kind)
    }

    pub fn top_processes(&self, limit: usize, sort_by: SortMetric) -> Vec<ProcessRecord> {
        self.shared.processes.top_processes(limit, sort_by)
    }

    /// Drop every cached snapshot and the process cache. Monitoring continues.
    pub fn reset_caches(&self) {
        self.shared.processes.reset_cache();
        let mut state = self.shared.state();
        state.cpu = None;
        state.memory = None;
        state.network = None;
        info!("[coordinator] caches reset");
    }

    pub fn health_status(&self) -> HealthStatus {
        let state = self.shared.state();
        HealthStatus {
            is_healthy: !state.in_error_state,
            consecutive_error_count: state.consecutive_errors,
            is_monitoring: state.worker.is_some(),
        }
    }
}

impl Drop for MetricsCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collectors::cpu::CpuTicks;
    use crate::collectors::memory::VmPages;
    use crate::collectors::network::LinkRecord;
    use crate::testing::{
        ScriptedCpuTicks, ScriptedInterfaces, ScriptedMemoryStats, ScriptedProcessProvider,
    };

    struct Rig {
        coordinator: MetricsCoordinator,
        clock: Arc<ManualClock>,
    }

    fn rig(memory: Vec<Result<VmPages>>) -> Rig {
        let clock = Arc::new(ManualClock::new());
        let cpu = CpuSampler::new(Box::new(ScriptedCpuTicks::new(vec![Ok(CpuTicks {
            user: 10,
            system: 10,
            idle: 80,
            nice: 0,
        })])));
        let memory = MemorySampler::new(Box::new(ScriptedMemoryStats::new(
            1 << 30,
            4096,
            memory,
        )));
        let network = NetworkSampler::new(Box::new(ScriptedInterfaces::new(vec![Ok(vec![
            LinkRecord {
                name: "lo".into(),
                flags: libc::IFF_UP as u32,
                link_layer: true,
            },
        ])])));
        let processes = ProcessSampler::new(
            Arc::new(ScriptedProcessProvider::new()),
            clock.clone(),
            ProcessSamplerSettings::default(),
        );
        let coordinator = MetricsCoordinator::with_parts(
            &Config::default(),
            cpu,
            memory,
            network,
            processes,
            clock.clone(),
        );
        Rig { coordinator, clock }
    }

    fn pages() -> VmPages {
        VmPages {
            free: 1000,
            active: 2000,
            inactive: 500,
            wired: 100,
        }
    }

    #[test]
    fn first_pass_refreshes_everything() {
        let r = rig(vec![Ok(pages())]);
        let report = r.coordinator.collect_one_pass();
        assert_eq!(report.refreshed, SnapshotKind::ALL.to_vec());
        assert!(report.is_clean());
        assert!(r.coordinator.last_snapshots().iter().all(Option::is_some));
    }

    #[test]
    fn cadence_is_per_source() {
        let r = rig(vec![Ok(pages())]);
        r.coordinator.collect_one_pass();

        r.clock.advance(Duration::from_millis(999));
        assert!(r.coordinator.collect_one_pass().is_idle());

        r.clock.advance(Duration::from_millis(1));
        assert_eq!(r.coordinator.collect_one_pass().refreshed, vec![SnapshotKind::Cpu]);

        r.clock.advance(Duration::from_secs(1));
        assert_eq!(
            r.coordinator.collect_one_pass().refreshed,
            vec![SnapshotKind::Cpu, SnapshotKind::Memory]
        );

        r.clock.advance(Duration::from_secs(1));
        assert_eq!(
            r.coordinator.collect_one_pass().refreshed,
            vec![SnapshotKind::Cpu, SnapshotKind::Network]
        );
    }

    #[test]
    fn clean_pass_resets_error_count() {
        let r = rig(vec![
            Err(MetricsError::KernelApi("vmstat".into())),
            Ok(pages()),
        ]);
        r.coordinator.collect_one_pass();
        assert_eq!(r.coordinator.health_status().consecutive_error_count, 1);

        let report = r.coordinator.collect_one_pass();
        assert_eq!(report.refreshed, vec![SnapshotKind::Memory]);
        assert_eq!(r.coordinator.health_status().consecutive_error_count, 0);

        assert!(r.coordinator.collect_one_pass().is_idle());
        assert_eq!(r.coordinator.health_status().consecutive_error_count, 0);
    }

    #[test]
    fn failed_source_keeps_retrying_each_pass() {
        let r = rig(vec![Err(MetricsError::KernelApi("vmstat".into()))]);
        r.coordinator.collect_one_pass();
        r.clock.advance(Duration::from_millis(10));
        let report = r.coordinator.collect_one_pass();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, SnapshotKind::Memory);
    }

    #[test]
    fn backoff_triples_past_twice_the_limit() {
        let r = rig(vec![Err(MetricsError::KernelApi("vmstat".into()))]);
        for _ in 0..10 {
            r.coordinator.collect_one_pass();
            r.clock.advance(Duration::from_millis(1));
        }
        assert_eq!(r.coordinator.shared.next_delay(), Duration::from_secs(1));
        r.coordinator.collect_one_pass();
        assert_eq!(r.coordinator.shared.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn sampling_interval_is_clamped() {
        let r = rig(vec![Ok(pages())]);
        r.coordinator.set_sampling_interval(Duration::from_millis(100));
        assert_eq!(r.coordinator.sampling_interval(), Duration::from_millis(500));
        r.coordinator.set_sampling_interval(Duration::from_secs(2));
        assert_eq!(r.coordinator.sampling_interval(), Duration::from_secs(2));
    }

    #[test]
    fn start_outside_runtime_is_refused() {
        let r = rig(vec![Ok(pages())]);
        r.coordinator.start();
        assert!(!r.coordinator.is_monitoring());
    }
}
