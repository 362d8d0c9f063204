pub mod clock;
pub mod collectors;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod footprint;
pub mod testing;
pub mod types;

pub use config::Config;
pub use coordinator::{MetricsCoordinator, PassReport};
pub use error::{MetricsError, Result};
pub use types::{
    CpuSnapshot, HealthStatus, InterfaceCounters, MemorySnapshot, NetworkSnapshot, ProcessRecord,
    Snapshot, SnapshotKind, SortMetric,
};
