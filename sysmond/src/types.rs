use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_usage_percent: f64,
    pub system_usage_percent: f64,
    pub user_usage_percent: f64,
    pub idle_percent: f64,
}

impl CpuSnapshot {
    /// Snapshot returned before a tick baseline exists.
    pub fn zero() -> Self {
        Self {
            timestamp: Utc::now(),
            total_usage_percent: 0.0,
            system_usage_percent: 0.0,
            user_usage_percent: 0.0,
            idle_percent: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub timestamp: DateTime<Utc>,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_bytes: u64,
    pub usage_percent: f64,
    pub active_bytes: u64,
    pub inactive_bytes: u64,
    pub wired_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub name: String,
    pub is_up: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub errors_sent: u64,
    pub errors_received: u64,
    pub dropped_packets: u64,
}

impl InterfaceCounters {
    pub fn empty(name: impl Into<String>, is_up: bool) -> Self {
        Self {
            name: name.into(),
            is_up,
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            errors_sent: 0,
            errors_received: 0,
            dropped_packets: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Sorted ascending by interface name.
    pub interfaces: Vec<InterfaceCounters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: i32,
    pub name: String,
    pub cpu_usage_percent: f64,
    pub memory_usage_bytes: u64,
    // Per-process network attribution is not collected; always None.
    pub network_bytes_sent: Option<u64>,
    pub network_bytes_received: Option<u64>,
}

impl ProcessRecord {
    pub fn network_total(&self) -> u64 {
        self.network_bytes_sent
            .unwrap_or(0)
            .saturating_add(self.network_bytes_received.unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMetric {
    Cpu,
    Memory,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Cpu,
    Memory,
    Network,
}

impl SnapshotKind {
    pub const ALL: [SnapshotKind; 3] = [Self::Cpu, Self::Memory, Self::Network];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Network => "network",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Snapshot {
    Cpu(CpuSnapshot),
    Memory(MemorySnapshot),
    Network(NetworkSnapshot),
}

impl Snapshot {
    pub fn kind(&self) -> SnapshotKind {
        match self {
            Self::Cpu(_) => SnapshotKind::Cpu,
            Self::Memory(_) => SnapshotKind::Memory,
            Self::Network(_) => SnapshotKind::Network,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Cpu(s) => s.timestamp,
            Self::Memory(s) => s.timestamp,
            Self::Network(s) => s.timestamp,
        }
    }

    pub fn as_cpu(&self) -> Option<&CpuSnapshot> {
        match self {
            Self::Cpu(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&MemorySnapshot> {
        match self {
            Self::Memory(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_network(&self) -> Option<&NetworkSnapshot> {
        match self {
            Self::Network(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub consecutive_error_count: u32,
    pub is_monitoring: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_with_kind_tag() {
        let snap = Snapshot::Cpu(CpuSnapshot::zero());
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["kind"], "cpu");
        assert_eq!(json["total_usage_percent"], 0.0);
    }

    #[test]
    fn network_total_treats_unsupported_as_zero() {
        let record = ProcessRecord {
            pid: 7,
            name: "sshd".into(),
            cpu_usage_percent: 0.0,
            memory_usage_bytes: 1,
            network_bytes_sent: None,
            network_bytes_received: Some(10),
        };
        assert_eq!(record.network_total(), 10);
    }
}
