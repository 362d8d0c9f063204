//! Per-interface traffic counters.
//!
//! Interfaces are discovered from link records (one per entry under
//! `/sys/class/net`), then merged with the counter table from `/proc/net/dev`.

use crate::error::{MetricsError, Result};
use crate::types::{InterfaceCounters, NetworkSnapshot};
use chrono::Utc;
use log::{debug, error, warn};
use procfs::Current;
use procfs::net::InterfaceDeviceStatus;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// One record from interface enumeration. The same interface may appear
/// more than once (one record per address family).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub name: String,
    pub flags: u32,
    /// Record describes the link layer itself rather than an address on it.
    pub link_layer: bool,
}

impl LinkRecord {
    pub fn is_up(&self) -> bool {
        self.flags & libc::IFF_UP as u32 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub errors_sent: u64,
    pub errors_received: u64,
    pub dropped_packets: u64,
}

pub trait InterfaceSource: Send + Sync {
    fn link_records(&self) -> Result<Vec<LinkRecord>>;
    /// Counters for every interface the kernel knows about, keyed by name.
    fn counter_table(&self) -> Result<HashMap<String, LinkCounters>>;
}

pub struct SysfsInterfaces {
    class_dir: PathBuf,
}

impl SysfsInterfaces {
    pub fn new() -> Self {
        Self {
            class_dir: PathBuf::from("/sys/class/net"),
        }
    }

    pub fn with_class_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            class_dir: dir.into(),
        }
    }
}

impl Default for SysfsInterfaces {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the hex flags word sysfs exposes, e.g. `0x1003`.
pub fn parse_iface_flags(content: &str) -> Option<u32> {
    let trimmed = content.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16).ok()
}

fn read_flags(dir: &Path) -> u32 {
    match fs::read_to_string(dir.join("flags")) {
        Ok(content) => parse_iface_flags(&content).unwrap_or_else(|| {
            debug!("[network] unparsable flags in {}", dir.display());
            0
        }),
        Err(err) => {
            debug!("[network] no flags for {}: {err}", dir.display());
            0
        }
    }
}

impl InterfaceSource for SysfsInterfaces {
    fn link_records(&self) -> Result<Vec<LinkRecord>> {
        let entries = fs::read_dir(&self.class_dir).map_err(|e| {
            MetricsError::from(e).into_network()
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MetricsError::from(e).into_network())?;
            let name = entry.file_name().to_string_lossy().into_owned();
            records.push(LinkRecord {
                flags: read_flags(&entry.path()),
                name,
                link_layer: true,
            });
        }
        Ok(records)
    }

    fn counter_table(&self) -> Result<HashMap<String, LinkCounters>> {
        let status = InterfaceDeviceStatus::current()
            .map_err(|e| MetricsError::from(e).into_network())?;
        Ok(status
            .0
            .into_iter()
            .map(|(name, dev)| {
                let counters = LinkCounters {
                    bytes_sent: dev.sent_bytes,
                    bytes_received: dev.recv_bytes,
                    packets_sent: dev.sent_packets,
                    packets_received: dev.recv_packets,
                    errors_sent: dev.sent_errs,
                    errors_received: dev.recv_errs,
                    dropped_packets: dev.recv_drop.saturating_add(dev.sent_drop),
                };
                (name, counters)
            })
            .collect())
    }
}

pub struct NetworkSampler {
    source: Box<dyn InterfaceSource>,
    last_good: Mutex<Option<NetworkSnapshot>>,
}

impl NetworkSampler {
    pub fn new(source: Box<dyn InterfaceSource>) -> Self {
        Self {
            source,
            last_good: Mutex::new(None),
        }
    }

    pub fn sysfs() -> Self {
        Self::new(Box::new(SysfsInterfaces::new()))
    }

    pub fn sample(&self) -> Result<NetworkSnapshot> {
        match self.read() {
            Ok(snapshot) => {
                *self.last_good.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(err) => {
                error!("[network] failed to collect interface counters: {err}");
                match self
                    .last_good
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                {
                    Some(fallback) => {
                        warn!("[network] returning cached snapshot");
                        Ok(fallback)
                    }
                    None => Err(err),
                }
            }
        }
    }

    fn read(&self) -> Result<NetworkSnapshot> {
        let records = self
            .source
            .link_records()
            .map_err(MetricsError::into_network)?;

        // BTreeMap keeps the output ordered by name.
        let mut interfaces: BTreeMap<String, InterfaceCounters> = BTreeMap::new();
        let mut table: Option<HashMap<String, LinkCounters>> = None;

        for record in &records {
            interfaces
                .entry(record.name.clone())
                .or_insert_with(|| InterfaceCounters::empty(&record.name, record.is_up()));

            if !record.link_layer {
                continue;
            }

            if table.is_none() {
                table = Some(
                    self.source
                        .counter_table()
                        .map_err(MetricsError::into_network)?,
                );
            }

            let counters = table.as_ref().and_then(|t| t.get(&record.name));
            match (counters, interfaces.get_mut(&record.name)) {
                (Some(c), Some(entry)) => merge_counters(entry, c),
                (None, _) => {
                    warn!("[network] no counters for interface {}", record.name);
                }
                (Some(_), None) => {}
            }
        }

        debug!("[network] sampled {} interfaces", interfaces.len());

        Ok(NetworkSnapshot {
            timestamp: Utc::now(),
            interfaces: interfaces.into_values().collect(),
        })
    }
}

fn merge_counters(entry: &mut InterfaceCounters, c: &LinkCounters) {
    entry.bytes_sent = c.bytes_sent;
    entry.bytes_received = c.bytes_received;
    entry.packets_sent = c.packets_sent;
    entry.packets_received = c.packets_received;
    entry.errors_sent = c.errors_sent;
    entry.errors_received = c.errors_received;
    entry.dropped_packets = c.dropped_packets;
}
