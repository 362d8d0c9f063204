use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sysmond/sysmond.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sampling: SamplingConfig,
    pub processes: ProcessConfig,
    pub footprint: FootprintConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Sleep between background passes.
    pub interval_ms: u64,
    /// Floor applied to every requested sampling interval.
    pub min_interval_ms: u64,
    pub cpu_interval_ms: u64,
    pub memory_interval_ms: u64,
    pub network_interval_ms: u64,
    pub max_consecutive_errors: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            min_interval_ms: 500,
            cpu_interval_ms: 1_000,
            memory_interval_ms: 2_000,
            network_interval_ms: 3_000,
            max_consecutive_errors: 5,
        }
    }
}

impl SamplingConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Configured interval, raised to the floor if needed.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms).max(self.min_interval())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub full_refresh_ms: u64,
    pub quick_refresh_ms: u64,
    pub name_cache_ttl_secs: u64,
    pub max_tracked_pids: usize,
    pub max_cached_processes: usize,
    pub cpu_ceiling_percent: f64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            full_refresh_ms: 10_000,
            quick_refresh_ms: 1_000,
            name_cache_ttl_secs: 60,
            max_tracked_pids: 200,
            max_cached_processes: 100,
            cpu_ceiling_percent: 800.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FootprintConfig {
    pub enabled: bool,
    pub report_interval_secs: u64,
    pub warn_mib: u64,
    /// Above this the process cache is dropped.
    pub pressure_mib: u64,
}

impl Default for FootprintConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval_secs: 60,
            warn_mib: 30,
            pressure_mib: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// env_logger filter used when RUST_LOG is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("invalid sysmond config")?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        content
            .parse()
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Defaults when the file does not exist; any other read or parse error is returned.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "[config] {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        Self::load(path)
    }

    fn validate(&self) -> Result<()> {
        if self.processes.max_cached_processes == 0 {
            anyhow::bail!("processes.max_cached_processes must be at least 1");
        }
        let ceiling = self.processes.cpu_ceiling_percent;
        if ceiling.is_nan() || ceiling <= 0.0 {
            anyhow::bail!("processes.cpu_ceiling_percent must be positive");
        }
        if self.sampling.min_interval_ms == 0 {
            anyhow::bail!("sampling.min_interval_ms must be at least 1");
        }
        Ok(())
    }
}
