use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::time::Duration;
use sysmond::config::DEFAULT_CONFIG_PATH;
use sysmond::{Config, MetricsCoordinator, ProcessRecord, Snapshot, SnapshotKind, SortMetric};

#[derive(Parser, Debug)]
#[command(name = "sysmond", about = "Host CPU, memory, network and process sampler")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Override the sampling interval, in milliseconds
    #[arg(long)]
    interval: Option<u64>,
    /// Number of processes to show per report
    #[arg(long, default_value_t = 10)]
    top: usize,
    /// Take one set of samples and exit
    #[arg(long)]
    once: bool,
    /// Print reports as JSON lines on stdout
    #[arg(long)]
    json: bool,
}

#[derive(serde::Serialize)]
struct Report<'a> {
    snapshots: Vec<&'a Snapshot>,
    processes: &'a [ProcessRecord],
}

fn emit(snapshots: &[Snapshot], processes: &[ProcessRecord], json: bool) -> Result<()> {
    if json {
        let report = Report {
            snapshots: snapshots.iter().collect(),
            processes,
        };
        println!("{}", serde_json::to_string(&report).context("serialize report")?);
        return Ok(());
    }

    for snapshot in snapshots {
        match snapshot {
            Snapshot::Cpu(cpu) => info!(
                "[cpu] total {:.1}% user {:.1}% system {:.1}% idle {:.1}%",
                cpu.total_usage_percent,
                cpu.user_usage_percent,
                cpu.system_usage_percent,
                cpu.idle_percent
            ),
            Snapshot::Memory(mem) => info!(
                "[memory] {:.1}% used ({} of {} bytes)",
                mem.usage_percent, mem.used_bytes, mem.total_bytes
            ),
            Snapshot::Network(net) => {
                for iface in &net.interfaces {
                    info!(
                        "[network] {} up={} rx={} tx={}",
                        iface.name, iface.is_up, iface.bytes_received, iface.bytes_sent
                    );
                }
            }
        }
    }
    for p in processes {
        info!(
            "[process] {:>7} {:<16} cpu {:>6.1}% rss {}",
            p.pid, p.name, p.cpu_usage_percent, p.memory_usage_bytes
        );
    }
    Ok(())
}

/// CPU shares are deltas, so prime every baseline, wait one interval and
/// sample again.
async fn run_once(coordinator: &MetricsCoordinator, config: &Config, args: &Args) -> Result<()> {
    coordinator.collect_one_pass();
    coordinator.top_processes(args.top, SortMetric::Cpu);
    tokio::time::sleep(config.sampling.interval() + Duration::from_millis(50)).await;

    let mut snapshots = Vec::with_capacity(SnapshotKind::ALL.len());
    for kind in SnapshotKind::ALL {
        match coordinator.on_demand(kind) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(err) => warn!("[coordinator] {} unavailable: {err}", kind.as_str()),
        }
    }
    let processes = coordinator.top_processes(args.top, SortMetric::Cpu);
    emit(&snapshots, &processes, args.json)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_default(&args.config)?;
    if let Some(ms) = args.interval {
        config.sampling.interval_ms = ms;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    let coordinator = MetricsCoordinator::new(&config);

    if args.once {
        return run_once(&coordinator, &config, &args).await;
    }

    coordinator.start();
    info!(
        "[coordinator] sampling every {:?}, config {}",
        coordinator.sampling_interval(),
        args.config.display()
    );

    let mut ticker =
        tokio::time::interval(coordinator.sampling_interval().max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshots: Vec<Snapshot> =
                    coordinator.last_snapshots().into_iter().flatten().collect();
                let processes = coordinator.top_processes(args.top, SortMetric::Cpu);
                emit(&snapshots, &processes, args.json)?;
            }
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for ctrl-c")?;
                info!("shutdown requested");
                break;
            }
        }
    }

    coordinator.stop();
    Ok(())
}
