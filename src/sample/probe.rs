//! Live resource counters attached to every sample.
//!
//! Counters always describe the controller node: [`SysinfoProbe`] when the
//! controller runs on this host, [`NodeProbe`] when it runs elsewhere.

use std::sync::Arc;

use serde::Serialize;
use sysinfo::{Pid, System};
use tracing::{debug, warn};

use crate::transport::{Invocation, Transport};

/// Node and controller-process counters at the moment a sample is taken.
/// Counters that could not be read are left empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub one_minute_load: Option<f64>,
    pub five_minute_load: Option<f64>,
    pub fifteen_minute_load: Option<f64>,
    pub used_memory_bytes: Option<u64>,
    pub free_memory_bytes: Option<u64>,
    pub total_memory_bytes: Option<u64>,
    pub controller_cpu_usage_percent: Option<f32>,
    pub controller_memory_bytes: Option<u64>,
    pub controller_run_time_secs: Option<u64>,
}

/// Source of [`ResourceSnapshot`]s.
#[async_trait::async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn snapshot(&self, controller_pid: Option<u32>) -> ResourceSnapshot;
}

// ---------------------------------------------------------------------------
// Local host
// ---------------------------------------------------------------------------

/// Reads counters of the local host through `sysinfo`.
#[derive(Debug, Default)]
pub struct SysinfoProbe;

impl SysinfoProbe {
    fn read(controller_pid: Option<u32>) -> ResourceSnapshot {
        let load = System::load_average();

        let sys = match controller_pid {
            Some(_) => System::new_all(),
            None => {
                let mut sys = System::new();
                sys.refresh_memory();
                sys
            }
        };

        let process = controller_pid.and_then(|pid| sys.process(Pid::from_u32(pid)));

        ResourceSnapshot {
            one_minute_load: Some(load.one),
            five_minute_load: Some(load.five),
            fifteen_minute_load: Some(load.fifteen),
            used_memory_bytes: Some(sys.used_memory()),
            free_memory_bytes: Some(sys.free_memory()),
            total_memory_bytes: Some(sys.total_memory()),
            controller_cpu_usage_percent: process.map(|p| p.cpu_usage()),
            controller_memory_bytes: process.map(|p| p.memory()),
            controller_run_time_secs: process.map(|p| p.run_time()),
        }
    }
}

#[async_trait::async_trait]
impl ResourceProbe for SysinfoProbe {
    async fn snapshot(&self, controller_pid: Option<u32>) -> ResourceSnapshot {
        match tokio::task::spawn_blocking(move || Self::read(controller_pid)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "resource snapshot task failed, recording empty counters");
                ResourceSnapshot::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Remote node
// ---------------------------------------------------------------------------

/// Reads counters on the controller node through its transport:
/// `/proc/loadavg`, `free -b` and `ps` for the controller process.
pub struct NodeProbe {
    transport: Arc<dyn Transport>,
}

impl NodeProbe {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// stdout of a successful command, `None` otherwise.
    async fn read(&self, inv: Invocation) -> Option<String> {
        match self.transport.run(&inv).await {
            Ok(out) if out.success() => Some(out.stdout),
            Ok(out) => {
                debug!(command = %inv.display(), code = ?out.code, "counter command failed");
                None
            }
            Err(e) => {
                warn!(command = %inv.display(), error = %e, "failed to read node counters");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl ResourceProbe for NodeProbe {
    async fn snapshot(&self, controller_pid: Option<u32>) -> ResourceSnapshot {
        let mut snap = ResourceSnapshot::default();

        let loadavg = self
            .read(Invocation::new("cat").arg("/proc/loadavg"))
            .await;
        if let Some((one, five, fifteen)) = loadavg.as_deref().and_then(parse_loadavg) {
            snap.one_minute_load = Some(one);
            snap.five_minute_load = Some(five);
            snap.fifteen_minute_load = Some(fifteen);
        }

        let free = self.read(Invocation::new("free").arg("-b")).await;
        if let Some(mem) = free.as_deref().and_then(parse_free) {
            snap.total_memory_bytes = Some(mem.total);
            snap.used_memory_bytes = Some(mem.used);
            snap.free_memory_bytes = Some(mem.free);
        }

        if let Some(pid) = controller_pid {
            let ps = self
                .read(
                    Invocation::new("ps")
                        .args(["-o", "pcpu=,rss=,etimes=", "-p"])
                        .arg(pid.to_string()),
                )
                .await;
            if let Some(proc_stats) = ps.as_deref().and_then(parse_ps) {
                snap.controller_cpu_usage_percent = Some(proc_stats.cpu_percent);
                snap.controller_memory_bytes = Some(proc_stats.rss_bytes);
                snap.controller_run_time_secs = Some(proc_stats.elapsed_secs);
            }
        }

        snap
    }
}

#[derive(Debug, PartialEq)]
struct MemoryCounters {
    total: u64,
    used: u64,
    free: u64,
}

#[derive(Debug, PartialEq)]
struct ProcessCounters {
    cpu_percent: f32,
    rss_bytes: u64,
    elapsed_secs: u64,
}

/// `0.52 0.58 0.59 1/467 12345`
fn parse_loadavg(output: &str) -> Option<(f64, f64, f64)> {
    let mut fields = output.split_whitespace();
    let one = fields.next()?.parse().ok()?;
    let five = fields.next()?.parse().ok()?;
    let fifteen = fields.next()?.parse().ok()?;
    Some((one, five, fifteen))
}

/// The `Mem:` row of `free -b`: total, used, free.
fn parse_free(output: &str) -> Option<MemoryCounters> {
    let row = output.lines().find(|l| l.trim_start().starts_with("Mem:"))?;
    let cols: Vec<u64> = row
        .split_whitespace()
        .skip(1)
        .take(3)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    match cols[..] {
        [total, used, free] => Some(MemoryCounters { total, used, free }),
        _ => None,
    }
}

/// One `ps -o pcpu=,rss=,etimes=` row; rss is in KiB.
fn parse_ps(output: &str) -> Option<ProcessCounters> {
    let row = output.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = row.split_whitespace();
    let cpu_percent = fields.next()?.parse().ok()?;
    let rss_kib: u64 = fields.next()?.parse().ok()?;
    let elapsed_secs = fields.next()?.parse().ok()?;
    Some(ProcessCounters {
        cpu_percent,
        rss_bytes: rss_kib * 1024,
        elapsed_secs,
    })
}

// ---------------------------------------------------------------------------
// Fixed
// ---------------------------------------------------------------------------

/// Always returns the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct FixedProbe(pub ResourceSnapshot);

#[async_trait::async_trait]
impl ResourceProbe for FixedProbe {
    async fn snapshot(&self, _controller_pid: Option<u32>) -> ResourceSnapshot {
        self.0.clone()
    }
}
