//! Measurement samples and the global sample numbering.

pub mod probe;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dimensions::Combination;

pub use probe::{FixedProbe, NodeProbe, ResourceProbe, ResourceSnapshot, SysinfoProbe};

/// Throughput value marking a failed measurement.
pub const FAILED_THROUGHPUT: f64 = -1.0;

/// What a sample measured.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Measurement {
    Throughput {
        throughput_responses_sec: f64,
        /// Index of the result line within its run.
        internal_repeat_id: u32,
    },
    Discovery {
        bootup_time_secs: f64,
        discovered_switches: u64,
        discovery_converged: bool,
    },
    Failed {
        throughput_responses_sec: f64,
    },
}

impl Measurement {
    pub fn failed() -> Self {
        Measurement::Failed {
            throughput_responses_sec: FAILED_THROUGHPUT,
        }
    }
}

/// Resolved load and controller settings a sample was taken under, swept
/// or not.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadParameters {
    pub generator_threads: u64,
    pub generator_switches_per_thread: u64,
    pub generator_total_switches: u64,
    pub generator_thread_creation_delay_ms: u64,
    pub generator_delay_before_traffic_ms: u64,
    pub generator_ms_per_test: u64,
    pub generator_internal_repeats: u64,
    pub generator_simulated_hosts: u64,
    pub generator_warmup: u64,
    pub generator_mode: String,
    pub generator_cpus: String,
    pub controller_ip: String,
    pub controller_port: u16,
    pub controller_cpus: Option<String>,
}

/// One immutable measurement record.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub global_sample_id: u64,
    /// Unix time in seconds.
    pub timestamp: f64,
    pub date: DateTime<Utc>,
    #[serde(flatten)]
    pub dimensions: Combination,
    #[serde(flatten)]
    pub load: LoadParameters,
    #[serde(flatten)]
    pub resources: ResourceSnapshot,
    #[serde(flatten)]
    pub measurement: Measurement,
}

impl Sample {
    /// Throughput in responses/sec; `-1` for failed samples, `None` for
    /// discovery samples.
    pub fn throughput(&self) -> Option<f64> {
        match self.measurement {
            Measurement::Throughput {
                throughput_responses_sec,
                ..
            }
            | Measurement::Failed {
                throughput_responses_sec,
            } => Some(throughput_responses_sec),
            Measurement::Discovery { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.measurement, Measurement::Failed { .. })
    }
}

/// Execution-wide sample id counter, shared by every unit of a run.
#[derive(Debug, Clone, Default)]
pub struct SampleIds(Arc<AtomicU64>);

impl SampleIds {
    pub fn starting_at(first: u64) -> Self {
        Self(Arc::new(AtomicU64::new(first)))
    }

    /// Take the next id.
    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next sample will get.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset_to(&self, next: u64) {
        self.0.store(next, Ordering::SeqCst);
    }
}

/// Everything needed to stamp a sample during one combination run.
#[derive(Clone)]
pub struct SampleContext {
    pub combination: Combination,
    pub load: LoadParameters,
    pub ids: SampleIds,
    pub probe: Arc<dyn ResourceProbe>,
    pub controller_pid: Option<u32>,
}

impl SampleContext {
    /// Snapshot resources, take the next id and build the sample.
    pub async fn record(&self, measurement: Measurement) -> Sample {
        let resources = self.probe.snapshot(self.controller_pid).await;

        let now = Utc::now();
        Sample {
            global_sample_id: self.ids.next_id(),
            timestamp: now.timestamp_millis() as f64 / 1000.0,
            date: now,
            dimensions: self.combination.clone(),
            load: self.load.clone(),
            resources,
            measurement,
        }
    }

    /// A synthetic sample with throughput `-1`.
    pub async fn failure(&self) -> Sample {
        self.record(Measurement::failed()).await
    }
}
