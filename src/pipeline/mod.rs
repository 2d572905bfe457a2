//! Per-combination measurement pipelines.
//!
//! A pipeline runs the load generator next to one consumer: the
//! [`Monitor`](monitor::Monitor) for throughput tests, or the
//! [`Watcher`](watcher::Watcher) for discovery tests. The two sides talk only
//! through a bounded stream of [`StreamMessage`]s.

pub mod generator;
pub mod monitor;
pub mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{MonitorConfig, TestKind, WatcherConfig};
use crate::error::TestError;
use crate::sample::{Measurement, Sample, SampleContext};
use crate::transport::Transport;

use generator::{Generator, GeneratorParams};
use monitor::Monitor;
use watcher::{discovery_deadline, CountSource, Watcher};

/// Item on the generator stream. The terminal variants are sent exactly once,
/// last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Line(String),
    Success,
    Failure(String),
}

/// Samples produced by one run, and the error that cut it short, if any.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub samples: Vec<Sample>,
    pub failure: Option<TestError>,
}

impl PipelineOutput {
    pub fn ok(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            failure: None,
        }
    }

    pub fn failed(samples: Vec<Sample>, error: TestError) -> Self {
        Self {
            samples,
            failure: Some(error),
        }
    }
}

/// Inputs of one combination run.
pub struct RunContext {
    pub params: GeneratorParams,
    pub samples: SampleContext,
}

#[async_trait::async_trait]
pub trait Pipeline: Send + Sync {
    fn kind(&self) -> TestKind;

    /// Run generator and consumer to completion. Both units have finished
    /// when this returns.
    async fn run(&self, ctx: RunContext) -> PipelineOutput;
}

// ---------------------------------------------------------------------------
// Throughput: Generator + Monitor
// ---------------------------------------------------------------------------

pub struct ThroughputPipeline {
    transport: Arc<dyn Transport>,
    handler: PathBuf,
    monitor: MonitorConfig,
}

impl ThroughputPipeline {
    pub fn new(transport: Arc<dyn Transport>, handler: PathBuf, monitor: MonitorConfig) -> Self {
        Self {
            transport,
            handler,
            monitor,
        }
    }
}

#[async_trait::async_trait]
impl Pipeline for ThroughputPipeline {
    fn kind(&self) -> TestKind {
        TestKind::Throughput
    }

    async fn run(&self, ctx: RunContext) -> PipelineOutput {
        let (tx, rx) = mpsc::channel(self.monitor.channel_capacity);
        let generator =
            Generator::new(Arc::clone(&self.transport), self.handler.clone(), ctx.params)
                .spawn(tx);

        let mut output = Monitor::new(rx, self.monitor.channel_timeout(), ctx.samples)
            .run()
            .await;

        if let Err(e) = generator.finish().await {
            if output.failure.is_none() {
                output.failure = Some(e);
            }
        }
        output
    }
}

// ---------------------------------------------------------------------------
// Discovery: Generator + Watcher
// ---------------------------------------------------------------------------

pub struct DiscoveryPipeline {
    transport: Arc<dyn Transport>,
    handler: PathBuf,
    watcher: WatcherConfig,
    source: Arc<dyn CountSource>,
}

impl DiscoveryPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        handler: PathBuf,
        watcher: WatcherConfig,
        source: Arc<dyn CountSource>,
    ) -> Self {
        Self {
            transport,
            handler,
            watcher,
            source,
        }
    }
}

#[async_trait::async_trait]
impl Pipeline for DiscoveryPipeline {
    fn kind(&self) -> TestKind {
        TestKind::Discovery
    }

    async fn run(&self, ctx: RunContext) -> PipelineOutput {
        let target = ctx.params.total_switches();
        let deadline = discovery_deadline(&self.watcher, &ctx.params);

        // Nobody reads the stream; the generator drains its own output.
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let generator =
            Generator::new(Arc::clone(&self.transport), self.handler.clone(), ctx.params)
                .spawn(tx);

        let watched = Watcher::new(Arc::clone(&self.source), self.watcher.poll_interval())
            .watch(target, deadline)
            .await;
        let generator_result = generator.finish().await;

        let mut output = match watched {
            Ok(poll) => {
                let sample = ctx
                    .samples
                    .record(Measurement::Discovery {
                        bootup_time_secs: poll.elapsed_ms as f64 / 1000.0,
                        discovered_switches: poll.observed_count,
                        discovery_converged: poll.converged,
                    })
                    .await;
                PipelineOutput::ok(vec![sample])
            }
            Err(e) => PipelineOutput::failed(Vec::new(), e),
        };

        if let Err(e) = generator_result {
            warn!(error = %e, "generator failed during discovery");
            if output.failure.is_none() {
                output.failure = Some(e);
            }
        }
        output
    }
}
