//! Test execution coordinator.
//!
//! Runs pre-flight checks, then one controller start / pipeline / stop cycle
//! per dimension combination, strictly one at a time, and collects every
//! sample into a single numbered sequence.

pub mod teardown;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{Aggregator, Summary};
use crate::config::{BenchConfig, CountSourceKind, TestKind};
use crate::controller::Controller;
use crate::dimensions::{Combination, DimensionSet};
use crate::error::{TestError, TestResult};
use crate::pipeline::generator::GeneratorParams;
use crate::pipeline::watcher::{CountSource, HandlerCountSource, RestconfCountSource};
use crate::pipeline::{
    DiscoveryPipeline, Pipeline, PipelineOutput, RunContext, ThroughputPipeline,
};
use crate::sample::{NodeProbe, ResourceProbe, Sample, SampleContext, SampleIds, SysinfoProbe};
use crate::transport::{run_handler, Invocation, LocalTransport, SshTransport, Transport};

use teardown::{collect_logs, Teardown};

/// Dimension carrying the controller statistics period.
pub const STATS_PERIOD_DIMENSION: &str = "controller_statistics_period_ms";

/// Outcome of a full execution.
#[derive(Debug)]
pub struct Report {
    pub execution_id: Uuid,
    pub samples: Vec<Sample>,
    pub summary: Summary,
    pub failed_combinations: usize,
    pub results_path: PathBuf,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} samples ({} failed), {} failed combination(s), results in {}",
            self.execution_id,
            self.summary.sample_count,
            self.summary.failed_samples,
            self.failed_combinations,
            self.results_path.display()
        )
    }
}

pub struct Coordinator {
    config: BenchConfig,
    controller: Controller,
    generator_transport: Arc<dyn Transport>,
    pipeline: Box<dyn Pipeline>,
    probe: Arc<dyn ResourceProbe>,
    execution_id: Uuid,
}

fn transport_for(node: Option<&crate::config::NodeConfig>) -> Arc<dyn Transport> {
    match node {
        Some(node) => Arc::new(SshTransport::new(node)),
        None => Arc::new(LocalTransport),
    }
}

impl Coordinator {
    /// Build transports from the configured nodes.
    pub fn from_config(config: BenchConfig) -> TestResult<Self> {
        let controller_transport = transport_for(config.controller.node.as_ref());
        let generator_transport = transport_for(config.generator.node.as_ref());
        Self::new(config, controller_transport, generator_transport)
    }

    /// Resource counters come from the controller node: `sysinfo` when no
    /// `[controller.node]` is configured, the controller transport otherwise.
    pub fn new(
        config: BenchConfig,
        controller_transport: Arc<dyn Transport>,
        generator_transport: Arc<dyn Transport>,
    ) -> TestResult<Self> {
        config.validate()?;

        let generator_handler = config
            .generator
            .handler_path(&config.generator.run_handler);
        let pipeline: Box<dyn Pipeline> = match config.test.kind {
            TestKind::Throughput => Box::new(ThroughputPipeline::new(
                Arc::clone(&generator_transport),
                generator_handler,
                config.monitor.clone(),
            )),
            TestKind::Discovery => {
                let source: Arc<dyn CountSource> = match config.watcher.source {
                    CountSourceKind::Restconf => {
                        Arc::new(RestconfCountSource::new(&config.controller)?)
                    }
                    CountSourceKind::Handler => Arc::new(HandlerCountSource::new(
                        Arc::clone(&controller_transport),
                        count_handler_path(&config)?,
                    )),
                };
                Box::new(DiscoveryPipeline::new(
                    Arc::clone(&generator_transport),
                    generator_handler,
                    config.watcher.clone(),
                    source,
                ))
            }
        };

        let probe: Arc<dyn ResourceProbe> = match config.controller.node {
            None => Arc::new(SysinfoProbe),
            Some(_) => Arc::new(NodeProbe::new(Arc::clone(&controller_transport))),
        };

        Ok(Self {
            controller: Controller::new(config.controller.clone(), controller_transport),
            config,
            generator_transport,
            pipeline,
            probe,
            execution_id: Uuid::new_v4(),
        })
    }

    /// Replace the resource probe.
    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Handlers the execution will invoke, with the transport that runs them.
    fn required_handlers(&self) -> Vec<(String, PathBuf, Arc<dyn Transport>)> {
        let ctl = &self.config.controller;
        let gen = &self.config.generator;
        let stats_swept = self
            .config
            .dimensions
            .iter()
            .any(|d| d.name == STATS_PERIOD_DIMENSION);
        let controller_transport = Arc::clone(self.controller.transport());

        let mut handlers = Vec::new();
        for (role, path) in self.controller.handler_paths() {
            let needed = match role {
                "build" => ctl.rebuild,
                "clean" => ctl.cleanup,
                "statistics" => stats_swept || ctl.statistics_period_ms.is_some(),
                _ => true,
            };
            if needed {
                handlers.push((
                    format!("controller {}", role),
                    path,
                    Arc::clone(&controller_transport),
                ));
            }
        }
        if self.config.test.kind == TestKind::Discovery
            && self.config.watcher.source == CountSourceKind::Handler
        {
            if let Ok(path) = count_handler_path(&self.config) {
                handlers.push(("watcher count".into(), path, Arc::clone(&controller_transport)));
            }
        }

        let gen_transport = &self.generator_transport;
        handlers.push((
            "generator run".into(),
            gen.handler_path(&gen.run_handler),
            Arc::clone(gen_transport),
        ));
        if let (true, Some(build)) = (gen.rebuild, &gen.build_handler) {
            handlers.push(("generator build".into(), gen.handler_path(build), Arc::clone(gen_transport)));
        }
        if let (true, Some(clean)) = (gen.cleanup, &gen.clean_handler) {
            handlers.push(("generator clean".into(), gen.handler_path(clean), Arc::clone(gen_transport)));
        }
        handlers
    }

    /// Verify every required handler exists and is executable on its node.
    pub async fn check_handlers(&self) -> TestResult<()> {
        for (role, path, transport) in self.required_handlers() {
            let inv = Invocation::new("test").arg("-x").arg(path.to_string_lossy());
            let out = transport.run(&inv).await?;
            if !out.success() {
                error!(handler = %role, path = %path.display(), "handler missing");
                return Err(TestError::HandlerMissing { path });
            }
        }
        info!("all handlers present");
        Ok(())
    }

    /// Checks and preparation before the first combination. Any error here
    /// aborts the execution.
    pub async fn preflight(&mut self) -> TestResult<()> {
        self.check_handlers().await?;

        if self.config.controller.rebuild {
            self.controller.build().await?;
        }
        let gen = &self.config.generator;
        if let (true, Some(build)) = (gen.rebuild, &gen.build_handler) {
            info!("building generator");
            let inv = Invocation::new(gen.handler_path(build).to_string_lossy());
            run_handler(self.generator_transport.as_ref(), "generator build", &inv).await?;
        }

        self.controller.check_port_free().await?;
        self.controller
            .generate_initial_state(self.config.controller.start_timeout())
            .await
    }

    /// Run the whole execution and write the results file.
    ///
    /// Errors only for pre-flight failures and results I/O; combination
    /// failures become failed samples.
    pub async fn run(mut self) -> Result<Report> {
        let span = info_span!(
            "execution",
            id = %self.execution_id,
            test = %self.config.test.name
        );
        async move {
            let dimensions = DimensionSet::from_config(&self.config);
            info!(
                combinations = dimensions.len(),
                kind = ?self.pipeline.kind(),
                "starting test execution"
            );

            let mut aggregator = Aggregator::new(SampleIds::starting_at(0));
            let mut failed_combinations = 0;

            let preflight = self.preflight().await;
            if let Err(e) = &preflight {
                error!(error = %e, "pre-flight failed");
            } else {
                for combination in dimensions.iter() {
                    let span = info_span!(
                        "combination",
                        index = combination.index,
                        dims = %combination
                    );
                    let (samples, failure) = self
                        .run_combination(&combination, aggregator.ids())
                        .instrument(span)
                        .await;
                    aggregator.append(samples);
                    if let Some(e) = failure {
                        failed_combinations += 1;
                        if e.is_fatal() {
                            error!(error = %e, "fatal error, abandoning remaining combinations");
                            break;
                        }
                    }
                }
            }

            self.final_teardown().await;

            let results_path = self.config.test.output_dir.join(&self.config.test.results_file);
            if let Err(e) = preflight {
                // The results file exists even when nothing ran.
                if let Err(write_err) = aggregator.write_json(&results_path) {
                    warn!(error = %write_err, "failed to write empty results file");
                }
                return Err(e).context("pre-flight checks failed");
            }

            aggregator.write_json(&results_path)?;
            let summary = aggregator.summary();
            summary.log(&self.config.test.name);

            Ok(Report {
                execution_id: self.execution_id,
                samples: aggregator.into_samples(),
                summary,
                failed_combinations,
                results_path,
            })
        }
        .instrument(span)
        .await
    }

    /// One combination. Never fails: errors are logged and turned into a
    /// failed sample after teardown.
    async fn run_combination(
        &mut self,
        combination: &Combination,
        ids: &SampleIds,
    ) -> (Vec<Sample>, Option<TestError>) {
        let params =
            GeneratorParams::resolve(&self.config.generator, &self.config.controller, combination);
        let mut context = SampleContext {
            combination: combination.clone(),
            load: params.load_parameters(&self.config.controller),
            ids: ids.clone(),
            probe: Arc::clone(&self.probe),
            controller_pid: None,
        };

        let output = match self.start_controller(combination).await {
            Ok(pid) => {
                context.controller_pid = Some(pid);
                self.pipeline
                    .run(RunContext {
                        params,
                        samples: context.clone(),
                    })
                    .await
            }
            Err(e) => PipelineOutput::failed(Vec::new(), e),
        };

        let PipelineOutput { samples, failure } = output;
        let e = match failure {
            Some(e) => e,
            None => match self.controller.stop().await {
                Ok(()) => {
                    info!(samples = samples.len(), "combination finished");
                    return (samples, None);
                }
                Err(e) => e,
            },
        };
        self.fail_combination(combination, &context, samples, e).await
    }

    async fn start_controller(&mut self, combination: &Combination) -> TestResult<u32> {
        let period = combination
            .get_u64(STATS_PERIOD_DIMENSION)
            .or(self.config.controller.statistics_period_ms);
        if let Some(period) = period {
            self.controller.change_stats_period(period).await?;
        }
        self.controller
            .start(self.config.controller.start_timeout())
            .await
    }

    async fn fail_combination(
        &mut self,
        combination: &Combination,
        context: &SampleContext,
        mut samples: Vec<Sample>,
        e: TestError,
    ) -> (Vec<Sample>, Option<TestError>) {
        let dims: Vec<String> = combination
            .values()
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        error!(error = %e, dimensions = ?dims, "combination failed");

        if !samples.iter().any(Sample::is_failure) {
            samples.push(context.failure().await);
        }

        let log_dir = self
            .config
            .test
            .output_dir
            .join("log")
            .join(format!("failed-{}", combination.index));
        let mut teardown = Teardown::new("combination");
        teardown.step("stop controller", self.controller.stop()).await;
        teardown
            .step("collect logs", collect_logs(&self.controller, &log_dir))
            .await;
        teardown.finish();

        (samples, Some(e))
    }

    async fn final_teardown(&mut self) {
        let mut teardown = Teardown::new("execution");
        teardown.step("stop controller", self.controller.stop()).await;
        let log_dir = self.config.test.output_dir.join("log");
        teardown
            .step("collect logs", collect_logs(&self.controller, &log_dir))
            .await;
        if self.config.controller.cleanup {
            teardown.step("clean controller", self.controller.cleanup()).await;
        }
        let gen = &self.config.generator;
        if let (true, Some(clean)) = (gen.cleanup, &gen.clean_handler) {
            let inv = Invocation::new(gen.handler_path(clean).to_string_lossy());
            teardown
                .step("clean generator", async {
                    run_handler(self.generator_transport.as_ref(), "generator clean", &inv)
                        .await
                        .map(|_| ())
                })
                .await;
        }
        let errors = teardown.finish();
        if errors.is_empty() {
            info!("teardown complete");
        } else {
            warn!(failed_steps = errors.len(), "teardown incomplete");
        }
    }
}

/// Count handler path; relative paths live in the controller base dir.
fn count_handler_path(config: &BenchConfig) -> TestResult<PathBuf> {
    let handler = config.watcher.count_handler.as_ref().ok_or_else(|| {
        TestError::Config("watcher.source = \"handler\" requires watcher.count_handler".into())
    })?;
    Ok(config.controller.handler_path(handler))
}
