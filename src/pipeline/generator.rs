//! Load generator process.
//!
//! Runs the generator handler, forwards each stdout line to the stream and
//! closes the stream with exactly one terminal message.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{ControllerConfig, GeneratorConfig};
use crate::dimensions::Combination;
use crate::error::{TestError, TestResult};
use crate::sample::LoadParameters;
use crate::transport::{Invocation, Transport};

use super::StreamMessage;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Generator arguments for one combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorParams {
    pub cpus: String,
    pub controller_ip: String,
    pub controller_port: u16,
    pub threads: u64,
    pub switches_per_thread: u64,
    pub thread_creation_delay_ms: u64,
    pub delay_before_traffic_ms: u64,
    pub ms_per_test: u64,
    pub internal_repeats: u64,
    pub simulated_hosts: u64,
    pub warmup: u64,
    pub mode: String,
}

impl GeneratorParams {
    /// Configured values, overridden by dimensions with the same name.
    pub fn resolve(
        generator: &GeneratorConfig,
        controller: &ControllerConfig,
        combination: &Combination,
    ) -> Self {
        let num = |name: &str, default: u64| combination.get_u64(name).unwrap_or(default);
        Self {
            cpus: generator.cpus.clone(),
            controller_ip: controller.ip.clone(),
            controller_port: controller.port,
            threads: num("threads", generator.threads),
            switches_per_thread: num("switches_per_thread", generator.switches_per_thread),
            thread_creation_delay_ms: num(
                "thread_creation_delay_ms",
                generator.thread_creation_delay_ms,
            ),
            delay_before_traffic_ms: num(
                "delay_before_traffic_ms",
                generator.delay_before_traffic_ms,
            ),
            ms_per_test: num("ms_per_test", generator.ms_per_test),
            internal_repeats: num("internal_repeats", generator.internal_repeats),
            simulated_hosts: num("simulated_hosts", generator.simulated_hosts),
            warmup: num("warmup", generator.warmup),
            mode: combination
                .get("mode")
                .map(ToString::to_string)
                .unwrap_or_else(|| generator.mode.clone()),
        }
    }

    pub fn total_switches(&self) -> u64 {
        self.threads * self.switches_per_thread
    }

    /// What samples of this run are stamped with.
    pub fn load_parameters(&self, controller: &ControllerConfig) -> LoadParameters {
        LoadParameters {
            generator_threads: self.threads,
            generator_switches_per_thread: self.switches_per_thread,
            generator_total_switches: self.total_switches(),
            generator_thread_creation_delay_ms: self.thread_creation_delay_ms,
            generator_delay_before_traffic_ms: self.delay_before_traffic_ms,
            generator_ms_per_test: self.ms_per_test,
            generator_internal_repeats: self.internal_repeats,
            generator_simulated_hosts: self.simulated_hosts,
            generator_warmup: self.warmup,
            generator_mode: self.mode.clone(),
            generator_cpus: self.cpus.clone(),
            controller_ip: self.controller_ip.clone(),
            controller_port: self.controller_port,
            controller_cpus: controller.cpus.clone(),
        }
    }

    /// Positional handler arguments, affinity list first.
    pub fn args(&self) -> Vec<String> {
        vec![
            self.cpus.clone(),
            self.controller_ip.clone(),
            self.controller_port.to_string(),
            self.threads.to_string(),
            self.switches_per_thread.to_string(),
            self.total_switches().to_string(),
            self.thread_creation_delay_ms.to_string(),
            self.delay_before_traffic_ms.to_string(),
            self.ms_per_test.to_string(),
            self.internal_repeats.to_string(),
            self.simulated_hosts.to_string(),
            self.warmup.to_string(),
            self.mode.clone(),
        ]
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

pub struct Generator {
    transport: Arc<dyn Transport>,
    handler: PathBuf,
    params: GeneratorParams,
}

/// A running generator task.
pub struct GeneratorHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<TestResult<()>>,
}

impl GeneratorHandle {
    /// Terminate the generator if it is still running, then join it.
    pub async fn finish(self) -> TestResult<()> {
        let _ = self.shutdown_tx.send(());
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(TestError::GeneratorExecutionFailure {
                reason: format!("generator task failed: {}", e),
            }),
        }
    }
}

impl Generator {
    pub fn new(transport: Arc<dyn Transport>, handler: PathBuf, params: GeneratorParams) -> Self {
        Self {
            transport,
            handler,
            params,
        }
    }

    /// Run on a separate task. The stream receives the tool's lines followed
    /// by one `Success` or `Failure`.
    pub fn spawn(self, tx: mpsc::Sender<StreamMessage>) -> GeneratorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(tx, shutdown_rx));
        GeneratorHandle { shutdown_tx, join }
    }

    async fn run(
        self,
        tx: mpsc::Sender<StreamMessage>,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> TestResult<()> {
        let result = self.execute(&tx, shutdown_rx).await;
        let terminal = match &result {
            Ok(()) => StreamMessage::Success,
            Err(e) => StreamMessage::Failure(e.to_string()),
        };
        if tx.send(terminal).await.is_err() {
            debug!("stream receiver gone before terminal message");
        }
        result
    }

    async fn execute(
        &self,
        tx: &mpsc::Sender<StreamMessage>,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> TestResult<()> {
        let inv = Invocation::new(self.handler.to_string_lossy()).args(self.params.args());
        info!(
            target_node = %self.transport.describe(),
            command = %inv.display(),
            switches = self.params.total_switches(),
            "starting generator"
        );

        let mut child = self
            .transport
            .command(&inv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TestError::GeneratorExecutionFailure {
                reason: "generator stdout not captured".to_string(),
            })?;
        // Raw lines: a stray non-UTF-8 byte must not end the run.
        let mut lines = BufReader::new(stdout).split(b'\n');

        // A dropped sender counts as a shutdown request.
        let shutdown = async {
            let _ = shutdown_rx.await;
        };
        tokio::pin!(shutdown);

        let mut forwarding = true;
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!("shutdown requested, terminating generator");
                    terminate_child(&mut child).await;
                    return Ok(());
                }

                line = lines.next_segment() => match line? {
                    Some(raw) => {
                        let line = decode_line(&raw);
                        trace!(line = %line, "generator output");
                        if forwarding && tx.send(StreamMessage::Line(line)).await.is_err() {
                            debug!("stream receiver gone, draining generator output");
                            forwarding = false;
                        }
                    }
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            biased;

            _ = &mut shutdown => {
                terminate_child(&mut child).await;
                return Ok(());
            }

            status = child.wait() => status?,
        };
        if !status.success() {
            return Err(TestError::GeneratorExecutionFailure {
                reason: format!("generator exited with code {:?}", status.code()),
            });
        }
        info!("generator finished");
        Ok(())
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// SIGTERM, then SIGKILL if the child is still alive after 5 seconds.
async fn terminate_child(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "generator exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for generator after SIGTERM");
        }
        Err(_) => {
            warn!("generator did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL generator");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
