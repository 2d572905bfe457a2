//! Polls a discovered-entity counter until it reaches a target or a
//! deadline passes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, WatcherConfig};
use crate::error::{TestError, TestResult};
use crate::transport::{run_handler, Invocation, Transport};

use super::generator::GeneratorParams;

// ---------------------------------------------------------------------------
// Count sources
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait CountSource: Send + Sync {
    async fn count(&self) -> TestResult<u64>;
    fn describe(&self) -> String;
}

/// Counts OpenFlow nodes in the controller's operational topology.
pub struct RestconfCountSource {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl RestconfCountSource {
    pub fn new(controller: &ControllerConfig) -> TestResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(std::io::Error::other)?;
        Ok(Self {
            client,
            url: format!(
                "http://{}:{}/restconf/operational/network-topology:network-topology",
                controller.ip, controller.restconf_port
            ),
            user: controller.restconf_user.clone(),
            password: controller.restconf_password.clone(),
        })
    }
}

#[async_trait::async_trait]
impl CountSource for RestconfCountSource {
    async fn count(&self) -> TestResult<u64> {
        let body: Value = self
            .client
            .get(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(std::io::Error::other)?
            .json()
            .await
            .map_err(std::io::Error::other)?;
        Ok(count_openflow_nodes(&body))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Nodes with an `openflow:` node-id across all topologies.
pub fn count_openflow_nodes(body: &Value) -> u64 {
    let topologies = body
        .pointer("/network-topology/topology")
        .and_then(Value::as_array);
    let Some(topologies) = topologies else {
        return 0;
    };
    topologies
        .iter()
        .filter_map(|t| t.get("node").and_then(Value::as_array))
        .flatten()
        .filter(|node| {
            node.get("node-id")
                .and_then(Value::as_str)
                .is_some_and(|id| id.starts_with("openflow:"))
        })
        .count() as u64
}

/// Runs an executable whose trimmed stdout is the count.
pub struct HandlerCountSource {
    transport: Arc<dyn Transport>,
    handler: PathBuf,
}

impl HandlerCountSource {
    pub fn new(transport: Arc<dyn Transport>, handler: PathBuf) -> Self {
        Self { transport, handler }
    }
}

#[async_trait::async_trait]
impl CountSource for HandlerCountSource {
    async fn count(&self) -> TestResult<u64> {
        let inv = Invocation::new(self.handler.to_string_lossy());
        let out = run_handler(self.transport.as_ref(), "count", &inv).await?;
        out.stdout
            .trim()
            .parse()
            .map_err(|_| TestError::HandlerFailed {
                handler: "count".to_string(),
                code: out.code,
                output: format!("not a count: {:?}", out.stdout.trim()),
            })
    }

    fn describe(&self) -> String {
        self.handler.display().to_string()
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Outcome of one watch. `converged == false` means the deadline passed
/// with only part of the target observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollResult {
    pub elapsed_ms: u64,
    pub observed_count: u64,
    pub converged: bool,
}

/// Time budget for discovering `params.total_switches()` entities.
pub fn discovery_deadline(config: &WatcherConfig, params: &GeneratorParams) -> Duration {
    let offset = config.startup_offset_ms + params.threads * params.thread_creation_delay_ms;
    Duration::from_millis(config.per_entity_ms * params.total_switches() + offset)
}

pub struct Watcher {
    source: Arc<dyn CountSource>,
    poll_interval: Duration,
}

impl Watcher {
    pub fn new(source: Arc<dyn CountSource>, poll_interval: Duration) -> Self {
        Self {
            source,
            poll_interval,
        }
    }

    /// Poll until the count reaches `target` or `deadline` passes.
    ///
    /// Fails with `DiscoveryPartial` only when nothing at all was observed.
    pub async fn watch(&self, target: u64, deadline: Duration) -> TestResult<PollResult> {
        info!(
            source = %self.source.describe(),
            target,
            deadline_ms = deadline.as_millis() as u64,
            "watching discovery"
        );
        let began = Instant::now();
        let mut tick = interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut best = 0u64;

        loop {
            tick.tick().await;
            match self.source.count().await {
                Ok(count) => {
                    debug!(count, target, "discovery poll");
                    best = best.max(count);
                    if count >= target {
                        let result = PollResult {
                            elapsed_ms: began.elapsed().as_millis() as u64,
                            observed_count: count,
                            converged: true,
                        };
                        info!(elapsed_ms = result.elapsed_ms, count, "discovery converged");
                        return Ok(result);
                    }
                }
                Err(e) => warn!(error = %e, "discovery poll failed"),
            }
            if began.elapsed() >= deadline {
                break;
            }
        }

        if best == 0 {
            return Err(TestError::DiscoveryPartial {
                target,
                deadline_ms: deadline.as_millis() as u64,
            });
        }
        let result = PollResult {
            elapsed_ms: began.elapsed().as_millis() as u64,
            observed_count: best,
            converged: false,
        };
        warn!(
            elapsed_ms = result.elapsed_ms,
            observed = best,
            target,
            "discovery deadline passed before convergence"
        );
        Ok(result)
    }
}
