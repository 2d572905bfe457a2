//! Consumes the generator stream and turns result lines into samples.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::TestError;
use crate::sample::{Measurement, SampleContext};

use super::{PipelineOutput, StreamMessage};

/// Per-millisecond throughput on a result line: `... total = <float> per ms`.
pub fn parse_result_line(line: &str) -> Option<f64> {
    const PREFIX: &str = "total = ";
    let start = line.find(PREFIX)? + PREFIX.len();
    let rest = &line[start..];
    let end = rest.find(" per ms")?;
    rest[..end].trim().parse().ok()
}

pub struct Monitor {
    rx: mpsc::Receiver<StreamMessage>,
    channel_timeout: Duration,
    context: SampleContext,
}

impl Monitor {
    pub fn new(
        rx: mpsc::Receiver<StreamMessage>,
        channel_timeout: Duration,
        context: SampleContext,
    ) -> Self {
        Self {
            rx,
            channel_timeout,
            context,
        }
    }

    /// Read until a terminal message, a silent period longer than the
    /// channel timeout, or a closed stream.
    pub async fn run(mut self) -> PipelineOutput {
        let mut samples = Vec::new();
        let mut internal_repeat_id = 0u32;

        loop {
            let msg = match timeout(self.channel_timeout, self.rx.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    warn!(
                        timeout_secs = self.channel_timeout.as_secs(),
                        collected = samples.len(),
                        "no generator output within channel timeout"
                    );
                    return PipelineOutput::failed(
                        samples,
                        TestError::ChannelTimeout {
                            waited_secs: self.channel_timeout.as_secs(),
                        },
                    );
                }
            };

            match msg {
                Some(StreamMessage::Line(line)) => {
                    let Some(per_ms) = parse_result_line(&line) else {
                        continue;
                    };
                    let sample = self
                        .context
                        .record(Measurement::Throughput {
                            throughput_responses_sec: per_ms * 1000.0,
                            internal_repeat_id,
                        })
                        .await;
                    debug!(
                        global_sample_id = sample.global_sample_id,
                        throughput = per_ms * 1000.0,
                        "recorded sample"
                    );
                    internal_repeat_id += 1;
                    samples.push(sample);
                }
                Some(StreamMessage::Success) => return PipelineOutput::ok(samples),
                Some(StreamMessage::Failure(reason)) => {
                    samples.push(self.context.failure().await);
                    return PipelineOutput::failed(
                        samples,
                        TestError::GeneratorExecutionFailure { reason },
                    );
                }
                None => {
                    samples.push(self.context.failure().await);
                    return PipelineOutput::failed(
                        samples,
                        TestError::GeneratorExecutionFailure {
                            reason: "generator stream closed without a terminal message"
                                .to_string(),
                        },
                    );
                }
            }
        }
    }
}
