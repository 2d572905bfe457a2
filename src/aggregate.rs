//! Execution-wide sample list, results file and summary statistics.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::sample::{Sample, SampleIds};

/// Owns every sample of an execution, in id order.
#[derive(Debug, Default)]
pub struct Aggregator {
    samples: Vec<Sample>,
    ids: SampleIds,
}

impl Aggregator {
    pub fn new(ids: SampleIds) -> Self {
        Self {
            samples: Vec::new(),
            ids,
        }
    }

    /// Counter that runs draw sample ids from.
    pub fn ids(&self) -> &SampleIds {
        &self.ids
    }

    /// Append one run's samples and continue numbering after the last one.
    pub fn append(&mut self, run: Vec<Sample>) {
        let Some(last) = run.last().map(|s| s.global_sample_id) else {
            return;
        };
        if let (Some(prev), Some(first)) = (self.samples.last(), run.first()) {
            if first.global_sample_id <= prev.global_sample_id {
                warn!(
                    previous = prev.global_sample_id,
                    first = first.global_sample_id,
                    "run sample ids do not continue the sequence"
                );
            }
        }
        self.samples.extend(run);
        self.ids.reset_to(last + 1);
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    pub fn summary(&self) -> Summary {
        Summary::of(&self.samples)
    }

    /// Write all samples as a pretty JSON array.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.samples)
            .context("failed to serialize samples")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write results to {}", path.display()))?;
        info!(path = %path.display(), samples = self.samples.len(), "results written");
        Ok(())
    }
}

/// Headline numbers over successful throughput samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub sample_count: usize,
    pub failed_samples: usize,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    /// `std_dev / mean`.
    pub coefficient_of_variation: Option<f64>,
}

impl Summary {
    pub fn of(samples: &[Sample]) -> Self {
        let values: Vec<f64> = samples
            .iter()
            .filter(|s| !s.is_failure())
            .filter_map(Sample::throughput)
            .collect();
        let failed_samples = samples.iter().filter(|s| s.is_failure()).count();

        if values.is_empty() {
            return Self {
                sample_count: samples.len(),
                failed_samples,
                ..Self::default()
            };
        }

        let count = values.len() as f64;
        let mean = values.iter().sum::<f64>() / count;
        let variance = if values.len() > 1 {
            values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (count - 1.0)
        } else {
            0.0
        };
        let std_dev = variance.sqrt();

        Self {
            sample_count: samples.len(),
            failed_samples,
            mean: Some(mean),
            std_dev: Some(std_dev),
            coefficient_of_variation: (mean != 0.0).then(|| std_dev / mean),
        }
    }

    pub fn log(&self, test: &str) {
        info!(
            test,
            samples = self.sample_count,
            failed = self.failed_samples,
            mean = ?self.mean,
            std_dev = ?self.std_dev,
            cv = ?self.coefficient_of_variation,
            "execution summary"
        );
    }
}
