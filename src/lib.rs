//! ctlbench -- stress and stability tests for SDN controllers.
//!
//! This crate drives a controller through its lifecycle handlers, runs a
//! southbound load generator against it for every combination of the
//! configured test dimensions, and collects the measurements into one
//! numbered sample sequence.

pub mod aggregate;
pub mod config;
pub mod controller;
pub mod dimensions;
pub mod error;
pub mod pipeline;
pub mod run;
pub mod sample;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use anyhow::Result;

/// Run a full test execution: pre-flight, all combinations, teardown and
/// results file.
pub async fn execute(config: config::BenchConfig) -> Result<run::Report> {
    tracing::info!(test = %config.test.name, kind = ?config.test.kind, "Initializing coordinator");
    let coordinator = run::Coordinator::from_config(config)?;
    coordinator.run().await
}
