//! Best-effort cleanup.
//!
//! Every step runs even if an earlier one failed. Failures are logged and
//! collected, never propagated, so they cannot hide the error that caused
//! the teardown.

use std::future::Future;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::error::{TestError, TestResult};

#[derive(Debug)]
pub struct Teardown {
    label: &'static str,
    errors: Vec<(&'static str, TestError)>,
}

impl Teardown {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            errors: Vec::new(),
        }
    }

    /// Run one step, recording its error instead of returning it.
    pub async fn step<F>(&mut self, name: &'static str, step: F) -> &mut Self
    where
        F: Future<Output = TestResult<()>>,
    {
        match step.await {
            Ok(()) => debug!(teardown = self.label, step = name, "teardown step done"),
            Err(e) => {
                warn!(teardown = self.label, step = name, error = %e, "teardown step failed");
                self.errors.push((name, e));
            }
        }
        self
    }

    pub fn finish(self) -> Vec<(&'static str, TestError)> {
        if !self.errors.is_empty() {
            warn!(
                teardown = self.label,
                failed_steps = self.errors.len(),
                "teardown finished with errors"
            );
        }
        self.errors
    }
}

/// Copy the controller log directory into `dest`. A controller without a
/// configured log directory has nothing to collect.
pub async fn collect_logs(controller: &Controller, dest: &Path) -> TestResult<()> {
    let Some(logs) = controller.logs_dir() else {
        debug!("no controller log directory configured");
        return Ok(());
    };
    controller.transport().fetch_dir(&logs, dest).await?;
    info!(from = %logs.display(), to = %dest.display(), "collected controller logs");
    Ok(())
}
