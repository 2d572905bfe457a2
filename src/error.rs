//! Error kinds raised while executing a test.
//!
//! `HandlerMissing` and `Config` are pre-flight errors and abort the whole
//! execution. Everything else is caught at the combination boundary and
//! turned into a failed sample.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TestError {
    #[error("another process is already listening on controller port {port}")]
    PortConflict { port: u16 },

    #[error("controller did not start listening on port {port} within {waited_secs}s")]
    StartTimeout { port: u16, waited_secs: u64 },

    #[error("controller status did not report running within {waited_secs}s")]
    ReadyTimeout { waited_secs: u64 },

    #[error("no message from generator within {waited_secs}s")]
    ChannelTimeout { waited_secs: u64 },

    #[error("discovery made no progress towards {target} entities within {deadline_ms}ms")]
    DiscoveryPartial { target: u64, deadline_ms: u64 },

    #[error("handler not found or not executable: {}", path.display())]
    HandlerMissing { path: PathBuf },

    #[error("generator execution failed: {reason}")]
    GeneratorExecutionFailure { reason: String },

    #[error("handler {handler} exited with code {code:?}: {output}")]
    HandlerFailed {
        handler: String,
        code: Option<i32>,
        output: String,
    },

    #[error("status handler printed {output:?}, expected \"0\" or \"1\"")]
    UnexpectedStatus { output: String },

    #[error("failed to execute command: {0}")]
    Transport(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TestError {
    /// Pre-flight errors abort the execution instead of degrading to a
    /// failed sample.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TestError::HandlerMissing { .. } | TestError::Config(_))
    }
}

pub type TestResult<T> = std::result::Result<T, TestError>;
