//! Command execution on the controller and generator nodes.
//!
//! Every handler invocation goes through a [`Transport`], so the same
//! lifecycle code drives a controller on the local host or on a remote node
//! reached over SSH.

pub mod ssh;

use std::path::Path;
use std::process::Stdio;

use tracing::debug;

use crate::error::{TestError, TestResult};

pub use ssh::SshTransport;

/// One command line plus the environment it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Pin the command to a CPU list with `taskset -c`.
    pub fn pinned(self, cpus: Option<&str>) -> Self {
        match cpus {
            Some(cpus) if !cpus.is_empty() => {
                let mut args = vec!["-c".to_string(), cpus.to_string(), self.program];
                args.extend(self.args);
                Self {
                    program: "taskset".to_string(),
                    args,
                    env: self.env,
                }
            }
            _ => self,
        }
    }

    /// Space-joined command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(out: std::process::Output) -> Self {
        Self {
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        }
    }
}

/// Where commands run.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Build the process for `invocation`. Callers that stream output
    /// configure stdio themselves.
    fn command(&self, invocation: &Invocation) -> tokio::process::Command;

    /// Short human-readable target, e.g. `local` or `ssh ops@10.0.0.5:22`.
    fn describe(&self) -> String;

    /// Run to completion and capture output. A non-zero exit is not an error
    /// at this level.
    async fn run(&self, invocation: &Invocation) -> TestResult<CommandOutput> {
        debug!(target_node = %self.describe(), command = %invocation.display(), "exec");
        let output = self
            .command(invocation)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output.into())
    }

    /// Copy directory `remote` on the node into `local`. The default suits
    /// transports whose commands run on this host.
    async fn fetch_dir(&self, remote: &Path, local: &Path) -> TestResult<()> {
        let (remote, local) = (remote.to_path_buf(), local.to_path_buf());
        tokio::task::spawn_blocking(move || copy_dir(&remote, &local))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Run a handler and map a non-zero exit to [`TestError::HandlerFailed`].
pub async fn run_handler(
    transport: &dyn Transport,
    name: &str,
    invocation: &Invocation,
) -> TestResult<CommandOutput> {
    let output = transport.run(invocation).await?;
    if !output.success() {
        return Err(TestError::HandlerFailed {
            handler: name.to_string(),
            code: output.code,
            output: output.combined().trim().to_string(),
        });
    }
    Ok(output)
}

/// Commands run directly on this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

#[async_trait::async_trait]
impl Transport for LocalTransport {
    fn command(&self, invocation: &Invocation) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}
