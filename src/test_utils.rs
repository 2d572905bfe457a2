//! Test helpers shared by unit and integration tests.
//!
//! [`ScriptedController`] is a [`Transport`] that plays a controller node in
//! memory: the lifecycle handlers flip a running flag, `netstat` reports the
//! listener and `kill -s 0` answers from the same state. Node counters
//! (`/proc/loadavg`, `free`, `ps`) are canned. Nothing is spawned.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::TestResult;
use crate::transport::{CommandOutput, Invocation, Transport};

/// Mutable state of the scripted node. Tests tweak it through
/// [`ScriptedController::state`].
#[derive(Debug)]
pub struct ScriptedState {
    pub port: u16,
    pub running: bool,
    /// PID currently bound to `port`.
    pub listener: Option<u32>,
    /// Port taken by a process whose PID is hidden from us.
    pub foreign_listener: bool,
    /// PID handed to the next started controller.
    pub next_pid: u32,
    /// Start handler exits non-zero.
    pub fail_start: bool,
    /// Started controller never binds the port.
    pub never_listen: bool,
    /// Only this many starts bind the port; later ones behave like
    /// `never_listen`.
    pub listen_limit: Option<usize>,
    /// Status keeps printing `0` even after start.
    pub never_ready: bool,
    /// Handler file names reported missing by `test -x`.
    pub missing: Vec<String>,
    /// Successive answers of the count handler; the last one repeats.
    pub counts: VecDeque<u64>,
    pub start_calls: usize,
    pub stop_calls: usize,
    pub build_calls: usize,
    pub clean_calls: usize,
    pub stats_periods: Vec<String>,
    pub invocations: Vec<Invocation>,
}

impl Default for ScriptedState {
    fn default() -> Self {
        Self {
            port: 6653,
            running: false,
            listener: None,
            foreign_listener: false,
            next_pid: 4242,
            fail_start: false,
            never_listen: false,
            listen_limit: None,
            never_ready: false,
            missing: Vec::new(),
            counts: VecDeque::new(),
            start_calls: 0,
            stop_calls: 0,
            build_calls: 0,
            clean_calls: 0,
            stats_periods: Vec::new(),
            invocations: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedController {
    state: Mutex<ScriptedState>,
}

impl ScriptedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// A controller that is already up with `pid` on the default port.
    pub fn running(pid: u32) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state();
            state.running = true;
            state.listener = Some(pid);
        }
        fake
    }

    pub fn state(&self) -> MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn answer(&self, invocation: &Invocation) -> CommandOutput {
        let mut state = self.state();
        state.invocations.push(invocation.clone());

        // Look through `taskset -c <cpus>`.
        let (program, args) = if invocation.program == "taskset" && invocation.args.len() >= 3 {
            (invocation.args[2].as_str(), &invocation.args[3..])
        } else {
            (invocation.program.as_str(), &invocation.args[..])
        };
        let name = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);

        match name {
            "netstat" => {
                let mut out = String::from(
                    "Proto Recv-Q Send-Q Local Address Foreign Address State PID/Program name\n",
                );
                if state.foreign_listener {
                    out.push_str(&format!("tcp 0 0 0.0.0.0:{} 0.0.0.0:* LISTEN -\n", state.port));
                } else if let Some(pid) = state.listener {
                    out.push_str(&format!("tcp6 0 0 :::{} :::* LISTEN {}/java\n", state.port, pid));
                }
                ok(out)
            }
            "sh" => {
                let line = args.get(1).map(String::as_str).unwrap_or("");
                let pid = line.strip_prefix("kill -s 0 ").and_then(|p| p.trim().parse().ok());
                if pid.is_some() && pid == state.listener {
                    ok(String::new())
                } else {
                    exit(1, "kill: No such process")
                }
            }
            "cat" if args.first().map(String::as_str) == Some("/proc/loadavg") => {
                ok("0.50 0.40 0.30 1/200 999\n".to_string())
            }
            "free" => ok(concat!(
                "              total        used        free      shared  buff/cache   available\n",
                "Mem:     8000000000  3000000000  1000000000    10000000  4000000000  4500000000\n",
                "Swap:             0           0           0\n",
            )
            .to_string()),
            "ps" => {
                let pid = args.last().and_then(|p| p.parse().ok());
                if pid.is_some() && pid == state.listener {
                    ok("  12.5 204800    42\n".to_string())
                } else {
                    exit(1, "")
                }
            }
            "test" => {
                let path = args.last().map(String::as_str).unwrap_or("");
                let missing = state.missing.iter().any(|m| path.ends_with(m.as_str()));
                if missing {
                    exit(1, "")
                } else {
                    ok(String::new())
                }
            }
            n if n.starts_with("status") => {
                let up = state.running && !state.never_ready;
                ok(if up { "1\n" } else { "0\n" }.to_string())
            }
            n if n.starts_with("start") => {
                state.start_calls += 1;
                if state.fail_start {
                    return exit(1, "start failed");
                }
                state.running = true;
                let within_limit = state.listen_limit.map_or(true, |n| state.start_calls <= n);
                if !state.never_listen && within_limit {
                    state.listener = Some(state.next_pid);
                    state.next_pid += 1;
                }
                ok(String::new())
            }
            n if n.starts_with("stop") => {
                state.stop_calls += 1;
                state.running = false;
                state.listener = None;
                ok(String::new())
            }
            n if n.starts_with("build") => {
                state.build_calls += 1;
                ok(String::new())
            }
            n if n.starts_with("clean") => {
                state.clean_calls += 1;
                ok(String::new())
            }
            n if n.starts_with("statistics") => {
                let period = args.first().cloned().unwrap_or_default();
                state.stats_periods.push(period);
                ok(String::new())
            }
            n if n.contains("count") => {
                let count = if state.counts.len() > 1 {
                    state.counts.pop_front()
                } else {
                    state.counts.front().copied()
                };
                ok(format!("{}\n", count.unwrap_or(0)))
            }
            _ => exit(127, "command not found"),
        }
    }
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout,
        stderr: String::new(),
    }
}

fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedController {
    fn command(&self, _invocation: &Invocation) -> tokio::process::Command {
        tokio::process::Command::new("true")
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn run(&self, invocation: &Invocation) -> TestResult<CommandOutput> {
        Ok(self.answer(invocation))
    }
}

/// Write an executable shell script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}
