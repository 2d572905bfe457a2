//! Controller lifecycle: build, start, stop, restart and clean a controller
//! through its handler scripts.
//!
//! Handlers follow a small protocol. `status` prints `1` or `0`; every other
//! handler exits zero on success. Start and stop are idempotent: calling
//! either when the controller is already in the target state does nothing.

pub mod port;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::error::{TestError, TestResult};
use crate::transport::{run_handler, Invocation, Transport};

pub use port::PortOwner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerStatus {
    Unknown,
    Building,
    Built,
    Starting,
    Started,
    Restarting,
    Restarted,
    Stopping,
    Stopped,
    Cleaning,
    Cleaned,
}

impl std::fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControllerStatus::Unknown => "UNKNOWN",
            ControllerStatus::Building => "BUILDING",
            ControllerStatus::Built => "BUILT",
            ControllerStatus::Starting => "STARTING",
            ControllerStatus::Started => "STARTED",
            ControllerStatus::Restarting => "RESTARTING",
            ControllerStatus::Restarted => "RESTARTED",
            ControllerStatus::Stopping => "STOPPING",
            ControllerStatus::Stopped => "STOPPED",
            ControllerStatus::Cleaning => "CLEANING",
            ControllerStatus::Cleaned => "CLEANED",
        };
        f.write_str(s)
    }
}

/// One controller instance and the node it runs on.
pub struct Controller {
    config: ControllerConfig,
    transport: Arc<dyn Transport>,
    status: ControllerStatus,
    pid: Option<u32>,
}

impl Controller {
    pub fn new(config: ControllerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            status: ControllerStatus::Unknown,
            pid: None,
        }
    }

    pub fn status(&self) -> ControllerStatus {
        self.status
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Every handler the lifecycle may invoke, by role.
    pub fn handler_paths(&self) -> Vec<(&'static str, PathBuf)> {
        let c = &self.config;
        vec![
            ("build", c.handler_path(&c.build_handler)),
            ("start", c.handler_path(&c.start_handler)),
            ("stop", c.handler_path(&c.stop_handler)),
            ("status", c.handler_path(&c.status_handler)),
            ("clean", c.handler_path(&c.clean_handler)),
            ("statistics", c.handler_path(&c.statistics_handler)),
        ]
    }

    /// Controller log directory on its node, if configured.
    pub fn logs_dir(&self) -> Option<PathBuf> {
        self.config
            .logs_dir
            .as_ref()
            .map(|dir| self.config.base_dir.join(dir))
    }

    fn handler(&self, handler: &str) -> Invocation {
        Invocation::new(self.config.handler_path(handler).to_string_lossy())
    }

    /// Ask the status handler whether the controller is up.
    pub async fn is_running(&self) -> TestResult<bool> {
        let inv = self.handler(&self.config.status_handler);
        let out = run_handler(self.transport.as_ref(), "status", &inv).await?;
        match out.stdout.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(TestError::UnexpectedStatus {
                output: other.to_string(),
            }),
        }
    }

    pub async fn build(&mut self) -> TestResult<()> {
        info!(controller = %self.config.name, "building controller");
        self.status = ControllerStatus::Building;
        let inv = self.handler(&self.config.build_handler);
        run_handler(self.transport.as_ref(), "build", &inv).await?;
        self.status = ControllerStatus::Built;
        Ok(())
    }

    pub async fn cleanup(&mut self) -> TestResult<()> {
        info!(controller = %self.config.name, "cleaning controller");
        self.status = ControllerStatus::Cleaning;
        let inv = self.handler(&self.config.clean_handler);
        run_handler(self.transport.as_ref(), "clean", &inv).await?;
        self.status = ControllerStatus::Cleaned;
        Ok(())
    }

    /// Fail with `PortConflict` if anything listens on the controller port.
    pub async fn check_port_free(&self) -> TestResult<()> {
        match port::port_owner(self.transport.as_ref(), self.config.port).await? {
            PortOwner::Free => Ok(()),
            owner => {
                debug!(port = self.config.port, ?owner, "controller port taken");
                Err(TestError::PortConflict {
                    port: self.config.port,
                })
            }
        }
    }

    /// Start the controller and wait until it listens and reports ready.
    ///
    /// `deadline` bounds each of the two waits. Returns the controller PID.
    pub async fn start(&mut self, deadline: Duration) -> TestResult<u32> {
        if self.is_running().await? {
            let pid = match self.pid {
                Some(pid) => pid,
                None => self.wait_for_listener(deadline).await?,
            };
            debug!(pid, "controller already running");
            self.pid = Some(pid);
            self.status = ControllerStatus::Started;
            return Ok(pid);
        }

        self.status = ControllerStatus::Starting;
        self.check_port_free().await?;

        let mut inv = self.handler(&self.config.start_handler);
        if !self.config.jvm_opts.is_empty() {
            inv = inv.env("JAVA_OPTS", self.config.jvm_opts.join(" "));
        }
        let inv = inv.pinned(self.config.cpus.as_deref());
        info!(controller = %self.config.name, command = %inv.display(), "starting controller");
        run_handler(self.transport.as_ref(), "start", &inv).await?;

        let pid = self.wait_for_listener(deadline).await?;
        self.pid = Some(pid);
        debug!(pid, port = self.config.port, "controller listening");
        self.wait_until_ready(deadline).await?;

        self.status = ControllerStatus::Started;
        info!(pid, port = self.config.port, "controller started");
        Ok(pid)
    }

    /// Stop the controller and wait, without bound, for its process to exit.
    pub async fn stop(&mut self) -> TestResult<()> {
        if !self.is_running().await? {
            self.pid = None;
            self.status = ControllerStatus::Stopped;
            return Ok(());
        }

        self.status = ControllerStatus::Stopping;
        info!(controller = %self.config.name, pid = ?self.pid, "stopping controller");
        let inv = self.handler(&self.config.stop_handler);
        run_handler(self.transport.as_ref(), "stop", &inv).await?;

        let mut tick = self.ticker();
        loop {
            tick.tick().await;
            let alive = match self.pid {
                Some(pid) => port::is_process_running(self.transport.as_ref(), pid).await?,
                None => self.is_running().await?,
            };
            if !alive {
                break;
            }
        }

        self.pid = None;
        self.status = ControllerStatus::Stopped;
        info!("controller stopped");
        Ok(())
    }

    pub async fn restart(&mut self, deadline: Duration) -> TestResult<u32> {
        self.status = ControllerStatus::Restarting;
        self.stop().await?;
        let pid = self.start(deadline).await?;
        self.status = ControllerStatus::Restarted;
        Ok(pid)
    }

    /// Push a new statistics collection period. No read-back.
    pub async fn change_stats_period(&self, period_ms: u64) -> TestResult<()> {
        info!(period_ms, "changing controller statistics period");
        let inv = self
            .handler(&self.config.statistics_handler)
            .arg(period_ms.to_string());
        run_handler(self.transport.as_ref(), "statistics", &inv).await?;
        Ok(())
    }

    /// One start/stop cycle so the controller writes its initial files.
    pub async fn generate_initial_state(&mut self, deadline: Duration) -> TestResult<()> {
        info!("generating initial controller state");
        self.start(deadline).await?;
        self.stop().await
    }

    fn ticker(&self) -> tokio::time::Interval {
        let mut tick = interval(self.config.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick
    }

    async fn wait_for_listener(&self, deadline: Duration) -> TestResult<u32> {
        let began = Instant::now();
        let mut tick = self.ticker();
        loop {
            tick.tick().await;
            match port::port_owner(self.transport.as_ref(), self.config.port).await? {
                PortOwner::Owned(pid) => return Ok(pid),
                PortOwner::Foreign => {
                    return Err(TestError::PortConflict {
                        port: self.config.port,
                    })
                }
                PortOwner::Free => {}
            }
            if began.elapsed() >= deadline {
                return Err(TestError::StartTimeout {
                    port: self.config.port,
                    waited_secs: deadline.as_secs(),
                });
            }
        }
    }

    async fn wait_until_ready(&self, deadline: Duration) -> TestResult<()> {
        let began = Instant::now();
        let mut tick = self.ticker();
        loop {
            tick.tick().await;
            if self.is_running().await? {
                return Ok(());
            }
            if began.elapsed() >= deadline {
                return Err(TestError::ReadyTimeout {
                    waited_secs: deadline.as_secs(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedController;

    fn config() -> ControllerConfig {
        ControllerConfig {
            base_dir: PathBuf::from("/opt/odl"),
            poll_interval_ms: 5,
            jvm_opts: vec!["-Xmx4G".into(), "-XX:+UseG1GC".into()],
            ..ControllerConfig::default()
        }
    }

    const DEADLINE: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_start_then_start_again_is_noop() {
        let fake = Arc::new(ScriptedController::new());
        let mut ctl = Controller::new(config(), fake.clone());

        let pid = ctl.start(DEADLINE).await.unwrap();
        assert_eq!(pid, 4242);
        assert_eq!(ctl.status(), ControllerStatus::Started);

        let again = ctl.start(DEADLINE).await.unwrap();
        assert_eq!(again, pid);
        assert_eq!(fake.state().start_calls, 1);
    }

    #[tokio::test]
    async fn test_start_passes_jvm_opts_to_start_handler_only() {
        let fake = Arc::new(ScriptedController::new());
        let mut ctl = Controller::new(
            ControllerConfig {
                cpus: Some("0-3".into()),
                ..config()
            },
            fake.clone(),
        );
        ctl.start(DEADLINE).await.unwrap();

        let state = fake.state();
        let start = state
            .invocations
            .iter()
            .find(|inv| inv.args.iter().any(|a| a.ends_with("start_handler.sh")))
            .unwrap();
        assert_eq!(start.program, "taskset");
        assert_eq!(start.args[..2], ["-c".to_string(), "0-3".to_string()]);
        assert_eq!(
            start.env,
            vec![("JAVA_OPTS".to_string(), "-Xmx4G -XX:+UseG1GC".to_string())]
        );
        assert!(state
            .invocations
            .iter()
            .filter(|inv| inv.program != "taskset")
            .all(|inv| inv.env.is_empty()));
    }

    #[tokio::test]
    async fn test_already_running_discovers_pid_from_port() {
        let fake = Arc::new(ScriptedController::running(777));
        let mut ctl = Controller::new(config(), fake.clone());
        assert_eq!(ctl.start(DEADLINE).await.unwrap(), 777);
        assert_eq!(fake.state().start_calls, 0);
    }

    #[tokio::test]
    async fn test_stop_twice_second_is_noop() {
        let fake = Arc::new(ScriptedController::new());
        let mut ctl = Controller::new(config(), fake.clone());
        ctl.start(DEADLINE).await.unwrap();

        ctl.stop().await.unwrap();
        assert_eq!(ctl.status(), ControllerStatus::Stopped);
        assert_eq!(ctl.pid(), None);
        ctl.stop().await.unwrap();
        assert_eq!(fake.state().stop_calls, 1);
    }

    #[tokio::test]
    async fn test_foreign_listener_is_port_conflict() {
        let fake = Arc::new(ScriptedController::new());
        fake.state().foreign_listener = true;
        let mut ctl = Controller::new(config(), fake.clone());

        let err = ctl.start(DEADLINE).await.unwrap_err();
        assert!(matches!(err, TestError::PortConflict { port: 6653 }));
        assert_eq!(fake.state().start_calls, 0);
    }

    #[tokio::test]
    async fn test_never_listening_is_start_timeout() {
        let fake = Arc::new(ScriptedController::new());
        fake.state().never_listen = true;
        let mut ctl = Controller::new(config(), fake.clone());

        let err = ctl.start(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, TestError::StartTimeout { port: 6653, .. }));
    }

    #[tokio::test]
    async fn test_never_ready_is_ready_timeout() {
        let fake = Arc::new(ScriptedController::new());
        fake.state().never_ready = true;
        let mut ctl = Controller::new(config(), fake.clone());

        let err = ctl.start(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, TestError::ReadyTimeout { .. }));
    }

    #[tokio::test]
    async fn test_failing_start_handler() {
        let fake = Arc::new(ScriptedController::new());
        fake.state().fail_start = true;
        let mut ctl = Controller::new(config(), fake.clone());

        let err = ctl.start(DEADLINE).await.unwrap_err();
        assert!(matches!(err, TestError::HandlerFailed { ref handler, .. } if handler == "start"));
    }

    #[tokio::test]
    async fn test_restart_changes_pid() {
        let fake = Arc::new(ScriptedController::new());
        let mut ctl = Controller::new(config(), fake.clone());
        let first = ctl.start(DEADLINE).await.unwrap();
        let second = ctl.restart(DEADLINE).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(ctl.status(), ControllerStatus::Restarted);
    }

    #[tokio::test]
    async fn test_lifecycle_handlers_and_stats_period() {
        let fake = Arc::new(ScriptedController::new());
        let mut ctl = Controller::new(config(), fake.clone());
        ctl.build().await.unwrap();
        assert_eq!(ctl.status(), ControllerStatus::Built);
        ctl.generate_initial_state(DEADLINE).await.unwrap();
        ctl.change_stats_period(5000).await.unwrap();
        ctl.cleanup().await.unwrap();
        assert_eq!(ctl.status(), ControllerStatus::Cleaned);

        let state = fake.state();
        assert_eq!((state.build_calls, state.clean_calls), (1, 1));
        assert_eq!((state.start_calls, state.stop_calls), (1, 1));
        assert_eq!(state.stats_periods, vec!["5000".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_status_handler_fails() {
        let ctl = Controller::new(
            ControllerConfig {
                status_handler: "bogus.sh".into(),
                ..config()
            },
            Arc::new(ScriptedController::new()),
        );
        assert!(matches!(
            ctl.is_running().await,
            Err(TestError::HandlerFailed { code: Some(127), .. })
        ));
    }

    #[test]
    fn test_status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&ControllerStatus::Restarted).unwrap(),
            "\"RESTARTED\""
        );
        assert_eq!(ControllerStatus::Cleaned.to_string(), "CLEANED");
    }
}
