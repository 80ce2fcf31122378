//! Per-endpoint supervision task: start, health checks, restarts, shutdown.

use std::time::Duration;

use soffice_process::{InstanceId, InstanceState, InstanceStatus, Pid};
use tokio::{sync::watch, task::JoinHandle};
use tracing::Instrument;

use crate::config::{AgentConfig, RestartConfig, compute_backoff_ms};
use crate::error::format_error_chain;
use crate::office_process::OfficeProcess;

#[derive(Clone, Copy, Debug)]
pub struct RunnerSettings {
    pub health_interval: Duration,
    pub terminate_interval: Duration,
    pub terminate_timeout: Duration,
    pub restart: RestartConfig,
}

impl From<&AgentConfig> for RunnerSettings {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            health_interval: cfg.health_interval,
            terminate_interval: cfg.retry_interval,
            terminate_timeout: cfg.retry_timeout,
            restart: cfg.restart,
        }
    }
}

/// Owner-side view of a running supervision task.
#[derive(Debug)]
pub struct RunnerHandle {
    id: InstanceId,
    status: watch::Receiver<InstanceStatus>,
    join: JoinHandle<InstanceStatus>,
}

impl RunnerHandle {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn status(&self) -> InstanceStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstanceStatus> {
        self.status.clone()
    }

    /// Waits for the task to finish; it only does so once shutdown is signalled.
    pub async fn join(self) -> InstanceStatus {
        let last = self.status.borrow().clone();
        match self.join.await {
            Ok(status) => status,
            Err(e) => InstanceStatus {
                state: InstanceState::Failed,
                message: Some(format!("runner task failed: {e}")),
                ..last
            },
        }
    }
}

enum Event {
    Shutdown,
    Exited(Option<i32>),
}

struct Runner {
    process: OfficeProcess,
    settings: RunnerSettings,
    status: watch::Sender<InstanceStatus>,
    shutdown: watch::Receiver<bool>,
    restarts: u32,
}

/// Spawns a task that keeps `process` alive until `shutdown` turns true.
pub fn spawn(
    process: OfficeProcess,
    settings: RunnerSettings,
    shutdown: watch::Receiver<bool>,
) -> RunnerHandle {
    let id = InstanceId::new();
    let initial = InstanceStatus {
        id: id.clone(),
        accept: process.uno_url().accept_string().to_string(),
        state: InstanceState::Starting,
        pid: Pid::Unknown,
        exit_code: None,
        restarts: 0,
        message: None,
    };
    let (tx, rx) = watch::channel(initial);
    let span = tracing::info_span!("office", id = %id, accept = %process.uno_url());
    let runner = Runner {
        process,
        settings,
        status: tx,
        shutdown,
        restarts: 0,
    };
    let join = tokio::spawn(runner.run().instrument(span));
    RunnerHandle {
        id,
        status: rx,
        join,
    }
}

impl Runner {
    async fn run(mut self) -> InstanceStatus {
        let mut restart = false;
        loop {
            self.publish(InstanceState::Starting, None, None);
            let started = self.process.start(restart).await;
            // Only a launch that got past start may be resumed on its profile dir.
            restart = started.is_ok();
            let exit_code = match started {
                Ok(()) => {
                    self.publish(InstanceState::Running, None, None);
                    match self.monitor().await {
                        Event::Shutdown => return self.stop().await,
                        Event::Exited(code) => {
                            tracing::warn!(exit_code = ?code, "office process exited");
                            code
                        }
                    }
                }
                Err(e) => {
                    let msg = format_error_chain(&e);
                    tracing::error!(error = %msg, "failed to start office process");
                    // A timed-out pid lookup leaves the process running.
                    if self.process.is_running() {
                        self.terminate().await;
                    }
                    self.publish(InstanceState::Failed, None, Some(msg));
                    None
                }
            };

            let attempt = self.restarts.saturating_add(1);
            if !self.settings.restart.should_restart(exit_code, attempt) {
                let state = if exit_code == Some(0) {
                    InstanceState::Exited
                } else {
                    InstanceState::Failed
                };
                let message = self
                    .status
                    .borrow()
                    .message
                    .clone()
                    .or_else(|| exit_code.map(|c| format!("exited with code {c}")));
                self.publish(state, exit_code, message);
                let _ = self.shutdown.wait_for(|stop| *stop).await;
                return self.stop().await;
            }

            self.restarts = attempt;
            let delay_ms = compute_backoff_ms(self.settings.restart, attempt);
            let message = format!(
                "restarting in {delay_ms}ms (attempt {attempt}/{})",
                self.settings.restart.max_retries
            );
            tracing::info!(delay_ms, attempt, "scheduling restart");
            self.publish(InstanceState::Failed, exit_code, Some(message));

            let stopped = tokio::select! {
                _ = self.shutdown.wait_for(|stop| *stop) => true,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => false,
            };
            if stopped {
                return self.stop().await;
            }
        }
    }

    async fn monitor(&mut self) -> Event {
        let process = &mut self.process;
        let health_interval = self.settings.health_interval;
        tokio::select! {
            _ = self.shutdown.wait_for(|stop| *stop) => Event::Shutdown,
            code = async {
                loop {
                    tokio::time::sleep(health_interval).await;
                    if !process.is_running() {
                        return process.exit_code();
                    }
                }
            } => Event::Exited(code),
        }
    }

    async fn terminate(&mut self) -> Option<i32> {
        let s = self.settings;
        match self
            .process
            .forcibly_terminate(s.terminate_interval, s.terminate_timeout)
            .await
        {
            Ok(code) => Some(code),
            Err(e) => {
                tracing::error!(error = %format_error_chain(&e), "failed to terminate office process");
                None
            }
        }
    }

    async fn stop(mut self) -> InstanceStatus {
        let previous = self.status.borrow().state;
        self.publish(InstanceState::Stopping, None, None);
        let exit_code = if self.process.is_running() {
            self.terminate().await
        } else {
            self.process.exit_code()
        };
        self.process.delete_profile_dir();

        let state = match previous {
            InstanceState::Failed => InstanceState::Failed,
            _ => InstanceState::Exited,
        };
        self.publish(state, exit_code, Some("stopped".to_string()));
        tracing::info!(exit_code = ?exit_code, "office process stopped");
        self.status.borrow().clone()
    }

    fn publish(&self, state: InstanceState, exit_code: Option<i32>, message: Option<String>) {
        let pid = self.process.pid();
        let restarts = self.restarts;
        self.status.send_modify(|s| {
            s.state = state;
            s.pid = pid;
            s.exit_code = exit_code;
            s.restarts = restarts;
            s.message = message;
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::RestartPolicy;
    use crate::office_paths::Platform;
    use crate::testing::{SLEEPER, ScriptedLookup, fixture, office};
    use soffice_process::UnoUrl;

    fn settings(policy: RestartPolicy, max_retries: u32) -> RunnerSettings {
        RunnerSettings {
            health_interval: Duration::from_millis(20),
            terminate_interval: Duration::from_millis(10),
            terminate_timeout: Duration::from_secs(10),
            restart: RestartConfig {
                policy,
                max_retries,
                backoff_ms: 50,
                backoff_max_ms: 100,
            },
        }
    }

    async fn wait_until(
        rx: &mut watch::Receiver<InstanceStatus>,
        f: impl FnMut(&InstanceStatus) -> bool,
    ) -> InstanceStatus {
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(f))
            .await
            .expect("status never reached")
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn runs_until_shutdown_then_kills_and_cleans_up() {
        let fx = fixture(SLEEPER);
        let template = fx.work.join("template");
        std::fs::create_dir_all(template.join("user")).unwrap();
        let pm = ScriptedLookup::new(&[], Pid::Unknown);
        let process = OfficeProcess::new(
            &fx.home,
            UnoUrl::socket(2030),
            vec!["/bin/sh".to_string()],
            Some(template),
            &fx.work,
            pm,
        )
        .with_platform(Platform::Linux);
        let profile = process.instance_profile_dir().to_path_buf();
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn(process, settings(RestartPolicy::OnFailure, 3), stop_rx);
        let mut rx = handle.subscribe();
        let running = wait_until(&mut rx, |s| s.state == InstanceState::Running).await;
        assert_eq!(running.accept, "socket,host=127.0.0.1,port=2030");
        assert_eq!(&running.id, handle.id());
        assert!(profile.join("user").is_dir());

        stop_tx.send(true).unwrap();
        let last = handle.join().await;
        assert_eq!(last.state, InstanceState::Exited);
        assert_eq!(last.exit_code, Some(128 + libc::SIGKILL));
        assert_eq!(last.restarts, 0);
        assert!(!profile.exists());
    }

    #[tokio::test]
    async fn failing_process_is_restarted_until_budget_runs_out() {
        let fx = fixture("exit 1\n");
        let pm = ScriptedLookup::new(&[], Pid::Unknown);
        let process = office(&fx, UnoUrl::socket(2031), pm.clone());
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn(process, settings(RestartPolicy::OnFailure, 2), stop_rx);
        let mut rx = handle.subscribe();
        let gave_up = wait_until(&mut rx, |s| {
            s.state == InstanceState::Failed && s.restarts == 2 && s.exit_code.is_some()
                && !s.message.as_deref().unwrap_or("").starts_with("restarting")
        })
        .await;
        assert_eq!(gave_up.exit_code, Some(1));
        assert_eq!(gave_up.message.as_deref(), Some("exited with code 1"));
        // One precondition lookup and one pid poll per start.
        assert_eq!(pm.commands().len(), 6);

        stop_tx.send(true).unwrap();
        let last = handle.join().await;
        assert_eq!(last.state, InstanceState::Failed);
        assert_eq!(last.restarts, 2);
    }

    #[tokio::test]
    async fn clean_exit_is_not_restarted_on_failure_policy() {
        let fx = fixture("exit 0\n");
        let pm = ScriptedLookup::new(&[], Pid::Unknown);
        let process = office(&fx, UnoUrl::socket(2032), pm);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn(process, settings(RestartPolicy::OnFailure, 5), stop_rx);
        let mut rx = handle.subscribe();
        let done = wait_until(&mut rx, |s| s.state == InstanceState::Exited).await;
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.restarts, 0);

        stop_tx.send(true).unwrap();
        assert_eq!(handle.join().await.state, InstanceState::Exited);
    }

    #[tokio::test]
    async fn start_failure_is_reported_without_restart_when_policy_is_off() {
        let fx = fixture(SLEEPER);
        let pm = ScriptedLookup::new(&[], Pid::Running(4242));
        let process = office(&fx, UnoUrl::socket(2033), pm.clone());
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn(process, settings(RestartPolicy::Off, 5), stop_rx);
        let mut rx = handle.subscribe();
        let failed = wait_until(&mut rx, |s| s.state == InstanceState::Failed).await;
        assert!(
            failed.message.as_deref().unwrap_or("").contains("already running"),
            "{failed:?}"
        );
        assert!(pm.kills.lock().unwrap().is_empty());

        stop_tx.send(true).unwrap();
        let last = handle.join().await;
        assert_eq!(last.state, InstanceState::Failed);
        assert_eq!(last.exit_code, None);
    }

    #[tokio::test]
    async fn retry_after_failed_start_prepares_a_fresh_profile() {
        let fx = fixture(SLEEPER);
        let template = fx.work.join("template");
        std::fs::create_dir_all(template.join("user")).unwrap();
        // The first start sees the endpoint taken and never touches the profile dir.
        let pm = ScriptedLookup::new(&[Pid::Running(4242)], Pid::Unknown);
        let process = OfficeProcess::new(
            &fx.home,
            UnoUrl::socket(2035),
            vec!["/bin/sh".to_string()],
            Some(template),
            &fx.work,
            pm,
        )
        .with_platform(Platform::Linux);
        let profile = process.instance_profile_dir().to_path_buf();
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn(process, settings(RestartPolicy::OnFailure, 3), stop_rx);
        let mut rx = handle.subscribe();
        let running = wait_until(&mut rx, |s| s.state == InstanceState::Running).await;
        assert_eq!(running.restarts, 1);
        assert!(profile.join("user").is_dir());

        stop_tx.send(true).unwrap();
        let last = handle.join().await;
        assert_eq!(last.state, InstanceState::Exited);
        assert!(!profile.exists());
    }

    #[tokio::test]
    async fn shutdown_during_backoff_stops_promptly() {
        let fx = fixture("exit 2\n");
        let pm = ScriptedLookup::new(&[], Pid::Unknown);
        let process = office(&fx, UnoUrl::socket(2034), pm);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut cfg = settings(RestartPolicy::Always, 5);
        cfg.restart.backoff_ms = 60_000;
        cfg.restart.backoff_max_ms = 60_000;

        let handle = spawn(process, cfg, stop_rx);
        let mut rx = handle.subscribe();
        wait_until(&mut rx, |s| s.restarts == 1).await;

        stop_tx.send(true).unwrap();
        let last = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap();
        assert_eq!(last.state, InstanceState::Failed);
        assert_eq!(last.message.as_deref(), Some("stopped"));
    }
}
