//! Lifecycle management for the local sidecar process.
//!
//! States run `Stopped → Starting → HealthCheck → ContractCheck → Running`.
//! An unexpected exit while `Running` schedules one restart after a short
//! delay (`Restarting`) until the automatic-restart budget is spent, after
//! which the supervisor parks in `Failed`. [`Supervisor::stop`] returns to
//! `Stopped` from any state.
//!
//! Every spawn gets a new generation number. Exit and stderr notifications
//! carry the generation they belong to, so a process that was replaced or
//! stopped can never trigger a restart.

mod launch;
mod preflight;

#[cfg(test)]
mod tests;

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use tutorhost_domain::{
    ContractRequirements, FailureStage, LaunchInfo, PreflightPhase, RuntimeError,
    RuntimeLaunchConfig, SidecarState, StartOutcome,
};
use tutorhost_store::IndexStore;

use crate::config::{DataPaths, SidecarConfig};
use crate::process::StderrTail;
use crate::single_flight::SingleFlight;
use launch::{plan_launch, LaunchInputs};
use preflight::{run_preflight, PreflightTiming};

pub use preflight::{HttpProbe, SidecarProbe};

const KILL_GRACE: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 512;

/// Notifications for observers of the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    State { state: SidecarState },
    Stderr { chunk: String },
    Exited { code: Option<i32>, expected: bool },
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub state: SidecarState,
    pub pid: Option<u32>,
    pub restart_attempts: u32,
    pub stderr_tail: String,
    pub launch_info: Option<LaunchInfo>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartKind {
    User,
    AutoRestart,
}

struct ProcessHandle {
    pid: Option<u32>,
    generation: u64,
    kill: Option<oneshot::Sender<()>>,
    done: watch::Receiver<bool>,
}

impl ProcessHandle {
    async fn terminate(mut self, grace: Duration) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if timeout(grace, wait_exit(&mut self.done)).await.is_err() {
            warn!(pid = ?self.pid, "sidecar did not exit after kill");
        }
    }
}

async fn wait_exit(done: &mut watch::Receiver<bool>) {
    while !*done.borrow_and_update() {
        if done.changed().await.is_err() {
            break;
        }
    }
}

struct SupervisorState {
    state: SidecarState,
    process: Option<ProcessHandle>,
    generation: u64,
    intentional_stop: bool,
    restart_attempts: u32,
    stderr_tail: StderrTail,
    launch_info: Option<LaunchInfo>,
    last_config: Option<RuntimeLaunchConfig>,
    last_error: Option<String>,
    last_exit_code: Option<i32>,
    restart_timer: Option<JoinHandle<()>>,
}

pub struct Supervisor {
    me: Weak<Supervisor>,
    settings: SidecarConfig,
    paths: DataPaths,
    code_bundle: (String, String),
    index: Arc<IndexStore>,
    probe: Arc<dyn SidecarProbe>,
    requirements: ContractRequirements,
    state: Mutex<SupervisorState>,
    inflight: SingleFlight<StartOutcome>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    /// `code_bundle` is the `(type, scope)` of the installed sidecar code.
    pub fn new(
        settings: SidecarConfig,
        paths: DataPaths,
        code_bundle: (String, String),
        index: Arc<IndexStore>,
        probe: Arc<dyn SidecarProbe>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tail_limit = settings.stderr_tail_chars;
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings,
            paths,
            code_bundle,
            index,
            probe,
            requirements: ContractRequirements::default(),
            state: Mutex::new(SupervisorState {
                state: SidecarState::Stopped,
                process: None,
                generation: 0,
                intentional_stop: false,
                restart_attempts: 0,
                stderr_tail: StderrTail::new(tail_limit),
                launch_info: None,
                last_config: None,
                last_error: None,
                last_exit_code: None,
                restart_timer: None,
            }),
            inflight: SingleFlight::new(),
            events,
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> SupervisorStatus {
        let st = self.lock();
        SupervisorStatus {
            state: st.state,
            pid: st.process.as_ref().and_then(|process| process.pid),
            restart_attempts: st.restart_attempts,
            stderr_tail: st.stderr_tail.as_str().to_string(),
            launch_info: st.launch_info.clone(),
            last_error: st.last_error.clone(),
        }
    }

    /// Start the sidecar, or confirm the one already running.
    ///
    /// Concurrent calls join the same attempt. Never fails; problems are
    /// reported through [`StartOutcome::failure_stage`].
    pub async fn start(&self, config: RuntimeLaunchConfig) -> StartOutcome {
        self.begin(config, StartKind::User).await
    }

    /// Kill the sidecar and cancel any pending restart.
    pub async fn stop(&self) {
        let (handle, timer) = {
            let mut st = self.lock();
            st.intentional_stop = true;
            st.generation += 1;
            st.restart_attempts = 0;
            self.set_state(&mut st, SidecarState::Stopped);
            (st.process.take(), st.restart_timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(handle) = handle {
            info!(pid = ?handle.pid, "stopping sidecar");
            handle.terminate(KILL_GRACE).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, st: &mut SupervisorState, state: SidecarState) {
        if st.state != state {
            debug!(from = %st.state.as_str(), to = %state.as_str(), "sidecar state");
            st.state = state;
            self.emit(SupervisorEvent::State { state });
        }
    }

    async fn begin(&self, config: RuntimeLaunchConfig, kind: StartKind) -> StartOutcome {
        let Some(me) = self.me.upgrade() else {
            return StartOutcome::failed(FailureStage::Spawn, "supervisor is shutting down");
        };
        self.inflight
            .run(async move { me.start_once(config, kind).await }, || {
                StartOutcome::failed(FailureStage::Spawn, "start task ended without a result")
            })
            .await
    }

    fn timing(&self, budget_ms: u64) -> PreflightTiming {
        PreflightTiming {
            budget: Duration::from_millis(budget_ms),
            poll_interval: Duration::from_millis(self.settings.poll_interval_ms.max(1)),
        }
    }

    async fn start_once(&self, config: RuntimeLaunchConfig, kind: StartKind) -> StartOutcome {
        let existing = {
            let st = self.lock();
            if kind == StartKind::AutoRestart
                && (st.state != SidecarState::Restarting || st.intentional_stop)
            {
                return StartOutcome::failed(FailureStage::Spawn, "restart cancelled");
            }
            st.process
                .as_ref()
                .map(|process| (process.pid, process.generation))
        };

        if let Some((pid, generation)) = existing {
            let base_url = self.settings.base_url();
            let fast = self.timing(self.settings.fast_health_timeout_ms);
            match run_preflight(&*self.probe, &base_url, &self.requirements, fast, &|_| {}).await {
                Ok(()) => {
                    let mut st = self.lock();
                    if st.generation == generation && st.process.is_some() {
                        if kind == StartKind::User {
                            st.restart_attempts = 0;
                        }
                        st.last_config = Some(config);
                        self.set_state(&mut st, SidecarState::Running);
                        info!(?pid, "sidecar already running");
                        return StartOutcome::started(pid, true);
                    }
                }
                Err((phase, err)) => {
                    warn!(%phase, %err, "running sidecar failed the re-check; replacing it");
                }
            }
        }

        let (generation, stale) = {
            let mut st = self.lock();
            if let Some(timer) = st.restart_timer.take() {
                timer.abort();
            }
            st.intentional_stop = false;
            st.generation += 1;
            st.stderr_tail.clear();
            st.last_error = None;
            st.last_exit_code = None;
            st.last_config = Some(config.clone());
            self.set_state(&mut st, SidecarState::Starting);
            (st.generation, st.process.take())
        };
        if let Some(stale) = stale {
            info!(pid = ?stale.pid, "killing stale sidecar");
            stale.terminate(KILL_GRACE).await;
        }

        let index = self.index.get();
        let plan = plan_launch(&LaunchInputs {
            settings: &self.settings,
            paths: &self.paths,
            index: &index,
            code_bundle: (&self.code_bundle.0, &self.code_bundle.1),
            config: &config,
        });
        let plan = match plan {
            Ok(plan) => plan,
            Err(err) => {
                let outcome = StartOutcome::failed(FailureStage::ResolveRuntime, err.to_string());
                return self.finish_failed(generation, kind, outcome);
            }
        };
        self.lock().launch_info = Some(plan.info.clone());

        info!(
            executable = %plan.info.executable.display(),
            source = %plan.info.executable_source,
            cwd = %plan.info.working_dir.display(),
            "spawning sidecar"
        );
        let mut command = Command::new(&plan.info.executable);
        command
            .arg(&plan.info.entrypoint)
            .current_dir(&plan.info.working_dir)
            .envs(plan.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let err = RuntimeError::ProcessSpawn(format!(
                    "failed to start {}: {err}",
                    plan.info.executable.display()
                ));
                let outcome = StartOutcome::failed(FailureStage::Spawn, err.to_string());
                return self.finish_failed(generation, kind, outcome);
            }
        };
        let pid = child.id();
        let (handle, kill, done) = self.watch_child(&mut child, generation);
        tokio::spawn(monitor(self.me.clone(), generation, child, kill, done));
        let mut exited = handle.done.clone();
        let orphaned = {
            let mut st = self.lock();
            if st.generation == generation {
                st.process = Some(handle);
                None
            } else {
                Some(handle)
            }
        };
        if let Some(handle) = orphaned {
            handle.terminate(KILL_GRACE).await;
            return StartOutcome::failed(FailureStage::RuntimeStart, "sidecar stopped during startup");
        }

        let on_phase = |phase: PreflightPhase| {
            let mut st = self.lock();
            if st.generation == generation {
                let state = match phase {
                    PreflightPhase::Health => SidecarState::HealthCheck,
                    PreflightPhase::Contract => SidecarState::ContractCheck,
                };
                self.set_state(&mut st, state);
            }
        };
        let timing = self.timing(self.settings.health_timeout_ms);
        let checked = tokio::select! {
            result = run_preflight(&*self.probe, &plan.info.base_url, &self.requirements, timing, &on_phase) => result,
            () = wait_exit(&mut exited) => {
                let st = self.lock();
                let phase = if st.state == SidecarState::ContractCheck {
                    PreflightPhase::Contract
                } else {
                    PreflightPhase::Health
                };
                let code = st
                    .last_exit_code
                    .map_or_else(|| "a signal".to_string(), |code| format!("code {code}"));
                Err((phase, RuntimeError::HealthCheck(format!("sidecar exited during startup with {code}"))))
            }
        };

        match checked {
            Ok(()) => {
                {
                    let mut st = self.lock();
                    let alive = st
                        .process
                        .as_ref()
                        .is_some_and(|process| process.generation == generation);
                    if st.generation == generation && alive {
                        if kind == StartKind::User {
                            st.restart_attempts = 0;
                        }
                        self.set_state(&mut st, SidecarState::Running);
                        info!(?pid, "sidecar running");
                        return StartOutcome::started(pid, false);
                    }
                }
                let outcome = StartOutcome::failed(
                    FailureStage::RuntimeStart,
                    "sidecar went away before it was marked running",
                );
                self.finish_failed(generation, kind, outcome)
            }
            Err((phase, err)) => {
                warn!(%phase, %err, "sidecar preflight failed");
                let handle = {
                    let mut st = self.lock();
                    if st.generation == generation {
                        st.process.take()
                    } else {
                        None
                    }
                };
                if let Some(handle) = handle {
                    handle.terminate(KILL_GRACE).await;
                }
                let tail = self.lock().stderr_tail.as_str().to_string();
                let mut outcome = StartOutcome::failed(FailureStage::RuntimeStart, err.to_string())
                    .with_preflight_phase(phase);
                if !tail.is_empty() {
                    outcome = outcome.with_stderr_tail(tail);
                }
                self.finish_failed(generation, kind, outcome)
            }
        }
    }

    /// Record a failed start. A failed automatic restart parks in `Failed`.
    fn finish_failed(&self, generation: u64, kind: StartKind, outcome: StartOutcome) -> StartOutcome {
        let mut st = self.lock();
        if st.generation == generation {
            st.last_error.clone_from(&outcome.reason);
            let state = match kind {
                StartKind::User => SidecarState::Stopped,
                StartKind::AutoRestart => SidecarState::Failed,
            };
            self.set_state(&mut st, state);
        }
        warn!(stage = ?outcome.failure_stage, reason = ?outcome.reason, "sidecar start failed");
        outcome
    }

    /// Attach stderr/stdout pumps and build the control handle for `child`.
    fn watch_child(
        &self,
        child: &mut Child,
        generation: u64,
    ) -> (ProcessHandle, oneshot::Receiver<()>, watch::Sender<bool>) {
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stderr(self.me.clone(), generation, stderr));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_stdout(stdout));
        }
        let (kill_tx, kill_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        let handle = ProcessHandle {
            pid: child.id(),
            generation,
            kill: Some(kill_tx),
            done: done_rx,
        };
        (handle, kill_rx, done_tx)
    }

    fn record_stderr(&self, generation: u64, chunk: String) {
        let mut st = self.lock();
        if st.generation != generation {
            return;
        }
        st.stderr_tail.push(&chunk);
        drop(st);
        self.emit(SupervisorEvent::Stderr { chunk });
    }

    fn on_exit(&self, generation: u64, code: Option<i32>) {
        let mut st = self.lock();
        let current = st.generation == generation
            && st
                .process
                .as_ref()
                .is_some_and(|process| process.generation == generation);
        if st.generation == generation {
            st.last_exit_code = code;
        }
        if !current {
            debug!(?code, "sidecar exited after being released");
            self.emit(SupervisorEvent::Exited {
                code,
                expected: true,
            });
            return;
        }
        st.process = None;
        self.emit(SupervisorEvent::Exited {
            code,
            expected: false,
        });
        if st.state != SidecarState::Running {
            // Still starting up; the start path reports the failure.
            return;
        }

        let max = self.settings.max_auto_restarts;
        if st.restart_attempts >= max {
            let message =
                format!("sidecar exited with {code:?} after {max} automatic restarts; restart it manually");
            warn!(%message);
            st.last_error = Some(message);
            self.set_state(&mut st, SidecarState::Failed);
            return;
        }
        st.restart_attempts += 1;
        info!(?code, attempt = st.restart_attempts, "sidecar exited unexpectedly; scheduling restart");
        self.set_state(&mut st, SidecarState::Restarting);
        let weak = self.me.clone();
        let delay = Duration::from_millis(self.settings.restart_delay_ms);
        st.restart_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(supervisor) = weak.upgrade() {
                tokio::spawn(async move { supervisor.auto_restart(generation).await });
            }
        }));
    }

    async fn auto_restart(&self, generation: u64) {
        let config = {
            let st = self.lock();
            if st.generation != generation
                || st.state != SidecarState::Restarting
                || st.intentional_stop
            {
                return;
            }
            st.last_config.clone()
        };
        let Some(config) = config else {
            return;
        };
        let outcome = self.begin(config, StartKind::AutoRestart).await;
        if !outcome.started {
            warn!(reason = ?outcome.reason, "automatic restart failed");
        }
    }
}

async fn monitor(
    supervisor: Weak<Supervisor>,
    generation: u64,
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    done: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill => {
            if let Err(err) = child.start_kill() {
                debug!(%err, "sidecar already gone");
            }
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(%err, "failed to wait for sidecar");
            None
        }
    };
    if let Some(supervisor) = supervisor.upgrade() {
        supervisor.on_exit(generation, code);
    }
    let _ = done.send(true);
}

async fn pump_stderr(supervisor: Weak<Supervisor>, generation: u64, mut stderr: ChildStderr) {
    let mut buffer = vec![0_u8; 4096];
    loop {
        let read = match stderr.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        let chunk = String::from_utf8_lossy(&buffer[..read]).into_owned();
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        supervisor.record_stderr(generation, chunk);
    }
}

async fn pump_stdout(stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "tutorhost::sidecar", "{line}");
    }
}
