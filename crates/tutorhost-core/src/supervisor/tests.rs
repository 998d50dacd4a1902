#![cfg(unix)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};
use tutorhost_domain::{
    ContractRequirements, FailureStage, PreflightPhase, RuntimeError, RuntimeLaunchConfig,
    SidecarContract, SidecarState,
};
use tutorhost_store::IndexStore;

use super::{SidecarProbe, Supervisor, SupervisorEvent};
use crate::config::{DataPaths, SidecarConfig};

struct FakeProbe {
    healthy: AtomicBool,
    down_until: Mutex<Option<Instant>>,
    ready_file: Mutex<Option<PathBuf>>,
    contract: Mutex<SidecarContract>,
}

impl FakeProbe {
    fn healthy() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            down_until: Mutex::new(None),
            ready_file: Mutex::new(None),
            contract: Mutex::new(ContractRequirements::default().satisfying_contract()),
        }
    }

    fn go_down_for(&self, period: Duration) {
        *self.down_until.lock().unwrap() = Some(Instant::now() + period);
    }

    fn unhealthy() -> Self {
        let probe = Self::healthy();
        probe.healthy.store(false, Ordering::SeqCst);
        probe
    }

    fn missing_route(path: &str) -> Self {
        let probe = Self::healthy();
        probe
            .contract
            .lock()
            .unwrap()
            .routes
            .retain(|route| route.path != path);
        probe
    }
}

#[async_trait]
impl SidecarProbe for FakeProbe {
    async fn health(&self, _base_url: &str) -> Result<(), RuntimeError> {
        let down = self
            .down_until
            .lock()
            .unwrap()
            .is_some_and(|until| Instant::now() < until);
        let listening = self
            .ready_file
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |file| file.exists());
        if self.healthy.load(Ordering::SeqCst) && listening && !down {
            Ok(())
        } else {
            Err(RuntimeError::HealthCheck("connection refused".into()))
        }
    }

    async fn contract(&self, _base_url: &str) -> Result<SidecarContract, RuntimeError> {
        Ok(self.contract.lock().unwrap().clone())
    }
}

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
    log: PathBuf,
    probe: Arc<FakeProbe>,
    supervisor: Arc<Supervisor>,
}

impl Fixture {
    fn new(script: &str, probe: FakeProbe) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();
        let app = root.join("app");
        fs::create_dir_all(&app).unwrap();
        let log = root.join("spawns.log");
        fs::write(
            app.join("main.py"),
            format!("echo $$ >> '{}'\n{script}\n", log.display()),
        )
        .unwrap();
        let settings = SidecarConfig {
            working_dir: Some(app),
            health_timeout_ms: 3_000,
            fast_health_timeout_ms: 300,
            poll_interval_ms: 20,
            restart_delay_ms: 50,
            max_auto_restarts: 2,
            ..SidecarConfig::default()
        };
        let paths = DataPaths::new(&root);
        let index = Arc::new(IndexStore::new(&paths.index));
        *probe.ready_file.lock().unwrap() = Some(log.clone());
        let probe = Arc::new(probe);
        let supervisor = Supervisor::new(
            settings,
            paths,
            ("sidecar".to_string(), "default".to_string()),
            index,
            probe.clone(),
        );
        Self {
            _temp: temp,
            root,
            log,
            probe,
            supervisor,
        }
    }

    fn spawns(&self) -> usize {
        fs::read_to_string(&self.log)
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }

    async fn wait_for(&self, state: SidecarState, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if self.supervisor.status().state == state {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

fn launch() -> RuntimeLaunchConfig {
    RuntimeLaunchConfig {
        python_path: Some(PathBuf::from("/bin/sh")),
        llm_provider: "openai".into(),
        llm_api_key: "sk-test".into(),
        ..RuntimeLaunchConfig::default()
    }
}

fn alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

const LONG_RUNNING: &str = "exec sleep 30";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_reaches_running_and_stop_kills() {
    let fixture = Fixture::new(LONG_RUNNING, FakeProbe::healthy());
    let mut events = fixture.supervisor.subscribe();

    let outcome = fixture.supervisor.start(launch()).await;
    assert!(outcome.started, "{outcome:?}");
    assert!(!outcome.reused);
    let pid = outcome.pid.unwrap();
    assert!(alive(pid));

    let status = fixture.supervisor.status();
    assert_eq!(status.state, SidecarState::Running);
    assert_eq!(status.pid, Some(pid));
    let info = status.launch_info.unwrap();
    assert_eq!(info.executable_source, "launch config");
    assert_eq!(info.working_dir, fixture.root.join("app"));

    let mut seen = Vec::new();
    while let Ok(SupervisorEvent::State { state }) = events.try_recv() {
        seen.push(state);
    }
    assert_eq!(
        seen,
        vec![
            SidecarState::Starting,
            SidecarState::HealthCheck,
            SidecarState::ContractCheck,
            SidecarState::Running,
        ]
    );

    fixture.supervisor.stop().await;
    assert_eq!(fixture.supervisor.status().state, SidecarState::Stopped);
    assert_eq!(fixture.supervisor.status().pid, None);
    assert!(!alive(pid));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_starts_spawn_once() {
    let fixture = Fixture::new(LONG_RUNNING, FakeProbe::healthy());
    let (first, second) = tokio::join!(
        fixture.supervisor.start(launch()),
        fixture.supervisor.start(launch())
    );
    assert!(first.started && second.started);
    assert_eq!(first.pid, second.pid);
    assert_eq!(fixture.spawns(), 1);
    fixture.supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_start_still_reaches_running() {
    let fixture = Fixture::new(LONG_RUNNING, FakeProbe::healthy());
    let _ = tokio::time::timeout(Duration::from_millis(1), fixture.supervisor.start(launch())).await;

    assert!(
        fixture
            .wait_for(SidecarState::Running, Duration::from_secs(5))
            .await
    );
    assert_eq!(fixture.spawns(), 1);
    let again = fixture.supervisor.start(launch()).await;
    assert!(again.started && again.reused, "{again:?}");
    fixture.supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthy_process_is_reused() {
    let fixture = Fixture::new(LONG_RUNNING, FakeProbe::healthy());
    let first = fixture.supervisor.start(launch()).await;
    let second = fixture.supervisor.start(launch()).await;
    assert!(second.started);
    assert!(second.reused);
    assert_eq!(first.pid, second.pid);
    assert_eq!(fixture.spawns(), 1);
    fixture.supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn contract_mismatch_fails_and_kills_process() {
    let fixture = Fixture::new(
        LONG_RUNNING,
        FakeProbe::missing_route("/api/notebook/execute"),
    );
    let outcome = fixture.supervisor.start(launch()).await;
    assert!(!outcome.started);
    assert_eq!(outcome.failure_stage, Some(FailureStage::RuntimeStart));
    assert_eq!(outcome.preflight_phase, Some(PreflightPhase::Contract));
    assert!(outcome.reason.unwrap().contains("/api/notebook/execute"));

    let status = fixture.supervisor.status();
    assert_eq!(status.state, SidecarState::Stopped);
    assert_eq!(status.pid, None);
    let pid: u32 = fs::read_to_string(&fixture.log)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!alive(pid));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_failure_reports_stderr_tail() {
    let fixture = Fixture::new(
        "echo 'ModuleNotFoundError: fastapi' >&2\nexec sleep 30",
        FakeProbe::unhealthy(),
    );
    let outcome = fixture.supervisor.start(launch()).await;
    assert!(!outcome.started);
    assert_eq!(outcome.failure_stage, Some(FailureStage::RuntimeStart));
    assert_eq!(outcome.preflight_phase, Some(PreflightPhase::Health));
    let tail = outcome.stderr_tail.unwrap();
    assert!(tail.contains("ModuleNotFoundError"), "{tail}");
    assert!(fixture
        .supervisor
        .status()
        .stderr_tail
        .contains("ModuleNotFoundError"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exit_during_startup_fails_fast() {
    let fixture = Fixture::new("exit 4", FakeProbe::unhealthy());
    let started = Instant::now();
    let outcome = fixture.supervisor.start(launch()).await;
    assert!(!outcome.started);
    assert_eq!(outcome.failure_stage, Some(FailureStage::RuntimeStart));
    assert!(outcome.reason.unwrap().contains("code 4"));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(fixture.supervisor.status().state, SidecarState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashing_sidecar_restarts_until_budget_then_fails() {
    let fixture = Fixture::new("sleep 0.3\nexit 3", FakeProbe::healthy());
    let outcome = fixture.supervisor.start(launch()).await;
    assert!(outcome.started);

    assert!(
        fixture
            .wait_for(SidecarState::Failed, Duration::from_secs(10))
            .await
    );
    sleep(Duration::from_millis(500)).await;
    let status = fixture.supervisor.status();
    assert_eq!(status.state, SidecarState::Failed);
    assert_eq!(status.restart_attempts, 2);
    assert!(status.last_error.unwrap().contains("automatic restarts"));
    assert_eq!(fixture.spawns(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_is_not_treated_as_a_crash() {
    let fixture = Fixture::new(LONG_RUNNING, FakeProbe::healthy());
    let mut events = fixture.supervisor.subscribe();
    assert!(fixture.supervisor.start(launch()).await.started);
    fixture.supervisor.stop().await;
    sleep(Duration::from_millis(300)).await;

    let status = fixture.supervisor.status();
    assert_eq!(status.state, SidecarState::Stopped);
    assert_eq!(status.restart_attempts, 0);
    assert_eq!(fixture.spawns(), 1);

    let mut exits = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::Exited { expected, .. } = event {
            exits.push(expected);
        }
    }
    assert_eq!(exits, vec![true]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_interpreter_fails_to_resolve() {
    let fixture = Fixture::new(LONG_RUNNING, FakeProbe::healthy());
    let config = RuntimeLaunchConfig {
        python_path: Some(fixture.root.join("missing/python")),
        ..launch()
    };
    let outcome = fixture.supervisor.start(config).await;
    assert!(!outcome.started);
    assert_eq!(outcome.failure_stage, Some(FailureStage::ResolveRuntime));
    assert_eq!(fixture.spawns(), 0);
    assert_eq!(fixture.supervisor.status().state, SidecarState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_executable_interpreter_fails_to_spawn() {
    let fixture = Fixture::new(LONG_RUNNING, FakeProbe::healthy());
    let fake = fixture.root.join("not-python");
    fs::write(&fake, "plain text").unwrap();
    let outcome = fixture
        .supervisor
        .start(RuntimeLaunchConfig {
            python_path: Some(fake),
            ..launch()
        })
        .await;
    assert!(!outcome.started);
    assert_eq!(outcome.failure_stage, Some(FailureStage::Spawn));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresponsive_process_is_replaced_on_next_start() {
    let fixture = Fixture::new(LONG_RUNNING, FakeProbe::healthy());
    let first = fixture.supervisor.start(launch()).await;
    let first_pid = first.pid.unwrap();

    // Outlasts the fast re-check but not the full health budget.
    fixture.probe.go_down_for(Duration::from_millis(400));
    let second = fixture.supervisor.start(launch()).await;
    assert!(second.started, "{second:?}");
    assert!(!second.reused);
    assert_ne!(second.pid, Some(first_pid));
    assert!(!alive(first_pid));
    assert_eq!(fixture.spawns(), 2);
    fixture.supervisor.stop().await;
}
