use anyhow::Result;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};
use tracing::warn;
use tutorhost_core::{
    CommandInfo, Config, ExecutionOutcome, GlobalOptions, Runtime, SupervisorEvent,
};
use tutorhost_domain::{FailureStage, PhaseEvent, RuntimeLaunchConfig, SidecarState};

use crate::cli::{
    BundlesCommand, CommandGroupCli, EnqueueArgs, FlushArgs, QueueCommand, SidecarCommand,
    SidecarStartArgs,
};
use crate::progress::{describe_download, describe_phase, progress_enabled, ProgressLine};

pub fn command_info(command: &CommandGroupCli) -> CommandInfo {
    match command {
        CommandGroupCli::Provision => CommandInfo::new("provision", "provision"),
        CommandGroupCli::Bundles(BundlesCommand::List) => CommandInfo::new("bundles", "list"),
        CommandGroupCli::Bundles(BundlesCommand::Sync(_)) => CommandInfo::new("bundles", "sync"),
        CommandGroupCli::Sidecar(SidecarCommand::Start(_)) => CommandInfo::new("sidecar", "start"),
        CommandGroupCli::Queue(QueueCommand::Enqueue(_)) => CommandInfo::new("queue", "enqueue"),
        CommandGroupCli::Queue(QueueCommand::Flush(_)) => CommandInfo::new("queue", "flush"),
        CommandGroupCli::Queue(QueueCommand::Pending(_)) => CommandInfo::new("queue", "pending"),
        CommandGroupCli::Queue(QueueCommand::DeadLetters(_)) => {
            CommandInfo::new("queue", "dead-letters")
        }
    }
}

/// Load configuration, wire the runtime and run the selected command.
///
/// # Errors
/// Only configuration problems escape; everything else becomes an outcome.
pub async fn execute(global: &GlobalOptions, command: &CommandGroupCli) -> Result<ExecutionOutcome> {
    let config = Config::for_invocation(global)?;
    let runtime = match Runtime::new(config) {
        Ok(runtime) => runtime,
        Err(err) => return Ok(ExecutionOutcome::from_error(&err)),
    };
    let progress = progress_enabled(global.quiet, global.json);

    let outcome = match command {
        CommandGroupCli::Provision => provision(&runtime, progress).await,
        CommandGroupCli::Bundles(BundlesCommand::List) => bundles_list(&runtime),
        CommandGroupCli::Bundles(BundlesCommand::Sync(args)) => {
            bundles_sync(&runtime, args.all, progress).await
        }
        CommandGroupCli::Sidecar(SidecarCommand::Start(args)) => {
            sidecar_start(&runtime, args, !global.quiet && !global.json).await
        }
        CommandGroupCli::Queue(QueueCommand::Enqueue(args)) => queue_enqueue(&runtime, args).await,
        CommandGroupCli::Queue(QueueCommand::Flush(args)) => queue_flush(&runtime, args).await,
        CommandGroupCli::Queue(QueueCommand::Pending(args)) => {
            match runtime.queue().pending(&args.stream).await {
                Ok(items) => listing(&args.stream, "pending", &items),
                Err(err) => ExecutionOutcome::from_error(&err),
            }
        }
        CommandGroupCli::Queue(QueueCommand::DeadLetters(args)) => {
            match runtime.queue().dead_letters(&args.stream).await {
                Ok(items) => listing(&args.stream, "dead-lettered", &items),
                Err(err) => ExecutionOutcome::from_error(&err),
            }
        }
    };
    Ok(outcome)
}

async fn provision(runtime: &Runtime, progress: bool) -> ExecutionOutcome {
    let events = runtime.provisioner().subscribe();
    let (finished, done) = oneshot::channel();
    let renderer = tokio::spawn(render_phases(events, done, ProgressLine::new(progress)));
    let outcome = runtime.provisioner().ensure_ready().await;
    let _ = finished.send(());
    let _ = renderer.await;

    let details = serde_json::to_value(&outcome).unwrap_or(Value::Null);
    if outcome.ready {
        return ExecutionOutcome::success("environment ready", details);
    }
    let phase = outcome
        .failed_phase
        .map_or_else(|| "provisioning".to_string(), |phase| phase.to_string());
    let error = outcome.error.as_deref().unwrap_or("unknown error");
    let mut outcome = ExecutionOutcome::failure(format!("{phase} failed: {error}"), details);
    if let Value::Object(map) = &mut outcome.details {
        map.insert(
            "hint".into(),
            json!("rerun `tutorhost provision`; finished phases are kept"),
        );
    }
    outcome
}

/// Draw phase events until `done` fires, then draw whatever is still queued.
/// Returns the last line drawn.
async fn render_phases(
    mut events: broadcast::Receiver<PhaseEvent>,
    mut done: oneshot::Receiver<()>,
    mut line: ProgressLine,
) -> Option<String> {
    let mut last = None;
    let mut draw = |event: &PhaseEvent| {
        let text = describe_phase(event);
        line.update(&text);
        last = Some(text);
    };
    loop {
        tokio::select! {
            _ = &mut done => break,
            event = events.recv() => match event {
                Ok(event) => draw(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
    loop {
        match events.try_recv() {
            Ok(event) => draw(&event),
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    last
}

fn bundles_list(runtime: &Runtime) -> ExecutionOutcome {
    let index = runtime.index().get();
    let bundles: Vec<Value> = index
        .iter()
        .map(|(bundle_type, scope_id, entry)| {
            json!({
                "bundleType": bundle_type,
                "scopeId": scope_id,
                "version": entry.version,
                "path": entry.path.display().to_string(),
                "sha256": entry.sha256,
                "installedAt": entry.installed_at,
                "present": entry.path.is_dir(),
            })
        })
        .collect();
    let message = match bundles.len() {
        0 => "no bundles installed".to_string(),
        1 => "1 bundle installed".to_string(),
        count => format!("{count} bundles installed"),
    };
    ExecutionOutcome::success(message, json!({ "bundles": bundles }))
}

async fn bundles_sync(runtime: &Runtime, include_optional: bool, progress: bool) -> ExecutionOutcome {
    let mut line = ProgressLine::new(progress);
    let results = runtime
        .sync_bundles(include_optional, |descriptor, download| {
            line.update(&format!("{} {}", descriptor.label(), describe_download(download)));
        })
        .await;
    line.clear();
    let results = match results {
        Ok(results) => results,
        Err(err) => return ExecutionOutcome::from_error(&err),
    };

    let total = results.len();
    let mut installed = Vec::new();
    let mut failed = Vec::new();
    for sync in results {
        match sync.result {
            Ok(entry) => installed.push(json!({
                "bundle": sync.descriptor.label(),
                "path": entry.path.display().to_string(),
            })),
            Err(err) => failed.push(json!({
                "bundle": sync.descriptor.label(),
                "error": err.to_string(),
                "kind": err.kind().as_str(),
                "retryable": err.is_retryable(),
            })),
        }
    }
    let details = json!({ "installed": installed, "failed": failed });
    if failed.is_empty() {
        ExecutionOutcome::success(format!("{total} bundle(s) up to date"), details)
    } else {
        ExecutionOutcome::failure(
            format!("{} of {total} bundle(s) failed to install", failed.len()),
            details,
        )
    }
}

async fn sidecar_start(
    runtime: &Runtime,
    args: &SidecarStartArgs,
    announce: bool,
) -> ExecutionOutcome {
    let config = RuntimeLaunchConfig {
        python_path: args.python.clone(),
        llm_provider: args.provider.clone(),
        llm_api_key: args.api_key.clone(),
        llm_model: args.model.clone(),
        llm_base_url: args.base_url.clone(),
    };
    let supervisor = runtime.supervisor();
    let mut events = supervisor.subscribe();
    let started = supervisor.start(config).await;
    if !started.started {
        let stage = started.failure_stage.map_or("start", |stage| match stage {
            FailureStage::ResolveRuntime => "resolve_runtime",
            FailureStage::Spawn => "spawn",
            FailureStage::RuntimeStart => "runtime_start",
        });
        let reason = started.reason.clone().unwrap_or_default();
        let details = serde_json::to_value(&started).unwrap_or(Value::Null);
        return ExecutionOutcome::failure(format!("sidecar failed at {stage}: {reason}"), details);
    }

    if announce {
        let pid = started.pid.map_or_else(|| "?".to_string(), |pid| pid.to_string());
        eprintln!(
            "tutorhost ▸ sidecar running (pid {pid}) at {}; press Ctrl-C to stop",
            runtime.config().sidecar.base_url()
        );
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let gave_up = loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(err) = signal {
                    warn!(%err, "unable to listen for Ctrl-C");
                }
                break false;
            }
            event = events.recv() => match event {
                Ok(SupervisorEvent::Stderr { chunk }) if announce => eprint!("{chunk}"),
                Ok(SupervisorEvent::State { state: SidecarState::Failed }) => break true,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break false,
            },
        }
    };

    let status = supervisor.status();
    supervisor.stop().await;
    let details = serde_json::to_value(&status).unwrap_or(Value::Null);
    if gave_up {
        let reason = status
            .last_error
            .clone()
            .unwrap_or_else(|| "sidecar kept exiting".to_string());
        ExecutionOutcome::failure(reason, details)
    } else {
        ExecutionOutcome::success("sidecar stopped", details)
    }
}

async fn queue_enqueue(runtime: &Runtime, args: &EnqueueArgs) -> ExecutionOutcome {
    let payload: Value = match serde_json::from_str(&args.payload) {
        Ok(payload) => payload,
        Err(err) => {
            return ExecutionOutcome::user_error(
                format!("payload is not valid JSON: {err}"),
                json!({ "stream": args.stream }),
            )
        }
    };
    match runtime.queue().enqueue(&args.stream, payload).await {
        Ok(item) => ExecutionOutcome::success(
            format!("queued {} on {}", item.id, args.stream),
            serde_json::to_value(&item).unwrap_or(Value::Null),
        ),
        Err(err) => ExecutionOutcome::from_error(&err),
    }
}

async fn queue_flush(runtime: &Runtime, args: &FlushArgs) -> ExecutionOutcome {
    if !runtime.config().online {
        return ExecutionOutcome::user_error(
            "offline mode is on; nothing was sent",
            json!({ "stream": args.stream, "hint": "unset TUTORHOST_ONLINE=0 or drop --offline" }),
        );
    }
    let endpoint = match &args.endpoint {
        Some(endpoint) => endpoint.clone(),
        None => match runtime.stream_endpoint(&args.stream) {
            Ok(endpoint) => endpoint,
            Err(err) => return ExecutionOutcome::from_error(&err),
        },
    };
    let max_retries = args
        .max_retries
        .unwrap_or(runtime.config().sync.max_retries);
    match runtime
        .queue()
        .flush(&args.stream, &endpoint, max_retries)
        .await
    {
        Ok(summary) => {
            let mut details = serde_json::to_value(summary).unwrap_or(Value::Null);
            if let Value::Object(map) = &mut details {
                map.insert("endpoint".into(), json!(endpoint));
                map.insert("stream".into(), json!(args.stream));
            }
            ExecutionOutcome::success(
                format!(
                    "sent {}, {} remaining ({} deferred), {} dead-lettered",
                    summary.sent, summary.remaining, summary.deferred, summary.dead_lettered
                ),
                details,
            )
        }
        Err(err) => ExecutionOutcome::from_error(&err),
    }
}

fn listing<T: serde::Serialize>(stream: &str, what: &str, items: &[T]) -> ExecutionOutcome {
    ExecutionOutcome::success(
        format!("{} {what} item(s) in {stream}", items.len()),
        json!({ "stream": stream, "items": items }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutorhost_domain::ProvisioningPhase;

    fn event(phase: ProvisioningPhase, status: &str) -> PhaseEvent {
        PhaseEvent {
            phase,
            percent: 100,
            phase_percent: 100,
            bytes_downloaded: None,
            total_bytes: None,
            status: status.to_string(),
        }
    }

    #[tokio::test]
    async fn final_phase_event_is_drawn_after_provisioning_returns() {
        let (events, receiver) = broadcast::channel(16);
        let (finished, done) = oneshot::channel();
        let renderer = tokio::spawn(render_phases(receiver, done, ProgressLine::new(false)));

        events.send(event(ProvisioningPhase::Checking, "checked")).unwrap();
        events.send(event(ProvisioningPhase::Done, "ready")).unwrap();
        finished.send(()).unwrap();

        let last = renderer.await.unwrap();
        assert_eq!(last, Some(describe_phase(&event(ProvisioningPhase::Done, "ready"))));
    }
}
