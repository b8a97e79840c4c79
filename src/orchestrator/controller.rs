//! Run lifecycle controller.
//!
//! Owns the per-script state machine (`Idle -> Running -> Completed | Stopped | TimedOut`),
//! issues run/stop requests, and emits events for presentation layers. Each accepted run gets
//! a new generation; a reply is applied only while its generation is still the running one.

use super::post_process::{
    process_run_completion, RunCompletion, START_BANNER, STOPPED_MESSAGE, STOP_MARKER,
};
use super::RunRejected;
use crate::api::{RunRequest, ScriptApi};
use crate::clock;
use crate::logstore::LogStore;
use crate::model::{
    ConsoleEvent, InfoEvent, InputKind, LogEntry, LogStatus, RunOutcome, RunPhase, RunState,
    Script, ScriptId,
};
use crate::session::{self, SessionContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

struct Shared {
    api: Arc<dyn ScriptApi>,
    session: SessionContext,
    logs: Arc<LogStore>,
    runs: Mutex<HashMap<ScriptId, RunState>>,
    event_tx: UnboundedSender<ConsoleEvent>,
    run_timeout: Duration,
}

impl Shared {
    fn runs(&self) -> MutexGuard<'_, HashMap<ScriptId, RunState>> {
        self.runs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, ev: ConsoleEvent) {
        let _ = self.event_tx.send(ev);
    }

    async fn persist(&self, script_id: ScriptId, entry: &LogEntry) {
        if let Err(e) = self
            .logs
            .append(self.session.username(), script_id, entry)
            .await
        {
            tracing::warn!(script_id, error = %e, "failed to persist log entry");
            self.emit(ConsoleEvent::Info(InfoEvent::LogPersistFailed {
                script_id,
                error: e.to_string(),
            }));
        }
    }

    /// Apply a completion if it still belongs to the running generation.
    async fn finish(
        &self,
        script_id: ScriptId,
        generation: u64,
        completion: RunCompletion,
    ) -> Option<LogEntry> {
        let processed = process_run_completion(completion);
        {
            let mut runs = self.runs();
            let state = runs.entry(script_id).or_default();
            if state.generation != generation || !state.is_running() {
                drop(runs);
                tracing::warn!(script_id, generation, "discarding stale run response");
                self.emit(ConsoleEvent::StaleResponse {
                    script_id,
                    generation,
                });
                return None;
            }
            state.phase = processed.phase;
            state.current_output = processed.output;
            state.current_files = processed.files;
            state.has_table_output = processed.has_table_output;
            state.parsed = Some(processed.parsed);
        }

        let entry = processed.entry;
        tracing::info!(
            script_id,
            status = entry.status.as_str(),
            message = %entry.message,
            "run finished"
        );
        self.persist(script_id, &entry).await;
        self.emit(ConsoleEvent::RunFinished {
            script_id,
            phase: processed.phase,
            entry: Box::new(entry.clone()),
        });
        Some(entry)
    }
}

/// Leaves `Running` if the run task ends without reaching `finish` (panic, abort, teardown).
struct RunningGuard {
    shared: Arc<Shared>,
    script_id: ScriptId,
    generation: u64,
    armed: bool,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut runs = self.shared.runs();
        if let Some(state) = runs.get_mut(&self.script_id) {
            if state.generation == self.generation && state.is_running() {
                state.phase = if self.shared.session.is_closed() {
                    RunPhase::Stopped
                } else {
                    RunPhase::Completed(RunOutcome::Error)
                };
                tracing::warn!(
                    script_id = self.script_id,
                    generation = self.generation,
                    "run task ended without a response"
                );
            }
        }
    }
}

/// Awaitable result of an accepted run.
pub struct RunHandle {
    pub script_id: ScriptId,
    pub generation: u64,
    join: tokio::task::JoinHandle<Option<LogEntry>>,
}

impl RunHandle {
    /// The log entry this run produced, or `None` if its response was discarded.
    pub async fn wait(self) -> Option<LogEntry> {
        match self.join.await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(script_id = self.script_id, error = %e, "run task failed");
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct RunOrchestrator {
    shared: Arc<Shared>,
}

impl RunOrchestrator {
    pub fn new(
        api: Arc<dyn ScriptApi>,
        session: SessionContext,
        logs: Arc<LogStore>,
        event_tx: UnboundedSender<ConsoleEvent>,
        run_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                session,
                logs,
                runs: Mutex::new(HashMap::new()),
                event_tx,
                run_timeout,
            }),
        }
    }

    pub fn state(&self, script_id: ScriptId) -> Option<RunState> {
        self.shared.runs().get(&script_id).cloned()
    }

    pub fn is_running(&self, script_id: ScriptId) -> bool {
        self.shared
            .runs()
            .get(&script_id)
            .is_some_and(RunState::is_running)
    }

    pub fn set_input(&self, script_id: ScriptId, key: &str, value: &str) {
        self.shared
            .runs()
            .entry(script_id)
            .or_default()
            .inputs
            .insert(key.to_string(), value.to_string());
    }

    /// Inputs a run would be sent with, or why it cannot start. Changes nothing.
    pub fn validate(&self, script: &Script) -> Result<HashMap<String, String>, RunRejected> {
        if self.shared.session.is_closed() {
            return Err(RunRejected::SessionClosed);
        }
        let runs = self.shared.runs();
        let state = runs.get(&script.id);
        if state.is_some_and(RunState::is_running) {
            return Err(RunRejected::AlreadyRunning);
        }
        let entered = state.map(|s| &s.inputs);
        resolve_inputs(script, entered)
    }

    /// Start a run. The request proceeds in the background; await the handle for its entry.
    pub fn run(&self, script: &Script) -> Result<RunHandle, RunRejected> {
        let inputs = self.validate(script)?;
        let script_id = script.id;

        let generation = {
            let mut runs = self.shared.runs();
            let state = runs.entry(script_id).or_default();
            // Re-checked under the same lock that flips the phase.
            if state.is_running() {
                return Err(RunRejected::AlreadyRunning);
            }
            state.generation += 1;
            state.phase = RunPhase::Running;
            state.current_output = START_BANNER.to_string();
            state.current_files.clear();
            state.has_table_output = false;
            state.parsed = None;
            state.inputs = inputs.clone();
            state.generation
        };
        tracing::info!(script_id, generation, script = %script.name, "run started");
        self.shared.emit(ConsoleEvent::RunStarted {
            script_id,
            generation,
        });

        let username = self.shared.session.username().to_string();
        let request = RunRequest {
            user_id: username.clone(),
            requester: username,
            output_prefix: format!("Script_{}", script.name),
            inputs,
        };
        let shared = Arc::clone(&self.shared);
        let join = tokio::spawn(async move {
            let mut guard = RunningGuard {
                shared: Arc::clone(&shared),
                script_id,
                generation,
                armed: true,
            };
            let shutdown = session::closed(shared.session.shutdown_signal());
            let timeout = shared.run_timeout;
            let completion = tokio::select! {
                res = tokio::time::timeout(timeout, shared.api.run_script(script_id, &request)) => {
                    match res {
                        Ok(Ok(reply)) => RunCompletion::Reply(reply),
                        Ok(Err(e)) => {
                            tracing::warn!(script_id, error = %e, "run request failed");
                            RunCompletion::Failed(e)
                        }
                        Err(_) => {
                            tracing::warn!(script_id, ?timeout, "run timed out");
                            RunCompletion::TimedOut(timeout)
                        }
                    }
                }
                _ = shutdown => {
                    tracing::debug!(script_id, "session closed while run was in flight");
                    return None;
                }
            };
            guard.armed = false;
            shared.finish(script_id, generation, completion).await
        });

        Ok(RunHandle {
            script_id,
            generation,
            join,
        })
    }

    /// Force the script out of `Running` and ask the service to stop it.
    ///
    /// Local state changes regardless of the remote outcome. Returns the stop entry when a run
    /// was in flight; a late reply for that run is discarded afterwards. Scripts this
    /// orchestrator never ran, or already stopped, keep their state as is.
    pub async fn stop(&self, script_id: ScriptId) -> Option<LogEntry> {
        let stopped_output = {
            let mut runs = self.shared.runs();
            match runs.get_mut(&script_id) {
                Some(state) if state.phase != RunPhase::Stopped => {
                    let was_running = state.is_running();
                    state.phase = RunPhase::Stopped;
                    state.current_output.push_str(STOP_MARKER);
                    was_running.then(|| state.current_output.clone())
                }
                _ => None,
            }
        };
        self.shared.emit(ConsoleEvent::RunStopped { script_id });

        if let Err(e) = self
            .shared
            .api
            .stop_script(script_id, self.shared.session.username())
            .await
        {
            tracing::warn!(script_id, error = %e, "stop request failed");
            self.shared
                .emit(ConsoleEvent::Info(InfoEvent::StopRequestFailed {
                    script_id,
                    error: e.to_string(),
                }));
        }

        let output = stopped_output?;
        let entry = LogEntry {
            timestamp: clock::timestamp_now(),
            status: LogStatus::Warning,
            message: STOPPED_MESSAGE.to_string(),
            files: Vec::new(),
            output: Some(output),
        };
        self.shared.persist(script_id, &entry).await;
        Some(entry)
    }
}

/// Entered values with defaults filled in, validated against the script's input list.
fn resolve_inputs(
    script: &Script,
    entered: Option<&HashMap<String, String>>,
) -> Result<HashMap<String, String>, RunRejected> {
    let mut resolved = HashMap::new();
    let mut missing = Vec::new();
    for input in &script.inputs {
        let value = entered
            .and_then(|m| m.get(&input.key))
            .filter(|v| !v.trim().is_empty())
            .or(input.default.as_ref().filter(|d| !d.trim().is_empty()));
        let Some(value) = value else {
            missing.push(input.key.clone());
            continue;
        };
        if input.kind == InputKind::Dropdown
            && !input.options.is_empty()
            && !input.options.iter().any(|o| o == value)
        {
            return Err(RunRejected::InvalidChoice {
                key: input.key.clone(),
                value: value.clone(),
            });
        }
        resolved.insert(input.key.clone(), value.clone());
    }
    if !missing.is_empty() {
        return Err(RunRejected::MissingInputs(missing));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::{script, FakeApi, FakeRun};
    use crate::model::{FileDescriptor, InputConfig};
    use crate::session::roster;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        api: Arc<FakeApi>,
        session: SessionContext,
        logs: Arc<LogStore>,
        orch: RunOrchestrator,
        events: UnboundedReceiver<ConsoleEvent>,
    }

    fn harness_with_timeout(run_timeout: Duration) -> Harness {
        let api = Arc::new(FakeApi::default());
        let session = SessionContext::new(roster().remove(1));
        let logs = Arc::new(LogStore::new(api.clone()));
        let (tx, events) = mpsc::unbounded_channel();
        let orch = RunOrchestrator::new(
            api.clone(),
            session.clone(),
            logs.clone(),
            tx,
            run_timeout,
        );
        Harness {
            api,
            session,
            logs,
            orch,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with_timeout(Duration::from_secs(900))
    }

    fn input(
        key: &str,
        kind: InputKind,
        options: &[&str],
        default: Option<&str>,
    ) -> InputConfig {
        InputConfig {
            key: key.into(),
            label: key.to_uppercase(),
            kind,
            options: options.iter().map(|o| o.to_string()).collect(),
            default: default.map(str::to_string),
            placeholder: None,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ConsoleEvent>) -> Vec<ConsoleEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn health_check_json_scenario() {
        let mut h = harness();
        let log = "...### JSON_OUTPUT_BEGIN ###\n{\"health_percent\":92}\n### JSON_OUTPUT_END ###";
        h.api.queue_run(5, FakeRun::success(log));
        let s = script(5, "Health Check", "Monitoring");

        let handle = h.orch.run(&s).unwrap();
        let entry = handle.wait().await.expect("entry");

        assert_eq!(entry.status, LogStatus::Success);
        let state = h.orch.state(5).unwrap();
        assert!(!state.is_running());
        assert_eq!(state.phase, RunPhase::Completed(RunOutcome::Success));
        let json = state.parsed.unwrap().json.unwrap();
        assert_eq!(json, vec![serde_json::json!({"health_percent": 92})]);

        let (id, req) = h.api.run_requests.lock().unwrap()[0].clone();
        assert_eq!(id, 5);
        assert_eq!(req.user_id, "developer");
        assert_eq!(req.requester, "developer");
        assert_eq!(req.output_prefix, "Script_Health Check");
        assert!(req.inputs.is_empty());

        assert_eq!(h.logs.cached("developer").value()[&5].len(), 1);
        let events = drain(&mut h.events);
        assert!(matches!(
            events[0],
            ConsoleEvent::RunStarted {
                script_id: 5,
                generation: 1
            }
        ));
        assert!(matches!(
            events.last(),
            Some(ConsoleEvent::RunFinished { script_id: 5, .. })
        ));
    }

    #[tokio::test]
    async fn missing_input_rejects_without_side_effects() {
        let mut h = harness();
        let mut s = script(7, "Export", "Reporting");
        s.inputs = vec![input("region", InputKind::Text, &[], None)];

        let err = h.orch.run(&s).err().unwrap();
        assert_eq!(err, RunRejected::MissingInputs(vec!["region".into()]));
        assert!(h.orch.state(7).is_none());
        assert!(h.api.run_requests.lock().unwrap().is_empty());
        assert!(h.logs.cached("developer").value().is_empty());
        assert!(drain(&mut h.events).is_empty());

        h.orch.set_input(7, "region", "   ");
        assert!(matches!(h.orch.run(&s), Err(RunRejected::MissingInputs(_))));
        assert!(!h.orch.is_running(7));
    }

    #[tokio::test]
    async fn defaults_fill_and_dropdowns_validate() {
        let h = harness();
        let mut s = script(8, "Sync", "Maintenance");
        s.inputs = vec![
            input("env", InputKind::Dropdown, &["dev", "prod"], Some("dev")),
            input("limit", InputKind::Number, &[], Some("10")),
        ];
        let resolved = h.orch.validate(&s).unwrap();
        assert_eq!(resolved["env"], "dev");
        assert_eq!(resolved["limit"], "10");

        h.orch.set_input(8, "env", "staging");
        assert_eq!(
            h.orch.validate(&s).unwrap_err(),
            RunRejected::InvalidChoice {
                key: "env".into(),
                value: "staging".into()
            }
        );

        h.orch.set_input(8, "env", "prod");
        let entry = h.orch.run(&s).unwrap().wait().await.unwrap();
        assert_eq!(entry.status, LogStatus::Success);
        assert_eq!(h.api.run_requests.lock().unwrap()[0].1.inputs["env"], "prod");
    }

    #[tokio::test]
    async fn remote_failure_message_is_recorded() {
        let h = harness();
        h.api.queue_run(1, FakeRun::status(500, None, Some("Script not found")));
        let handle = h.orch.run(&script(1, "A", "Reporting")).unwrap();
        let entry = handle.wait().await.unwrap();
        assert_eq!(entry.status, LogStatus::Error);
        assert_eq!(entry.message, "HTTP 500: Script not found");
        let state = h.orch.state(1).unwrap();
        assert_eq!(state.phase, RunPhase::Completed(RunOutcome::Error));
        assert_eq!(state.current_output, "ERROR: Script not found");
    }

    #[tokio::test]
    async fn transport_failure_leaves_running() {
        let h = harness();
        h.api.queue_run(2, FakeRun::Unreachable);
        let handle = h.orch.run(&script(2, "B", "Reporting")).unwrap();
        let entry = handle.wait().await.unwrap();
        assert_eq!(entry.status, LogStatus::Error);
        assert_eq!(entry.message, "Failed to execute script");
        assert!(!h.orch.is_running(2));
        let output = h.orch.state(2).unwrap().current_output;
        assert!(output.starts_with("ERROR: Failed to execute script\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn files_are_recorded_and_cleared_on_rerun() {
        let h = harness();
        let report = FileDescriptor {
            name: "report.csv".into(),
            path: "Script_F/report.csv".into(),
            size: Some(2048),
            modified: None,
            kind: Some("csv".into()),
        };
        h.api.queue_run(
            13,
            FakeRun::success("done").with_files(vec![report.clone()]),
        );
        let s = script(13, "Files", "Reporting");

        let entry = h.orch.run(&s).unwrap().wait().await.unwrap();
        assert_eq!(entry.files, vec![report.clone()]);
        let state = h.orch.state(13).unwrap();
        assert_eq!(state.current_files, vec![report]);
        assert_eq!(state.current_output, "done");

        *h.api.run_delay.lock().unwrap() = Some(Duration::from_secs(5));
        let second = h.orch.run(&s).unwrap();
        let state = h.orch.state(13).unwrap();
        assert!(state.is_running());
        assert!(state.current_files.is_empty());
        assert!(state.parsed.is_none());
        assert_eq!(state.current_output, "Starting script execution...\n");

        let entry = second.wait().await.unwrap();
        assert!(entry.files.is_empty());
        assert!(h.orch.state(13).unwrap().current_files.is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_does_not_roll_back() {
        let mut h = harness();
        *h.api.append_fails.lock().unwrap() = true;
        let handle = h.orch.run(&script(3, "C", "Reporting")).unwrap();
        let entry = handle.wait().await.unwrap();
        assert_eq!(entry.status, LogStatus::Success);
        assert_eq!(
            h.orch.state(3).unwrap().phase,
            RunPhase::Completed(RunOutcome::Success)
        );
        assert_eq!(h.logs.cached("developer").value()[&3].len(), 1);
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            ConsoleEvent::Info(InfoEvent::LogPersistFailed { script_id: 3, .. })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_while_running_is_rejected() {
        let h = harness();
        *h.api.run_delay.lock().unwrap() = Some(Duration::from_secs(5));
        let s = script(4, "D", "Reporting");
        let first = h.orch.run(&s).unwrap();
        assert_eq!(h.orch.run(&s).err(), Some(RunRejected::AlreadyRunning));
        assert!(first.wait().await.is_some());
        assert_eq!(h.api.run_requests.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_local_and_discards_late_reply() {
        let mut h = harness();
        *h.api.run_delay.lock().unwrap() = Some(Duration::from_secs(5));
        *h.api.stop_fails.lock().unwrap() = true;
        let s = script(6, "E", "Reporting");
        let handle = h.orch.run(&s).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stop_entry = h.orch.stop(6).await.expect("stop entry");
        assert_eq!(stop_entry.status, LogStatus::Warning);
        assert_eq!(stop_entry.message, "Script stopped by user");
        let state = h.orch.state(6).unwrap();
        assert_eq!(state.phase, RunPhase::Stopped);
        assert!(state.current_output.ends_with("=== SCRIPT STOPPED BY USER ===\n"));

        // The reply arrives after the stop and is dropped.
        assert!(handle.wait().await.is_none());
        assert_eq!(h.orch.state(6).unwrap().phase, RunPhase::Stopped);
        assert_eq!(h.logs.cached("developer").value()[&6].len(), 1);

        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            ConsoleEvent::StaleResponse {
                script_id: 6,
                generation: 1
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ConsoleEvent::Info(InfoEvent::StopRequestFailed { script_id: 6, .. })
        )));
        assert_eq!(h.api.stop_calls.lock().unwrap()[0], (6, "developer".to_string()));
    }

    #[tokio::test]
    async fn stop_when_idle_produces_no_entry() {
        let h = harness();
        assert!(h.orch.stop(9).await.is_none());
        assert!(h.orch.state(9).is_none());
        assert_eq!(h.api.stop_calls.lock().unwrap().len(), 1);
        assert!(h.logs.cached("developer").value().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_stop_appends_marker_once() {
        let h = harness();
        *h.api.run_delay.lock().unwrap() = Some(Duration::from_secs(5));
        let handle = h.orch.run(&script(14, "I", "Reporting")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(h.orch.stop(14).await.is_some());
        let after_first = h.orch.state(14).unwrap().current_output;
        assert!(h.orch.stop(14).await.is_none());
        assert!(h.orch.stop(14).await.is_none());

        let state = h.orch.state(14).unwrap();
        assert_eq!(state.phase, RunPhase::Stopped);
        assert_eq!(state.current_output, after_first);
        assert_eq!(state.current_output.matches("SCRIPT STOPPED BY USER").count(), 1);
        assert_eq!(h.api.stop_calls.lock().unwrap().len(), 3);
        assert_eq!(h.logs.cached("developer").value()[&14].len(), 1);
        assert!(handle.wait().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_after_stop_ignores_first_reply() {
        let h = harness();
        *h.api.run_delay.lock().unwrap() = Some(Duration::from_secs(5));
        let s = script(10, "F", "Reporting");
        let first = h.orch.run(&s).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.orch.stop(10).await;
        let second = h.orch.run(&s).unwrap();
        assert_eq!(second.generation, 2);

        assert!(first.wait().await.is_none());
        assert!(h.orch.is_running(10));
        assert!(second.wait().await.is_some());
        assert!(!h.orch.is_running(10));
    }

    #[tokio::test(start_paused = true)]
    async fn run_timeout_is_terminal() {
        let h = harness_with_timeout(Duration::from_secs(30));
        *h.api.run_delay.lock().unwrap() = Some(Duration::from_secs(120));
        let handle = h.orch.run(&script(11, "G", "Reporting")).unwrap();
        let entry = handle.wait().await.unwrap();
        assert_eq!(entry.status, LogStatus::Error);
        assert!(entry.message.contains("remote outcome unknown"));
        assert_eq!(h.orch.state(11).unwrap().phase, RunPhase::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_releases_running_state() {
        let h = harness();
        *h.api.run_delay.lock().unwrap() = Some(Duration::from_secs(60));
        let handle = h.orch.run(&script(12, "H", "Reporting")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.session.teardown();
        assert!(handle.wait().await.is_none());
        assert_eq!(h.orch.state(12).unwrap().phase, RunPhase::Stopped);
        assert_eq!(
            h.orch.run(&script(12, "H", "Reporting")).err(),
            Some(RunRejected::SessionClosed)
        );
    }
}
