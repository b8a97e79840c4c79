//! In-memory stand-in for the execution service.

use super::{LogRecord, RunReply, RunRequest, RunResponse, ScriptApi};
use crate::clock;
use crate::error::ApiError;
use crate::model::{FileDescriptor, LogEntry, Script, ScriptCategory, ScriptId, ScriptLogs};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone)]
pub(crate) enum FakeRun {
    Reply(RunReply),
    Unreachable,
}

impl FakeRun {
    pub fn success(log: &str) -> Self {
        FakeRun::Reply(RunReply {
            http_status: 200,
            body: RunResponse {
                status: Some("success".into()),
                message: Some("Script executed successfully".into()),
                execution_log: Some(log.into()),
                ..Default::default()
            },
        })
    }

    pub fn status(http_status: u16, status: Option<&str>, message: Option<&str>) -> Self {
        FakeRun::Reply(RunReply {
            http_status,
            body: RunResponse {
                status: status.map(str::to_string),
                message: message.map(str::to_string),
                ..Default::default()
            },
        })
    }

    pub fn with_files(mut self, files: Vec<FileDescriptor>) -> Self {
        if let FakeRun::Reply(r) = &mut self {
            r.body.files = files;
        }
        self
    }
}

#[derive(Default)]
pub(crate) struct FakeApi {
    pub scripts: Mutex<Vec<Script>>,
    pub categories: Mutex<Option<Vec<ScriptCategory>>>,
    pub runs: Mutex<HashMap<ScriptId, VecDeque<FakeRun>>>,
    pub run_delay: Mutex<Option<Duration>>,
    pub run_requests: Mutex<Vec<(ScriptId, RunRequest)>>,
    pub stop_calls: Mutex<Vec<(ScriptId, String)>>,
    pub stop_fails: Mutex<bool>,
    pub logs: Mutex<HashMap<String, ScriptLogs>>,
    pub failing_users: Mutex<HashSet<String>>,
    pub append_fails: Mutex<bool>,
    pub appended: Mutex<Vec<(String, LogRecord)>>,
    /// Queued listings per script; each call pops one (the last one repeats).
    pub files: Mutex<HashMap<ScriptId, VecDeque<(Duration, Vec<FileDescriptor>)>>>,
    pub file_calls: Mutex<usize>,
}

fn unreachable_error(endpoint: &str) -> ApiError {
    ApiError::transport(
        endpoint,
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
    )
}

impl FakeApi {
    pub fn with_scripts(scripts: Vec<Script>) -> Self {
        let api = Self::default();
        *api.scripts.lock().unwrap() = scripts;
        api
    }

    pub fn queue_run(&self, script_id: ScriptId, run: FakeRun) {
        self.runs
            .lock()
            .unwrap()
            .entry(script_id)
            .or_default()
            .push_back(run);
    }

    pub fn queue_files(&self, script_id: ScriptId, delay: Duration, files: Vec<FileDescriptor>) {
        self.files
            .lock()
            .unwrap()
            .entry(script_id)
            .or_default()
            .push_back((delay, files));
    }
}

#[async_trait]
impl ScriptApi for FakeApi {
    async fn list_scripts(&self) -> Result<Vec<Script>, ApiError> {
        Ok(self.scripts.lock().unwrap().clone())
    }

    async fn list_categories(&self) -> Result<Vec<ScriptCategory>, ApiError> {
        match self.categories.lock().unwrap().clone() {
            Some(c) => Ok(c),
            None => Err(ApiError::Status {
                endpoint: "/api/categories".into(),
                status: 500,
                message: None,
            }),
        }
    }

    async fn run_script(
        &self,
        script_id: ScriptId,
        req: &RunRequest,
    ) -> Result<RunReply, ApiError> {
        self.run_requests
            .lock()
            .unwrap()
            .push((script_id, req.clone()));
        let delay = *self.run_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let next = self
            .runs
            .lock()
            .unwrap()
            .get_mut(&script_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| FakeRun::success(""));
        match next {
            FakeRun::Reply(r) => Ok(r),
            FakeRun::Unreachable => Err(unreachable_error("/api/scripts/run")),
        }
    }

    async fn stop_script(&self, script_id: ScriptId, user_id: &str) -> Result<(), ApiError> {
        self.stop_calls
            .lock()
            .unwrap()
            .push((script_id, user_id.to_string()));
        if *self.stop_fails.lock().unwrap() {
            return Err(unreachable_error("/api/scripts/stop"));
        }
        Ok(())
    }

    async fn fetch_logs(&self, username: &str, _hours: u32) -> Result<ScriptLogs, ApiError> {
        if self.failing_users.lock().unwrap().contains(username) {
            return Err(unreachable_error("/api/logs"));
        }
        Ok(self
            .logs
            .lock()
            .unwrap()
            .get(username)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_log(&self, username: &str, record: &LogRecord) -> Result<(), ApiError> {
        if *self.append_fails.lock().unwrap() {
            return Err(ApiError::Status {
                endpoint: "/api/logs".into(),
                status: 500,
                message: Some("Failed to save log".into()),
            });
        }
        self.appended
            .lock()
            .unwrap()
            .push((username.to_string(), record.clone()));
        self.logs
            .lock()
            .unwrap()
            .entry(username.to_string())
            .or_default()
            .entry(record.script_id)
            .or_default()
            .push(LogEntry {
                timestamp: clock::timestamp_now(),
                status: record.status,
                message: record.message.clone(),
                files: record.files.clone(),
                output: Some(record.output.clone()),
            });
        Ok(())
    }

    async fn list_files(
        &self,
        _username: &str,
        script_id: ScriptId,
    ) -> Result<Vec<FileDescriptor>, ApiError> {
        *self.file_calls.lock().unwrap() += 1;
        let next = {
            let mut files = self.files.lock().unwrap();
            match files.get_mut(&script_id) {
                Some(q) if q.len() > 1 => q.pop_front(),
                Some(q) => q.front().cloned(),
                None => None,
            }
        };
        match next {
            Some((delay, listing)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(listing)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn download_file(&self, _username: &str, file_path: &str) -> Result<Bytes, ApiError> {
        Ok(Bytes::from(format!("contents of {file_path}")))
    }

    async fn reload_config(&self) -> Result<String, ApiError> {
        Ok(format!(
            "Reloaded {} scripts",
            self.scripts.lock().unwrap().len()
        ))
    }
}

pub(crate) fn script(id: ScriptId, name: &str, category: &str) -> Script {
    Script {
        id,
        name: name.to_string(),
        file: format!("{}.py", name.to_lowercase().replace(' ', "_")),
        description: format!("{name} description"),
        category: category.to_string(),
        inputs: Vec::new(),
    }
}
