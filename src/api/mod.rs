//! Contract with the remote script execution service.
//!
//! Everything the console knows about the outside world goes through [`ScriptApi`]. The
//! production implementation is [`client::HttpScriptApi`]; tests substitute an in-memory fake.

mod client;
#[cfg(test)]
pub(crate) mod fake;

pub use client::HttpScriptApi;

use crate::error::ApiError;
use crate::model::{FileDescriptor, LogStatus, Script, ScriptCategory, ScriptId, ScriptLogs};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body of `POST /api/scripts/{id}/run`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRequest {
    pub user_id: String,
    pub requester: String,
    pub output_prefix: String,
    pub inputs: HashMap<String, String>,
}

/// Body of a run response. Every field is optional because error responses share the shape loosely.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
    #[serde(default)]
    pub execution_log: Option<String>,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
}

impl RunResponse {
    pub fn is_success_status(&self) -> bool {
        self.status.as_deref() == Some("success")
    }

    /// `message`, or the service's `detail` field when only that was sent.
    pub fn remote_message(&self) -> Option<String> {
        if let Some(m) = self.message.as_deref().filter(|m| !m.is_empty()) {
            return Some(m.to_string());
        }
        match &self.detail {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }
    }
}

/// A run reply keeps the HTTP status because a 2xx alone does not mean the script succeeded.
#[derive(Debug, Clone)]
pub struct RunReply {
    pub http_status: u16,
    pub body: RunResponse,
}

impl RunReply {
    pub fn is_http_success(&self) -> bool {
        (200..300).contains(&self.http_status)
    }
}

/// Body of `POST /api/logs/{username}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub script_id: ScriptId,
    pub status: LogStatus,
    pub message: String,
    pub files: Vec<FileDescriptor>,
    pub output: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScriptsEnvelope {
    #[serde(default)]
    pub scripts: Vec<Script>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CategoriesEnvelope {
    #[serde(default)]
    pub categories: Vec<ScriptCategory>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogsEnvelope {
    #[serde(default)]
    pub logs: ScriptLogs,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FilesEnvelope {
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageEnvelope {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

impl MessageEnvelope {
    pub fn into_message(self) -> Option<String> {
        RunResponse {
            message: self.message,
            detail: self.detail,
            ..Default::default()
        }
        .remote_message()
    }
}

#[async_trait]
pub trait ScriptApi: Send + Sync {
    async fn list_scripts(&self) -> Result<Vec<Script>, ApiError>;

    async fn list_categories(&self) -> Result<Vec<ScriptCategory>, ApiError>;

    /// Transport failures are `Err`; any HTTP answer, including non-2xx, is a `RunReply`.
    async fn run_script(&self, script_id: ScriptId, req: &RunRequest) -> Result<RunReply, ApiError>;

    async fn stop_script(&self, script_id: ScriptId, user_id: &str) -> Result<(), ApiError>;

    async fn fetch_logs(&self, username: &str, hours: u32) -> Result<ScriptLogs, ApiError>;

    async fn append_log(&self, username: &str, record: &LogRecord) -> Result<(), ApiError>;

    async fn list_files(
        &self,
        username: &str,
        script_id: ScriptId,
    ) -> Result<Vec<FileDescriptor>, ApiError>;

    async fn download_file(&self, username: &str, file_path: &str) -> Result<Bytes, ApiError>;

    async fn reload_config(&self) -> Result<String, ApiError>;
}
