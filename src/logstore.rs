//! Per-user execution history: remote persistence plus a local cache.
//!
//! A history fetch replaces the cached map for that user wholesale. Local appends go into the
//! cache immediately and are then sent to the remote store; a failed send is reported to the
//! caller but the local entry stays.

use crate::api::{LogRecord, ScriptApi};
use crate::error::ApiError;
use crate::model::{LogEntry, ScriptId, ScriptLogs, TeamLogSet};
use crate::snapshot::Versioned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct LogStore {
    api: Arc<dyn ScriptApi>,
    cache: Mutex<HashMap<String, Versioned<ScriptLogs>>>,
}

impl LogStore {
    pub fn new(api: Arc<dyn ScriptApi>) -> Self {
        Self {
            api,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut HashMap<String, Versioned<ScriptLogs>>) -> R) -> R {
        let mut guard = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Fetch the last `hours` of history and replace this user's cache with it.
    pub async fn fetch_history(
        &self,
        username: &str,
        hours: u32,
    ) -> Result<Arc<ScriptLogs>, ApiError> {
        let logs = self.api.fetch_logs(username, hours).await?;
        let total: usize = logs.values().map(Vec::len).sum();
        let snapshot = self.with_cache(|cache| {
            let slot = cache.entry(username.to_string()).or_default();
            let version = slot.replace(logs);
            tracing::debug!(user = username, hours, entries = total, version, "history replaced");
            Arc::clone(slot.value())
        });
        Ok(snapshot)
    }

    /// Append locally, then persist remotely. The local append is never rolled back.
    pub async fn append(
        &self,
        username: &str,
        script_id: ScriptId,
        entry: &LogEntry,
    ) -> Result<(), ApiError> {
        self.with_cache(|cache| {
            cache
                .entry(username.to_string())
                .or_default()
                .update(|logs| logs.entry(script_id).or_default().push(entry.clone()));
        });

        let record = LogRecord {
            script_id,
            status: entry.status,
            message: entry.message.clone(),
            files: entry.files.clone(),
            output: entry.output.clone().unwrap_or_default(),
        };
        self.api.append_log(username, &record).await
    }

    /// Current cached history for `username` (empty if never fetched).
    pub fn cached(&self, username: &str) -> Versioned<ScriptLogs> {
        self.with_cache(|cache| cache.get(username).cloned().unwrap_or_default())
    }

    /// Fetch every roster member's history concurrently. A failed member yields an empty map.
    pub async fn fetch_team(&self, roster: &[String], hours: u32) -> TeamLogSet {
        let fetches = roster.iter().map(|user| async move {
            match self.api.fetch_logs(user, hours).await {
                Ok(logs) => (user.clone(), logs),
                Err(e) => {
                    tracing::warn!(user = %user, error = %e, "team history fetch failed");
                    (user.clone(), ScriptLogs::new())
                }
            }
        });
        futures::future::join_all(fetches).await.into_iter().collect()
    }
}
