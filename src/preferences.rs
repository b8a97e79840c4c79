//! Favorite scripts per user, and the derived "recently run" view.

use crate::catalog::Catalog;
use crate::clock;
use crate::error::ConsoleError;
use crate::model::{LogStatus, Script, ScriptId, ScriptLogs};
use crate::storage::KvStore;
use std::sync::Arc;

/// Hours of history used to derive recents.
pub const RECENT_WINDOW_HOURS: u32 = 168;
pub const RECENT_LIMIT: usize = 5;

pub struct PreferenceTracker {
    kv: Arc<dyn KvStore>,
}

fn favorites_key(username: &str) -> String {
    format!("favorites_{username}")
}

impl PreferenceTracker {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Favorites in insertion order. Unreadable state is an empty set.
    pub fn list_favorites(&self, username: &str) -> Vec<ScriptId> {
        let Some(raw) = self.kv.get(&favorites_key(username)) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<ScriptId>>(&raw) {
            Ok(mut ids) => {
                let mut seen = std::collections::HashSet::new();
                ids.retain(|id| seen.insert(*id));
                ids
            }
            Err(e) => {
                tracing::warn!(
                    user = username,
                    error = %e,
                    "favorites are unreadable, treating as empty"
                );
                Vec::new()
            }
        }
    }

    pub fn is_favorite(&self, username: &str, script_id: ScriptId) -> bool {
        self.list_favorites(username).contains(&script_id)
    }

    /// Add when absent, remove when present. Returns whether the script is now a favorite.
    pub fn toggle_favorite(
        &self,
        username: &str,
        script_id: ScriptId,
    ) -> Result<bool, ConsoleError> {
        let mut ids = self.list_favorites(username);
        let now_favorite = match ids.iter().position(|id| *id == script_id) {
            Some(pos) => {
                ids.remove(pos);
                false
            }
            None => {
                ids.push(script_id);
                true
            }
        };
        let raw = serde_json::to_string(&ids).map_err(|e| ConsoleError::Store {
            path: favorites_key(username),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        self.kv.set(&favorites_key(username), &raw)?;
        tracing::debug!(user = username, script_id, now_favorite, "toggled favorite");
        Ok(now_favorite)
    }

    /// Favorite scripts still present in the catalog.
    pub fn favorite_scripts<'c>(&self, username: &str, catalog: &'c Catalog) -> Vec<&'c Script> {
        self.list_favorites(username)
            .into_iter()
            .filter_map(|id| catalog.find(id))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecentScript {
    pub script: Script,
    pub last_run: String,
    pub status: LogStatus,
    pub message: String,
}

/// Most recent entry per catalogued script, newest first, capped at [`RECENT_LIMIT`].
pub fn recent_scripts(logs: &ScriptLogs, catalog: &Catalog) -> Vec<RecentScript> {
    let mut recent: Vec<RecentScript> = logs
        .iter()
        .filter_map(|(id, entries)| {
            let script = catalog.find(*id)?;
            let latest = entries
                .iter()
                .max_by_key(|e| clock::sort_key(&e.timestamp))?;
            Some(RecentScript {
                script: script.clone(),
                last_run: latest.timestamp.clone(),
                status: latest.status,
                message: latest.message.clone(),
            })
        })
        .collect();
    recent.sort_by_key(|r| std::cmp::Reverse(clock::sort_key(&r.last_run)));
    recent.truncate(RECENT_LIMIT);
    recent
}
