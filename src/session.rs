//! Session context: who is using the console and the teardown signal tied to them.
//!
//! Components receive a `SessionContext` explicitly instead of reading a process-wide current
//! user. Logging out flips the shutdown signal so pollers and in-flight runs bound to the
//! session stop.

use crate::error::ConsoleError;
use crate::storage::KvStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

const SESSION_KEY: &str = "current_user";

/// Usernames whose histories make up the team analytics view.
pub const DEFAULT_TEAM_ROSTER: [&str; 3] = ["admin", "developer", "viewer"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Developer,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Scripts,
    Users,
    Logs,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Scripts => "scripts",
            Permission::Users => "users",
            Permission::Logs => "logs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    pub username: String,
    pub role: Role,
    pub permissions: Vec<Permission>,
}

/// Static identity list; credentials are checked upstream.
pub fn roster() -> Vec<User> {
    vec![
        User {
            id: 1,
            username: "admin".into(),
            role: Role::Admin,
            permissions: vec![Permission::Scripts, Permission::Users, Permission::Logs],
        },
        User {
            id: 2,
            username: "developer".into(),
            role: Role::Developer,
            permissions: vec![Permission::Scripts, Permission::Logs],
        },
        User {
            id: 3,
            username: "viewer".into(),
            role: Role::Viewer,
            permissions: vec![Permission::Logs],
        },
    ]
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    user: User,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SessionContext {
    pub fn new(user: User) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            user,
            shutdown_tx: Arc::new(tx),
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn username(&self) -> &str {
        &self.user.username
    }

    pub fn is_admin(&self) -> bool {
        self.user.role == Role::Admin
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.user.permissions.contains(&permission)
    }

    pub fn require(&self, permission: Permission) -> Result<(), ConsoleError> {
        if self.can(permission) {
            Ok(())
        } else {
            Err(ConsoleError::PermissionDenied {
                user: self.user.username.clone(),
                permission: permission.as_str().to_string(),
            })
        }
    }

    /// Receiver that flips to `true` once the session is torn down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Cancel every timer and in-flight request tied to this session.
    pub fn teardown(&self) {
        let _ = self.shutdown_tx.send_replace(true);
    }
}

/// Resolves once `rx` observes teardown. Pending forever if the sender is gone without signalling.
pub async fn closed(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Persists the logged-in identity across invocations.
pub struct SessionStore<'a> {
    kv: &'a dyn KvStore,
}

impl<'a> SessionStore<'a> {
    pub fn new(kv: &'a dyn KvStore) -> Self {
        Self { kv }
    }

    pub fn login(&self, username: &str) -> Result<SessionContext, ConsoleError> {
        let user = roster()
            .into_iter()
            .find(|u| u.username == username)
            .ok_or_else(|| ConsoleError::UnknownUser(username.to_string()))?;
        let raw = serde_json::to_string(&user).map_err(|e| ConsoleError::Store {
            path: SESSION_KEY.into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        self.kv.set(SESSION_KEY, &raw)?;
        tracing::info!(user = %user.username, "logged in");
        Ok(SessionContext::new(user))
    }

    /// Read the persisted identity; a corrupt record is discarded.
    pub fn restore(&self) -> Option<SessionContext> {
        let raw = self.kv.get(SESSION_KEY)?;
        match serde_json::from_str::<User>(&raw) {
            Ok(user) => Some(SessionContext::new(user)),
            Err(e) => {
                tracing::warn!(error = %e, "stored session is unreadable, clearing it");
                let _ = self.kv.remove(SESSION_KEY);
                None
            }
        }
    }

    pub fn logout(&self, session: Option<&SessionContext>) -> Result<(), ConsoleError> {
        if let Some(s) = session {
            s.teardown();
        }
        self.kv.remove(SESSION_KEY)
    }
}
