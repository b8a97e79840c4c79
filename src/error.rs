use crate::model::ScriptId;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("{endpoint} returned HTTP {status}{}", message_suffix(.message))]
    Status {
        endpoint: String,
        status: u16,
        message: Option<String>,
    },
    #[error("unable to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
    #[error("invalid service URL: {0}")]
    Url(String),
}

fn message_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

impl ApiError {
    pub fn transport(
        endpoint: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        ApiError::Transport {
            endpoint: endpoint.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("not logged in; run `scriptdeck login <user>` first")]
    NotLoggedIn,
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("user {user} lacks the '{permission}' permission")]
    PermissionDenied { user: String, permission: String },
    #[error("script {0} is not in the catalog")]
    UnknownScript(ScriptId),
    #[error("cannot run script {script_id}: {reason}")]
    RunRejected {
        script_id: ScriptId,
        reason: crate::orchestrator::RunRejected,
    },
    #[error("file poller needs a user and a non-empty script catalog")]
    PollerNotReady,
    #[error("preference store at {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_includes_remote_message() {
        let e = ApiError::Status {
            endpoint: "/api/scripts/4/run".into(),
            status: 404,
            message: Some("Script not found".into()),
        };
        assert_eq!(
            e.to_string(),
            "/api/scripts/4/run returned HTTP 404: Script not found"
        );
    }

    #[test]
    fn status_error_without_message() {
        let e = ApiError::Status {
            endpoint: "/api/logs/admin".into(),
            status: 500,
            message: None,
        };
        assert_eq!(e.to_string(), "/api/logs/admin returned HTTP 500");
    }
}
