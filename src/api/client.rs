use super::{
    CategoriesEnvelope, FilesEnvelope, LogRecord, LogsEnvelope, MessageEnvelope, RunReply,
    RunRequest, RunResponse, ScriptApi, ScriptsEnvelope,
};
use crate::error::ApiError;
use crate::model::{ConsoleConfig, FileDescriptor, Script, ScriptCategory, ScriptId, ScriptLogs};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// reqwest-backed client for the script execution service.
#[derive(Clone)]
pub struct HttpScriptApi {
    http: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl HttpScriptApi {
    pub fn new(cfg: &ConsoleConfig) -> Result<Self, ApiError> {
        let mut base_url = Url::parse(&cfg.base_url)
            .map_err(|e| ApiError::Url(format!("{}: {e}", cfg.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Url(cfg.base_url.clone()));
        }
        // Keep a trailing slash so segments are appended, not substituted.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(|e| ApiError::transport(cfg.base_url.clone(), e))?;

        Ok(Self {
            http,
            base_url,
            request_timeout: cfg.request_timeout,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, endpoint: &Url, req: RequestBuilder) -> Result<Response, ApiError> {
        tracing::debug!(url = %endpoint, "sending request");
        req.send()
            .await
            .map_err(|e| ApiError::transport(endpoint.path(), e))
    }

    async fn decode<T: DeserializeOwned>(endpoint: &Url, resp: Response) -> Result<T, ApiError> {
        let resp = Self::check(endpoint, resp).await?;
        resp.json::<T>().await.map_err(|e| ApiError::Decode {
            endpoint: endpoint.path().to_string(),
            message: e.to_string(),
        })
    }

    async fn check(endpoint: &Url, resp: Response) -> Result<Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp
            .json::<MessageEnvelope>()
            .await
            .ok()
            .and_then(MessageEnvelope::into_message);
        Err(ApiError::Status {
            endpoint: endpoint.path().to_string(),
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ScriptApi for HttpScriptApi {
    async fn list_scripts(&self) -> Result<Vec<Script>, ApiError> {
        let url = self.endpoint(&["api", "scripts"])?;
        let resp = self
            .send(&url, self.http.get(url.clone()).timeout(self.request_timeout))
            .await?;
        let env: ScriptsEnvelope = Self::decode(&url, resp).await?;
        Ok(env.scripts)
    }

    async fn list_categories(&self) -> Result<Vec<ScriptCategory>, ApiError> {
        let url = self.endpoint(&["api", "categories"])?;
        let resp = self
            .send(&url, self.http.get(url.clone()).timeout(self.request_timeout))
            .await?;
        let env: CategoriesEnvelope = Self::decode(&url, resp).await?;
        Ok(env.categories)
    }

    async fn run_script(
        &self,
        script_id: ScriptId,
        req: &RunRequest,
    ) -> Result<RunReply, ApiError> {
        let id = script_id.to_string();
        let url = self.endpoint(&["api", "scripts", &id, "run"])?;
        // No per-request timeout here: the orchestrator bounds the whole run.
        let resp = self.send(&url, self.http.post(url.clone()).json(req)).await?;
        let http_status = resp.status().as_u16();
        let body = resp.json::<RunResponse>().await.unwrap_or_else(|e| {
            tracing::debug!(script_id, http_status, error = %e, "run response body was not JSON");
            RunResponse::default()
        });
        Ok(RunReply { http_status, body })
    }

    async fn stop_script(&self, script_id: ScriptId, user_id: &str) -> Result<(), ApiError> {
        let id = script_id.to_string();
        let mut url = self.endpoint(&["api", "scripts", &id, "stop"])?;
        // The service reads user_id from the query string; the body carries it too.
        url.query_pairs_mut().append_pair("user_id", user_id);
        let body = serde_json::json!({ "user_id": user_id });
        let resp = self
            .send(
                &url,
                self.http
                    .post(url.clone())
                    .json(&body)
                    .timeout(self.request_timeout),
            )
            .await?;
        Self::check(&url, resp).await?;
        Ok(())
    }

    async fn fetch_logs(&self, username: &str, hours: u32) -> Result<ScriptLogs, ApiError> {
        let mut url = self.endpoint(&["api", "logs", username])?;
        url.query_pairs_mut()
            .append_pair("hours", &hours.to_string());
        let resp = self
            .send(&url, self.http.get(url.clone()).timeout(self.request_timeout))
            .await?;
        let env: LogsEnvelope = Self::decode(&url, resp).await?;
        Ok(env.logs)
    }

    async fn append_log(&self, username: &str, record: &LogRecord) -> Result<(), ApiError> {
        let url = self.endpoint(&["api", "logs", username])?;
        let resp = self
            .send(
                &url,
                self.http
                    .post(url.clone())
                    .json(record)
                    .timeout(self.request_timeout),
            )
            .await?;
        Self::check(&url, resp).await?;
        Ok(())
    }

    async fn list_files(
        &self,
        username: &str,
        script_id: ScriptId,
    ) -> Result<Vec<FileDescriptor>, ApiError> {
        let mut url = self.endpoint(&["api", "files", username])?;
        url.query_pairs_mut()
            .append_pair("script_id", &script_id.to_string());
        let resp = self
            .send(&url, self.http.get(url.clone()).timeout(self.request_timeout))
            .await?;
        let env: FilesEnvelope = Self::decode(&url, resp).await?;
        Ok(env.files)
    }

    async fn download_file(&self, username: &str, file_path: &str) -> Result<Bytes, ApiError> {
        let mut url = self.endpoint(&["api", "files", username, "download"])?;
        url.query_pairs_mut().append_pair("file_path", file_path);
        let resp = self.send(&url, self.http.get(url.clone())).await?;
        let resp = Self::check(&url, resp).await?;
        resp.bytes()
            .await
            .map_err(|e| ApiError::transport(url.path(), e))
    }

    async fn reload_config(&self) -> Result<String, ApiError> {
        let url = self.endpoint(&["api", "reload-config"])?;
        let resp = self
            .send(&url, self.http.post(url.clone()).timeout(self.request_timeout))
            .await?;
        let env: MessageEnvelope = Self::decode(&url, resp).await?;
        Ok(env
            .into_message()
            .unwrap_or_else(|| "Configuration reloaded".to_string()))
    }
}
