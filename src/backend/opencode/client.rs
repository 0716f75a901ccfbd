//! HTTP client for a running OpenCode server

use super::types::{
    CreateSessionBody, HealthResponse, MessageEnvelope, PromptBody, QuestionReplyBody,
    QuestionRequest, SessionInfo,
};
use crate::error::{RemoteError, Result};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::path::Path;
use std::time::Duration;

/// Header scoping a request to a project directory.
const DIRECTORY_HEADER: &str = "x-opencode-directory";

/// Timeout for health probes, independent of the request timeout.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OpenCodeClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenCodeClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if !request_timeout.is_zero() {
            builder = builder.timeout(request_timeout);
        }
        Ok(Self {
            http: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn scoped(&self, request: RequestBuilder, directory: &Path) -> RequestBuilder {
        request.header(DIRECTORY_HEADER, directory.to_string_lossy().as_ref())
    }

    async fn check(response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Protocol(format!(
            "{} failed with HTTP {}: {}",
            what,
            status.as_u16(),
            body.chars().take(200).collect::<String>()
        )))
    }

    /// `GET /global/health`
    pub async fn health(&self) -> bool {
        let response = self
            .http
            .get(self.url("/global/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => r
                .json::<HealthResponse>()
                .await
                .map(|h| h.healthy)
                .unwrap_or(false),
            _ => false,
        }
    }

    pub async fn create_session(&self, directory: &Path, title: &str) -> Result<String> {
        let request = self
            .http
            .post(self.url("/session"))
            .json(&CreateSessionBody { title });
        let response = Self::check(self.scoped(request, directory).send().await?, "create session").await?;
        let info: SessionInfo = response.json().await?;
        tracing::debug!(session_id = %info.id, "OpenCode session created");
        Ok(info.id)
    }

    /// `GET /session/{id}`; `None` when the server no longer knows it
    pub async fn get_session(&self, directory: &Path, session_id: &str) -> Result<Option<SessionInfo>> {
        let request = self.http.get(self.url(&format!("/session/{}", session_id)));
        let response = self.scoped(request, directory).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, "get session").await?;
        Ok(Some(response.json().await?))
    }

    /// `POST /session/{id}/prompt_async`; returns once the prompt is queued
    pub async fn prompt_async(&self, directory: &Path, session_id: &str, body: &PromptBody) -> Result<()> {
        let request = self
            .http
            .post(self.url(&format!("/session/{}/prompt_async", session_id)))
            .json(body);
        Self::check(self.scoped(request, directory).send().await?, "prompt").await?;
        Ok(())
    }

    pub async fn list_messages(&self, directory: &Path, session_id: &str) -> Result<Vec<MessageEnvelope>> {
        let request = self
            .http
            .get(self.url(&format!("/session/{}/message", session_id)));
        let response = Self::check(self.scoped(request, directory).send().await?, "list messages").await?;
        Ok(response.json().await?)
    }

    /// `GET /question`, optionally scoped with the `directory` query parameter
    pub async fn list_questions(&self, directory: Option<&Path>) -> Result<Vec<QuestionRequest>> {
        let mut request = self.http.get(self.url("/question"));
        if let Some(dir) = directory {
            request = request.query(&[("directory", dir.to_string_lossy().as_ref())]);
        }
        let response = Self::check(request.send().await?, "list questions").await?;
        Ok(response.json().await?)
    }

    pub async fn reply_question(
        &self,
        directory: &Path,
        question_id: &str,
        answers: Vec<Vec<String>>,
    ) -> Result<()> {
        let request = self
            .http
            .post(self.url(&format!("/question/{}/reply", question_id)))
            .query(&[("directory", directory.to_string_lossy().as_ref())])
            .json(&QuestionReplyBody { answers });
        Self::check(request.send().await?, "reply to question").await?;
        Ok(())
    }

    pub async fn abort(&self, directory: &Path, session_id: &str) -> Result<()> {
        let request = self
            .http
            .post(self.url(&format!("/session/{}/abort", session_id)));
        Self::check(self.scoped(request, directory).send().await?, "abort").await?;
        Ok(())
    }
}
