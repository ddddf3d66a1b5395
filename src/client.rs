//! HTTP client for Haiku Studio actions.
//!
//! Every action maps to one request. A successful response only means the
//! server accepted the job; its result arrives later on the push channel, so
//! response bodies are never read into project state.

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use studio_core::{Action, ProjectId};

/// Default URL for local development.
pub const DEFAULT_URL: &str = "http://localhost:8000";

/// HTTP client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Server error: {0}")]
    Server(String),
}

#[derive(Debug, Deserialize)]
struct CreatedProject {
    project_id: ProjectId,
}

/// Sends action requests for a project.
///
/// Implemented by [`StudioClient`]; the session only depends on this so it
/// can be driven without a server.
pub trait Dispatcher: Send + Sync + 'static {
    fn submit(
        &self,
        project_id: ProjectId,
        action: Action,
    ) -> BoxFuture<'static, Result<(), ClientError>>;
}

/// HTTP client for the Haiku Studio API.
#[derive(Debug, Clone)]
pub struct StudioClient {
    base_url: String,
    client: Client,
}

impl StudioClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    /// Client for a local development server.
    pub fn localhost() -> Self {
        Self::new(DEFAULT_URL)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client.request(method, &url)
    }

    /// Handle response, converting HTTP errors to ClientError.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            Err(error_for(status, response).await)
        }
    }

    /// Handle a response whose body is only an acknowledgement.
    async fn handle_ack(&self, response: reqwest::Response) -> Result<(), ClientError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(error_for(status, response).await)
        }
    }

    // ============================================================
    // Project Operations
    // ============================================================

    /// Create a project and return its id.
    pub async fn create_project(
        &self,
        name: &str,
        purpose: &str,
    ) -> Result<ProjectId, ClientError> {
        let response = self
            .request(Method::POST, "/projects")
            .json(&serde_json::json!({
                "name": name,
                "purpose": purpose
            }))
            .send()
            .await?;
        let created: CreatedProject = self.handle_response(response).await?;
        Ok(created.project_id)
    }

    // ============================================================
    // Job Operations
    // ============================================================

    /// Send the request that starts `action` on the server.
    pub async fn send_action(
        &self,
        project_id: &ProjectId,
        action: &Action,
    ) -> Result<(), ClientError> {
        let builder = match action {
            Action::CreateHaiku { description } => self
                .request(Method::POST, &format!("/projects/{}/haikus", project_id))
                .json(&serde_json::json!({ "description": description })),
            Action::RequestPrompts {
                haiku_id,
                directions,
            } => self
                .request(
                    Method::POST,
                    &format!("/projects/{}/haikus/{}/image_prompts", project_id, haiku_id),
                )
                .json(&serde_json::json!({ "directions": directions })),
            Action::GenerateImage {
                prompt_id,
                haiku_id,
            } => self
                .request(
                    Method::POST,
                    &format!("/projects/{}/image_prompts/{}/images", project_id, prompt_id),
                )
                .json(&serde_json::json!({ "haiku_id": haiku_id })),
            Action::EditPrompt { prompt_id, text } => self
                .request(
                    Method::PUT,
                    &format!("/projects/{}/image_prompts/{}", project_id, prompt_id),
                )
                .json(&serde_json::json!({ "text": text })),
            Action::Critique { haiku_id } => self.request(
                Method::POST,
                &format!("/projects/{}/haikus/{}/critiques", project_id, haiku_id),
            ),
        };

        tracing::debug!("Sending {} for project {}", action.kind(), project_id);
        let response = builder.send().await?;
        self.handle_ack(response).await
    }
}

impl Dispatcher for StudioClient {
    fn submit(
        &self,
        project_id: ProjectId,
        action: Action,
    ) -> BoxFuture<'static, Result<(), ClientError>> {
        let client = self.clone();
        async move { client.send_action(&project_id, &action).await }.boxed()
    }
}

async fn error_for(status: StatusCode, response: reqwest::Response) -> ClientError {
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => ClientError::NotFound(body),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ClientError::BadRequest(body),
        StatusCode::UNAUTHORIZED => ClientError::Unauthorized,
        _ => ClientError::Server(format!("{}: {}", status, body)),
    }
}
