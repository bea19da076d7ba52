use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Polling cadence shared by the run-completion and batch-indexing waits.
/// The cap is a hang guard, not a contract; the remote service enforces its
/// own timeouts.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const POLL_MAX_ATTEMPTS: u32 = 300;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("service error ({status}): {body}")]
    Api { status: StatusCode, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{action} still not terminal after {attempts} polls")]
    Timeout { action: &'static str, attempts: u32 },
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct VectorStore {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileObject {
    pub id: String,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Vector store file batch. `completed` means every file is indexed.
#[derive(Debug, Clone, Deserialize)]
pub struct FileBatch {
    pub id: String,
    pub status: BatchStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::InProgress)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Assistant {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thread {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: Vec<MessagePart>,
}

impl ThreadMessage {
    /// First text part of the message, if any.
    pub fn text(&self) -> Option<&str> {
        self.content
            .iter()
            .find_map(|part| part.text.as_ref().map(|t| t.value.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<MessageText>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageText {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageList {
    pub data: Vec<ThreadMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
}

/// Run lifecycle: `queued → in_progress → terminal`. Only `completed`
/// carries a response; the other terminal states are reported to the user
/// verbatim and never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
    RequiresAction,
    Incomplete,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Incomplete => "incomplete",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for assistant creation. The retrieval tool is always bound to
/// the given vector store.
#[derive(Debug, Clone)]
pub struct CreateAssistant {
    pub name: String,
    pub instructions: String,
    pub model: String,
    pub vector_store_id: String,
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client for the hosted assistant/vector-store service.
#[derive(Clone)]
pub struct AssistantClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl AssistantClient {
    pub fn new(base_url: impl Into<String>, api_key: &str) -> ServiceResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|_| ServiceError::InvalidApiKey)?,
        );
        headers.insert("OpenAI-Beta", HeaderValue::from_static("assistants=v2"));

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> ServiceResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            Err(ServiceError::NotFound(body))
        } else {
            Err(ServiceError::Api { status, body })
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> ServiceResult<T> {
        let response = self.http_client.get(self.url(path)).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> ServiceResult<T> {
        let response = self
            .http_client
            .post(self.url(path))
            .json(payload)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn delete(&self, path: &str) -> ServiceResult<()> {
        let response = self.http_client.delete(self.url(path)).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Vector stores and files
    // ------------------------------------------------------------------

    pub async fn create_vector_store(&self, name: &str) -> ServiceResult<VectorStore> {
        debug!("Creating vector store '{}'", name);
        self.post_json("/vector_stores", &serde_json::json!({ "name": name }))
            .await
    }

    pub async fn retrieve_vector_store(&self, id: &str) -> ServiceResult<VectorStore> {
        self.get_json(&format!("/vector_stores/{}", id)).await
    }

    pub async fn delete_vector_store(&self, id: &str) -> ServiceResult<()> {
        debug!("Deleting vector store {}", id);
        self.delete(&format!("/vector_stores/{}", id)).await
    }

    /// Upload one file for assistant use. Content type is left to the
    /// service to sniff from the filename.
    pub async fn upload_file(&self, filename: &str, bytes: Vec<u8>) -> ServiceResult<FileObject> {
        debug!("Uploading file '{}' ({} bytes)", filename, bytes.len());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);

        let response = self
            .http_client
            .post(self.url("/files"))
            .multipart(form)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn create_file_batch(
        &self,
        vector_store_id: &str,
        file_ids: &[String],
    ) -> ServiceResult<FileBatch> {
        self.post_json(
            &format!("/vector_stores/{}/file_batches", vector_store_id),
            &serde_json::json!({ "file_ids": file_ids }),
        )
        .await
    }

    pub async fn retrieve_file_batch(
        &self,
        vector_store_id: &str,
        batch_id: &str,
    ) -> ServiceResult<FileBatch> {
        self.get_json(&format!(
            "/vector_stores/{}/file_batches/{}",
            vector_store_id, batch_id
        ))
        .await
    }

    /// Upload files into a vector store and block until the batch reaches a
    /// terminal indexing state.
    pub async fn upload_batch_and_wait(
        &self,
        vector_store_id: &str,
        files: Vec<(String, Vec<u8>)>,
    ) -> ServiceResult<FileBatch> {
        let mut file_ids = Vec::with_capacity(files.len());
        for (filename, bytes) in files {
            let file = self.upload_file(&filename, bytes).await?;
            file_ids.push(file.id);
        }

        let batch = self.create_file_batch(vector_store_id, &file_ids).await?;
        if batch.status.is_terminal() {
            return Ok(batch);
        }

        let batch_id = batch.id.clone();
        poll_until(
            "file batch indexing",
            POLL_MAX_ATTEMPTS,
            POLL_INTERVAL,
            || self.retrieve_file_batch(vector_store_id, &batch_id),
            |batch: &FileBatch| batch.status.is_terminal(),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Assistants
    // ------------------------------------------------------------------

    pub async fn create_assistant(&self, params: &CreateAssistant) -> ServiceResult<Assistant> {
        debug!("Creating assistant '{}'", params.name);
        self.post_json(
            "/assistants",
            &serde_json::json!({
                "name": params.name,
                "instructions": params.instructions,
                "model": params.model,
                "tools": [{ "type": "file_search" }],
                "tool_resources": {
                    "file_search": { "vector_store_ids": [params.vector_store_id] }
                },
            }),
        )
        .await
    }

    pub async fn retrieve_assistant(&self, id: &str) -> ServiceResult<Assistant> {
        self.get_json(&format!("/assistants/{}", id)).await
    }

    pub async fn delete_assistant(&self, id: &str) -> ServiceResult<()> {
        debug!("Deleting assistant {}", id);
        self.delete(&format!("/assistants/{}", id)).await
    }

    // ------------------------------------------------------------------
    // Threads, messages, runs
    // ------------------------------------------------------------------

    pub async fn create_thread(&self) -> ServiceResult<Thread> {
        self.post_json("/threads", &serde_json::json!({})).await
    }

    pub async fn create_message(&self, thread_id: &str, text: &str) -> ServiceResult<ThreadMessage> {
        self.post_json(
            &format!("/threads/{}/messages", thread_id),
            &serde_json::json!({ "role": "user", "content": text }),
        )
        .await
    }

    /// Messages newest-first, as the service returns them.
    pub async fn list_messages(&self, thread_id: &str) -> ServiceResult<MessageList> {
        self.get_json(&format!("/threads/{}/messages", thread_id))
            .await
    }

    pub async fn create_run(&self, thread_id: &str, assistant_id: &str) -> ServiceResult<Run> {
        self.post_json(
            &format!("/threads/{}/runs", thread_id),
            &serde_json::json!({ "assistant_id": assistant_id }),
        )
        .await
    }

    pub async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> ServiceResult<Run> {
        self.get_json(&format!("/threads/{}/runs/{}", thread_id, run_id))
            .await
    }

    /// Start a run and block until it reaches a terminal state.
    pub async fn run_and_wait(&self, thread_id: &str, assistant_id: &str) -> ServiceResult<Run> {
        let run = self.create_run(thread_id, assistant_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let run_id = run.id.clone();
        poll_until(
            "assistant run",
            POLL_MAX_ATTEMPTS,
            POLL_INTERVAL,
            || self.retrieve_run(thread_id, &run_id),
            |run: &Run| run.status.is_terminal(),
        )
        .await
    }
}

/// Bounded-interval polling loop. Fetches until `is_terminal` holds or the
/// attempt cap is hit, in which case a typed timeout error comes back.
pub async fn poll_until<T, Fut, F, P>(
    action: &'static str,
    max_attempts: u32,
    interval: Duration,
    mut fetch: F,
    is_terminal: P,
) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
    P: Fn(&T) -> bool,
{
    for attempt in 0..max_attempts {
        if attempt > 0 {
            tokio::time::sleep(interval).await;
        }
        let value = fetch().await?;
        if is_terminal(&value) {
            return Ok(value);
        }
    }
    Err(ServiceError::Timeout {
        action,
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_wire_names() {
        let status: RunStatus = serde_json::from_str("\"requires_action\"").unwrap();
        assert_eq!(status, RunStatus::RequiresAction);
        assert_eq!(status.to_string(), "requires_action");
        assert!(status.is_terminal());

        let status: RunStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert!(!status.is_terminal());
    }

    #[test]
    fn test_message_text_extraction() {
        let message: ThreadMessage = serde_json::from_value(serde_json::json!({
            "id": "msg_1",
            "role": "assistant",
            "content": [
                { "type": "image_file" },
                { "type": "text", "text": { "value": "hello" } }
            ]
        }))
        .unwrap();
        assert_eq!(message.text(), Some("hello"));
    }

    #[tokio::test]
    async fn test_poll_until_caps_attempts() {
        let result: ServiceResult<u32> = poll_until(
            "test wait",
            3,
            Duration::from_millis(1),
            || async { Ok(1u32) },
            |_| false,
        )
        .await;

        match result {
            Err(ServiceError::Timeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_poll_until_stops_on_terminal() {
        let mut calls = 0;
        let result = poll_until(
            "test wait",
            10,
            Duration::from_millis(1),
            || {
                calls += 1;
                let current = calls;
                async move { Ok(current) }
            },
            |n: &u32| *n >= 2,
        )
        .await
        .unwrap();
        assert_eq!(result, 2);
    }
}
