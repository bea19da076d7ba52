use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{AssistantClient, BatchStatus, RunStatus};

/// Thin pass-through for the conversation operations against a remote
/// thread + assistant pair. One outstanding run at a time; every call
/// blocks until the remote operation settles.
pub struct ChatGateway {
    client: AssistantClient,
    /// Parent directory for scratch copies of uploaded files. Defaults to
    /// the system temp dir; tests point it somewhere observable.
    scratch_parent: Option<PathBuf>,
}

impl ChatGateway {
    pub fn new(client: AssistantClient) -> Self {
        Self {
            client,
            scratch_parent: None,
        }
    }

    pub fn with_scratch_parent(client: AssistantClient, parent: PathBuf) -> Self {
        Self {
            client,
            scratch_parent: Some(parent),
        }
    }

    /// Always creates a fresh remote thread.
    pub async fn create_thread(&self) -> Result<String> {
        let thread = self
            .client
            .create_thread()
            .await
            .context("Failed to create conversation thread")?;
        info!("Created thread {}", thread.id);
        Ok(thread.id)
    }

    /// Append a user message to the thread.
    pub async fn send_message(&self, thread_id: &str, text: &str) -> Result<()> {
        debug!("Appending user message to {}", thread_id);
        self.client
            .create_message(thread_id, text)
            .await
            .context("Failed to send message")?;
        Ok(())
    }

    /// Trigger a run and block until it terminates. Only `completed` yields
    /// response text; any other terminal status is handed back verbatim for
    /// the caller to surface, with no automatic retry.
    pub async fn run(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<(Option<String>, RunStatus)> {
        let run = self
            .client
            .run_and_wait(thread_id, assistant_id)
            .await
            .context("Failed to run assistant")?;

        if run.status != RunStatus::Completed {
            warn!("Run {} ended with status {}", run.id, run.status);
            return Ok((None, run.status));
        }

        let messages = self
            .client
            .list_messages(thread_id)
            .await
            .context("Failed to fetch assistant response")?;
        let text = messages
            .data
            .first()
            .and_then(|message| message.text())
            .map(str::to_string);

        Ok((text, RunStatus::Completed))
    }

    /// Stage the given files in a scratch directory, upload them into the
    /// vector store, and block until ingestion completes. The scratch
    /// copies are removed on every exit path (TempDir drop).
    pub async fn add_files(
        &self,
        vector_store_id: &str,
        files: &[(String, Vec<u8>)],
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let scratch = self
            .scratch_dir()
            .context("Failed to create scratch directory")?;

        let mut staged = Vec::with_capacity(files.len());
        for (name, bytes) in files {
            // Strip any path components the caller handed us.
            let base = std::path::Path::new(name)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let path = scratch.path().join(format!("{}-{}", Uuid::new_v4(), base));
            fs::write(&path, bytes)
                .with_context(|| format!("Failed to stage file: {}", path.display()))?;
            staged.push((base, path));
        }

        let mut payload = Vec::with_capacity(staged.len());
        for (name, path) in &staged {
            let bytes = fs::read(path)
                .with_context(|| format!("Failed to read staged file: {}", path.display()))?;
            payload.push((name.clone(), bytes));
        }

        info!(
            "Uploading {} files to vector store {}",
            payload.len(),
            vector_store_id
        );
        let batch = self
            .client
            .upload_batch_and_wait(vector_store_id, payload)
            .await
            .context("Failed to upload files to vector store")?;

        if batch.status != BatchStatus::Completed {
            anyhow::bail!("File ingestion ended with status {:?}", batch.status);
        }

        Ok(())
    }

    fn scratch_dir(&self) -> std::io::Result<TempDir> {
        match &self.scratch_parent {
            Some(parent) => TempDir::new_in(parent),
            None => TempDir::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn gateway(server: &MockServer, scratch: &std::path::Path) -> ChatGateway {
        let client = AssistantClient::new(server.uri(), "test-key").unwrap();
        ChatGateway::with_scratch_parent(client, scratch.to_path_buf())
    }

    fn scratch_is_empty(parent: &std::path::Path) -> bool {
        fs::read_dir(parent).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_completed_run_returns_newest_message_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads/t1/runs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "run_1", "status": "completed"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/threads/t1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "id": "msg_2", "role": "assistant",
                      "content": [{ "type": "text", "text": { "value": "map it like this" } }] },
                    { "id": "msg_1", "role": "user",
                      "content": [{ "type": "text", "text": { "value": "how?" } }] }
                ]
            })))
            .mount(&server)
            .await;

        let scratch = tempdir().unwrap();
        let gateway = gateway(&server, scratch.path()).await;
        let (text, status) = gateway.run("t1", "asst_1").await.unwrap();

        assert_eq!(status, RunStatus::Completed);
        assert_eq!(text.as_deref(), Some("map it like this"));
    }

    #[tokio::test]
    async fn test_failed_run_reports_status_without_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads/t1/runs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "run_1", "status": "queued"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/threads/t1/runs/run_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "run_1", "status": "failed"
            })))
            .mount(&server)
            .await;

        let scratch = tempdir().unwrap();
        let gateway = gateway(&server, scratch.path()).await;
        let (text, status) = gateway.run("t1", "asst_1").await.unwrap();

        assert_eq!(text, None);
        assert_eq!(status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_add_files_cleans_scratch_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "file_1", "filename": "orders.csv"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/vector_stores/vs_1/file_batches"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "batch_1", "status": "completed"
            })))
            .mount(&server)
            .await;

        let scratch = tempdir().unwrap();
        let gateway = gateway(&server, scratch.path()).await;
        let files = vec![("orders.csv".to_string(), b"a,b\n1,2\n".to_vec())];
        gateway.add_files("vs_1", &files).await.unwrap();

        assert!(scratch_is_empty(scratch.path()));
    }

    #[tokio::test]
    async fn test_add_files_cleans_scratch_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upload exploded"))
            .mount(&server)
            .await;

        let scratch = tempdir().unwrap();
        let gateway = gateway(&server, scratch.path()).await;
        let files = vec![("orders.csv".to_string(), b"a,b\n1,2\n".to_vec())];
        let result = gateway.add_files("vs_1", &files).await;

        assert!(result.is_err());
        assert!(scratch_is_empty(scratch.path()));
    }
}
