use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::client::{AssistantClient, CreateAssistant, ServiceError};
use crate::persistence::{
    clear_config, config_exists, epoch_now, load_config, save_config, AssistantConfig,
};

pub const VECTOR_STORE_NAME: &str = "API Mapping Assistant Knowledge Base";
pub const ASSISTANT_NAME: &str = "API Mapping Assistant";
pub const KNOWLEDGE_BASE_DIR: &str = "knowledge_base";
pub const PROMPT_FILE: &str = "system-prompt.txt";

/// Extensions eligible for ingestion. No sub-directory recursion.
const KNOWLEDGE_BASE_EXTENSIONS: [&str; 3] = ["md", "txt", "pdf"];

const FALLBACK_INSTRUCTIONS: &str = "You are an expert API mapping assistant specializing in compliance screening APIs.

Your primary role is to:
1. Help users understand how to map their business data to compliance screening API endpoints
2. Provide guidance on data transformation and field mapping
3. Answer questions about API integration and best practices
4. Explain compliance screening concepts and requirements

You have access to comprehensive knowledge base documentation about the compliance screening APIs. Use this knowledge to provide accurate, detailed guidance.

When users upload their business data files, analyze them and provide specific mapping recommendations. Always be helpful, accurate, and provide practical implementation guidance.";

/// Unrecoverable setup failure. The caller halts instead of partially
/// proceeding.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("knowledge base directory not found: {0}")]
    MissingKnowledgeBase(PathBuf),
    #[error("failed to read knowledge base file {path}: {source}")]
    KnowledgeBaseRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove config file: {0}")]
    ConfigRemove(std::io::Error),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// How a resource was obtained during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Retrieved,
    Created,
}

/// Composite outcome of `ensure_ready`, used only for progress wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyStatus {
    Retrieved,
    Created,
    Mixed,
}

impl ReadyStatus {
    /// Compose the per-resource outcomes into the progress wording:
    /// `mixed` means one resource was reused while the other was recreated.
    pub fn from_parts(vector_store: Provisioned, assistant: Provisioned) -> Self {
        match (vector_store, assistant) {
            (Provisioned::Retrieved, Provisioned::Retrieved) => ReadyStatus::Retrieved,
            (Provisioned::Created, Provisioned::Created) => ReadyStatus::Created,
            _ => ReadyStatus::Mixed,
        }
    }
}

/// Resources available after a successful `ensure_ready`.
#[derive(Debug, Clone)]
pub struct ReadyResources {
    pub vector_store_id: String,
    pub assistant_id: String,
    pub status: ReadyStatus,
}

/// Snapshot of the persisted state for the status display.
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub vector_store_active: bool,
    pub assistant_active: bool,
    pub config: AssistantConfig,
}

impl SystemStatus {
    pub fn has_config(&self) -> bool {
        self.vector_store_active || self.assistant_active
    }
}

/// Keeps the persisted config and the remote service consistent: ids that
/// still resolve are reused, stale ids are dropped and the resource is
/// recreated.
pub struct ResourceReconciler {
    client: AssistantClient,
    model: String,
    /// Overrides the application root for config file, knowledge base and
    /// prompt lookups.
    root: Option<PathBuf>,
}

impl ResourceReconciler {
    pub fn new(client: AssistantClient, model: String) -> Self {
        Self {
            client,
            model,
            root: None,
        }
    }

    pub fn with_root(client: AssistantClient, model: String, root: PathBuf) -> Self {
        Self {
            client,
            model,
            root: Some(root),
        }
    }

    fn root_dir(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn resolve(&self, name: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Eligible knowledge-base files, sorted by name. Errors if the
    /// directory itself is missing (configuration error, fatal).
    pub fn knowledge_base_files(&self) -> Result<Vec<PathBuf>, InitError> {
        let dir = self.resolve(KNOWLEDGE_BASE_DIR);
        if !dir.is_dir() {
            return Err(InitError::MissingKnowledgeBase(dir));
        }

        let entries = fs::read_dir(&dir).map_err(|source| InitError::KnowledgeBaseRead {
            path: dir.clone(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| InitError::KnowledgeBaseRead {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let eligible = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    KNOWLEDGE_BASE_EXTENSIONS
                        .iter()
                        .any(|known| ext.eq_ignore_ascii_case(known))
                })
                .unwrap_or(false);
            if eligible {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    /// Assistant instructions: the prompt file when present, otherwise the
    /// built-in fallback.
    pub fn instructions(&self) -> String {
        let path = self.resolve(PROMPT_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => text.trim().to_string(),
            Err(_) => FALLBACK_INSTRUCTIONS.to_string(),
        }
    }

    /// Reuse the persisted vector store if it still resolves remotely,
    /// otherwise create one and ingest the knowledge base.
    pub async fn ensure_vector_store(&self) -> Result<(String, Provisioned), InitError> {
        let mut config = load_config(self.root_dir());

        if let Some(id) = config.vector_store_id.clone() {
            match self.client.retrieve_vector_store(&id).await {
                Ok(store) => {
                    info!("Reusing vector store {}", store.id);
                    return Ok((store.id, Provisioned::Retrieved));
                }
                Err(e) => {
                    warn!("Previous vector store no longer resolves: {}", e);
                    config.vector_store_id = None;
                    save_config(&config, self.root_dir());
                }
            }
        }

        let files = self.knowledge_base_files()?;
        let store = self.client.create_vector_store(VECTOR_STORE_NAME).await?;
        info!(
            "Created vector store {}, ingesting {} knowledge base files",
            store.id,
            files.len()
        );

        if !files.is_empty() {
            let mut payload = Vec::with_capacity(files.len());
            for path in &files {
                let bytes = fs::read(path).map_err(|source| InitError::KnowledgeBaseRead {
                    path: path.clone(),
                    source,
                })?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "file".to_string());
                payload.push((name, bytes));
            }
            self.client.upload_batch_and_wait(&store.id, payload).await?;
        }

        config.vector_store_id = Some(store.id.clone());
        config.created_at = Some(epoch_now());
        config.knowledge_base_files = Some(files.len() as u32);
        save_config(&config, self.root_dir());

        Ok((store.id, Provisioned::Created))
    }

    /// Reuse the persisted assistant if it still resolves remotely,
    /// otherwise create one bound to the given vector store.
    pub async fn ensure_assistant(
        &self,
        vector_store_id: &str,
    ) -> Result<(String, Provisioned), InitError> {
        let mut config = load_config(self.root_dir());

        if let Some(id) = config.assistant_id.clone() {
            match self.client.retrieve_assistant(&id).await {
                Ok(assistant) => {
                    info!("Reusing assistant {}", assistant.id);
                    return Ok((assistant.id, Provisioned::Retrieved));
                }
                Err(e) => {
                    warn!("Previous assistant no longer resolves: {}", e);
                    config.assistant_id = None;
                    save_config(&config, self.root_dir());
                }
            }
        }

        let assistant = self
            .client
            .create_assistant(&CreateAssistant {
                name: ASSISTANT_NAME.to_string(),
                instructions: self.instructions(),
                model: self.model.clone(),
                vector_store_id: vector_store_id.to_string(),
            })
            .await?;
        info!("Created assistant {}", assistant.id);

        config.assistant_id = Some(assistant.id.clone());
        save_config(&config, self.root_dir());

        Ok((assistant.id, Provisioned::Created))
    }

    /// Verify-or-create both resources. Idempotent against a healthy
    /// backend: a second call returns the same ids without creating
    /// anything.
    pub async fn ensure_ready(&self) -> Result<ReadyResources, InitError> {
        let (vector_store_id, vs_status) = self.ensure_vector_store().await?;
        let (assistant_id, asst_status) = self.ensure_assistant(&vector_store_id).await?;

        Ok(ReadyResources {
            vector_store_id,
            assistant_id,
            status: ReadyStatus::from_parts(vs_status, asst_status),
        })
    }

    /// Delete the remote resources (best effort, per-resource outcome) and
    /// remove the local config file. A following `ensure_ready` starts
    /// from scratch.
    pub async fn reset(&self) -> Result<Vec<(&'static str, String)>, InitError> {
        let config = load_config(self.root_dir());
        let mut results = Vec::new();

        if let Some(id) = &config.vector_store_id {
            match self.client.delete_vector_store(id).await {
                Ok(()) => results.push(("vector_store", "deleted".to_string())),
                Err(e) => results.push(("vector_store", format!("error: {}", e))),
            }
        }

        if let Some(id) = &config.assistant_id {
            match self.client.delete_assistant(id).await {
                Ok(()) => results.push(("assistant", "deleted".to_string())),
                Err(e) => results.push(("assistant", format!("error: {}", e))),
            }
        }

        if config_exists(self.root_dir()) {
            clear_config(self.root_dir()).map_err(InitError::ConfigRemove)?;
            results.push(("config_file", "removed".to_string()));
        }

        Ok(results)
    }

    pub fn status(&self) -> SystemStatus {
        let config = load_config(self.root_dir());
        SystemStatus {
            vector_store_active: config.vector_store_id.is_some(),
            assistant_active: config.assistant_id.is_some(),
            config,
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

    fn reconciler(server: &MockServer, root: &Path) -> ResourceReconciler {
        let client = AssistantClient::new(server.uri(), "test-key").unwrap();
        ResourceReconciler::with_root(client, "test-model".to_string(), root.to_path_buf())
    }

    fn seed_knowledge_base(root: &Path) {
        let kb = root.join(KNOWLEDGE_BASE_DIR);
        fs::create_dir_all(&kb).unwrap();
        fs::write(kb.join("endpoints.md"), "# endpoints").unwrap();
        fs::write(kb.join("fields.txt"), "fields").unwrap();
        fs::write(kb.join("notes.py"), "ignored").unwrap();
    }

    async fn mount_vector_store_creation_mocks(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/vector_stores"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "vs_new", "name": VECTOR_STORE_NAME
            })))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "file_1", "filename": "endpoints.md"
            })))
            .expect(2)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/vector_stores/vs_new/file_batches"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "batch_1", "status": "completed"
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn mount_creation_mocks(server: &MockServer) {
        mount_vector_store_creation_mocks(server).await;
        Mock::given(method("POST"))
            .and(path("/assistants"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "asst_new", "name": ASSISTANT_NAME
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_empty_config_creates_everything() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        seed_knowledge_base(root);

        let server = MockServer::start().await;
        mount_creation_mocks(&server).await;

        let reconciler = reconciler(&server, root);
        let ready = reconciler.ensure_ready().await.unwrap();

        assert_eq!(ready.vector_store_id, "vs_new");
        assert_eq!(ready.assistant_id, "asst_new");
        assert_eq!(ready.status, ReadyStatus::Created);

        let config = load_config(Some(root));
        assert_eq!(config.vector_store_id.as_deref(), Some("vs_new"));
        assert_eq!(config.assistant_id.as_deref(), Some("asst_new"));
        // Only the .md and .txt files count; the .py file is ineligible.
        assert_eq!(config.knowledge_base_files, Some(2));
        assert!(config.created_at.is_some());
    }

    #[tokio::test]
    async fn test_ensure_ready_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        seed_knowledge_base(root);

        let server = MockServer::start().await;
        mount_creation_mocks(&server).await;
        // Creation mocks expect exactly one hit each; the second pass must
        // go through retrieval only.
        Mock::given(method("GET"))
            .and(path("/vector_stores/vs_new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "vs_new", "name": VECTOR_STORE_NAME
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/assistants/asst_new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "asst_new", "name": ASSISTANT_NAME
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reconciler = reconciler(&server, root);
        let first = reconciler.ensure_ready().await.unwrap();
        let second = reconciler.ensure_ready().await.unwrap();

        assert_eq!(first.vector_store_id, second.vector_store_id);
        assert_eq!(first.assistant_id, second.assistant_id);
        assert_eq!(second.status, ReadyStatus::Retrieved);
    }

    #[tokio::test]
    async fn test_stale_vector_store_id_is_recovered() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        seed_knowledge_base(root);

        save_config(
            &AssistantConfig {
                vector_store_id: Some("vs_stale".to_string()),
                ..Default::default()
            },
            Some(root),
        );

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vector_stores/vs_stale"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "message": "No vector store found" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_vector_store_creation_mocks(&server).await;

        let reconciler = reconciler(&server, root);
        let (id, status) = reconciler.ensure_vector_store().await.unwrap();

        assert_eq!(id, "vs_new");
        assert_eq!(status, Provisioned::Created);
        let config = load_config(Some(root));
        assert_eq!(config.vector_store_id.as_deref(), Some("vs_new"));
    }

    #[tokio::test]
    async fn test_missing_knowledge_base_is_fatal() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();

        let server = MockServer::start().await;
        let reconciler = reconciler(&server, root);

        match reconciler.ensure_vector_store().await {
            Err(InitError::MissingKnowledgeBase(path)) => {
                assert!(path.ends_with(KNOWLEDGE_BASE_DIR));
            }
            other => panic!("expected missing knowledge base, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_reset_deletes_remote_and_local_state() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        seed_knowledge_base(root);

        save_config(
            &AssistantConfig {
                vector_store_id: Some("vs_1".to_string()),
                assistant_id: Some("asst_1".to_string()),
                created_at: Some(epoch_now()),
                knowledge_base_files: Some(2),
            },
            Some(root),
        );

        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/vector_stores/vs_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "vs_1", "deleted": true
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/assistants/asst_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "asst_1", "deleted": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        mount_creation_mocks(&server).await;

        let reconciler = reconciler(&server, root);
        let results = reconciler.reset().await.unwrap();

        assert!(results.contains(&("vector_store", "deleted".to_string())));
        assert!(results.contains(&("assistant", "deleted".to_string())));
        assert!(results.contains(&("config_file", "removed".to_string())));
        assert!(!config_exists(Some(root)));
        assert!(!reconciler.status().has_config());

        // The next ensure_ready must provision from scratch, not reuse the
        // deleted ids.
        let ready = reconciler.ensure_ready().await.unwrap();
        assert_eq!(ready.status, ReadyStatus::Created);
        assert_eq!(ready.vector_store_id, "vs_new");
        assert_eq!(ready.assistant_id, "asst_new");
    }

    #[test]
    fn test_instructions_fallback() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();

        let server_less = ResourceReconciler {
            client: AssistantClient::new("http://localhost:1", "k").unwrap(),
            model: "m".to_string(),
            root: Some(root.to_path_buf()),
        };
        assert!(server_less.instructions().starts_with("You are an expert"));

        fs::write(root.join(PROMPT_FILE), "Custom instructions\n").unwrap();
        assert_eq!(server_less.instructions(), "Custom instructions");
    }
}
