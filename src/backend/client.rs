//! Client of a remote workflow engine.
//!
//! The engine exposes a REST API scoped by workflow name. Every request
//! carries the site's access token; endpoint and token live on the client
//! instance, so clients for different sites can be used side by side.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use super::BackendError;

/// One file in a remote workflow workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Path relative to the workspace root.
    pub name: String,
    /// Size in bytes, when the engine reports it.
    pub size: Option<u64>,
}

/// Operations the remote backend needs from a workflow engine.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Create a workflow from its descriptor.
    async fn create_workflow(&self, name: &str, specification: &Value) -> Result<(), BackendError>;

    /// Upload one file into the workflow workspace.
    async fn upload_file(&self, workflow: &str, path: &str, content: Vec<u8>)
    -> Result<(), BackendError>;

    /// Start execution.
    async fn start_workflow(&self, workflow: &str) -> Result<(), BackendError>;

    /// Ask the engine to stop execution.
    async fn stop_workflow(&self, workflow: &str) -> Result<(), BackendError>;

    /// Status record of the workflow.
    async fn workflow_status(&self, workflow: &str) -> Result<Value, BackendError>;

    /// Structured step logs, as the JSON text the engine returns.
    async fn workflow_logs(&self, workflow: &str) -> Result<String, BackendError>;

    /// Workspace files whose path starts with `prefix`.
    async fn list_files(&self, workflow: &str, prefix: &str)
    -> Result<Vec<RemoteFile>, BackendError>;

    /// Content of one workspace file.
    async fn download_file(&self, workflow: &str, path: &str) -> Result<Vec<u8>, BackendError>;

    /// Whether the engine answers.
    async fn ping(&self) -> Result<bool, BackendError>;
}

#[derive(Debug, Deserialize)]
struct WorkspaceListing {
    #[serde(default)]
    items: Vec<WorkspaceItem>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceItem {
    name: String,
    #[serde(default)]
    size: Value,
}

impl WorkspaceItem {
    fn size(&self) -> Option<u64> {
        match &self.size {
            Value::Number(n) => n.as_u64(),
            Value::Object(o) => o.get("raw").and_then(Value::as_u64),
            _ => None,
        }
    }
}

/// [`EngineClient`] speaking the engine's REST API over HTTP.
#[derive(Clone)]
pub struct HttpEngineClient {
    client: Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for HttpEngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEngineClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpEngineClient {
    /// Create a client for the engine at `base_url`.
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn workflow_url(&self, workflow: &str, tail: &str) -> String {
        format!("{}/api/workflows/{}{}", self.base_url, workflow, tail)
    }

    fn check(operation: &str, response: &reqwest::Response) -> Result<(), BackendError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Request {
                operation: operation.to_string(),
                message: format!("server returned {}", response.status()),
            })
        }
    }
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    async fn create_workflow(&self, name: &str, specification: &Value) -> Result<(), BackendError> {
        let url = format!("{}/api/workflows", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("workflow_name", name), ("access_token", self.token.as_str())])
            .json(specification)
            .send()
            .await?;
        Self::check("create_workflow", &response)
    }

    async fn upload_file(
        &self,
        workflow: &str,
        path: &str,
        content: Vec<u8>,
    ) -> Result<(), BackendError> {
        let url = self.workflow_url(workflow, "/workspace");
        let response = self
            .client
            .post(&url)
            .query(&[("file_name", path), ("access_token", self.token.as_str())])
            .header("Content-Type", "application/octet-stream")
            .body(content)
            .send()
            .await?;
        Self::check("upload_file", &response)
    }

    async fn start_workflow(&self, workflow: &str) -> Result<(), BackendError> {
        let url = self.workflow_url(workflow, "/status");
        let response = self
            .client
            .put(&url)
            .query(&[("status", "start"), ("access_token", self.token.as_str())])
            .json(&json!({}))
            .send()
            .await?;
        Self::check("start_workflow", &response)
    }

    async fn stop_workflow(&self, workflow: &str) -> Result<(), BackendError> {
        let url = self.workflow_url(workflow, "/status");
        let response = self
            .client
            .put(&url)
            .query(&[("status", "stop"), ("access_token", self.token.as_str())])
            .json(&json!({"force_stop": true}))
            .send()
            .await?;
        Self::check("stop_workflow", &response)
    }

    async fn workflow_status(&self, workflow: &str) -> Result<Value, BackendError> {
        let url = self.workflow_url(workflow, "/status");
        let response = self
            .client
            .get(&url)
            .query(&[("access_token", self.token.as_str())])
            .send()
            .await?;
        Self::check("workflow_status", &response)?;
        Ok(response.json().await?)
    }

    async fn workflow_logs(&self, workflow: &str) -> Result<String, BackendError> {
        let url = self.workflow_url(workflow, "/logs");
        let response = self
            .client
            .get(&url)
            .query(&[("access_token", self.token.as_str())])
            .send()
            .await?;
        Self::check("workflow_logs", &response)?;
        let body: Value = response.json().await?;
        Ok(body
            .get("logs")
            .and_then(Value::as_str)
            .unwrap_or("{}")
            .to_string())
    }

    async fn list_files(
        &self,
        workflow: &str,
        prefix: &str,
    ) -> Result<Vec<RemoteFile>, BackendError> {
        let url = self.workflow_url(workflow, "/workspace");
        let response = self
            .client
            .get(&url)
            .query(&[("access_token", self.token.as_str())])
            .send()
            .await?;
        Self::check("list_files", &response)?;
        let listing: WorkspaceListing = response.json().await?;
        Ok(listing
            .items
            .into_iter()
            .filter(|item| item.name.starts_with(prefix))
            .map(|item| RemoteFile {
                size: item.size(),
                name: item.name,
            })
            .collect())
    }

    async fn download_file(&self, workflow: &str, path: &str) -> Result<Vec<u8>, BackendError> {
        let url = self.workflow_url(workflow, &format!("/workspace/{}", path));
        let response = self
            .client
            .get(&url)
            .query(&[("access_token", self.token.as_str())])
            .send()
            .await?;
        Self::check("download_file", &response)?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn ping(&self) -> Result<bool, BackendError> {
        let url = format!("{}/api/ping", self.base_url);
        let response = self.client.get(&url).send().await?;
        Ok(response.status().is_success())
    }
}
