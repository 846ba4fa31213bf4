//! Client for the remote operation agent
//!
//! The agent runs inside the operation's worker pod and is addressed by the
//! pod IP observed when the worker became ready. It exposes two calls per
//! operation name:
//!
//! - `POST /operations/{name}/start` with `{directory, resourceFilter}`;
//!   any 2xx means accepted (including duplicates of an earlier start)
//! - `GET /operations/{name}/status` returning `{"state": "RUNNING"}`,
//!   `SUCCEEDED` or `FAILED`
//!
//! Both are safe to repeat.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{OperationPhase, ResourceFilter};
use crate::{Error, Result};

/// Progress reported by the agent
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteState {
    /// Still working
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
}

impl From<RemoteState> for OperationPhase {
    fn from(state: RemoteState) -> Self {
        match state {
            RemoteState::Running => OperationPhase::Running,
            RemoteState::Succeeded => OperationPhase::Succeeded,
            RemoteState::Failed => OperationPhase::Failed,
        }
    }
}

/// Body of the start call
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    /// Directory on the worker's data volume
    pub directory: String,
    /// Resources to include
    pub resource_filter: ResourceFilter,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    state: RemoteState,
}

/// The worker whose agent serves an operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentTarget {
    /// Name of the worker pod
    pub worker: String,
    /// Address of the worker pod
    pub host: String,
}

impl AgentTarget {
    /// Create a target
    pub fn new(worker: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            host: host.into(),
        }
    }
}

/// Calls into the remote agent
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Start operation `name`; repeating the call is harmless
    async fn invoke(
        &self,
        target: &AgentTarget,
        name: &str,
        request: &OperationRequest,
    ) -> Result<()>;

    /// Fetch the progress of operation `name`
    async fn status(&self, target: &AgentTarget, name: &str) -> Result<RemoteState>;
}

/// How to reach agents over HTTP
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentClientConfig {
    /// `http` or `https`
    pub scheme: String,
    /// Agent port
    pub port: u16,
    /// Per-request timeout enforced by the HTTP client
    pub request_timeout: Duration,
    /// Fixed base URL used instead of the worker address
    pub endpoint_override: Option<String>,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            port: crate::DEFAULT_AGENT_PORT,
            request_timeout: Duration::from_secs(30),
            endpoint_override: None,
        }
    }
}

impl AgentClientConfig {
    /// Base URL of the agent serving `target`
    pub fn base_url(&self, target: &AgentTarget) -> String {
        match &self.endpoint_override {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("{}://{}:{}", self.scheme, target.host, self.port),
        }
    }
}

/// [`ExecutionClient`] speaking HTTP/JSON to the agent
pub struct HttpExecutionClient {
    http: reqwest::Client,
    config: AgentClientConfig,
}

impl HttpExecutionClient {
    /// Build a client with the configured request timeout
    pub fn new(config: AgentClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::internal_with_context("http-client", e.to_string()))?;
        Ok(Self { http, config })
    }

    fn operation_url(&self, target: &AgentTarget, name: &str, call: &str) -> String {
        format!(
            "{}/operations/{}/{}",
            self.config.base_url(target),
            name,
            call
        )
    }
}

async fn rejection(call: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    Error::Remote {
        call: call.to_string(),
        status: status.as_u16(),
        message: if message.is_empty() {
            status.to_string()
        } else {
            message
        },
    }
}

#[async_trait]
impl ExecutionClient for HttpExecutionClient {
    async fn invoke(
        &self,
        target: &AgentTarget,
        name: &str,
        request: &OperationRequest,
    ) -> Result<()> {
        let url = self.operation_url(target, name, "start");
        debug!(operation = name, worker = %target.worker, url = %url, "starting remote operation");

        let response = self.http.post(&url).json(request).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(rejection("start", response).await)
    }

    async fn status(&self, target: &AgentTarget, name: &str) -> Result<RemoteState> {
        let url = self.operation_url(target, name, "status");
        debug!(operation = name, worker = %target.worker, url = %url, "fetching remote status");

        let response = self.http.get(&url).send().await?;
        match response.status() {
            StatusCode::OK => {
                let body: StatusResponse = response.json().await?;
                Ok(body.state)
            }
            _ => Err(rejection("status", response).await),
        }
    }
}
