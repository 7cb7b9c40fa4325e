//! AI Client Module
//!
//! Error taxonomy and the pluggable backend interfaces the engine talks to:
//! a plain text generator, a conversational RAG backend organised in
//! workspaces and threads, and an optional health monitor.

use crate::models::AnalysisErrorKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that can occur during AI operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AiError {
    #[error("AI service not available: {0}")]
    ServiceNotAvailable(String),

    #[error("Workspace not configured: {0}")]
    WorkspaceNotConfigured(String),

    #[error("Workspace creation failed: {0}")]
    WorkspaceCreationFailed(String),

    #[error("Thread creation failed for workspace {0}")]
    ThreadCreationFailed(String),

    #[error("LLM request failed: {0}")]
    LlmRequestFailed(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Empty response from AI")]
    EmptyResponse,

    #[error("Workspace configuration timed out")]
    ConfigurationTimeout,

    #[error("Invalid response from AI: {0}")]
    ParseError(String),

    #[error("Fabricated details detected: {0}")]
    FabricationDetected(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl AiError {
    /// The uniform error kind reported on a failed analysis
    pub fn kind(&self) -> AnalysisErrorKind {
        match self {
            AiError::ServiceNotAvailable(_) => AnalysisErrorKind::ServiceNotAvailable,
            AiError::WorkspaceNotConfigured(_) => AnalysisErrorKind::WorkspaceNotConfigured,
            AiError::WorkspaceCreationFailed(_) => AnalysisErrorKind::WorkspaceCreationFailed,
            AiError::ThreadCreationFailed(_) => AnalysisErrorKind::ThreadCreationFailed,
            AiError::LlmRequestFailed(_) => AnalysisErrorKind::LlmRequestFailed,
            AiError::Timeout(_) => AnalysisErrorKind::Timeout,
            AiError::EmptyResponse => AnalysisErrorKind::EmptyResponse,
            AiError::ConfigurationTimeout => AnalysisErrorKind::ConfigurationTimeout,
            AiError::ParseError(_) => AnalysisErrorKind::ParseError,
            AiError::FabricationDetected(_) => AnalysisErrorKind::FabricationDetected,
            AiError::Cancelled => AnalysisErrorKind::Cancelled,
            AiError::Unknown(_) => AnalysisErrorKind::UnknownError,
        }
    }
}

pub type AiResult<T> = Result<T, AiError>;

/// Run `fut` unless `cancel` fires first
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> AiResult<T>
where
    F: std::future::Future<Output = AiResult<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(AiError::Cancelled),
        result = fut => result,
    }
}

/// Map an HTTP error status to the error taxonomy
pub fn http_status_error(status: u16, body: &str) -> AiError {
    let body = body.trim();
    match status {
        401 | 403 => AiError::ServiceNotAvailable(format!("authentication failed ({})", status)),
        404 => AiError::WorkspaceNotConfigured(if body.is_empty() {
            "not found".to_string()
        } else {
            body.to_string()
        }),
        408 | 504 => AiError::LlmRequestFailed(format!("gateway timeout ({})", status)),
        _ => AiError::LlmRequestFailed(format!("HTTP {}: {}", status, body)),
    }
}

/// A workspace on the RAG backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workspace {
    pub name: String,
    pub slug: String,
}

/// Coarse backend health
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: ServiceStatus,
    /// The backend is up but serving through a fallback model
    pub is_using_fallback: bool,
}

/// Plain text generation without retrieval augmentation
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> AiResult<String>;

    async fn generate_with_system(
        &self,
        system: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> AiResult<String>;
}

/// Receives streamed text chunks
pub type ChunkCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);
/// Receives human-readable progress messages
pub type ProgressCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Conversational backend organised in workspaces (indexed document sets)
/// and threads (isolated conversations inside a workspace)
#[async_trait]
pub trait RagBackend: Send + Sync {
    async fn list_workspaces(&self, cancel: &CancellationToken) -> AiResult<Vec<Workspace>>;

    async fn create_workspace(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> AiResult<Option<Workspace>>;

    /// Applies the engine's workspace settings (system prompt, temperature).
    /// Returns false when the backend rejected them.
    async fn configure_workspace_settings(
        &self,
        slug: &str,
        cancel: &CancellationToken,
    ) -> AiResult<bool>;

    async fn upload_document(&self, slug: &str, name: &str, content: &str) -> AiResult<bool>;

    async fn create_thread(
        &self,
        slug: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> AiResult<Option<String>>;

    async fn delete_thread(
        &self,
        slug: &str,
        thread_slug: &str,
        cancel: &CancellationToken,
    ) -> AiResult<()>;

    /// Sends a chat message and returns the full response text, reporting
    /// chunks and progress as they arrive
    async fn send_chat_message_streaming(
        &self,
        slug: &str,
        message: &str,
        on_chunk: Option<ChunkCallback<'_>>,
        on_progress: Option<ProgressCallback<'_>>,
        thread_slug: Option<&str>,
        cancel: &CancellationToken,
    ) -> AiResult<String>;
}

/// Optional liveness probe of the model backend
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    async fn check_health(&self, cancel: &CancellationToken) -> AiResult<HealthStatus>;
}
