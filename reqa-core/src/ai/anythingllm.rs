//! AnythingLLM Client
//!
//! [`RagBackend`] and [`HealthMonitor`] over the developer API of an
//! AnythingLLM-style server: workspaces, raw-text document ingestion, threads
//! and server-sent-event chat streaming.

use crate::ai::client::{
    http_status_error, with_cancel, AiError, AiResult, ChunkCallback, HealthMonitor,
    HealthStatus, ProgressCallback, RagBackend, ServiceStatus, Workspace,
};
use crate::ai::prompts::system_prompt;
use crate::config::BackendConfig;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One decoded event of a streamed chat response
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text_response: Option<String>,
    #[serde(default)]
    pub close: bool,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl StreamChunk {
    /// The error text, if the server reported one
    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            None | Some(serde_json::Value::Null) | Some(serde_json::Value::Bool(false)) => None,
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Decode one SSE line; anything that is not a `data:` JSON payload is skipped
pub fn parse_sse_line(line: &str) -> Option<StreamChunk> {
    let payload = line.trim().strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(chunk) => Some(chunk),
        Err(e) => {
            debug!(error = %e, "skipping malformed stream event");
            None
        }
    }
}

/// Accumulates raw stream bytes and yields complete lines. Decoding waits
/// for the newline so multibyte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete line, without its terminator
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line[..end]).into_owned())
    }

    /// Whatever is left once the stream ended
    pub fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}

#[derive(Debug, Deserialize)]
struct WorkspaceList {
    #[serde(default)]
    workspaces: Vec<Workspace>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceEnvelope {
    workspace: Option<Workspace>,
}

#[derive(Debug, Deserialize)]
struct ThreadEnvelope {
    thread: Option<ThreadInfo>,
}

#[derive(Debug, Deserialize)]
struct ThreadInfo {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    documents: Vec<UploadedDocument>,
}

#[derive(Debug, Deserialize)]
struct UploadedDocument {
    location: String,
}

pub struct AnythingLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    temperature: f32,
    timeout_secs: u64,
}

impl AnythingLlmClient {
    pub fn new(config: &BackendConfig) -> AiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AiError::Unknown(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.rag_url.trim_end_matches('/').to_string(),
            api_key: config.rag_api_key.clone(),
            temperature: config.temperature,
            timeout_secs: config.request_timeout_secs,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> AiError {
        if e.is_timeout() {
            AiError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            AiError::ServiceNotAvailable(e.to_string())
        } else {
            AiError::LlmRequestFailed(e.to_string())
        }
    }

    /// Send a request and decode a JSON body, mapping HTTP failures
    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> AiResult<T> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        if !(200..300).contains(&status) {
            return Err(http_status_error(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| AiError::ParseError(e.to_string()))
    }

    fn chat_path(slug: &str, thread_slug: Option<&str>) -> String {
        match thread_slug {
            Some(thread) => format!("workspace/{}/thread/{}/stream-chat", slug, thread),
            None => format!("workspace/{}/stream-chat", slug),
        }
    }

    async fn stream_chat(
        &self,
        slug: &str,
        message: &str,
        on_chunk: Option<ChunkCallback<'_>>,
        on_progress: Option<ProgressCallback<'_>>,
        thread_slug: Option<&str>,
    ) -> AiResult<String> {
        let request = self
            .client
            .post(self.url(&Self::chat_path(slug, thread_slug)))
            .header("Accept", "text/event-stream")
            .json(&json!({ "message": message, "mode": "chat" }));
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(http_status_error(status, &body));
        }
        if let Some(progress) = on_progress {
            progress("Receiving response");
        }

        let mut stream = response.bytes_stream();
        let mut buffer = SseLineBuffer::default();
        let mut text = String::new();

        while let Some(bytes) = stream.next().await {
            let bytes = bytes.map_err(|e| self.transport_error(e))?;
            buffer.push(&bytes);

            while let Some(line) = buffer.next_line() {
                let Some(chunk) = parse_sse_line(&line) else {
                    continue;
                };
                if let Some(error) = chunk.error_message() {
                    return Err(AiError::LlmRequestFailed(error));
                }
                if let Some(piece) = chunk.text_response.as_deref().filter(|p| !p.is_empty()) {
                    text.push_str(piece);
                    if let Some(on_chunk) = on_chunk {
                        on_chunk(piece);
                    }
                }
                if chunk.close {
                    return Ok(text);
                }
            }
        }

        // trailing event without a newline
        if let Some(chunk) = parse_sse_line(&buffer.finish()) {
            if let Some(piece) = chunk.text_response.filter(|p| !p.is_empty()) {
                text.push_str(&piece);
                if let Some(on_chunk) = on_chunk {
                    on_chunk(&piece);
                }
            }
        }
        Ok(text)
    }
}

#[async_trait]
impl RagBackend for AnythingLlmClient {
    async fn list_workspaces(&self, cancel: &CancellationToken) -> AiResult<Vec<Workspace>> {
        let list: WorkspaceList =
            with_cancel(cancel, self.send_json(self.client.get(self.url("workspaces")))).await?;
        debug!(count = list.workspaces.len(), "listed workspaces");
        Ok(list.workspaces)
    }

    async fn create_workspace(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> AiResult<Option<Workspace>> {
        let request = self
            .client
            .post(self.url("workspace/new"))
            .json(&json!({ "name": name }));
        let created: WorkspaceEnvelope = with_cancel(cancel, self.send_json(request))
            .await
            .map_err(|e| match e {
                AiError::Cancelled => AiError::Cancelled,
                other => AiError::WorkspaceCreationFailed(other.to_string()),
            })?;
        Ok(created.workspace)
    }

    async fn configure_workspace_settings(
        &self,
        slug: &str,
        cancel: &CancellationToken,
    ) -> AiResult<bool> {
        let request = self
            .client
            .post(self.url(&format!("workspace/{}/update", slug)))
            .json(&json!({
                "openAiPrompt": system_prompt(),
                "openAiTemp": self.temperature,
            }));
        let updated: WorkspaceEnvelope = with_cancel(cancel, self.send_json(request)).await?;
        Ok(updated.workspace.is_some())
    }

    async fn upload_document(&self, slug: &str, name: &str, content: &str) -> AiResult<bool> {
        let request = self
            .client
            .post(self.url("document/raw-text"))
            .json(&json!({
                "textContent": content,
                "metadata": { "title": name },
            }));
        let uploaded: UploadResponse = self.send_json(request).await?;
        if !uploaded.success || uploaded.documents.is_empty() {
            warn!(slug, document = name, "document upload was not accepted");
            return Ok(false);
        }

        let adds: Vec<&str> = uploaded
            .documents
            .iter()
            .map(|d| d.location.as_str())
            .collect();
        let request = self
            .client
            .post(self.url(&format!("workspace/{}/update-embeddings", slug)))
            .json(&json!({ "adds": adds }));
        let _: serde_json::Value = self.send_json(request).await?;
        Ok(true)
    }

    async fn create_thread(
        &self,
        slug: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> AiResult<Option<String>> {
        let request = self
            .client
            .post(self.url(&format!("workspace/{}/thread/new", slug)))
            .json(&json!({ "name": name }));
        let created: ThreadEnvelope = with_cancel(cancel, self.send_json(request)).await?;
        Ok(created.thread.map(|t| t.slug))
    }

    async fn delete_thread(
        &self,
        slug: &str,
        thread_slug: &str,
        cancel: &CancellationToken,
    ) -> AiResult<()> {
        let request = self
            .client
            .delete(self.url(&format!("workspace/{}/thread/{}", slug, thread_slug)));
        let response = with_cancel(cancel, async {
            self.authorized(request)
                .send()
                .await
                .map_err(|e| self.transport_error(e))
        })
        .await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(http_status_error(status, &body));
        }
        Ok(())
    }

    async fn send_chat_message_streaming(
        &self,
        slug: &str,
        message: &str,
        on_chunk: Option<ChunkCallback<'_>>,
        on_progress: Option<ProgressCallback<'_>>,
        thread_slug: Option<&str>,
        cancel: &CancellationToken,
    ) -> AiResult<String> {
        if let Some(progress) = on_progress {
            progress("Sending request to workspace");
        }
        with_cancel(
            cancel,
            self.stream_chat(slug, message, on_chunk, on_progress, thread_slug),
        )
        .await
    }
}

#[async_trait]
impl HealthMonitor for AnythingLlmClient {
    async fn check_health(&self, cancel: &CancellationToken) -> AiResult<HealthStatus> {
        let request = self.authorized(self.client.get(self.url("auth")));
        let outcome = with_cancel(cancel, async {
            request.send().await.map_err(|e| self.transport_error(e))
        })
        .await;

        let status = match outcome {
            Ok(response) if response.status().is_success() => ServiceStatus::Healthy,
            Ok(response) if response.status().is_server_error() => ServiceStatus::Degraded,
            Ok(response) => {
                warn!(status = response.status().as_u16(), "RAG server rejected the health probe");
                ServiceStatus::Degraded
            }
            Err(AiError::Cancelled) => return Err(AiError::Cancelled),
            Err(e) => {
                warn!(error = %e, "RAG server unreachable");
                ServiceStatus::Unavailable
            }
        };
        Ok(HealthStatus {
            status,
            is_using_fallback: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_line() {
        let chunk = parse_sse_line(
            r#"data: {"uuid":"1","type":"textResponseChunk","textResponse":"Hel","close":false,"error":false}"#,
        )
        .unwrap();
        assert_eq!(chunk.kind, "textResponseChunk");
        assert_eq!(chunk.text_response.as_deref(), Some("Hel"));
        assert!(!chunk.close);
        assert!(chunk.error_message().is_none());

        assert!(parse_sse_line("event: ping").is_none());
        assert!(parse_sse_line("data: [DONE]").is_none());
        assert!(parse_sse_line("data: not json").is_none());
    }

    #[test]
    fn test_stream_error_event() {
        let chunk = parse_sse_line(
            r#"data: {"type":"abort","textResponse":null,"close":true,"error":"No LLM configured"}"#,
        )
        .unwrap();
        assert_eq!(chunk.error_message().as_deref(), Some("No LLM configured"));
        assert!(chunk.close);
    }

    #[test]
    fn test_line_buffer_keeps_split_multibyte_characters() {
        let event = "data: {\"textResponse\":\"±5 °C\",\"close\":true}\n".as_bytes();
        // split right after the first byte of '±' (0xC2)
        let split = event.iter().position(|b| *b == 0xC2).unwrap() + 1;

        let mut buffer = SseLineBuffer::default();
        buffer.push(&event[..split]);
        assert!(buffer.next_line().is_none());
        buffer.push(&event[split..]);

        let line = buffer.next_line().unwrap();
        let chunk = parse_sse_line(&line).unwrap();
        assert_eq!(chunk.text_response.as_deref(), Some("±5 °C"));
        assert!(buffer.next_line().is_none());
        assert_eq!(buffer.finish(), "");
    }

    #[test]
    fn test_line_buffer_multiple_lines_and_tail() {
        let mut buffer = SseLineBuffer::default();
        buffer.push(b"data: a\r\ndata: b\ndata: c");
        assert_eq!(buffer.next_line().as_deref(), Some("data: a\r"));
        assert_eq!(buffer.next_line().as_deref(), Some("data: b"));
        assert!(buffer.next_line().is_none());
        assert_eq!(buffer.finish(), "data: c");
    }

    #[test]
    fn test_urls() {
        let client = AnythingLlmClient::new(&BackendConfig {
            rag_url: "http://localhost:3001/".to_string(),
            ..BackendConfig::default()
        })
        .unwrap();
        assert_eq!(client.url("workspaces"), "http://localhost:3001/api/v1/workspaces");
        assert_eq!(
            AnythingLlmClient::chat_path("proj", Some("t1")),
            "workspace/proj/thread/t1/stream-chat"
        );
        assert_eq!(
            AnythingLlmClient::chat_path("proj", None),
            "workspace/proj/stream-chat"
        );
    }

    #[test]
    fn test_workspace_list_decoding() {
        let list: WorkspaceList = serde_json::from_str(
            r#"{"workspaces":[{"id":1,"name":"Word Parse: Decagon","slug":"word-parse-decagon","openAiTemp":0.2}]}"#,
        )
        .unwrap();
        assert_eq!(list.workspaces[0].slug, "word-parse-decagon");
    }
}
