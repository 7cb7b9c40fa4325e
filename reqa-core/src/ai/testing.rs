//! Scripted backends for engine tests

use crate::ai::client::{
    AiError, AiResult, ChunkCallback, HealthMonitor, HealthStatus, ProgressCallback, RagBackend,
    ServiceStatus, TextGenerator, Workspace,
};
use crate::ai::events::{EngineEvent, EventPublisher};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One scripted reply
#[derive(Debug, Clone)]
pub enum Script {
    Reply(String),
    Fail(AiError),
    /// Reply after a delay, unless cancelled first
    Delayed(Duration, String),
    /// Never replies; resolves only on cancellation
    Hang,
}

impl Script {
    pub fn reply(text: impl Into<String>) -> Self {
        Script::Reply(text.into())
    }

    async fn play(self, cancel: &CancellationToken) -> AiResult<String> {
        match self {
            Script::Reply(text) => Ok(text),
            Script::Fail(err) => Err(err),
            Script::Delayed(delay, text) => tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(text),
                _ = cancel.cancelled() => Err(AiError::Cancelled),
            },
            Script::Hang => {
                cancel.cancelled().await;
                Err(AiError::Cancelled)
            }
        }
    }
}

fn next_script(queue: &Mutex<VecDeque<Script>>) -> Script {
    queue
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(Script::Fail(AiError::EmptyResponse))
}

fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[derive(Default)]
pub struct MockRagBackend {
    pub workspaces: Mutex<Vec<Workspace>>,
    pub chat: Mutex<VecDeque<Script>>,
    pub list_delay: Option<Duration>,
    pub fail_list: bool,
    pub fail_create: bool,
    pub fail_thread: bool,
    pub fail_upload: bool,
    pub reject_configure: bool,
    pub list_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub configure_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub thread_creates: AtomicUsize,
    pub thread_deletes: AtomicUsize,
    pub chat_calls: AtomicUsize,
    pub messages: Mutex<Vec<String>>,
}

impl MockRagBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspaces(names: &[&str]) -> Self {
        let backend = Self::new();
        *backend.workspaces.lock().unwrap() = names
            .iter()
            .map(|name| Workspace {
                name: name.to_string(),
                slug: slugify(name),
            })
            .collect();
        backend
    }

    pub fn push_chat(&self, script: Script) {
        self.chat.lock().unwrap().push_back(script);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RagBackend for MockRagBackend {
    async fn list_workspaces(&self, _cancel: &CancellationToken) -> AiResult<Vec<Workspace>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_list {
            return Err(AiError::ServiceNotAvailable("mock".to_string()));
        }
        Ok(self.workspaces.lock().unwrap().clone())
    }

    async fn create_workspace(
        &self,
        name: &str,
        _cancel: &CancellationToken,
    ) -> AiResult<Option<Workspace>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Ok(None);
        }
        let workspace = Workspace {
            name: name.to_string(),
            slug: slugify(name),
        };
        self.workspaces.lock().unwrap().push(workspace.clone());
        Ok(Some(workspace))
    }

    async fn configure_workspace_settings(
        &self,
        _slug: &str,
        _cancel: &CancellationToken,
    ) -> AiResult<bool> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(!self.reject_configure)
    }

    async fn upload_document(&self, _slug: &str, _name: &str, _content: &str) -> AiResult<bool> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        Ok(!self.fail_upload)
    }

    async fn create_thread(
        &self,
        _slug: &str,
        name: &str,
        _cancel: &CancellationToken,
    ) -> AiResult<Option<String>> {
        self.thread_creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_thread {
            return Ok(None);
        }
        Ok(Some(slugify(name)))
    }

    async fn delete_thread(
        &self,
        _slug: &str,
        _thread_slug: &str,
        _cancel: &CancellationToken,
    ) -> AiResult<()> {
        self.thread_deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_chat_message_streaming(
        &self,
        _slug: &str,
        message: &str,
        on_chunk: Option<ChunkCallback<'_>>,
        on_progress: Option<ProgressCallback<'_>>,
        _thread_slug: Option<&str>,
        cancel: &CancellationToken,
    ) -> AiResult<String> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.messages.lock().unwrap().push(message.to_string());
        if let Some(progress) = on_progress {
            progress("mock: sending");
        }
        let script = next_script(&self.chat);
        let text = script.play(cancel).await?;
        if let Some(chunk) = on_chunk {
            chunk(&text);
        }
        Ok(text)
    }
}

#[derive(Default)]
pub struct MockTextGenerator {
    pub replies: Mutex<VecDeque<Script>>,
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl MockTextGenerator {
    pub fn new(replies: Vec<Script>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn push(&self, script: Script) {
        self.replies.lock().unwrap().push_back(script);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for MockTextGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> AiResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        next_script(&self.replies).play(cancel).await
    }

    async fn generate_with_system(
        &self,
        _system: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> AiResult<String> {
        self.generate(prompt, cancel).await
    }
}

pub struct MockHealthMonitor {
    pub status: HealthStatus,
}

impl MockHealthMonitor {
    pub fn new(status: ServiceStatus, is_using_fallback: bool) -> Self {
        Self {
            status: HealthStatus {
                status,
                is_using_fallback,
            },
        }
    }
}

#[async_trait]
impl HealthMonitor for MockHealthMonitor {
    async fn check_health(&self, _cancel: &CancellationToken) -> AiResult<HealthStatus> {
        Ok(self.status.clone())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<EngineEvent>>,
}

impl RecordingPublisher {
    pub fn snapshot(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A JSON analysis reply with the given score and one complete recommendation
pub fn json_reply(score: u8, suggested_edit: &str) -> String {
    serde_json::json!({
        "QualityScore": score,
        "Issues": ["[Medium] Clarity: wording is loose"],
        "Recommendations": [{
            "Category": "Clarity",
            "Description": "Tighten the wording",
            "SuggestedEdit": suggested_edit,
        }],
        "FreeformFeedback": "Reasonable requirement.",
        "HallucinationCheck": "NO_FABRICATION",
    })
    .to_string()
}
