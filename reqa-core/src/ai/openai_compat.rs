//! OpenAI-compatible chat completions
//!
//! [`TextGenerator`] for any server exposing `/chat/completions` (OpenAI,
//! Ollama, LM Studio, vLLM). Used for direct prompting and follow-up requests.

use crate::ai::client::{http_status_error, with_cancel, AiError, AiResult, TextGenerator};
use crate::config::BackendConfig;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Text of the first choice of a chat completion body
pub fn completion_text(body: &str) -> AiResult<String> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| AiError::ParseError(e.to_string()))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|text| !text.trim().is_empty())
        .ok_or(AiError::EmptyResponse)
}

pub struct ChatCompletionsClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    timeout_secs: u64,
}

impl ChatCompletionsClient {
    pub fn new(config: &BackendConfig) -> AiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AiError::Unknown(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.llm_url.trim_end_matches('/')),
            model: config.llm_model.clone(),
            api_key: config.llm_api_key.clone(),
            temperature: config.temperature,
            timeout_secs: config.request_timeout_secs,
        })
    }

    fn request_body(&self, system: Option<&str>, prompt: &str) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": false,
        })
    }

    async fn complete(&self, system: Option<&str>, prompt: &str) -> AiResult<String> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&self.request_body(system, prompt));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AiError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AiError::ServiceNotAvailable(e.to_string())
            } else {
                AiError::LlmRequestFailed(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AiError::LlmRequestFailed(e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(http_status_error(status, &body));
        }

        let text = completion_text(&body)?;
        debug!(model = %self.model, chars = text.len(), "completion received");
        Ok(text)
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionsClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> AiResult<String> {
        with_cancel(cancel, self.complete(None, prompt)).await
    }

    async fn generate_with_system(
        &self,
        system: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> AiResult<String> {
        with_cancel(cancel, self.complete(Some(system), prompt)).await
    }
}
