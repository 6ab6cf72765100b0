//! Ollama transport.
//!
//! Speaks the native Ollama HTTP API: `GET /api/tags` for model listing and
//! health, `POST /api/chat` for (streaming) chat, and `POST /api/embeddings`
//! for embeddings. Streaming responses arrive as newline-delimited JSON
//! objects; the final object carries `"done": true`.

use crate::devflow::provider::{
    infer_model, ChatStream, Provider, ProviderError, ProviderHealth, ProviderType, TokenUsage,
    UnifiedChatRequest, UnifiedChatResponse, UnifiedModel,
};
use crate::devflow::providers::common::{
    error_for_status, normalize_base_url, response_lines, shared_http_client,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// Provider backed by a local Ollama server.
pub struct OllamaProvider {
    base_url: String,
    embedding_model: String,
    available: AtomicBool,
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaProvider {
    /// Connect to the default local server on port 11434.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl AsRef<str>) -> Self {
        Self {
            base_url: normalize_base_url(base_url.as_ref()),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            available: AtomicBool::new(false),
        }
    }

    /// Override the model used for [`embed`](Provider::embed) requests
    /// (builder pattern).
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_body(&self, request: &UnifiedChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .effective_messages()
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        let mut options = json!({"temperature": request.temperature});
        if let Some(max_tokens) = request.max_tokens {
            options["num_predict"] = json!(max_tokens);
        }
        json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
            "options": options,
        })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Ollama
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn list_models(&self) -> Result<Vec<UnifiedModel>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = shared_http_client()
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let resp = error_for_status(resp).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let models = body
            .get("models")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get("name").and_then(Value::as_str))
                    .map(|name| {
                        let mut model = infer_model(name, ProviderType::Ollama);
                        model.loaded = true;
                        model
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn chat(&self, request: &UnifiedChatRequest) -> Result<UnifiedChatResponse, ProviderError> {
        let url = format!("{}/api/chat", self.base_url);
        let resp = shared_http_client()
            .post(&url)
            .json(&self.chat_body(request, false))
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let resp = error_for_status(resp).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let content = body
            .pointer("/message/content")
            .and_then(Value::as_str)
            .map(str::to_string);
        let usage = match (
            body.get("prompt_eval_count").and_then(Value::as_u64),
            body.get("eval_count").and_then(Value::as_u64),
        ) {
            (None, None) => None,
            (input, output) => {
                let input = input.unwrap_or(0) as usize;
                let output = output.unwrap_or(0) as usize;
                Some(TokenUsage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: input + output,
                })
            }
        };

        Ok(UnifiedChatResponse {
            content,
            tool_calls: None,
            usage,
            finish_reason: body
                .get("done_reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or(Some("stop".to_string())),
            model: Some(request.model.clone()),
        })
    }

    async fn stream_chat(&self, request: &UnifiedChatRequest) -> Result<ChatStream, ProviderError> {
        let url = format!("{}/api/chat", self.base_url);
        let resp = shared_http_client()
            .post(&url)
            .json(&self.chat_body(request, true))
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let resp = error_for_status(resp).await?;

        let deltas = response_lines(resp)
            .map(|line| {
                line.and_then(|line| {
                    serde_json::from_str::<Value>(&line)
                        .map_err(|e| ProviderError::Api(format!("bad stream chunk: {}", e)))
                })
            })
            .take_while(|chunk| {
                let done = matches!(
                    chunk,
                    Ok(value) if value.get("done").and_then(Value::as_bool).unwrap_or(false)
                );
                futures_util::future::ready(!done)
            })
            .filter_map(|chunk| async move {
                match chunk {
                    Ok(value) => value
                        .pointer("/message/content")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(|s| Ok(s.to_string())),
                    Err(e) => Some(Err(e)),
                }
            });
        Ok(Box::pin(deltas))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let resp = shared_http_client()
            .post(&url)
            .json(&json!({"model": self.embedding_model, "prompt": text}))
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let resp = error_for_status(resp).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        body.get("embedding")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|v| v as f32)
                    .collect()
            })
            .ok_or_else(|| ProviderError::Api("embedding response missing 'embedding'".to_string()))
    }

    async fn check_health(&self) -> ProviderHealth {
        let url = format!("{}/api/tags", self.base_url);
        let started = Instant::now();
        let outcome = shared_http_client().get(&url).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(resp) if resp.status().is_success() => {
                self.available.store(true, Ordering::Relaxed);
                let loaded = resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|body| {
                        body.pointer("/models/0/name")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    });
                let mut health = ProviderHealth::healthy(latency_ms);
                if let Some(model) = loaded {
                    health = health.with_loaded_model(model);
                }
                health
            }
            Ok(resp) => {
                self.available.store(false, Ordering::Relaxed);
                ProviderHealth::unhealthy(latency_ms, format!("HTTP {}", resp.status()))
            }
            Err(e) => {
                self.available.store(false, Ordering::Relaxed);
                ProviderHealth::unhealthy(latency_ms, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devflow::provider::ChatRole;

    #[test]
    fn chat_body_carries_options_and_messages() {
        let provider = OllamaProvider::new();
        let request = UnifiedChatRequest::new("llama3")
            .with_system_prompt("be brief")
            .with_user_message("hello")
            .with_max_tokens(128);
        let body = provider.chat_body(&request, false);
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], ChatRole::System.as_str());
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["options"]["num_predict"], 128);
    }

    #[test]
    fn default_base_url_targets_local_server() {
        assert_eq!(OllamaProvider::new().base_url(), "http://localhost:11434");
    }
}
