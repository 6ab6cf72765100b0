//! LM Studio transport.
//!
//! LM Studio exposes an OpenAI-compatible server under `/v1`: `GET
//! /v1/models`, `POST /v1/chat/completions`, and `POST /v1/embeddings`.
//! Streaming uses server-sent events, one `data: {json}` line per delta,
//! terminated by `data: [DONE]`.

use crate::devflow::provider::{
    infer_model, ChatStream, Provider, ProviderError, ProviderHealth, ProviderType,
    TokenUsage, ToolCallRequest, UnifiedChatRequest, UnifiedChatResponse, UnifiedModel,
};
use crate::devflow::providers::common::{
    error_for_status, normalize_base_url, response_lines, shared_http_client,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

pub const DEFAULT_BASE_URL: &str = "http://localhost:1234";

/// Provider backed by a local LM Studio server.
pub struct LmStudioProvider {
    base_url: String,
    available: AtomicBool,
}

impl Default for LmStudioProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LmStudioProvider {
    /// Connect to the default local server on port 1234.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Accepts either the host base (`http://host:1234`) or a base already
    /// ending in `/v1`.
    pub fn with_base_url(base_url: impl AsRef<str>) -> Self {
        let mut base = normalize_base_url(base_url.as_ref());
        if base.ends_with("/v1") {
            base.truncate(base.len() - "/v1".len());
        }
        Self {
            base_url: base,
            available: AtomicBool::new(false),
        }
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
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(tools) = &request.tools {
            let wire_tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters.to_json(),
                        }
                    })
                })
                .collect();
            if !wire_tools.is_empty() {
                body["tools"] = json!(wire_tools);
            }
        }
        body
    }
}

fn parse_tool_calls(message: &Value) -> Option<Vec<ToolCallRequest>> {
    let calls: Vec<ToolCallRequest> = message
        .get("tool_calls")?
        .as_array()?
        .iter()
        .filter_map(|tc| {
            let id = tc.get("id")?.as_str()?.to_string();
            let function = tc.get("function")?;
            let name = function.get("name")?.as_str()?.to_string();
            let arguments = function
                .get("arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}")
                .to_string();
            Some(ToolCallRequest { id, name, arguments })
        })
        .collect();
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

fn parse_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usage")?;
    let input = usage.get("prompt_tokens").and_then(Value::as_u64)? as usize;
    let output = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    Some(TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
    })
}

#[async_trait]
impl Provider for LmStudioProvider {
    fn name(&self) -> &str {
        "lmstudio"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::LmStudio
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn list_models(&self) -> Result<Vec<UnifiedModel>, ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
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
            .get("data")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get("id").and_then(Value::as_str))
                    .map(|id| {
                        let mut model = infer_model(id, ProviderType::LmStudio);
                        model.loaded = true;
                        model
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn chat(&self, request: &UnifiedChatRequest) -> Result<UnifiedChatResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
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

        let message = body
            .pointer("/choices/0/message")
            .ok_or_else(|| ProviderError::Api("no choices in response".to_string()))?;

        Ok(UnifiedChatResponse {
            content: message
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string),
            tool_calls: parse_tool_calls(message),
            usage: parse_usage(&body),
            finish_reason: body
                .pointer("/choices/0/finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            model: body.get("model").and_then(Value::as_str).map(str::to_string),
        })
    }

    async fn stream_chat(&self, request: &UnifiedChatRequest) -> Result<ChatStream, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let resp = shared_http_client()
            .post(&url)
            .json(&self.chat_body(request, true))
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let resp = error_for_status(resp).await?;

        let deltas = response_lines(resp)
            .take_while(|line| {
                let done = matches!(line, Ok(l) if l.trim() == "data: [DONE]");
                futures_util::future::ready(!done)
            })
            .filter_map(|line| async move {
                match line {
                    Ok(line) => {
                        let payload = line.strip_prefix("data:")?.trim();
                        match serde_json::from_str::<Value>(payload) {
                            Ok(value) => value
                                .pointer("/choices/0/delta/content")
                                .and_then(Value::as_str)
                                .filter(|s| !s.is_empty())
                                .map(|s| Ok(s.to_string())),
                            Err(e) => Some(Err(ProviderError::Api(format!(
                                "bad stream chunk: {}",
                                e
                            )))),
                        }
                    }
                    Err(e) => Some(Err(e)),
                }
            });
        Ok(Box::pin(deltas))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let resp = shared_http_client()
            .post(&url)
            .json(&json!({"input": text, "model": "text-embedding"}))
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let resp = error_for_status(resp).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        body.pointer("/data/0/embedding")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|v| v as f32)
                    .collect()
            })
            .ok_or_else(|| ProviderError::Api("embedding response missing data".to_string()))
    }

    async fn check_health(&self) -> ProviderHealth {
        let url = format!("{}/v1/models", self.base_url);
        let started = Instant::now();
        let outcome = shared_http_client().get(&url).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(resp) if resp.status().is_success() => {
                self.available.store(true, Ordering::Relaxed);
                let loaded = resp.json::<Value>().await.ok().and_then(|body| {
                    body.pointer("/data/0/id")
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
    use crate::devflow::provider::{Tool, ToolSchema};

    #[test]
    fn base_url_accepts_v1_suffix() {
        assert_eq!(
            LmStudioProvider::with_base_url("http://localhost:1234/v1").base_url(),
            "http://localhost:1234"
        );
        assert_eq!(LmStudioProvider::new().base_url(), "http://localhost:1234");
    }

    #[test]
    fn chat_body_includes_tools_in_openai_format() {
        let provider = LmStudioProvider::new();
        let request = UnifiedChatRequest::new("qwen2.5")
            .with_user_message("list files")
            .with_tools(vec![Tool {
                name: "list_dir".to_string(),
                description: "List a directory".to_string(),
                parameters: ToolSchema::default(),
            }]);
        let body = provider.chat_body(&request, false);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "list_dir");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn tool_calls_parse_from_message() {
        let message = serde_json::json!({
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "function": {"name": "list_dir", "arguments": "{\"path\": \".\"}"}
            }]
        });
        let calls = parse_tool_calls(&message).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "list_dir");
        assert!(calls[0].arguments.contains("path"));
    }
}
