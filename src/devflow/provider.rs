//! Shared primitives for provider-agnostic LLM backends.
//!
//! Applications typically interact with the provider layer through the
//! [`Provider`] trait and the lightweight data types defined in this module.
//! The trait abstracts over concrete backend implementations while the
//! supporting structs describe chat requests, responses, streaming deltas,
//! model capabilities, and token accounting.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use devflow::provider::{Provider, UnifiedChatRequest};
//! use devflow::providers::ollama::OllamaProvider;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = OllamaProvider::new();
//!     let request = UnifiedChatRequest::new("llama3").with_user_message("Who are you?");
//!
//!     let response = provider.chat(&request).await?;
//!     println!("Assistant: {}", response.content.unwrap_or_default());
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::pin::Pin;

/// Kind tag of a registered provider. Each type may be registered at most
/// once per [`ProviderManager`](crate::ProviderManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Ollama,
    LmStudio,
    OpenAi,
    Anthropic,
    Azure,
    Custom,
}

impl ProviderType {
    /// Inverse of [`as_str`](ProviderType::as_str), used when reloading
    /// persisted manager state.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ollama" => Some(ProviderType::Ollama),
            "lmstudio" => Some(ProviderType::LmStudio),
            "openai" => Some(ProviderType::OpenAi),
            "anthropic" => Some(ProviderType::Anthropic),
            "azure" => Some(ProviderType::Azure),
            "custom" => Some(ProviderType::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Ollama => "ollama",
            ProviderType::LmStudio => "lmstudio",
            ProviderType::OpenAi => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Azure => "azure",
            ProviderType::Custom => "custom",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a model can do, as reported by its provider or inferred from its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCapability {
    Chat,
    Completion,
    Code,
    Embedding,
    FunctionCalling,
    Vision,
}

/// Provider-agnostic model descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedModel {
    pub id: String,
    pub provider: ProviderType,
    pub display_name: String,
    pub context_length: u32,
    pub capabilities: Vec<ModelCapability>,
    pub loaded: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl UnifiedModel {
    pub fn supports(&self, capability: ModelCapability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Roles in the unified chat message format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// A single message in a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One parameter in a tool's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    /// JSON-Schema type name, e.g. `"string"` or `"number"`.
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// JSON-Schema-like parameter object for a [`Tool`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSchema {
    pub properties: HashMap<String, ToolParameter>,
    pub required: Vec<String>,
}

impl ToolSchema {
    /// Render the schema as the `{"type":"object", ...}` value expected in
    /// OpenAI-style `tools` arrays.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": self.properties,
            "required": self.required,
        })
    }
}

/// A tool definition forwarded to providers that support function calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: ToolSchema,
}

/// A tool call requested by the model in a chat response. `arguments` is the
/// raw JSON string exactly as the provider returned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// Provider-agnostic chat request.
///
/// When `system_prompt` is set, transports prepend it as a leading system
/// message before serialization. `stream` is advisory for
/// [`Provider::chat`]; streaming callers use [`Provider::stream_chat`].
#[derive(Debug, Clone)]
pub struct UnifiedChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub tools: Option<Vec<Tool>>,
    pub stream: bool,
}

impl UnifiedChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            temperature: 0.7,
            max_tokens: None,
            system_prompt: None,
            tools: None,
            stream: false,
        }
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_user_message(self, content: impl Into<String>) -> Self {
        self.with_message(ChatMessage::new(ChatRole::User, content))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Messages with the optional system prompt prepended, ready for wire
    /// serialization.
    pub fn effective_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::new(ChatRole::System, prompt.clone()));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }
}

/// Provider-agnostic chat response.
#[derive(Debug, Clone, Default)]
pub struct UnifiedChatResponse {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    pub model: Option<String>,
}

impl UnifiedChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            finish_reason: Some("stop".to_string()),
            ..Self::default()
        }
    }

    /// A typed failure response: no content, finish reason `"error"`, and the
    /// message carried in `content`-less form for display.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Some(format!("Error: {}", message.into())),
            finish_reason: Some("error".to_string()),
            ..Self::default()
        }
    }
}

/// Latest health-check outcome for a provider.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub loaded_model: Option<String>,
}

impl ProviderHealth {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            error: None,
            loaded_model: None,
        }
    }

    pub fn unhealthy(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms,
            error: Some(error.into()),
            loaded_model: None,
        }
    }

    pub fn with_loaded_model(mut self, model: impl Into<String>) -> Self {
        self.loaded_model = Some(model.into());
        self
    }
}

/// Type alias for a stream of content deltas compatible with `Send`
/// executors. The stream is cancellable (drop it) but not restartable.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Errors surfaced by providers and the provider manager.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Transport-level failure (connect, timeout, malformed body).
    Http(String),
    /// The backend answered with an error status or payload.
    Api(String),
    /// No registered, enabled, healthy provider could serve the request.
    NoProvidersAvailable,
    /// A streaming request requires an active provider and none is set.
    NoActiveProvider,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Http(msg) => write!(f, "HTTP error: {}", msg),
            ProviderError::Api(msg) => write!(f, "Provider API error: {}", msg),
            ProviderError::NoProvidersAvailable => write!(f, "No providers available"),
            ProviderError::NoActiveProvider => write!(f, "No active provider"),
        }
    }
}

impl Error for ProviderError {}

/// Trait-driven abstraction for a concrete LLM backend.
///
/// A [`Provider`] translates unified requests into the backend-specific wire
/// format and returns responses in a uniform shape. All implementations must
/// be thread-safe (`Send + Sync`) so they can be shared between async tasks
/// behind `Arc<dyn Provider>`.
///
/// `is_available` is a cheap snapshot of the *latest* health check, updated
/// by [`check_health`](Provider::check_health); it must not perform I/O.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name, e.g. `"ollama"`.
    fn name(&self) -> &str;

    fn provider_type(&self) -> ProviderType;

    /// Snapshot of the most recent health check. `false` until the first
    /// successful check.
    fn is_available(&self) -> bool;

    /// List the models this backend can serve.
    async fn list_models(&self) -> Result<Vec<UnifiedModel>, ProviderError>;

    /// Full request/response chat completion.
    async fn chat(&self, request: &UnifiedChatRequest) -> Result<UnifiedChatResponse, ProviderError>;

    /// Open a streaming chat. The returned stream yields incremental text
    /// deltas; dropping it cancels the request.
    async fn stream_chat(&self, request: &UnifiedChatRequest) -> Result<ChatStream, ProviderError>;

    /// Embed a single text into a vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Probe the backend and update the availability snapshot.
    async fn check_health(&self) -> ProviderHealth;
}

/// Infer a [`UnifiedModel`] from a bare model id, for providers that do not
/// report capabilities themselves.
///
/// Context length defaults to 4096 and widens for known families; every
/// model gets chat and completion, code models get [`ModelCapability::Code`],
/// instruct/chat-tagged models get function calling. The inferred family
/// lands in `metadata["family"]`.
///
/// # Example
///
/// ```rust
/// use devflow::provider::{infer_model, ModelCapability, ProviderType};
///
/// let model = infer_model("codellama:13b-instruct", ProviderType::Ollama);
/// assert_eq!(model.context_length, 16384);
/// assert!(model.supports(ModelCapability::Code));
/// assert!(model.supports(ModelCapability::FunctionCalling));
/// assert_eq!(model.metadata["family"], "codellama");
/// ```
pub fn infer_model(id: &str, provider: ProviderType) -> UnifiedModel {
    let lower = id.to_lowercase();

    let context_length = if lower.contains("mixtral") {
        32_768
    } else if lower.contains("codellama") {
        16_384
    } else if lower.contains("llama3") || lower.contains("mistral") {
        8_192
    } else {
        4_096
    };

    let mut capabilities = vec![ModelCapability::Chat, ModelCapability::Completion];
    if lower.contains("code") || lower.contains("coder") || lower.contains("codellama") {
        capabilities.push(ModelCapability::Code);
    }
    if lower.contains("instruct") || lower.contains("chat") {
        capabilities.push(ModelCapability::FunctionCalling);
    }

    // First substring match wins; "codellama" must come before "llama".
    let family = [
        ("codellama", "codellama"),
        ("llama", "llama"),
        ("mistral", "mistral"),
        ("mixtral", "mistral"),
        ("deepseek", "deepseek"),
        ("qwen", "qwen"),
        ("phi", "phi"),
        ("gemma", "gemma"),
        ("starcoder", "starcoder"),
    ]
    .iter()
    .find(|(needle, _)| lower.contains(*needle))
    .map(|(_, family)| *family)
    .unwrap_or("other");

    let mut metadata = HashMap::new();
    metadata.insert("family".to_string(), family.to_string());

    UnifiedModel {
        id: id.to_string(),
        provider,
        display_name: id.to_string(),
        context_length,
        capabilities,
        loaded: false,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_defaults() {
        let model = infer_model("tinymodel", ProviderType::Custom);
        assert_eq!(model.context_length, 4096);
        assert!(model.supports(ModelCapability::Chat));
        assert!(model.supports(ModelCapability::Completion));
        assert!(!model.supports(ModelCapability::Code));
        assert_eq!(model.metadata["family"], "other");
    }

    #[test]
    fn inference_context_lengths() {
        assert_eq!(infer_model("llama3:8b", ProviderType::Ollama).context_length, 8192);
        assert_eq!(infer_model("mistral-7b", ProviderType::Ollama).context_length, 8192);
        assert_eq!(infer_model("mixtral-8x7b", ProviderType::Ollama).context_length, 32768);
        assert_eq!(infer_model("codellama:7b", ProviderType::Ollama).context_length, 16384);
    }

    #[test]
    fn inference_families() {
        assert_eq!(infer_model("deepseek-coder", ProviderType::Ollama).metadata["family"], "deepseek");
        assert_eq!(infer_model("qwen2.5", ProviderType::Ollama).metadata["family"], "qwen");
        assert_eq!(infer_model("mixtral", ProviderType::Ollama).metadata["family"], "mistral");
        assert_eq!(infer_model("starcoder2", ProviderType::Ollama).metadata["family"], "starcoder");
    }

    #[test]
    fn inference_capabilities() {
        let chat_tagged = infer_model("llama3-chat", ProviderType::Ollama);
        assert!(chat_tagged.supports(ModelCapability::FunctionCalling));
        let coder = infer_model("deepseek-coder", ProviderType::Ollama);
        assert!(coder.supports(ModelCapability::Code));
        assert!(!coder.supports(ModelCapability::FunctionCalling));
    }

    #[test]
    fn effective_messages_prepends_system_prompt() {
        let request = UnifiedChatRequest::new("m")
            .with_system_prompt("be brief")
            .with_user_message("hi");
        let messages = request.effective_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[0].content, "be brief");
        assert_eq!(messages[1].role, ChatRole::User);
    }

    #[test]
    fn error_response_is_typed() {
        let response = UnifiedChatResponse::error("boom");
        assert_eq!(response.finish_reason.as_deref(), Some("error"));
        assert!(response.content.unwrap().contains("boom"));
    }

    #[test]
    fn tool_schema_serializes_to_object() {
        let mut schema = ToolSchema::default();
        schema.properties.insert(
            "path".to_string(),
            ToolParameter {
                param_type: "string".to_string(),
                description: "File to read".to_string(),
                enum_values: None,
                default: None,
            },
        );
        schema.required.push("path".to_string());
        let value = schema.to_json();
        assert_eq!(value["type"], "object");
        assert_eq!(value["properties"]["path"]["type"], "string");
        assert_eq!(value["required"][0], "path");
    }
}
