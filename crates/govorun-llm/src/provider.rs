use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single message in the conversation sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    /// Set on `Tool` messages: which call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Tool invocations requested by an assistant turn, echoed back to the
    /// provider on the next round of the tool loop.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Inline images for vision-capable models.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImagePart>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    pub fn tool_result(call_id: &str, tool_name: &str, text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            text: text.into(),
            tool_call_id: Some(call_id.to_string()),
            tool_name: Some(tool_name.to_string()),
            tool_calls: Vec::new(),
            images: Vec::new(),
        }
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: Vec::new(),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Base64-encoded image attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePart {
    pub mime: String,
    pub base64: String,
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Uniform provider reply: text and/or tool calls plus token usage.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

/// Everything a provider needs for one completion call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

/// Common interface for all LLM providers. Implementations are black boxes
/// over their wire format; the dispatcher only sees `LlmReply`.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and queue naming.
    fn name(&self) -> &str;

    async fn complete(&self, req: &ProviderRequest) -> Result<LlmReply, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Unknown model binding: {0}")]
    UnknownModel(String),

    #[error("Model binding {0} does not accept image input")]
    VisionUnsupported(String),

    #[error("Tool loop exceeded {0} rounds")]
    ToolLoopLimit(u32),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Transient errors are retried with backoff and may fall through to a
    /// fallback binding; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::RateLimited { retry_after_ms: 1 }.is_transient());
        assert!(ProviderError::Api {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!ProviderError::Api {
            status: 401,
            message: String::new()
        }
        .is_transient());
        assert!(!ProviderError::Parse("x".to_string()).is_transient());
        assert!(!ProviderError::ToolLoopLimit(5).is_transient());
    }

    #[test]
    fn message_constructors_fill_roles() {
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::user("u").role, Role::User);
        let tool = ChatMessage::tool_result("call_1", "get_weather", "{}");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
    }
}
