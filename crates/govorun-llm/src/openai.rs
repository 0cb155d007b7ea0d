//! OpenAI-compatible chat-completions provider. Covers every vendor that
//! speaks the `/v1/chat/completions` dialect; the binding's endpoint decides
//! which one.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::provider::{
    ChatMessage, LlmProvider, LlmReply, ProviderError, ProviderRequest, Role, ToolCall, Usage,
};

pub struct OpenAiProvider {
    client: reqwest::Client,
    provider_name: String,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    /// `base_url` without trailing slash; the chat path is appended.
    pub fn new(name: impl Into<String>, api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider_name: name.into(),
            api_key,
            base_url,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn complete(&self, req: &ProviderRequest) -> Result<LlmReply, ProviderError> {
        let body = build_request_body(req);
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(model = %req.model, provider = %self.provider_name, "sending chat completion");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, provider = %self.provider_name, body = %text, "chat completion API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_response(api_resp))
    }
}

fn build_request_body(req: &ProviderRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(message_to_json).collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "temperature": req.temperature,
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }

    body
}

fn message_to_json(msg: &ChatMessage) -> serde_json::Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
            "content": msg.text,
        }),
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let tool_calls: Vec<serde_json::Value> = msg
                .tool_calls
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let content = if msg.text.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::Value::String(msg.text.clone())
            };
            serde_json::json!({
                "role": "assistant",
                "content": content,
                "tool_calls": tool_calls,
            })
        }
        _ if !msg.images.is_empty() => {
            // Vision input: text plus data-URL image parts.
            let mut parts = vec![serde_json::json!({ "type": "text", "text": msg.text })];
            for image in &msg.images {
                parts.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", image.mime, image.base64),
                    }
                }));
            }
            serde_json::json!({ "role": role_str(msg.role), "content": parts })
        }
        _ => serde_json::json!({ "role": role_str(msg.role), "content": msg.text }),
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn parse_response(resp: ApiResponse) -> LlmReply {
    let choice = resp.choices.into_iter().next();
    let text = choice
        .as_ref()
        .and_then(|c| c.message.content.as_deref())
        .unwrap_or("")
        .to_string();

    let tool_calls: Vec<ToolCall> = choice
        .as_ref()
        .and_then(|c| c.message.tool_calls.as_ref())
        .map(|calls| {
            calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: serde_json::from_str(&tc.function.arguments).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    LlmReply {
        text,
        tool_calls,
        usage: Usage {
            prompt_tokens: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: resp
                .usage
                .as_ref()
                .map(|u| u.completion_tokens)
                .unwrap_or(0),
        },
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ImagePart;

    fn request(messages: Vec<ChatMessage>) -> ProviderRequest {
        ProviderRequest {
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 256,
            messages,
            tools: Vec::new(),
        }
    }

    #[test]
    fn tool_result_message_uses_tool_role() {
        let body = build_request_body(&request(vec![ChatMessage::tool_result(
            "call_1",
            "get_weather",
            "{\"temp\":-3}",
        )]));
        let msg = &body["messages"][0];
        assert_eq!(msg["role"], "tool");
        assert_eq!(msg["tool_call_id"], "call_1");
    }

    #[test]
    fn assistant_tool_calls_are_echoed() {
        let mut assistant = ChatMessage::assistant("");
        assistant.tool_calls.push(ToolCall {
            id: "call_1".to_string(),
            name: "get_weather".to_string(),
            arguments: serde_json::json!({"city": "Minsk"}),
        });
        let body = build_request_body(&request(vec![assistant]));
        let msg = &body["messages"][0];
        assert_eq!(msg["tool_calls"][0]["function"]["name"], "get_weather");
        assert!(msg["content"].is_null());
    }

    #[test]
    fn images_become_data_urls() {
        let mut user = ChatMessage::user("what is this?");
        user.images.push(ImagePart {
            mime: "image/png".to_string(),
            base64: "aGk=".to_string(),
        });
        let body = build_request_body(&request(vec![user]));
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn response_parse_extracts_tool_calls() {
        let raw = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "web_search", "arguments": "{\"query\":\"rust\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5 }
        });
        let resp: ApiResponse = serde_json::from_value(raw).unwrap();
        let reply = parse_response(resp);
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "web_search");
        assert_eq!(reply.tool_calls[0].arguments["query"], "rust");
        assert_eq!(reply.usage.prompt_tokens, 10);
    }
}
