//! Provider dispatch: resolves a model binding, applies per-provider rate
//! limiting, retries transient failures with exponential backoff, falls
//! through to configured fallback bindings, and drives the bounded tool loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use govorun_core::config::{LlmConfig, ProviderBinding, ProviderKind};
use govorun_limiter::{LimiterError, RateLimiter};

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAiProvider;
use crate::provider::{
    ChatMessage, LlmProvider, LlmReply, ProviderError, ProviderRequest, Role, ToolCall, Usage,
};
use crate::tools::{tool_specs, Tool, ToolResult};

const BACKOFF_BASE_MS: u64 = 500;

struct BindingSlot {
    config: ProviderBinding,
    provider: Box<dyn LlmProvider>,
}

pub struct Dispatcher {
    bindings: HashMap<String, BindingSlot>,
    limiter: Arc<RateLimiter>,
    config: LlmConfig,
}

impl Dispatcher {
    /// Build provider instances for every configured binding.
    pub fn from_config(
        providers: &HashMap<String, ProviderBinding>,
        config: LlmConfig,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let mut bindings = HashMap::new();
        for (id, binding) in providers {
            let provider: Box<dyn LlmProvider> = match binding.kind {
                ProviderKind::Openai => Box::new(OpenAiProvider::new(
                    id.clone(),
                    binding.api_key.clone(),
                    binding.endpoint.clone(),
                )),
                ProviderKind::Anthropic => Box::new(AnthropicProvider::new(
                    id.clone(),
                    binding.api_key.clone(),
                    binding.endpoint.clone(),
                )),
            };
            bindings.insert(
                id.clone(),
                BindingSlot {
                    config: binding.clone(),
                    provider,
                },
            );
        }
        Self {
            bindings,
            limiter,
            config,
        }
    }

    /// Inject pre-built providers; used by tests and custom wiring.
    pub fn with_providers(
        providers: Vec<(String, ProviderBinding, Box<dyn LlmProvider>)>,
        config: LlmConfig,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let bindings = providers
            .into_iter()
            .map(|(id, binding, provider)| {
                (
                    id,
                    BindingSlot {
                        config: binding,
                        provider,
                    },
                )
            })
            .collect();
        Self {
            bindings,
            limiter,
            config,
        }
    }

    pub fn binding(&self, id: &str) -> Option<&ProviderBinding> {
        self.bindings.get(id).map(|slot| &slot.config)
    }

    /// All bindings, sorted by id — for the owner-facing listing.
    pub fn list_bindings(&self) -> Vec<(&str, &ProviderBinding)> {
        let mut out: Vec<(&str, &ProviderBinding)> = self
            .bindings
            .iter()
            .map(|(id, slot)| (id.as_str(), &slot.config))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Run a full completion against `binding_id`, driving the model↔tool
    /// exchange as a bounded iterative loop. Tool calls within one turn
    /// execute in parallel; their results join the message list as `tool`
    /// messages before the next round.
    pub async fn complete(
        &self,
        binding_id: &str,
        messages: Vec<ChatMessage>,
        tools: &[Arc<dyn Tool>],
        cancel: Option<&CancellationToken>,
    ) -> Result<LlmReply, ProviderError> {
        let mut conversation = messages;
        let mut total_usage = Usage::default();

        for round in 0..=self.config.max_tool_depth {
            let reply = self
                .call_with_fallback(binding_id, &conversation, tools, cancel)
                .await?;
            total_usage.add(reply.usage);

            if reply.tool_calls.is_empty() || tools.is_empty() {
                info!(binding = binding_id, round, "completion finished");
                return Ok(LlmReply {
                    text: reply.text,
                    tool_calls: Vec::new(),
                    usage: total_usage,
                });
            }
            if round == self.config.max_tool_depth {
                break;
            }

            debug!(
                binding = binding_id,
                round,
                calls = reply.tool_calls.len(),
                "executing tool calls"
            );
            let mut assistant = ChatMessage::assistant(reply.text.clone());
            assistant.tool_calls = reply.tool_calls.clone();
            conversation.push(assistant);

            let results = join_all(
                reply
                    .tool_calls
                    .iter()
                    .map(|call| execute_tool(tools, call)),
            )
            .await;
            for (call, result) in reply.tool_calls.iter().zip(results) {
                let content = if result.is_error {
                    format!("error: {}", result.content)
                } else {
                    result.content
                };
                conversation.push(ChatMessage::tool_result(&call.id, &call.name, content));
            }
        }

        warn!(binding = binding_id, depth = self.config.max_tool_depth, "tool loop limit hit");
        Err(ProviderError::ToolLoopLimit(self.config.max_tool_depth))
    }

    /// One logical call: retries with backoff on the primary binding, then
    /// walks the fallback chain. Fatal errors surface immediately.
    async fn call_with_fallback(
        &self,
        binding_id: &str,
        messages: &[ChatMessage],
        tools: &[Arc<dyn Tool>],
        cancel: Option<&CancellationToken>,
    ) -> Result<LlmReply, ProviderError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = binding_id.to_string();
        let mut last_err: Option<ProviderError> = None;

        loop {
            if !visited.insert(current.clone()) {
                // Fallback cycle — stop with whatever we saw last.
                return Err(last_err
                    .unwrap_or_else(|| ProviderError::UnknownModel(current.clone())));
            }
            let slot = self
                .bindings
                .get(&current)
                .ok_or_else(|| ProviderError::UnknownModel(current.clone()))?;

            if messages.iter().any(|m| !m.images.is_empty()) && !slot.config.supports_vision {
                return Err(ProviderError::VisionUnsupported(current.clone()));
            }

            let request = ProviderRequest {
                model: slot.config.model_id.clone(),
                temperature: slot.config.temperature,
                max_tokens: self.config.max_tokens,
                messages: messages.to_vec(),
                tools: if slot.config.supports_tools {
                    tool_specs(tools)
                } else {
                    Vec::new()
                },
            };

            for attempt in 0..self.config.max_attempts.max(1) {
                self.limiter
                    .admit(&format!("llm:{current}"), None, cancel)
                    .await
                    .map_err(|e| match e {
                        LimiterError::Canceled | LimiterError::ShuttingDown => {
                            ProviderError::Cancelled
                        }
                    })?;

                match slot.provider.complete(&request).await {
                    Ok(reply) => {
                        if attempt > 0 {
                            info!(binding = %current, attempt, "provider succeeded after retry");
                        }
                        return Ok(reply);
                    }
                    Err(e) if e.is_transient() => {
                        warn!(binding = %current, attempt, error = %e, "transient provider error");
                        let backoff = match &e {
                            ProviderError::RateLimited { retry_after_ms } => {
                                (*retry_after_ms).max(BACKOFF_BASE_MS << attempt)
                            }
                            _ => BACKOFF_BASE_MS << attempt,
                        };
                        last_err = Some(e);
                        if attempt + 1 < self.config.max_attempts {
                            tokio::time::sleep(Duration::from_millis(backoff)).await;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            match &slot.config.fallback {
                Some(fallback) => {
                    info!(binding = %current, fallback = %fallback, "binding exhausted, trying fallback");
                    current = fallback.clone();
                }
                None => {
                    return Err(last_err.unwrap_or_else(|| ProviderError::Api {
                        status: 0,
                        message: "provider exhausted".to_string(),
                    }))
                }
            }
        }
    }
}

async fn execute_tool(tools: &[Arc<dyn Tool>], call: &ToolCall) -> ToolResult {
    match tools.iter().find(|t| t.name() == call.name) {
        Some(tool) => {
            debug!(tool = %call.name, "executing tool");
            tool.execute(call.arguments.clone()).await
        }
        None => ToolResult::error(format!("unknown tool: {}", call.name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use govorun_core::config::RateLimiterConfig;

    fn binding(fallback: Option<&str>) -> ProviderBinding {
        ProviderBinding {
            kind: ProviderKind::Openai,
            model_id: "test-model".to_string(),
            endpoint: "http://localhost".to_string(),
            api_key: String::new(),
            temperature: 0.7,
            context_size: 8192,
            supports_tools: true,
            supports_vision: false,
            fallback: fallback.map(String::from),
        }
    }

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(&RateLimiterConfig::default()))
    }

    fn config() -> LlmConfig {
        LlmConfig {
            default_model: None,
            max_tool_depth: 3,
            max_attempts: 2,
            max_tokens: 128,
        }
    }

    /// Provider that pops scripted results in order.
    struct Scripted {
        replies: Mutex<Vec<Result<LlmReply, ProviderError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(replies: Vec<Result<LlmReply, ProviderError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, _req: &ProviderRequest) -> Result<LlmReply, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(ProviderError::Parse("script exhausted".to_string()));
            }
            replies.remove(0)
        }
    }

    fn text_reply(text: &str) -> LlmReply {
        LlmReply {
            text: text.to_string(),
            tool_calls: Vec::new(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        }
    }

    fn tool_reply(name: &str) -> LlmReply {
        LlmReply {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: name.to_string(),
                arguments: serde_json::json!({"city": "Minsk"}),
            }],
            usage: Usage {
                prompt_tokens: 8,
                completion_tokens: 3,
            },
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "get_weather"
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(format!("weather in {}", input["city"].as_str().unwrap_or("?")))
        }
    }

    fn transient() -> ProviderError {
        ProviderError::Api {
            status: 503,
            message: "overloaded".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let dispatcher = Dispatcher::with_providers(
            vec![(
                "main".to_string(),
                binding(None),
                Box::new(Scripted::new(vec![Err(transient()), Ok(text_reply("ok"))])),
            )],
            config(),
            limiter(),
        );
        let reply = dispatcher
            .complete("main", vec![ChatMessage::user("hi")], &[], None)
            .await
            .unwrap();
        assert_eq!(reply.text, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn falls_through_to_fallback_binding() {
        let dispatcher = Dispatcher::with_providers(
            vec![
                (
                    "main".to_string(),
                    binding(Some("backup")),
                    Box::new(Scripted::new(vec![Err(transient()), Err(transient())])),
                ),
                (
                    "backup".to_string(),
                    binding(None),
                    Box::new(Scripted::new(vec![Ok(text_reply("from backup"))])),
                ),
            ],
            config(),
            limiter(),
        );
        let reply = dispatcher
            .complete("main", vec![ChatMessage::user("hi")], &[], None)
            .await
            .unwrap();
        assert_eq!(reply.text, "from backup");
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_skips_retry_and_fallback() {
        let dispatcher = Dispatcher::with_providers(
            vec![
                (
                    "main".to_string(),
                    binding(Some("backup")),
                    Box::new(Scripted::new(vec![Err(ProviderError::Api {
                        status: 401,
                        message: "bad key".to_string(),
                    })])),
                ),
                (
                    "backup".to_string(),
                    binding(None),
                    Box::new(Scripted::new(vec![Ok(text_reply("unused"))])),
                ),
            ],
            config(),
            limiter(),
        );
        let err = dispatcher
            .complete("main", vec![ChatMessage::user("hi")], &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 401, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_loop_executes_and_feeds_back() {
        let dispatcher = Dispatcher::with_providers(
            vec![(
                "main".to_string(),
                binding(None),
                Box::new(Scripted::new(vec![
                    Ok(tool_reply("get_weather")),
                    Ok(text_reply("it is -3C in Minsk")),
                ])),
            )],
            config(),
            limiter(),
        );
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool)];
        let reply = dispatcher
            .complete(
                "main",
                vec![ChatMessage::user("weather in Minsk?")],
                &tools,
                None,
            )
            .await
            .unwrap();
        assert_eq!(reply.text, "it is -3C in Minsk");
        // Usage accumulates across both rounds.
        assert_eq!(reply.usage.prompt_tokens, 18);
        assert_eq!(reply.usage.completion_tokens, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_loop_depth_is_bounded() {
        // The model keeps calling tools forever.
        let replies: Vec<Result<LlmReply, ProviderError>> =
            (0..10).map(|_| Ok(tool_reply("get_weather"))).collect();
        let dispatcher = Dispatcher::with_providers(
            vec![(
                "main".to_string(),
                binding(None),
                Box::new(Scripted::new(replies)),
            )],
            config(),
            limiter(),
        );
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool)];
        let err = dispatcher
            .complete("main", vec![ChatMessage::user("x")], &tools, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ToolLoopLimit(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn vision_input_rejected_without_support() {
        let dispatcher = Dispatcher::with_providers(
            vec![(
                "main".to_string(),
                binding(None),
                Box::new(Scripted::new(vec![Ok(text_reply("unused"))])),
            )],
            config(),
            limiter(),
        );
        let mut msg = ChatMessage::user("what is this?");
        msg.images.push(crate::provider::ImagePart {
            mime: "image/png".to_string(),
            base64: "aGk=".to_string(),
        });
        let err = dispatcher
            .complete("main", vec![msg], &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::VisionUnsupported(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_binding_errors() {
        let dispatcher =
            Dispatcher::with_providers(Vec::new(), config(), limiter());
        let err = dispatcher
            .complete("ghost", vec![ChatMessage::user("x")], &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownModel(_)));
    }
}
