//! Last handler in the chain: the conversational LLM reply for plain
//! messages, gated by the engagement decision.

use async_trait::async_trait;

use govorun_channels::types::{EventKind, IncomingEvent};

use crate::app::App;
use crate::error::Result;
use crate::handlers::{Flow, Handler};
use crate::pipeline;
use crate::settings::ResolvedSettings;

pub struct LlmReply;

#[async_trait]
impl Handler for LlmReply {
    fn name(&self) -> &'static str {
        "llm-reply"
    }

    fn matches(&self, event: &IncomingEvent, _settings: &ResolvedSettings) -> bool {
        event.kind == EventKind::MessageCreated
            && !event.text().starts_with('/')
            && !event.user.is_bot
    }

    async fn handle(
        &self,
        app: &App,
        event: &IncomingEvent,
        settings: &ResolvedSettings,
    ) -> Result<Flow> {
        if !pipeline::engaged(app, event, settings) {
            return Ok(Flow::Halt);
        }
        pipeline::respond(app, event, settings).await?;
        Ok(Flow::Halt)
    }
}
