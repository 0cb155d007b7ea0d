//! Ordered handler dispatch.
//!
//! Handlers run in registration order for every event: each one gets a
//! predicate over the (event, resolved settings) pair and an async action
//! returning a [`Flow`]. `Halt` stops the chain — that is what "terminal"
//! means here; passive listeners return `Continue`. A handler error sends at
//! most one error reply per event and stops the chain.

pub mod bookkeeping;
pub mod callback;
pub mod command;
pub mod message;
pub mod spam_gate;
pub mod wizard;

use async_trait::async_trait;
use tracing::{error, warn};

use govorun_channels::types::{EventKind, IncomingEvent};
use govorun_storage::types::MessageCategory;

use crate::app::App;
use crate::error::{BotError, Result};
use crate::pipeline;
use crate::settings::ResolvedSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Let the next matching handler run.
    Continue,
    /// This handler was terminal for the event.
    Halt,
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, event: &IncomingEvent, settings: &ResolvedSettings) -> bool;

    async fn handle(
        &self,
        app: &App,
        event: &IncomingEvent,
        settings: &ResolvedSettings,
    ) -> Result<Flow>;
}

pub struct HandlerManager {
    handlers: Vec<Box<dyn Handler>>,
}

impl HandlerManager {
    /// The standard chain: bookkeeping → spam gate → callbacks → wizard →
    /// commands → LLM reply.
    pub fn standard() -> Self {
        Self {
            handlers: vec![
                Box::new(bookkeeping::Bookkeeping),
                Box::new(spam_gate::SpamGate),
                Box::new(callback::CallbackAck),
                Box::new(wizard::ConfigureWizard),
                Box::new(command::Commands),
                Box::new(message::LlmReply),
            ],
        }
    }

    pub async fn dispatch(&self, app: &App, event: &IncomingEvent) {
        let settings = app.settings.resolve(event.chat.chat_id, event.chat.kind);

        for handler in &self.handlers {
            if !handler.matches(event, &settings) {
                continue;
            }
            match handler.handle(app, event, &settings).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => break,
                Err(e) => {
                    error!(
                        handler = handler.name(),
                        platform = %event.platform,
                        chat = event.chat.chat_id,
                        error = %e,
                        "handler failed"
                    );
                    report_failure(app, event, &e).await;
                    break;
                }
            }
        }
    }
}

/// One user-visible error reply per event, persisted as `bot-error`.
async fn report_failure(app: &App, event: &IncomingEvent, error: &BotError) {
    if event.kind != EventKind::MessageCreated {
        return;
    }
    let Some(message) = &event.message else {
        return;
    };
    let text = error.user_message();
    match app
        .send_text_now(
            &event.platform,
            event.chat.chat_id,
            event.chat.topic_id,
            &text,
            Some(&message.message_id),
        )
        .await
    {
        Ok(sent) => {
            if let Err(e) = pipeline::persist_bot_reply(
                app,
                event,
                &sent.message_id,
                &text,
                MessageCategory::BotError,
            ) {
                warn!(error = %e, "failed to persist error reply");
            }
        }
        Err(e) => warn!(error = %e, "failed to deliver error reply"),
    }
}
