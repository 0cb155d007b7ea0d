//! The spam gate. Runs before any reply logic: scores unwhitelisted
//! messages against the Bayes filter and, above the chat's threshold,
//! executes the configured action and stops the chain — no LLM call ever
//! happens for a spam message.

use async_trait::async_trait;
use tracing::{info, warn};

use govorun_channels::types::{EventKind, IncomingEvent, OutgoingAction};
use govorun_storage::types::{MessageCategory, SpamReason, SpamRecord};

use crate::app::App;
use crate::error::Result;
use crate::handlers::{Flow, Handler};
use crate::pipeline;
use crate::settings::ResolvedSettings;

pub struct SpamGate;

#[async_trait]
impl Handler for SpamGate {
    fn name(&self) -> &'static str {
        "spam-gate"
    }

    fn matches(&self, event: &IncomingEvent, settings: &ResolvedSettings) -> bool {
        event.kind == EventKind::MessageCreated && settings.detect_spam() && !event.user.is_bot
    }

    async fn handle(
        &self,
        app: &App,
        event: &IncomingEvent,
        settings: &ResolvedSettings,
    ) -> Result<Flow> {
        let Some(message) = &event.message else {
            return Ok(Flow::Continue);
        };
        // Admins and owners are whitelisted.
        if app
            .is_admin(
                &event.platform,
                event.chat.chat_id,
                event.user.user_id,
                event.user.username.as_deref(),
            )
            .await
        {
            return Ok(Flow::Continue);
        }

        let score = app.spam.score(
            &message.text,
            Some(event.chat.chat_id),
            settings.locale(),
        )?;
        if score < settings.spam_score_threshold() {
            return Ok(Flow::Continue);
        }

        info!(
            chat = event.chat.chat_id,
            user = event.user.user_id,
            score,
            action = settings.spam_action(),
            "spam detected"
        );

        let record = SpamRecord {
            chat_id: event.chat.chat_id,
            user_id: event.user.user_id,
            message_id: message.message_id.clone(),
            text: message.text.clone(),
            reason: SpamReason::Auto,
            score,
        };
        // Category upgrade + spam row + spammer flag, one transaction.
        if let Err(e) = app.storage.mark_message_spam(&record, None) {
            warn!(chat = event.chat.chat_id, error = %e, "spam labeling failed");
        }

        let platform = app.platform(&event.platform)?;
        match settings.spam_action() {
            "ban" => {
                platform
                    .outbox
                    .submit(OutgoingAction::DeleteMessages {
                        chat_id: event.chat.chat_id,
                        message_ids: vec![message.message_id.clone()],
                    })
                    .await?;
                platform
                    .outbox
                    .submit(OutgoingAction::BanUser {
                        chat_id: event.chat.chat_id,
                        user_id: event.user.user_id,
                    })
                    .await?;
            }
            "delete" => {
                platform
                    .outbox
                    .submit(OutgoingAction::DeleteMessages {
                        chat_id: event.chat.chat_id,
                        message_ids: vec![message.message_id.clone()],
                    })
                    .await?;
            }
            _ => {
                let note = format!(
                    "Flagged a message from {} as spam (score {score:.2}). Admins can /unban or /learn_ham it.",
                    event.user.display_name
                );
                let sent = app
                    .send_text_now(&event.platform, event.chat.chat_id, event.chat.topic_id, &note, None)
                    .await?;
                pipeline::persist_bot_reply(
                    app,
                    event,
                    &sent.message_id,
                    &note,
                    MessageCategory::BotSpamNotification,
                )?;
            }
        }

        Ok(Flow::Halt)
    }
}
