//! The /configure wizard's passive listener.
//!
//! /configure stores a per-(user, chat) step in `user_data`; while a step is
//! active, this handler intercepts the user's plain-text answers. Step 1
//! picks a setting by number, step 2 supplies the value.

use async_trait::async_trait;

use govorun_channels::types::{EventKind, IncomingEvent};
use govorun_core::settings::ALL_KEYS;
use govorun_storage::types::MessageCategory;

use crate::app::App;
use crate::error::Result;
use crate::handlers::{Flow, Handler};
use crate::pipeline;
use crate::settings::ResolvedSettings;

pub const STEP_KEY: &str = "configure-step";

pub struct ConfigureWizard;

#[async_trait]
impl Handler for ConfigureWizard {
    fn name(&self) -> &'static str {
        "configure-wizard"
    }

    fn matches(&self, event: &IncomingEvent, _settings: &ResolvedSettings) -> bool {
        event.kind == EventKind::MessageCreated && !event.text().starts_with('/')
    }

    async fn handle(
        &self,
        app: &App,
        event: &IncomingEvent,
        settings: &ResolvedSettings,
    ) -> Result<Flow> {
        let chat_id = event.chat.chat_id;
        let user_id = event.user.user_id;
        let Some(step) = app.storage.get_user_data(user_id, chat_id, STEP_KEY, None)? else {
            return Ok(Flow::Continue);
        };

        let answer = event.text().trim();
        let reply = if step == "pick-key" {
            match answer
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| ALL_KEYS.get(i))
            {
                Some(key) => {
                    app.storage.set_user_data(
                        user_id,
                        chat_id,
                        STEP_KEY,
                        &format!("pick-value:{key}"),
                        None,
                    )?;
                    let current = settings
                        .entries()
                        .into_iter()
                        .find(|(name, _)| *name == key.as_str())
                        .map(|(_, value)| value)
                        .unwrap_or_default();
                    format!("Send a value for {key} (current: {current})")
                }
                None => {
                    app.storage.delete_user_data(user_id, chat_id, STEP_KEY, None)?;
                    "That is not a number from the list. Wizard closed.".to_string()
                }
            }
        } else if let Some(key_name) = step.strip_prefix("pick-value:") {
            let result = app
                .settings
                .set(chat_id, event.chat.kind, key_name, answer);
            app.storage.delete_user_data(user_id, chat_id, STEP_KEY, None)?;
            match result {
                Ok(stored) => format!("{key_name} = {stored}"),
                Err(e) => e.user_message(),
            }
        } else {
            app.storage.delete_user_data(user_id, chat_id, STEP_KEY, None)?;
            return Ok(Flow::Continue);
        };

        let message_id = event.message.as_ref().map(|m| m.message_id.clone());
        let sent = app
            .send_text_now(
                &event.platform,
                chat_id,
                event.chat.topic_id,
                &reply,
                message_id.as_deref(),
            )
            .await?;
        pipeline::persist_bot_reply(
            app,
            event,
            &sent.message_id,
            &reply,
            MessageCategory::BotCommandReply,
        )?;
        Ok(Flow::Halt)
    }
}

/// The /configure entry point: list settings and open step 1.
pub async fn start(app: &App, event: &IncomingEvent, settings: &ResolvedSettings) -> Result<String> {
    let mut listing = String::from("Which setting should change? Reply with a number:\n");
    for (i, (name, value)) in settings.entries().iter().enumerate() {
        listing.push_str(&format!("{}. {name} = {value}\n", i + 1));
    }
    app.storage.set_user_data(
        event.user.user_id,
        event.chat.chat_id,
        STEP_KEY,
        "pick-key",
        None,
    )?;
    Ok(listing)
}
