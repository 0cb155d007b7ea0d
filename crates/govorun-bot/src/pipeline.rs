//! Reply-side plumbing shared by handlers: engagement decision, the LLM
//! round trip, chunked sending and reply persistence with thread linkage.

use rand::Rng;
use tracing::{debug, info, warn};

use govorun_channels::types::{IncomingEvent, OutgoingAction};
use govorun_llm::ChatMessage;
use govorun_storage::types::{ChatKind, ChatUser, MessageCategory, MessageType, StoredMessage};

use crate::app::App;
use crate::context;
use crate::error::Result;
use crate::llm_tools;
use crate::settings::ResolvedSettings;

/// Decide whether the bot answers an unaddressed message.
///
/// The bot engages when it was addressed (private chat, @-mention, or a
/// reply to one of its own messages) or when the random-answer draw fires.
pub fn engaged(app: &App, event: &IncomingEvent, settings: &ResolvedSettings) -> bool {
    if event.chat.kind == ChatKind::Private {
        return true;
    }
    let Some(message) = &event.message else {
        return false;
    };
    let Ok(platform) = app.platform(&event.platform) else {
        return false;
    };

    if message
        .mentions
        .iter()
        .any(|m| m.eq_ignore_ascii_case(&platform.bot_username))
    {
        return true;
    }
    if let Some(reply_to) = &message.reply_to {
        if let Ok(parent) = app.storage.get_message(event.chat.chat_id, reply_to, None) {
            if is_bot_category(parent.category) {
                return true;
            }
        }
    }

    let probability = settings.random_answer_probability();
    probability > 0.0 && rand::thread_rng().gen::<f64>() < probability
}

fn is_bot_category(category: MessageCategory) -> bool {
    matches!(
        category,
        MessageCategory::Bot
            | MessageCategory::BotCommandReply
            | MessageCategory::BotSummary
            | MessageCategory::BotResended
    )
}

/// Full answer path: context → tools → dispatcher → send → persist.
pub async fn respond(app: &App, event: &IncomingEvent, settings: &ResolvedSettings) -> Result<()> {
    let Some(message) = &event.message else {
        return Ok(());
    };

    // Keep the typing indicator alive while the model thinks.
    let platform = app.platform(&event.platform)?;
    let _ = platform
        .outbox
        .submit(OutgoingAction::SendAction {
            chat_id: event.chat.chat_id,
            action: "typing".to_string(),
        })
        .await;

    let messages: Vec<ChatMessage> = context::build(app, event, settings).await?;
    let tools = llm_tools::build(app, event, settings);
    let model = app.model_for(settings.chat_model())?;

    debug!(
        chat = event.chat.chat_id,
        model = %model,
        history = messages.len(),
        tools = tools.len(),
        "invoking model"
    );
    let reply = app
        .dispatcher
        .complete(&model, messages, &tools, None)
        .await?;
    if reply.text.trim().is_empty() {
        debug!(chat = event.chat.chat_id, "model returned empty text; staying silent");
        return Ok(());
    }

    info!(
        chat = event.chat.chat_id,
        tokens_in = reply.usage.prompt_tokens,
        tokens_out = reply.usage.completion_tokens,
        "reply ready"
    );

    let sent = app
        .send_text_now(
            &event.platform,
            event.chat.chat_id,
            event.chat.topic_id,
            &reply.text,
            Some(&message.message_id),
        )
        .await?;
    persist_bot_reply(app, event, &sent.message_id, &reply.text, MessageCategory::Bot)?;
    Ok(())
}

/// Persist an outgoing bot message with reply and conversation-root linkage.
/// Storage failures only warn — the reply already reached the user.
pub fn persist_bot_reply(
    app: &App,
    event: &IncomingEvent,
    sent_message_id: &str,
    text: &str,
    category: MessageCategory,
) -> Result<()> {
    let Ok(platform) = app.platform(&event.platform) else {
        return Ok(());
    };
    let chat_id = event.chat.chat_id;
    let incoming_id = event.message.as_ref().map(|m| m.message_id.clone());

    // The reply joins the conversation rooted at the incoming message.
    let root_message_id = incoming_id.as_ref().map(|id| {
        app.storage
            .get_message(chat_id, id, None)
            .ok()
            .and_then(|m| m.root_message_id)
            .unwrap_or_else(|| id.clone())
    });

    let bot_user = ChatUser::new(
        chat_id,
        platform.bot_user_id,
        &platform.bot_username,
        Some(&platform.bot_username),
    );
    if let Err(e) = app.storage.upsert_chat_user(&bot_user, None) {
        warn!(chat = chat_id, error = %e, "bot chat-user upsert failed");
        return Ok(());
    }

    let stored = StoredMessage {
        chat_id,
        message_id: sent_message_id.to_string(),
        date: chrono::Utc::now().timestamp(),
        user_id: platform.bot_user_id,
        reply_id: incoming_id,
        thread_id: event.chat.topic_id,
        root_message_id,
        text: text.to_string(),
        message_type: MessageType::Text,
        category,
        quote: None,
        media_id: None,
        media_group_id: None,
        markup: None,
        metadata: None,
    };
    if let Err(e) = app.storage.save_message(&stored, None) {
        warn!(chat = chat_id, error = %e, "bot reply persist failed");
    }
    Ok(())
}
