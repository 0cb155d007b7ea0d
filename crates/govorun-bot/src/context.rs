//! Context assembly for the LLM call.
//!
//! Recent chat history is packed newest-first into a character budget
//! (~4 chars per token). When the window cuts older history off and a
//! memoized summary of exactly that older range exists, it rides along as
//! an extra system message. The logical conversation root joins the window
//! even when it fell out of the recent slice.

use tracing::warn;

use govorun_cache::summary;
use govorun_channels::types::{IncomingEvent, IncomingMedia};
use govorun_llm::{ChatMessage, ImagePart};
use govorun_storage::types::{MediaStatus, MessageCategory, StoredMessage};

use crate::app::App;
use crate::error::Result;
use crate::settings::ResolvedSettings;
use crate::summarize::SUMMARY_PROMPT;

const HISTORY_FETCH: usize = 100;

pub async fn build(
    app: &App,
    event: &IncomingEvent,
    settings: &ResolvedSettings,
) -> Result<Vec<ChatMessage>> {
    let Some(incoming) = &event.message else {
        return Ok(Vec::new());
    };
    let chat_id = event.chat.chat_id;
    let topic_id = event.chat.topic_id;
    let budget_chars = app.config.bot.context_token_budget * 4;

    let history = app
        .storage
        .recent_messages(chat_id, topic_id, HISTORY_FETCH, None)
        .unwrap_or_default();

    // Pack newest-first until the budget is spent; the incoming message is
    // excluded (it is appended as the final user turn).
    let mut spent = 0usize;
    let mut window: Vec<&StoredMessage> = Vec::new();
    for msg in history
        .iter()
        .rev()
        .filter(|m| m.message_id != incoming.message_id)
    {
        let cost = msg.text.len() + 16;
        if spent + cost > budget_chars && !window.is_empty() {
            break;
        }
        spent += cost;
        window.push(msg);
    }
    window.reverse();

    // Summary of the range that fell off the window, if one was memoized.
    let cut: Vec<&StoredMessage> = history
        .iter()
        .filter(|m| {
            !window.iter().any(|w| w.message_id == m.message_id)
                && m.message_id != incoming.message_id
        })
        .collect();
    let older_summary = match (cut.first(), cut.last()) {
        (Some(first), Some(last)) => {
            let csid = summary::csid(
                chat_id,
                topic_id,
                &first.message_id,
                &last.message_id,
                SUMMARY_PROMPT,
            );
            summary::lookup(&app.storage, &csid)
        }
        _ => None,
    };

    // The conversation root: make sure the head of the thread is present.
    let root_messages = match incoming
        .reply_to
        .as_ref()
        .and_then(|reply_to| app.storage.get_message(chat_id, reply_to, None).ok())
        .and_then(|parent| parent.root_message_id.or(Some(parent.message_id)))
    {
        Some(root_id) if !window.iter().any(|m| m.message_id == root_id) => app
            .storage
            .conversation_messages(chat_id, &root_id, None)
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let mut out = Vec::new();
    out.push(ChatMessage::system(system_prompt(app, event, settings)));
    if let Some(summary_text) = older_summary {
        out.push(ChatMessage::system(format!(
            "Earlier in this chat: {summary_text}"
        )));
    }
    for msg in root_messages.iter().take(10) {
        out.push(to_chat_message(app, event, msg));
    }
    for msg in window {
        out.push(to_chat_message(app, event, msg));
    }

    // The current turn, with image parts when vision is on.
    let mut current = ChatMessage::user(format!(
        "{}: {}",
        event.user.display_name,
        incoming.text
    ));
    if settings.parse_images() && !incoming.media.is_empty() {
        current.images = fetch_images(app, event, &incoming.media).await;
    }
    out.push(current);
    Ok(out)
}

fn system_prompt(app: &App, event: &IncomingEvent, settings: &ResolvedSettings) -> String {
    let bot_name = app
        .platform(&event.platform)
        .map(|p| p.bot_username.clone())
        .unwrap_or_default();
    let mut prompt = format!(
        "You are {bot_name}, a helpful chat assistant in the {} chat \"{}\". \
         Answer in the language of the conversation (chat locale: {}). \
         Be concise; this is a chat, not an essay.",
        event.chat.kind, event.chat.title, settings.locale()
    );
    if let Ok(Some(note)) = app.storage.get_user_data(
        event.user.user_id,
        event.chat.chat_id,
        "persona-note",
        None,
    ) {
        prompt.push_str(&format!("\nAbout {}: {note}", event.user.display_name));
    }
    prompt
}

fn to_chat_message(app: &App, event: &IncomingEvent, msg: &StoredMessage) -> ChatMessage {
    let from_bot = matches!(
        msg.category,
        MessageCategory::Bot
            | MessageCategory::BotCommandReply
            | MessageCategory::BotSummary
            | MessageCategory::BotResended
            | MessageCategory::BotError
            | MessageCategory::BotSpamNotification
    );
    if from_bot {
        ChatMessage::assistant(msg.text.clone())
    } else {
        let name = app
            .storage
            .get_chat_user(msg.chat_id, msg.user_id, None)
            .map(|u| u.display_name)
            .unwrap_or_else(|_| "someone".to_string());
        ChatMessage::user(format!("{name}: {}", msg.text))
    }
}

/// Download the event's attachments for vision input, advancing each
/// attachment through `new → pending → done|failed`.
async fn fetch_images(app: &App, event: &IncomingEvent, media: &[IncomingMedia]) -> Vec<ImagePart> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let Ok(platform) = app.platform(&event.platform) else {
        return Vec::new();
    };
    let mut images = Vec::new();
    for item in media.iter().filter(|m| m.mime.starts_with("image/")) {
        let _ = app
            .storage
            .set_attachment_status(&item.file_unique_id, MediaStatus::Pending, None);
        match platform.outbound.download_file(&item.file_id).await {
            Ok(bytes) => {
                let _ = app
                    .storage
                    .set_attachment_status(&item.file_unique_id, MediaStatus::Done, None);
                images.push(ImagePart {
                    mime: item.mime.clone(),
                    base64: STANDARD.encode(&bytes),
                });
            }
            Err(e) => {
                warn!(file = %item.file_unique_id, error = %e, "image download failed");
                let _ = app
                    .storage
                    .set_attachment_status(&item.file_unique_id, MediaStatus::Failed, None);
            }
        }
    }
    images
}
