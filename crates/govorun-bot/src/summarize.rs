//! Memoized conversation summarization.
//!
//! A summarization job is addressed by the digest of (chat, topic, first
//! message, last message, prompt); a repeat of the same job returns the
//! stored summary byte-identical without touching the model.

use std::sync::Arc;

use tracing::info;

use govorun_cache::summary;
use govorun_llm::{ChatMessage, Dispatcher};
use govorun_storage::types::StoredMessage;
use govorun_storage::StorageRouter;

use crate::error::{BotError, Result};

pub const SUMMARY_PROMPT: &str =
    "Summarize this chat conversation concisely. Keep decisions, facts and open questions; drop chit-chat.";

pub async fn summarize_messages(
    dispatcher: &Arc<Dispatcher>,
    storage: &Arc<StorageRouter>,
    model: &str,
    chat_id: i64,
    topic_id: i64,
    messages: &[StoredMessage],
) -> Result<String> {
    let (Some(first), Some(last)) = (messages.first(), messages.last()) else {
        return Err(BotError::Validation("Nothing to summarize yet.".to_string()));
    };

    let csid = summary::csid(
        chat_id,
        topic_id,
        &first.message_id,
        &last.message_id,
        SUMMARY_PROMPT,
    );
    if let Some(hit) = summary::lookup(storage, &csid) {
        info!(chat = chat_id, csid = %csid, "summary served from memo");
        return Ok(hit);
    }

    let mut transcript = String::new();
    for msg in messages {
        let name = storage
            .get_chat_user(msg.chat_id, msg.user_id, None)
            .map(|u| u.display_name)
            .unwrap_or_else(|_| "someone".to_string());
        transcript.push_str(&format!("{name}: {}\n", msg.text));
    }

    let reply = dispatcher
        .complete(
            model,
            vec![
                ChatMessage::system(SUMMARY_PROMPT),
                ChatMessage::user(transcript),
            ],
            &[],
            None,
        )
        .await?;

    summary::store(storage, &csid, &reply.text);
    Ok(reply.text)
}
