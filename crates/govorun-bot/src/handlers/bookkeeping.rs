//! Passive first handler: lazily creates chats and chat-users, persists
//! incoming messages (with daily-stat bumps inside the same transaction) and
//! registers media. Never terminal.

use async_trait::async_trait;
use tracing::{debug, warn};

use govorun_channels::types::{EventKind, IncomingEvent};
use govorun_storage::types::{
    Chat, ChatKind, ChatUser, MediaAttachment, MediaGroupMember, MediaStatus, MessageCategory,
    StoredMessage,
};
use govorun_storage::StorageError;

use crate::app::App;
use crate::error::Result;
use crate::handlers::{Flow, Handler};
use crate::settings::ResolvedSettings;

pub struct Bookkeeping;

#[async_trait]
impl Handler for Bookkeeping {
    fn name(&self) -> &'static str {
        "bookkeeping"
    }

    fn matches(&self, event: &IncomingEvent, _settings: &ResolvedSettings) -> bool {
        matches!(
            event.kind,
            EventKind::MessageCreated
                | EventKind::ChatCreated
                | EventKind::TitleChanged
                | EventKind::UserJoined
                | EventKind::BotAdded
        )
    }

    async fn handle(
        &self,
        app: &App,
        event: &IncomingEvent,
        _settings: &ResolvedSettings,
    ) -> Result<Flow> {
        let chat = Chat {
            chat_id: event.chat.chat_id,
            kind: event.chat.kind,
            title: event.chat.title.clone(),
            flags: 0,
        };
        if let Err(e) = app.storage.upsert_chat(&chat, None) {
            log_write_failure("chat upsert", event, &e);
        }

        if event.kind == EventKind::UserJoined || event.kind == EventKind::MessageCreated {
            let user = ChatUser::new(
                event.chat.chat_id,
                event.user.user_id,
                &event.user.display_name,
                event.user.username.as_deref(),
            );
            if let Err(e) = app.storage.upsert_chat_user(&user, None) {
                log_write_failure("chat user upsert", event, &e);
            }
        }

        if event.kind == EventKind::MessageCreated {
            if let Some(message) = &event.message {
                self.persist_incoming(app, event, message).await;
            }
        }

        Ok(Flow::Continue)
    }
}

impl Bookkeeping {
    async fn persist_incoming(
        &self,
        app: &App,
        event: &IncomingEvent,
        message: &govorun_channels::types::IncomingMessage,
    ) {
        let category = infer_category(event);
        let root_message_id = resolve_root(app, event, message);
        let stored = StoredMessage {
            chat_id: event.chat.chat_id,
            message_id: message.message_id.clone(),
            date: message.date,
            user_id: event.user.user_id,
            reply_id: message.reply_to.clone(),
            thread_id: event.chat.topic_id,
            root_message_id,
            text: message.text.clone(),
            message_type: message.message_type,
            category,
            quote: message.quote.clone(),
            media_id: message.media.first().map(|m| m.file_unique_id.clone()),
            media_group_id: message.media_group_id.clone(),
            markup: None,
            metadata: None,
        };
        if let Err(e) = app.storage.save_message(&stored, None) {
            log_write_failure("message persist", event, &e);
        }

        let now = chrono::Utc::now().timestamp();
        for media in &message.media {
            let attachment = MediaAttachment {
                file_unique_id: media.file_unique_id.clone(),
                status: MediaStatus::New,
                mime: media.mime.clone(),
                size: media.size,
                local_url: None,
                file_id: media.file_id.clone(),
                description: None,
                prompt: None,
            };
            if let Err(e) = app.storage.upsert_attachment(&attachment, None) {
                log_write_failure("attachment upsert", event, &e);
            }
            if let Some(group_id) = &message.media_group_id {
                let member = MediaGroupMember {
                    media_group_id: group_id.clone(),
                    media_id: media.file_unique_id.clone(),
                    chat_id: event.chat.chat_id,
                    message_id: message.message_id.clone(),
                    updated_at: now,
                    processed: false,
                };
                if let Err(e) = app.storage.upsert_group_member(&member, None) {
                    log_write_failure("media group upsert", event, &e);
                }
            }
        }
        debug!(
            chat = event.chat.chat_id,
            message = %message.message_id,
            category = %category,
            "incoming message persisted"
        );
    }
}

fn infer_category(event: &IncomingEvent) -> MessageCategory {
    if event.text().starts_with('/') {
        MessageCategory::UserCommand
    } else if event.chat.kind == ChatKind::Channel {
        MessageCategory::Channel
    } else {
        MessageCategory::User
    }
}

/// Root of the logical conversation: the replied-to message's root, or the
/// replied-to message itself when it has none.
fn resolve_root(
    app: &App,
    event: &IncomingEvent,
    message: &govorun_channels::types::IncomingMessage,
) -> Option<String> {
    let reply_to = message.reply_to.as_ref()?;
    match app.storage.get_message(event.chat.chat_id, reply_to, None) {
        Ok(parent) => Some(parent.root_message_id.unwrap_or(parent.message_id)),
        Err(_) => Some(reply_to.clone()),
    }
}

fn log_write_failure(what: &str, event: &IncomingEvent, error: &StorageError) {
    // Read-only mapped chats are expected to fail here; the pipeline still
    // answers the user.
    warn!(
        chat = event.chat.chat_id,
        platform = %event.platform,
        error = %error,
        "{what} failed"
    );
}
