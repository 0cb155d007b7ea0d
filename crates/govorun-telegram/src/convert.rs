//! Normalization of Telegram updates into the common event surface.

use govorun_channels::types::{
    ChatRef, EventKind, IncomingEvent, IncomingMedia, IncomingMessage, UserRef,
};
use govorun_storage::types::{ChatKind, MessageType};

use crate::api::{select_photo_size, TgChat, TgMessage, TgUser, Update};

pub const PLATFORM: &str = "telegram";

/// Photo variants below this larger-dimension target are skipped when one at
/// or above it exists.
pub const PHOTO_TARGET_DIMENSION: i64 = 1280;

/// Convert one update into zero or more normalized events.
/// `bot_user_id` distinguishes bot_added/bot_removed from member churn.
pub fn update_to_events(update: Update, bot_user_id: i64) -> Vec<IncomingEvent> {
    let mut events = Vec::new();

    if let Some(msg) = update.message {
        events.extend(message_events(msg, bot_user_id, EventKind::MessageCreated));
    }
    if let Some(msg) = update.edited_message {
        events.extend(message_events(msg, bot_user_id, EventKind::MessageEdited));
    }
    if let Some(callback) = update.callback_query {
        let chat = callback
            .message
            .as_ref()
            .map(|m| chat_ref(&m.chat, m.message_thread_id.unwrap_or(0)))
            .unwrap_or_else(|| ChatRef {
                chat_id: callback.from.id,
                kind: ChatKind::Private,
                title: String::new(),
                topic_id: 0,
            });
        events.push(IncomingEvent {
            platform: PLATFORM.to_string(),
            chat,
            user: user_ref(&callback.from),
            kind: EventKind::Callback {
                callback_id: callback.id,
                data: callback.data.unwrap_or_default(),
            },
            message: None,
        });
    }
    if let Some(member) = update.my_chat_member {
        let kind = match member.new_chat_member.status.as_str() {
            "member" | "administrator" => EventKind::BotAdded,
            "left" | "kicked" => EventKind::BotRemoved,
            _ => return events,
        };
        events.push(IncomingEvent {
            platform: PLATFORM.to_string(),
            chat: chat_ref(&member.chat, 0),
            user: user_ref(&member.from),
            kind,
            message: None,
        });
    }

    events
}

fn message_events(msg: TgMessage, bot_user_id: i64, base_kind: EventKind) -> Vec<IncomingEvent> {
    let mut events = Vec::new();
    let topic_id = msg.message_thread_id.unwrap_or(0);
    let chat = chat_ref(&msg.chat, topic_id);

    // Service messages first: membership and title changes.
    if let Some(joined) = &msg.new_chat_members {
        for user in joined {
            let kind = if user.id == bot_user_id {
                EventKind::BotAdded
            } else {
                EventKind::UserJoined
            };
            events.push(IncomingEvent {
                platform: PLATFORM.to_string(),
                chat: chat.clone(),
                user: user_ref(user),
                kind,
                message: None,
            });
        }
        return events;
    }
    if let Some(left) = &msg.left_chat_member {
        let kind = if left.id == bot_user_id {
            EventKind::BotRemoved
        } else {
            EventKind::UserLeft
        };
        events.push(IncomingEvent {
            platform: PLATFORM.to_string(),
            chat,
            user: user_ref(left),
            kind,
            message: None,
        });
        return events;
    }
    if msg.new_chat_title.is_some() {
        let user = msg.from.as_ref().map(user_ref).unwrap_or_else(channel_user);
        events.push(IncomingEvent {
            platform: PLATFORM.to_string(),
            chat,
            user,
            kind: EventKind::TitleChanged,
            message: None,
        });
        return events;
    }

    let user = msg.from.as_ref().map(user_ref).unwrap_or_else(channel_user);
    let text = msg
        .text
        .clone()
        .or_else(|| msg.caption.clone())
        .unwrap_or_default();
    let mentions = extract_mentions(&text);

    let (message_type, media) = extract_media(&msg);
    events.push(IncomingEvent {
        platform: PLATFORM.to_string(),
        chat,
        user,
        kind: base_kind,
        message: Some(IncomingMessage {
            message_id: msg.message_id.to_string(),
            date: msg.date,
            text,
            message_type,
            reply_to: msg.reply_to_message.as_ref().map(|r| r.message_id.to_string()),
            quote: msg.quote.as_ref().map(|q| q.text.clone()),
            media,
            media_group_id: msg.media_group_id.clone(),
            mentions,
        }),
    });
    events
}

fn extract_media(msg: &TgMessage) -> (MessageType, Vec<IncomingMedia>) {
    if let Some(photos) = &msg.photo {
        let selected = select_photo_size(photos, PHOTO_TARGET_DIMENSION);
        let media = selected
            .map(|p| {
                vec![IncomingMedia {
                    file_unique_id: p.file_unique_id.clone(),
                    file_id: p.file_id.clone(),
                    mime: "image/jpeg".to_string(),
                    size: p.file_size.unwrap_or(0),
                }]
            })
            .unwrap_or_default();
        return (MessageType::Photo, media);
    }
    if let Some(video) = &msg.video {
        return (
            MessageType::Video,
            vec![IncomingMedia {
                file_unique_id: video.file_unique_id.clone(),
                file_id: video.file_id.clone(),
                mime: video.mime_type.clone().unwrap_or_default(),
                size: video.file_size.unwrap_or(0),
            }],
        );
    }
    if let Some(doc) = &msg.document {
        return (
            MessageType::Document,
            vec![IncomingMedia {
                file_unique_id: doc.file_unique_id.clone(),
                file_id: doc.file_id.clone(),
                mime: doc.mime_type.clone().unwrap_or_default(),
                size: doc.file_size.unwrap_or(0),
            }],
        );
    }
    (MessageType::Text, Vec::new())
}

fn chat_ref(chat: &TgChat, topic_id: i64) -> ChatRef {
    let kind = match chat.kind.as_str() {
        "private" => ChatKind::Private,
        "channel" => ChatKind::Channel,
        _ if chat.is_forum => ChatKind::Forum,
        _ => ChatKind::Group,
    };
    ChatRef {
        chat_id: chat.id,
        kind,
        title: chat.title.clone().unwrap_or_default(),
        topic_id,
    }
}

fn user_ref(user: &TgUser) -> UserRef {
    UserRef {
        user_id: user.id,
        display_name: user.display_name(),
        username: user.username.clone(),
        is_bot: user.is_bot,
    }
}

/// Anonymous channel posts carry no `from`; attribute them to a synthetic
/// channel author so stats and permissions have a stable key.
fn channel_user() -> UserRef {
    UserRef {
        user_id: 0,
        display_name: "channel".to_string(),
        username: None,
        is_bot: false,
    }
}

fn extract_mentions(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter_map(|word| word.strip_prefix('@'))
        .map(|m| m.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '_'))
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_update(text: &str) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 42,
                "date": 1700000000,
                "chat": { "id": -100, "type": "supergroup", "title": "g" },
                "from": { "id": 7, "first_name": "Dood", "username": "dood" },
                "text": text
            }
        }))
        .unwrap()
    }

    #[test]
    fn message_becomes_message_created() {
        let events = update_to_events(text_update("hello"), 999);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MessageCreated);
        assert_eq!(events[0].chat.chat_id, -100);
        assert_eq!(events[0].text(), "hello");
        assert_eq!(events[0].message.as_ref().unwrap().message_id, "42");
    }

    #[test]
    fn mentions_are_extracted() {
        let events = update_to_events(text_update("hey @govorun_bot, and @other!"), 999);
        let mentions = &events[0].message.as_ref().unwrap().mentions;
        assert_eq!(mentions, &["govorun_bot".to_string(), "other".to_string()]);
    }

    #[test]
    fn bot_join_maps_to_bot_added() {
        let update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 2,
            "message": {
                "message_id": 43,
                "date": 1700000000,
                "chat": { "id": -100, "type": "group", "title": "g" },
                "from": { "id": 7, "first_name": "Admin" },
                "new_chat_members": [
                    { "id": 999, "first_name": "Govorun", "is_bot": true },
                    { "id": 8, "first_name": "Guest" }
                ]
            }
        }))
        .unwrap();
        let events = update_to_events(update, 999);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::BotAdded);
        assert_eq!(events[1].kind, EventKind::UserJoined);
    }

    #[test]
    fn photo_message_selects_one_variant() {
        let update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 3,
            "message": {
                "message_id": 44,
                "date": 1700000000,
                "chat": { "id": -100, "type": "group" },
                "from": { "id": 7, "first_name": "Dood" },
                "caption": "look",
                "media_group_id": "G",
                "photo": [
                    { "file_id": "s", "file_unique_id": "us", "width": 90, "height": 67 },
                    { "file_id": "l", "file_unique_id": "ul", "width": 1280, "height": 960 }
                ]
            }
        }))
        .unwrap();
        let events = update_to_events(update, 999);
        let msg = events[0].message.as_ref().unwrap();
        assert_eq!(msg.message_type, MessageType::Photo);
        assert_eq!(msg.media.len(), 1);
        assert_eq!(msg.media[0].file_id, "l");
        assert_eq!(msg.media_group_id.as_deref(), Some("G"));
        assert_eq!(msg.text, "look");
    }

    #[test]
    fn forum_chat_kind_detected() {
        let update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 4,
            "message": {
                "message_id": 45,
                "date": 1700000000,
                "message_thread_id": 17,
                "chat": { "id": -100, "type": "supergroup", "title": "f", "is_forum": true },
                "from": { "id": 7, "first_name": "Dood" },
                "text": "in topic"
            }
        }))
        .unwrap();
        let events = update_to_events(update, 999);
        assert_eq!(events[0].chat.kind, ChatKind::Forum);
        assert_eq!(events[0].chat.topic_id, 17);
    }
}
