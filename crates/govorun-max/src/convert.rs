//! Normalization of Max updates into the common event surface.

use govorun_channels::types::{
    ChatRef, EventKind, IncomingEvent, IncomingMedia, IncomingMessage, UserRef,
};
use govorun_storage::types::{ChatKind, MessageType};

use crate::api::{MaxAttachment, MaxMessage, MaxUpdate, MaxUser};

pub const PLATFORM: &str = "max";

pub fn update_to_events(update: MaxUpdate) -> Vec<IncomingEvent> {
    match update {
        MaxUpdate::MessageCreated { message } => {
            vec![message_event(message, EventKind::MessageCreated)]
        }
        MaxUpdate::MessageEdited { message } => {
            vec![message_event(message, EventKind::MessageEdited)]
        }
        MaxUpdate::MessageRemoved {
            message_id,
            chat_id,
            user_id,
        } => vec![IncomingEvent {
            platform: PLATFORM.to_string(),
            chat: bare_chat(chat_id),
            user: bare_user(user_id),
            kind: EventKind::MessageDeleted,
            message: Some(IncomingMessage {
                message_id,
                date: 0,
                text: String::new(),
                message_type: MessageType::Text,
                reply_to: None,
                quote: None,
                media: Vec::new(),
                media_group_id: None,
                mentions: Vec::new(),
            }),
        }],
        MaxUpdate::MessageCallback { callback, message } => {
            let chat = message
                .as_ref()
                .map(|m| chat_ref(m))
                .unwrap_or_else(|| bare_chat(callback.user.user_id));
            vec![IncomingEvent {
                platform: PLATFORM.to_string(),
                chat,
                user: user_ref(&callback.user),
                kind: EventKind::Callback {
                    callback_id: callback.callback_id,
                    data: callback.payload.unwrap_or_default(),
                },
                message: None,
            }]
        }
        MaxUpdate::BotAdded { chat_id, user } => {
            vec![membership_event(chat_id, &user, EventKind::BotAdded)]
        }
        MaxUpdate::BotRemoved { chat_id, user } => {
            vec![membership_event(chat_id, &user, EventKind::BotRemoved)]
        }
        MaxUpdate::ChatTitleChanged { chat_id, user, .. } => {
            vec![membership_event(chat_id, &user, EventKind::TitleChanged)]
        }
        MaxUpdate::UserAdded { chat_id, user } => {
            vec![membership_event(chat_id, &user, EventKind::UserJoined)]
        }
        MaxUpdate::UserRemoved { chat_id, user } => {
            vec![membership_event(chat_id, &user, EventKind::UserLeft)]
        }
        MaxUpdate::DialogMuted { chat_id, user } => {
            vec![membership_event(chat_id, &user, EventKind::DialogMuted)]
        }
        MaxUpdate::Unknown => Vec::new(),
    }
}

fn message_event(message: MaxMessage, kind: EventKind) -> IncomingEvent {
    let chat = chat_ref(&message);
    let user = user_ref(&message.sender);
    let text = message.body.text.clone().unwrap_or_default();
    let media = extract_media(&message);
    let message_type = match media.first() {
        Some(m) if m.mime.starts_with("image/") => MessageType::Photo,
        Some(m) if m.mime.starts_with("video/") => MessageType::Video,
        Some(_) => MessageType::Document,
        None => MessageType::Text,
    };
    let reply_to = message
        .link
        .as_ref()
        .filter(|l| l.kind == "reply")
        .and_then(|l| l.message.as_ref())
        .map(|m| m.body.mid.clone());
    let mentions = text
        .split_whitespace()
        .filter_map(|w| w.strip_prefix('@'))
        .map(|m| m.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '_').to_string())
        .filter(|m| !m.is_empty())
        .collect();

    IncomingEvent {
        platform: PLATFORM.to_string(),
        chat,
        user,
        kind,
        message: Some(IncomingMessage {
            message_id: message.body.mid.clone(),
            // Max timestamps are in milliseconds.
            date: message.timestamp / 1000,
            text,
            message_type,
            reply_to,
            quote: None,
            media,
            media_group_id: None,
            mentions,
        }),
    }
}

fn extract_media(message: &MaxMessage) -> Vec<IncomingMedia> {
    message
        .body
        .attachments
        .iter()
        .filter_map(|attachment| {
            let (payload, mime) = match attachment {
                MaxAttachment::Image { payload } => (payload, "image/jpeg"),
                MaxAttachment::Video { payload } => (payload, "video/mp4"),
                MaxAttachment::File { payload } => (payload, "application/octet-stream"),
                MaxAttachment::Unknown => return None,
            };
            let file_id = payload
                .token
                .clone()
                .or_else(|| payload.file_id.clone())
                .or_else(|| payload.url.clone())?;
            Some(IncomingMedia {
                file_unique_id: file_id.clone(),
                file_id,
                mime: mime.to_string(),
                size: 0,
            })
        })
        .collect()
}

fn chat_ref(message: &MaxMessage) -> ChatRef {
    let kind = match message.recipient.chat_type.as_str() {
        "dialog" => ChatKind::Private,
        "channel" => ChatKind::Channel,
        _ => ChatKind::Group,
    };
    ChatRef {
        chat_id: message.recipient.chat_id,
        kind,
        title: message.recipient.title.clone().unwrap_or_default(),
        // Max has no forum topics.
        topic_id: 0,
    }
}

fn membership_event(chat_id: i64, user: &MaxUser, kind: EventKind) -> IncomingEvent {
    IncomingEvent {
        platform: PLATFORM.to_string(),
        chat: bare_chat(chat_id),
        user: user_ref(user),
        kind,
        message: None,
    }
}

fn user_ref(user: &MaxUser) -> UserRef {
    UserRef {
        user_id: user.user_id,
        display_name: user.name.clone(),
        username: user.username.clone(),
        is_bot: user.is_bot,
    }
}

fn bare_chat(chat_id: i64) -> ChatRef {
    ChatRef {
        chat_id,
        kind: ChatKind::Group,
        title: String::new(),
        topic_id: 0,
    }
}

fn bare_user(user_id: i64) -> UserRef {
    UserRef {
        user_id,
        display_name: String::new(),
        username: None,
        is_bot: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_message_normalizes() {
        let update: MaxUpdate = serde_json::from_value(serde_json::json!({
            "update_type": "message_created",
            "message": {
                "sender": { "user_id": 42, "name": "Dood", "username": "dood" },
                "recipient": { "chat_id": -100, "chat_type": "chat", "title": "g" },
                "body": { "mid": "mid.1", "seq": 5, "text": "hey @govorun" },
                "timestamp": 1700000000000i64
            }
        }))
        .unwrap();
        let events = update_to_events(update);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MessageCreated);
        assert_eq!(events[0].chat.chat_id, -100);
        let msg = events[0].message.as_ref().unwrap();
        assert_eq!(msg.message_id, "mid.1");
        assert_eq!(msg.date, 1_700_000_000);
        assert_eq!(msg.mentions, vec!["govorun".to_string()]);
    }

    #[test]
    fn dialog_maps_to_private_kind() {
        let update: MaxUpdate = serde_json::from_value(serde_json::json!({
            "update_type": "message_created",
            "message": {
                "sender": { "user_id": 42, "name": "Dood" },
                "recipient": { "chat_id": 42, "chat_type": "dialog" },
                "body": { "mid": "mid.2", "seq": 1, "text": "hi" },
                "timestamp": 1700000000000i64
            }
        }))
        .unwrap();
        let events = update_to_events(update);
        assert_eq!(events[0].chat.kind, ChatKind::Private);
    }

    #[test]
    fn image_attachment_extracted() {
        let update: MaxUpdate = serde_json::from_value(serde_json::json!({
            "update_type": "message_created",
            "message": {
                "sender": { "user_id": 42, "name": "Dood" },
                "recipient": { "chat_id": -100, "chat_type": "chat" },
                "body": {
                    "mid": "mid.3", "seq": 2, "text": null,
                    "attachments": [
                        { "type": "image", "payload": { "token": "tok-1" } }
                    ]
                },
                "timestamp": 1700000000000i64
            }
        }))
        .unwrap();
        let events = update_to_events(update);
        let msg = events[0].message.as_ref().unwrap();
        assert_eq!(msg.message_type, MessageType::Photo);
        assert_eq!(msg.media[0].file_id, "tok-1");
    }

    #[test]
    fn unknown_updates_produce_nothing() {
        let update: MaxUpdate =
            serde_json::from_value(serde_json::json!({ "update_type": "novel_thing" })).unwrap();
        assert!(update_to_events(update).is_empty());
    }
}
