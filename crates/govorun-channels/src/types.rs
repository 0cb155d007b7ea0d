//! Platform-neutral event and action types.
//!
//! Both adapters normalize their native updates into [`IncomingEvent`] and
//! accept [`OutgoingAction`]s, so handlers never see platform SDK types.

use serde::{Deserialize, Serialize};

use govorun_storage::types::{ChatKind, MessageType};

/// The chat an event happened in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRef {
    pub chat_id: i64,
    pub kind: ChatKind,
    pub title: String,
    /// Forum topic, 0 outside forums.
    pub topic_id: i64,
}

/// The acting user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    pub user_id: i64,
    pub display_name: String,
    pub username: Option<String>,
    pub is_bot: bool,
}

/// Inbound media attachment reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMedia {
    pub file_unique_id: String,
    pub file_id: String,
    pub mime: String,
    pub size: i64,
}

/// The normalized inbound message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Platform-opaque id, unique within the chat.
    pub message_id: String,
    /// Unix seconds.
    pub date: i64,
    pub text: String,
    pub message_type: MessageType,
    pub reply_to: Option<String>,
    pub quote: Option<String>,
    pub media: Vec<IncomingMedia>,
    pub media_group_id: Option<String>,
    /// Users @-mentioned in the text, as typed (without the @).
    pub mentions: Vec<String>,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageCreated,
    MessageEdited,
    MessageDeleted,
    /// Inline-button press; `callback_id` must be answered exactly once.
    Callback {
        callback_id: String,
        data: String,
    },
    BotAdded,
    BotRemoved,
    ChatCreated,
    TitleChanged,
    UserJoined,
    UserLeft,
    DialogMuted,
}

/// A normalized inbound event, delivered to handlers in per-chat source order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingEvent {
    /// Adapter name: "telegram" or "max".
    pub platform: String,
    pub chat: ChatRef,
    pub user: UserRef,
    pub kind: EventKind,
    pub message: Option<IncomingMessage>,
}

impl IncomingEvent {
    /// Text of the inbound message, empty when there is none.
    pub fn text(&self) -> &str {
        self.message.as_ref().map(|m| m.text.as_str()).unwrap_or("")
    }
}

/// Media payload for outgoing sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutgoingMedia {
    /// Re-send by the platform's own file id.
    FileId { file_id: String, caption: String },
    /// Upload raw bytes.
    Bytes {
        name: String,
        mime: String,
        #[serde(with = "serde_bytes_base64")]
        bytes: Vec<u8>,
        caption: String,
    },
}

/// An action queued on a platform's outbox.
#[derive(Debug, Clone)]
pub enum OutgoingAction {
    SendText {
        chat_id: i64,
        topic_id: i64,
        text: String,
        reply_to: Option<String>,
    },
    EditMessage {
        chat_id: i64,
        message_id: String,
        text: String,
    },
    DeleteMessages {
        chat_id: i64,
        message_ids: Vec<String>,
    },
    /// Transient "typing…" style indicator.
    SendAction {
        chat_id: i64,
        action: String,
    },
    PinMessage {
        chat_id: i64,
        message_id: String,
    },
    UnpinMessage {
        chat_id: i64,
        message_id: String,
    },
    SendMedia {
        chat_id: i64,
        topic_id: i64,
        media: OutgoingMedia,
    },
    SendMediaGroup {
        chat_id: i64,
        topic_id: i64,
        media: Vec<OutgoingMedia>,
    },
    AnswerCallback {
        callback_id: String,
        text: String,
    },
    BanUser {
        chat_id: i64,
        user_id: i64,
    },
    UnbanUser {
        chat_id: i64,
        user_id: i64,
    },
}

impl OutgoingAction {
    /// Chat the action belongs to, for per-chat ordering. Callback answers
    /// are not chat-scoped.
    pub fn chat_id(&self) -> Option<i64> {
        match self {
            OutgoingAction::SendText { chat_id, .. }
            | OutgoingAction::EditMessage { chat_id, .. }
            | OutgoingAction::DeleteMessages { chat_id, .. }
            | OutgoingAction::SendAction { chat_id, .. }
            | OutgoingAction::PinMessage { chat_id, .. }
            | OutgoingAction::UnpinMessage { chat_id, .. }
            | OutgoingAction::SendMedia { chat_id, .. }
            | OutgoingAction::SendMediaGroup { chat_id, .. }
            | OutgoingAction::BanUser { chat_id, .. }
            | OutgoingAction::UnbanUser { chat_id, .. } => Some(*chat_id),
            OutgoingAction::AnswerCallback { .. } => None,
        }
    }
}

/// Base64 (de)serialization for raw byte payloads in media actions.
mod serde_bytes_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_extraction() {
        let send = OutgoingAction::SendText {
            chat_id: -100,
            topic_id: 0,
            text: "x".to_string(),
            reply_to: None,
        };
        assert_eq!(send.chat_id(), Some(-100));
        let callback = OutgoingAction::AnswerCallback {
            callback_id: "cb".to_string(),
            text: String::new(),
        };
        assert_eq!(callback.chat_id(), None);
    }

    #[test]
    fn media_bytes_round_trip_through_serde() {
        let media = OutgoingMedia::Bytes {
            name: "pic.png".to_string(),
            mime: "image/png".to_string(),
            bytes: vec![0, 1, 2, 250, 251, 252, 253],
            caption: "hi".to_string(),
        };
        let json = serde_json::to_string(&media).unwrap();
        let back: OutgoingMedia = serde_json::from_str(&json).unwrap();
        match back {
            OutgoingMedia::Bytes { bytes, .. } => {
                assert_eq!(bytes, vec![0, 1, 2, 250, 251, 252, 253])
            }
            _ => panic!("wrong variant"),
        }
    }
}
