//! Persistent entities shared across the workspace.
//!
//! String-form enums implement `Display`/`FromStr` with the exact text stored
//! in SQLite; unknown stored values fall back to the `Unspecified`-style
//! variant where one exists rather than failing the whole row.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Channel,
    Forum,
}

impl fmt::Display for ChatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
            ChatKind::Channel => "channel",
            ChatKind::Forum => "forum",
        };
        f.write_str(s)
    }
}

impl FromStr for ChatKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(ChatKind::Private),
            "group" => Ok(ChatKind::Group),
            "channel" => Ok(ChatKind::Channel),
            "forum" => Ok(ChatKind::Forum),
            other => Err(format!("unknown chat kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: i64,
    pub kind: ChatKind,
    pub title: String,
    pub flags: i64,
}

/// Per-chat user attributes; the same user has one row per chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUser {
    pub chat_id: i64,
    pub user_id: i64,
    pub display_name: String,
    pub username: Option<String>,
    pub message_count: i64,
    pub metadata: serde_json::Value,
    pub is_spammer: bool,
}

impl ChatUser {
    pub fn new(chat_id: i64, user_id: i64, display_name: &str, username: Option<&str>) -> Self {
        Self {
            chat_id,
            user_id,
            display_name: display_name.to_string(),
            username: username.map(String::from),
            message_count: 0,
            metadata: serde_json::Value::Object(Default::default()),
            is_spammer: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Photo,
    Video,
    Audio,
    Voice,
    Document,
    Sticker,
    Other,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Text => "text",
            MessageType::Photo => "photo",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::Voice => "voice",
            MessageType::Document => "document",
            MessageType::Sticker => "sticker",
            MessageType::Other => "other",
        };
        f.write_str(s)
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "photo" => Ok(MessageType::Photo),
            "video" => Ok(MessageType::Video),
            "audio" => Ok(MessageType::Audio),
            "voice" => Ok(MessageType::Voice),
            "document" => Ok(MessageType::Document),
            "sticker" => Ok(MessageType::Sticker),
            _ => Ok(MessageType::Other),
        }
    }
}

/// Who produced a message and in what role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageCategory {
    User,
    UserCommand,
    Channel,
    Bot,
    BotCommandReply,
    BotError,
    BotSummary,
    BotResended,
    BotSpamNotification,
    UserSpam,
    Unspecified,
}

impl MessageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageCategory::User => "user",
            MessageCategory::UserCommand => "user-command",
            MessageCategory::Channel => "channel",
            MessageCategory::Bot => "bot",
            MessageCategory::BotCommandReply => "bot-command-reply",
            MessageCategory::BotError => "bot-error",
            MessageCategory::BotSummary => "bot-summary",
            MessageCategory::BotResended => "bot-resended",
            MessageCategory::BotSpamNotification => "bot-spam-notification",
            MessageCategory::UserSpam => "user-spam",
            MessageCategory::Unspecified => "unspecified",
        }
    }
}

impl fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageCategory::User),
            "user-command" => Ok(MessageCategory::UserCommand),
            "channel" => Ok(MessageCategory::Channel),
            "bot" => Ok(MessageCategory::Bot),
            "bot-command-reply" => Ok(MessageCategory::BotCommandReply),
            "bot-error" => Ok(MessageCategory::BotError),
            "bot-summary" => Ok(MessageCategory::BotSummary),
            "bot-resended" => Ok(MessageCategory::BotResended),
            "bot-spam-notification" => Ok(MessageCategory::BotSpamNotification),
            "user-spam" => Ok(MessageCategory::UserSpam),
            _ => Ok(MessageCategory::Unspecified),
        }
    }
}

/// A stored chat message, keyed `(chat_id, message_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub chat_id: i64,
    /// Platform-opaque id, unique within the chat.
    pub message_id: String,
    /// Unix seconds.
    pub date: i64,
    pub user_id: i64,
    pub reply_id: Option<String>,
    /// 0 for non-forum chats.
    pub thread_id: i64,
    /// Head of the logical conversation this message belongs to.
    pub root_message_id: Option<String>,
    pub text: String,
    pub message_type: MessageType,
    pub category: MessageCategory,
    pub quote: Option<String>,
    pub media_id: Option<String>,
    pub media_group_id: Option<String>,
    pub markup: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    New,
    Pending,
    Done,
    Failed,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::New => "new",
            MediaStatus::Pending => "pending",
            MediaStatus::Done => "done",
            MediaStatus::Failed => "failed",
        }
    }

    /// `new → pending → done|failed`; no other transitions.
    pub fn can_transition_to(&self, next: MediaStatus) -> bool {
        matches!(
            (self, next),
            (MediaStatus::New, MediaStatus::Pending)
                | (MediaStatus::Pending, MediaStatus::Done)
                | (MediaStatus::Pending, MediaStatus::Failed)
        )
    }
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(MediaStatus::New),
            "pending" => Ok(MediaStatus::Pending),
            "done" => Ok(MediaStatus::Done),
            "failed" => Ok(MediaStatus::Failed),
            other => Err(format!("unknown media status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    /// Platform-stable unique id.
    pub file_unique_id: String,
    pub status: MediaStatus,
    pub mime: String,
    pub size: i64,
    /// Where the downloaded file lives locally, once fetched.
    pub local_url: Option<String>,
    /// Platform file id usable for re-sending.
    pub file_id: String,
    /// Vision-model description, when parse-images is on.
    pub description: Option<String>,
    /// The user prompt that produced a generated image, if any.
    pub prompt: Option<String>,
}

/// Membership row of a media group (album).
#[derive(Debug, Clone)]
pub struct MediaGroupMember {
    pub media_group_id: String,
    pub media_id: String,
    pub chat_id: i64,
    pub message_id: String,
    /// Unix seconds of the latest upsert for this member.
    pub updated_at: i64,
    pub processed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpamReason {
    Auto,
    User,
    Admin,
    Unban,
}

impl SpamReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpamReason::Auto => "auto",
            SpamReason::User => "user",
            SpamReason::Admin => "admin",
            SpamReason::Unban => "unban",
        }
    }
}

impl fmt::Display for SpamReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpamReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(SpamReason::Auto),
            "user" => Ok(SpamReason::User),
            "admin" => Ok(SpamReason::Admin),
            "unban" => Ok(SpamReason::Unban),
            other => Err(format!("unknown spam reason: {other}")),
        }
    }
}

/// A labeled spam or ham example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamRecord {
    pub chat_id: i64,
    pub user_id: i64,
    pub message_id: String,
    pub text: String,
    pub reason: SpamReason,
    /// Score at labeling time, in [0,1].
    pub score: f64,
}

/// Aggregate Bayes counters for one class of one chat (or the global model).
#[derive(Debug, Clone, Copy, Default)]
pub struct BayesClassCounts {
    pub message_count: i64,
    pub token_count: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BayesTokenCounts {
    pub spam_count: i64,
    pub ham_count: i64,
}

/// A persisted delayed task. `id` is caller-chosen; duplicate scheduling of
/// the same id is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedTask {
    pub id: String,
    /// Unix seconds.
    pub fire_at: i64,
    /// Registered handler name.
    pub function: String,
    pub kwargs: serde_json::Value,
    pub is_done: bool,
}

/// A persisted generic-cache row (`cache_storage` table).
#[derive(Debug, Clone)]
pub struct CacheRow {
    pub namespace: String,
    pub key: String,
    pub value: String,
    /// Unix seconds.
    pub created_at: i64,
    pub ttl_secs: Option<i64>,
    /// Stored persistence-level label.
    pub persistence: String,
}

/// A typed API-response cache row (`api_cache` table).
#[derive(Debug, Clone)]
pub struct ApiCacheRow {
    pub domain: String,
    pub key: String,
    pub value: serde_json::Value,
    /// Unix seconds.
    pub stored_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips() {
        for cat in [
            MessageCategory::User,
            MessageCategory::UserCommand,
            MessageCategory::BotCommandReply,
            MessageCategory::UserSpam,
            MessageCategory::BotSpamNotification,
        ] {
            assert_eq!(cat, cat.as_str().parse().unwrap());
        }
    }

    #[test]
    fn unknown_category_becomes_unspecified() {
        let cat: MessageCategory = "weird-legacy-value".parse().unwrap();
        assert_eq!(cat, MessageCategory::Unspecified);
    }

    #[test]
    fn media_status_transitions_are_monotone() {
        assert!(MediaStatus::New.can_transition_to(MediaStatus::Pending));
        assert!(MediaStatus::Pending.can_transition_to(MediaStatus::Done));
        assert!(MediaStatus::Pending.can_transition_to(MediaStatus::Failed));
        assert!(!MediaStatus::Done.can_transition_to(MediaStatus::Pending));
        assert!(!MediaStatus::Failed.can_transition_to(MediaStatus::Done));
        assert!(!MediaStatus::New.can_transition_to(MediaStatus::Done));
    }
}
