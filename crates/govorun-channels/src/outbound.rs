//! The outbound surface a platform adapter binds to its native API.
//!
//! Handlers hold an `Arc<dyn Outbound>` (or submit through the [`Outbox`]
//! (crate::outbox::Outbox)); the adapter never depends on handler types,
//! which keeps the adapter↔handler reference acyclic.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{OutgoingAction, OutgoingMedia};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Platform API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Unsupported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl ChannelError {
    /// Transient failures are retried by the outbox with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::Http(_) => true,
            ChannelError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// A message successfully delivered to the platform.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message_id: String,
}

/// Outgoing primitives every platform adapter implements.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Adapter name: "telegram" or "max".
    fn platform(&self) -> &'static str;

    async fn send_text(
        &self,
        chat_id: i64,
        topic_id: i64,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SentMessage>;

    async fn edit_message(&self, chat_id: i64, message_id: &str, text: &str) -> Result<()>;

    async fn delete_messages(&self, chat_id: i64, message_ids: &[String]) -> Result<()>;

    /// Transient indicator like "typing".
    async fn send_action(&self, chat_id: i64, action: &str) -> Result<()>;

    async fn pin_message(&self, chat_id: i64, message_id: &str) -> Result<()>;

    async fn unpin_message(&self, chat_id: i64, message_id: &str) -> Result<()>;

    async fn send_media(
        &self,
        chat_id: i64,
        topic_id: i64,
        media: &OutgoingMedia,
    ) -> Result<SentMessage>;

    async fn send_media_group(
        &self,
        chat_id: i64,
        topic_id: i64,
        media: &[OutgoingMedia],
    ) -> Result<Vec<SentMessage>>;

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>>;

    /// Must be called at most once per callback id; adapters go through
    /// [`CallbackGuard`] to enforce it.
    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()>;

    async fn ban_user(&self, chat_id: i64, user_id: i64) -> Result<()>;

    async fn unban_user(&self, chat_id: i64, user_id: i64) -> Result<()>;

    /// User ids of the chat's current administrators. Callers cache this.
    async fn chat_admins(&self, chat_id: i64) -> Result<Vec<i64>>;

    /// Apply one queued action. The default dispatch covers every action.
    async fn apply(&self, action: &OutgoingAction) -> Result<()> {
        match action {
            OutgoingAction::SendText {
                chat_id,
                topic_id,
                text,
                reply_to,
            } => {
                self.send_text(*chat_id, *topic_id, text, reply_to.as_deref())
                    .await?;
            }
            OutgoingAction::EditMessage {
                chat_id,
                message_id,
                text,
            } => self.edit_message(*chat_id, message_id, text).await?,
            OutgoingAction::DeleteMessages {
                chat_id,
                message_ids,
            } => self.delete_messages(*chat_id, message_ids).await?,
            OutgoingAction::SendAction { chat_id, action } => {
                self.send_action(*chat_id, action).await?
            }
            OutgoingAction::PinMessage {
                chat_id,
                message_id,
            } => self.pin_message(*chat_id, message_id).await?,
            OutgoingAction::UnpinMessage {
                chat_id,
                message_id,
            } => self.unpin_message(*chat_id, message_id).await?,
            OutgoingAction::SendMedia {
                chat_id,
                topic_id,
                media,
            } => {
                self.send_media(*chat_id, *topic_id, media).await?;
            }
            OutgoingAction::SendMediaGroup {
                chat_id,
                topic_id,
                media,
            } => {
                self.send_media_group(*chat_id, *topic_id, media).await?;
            }
            OutgoingAction::AnswerCallback { callback_id, text } => {
                self.answer_callback(callback_id, text).await?
            }
            OutgoingAction::BanUser { chat_id, user_id } => {
                self.ban_user(*chat_id, *user_id).await?
            }
            OutgoingAction::UnbanUser { chat_id, user_id } => {
                self.unban_user(*chat_id, *user_id).await?
            }
        }
        Ok(())
    }
}

/// Tracks which callback ids were already answered, so each gets at most one
/// `answer_callback` regardless of handler retries.
#[derive(Default)]
pub struct CallbackGuard {
    answered: Mutex<HashSet<String>>,
}

impl CallbackGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time an id is seen.
    pub fn first_answer(&self, callback_id: &str) -> bool {
        self.answered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(callback_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_guard_allows_exactly_one_answer() {
        let guard = CallbackGuard::new();
        assert!(guard.first_answer("cb-1"));
        assert!(!guard.first_answer("cb-1"));
        assert!(guard.first_answer("cb-2"));
    }

    #[test]
    fn transient_classification() {
        assert!(ChannelError::Api {
            status: 502,
            message: String::new()
        }
        .is_transient());
        assert!(ChannelError::Api {
            status: 429,
            message: String::new()
        }
        .is_transient());
        assert!(!ChannelError::Api {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!ChannelError::AuthFailed("x".to_string()).is_transient());
    }
}
