//! Telegram adapter: outbound primitives over the Bot API plus the
//! long-polling ingress loop.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use govorun_channels::outbound::{CallbackGuard, ChannelError, Outbound, Result, SentMessage};
use govorun_channels::render::{render_chunks, Dialect};
use govorun_channels::types::{IncomingEvent, OutgoingMedia};

use crate::api::{TelegramApi, TgMessage};
use crate::convert::update_to_events;

const POLL_TIMEOUT_SECS: u64 = 30;
const RECONNECT_MAX_SECS: u64 = 60;

pub struct TelegramAdapter {
    api: TelegramApi,
    guard: CallbackGuard,
    /// Our own user id, learned from `getMe` at startup.
    bot_user_id: AtomicI64,
    bot_username: std::sync::Mutex<String>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Self {
        Self {
            api: TelegramApi::new(bot_token.to_string()),
            guard: CallbackGuard::new(),
            bot_user_id: AtomicI64::new(0),
            bot_username: std::sync::Mutex::new(String::new()),
        }
    }

    /// Probe the token and learn the bot identity. Fatal at startup when
    /// authentication fails.
    pub async fn check_auth(&self) -> Result<String> {
        let me = self.api.get_me().await.map_err(|e| match e {
            ChannelError::Api { status: 401, .. } | ChannelError::Api { status: 404, .. } => {
                ChannelError::AuthFailed("telegram bot token rejected".to_string())
            }
            other => other,
        })?;
        self.bot_user_id.store(me.id, Ordering::Relaxed);
        let username = me.username.clone().unwrap_or_default();
        *self.bot_username.lock().unwrap_or_else(|p| p.into_inner()) = username.clone();
        info!(bot = %username, "telegram adapter authenticated");
        Ok(username)
    }

    pub fn bot_username(&self) -> String {
        self.bot_username
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn bot_user_id(&self) -> i64 {
        self.bot_user_id.load(Ordering::Relaxed)
    }

    /// Long-polling ingress. Owns the reconnect loop: consecutive failures
    /// back off exponentially up to one minute. Events for a chat are emitted
    /// in the order Telegram delivered them.
    pub async fn run_polling(
        self: Arc<Self>,
        tx: mpsc::Sender<IncomingEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut offset: i64 = 0;
        let mut backoff_secs: u64 = 1;
        info!("telegram polling started");

        loop {
            let poll = self.api.get_updates(offset, POLL_TIMEOUT_SECS);
            let updates = tokio::select! {
                result = poll => result,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let updates = match updates {
                Ok(updates) => {
                    backoff_secs = 1;
                    updates
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs, "telegram poll failed; reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)) => {}
                        _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
                    }
                    backoff_secs = (backoff_secs * 2).min(RECONNECT_MAX_SECS);
                    continue;
                }
            };

            let bot_id = self.bot_user_id();
            for update in updates {
                offset = offset.max(update.update_id + 1);
                for event in update_to_events(update, bot_id) {
                    if tx.send(event).await.is_err() {
                        info!("event channel closed; telegram polling stops");
                        return;
                    }
                }
            }
        }
        info!("telegram polling stopped");
    }

    fn message_id_of(msg: &TgMessage) -> SentMessage {
        SentMessage {
            message_id: msg.message_id.to_string(),
        }
    }
}

#[async_trait]
impl Outbound for TelegramAdapter {
    fn platform(&self) -> &'static str {
        "telegram"
    }

    async fn send_text(
        &self,
        chat_id: i64,
        topic_id: i64,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SentMessage> {
        let chunks = render_chunks(text, Dialect::MarkdownV2);
        let mut last: Option<SentMessage> = None;
        for (i, chunk) in chunks.iter().enumerate() {
            let mut body = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "MarkdownV2",
            });
            if topic_id != 0 {
                body["message_thread_id"] = serde_json::json!(topic_id);
            }
            // Only the first chunk carries the reply linkage.
            if i == 0 {
                if let Some(reply_id) = reply_to.and_then(|r| r.parse::<i64>().ok()) {
                    body["reply_parameters"] = serde_json::json!({ "message_id": reply_id });
                }
            }

            let sent: std::result::Result<TgMessage, ChannelError> =
                self.api.call("sendMessage", &body).await;
            let msg = match sent {
                Ok(msg) => msg,
                Err(ChannelError::Api { status: 400, .. }) => {
                    // MarkdownV2 rejected the escaping — fall back to plain text.
                    body["text"] = serde_json::json!(text);
                    if let Some(object) = body.as_object_mut() {
                        object.remove("parse_mode");
                    }
                    self.api.call("sendMessage", &body).await?
                }
                Err(e) => return Err(e),
            };
            last = Some(Self::message_id_of(&msg));
        }
        last.ok_or_else(|| ChannelError::Parse("empty message".to_string()))
    }

    async fn edit_message(&self, chat_id: i64, message_id: &str, text: &str) -> Result<()> {
        let message_id: i64 = message_id
            .parse()
            .map_err(|_| ChannelError::Parse(format!("bad message id: {message_id}")))?;
        let chunks = render_chunks(text, Dialect::MarkdownV2);
        let first = chunks.first().cloned().unwrap_or_default();
        let _: serde_json::Value = self
            .api
            .call(
                "editMessageText",
                &serde_json::json!({
                    "chat_id": chat_id,
                    "message_id": message_id,
                    "text": first,
                    "parse_mode": "MarkdownV2",
                }),
            )
            .await?;
        Ok(())
    }

    async fn delete_messages(&self, chat_id: i64, message_ids: &[String]) -> Result<()> {
        let ids: Vec<i64> = message_ids.iter().filter_map(|m| m.parse().ok()).collect();
        if ids.is_empty() {
            return Ok(());
        }
        let _: bool = self
            .api
            .call(
                "deleteMessages",
                &serde_json::json!({ "chat_id": chat_id, "message_ids": ids }),
            )
            .await?;
        Ok(())
    }

    async fn send_action(&self, chat_id: i64, action: &str) -> Result<()> {
        let _: bool = self
            .api
            .call(
                "sendChatAction",
                &serde_json::json!({ "chat_id": chat_id, "action": action }),
            )
            .await?;
        Ok(())
    }

    async fn pin_message(&self, chat_id: i64, message_id: &str) -> Result<()> {
        let message_id: i64 = message_id
            .parse()
            .map_err(|_| ChannelError::Parse(format!("bad message id: {message_id}")))?;
        let _: bool = self
            .api
            .call(
                "pinChatMessage",
                &serde_json::json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }

    async fn unpin_message(&self, chat_id: i64, message_id: &str) -> Result<()> {
        let message_id: i64 = message_id
            .parse()
            .map_err(|_| ChannelError::Parse(format!("bad message id: {message_id}")))?;
        let _: bool = self
            .api
            .call(
                "unpinChatMessage",
                &serde_json::json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }

    async fn send_media(
        &self,
        chat_id: i64,
        topic_id: i64,
        media: &OutgoingMedia,
    ) -> Result<SentMessage> {
        match media {
            OutgoingMedia::FileId { file_id, caption } => {
                let mut body = serde_json::json!({
                    "chat_id": chat_id,
                    "photo": file_id,
                    "caption": caption,
                });
                if topic_id != 0 {
                    body["message_thread_id"] = serde_json::json!(topic_id);
                }
                let msg: TgMessage = self.api.call("sendPhoto", &body).await?;
                Ok(Self::message_id_of(&msg))
            }
            OutgoingMedia::Bytes {
                name,
                mime,
                bytes,
                caption,
            } => {
                let (method, field) = if mime.starts_with("image/") {
                    ("sendPhoto", "photo")
                } else {
                    ("sendDocument", "document")
                };
                let msg = self
                    .api
                    .send_file(method, field, chat_id, topic_id, name, bytes.clone(), caption)
                    .await?;
                Ok(Self::message_id_of(&msg))
            }
        }
    }

    async fn send_media_group(
        &self,
        chat_id: i64,
        topic_id: i64,
        media: &[OutgoingMedia],
    ) -> Result<Vec<SentMessage>> {
        let items: Vec<serde_json::Value> = media
            .iter()
            .filter_map(|m| match m {
                OutgoingMedia::FileId { file_id, caption } => Some(serde_json::json!({
                    "type": "photo",
                    "media": file_id,
                    "caption": caption,
                })),
                // Raw uploads inside albums go one by one via send_media.
                OutgoingMedia::Bytes { .. } => None,
            })
            .collect();
        if items.is_empty() {
            return Err(ChannelError::Unsupported(
                "telegram media groups require platform file ids",
            ));
        }
        let mut body = serde_json::json!({ "chat_id": chat_id, "media": items });
        if topic_id != 0 {
            body["message_thread_id"] = serde_json::json!(topic_id);
        }
        let msgs: Vec<TgMessage> = self.api.call("sendMediaGroup", &body).await?;
        Ok(msgs.iter().map(Self::message_id_of).collect())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        self.api.download_file(file_id).await
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        if !self.guard.first_answer(callback_id) {
            return Ok(());
        }
        let _: bool = self
            .api
            .call(
                "answerCallbackQuery",
                &serde_json::json!({ "callback_query_id": callback_id, "text": text }),
            )
            .await?;
        Ok(())
    }

    async fn ban_user(&self, chat_id: i64, user_id: i64) -> Result<()> {
        let _: bool = self
            .api
            .call(
                "banChatMember",
                &serde_json::json!({ "chat_id": chat_id, "user_id": user_id }),
            )
            .await?;
        Ok(())
    }

    async fn unban_user(&self, chat_id: i64, user_id: i64) -> Result<()> {
        let _: bool = self
            .api
            .call(
                "unbanChatMember",
                &serde_json::json!({
                    "chat_id": chat_id,
                    "user_id": user_id,
                    "only_if_banned": true,
                }),
            )
            .await?;
        Ok(())
    }

    async fn chat_admins(&self, chat_id: i64) -> Result<Vec<i64>> {
        let members: Vec<crate::api::TgChatMember> = self
            .api
            .call(
                "getChatAdministrators",
                &serde_json::json!({ "chat_id": chat_id }),
            )
            .await?;
        Ok(members.iter().map(|m| m.user.id).collect())
    }
}
