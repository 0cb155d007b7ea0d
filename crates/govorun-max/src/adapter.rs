//! Max adapter: outbound primitives over the Max Bot API plus the
//! marker-based long-polling ingress loop.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use govorun_channels::outbound::{CallbackGuard, ChannelError, Outbound, Result, SentMessage};
use govorun_channels::render::{render_chunks, Dialect};
use govorun_channels::types::{IncomingEvent, OutgoingMedia};

use crate::api::{MaxApi, SentEnvelope};
use crate::convert::update_to_events;

const POLL_TIMEOUT_SECS: u64 = 30;
const RECONNECT_MAX_SECS: u64 = 60;

pub struct MaxAdapter {
    api: MaxApi,
    guard: CallbackGuard,
    bot_user_id: AtomicI64,
    bot_username: std::sync::Mutex<String>,
}

impl MaxAdapter {
    pub fn new(bot_token: &str) -> Self {
        Self {
            api: MaxApi::new(bot_token.to_string()),
            guard: CallbackGuard::new(),
            bot_user_id: AtomicI64::new(0),
            bot_username: std::sync::Mutex::new(String::new()),
        }
    }

    pub async fn check_auth(&self) -> Result<String> {
        let me = self.api.get_me().await.map_err(|e| match e {
            ChannelError::Api { status: 401, .. } => {
                ChannelError::AuthFailed("max bot token rejected".to_string())
            }
            other => other,
        })?;
        self.bot_user_id.store(me.user_id, Ordering::Relaxed);
        let username = me.username.clone().unwrap_or(me.name);
        *self.bot_username.lock().unwrap_or_else(|p| p.into_inner()) = username.clone();
        info!(bot = %username, "max adapter authenticated");
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

    /// Long-polling ingress with the same reconnect discipline as the
    /// Telegram adapter; the `marker` cursor replaces the numeric offset.
    pub async fn run_polling(
        self: Arc<Self>,
        tx: mpsc::Sender<IncomingEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut marker: Option<i64> = None;
        let mut backoff_secs: u64 = 1;
        info!("max polling started");

        loop {
            let poll = self.api.get_updates(marker, POLL_TIMEOUT_SECS);
            let batch = tokio::select! {
                result = poll => result,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let batch = match batch {
                Ok(batch) => {
                    backoff_secs = 1;
                    batch
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs, "max poll failed; reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)) => {}
                        _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
                    }
                    backoff_secs = (backoff_secs * 2).min(RECONNECT_MAX_SECS);
                    continue;
                }
            };

            marker = batch.marker.or(marker);
            for update in batch.updates {
                for event in update_to_events(update) {
                    if tx.send(event).await.is_err() {
                        info!("event channel closed; max polling stops");
                        return;
                    }
                }
            }
        }
        info!("max polling stopped");
    }
}

#[async_trait]
impl Outbound for MaxAdapter {
    fn platform(&self) -> &'static str {
        "max"
    }

    async fn send_text(
        &self,
        chat_id: i64,
        _topic_id: i64,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SentMessage> {
        let chunks = render_chunks(text, Dialect::Markdown);
        let mut last: Option<SentMessage> = None;
        for (i, chunk) in chunks.iter().enumerate() {
            let mut body = serde_json::json!({
                "text": chunk,
                "format": "markdown",
            });
            if i == 0 {
                if let Some(mid) = reply_to {
                    body["link"] = serde_json::json!({ "type": "reply", "mid": mid });
                }
            }
            let sent: SentEnvelope = self
                .api
                .send(
                    reqwest::Method::POST,
                    "/messages",
                    &[("chat_id", chat_id.to_string())],
                    &body,
                )
                .await?;
            last = Some(SentMessage {
                message_id: sent.message.body.mid,
            });
        }
        last.ok_or_else(|| ChannelError::Parse("empty message".to_string()))
    }

    async fn edit_message(&self, _chat_id: i64, message_id: &str, text: &str) -> Result<()> {
        let chunks = render_chunks(text, Dialect::Markdown);
        let first = chunks.first().cloned().unwrap_or_default();
        let _: serde_json::Value = self
            .api
            .send(
                reqwest::Method::PUT,
                "/messages",
                &[("message_id", message_id.to_string())],
                &serde_json::json!({ "text": first, "format": "markdown" }),
            )
            .await?;
        Ok(())
    }

    async fn delete_messages(&self, _chat_id: i64, message_ids: &[String]) -> Result<()> {
        for message_id in message_ids {
            let _: serde_json::Value = self
                .api
                .send(
                    reqwest::Method::DELETE,
                    "/messages",
                    &[("message_id", message_id.clone())],
                    &serde_json::json!({}),
                )
                .await?;
        }
        Ok(())
    }

    async fn send_action(&self, chat_id: i64, action: &str) -> Result<()> {
        // Max uses "typing_on" where Telegram uses "typing".
        let action = if action == "typing" { "typing_on" } else { action };
        let _: serde_json::Value = self
            .api
            .send(
                reqwest::Method::POST,
                &format!("/chats/{chat_id}/actions"),
                &[],
                &serde_json::json!({ "action": action }),
            )
            .await?;
        Ok(())
    }

    async fn pin_message(&self, chat_id: i64, message_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .api
            .send(
                reqwest::Method::PUT,
                &format!("/chats/{chat_id}/pin"),
                &[],
                &serde_json::json!({ "message_id": message_id }),
            )
            .await?;
        Ok(())
    }

    async fn unpin_message(&self, chat_id: i64, _message_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .api
            .send(
                reqwest::Method::DELETE,
                &format!("/chats/{chat_id}/pin"),
                &[],
                &serde_json::json!({}),
            )
            .await?;
        Ok(())
    }

    async fn send_media(
        &self,
        chat_id: i64,
        _topic_id: i64,
        media: &OutgoingMedia,
    ) -> Result<SentMessage> {
        let (attachment, caption) = match media {
            OutgoingMedia::FileId { file_id, caption } => (
                serde_json::json!({ "type": "image", "payload": { "token": file_id } }),
                caption.clone(),
            ),
            OutgoingMedia::Bytes {
                name,
                mime,
                bytes,
                caption,
            } => {
                let kind = if mime.starts_with("image/") {
                    "image"
                } else if mime.starts_with("video/") {
                    "video"
                } else {
                    "file"
                };
                let token = self.api.upload(kind, name, bytes.clone()).await?;
                (
                    serde_json::json!({ "type": kind, "payload": { "token": token } }),
                    caption.clone(),
                )
            }
        };
        let sent: SentEnvelope = self
            .api
            .send(
                reqwest::Method::POST,
                "/messages",
                &[("chat_id", chat_id.to_string())],
                &serde_json::json!({ "text": caption, "attachments": [attachment] }),
            )
            .await?;
        Ok(SentMessage {
            message_id: sent.message.body.mid,
        })
    }

    async fn send_media_group(
        &self,
        chat_id: i64,
        topic_id: i64,
        media: &[OutgoingMedia],
    ) -> Result<Vec<SentMessage>> {
        // Max takes multiple attachments on one message.
        let mut attachments = Vec::with_capacity(media.len());
        let mut caption = String::new();
        for item in media {
            match item {
                OutgoingMedia::FileId { file_id, caption: c } => {
                    if caption.is_empty() {
                        caption = c.clone();
                    }
                    attachments
                        .push(serde_json::json!({ "type": "image", "payload": { "token": file_id } }));
                }
                OutgoingMedia::Bytes { .. } => {
                    let sent = self.send_media(chat_id, topic_id, item).await?;
                    return Ok(vec![sent]);
                }
            }
        }
        let sent: SentEnvelope = self
            .api
            .send(
                reqwest::Method::POST,
                "/messages",
                &[("chat_id", chat_id.to_string())],
                &serde_json::json!({ "text": caption, "attachments": attachments }),
            )
            .await?;
        Ok(vec![SentMessage {
            message_id: sent.message.body.mid,
        }])
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        // Attachment payloads carry a direct URL; tokens resolve through it.
        if !file_id.starts_with("http") {
            return Err(ChannelError::Unsupported(
                "max downloads need the attachment url",
            ));
        }
        let resp = reqwest::get(file_id).await?;
        if !resp.status().is_success() {
            return Err(ChannelError::Api {
                status: resp.status().as_u16(),
                message: "file download failed".to_string(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        if !self.guard.first_answer(callback_id) {
            return Ok(());
        }
        let _: serde_json::Value = self
            .api
            .send(
                reqwest::Method::POST,
                "/answers",
                &[("callback_id", callback_id.to_string())],
                &serde_json::json!({ "notification": text }),
            )
            .await?;
        Ok(())
    }

    async fn ban_user(&self, chat_id: i64, user_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .api
            .send(
                reqwest::Method::DELETE,
                &format!("/chats/{chat_id}/members"),
                &[("user_ids", user_id.to_string()), ("block", "true".to_string())],
                &serde_json::json!({}),
            )
            .await?;
        Ok(())
    }

    async fn unban_user(&self, _chat_id: i64, _user_id: i64) -> Result<()> {
        // Max has no unban call; blocked members must be re-invited.
        Err(ChannelError::Unsupported("max does not support unban"))
    }

    async fn chat_admins(&self, chat_id: i64) -> Result<Vec<i64>> {
        #[derive(serde::Deserialize)]
        struct Admins {
            members: Vec<crate::api::MaxUser>,
        }
        let admins: Admins = self
            .api
            .get(&format!("/chats/{chat_id}/members/admins"), &[])
            .await?;
        Ok(admins.members.iter().map(|m| m.user_id).collect())
    }
}
