//! Thin typed client over the Telegram Bot HTTP API.
//!
//! Only the methods and fields the adapter touches are modeled; everything
//! else in the wire payloads is ignored by serde.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use govorun_channels::outbound::{ChannelError, Result};

pub struct TelegramApi {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl TelegramApi {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: "https://api.telegram.org".to_string(),
        }
    }

    /// POST a Bot API method with a JSON body and unwrap the envelope.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        debug!(method, "telegram api call");
        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);
        let resp = self.client.post(&url).json(body).send().await?;
        let status = resp.status().as_u16();
        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| ChannelError::Parse(e.to_string()))?;
        if !envelope.ok {
            return Err(ChannelError::Api {
                status: envelope.error_code.unwrap_or(status),
                message: envelope.description.unwrap_or_default(),
            });
        }
        envelope
            .result
            .ok_or_else(|| ChannelError::Parse(format!("{method}: ok response without result")))
    }

    /// Long-poll for updates; `timeout_secs` is the server-side hold.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            &serde_json::json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": [
                    "message", "edited_message", "callback_query", "my_chat_member",
                ],
            }),
        )
        .await
    }

    pub async fn get_me(&self) -> Result<TgUser> {
        self.call("getMe", &serde_json::json!({})).await
    }

    /// Resolve a file path, then fetch the bytes from the file endpoint.
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let file: TgFile = self
            .call("getFile", &serde_json::json!({ "file_id": file_id }))
            .await?;
        let path = file
            .file_path
            .ok_or_else(|| ChannelError::Parse("getFile returned no file_path".to_string()))?;
        let url = format!("{}/file/bot{}/{}", self.base_url, self.token, path);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ChannelError::Api {
                status: resp.status().as_u16(),
                message: "file download failed".to_string(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Upload raw bytes with `sendPhoto`/`sendDocument` style multipart.
    pub async fn send_file(
        &self,
        method: &str,
        field: &str,
        chat_id: i64,
        topic_id: i64,
        name: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<TgMessage> {
        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);
        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part(field.to_string(), part);
        if topic_id != 0 {
            form = form.text("message_thread_id", topic_id.to_string());
        }
        let resp = self.client.post(&url).multipart(form).send().await?;
        let status = resp.status().as_u16();
        let envelope: Envelope<TgMessage> = resp
            .json()
            .await
            .map_err(|e| ChannelError::Parse(e.to_string()))?;
        if !envelope.ok {
            return Err(ChannelError::Api {
                status: envelope.error_code.unwrap_or(status),
                message: envelope.description.unwrap_or_default(),
            });
        }
        envelope
            .result
            .ok_or_else(|| ChannelError::Parse(format!("{method}: ok response without result")))
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

// --- wire types -------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<TgMessage>,
    pub edited_message: Option<TgMessage>,
    pub callback_query: Option<TgCallbackQuery>,
    pub my_chat_member: Option<TgChatMemberUpdated>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub date: i64,
    pub chat: TgChat,
    pub from: Option<TgUser>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub message_thread_id: Option<i64>,
    pub reply_to_message: Option<Box<TgMessage>>,
    pub quote: Option<TgQuote>,
    pub photo: Option<Vec<TgPhotoSize>>,
    pub video: Option<TgVideo>,
    pub document: Option<TgDocument>,
    pub media_group_id: Option<String>,
    pub new_chat_members: Option<Vec<TgUser>>,
    pub left_chat_member: Option<TgUser>,
    pub new_chat_title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgQuote {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: Option<String>,
    #[serde(default)]
    pub is_forum: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

impl TgUser {
    pub fn display_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgPhotoSize {
    pub file_id: String,
    pub file_unique_id: String,
    pub width: i64,
    pub height: i64,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgVideo {
    pub file_id: String,
    pub file_unique_id: String,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgDocument {
    pub file_id: String,
    pub file_unique_id: String,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgCallbackQuery {
    pub id: String,
    pub from: TgUser,
    pub data: Option<String>,
    pub message: Option<Box<TgMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChatMemberUpdated {
    pub chat: TgChat,
    pub from: TgUser,
    pub new_chat_member: TgChatMember,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChatMember {
    pub status: String,
    pub user: TgUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgFile {
    pub file_path: Option<String>,
}

/// Smallest photo variant whose larger dimension is at least `target`;
/// falls back to the biggest available when none qualifies.
pub fn select_photo_size(sizes: &[TgPhotoSize], target: i64) -> Option<&TgPhotoSize> {
    sizes
        .iter()
        .filter(|s| s.width.max(s.height) >= target)
        .min_by_key(|s| s.width.max(s.height))
        .or_else(|| sizes.iter().max_by_key(|s| s.width.max(s.height)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(id: &str, width: i64, height: i64) -> TgPhotoSize {
        TgPhotoSize {
            file_id: id.to_string(),
            file_unique_id: format!("u-{id}"),
            width,
            height,
            file_size: None,
        }
    }

    #[test]
    fn optimal_size_prefers_smallest_at_or_above_target() {
        let sizes = vec![size("s", 90, 67), size("m", 320, 240), size("l", 1280, 960)];
        let picked = select_photo_size(&sizes, 300).unwrap();
        assert_eq!(picked.file_id, "m");
    }

    #[test]
    fn optimal_size_falls_back_to_largest() {
        let sizes = vec![size("s", 90, 67), size("m", 320, 240)];
        let picked = select_photo_size(&sizes, 2000).unwrap();
        assert_eq!(picked.file_id, "m");
    }

    #[test]
    fn update_parses_minimal_message() {
        let raw = serde_json::json!({
            "update_id": 7,
            "message": {
                "message_id": 42,
                "date": 1700000000,
                "chat": { "id": -100, "type": "supergroup", "title": "dood chat" },
                "from": { "id": 42, "first_name": "Dood", "username": "dood" },
                "text": "/echo hello dood"
            }
        });
        let update: Update = serde_json::from_value(raw).unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.chat.id, -100);
        assert_eq!(msg.text.as_deref(), Some("/echo hello dood"));
        assert!(!msg.chat.is_forum);
    }
}
