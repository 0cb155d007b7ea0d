//! Thin typed client over the Max messenger Bot HTTP API.
//!
//! Max authenticates with an `access_token` query parameter and paginates
//! updates with an opaque `marker` instead of Telegram's numeric offset.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use govorun_channels::outbound::{ChannelError, Result};

pub struct MaxApi {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl MaxApi {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: "https://botapi.max.ru".to_string(),
        }
    }

    async fn unwrap<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Api { status, message });
        }
        resp.json()
            .await
            .map_err(|e| ChannelError::Parse(e.to_string()))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        debug!(path, "max api get");
        let url = format!("{}{}", self.base_url, path);
        let mut query: Vec<(&str, String)> = query.to_vec();
        query.push(("access_token", self.token.clone()));
        let resp = self.client.get(&url).query(&query).send().await?;
        Self::unwrap(resp).await
    }

    pub async fn send<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<T> {
        debug!(path, method = %method, "max api call");
        let url = format!("{}{}", self.base_url, path);
        let mut query: Vec<(&str, String)> = query.to_vec();
        query.push(("access_token", self.token.clone()));
        let resp = self
            .client
            .request(method, &url)
            .query(&query)
            .json(body)
            .send()
            .await?;
        Self::unwrap(resp).await
    }

    pub async fn get_me(&self) -> Result<MaxUser> {
        self.get("/me", &[]).await
    }

    pub async fn get_updates(&self, marker: Option<i64>, timeout_secs: u64) -> Result<UpdateBatch> {
        let mut query = vec![("timeout", timeout_secs.to_string())];
        if let Some(marker) = marker {
            query.push(("marker", marker.to_string()));
        }
        self.get("/updates", &query).await
    }

    /// Two-step upload: ask for an upload URL, then POST the bytes there.
    /// Returns the attachment token used in message payloads.
    pub async fn upload(&self, kind: &str, name: &str, bytes: Vec<u8>) -> Result<String> {
        let slot: UploadSlot = self
            .send(
                reqwest::Method::POST,
                "/uploads",
                &[("type", kind.to_string())],
                &serde_json::json!({}),
            )
            .await?;

        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let form = reqwest::multipart::Form::new().part("data", part);
        let resp = self.client.post(&slot.url).multipart(form).send().await?;
        let uploaded: UploadedFile = Self::unwrap(resp).await?;
        Ok(uploaded.token)
    }
}

// --- wire types -------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MaxUser {
    pub user_id: i64,
    pub name: String,
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateBatch {
    pub updates: Vec<MaxUpdate>,
    pub marker: Option<i64>,
}

/// One update, discriminated by `update_type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "update_type", rename_all = "snake_case")]
pub enum MaxUpdate {
    MessageCreated {
        message: MaxMessage,
    },
    MessageEdited {
        message: MaxMessage,
    },
    MessageRemoved {
        message_id: String,
        chat_id: i64,
        user_id: i64,
    },
    MessageCallback {
        callback: MaxCallback,
        message: Option<MaxMessage>,
    },
    BotAdded {
        chat_id: i64,
        user: MaxUser,
    },
    BotRemoved {
        chat_id: i64,
        user: MaxUser,
    },
    ChatTitleChanged {
        chat_id: i64,
        user: MaxUser,
        title: String,
    },
    UserAdded {
        chat_id: i64,
        user: MaxUser,
    },
    UserRemoved {
        chat_id: i64,
        user: MaxUser,
    },
    DialogMuted {
        chat_id: i64,
        user: MaxUser,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaxMessage {
    pub sender: MaxUser,
    pub recipient: MaxRecipient,
    pub body: MaxBody,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub link: Option<MaxLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaxRecipient {
    pub chat_id: i64,
    pub chat_type: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaxBody {
    pub mid: String,
    pub seq: i64,
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<MaxAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MaxAttachment {
    Image { payload: MaxAttachmentPayload },
    Video { payload: MaxAttachmentPayload },
    File { payload: MaxAttachmentPayload },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaxAttachmentPayload {
    pub token: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaxLink {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: Option<Box<MaxMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaxCallback {
    pub callback_id: String,
    pub payload: Option<String>,
    pub user: MaxUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentEnvelope {
    pub message: SentBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentBody {
    pub body: SentMid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentMid {
    pub mid: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadSlot {
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadedFile {
    token: String,
}
