//! Webhook ingress: an axum route receiving Telegram updates.
//!
//! Telegram repeats the configured secret in the
//! `X-Telegram-Bot-Api-Secret-Token` header; requests without it are
//! rejected before the body is looked at. Updates are converted and queued
//! in arrival order, which preserves per-chat ordering because axum handles
//! one webhook request at a time per connection and Telegram serializes
//! deliveries per chat.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use govorun_channels::types::IncomingEvent;

use crate::adapter::TelegramAdapter;
use crate::api::Update;
use crate::convert::update_to_events;

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
pub struct WebhookState {
    adapter: Arc<TelegramAdapter>,
    tx: mpsc::Sender<IncomingEvent>,
    secret: String,
}

/// Build the webhook router. Mount it on the bot's HTTP listener.
pub fn router(
    adapter: Arc<TelegramAdapter>,
    tx: mpsc::Sender<IncomingEvent>,
    secret: String,
) -> Router {
    Router::new()
        .route("/webhook/telegram", post(receive_update))
        .with_state(WebhookState {
            adapter,
            tx,
            secret,
        })
}

async fn receive_update(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> StatusCode {
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented != state.secret {
        warn!("telegram webhook request with bad secret");
        return StatusCode::UNAUTHORIZED;
    }

    debug!(update_id = update.update_id, "telegram webhook update");
    for event in update_to_events(update, state.adapter.bot_user_id()) {
        if state.tx.send(event).await.is_err() {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }
    StatusCode::OK
}
