//! Webhook ingress for Max: subscription deliveries are plain POSTs with an
//! update object; the shared secret travels in the `X-Max-Bot-Api-Secret`
//! header of our own subscription configuration.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use govorun_channels::types::IncomingEvent;

use crate::api::MaxUpdate;
use crate::convert::update_to_events;

const SECRET_HEADER: &str = "x-max-bot-api-secret";

#[derive(Clone)]
pub struct WebhookState {
    tx: mpsc::Sender<IncomingEvent>,
    secret: String,
}

pub fn router(tx: mpsc::Sender<IncomingEvent>, secret: String) -> Router {
    Router::new()
        .route("/webhook/max", post(receive_update))
        .with_state(WebhookState { tx, secret })
}

async fn receive_update(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(update): Json<MaxUpdate>,
) -> StatusCode {
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented != state.secret {
        warn!("max webhook request with bad secret");
        return StatusCode::UNAUTHORIZED;
    }

    debug!("max webhook update");
    for event in update_to_events(update) {
        if state.tx.send(event).await.is_err() {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }
    StatusCode::OK
}
