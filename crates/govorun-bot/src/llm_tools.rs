//! The per-event tool registry handed to the dispatcher.
//!
//! Tools are conditionally exposed: external-service tools require the
//! service to be configured (and, for search, the chat's opt-in setting);
//! the storage-backed tools are always present. Tool failures come back as
//! structured error results and feed the model's next turn.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use govorun_channels::types::{IncomingEvent, OutgoingAction, OutgoingMedia};
use govorun_channels::Outbox;
use govorun_llm::{Dispatcher, Tool, ToolResult};
use govorun_scheduler::Scheduler;
use govorun_services::geocode::GeocodeService;
use govorun_services::image::ImageService;
use govorun_services::search::SearchService;
use govorun_services::weather::WeatherService;
use govorun_storage::types::{MediaAttachment, MediaStatus, StoredMessage};
use govorun_storage::StorageRouter;

use crate::app::App;
use crate::settings::ResolvedSettings;
use crate::summarize;

pub fn build(app: &App, event: &IncomingEvent, settings: &ResolvedSettings) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();

    if let Some(weather) = &app.services.weather {
        tools.push(Arc::new(GetWeather {
            weather: Arc::clone(weather),
        }));
    }
    if settings.enable_yandex_search() {
        if let Some(search) = &app.services.search {
            tools.push(Arc::new(WebSearch {
                search: Arc::clone(search),
            }));
        }
    }
    if let Some(geocode) = &app.services.geocode {
        tools.push(Arc::new(Geocode {
            geocode: Arc::clone(geocode),
        }));
    }
    if let (Some(image), Ok(platform)) = (&app.services.image, app.platform(&event.platform)) {
        tools.push(Arc::new(DrawImage {
            image: Arc::clone(image),
            storage: Arc::clone(&app.storage),
            outbox: platform.outbox.clone(),
            chat_id: event.chat.chat_id,
            topic_id: event.chat.topic_id,
        }));
    }

    tools.push(Arc::new(SetUserData {
        storage: Arc::clone(&app.storage),
        chat_id: event.chat.chat_id,
        user_id: event.user.user_id,
    }));
    tools.push(Arc::new(SetReminder {
        scheduler: Arc::clone(&app.scheduler),
        platform: event.platform.clone(),
        chat_id: event.chat.chat_id,
        topic_id: event.chat.topic_id,
    }));
    tools.push(Arc::new(Summarize {
        dispatcher: Arc::clone(&app.dispatcher),
        storage: Arc::clone(&app.storage),
        model: app.model_for(settings.chat_model()).unwrap_or_default(),
        chat_id: event.chat.chat_id,
        topic_id: event.chat.topic_id,
    }));

    tools
}

// --- get_weather ------------------------------------------------------------

struct GetWeather {
    weather: Arc<WeatherService>,
}

#[async_trait]
impl Tool for GetWeather {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Current weather for a city. Use when the user asks about weather, \
         temperature or wind anywhere."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "city": { "type": "string", "description": "City name, e.g. 'Minsk'." },
                "country": { "type": "string", "description": "Optional ISO country code, e.g. 'by'." }
            },
            "required": ["city"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let Some(city) = input.get("city").and_then(|v| v.as_str()) else {
            return ToolResult::error("'city' is required");
        };
        let country = input.get("country").and_then(|v| v.as_str());
        match self.weather.current(city, country).await {
            Ok(report) => ToolResult::success(format!(
                "{}: {}, {:.1}C (feels like {:.1}C), wind {:.1} m/s, humidity {}%",
                report.city,
                report.description,
                report.temp_c,
                report.feels_like_c,
                report.wind_ms,
                report.humidity,
            )),
            Err(e) => ToolResult::error(format!("weather lookup failed: {e}")),
        }
    }
}

// --- web_search -------------------------------------------------------------

struct WebSearch {
    search: Arc<SearchService>,
}

#[async_trait]
impl Tool for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for fresh or factual information you do not know."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "page": { "type": "integer", "description": "Result page, 0-based." }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let Some(query) = input.get("query").and_then(|v| v.as_str()) else {
            return ToolResult::error("'query' is required");
        };
        let page = input.get("page").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        match self.search.search(query, page).await {
            Ok(hits) if hits.is_empty() => ToolResult::success("No results."),
            Ok(hits) => {
                let mut out = String::new();
                for hit in hits.iter().take(5) {
                    out.push_str(&format!("- {} — {}\n  {}\n", hit.title, hit.url, hit.snippet));
                }
                ToolResult::success(out)
            }
            Err(e) => ToolResult::error(format!("search failed: {e}")),
        }
    }
}

// --- geocode ----------------------------------------------------------------

struct Geocode {
    geocode: Arc<GeocodeService>,
}

#[async_trait]
impl Tool for Geocode {
    fn name(&self) -> &str {
        "geocode"
    }

    fn description(&self) -> &str {
        "Resolve a place name to coordinates, or coordinates to a place."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Free-text place name." },
                "lat": { "type": "number" },
                "lon": { "type": "number" }
            }
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        if let Some(query) = input.get("query").and_then(|v| v.as_str()) {
            return match self.geocode.search(query).await {
                Ok(places) if places.is_empty() => ToolResult::success("No matches."),
                Ok(places) => ToolResult::success(
                    places
                        .iter()
                        .take(3)
                        .map(|p| format!("{} ({}, {})", p.display_name, p.lat, p.lon))
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                Err(e) => ToolResult::error(format!("geocoding failed: {e}")),
            };
        }
        match (
            input.get("lat").and_then(|v| v.as_f64()),
            input.get("lon").and_then(|v| v.as_f64()),
        ) {
            (Some(lat), Some(lon)) => match self.geocode.reverse(lat, lon).await {
                Ok(place) => ToolResult::success(place.display_name),
                Err(e) => ToolResult::error(format!("reverse geocoding failed: {e}")),
            },
            _ => ToolResult::error("provide either 'query' or both 'lat' and 'lon'"),
        }
    }
}

// --- draw_image -------------------------------------------------------------

struct DrawImage {
    image: Arc<ImageService>,
    storage: Arc<StorageRouter>,
    outbox: Outbox,
    chat_id: i64,
    topic_id: i64,
}

#[async_trait]
impl Tool for DrawImage {
    fn name(&self) -> &str {
        "draw_image"
    }

    fn description(&self) -> &str {
        "Generate an image from a text prompt and post it to the chat. \
         Use when the user asks you to draw, paint or generate a picture."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "What to draw, in detail." }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let Some(prompt) = input.get("prompt").and_then(|v| v.as_str()) else {
            return ToolResult::error("'prompt' is required");
        };
        let generated = match self.image.generate(prompt).await {
            Ok(generated) => generated,
            Err(e) => return ToolResult::error(format!("image generation failed: {e}")),
        };
        let Ok(bytes) = STANDARD.decode(&generated.base64) else {
            return ToolResult::error("image payload was not valid base64");
        };

        let file_unique_id = format!("gen-{}", uuid::Uuid::new_v4());
        let _ = self.storage.upsert_attachment(
            &MediaAttachment {
                file_unique_id: file_unique_id.clone(),
                status: MediaStatus::New,
                mime: "image/png".to_string(),
                size: bytes.len() as i64,
                local_url: None,
                file_id: String::new(),
                description: None,
                prompt: Some(prompt.to_string()),
            },
            None,
        );

        let submit = self
            .outbox
            .submit(OutgoingAction::SendMedia {
                chat_id: self.chat_id,
                topic_id: self.topic_id,
                media: OutgoingMedia::Bytes {
                    name: "generated.png".to_string(),
                    mime: "image/png".to_string(),
                    bytes,
                    caption: generated.prompt.clone(),
                },
            })
            .await;
        match submit {
            Ok(()) => ToolResult::success(
                "Image generated and sent to the chat. Mention it briefly; do not describe it in full.",
            ),
            Err(e) => ToolResult::error(format!("image send failed: {e}")),
        }
    }
}

// --- set_user_data ----------------------------------------------------------

struct SetUserData {
    storage: Arc<StorageRouter>,
    chat_id: i64,
    user_id: i64,
}

#[async_trait]
impl Tool for SetUserData {
    fn name(&self) -> &str {
        "set_user_data"
    }

    fn description(&self) -> &str {
        "Remember a short note about the current user in this chat \
         (preferences, facts they asked you to keep)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "Short identifier, e.g. 'persona-note'." },
                "value": { "type": "string" }
            },
            "required": ["key", "value"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let (Some(key), Some(value)) = (
            input.get("key").and_then(|v| v.as_str()),
            input.get("value").and_then(|v| v.as_str()),
        ) else {
            return ToolResult::error("'key' and 'value' are required");
        };
        match self
            .storage
            .set_user_data(self.user_id, self.chat_id, key, value, None)
        {
            Ok(()) => ToolResult::success(format!("Stored {key}.")),
            Err(e) => ToolResult::error(format!("could not store user data: {e}")),
        }
    }
}

// --- set_reminder -----------------------------------------------------------

struct SetReminder {
    scheduler: Arc<Scheduler>,
    platform: String,
    chat_id: i64,
    topic_id: i64,
}

#[async_trait]
impl Tool for SetReminder {
    fn name(&self) -> &str {
        "set_reminder"
    }

    fn description(&self) -> &str {
        "Schedule a reminder message in this chat. ALWAYS use this when the \
         user asks to be reminded later; never answer with reminder text directly."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "in_seconds": { "type": "integer", "description": "Seconds from now." },
                "text": { "type": "string", "description": "Reminder text to deliver." }
            },
            "required": ["in_seconds", "text"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let (Some(in_seconds), Some(text)) = (
            input.get("in_seconds").and_then(|v| v.as_i64()),
            input.get("text").and_then(|v| v.as_str()),
        ) else {
            return ToolResult::error("'in_seconds' and 'text' are required");
        };
        if in_seconds <= 0 {
            return ToolResult::error("'in_seconds' must be positive");
        }
        let fire_at = chrono::Utc::now().timestamp() + in_seconds;
        let id = format!("remind-{}", uuid::Uuid::new_v4());
        let kwargs = json!({
            "platform": self.platform,
            "chat_id": self.chat_id,
            "topic_id": self.topic_id,
            "text": text,
        });
        match self.scheduler.schedule(&id, fire_at, "notify", kwargs) {
            Ok(_) => ToolResult::success(format!("Reminder set for {in_seconds} seconds from now.")),
            Err(e) => ToolResult::error(format!("could not schedule reminder: {e}")),
        }
    }
}

// --- summarize --------------------------------------------------------------

struct Summarize {
    dispatcher: Arc<Dispatcher>,
    storage: Arc<StorageRouter>,
    model: String,
    chat_id: i64,
    topic_id: i64,
}

#[async_trait]
impl Tool for Summarize {
    fn name(&self) -> &str {
        "summarize"
    }

    fn description(&self) -> &str {
        "Summarize the recent conversation in this chat. Use when the user \
         asks what was discussed or wants a recap."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "count": { "type": "integer", "description": "How many recent messages to cover (default 50)." }
            }
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let count = input.get("count").and_then(|v| v.as_u64()).unwrap_or(50) as usize;
        let messages: Vec<StoredMessage> = match self
            .storage
            .recent_messages(self.chat_id, self.topic_id, count, None)
        {
            Ok(messages) => messages,
            Err(e) => return ToolResult::error(format!("history read failed: {e}")),
        };
        match summarize::summarize_messages(
            &self.dispatcher,
            &self.storage,
            &self.model,
            self.chat_id,
            self.topic_id,
            &messages,
        )
        .await
        {
            Ok(summary) => ToolResult::success(summary),
            Err(e) => ToolResult::error(format!("summarization failed: {e}")),
        }
    }
}
