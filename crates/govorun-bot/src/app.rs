//! Top-level wiring: every service is constructed once here and handed to
//! the components that need it. No module-level globals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use govorun_cache::{Cache, PersistenceLevel};
use govorun_channels::{IncomingEvent, Outbound, Outbox, SentMessage};
use govorun_core::config::GovorunConfig;
use govorun_limiter::RateLimiter;
use govorun_llm::Dispatcher;
use govorun_scheduler::Scheduler;
use govorun_services::geocode::GeocodeService;
use govorun_services::image::ImageService;
use govorun_services::search::SearchService;
use govorun_services::weather::WeatherService;
use govorun_spam::SpamClassifier;
use govorun_storage::StorageRouter;

use crate::error::{BotError, Result};
use crate::handlers::HandlerManager;
use crate::settings::SettingsResolver;

/// How long one event may spend in its handlers before it is cancelled.
const EVENT_DEADLINE: Duration = Duration::from_secs(120);
/// Cached admin lists go stale after this many seconds.
const ADMIN_CACHE_TTL: Duration = Duration::from_secs(300);

pub struct Services {
    pub weather: Option<Arc<WeatherService>>,
    pub search: Option<Arc<SearchService>>,
    pub geocode: Option<Arc<GeocodeService>>,
    pub image: Option<Arc<ImageService>>,
}

impl Services {
    pub fn from_config(config: &GovorunConfig, cache: &Arc<Cache>) -> Self {
        Self {
            weather: config
                .services
                .openweathermap
                .as_ref()
                .map(|c| Arc::new(WeatherService::new(c, Arc::clone(cache)))),
            search: config
                .services
                .yandex_search
                .as_ref()
                .map(|c| Arc::new(SearchService::new(c, Arc::clone(cache)))),
            geocode: config
                .services
                .geocoder
                .as_ref()
                .map(|c| Arc::new(GeocodeService::new(c, Arc::clone(cache)))),
            image: config.services.image.as_ref().map(|c| Arc::new(ImageService::new(c))),
        }
    }
}

/// One connected chat platform.
pub struct Platform {
    pub outbound: Arc<dyn Outbound>,
    pub outbox: Outbox,
    pub bot_username: String,
    pub bot_user_id: i64,
}

pub struct App {
    pub config: GovorunConfig,
    pub storage: Arc<StorageRouter>,
    pub cache: Arc<Cache>,
    pub limiter: Arc<RateLimiter>,
    pub spam: SpamClassifier,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub services: Services,
    pub platforms: HashMap<String, Platform>,
    pub settings: SettingsResolver,
    pub manager: HandlerManager,
}

impl App {
    pub fn platform(&self, name: &str) -> Result<&Platform> {
        self.platforms
            .get(name)
            .ok_or_else(|| BotError::Internal(format!("unknown platform: {name}")))
    }

    /// Binding id used for a chat: its `chat-model` setting, the configured
    /// default, or the alphabetically first binding.
    pub fn model_for(&self, chat_model_setting: &str) -> Result<String> {
        if !chat_model_setting.is_empty() {
            return Ok(chat_model_setting.to_string());
        }
        if let Some(model) = &self.config.llm.default_model {
            return Ok(model.clone());
        }
        self.dispatcher
            .list_bindings()
            .first()
            .map(|(id, _)| id.to_string())
            .ok_or_else(|| BotError::Validation("no LLM provider is configured".to_string()))
    }

    pub fn is_owner(&self, username: Option<&str>) -> bool {
        let Some(username) = username else {
            return false;
        };
        self.config
            .bot
            .bot_owners
            .iter()
            .any(|owner| owner.trim_start_matches('@') == username)
    }

    /// Owner, or listed among the chat's admins (cached for five minutes).
    pub async fn is_admin(
        &self,
        platform: &str,
        chat_id: i64,
        user_id: i64,
        username: Option<&str>,
    ) -> bool {
        if self.is_owner(username) {
            return true;
        }
        let cache_key = format!("{platform}:{chat_id}");
        let admins: Vec<i64> = match self.cache.get("chat_admins", &cache_key) {
            Some((cached, _)) => serde_json::from_str(&cached).unwrap_or_default(),
            None => {
                let Ok(platform_ref) = self.platform(platform) else {
                    return false;
                };
                match platform_ref.outbound.chat_admins(chat_id).await {
                    Ok(admins) => {
                        if let Ok(serialized) = serde_json::to_string(&admins) {
                            self.cache.set(
                                "chat_admins",
                                &cache_key,
                                serialized,
                                Some(ADMIN_CACHE_TTL),
                                PersistenceLevel::MemoryOnly,
                            );
                        }
                        admins
                    }
                    Err(e) => {
                        warn!(platform, chat_id, error = %e, "admin list fetch failed");
                        Vec::new()
                    }
                }
            }
        };
        admins.contains(&user_id)
    }

    /// Rate-limited synchronous send, used where the platform message id is
    /// needed for reply persistence. Fire-and-forget actions go through the
    /// outbox instead.
    pub async fn send_text_now(
        &self,
        platform: &str,
        chat_id: i64,
        topic_id: i64,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SentMessage> {
        let platform_ref = self.platform(platform)?;
        self.limiter
            .admit(&format!("{platform}-send"), None, None)
            .await
            .map_err(|e| BotError::Internal(e.to_string()))?;
        Ok(platform_ref
            .outbound
            .send_text(chat_id, topic_id, text, reply_to)
            .await?)
    }

    /// Fan events out to per-chat workers: events of one chat run strictly
    /// in arrival order, distinct chats run in parallel.
    pub async fn run_dispatch(
        self: Arc<Self>,
        mut events: mpsc::Receiver<IncomingEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut chat_queues: HashMap<(String, i64), mpsc::Sender<IncomingEvent>> = HashMap::new();
        info!("event dispatch started");

        loop {
            let event = tokio::select! {
                next = events.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let key = (event.platform.clone(), event.chat.chat_id);
            let queue = chat_queues.entry(key).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(64);
                tokio::spawn(chat_worker(Arc::clone(&self), rx));
                tx
            });
            if queue.send(event).await.is_err() {
                warn!("chat worker queue closed");
            }
        }
        // Dropping the senders lets every chat worker drain and exit.
        info!("event dispatch stopped");
    }
}

async fn chat_worker(app: Arc<App>, mut rx: mpsc::Receiver<IncomingEvent>) {
    while let Some(event) = rx.recv().await {
        let outcome = tokio::time::timeout(EVENT_DEADLINE, app.manager.dispatch(&app, &event)).await;
        match outcome {
            Ok(()) => {}
            Err(_) => error!(
                platform = %event.platform,
                chat = event.chat.chat_id,
                "event processing exceeded its deadline; cancelled"
            ),
        }
    }
}
