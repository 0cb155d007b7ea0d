//! Process entry point: load config, open storage, wire every service and
//! run until a termination signal.
//!
//! Exit codes: 0 clean stop, 2 configuration failure, 3 storage failure at
//! startup, 4 platform token rejected.

mod app;
mod context;
mod error;
mod handlers;
mod llm_tools;
mod media;
mod pipeline;
mod remind;
mod settings;
mod summarize;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use govorun_cache::Cache;
use govorun_channels::{ChannelError, Outbound, Outbox};
use govorun_core::config::{GovorunConfig, IngressMode};
use govorun_limiter::RateLimiter;
use govorun_llm::Dispatcher;
use govorun_max::MaxAdapter;
use govorun_scheduler::{Scheduler, TaskRegistry};
use govorun_spam::SpamClassifier;
use govorun_storage::StorageRouter;
use govorun_telegram::TelegramAdapter;

use crate::app::{App, Platform, Services};
use crate::handlers::HandlerManager;
use crate::settings::SettingsResolver;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);
const EVENT_QUEUE_DEPTH: usize = 1024;

#[derive(Parser)]
#[command(name = "govorun", about = "Multi-platform conversational LLM bot")]
struct Args {
    /// Configuration directories, merged in order (later overrides earlier).
    #[arg(long = "config-dir", default_value = ".")]
    config_dirs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "govorun=info".into()),
        )
        .init();

    std::process::exit(run(Args::parse()).await);
}

async fn run(args: Args) -> i32 {
    let config = match GovorunConfig::load(&args.config_dirs) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration is invalid");
            return 2;
        }
    };

    let storage = match StorageRouter::open(&config.database) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!(error = %e, "storage startup failed");
            return 3;
        }
    };

    let cache = Arc::new(Cache::new(Arc::clone(&storage)));
    cache.load_from_store();
    let limiter = Arc::new(RateLimiter::new(&config.rate_limiter));
    let spam = SpamClassifier::new(Arc::clone(&storage), config.spam.clone());
    let dispatcher = Arc::new(Dispatcher::from_config(
        &config.providers,
        config.llm.clone(),
        Arc::clone(&limiter),
    ));
    let services = Services::from_config(&config, &cache);
    let settings = SettingsResolver::new(
        Arc::clone(&storage),
        Arc::clone(&cache),
        config.bot.defaults.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let mut background = Vec::new();
    let mut platforms: HashMap<String, Platform> = HashMap::new();

    // --- Telegram adapter ---------------------------------------------------
    if config.telegram.enabled {
        let adapter = Arc::new(TelegramAdapter::new(&config.telegram.bot_token));
        match adapter.check_auth().await {
            Ok(_) => {}
            Err(ChannelError::AuthFailed(reason)) => {
                error!(reason, "telegram authentication failed");
                return 4;
            }
            Err(e) => warn!(error = %e, "telegram auth probe inconclusive; continuing"),
        }
        let outbound: Arc<dyn Outbound> = Arc::clone(&adapter) as _;
        let (outbox, worker) = Outbox::start(
            Arc::clone(&outbound),
            Arc::clone(&limiter),
            shutdown_rx.clone(),
        );
        background.push(worker);

        match config.telegram.ingress {
            IngressMode::Poll => {
                background.push(tokio::spawn(
                    Arc::clone(&adapter).run_polling(event_tx.clone(), shutdown_rx.clone()),
                ));
            }
            IngressMode::Webhook => {
                let secret = config.telegram.webhook_secret.clone().unwrap_or_default();
                let bind = config
                    .telegram
                    .webhook_bind
                    .clone()
                    .unwrap_or_else(|| "0.0.0.0:8081".to_string());
                let router =
                    govorun_telegram::webhook::router(Arc::clone(&adapter), event_tx.clone(), secret);
                background.push(spawn_webhook_listener("telegram", bind, router));
            }
        }

        platforms.insert(
            "telegram".to_string(),
            Platform {
                outbound,
                outbox,
                bot_username: adapter.bot_username(),
                bot_user_id: adapter.bot_user_id(),
            },
        );
    }

    // --- Max adapter --------------------------------------------------------
    if config.max.enabled {
        let adapter = Arc::new(MaxAdapter::new(&config.max.bot_token));
        match adapter.check_auth().await {
            Ok(_) => {}
            Err(ChannelError::AuthFailed(reason)) => {
                error!(reason, "max authentication failed");
                return 4;
            }
            Err(e) => warn!(error = %e, "max auth probe inconclusive; continuing"),
        }
        let outbound: Arc<dyn Outbound> = Arc::clone(&adapter) as _;
        let (outbox, worker) = Outbox::start(
            Arc::clone(&outbound),
            Arc::clone(&limiter),
            shutdown_rx.clone(),
        );
        background.push(worker);

        match config.max.ingress {
            IngressMode::Poll => {
                background.push(tokio::spawn(
                    Arc::clone(&adapter).run_polling(event_tx.clone(), shutdown_rx.clone()),
                ));
            }
            IngressMode::Webhook => {
                let secret = config.max.webhook_secret.clone().unwrap_or_default();
                let bind = config
                    .max
                    .webhook_bind
                    .clone()
                    .unwrap_or_else(|| "0.0.0.0:8082".to_string());
                let router = govorun_max::webhook::router(event_tx.clone(), secret);
                background.push(spawn_webhook_listener("max", bind, router));
            }
        }

        platforms.insert(
            "max".to_string(),
            Platform {
                outbound,
                outbox,
                bot_username: adapter.bot_username(),
                bot_user_id: adapter.bot_user_id(),
            },
        );
    }

    if platforms.is_empty() {
        error!("no platform adapter is enabled; nothing to do");
        return 2;
    }
    drop(event_tx);

    // --- Scheduler ----------------------------------------------------------
    let mut registry = TaskRegistry::new();
    let outboxes: HashMap<String, Outbox> = platforms
        .iter()
        .map(|(name, platform)| (name.clone(), platform.outbox.clone()))
        .collect();
    remind::register_task_handlers(&mut registry, outboxes);
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&storage),
        registry,
        config.scheduler.clone(),
    ));

    let cache_period = Duration::from_secs(config.cache.persistence_period_secs.max(1));
    let app = Arc::new(App {
        config,
        storage,
        cache: Arc::clone(&cache),
        limiter: Arc::clone(&limiter),
        spam,
        dispatcher,
        scheduler: Arc::clone(&scheduler),
        services,
        platforms,
        settings,
        manager: HandlerManager::standard(),
    });

    background.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));
    background.push(tokio::spawn(
        Arc::clone(&cache).run_flush_worker(cache_period, shutdown_rx.clone()),
    ));
    background.push(tokio::spawn(media::run_media_cron(
        Arc::clone(&app),
        shutdown_rx.clone(),
    )));
    background.push(tokio::spawn(
        Arc::clone(&app).run_dispatch(event_rx, shutdown_rx),
    ));

    info!("govorun is up");
    wait_for_signal().await;

    // Graceful stop: ingress halts, outboxes drain, caches flush, in-flight
    // tasks finish; after the grace period everything is cancelled.
    info!("termination signal received; shutting down");
    let _ = shutdown_tx.send(true);
    let drain = async {
        for handle in background {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("grace period expired; cancelling remaining work");
    }
    limiter.shutdown();
    info!("bye");
    0
}

fn spawn_webhook_listener(
    platform: &'static str,
    bind: String,
    router: axum::Router,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(platform, bind = %bind, error = %e, "webhook listener bind failed");
                return;
            }
        };
        info!(platform, bind = %bind, "webhook listener up");
        if let Err(e) = axum::serve(listener, router).await {
            error!(platform, error = %e, "webhook listener stopped");
        }
    })
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("sigterm handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
