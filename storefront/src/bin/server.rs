use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::config::Config;
use pipeline::{
    JobQueue, QueueLifecycle, QueueSettings, QueueStatsSource, Scheduler, WorkerPool,
};
use storefront::abandoned::AbandonedCartService;
use storefront::api::{self, AppState};
use storefront::bots::BotClient;
use storefront::db_storage::DbStore;
use storefront::jobs::{IMAGE_QUEUE, ImageJob, ImageProcessor, REPORTS_QUEUE, ReportGenerator, ReportJob};
use storefront::memory_storage::MemoryStore;
use storefront::notifications::{
    NOTIFICATIONS_QUEUE, NotificationDispatcher, NotificationJob, NotificationQueue,
};
use storefront::orders::OrderService;
use storefront::storage::{AbandonedCartStorage, CartStorage, OrderStorage, SettingsStorage};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: String,
}

struct Stores {
    orders: Arc<dyn OrderStorage>,
    carts: Arc<dyn CartStorage>,
    abandoned: Arc<dyn AbandonedCartStorage>,
    settings: Arc<dyn SettingsStorage>,
}

async fn build_stores(config: &Config) -> anyhow::Result<Stores> {
    if config.common.database_url.is_empty() {
        warn!("no database_url configured, falling back to the in-memory store");
        let store = Arc::new(MemoryStore::new());
        return Ok(Stores {
            orders: store.clone(),
            carts: store.clone(),
            abandoned: store.clone(),
            settings: store,
        });
    }

    let store = Arc::new(
        DbStore::connect(&config.common.database_url)
            .await
            .map_err(|e| anyhow::anyhow!("connecting to database: {}", e))?,
    );
    Ok(Stores {
        orders: store.clone(),
        carts: store.clone(),
        abandoned: store.clone(),
        settings: store,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::load(&args.config)
        .map_err(|e| anyhow::anyhow!("loading config from {}: {}", args.config, e))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone())),
        )
        .init();
    info!("starting {}...", config.common.project_name);

    let stores = build_stores(&config).await?;

    // One queue per workload, each with its own tuning.
    let notifications_queue = Arc::new(JobQueue::<NotificationJob>::new(
        NOTIFICATIONS_QUEUE,
        QueueSettings::from(&config.queues.notifications),
    ));
    let images_queue = Arc::new(JobQueue::<ImageJob>::new(
        IMAGE_QUEUE,
        QueueSettings::from(&config.queues.images),
    ));
    let reports_queue = Arc::new(JobQueue::<ReportJob>::new(
        REPORTS_QUEUE,
        QueueSettings::from(&config.queues.reports),
    ));

    let bots = Arc::new(
        BotClient::new(&config.bots)
            .map_err(|e| anyhow::anyhow!("building bot client: {}", e))?,
    );
    bots.check_availability().await;

    let dispatcher = Arc::new(NotificationDispatcher::new(
        bots,
        stores.abandoned.clone(),
        stores.carts.clone(),
    ));
    let notifications_pool = WorkerPool::start(&notifications_queue, dispatcher);
    let images_pool = WorkerPool::start(&images_queue, Arc::new(ImageProcessor));
    let reports_pool = WorkerPool::start(&reports_queue, Arc::new(ReportGenerator));

    let sink = Arc::new(NotificationQueue::new(notifications_queue.clone()));
    let abandoned_service = Arc::new(AbandonedCartService::new(
        stores.carts.clone(),
        stores.orders.clone(),
        stores.abandoned.clone(),
        stores.settings.clone(),
        sink.clone(),
        config.abandonment.idle_threshold_hours,
    ));
    let order_service = Arc::new(OrderService::new(
        stores.orders.clone(),
        stores.carts.clone(),
        sink,
        abandoned_service.clone(),
    ));

    let mut scheduler = Scheduler::new();
    let sweeper = abandoned_service.clone();
    scheduler.every(
        "abandoned-cart-sweep",
        Duration::from_secs(config.abandonment.sweep_interval_secs),
        move || {
            let service = sweeper.clone();
            async move {
                if let Err(e) = service.sweep(Utc::now()).await {
                    error!("abandoned cart sweep failed: {}", e);
                }
            }
        },
    );
    let reminders = abandoned_service.clone();
    scheduler.every(
        "abandoned-cart-reminders",
        Duration::from_secs(config.abandonment.reminder_check_interval_secs),
        move || {
            let service = reminders.clone();
            async move {
                if let Err(e) = service.send_due_reminders(Utc::now()).await {
                    error!("reminder pass failed: {}", e);
                }
            }
        },
    );
    let scheduler_handle = scheduler.start();

    let queues: Arc<Vec<Arc<dyn QueueStatsSource>>> = Arc::new(vec![
        notifications_queue.clone(),
        images_queue.clone(),
        reports_queue.clone(),
    ]);
    let state = AppState {
        orders: order_service,
        abandoned: abandoned_service,
        carts: stores.carts.clone(),
        settings: stores.settings.clone(),
        queues,
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.server_address)
        .await
        .with_context(|| format!("binding {}", config.server.server_address))?;
    info!("listening on {}", config.server.server_address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the timers first, then stop admitting jobs, then drain with the
    // bounded grace.
    scheduler_handle.shutdown().await;
    notifications_queue.close();
    images_queue.close();
    reports_queue.close();

    let mut lifecycle = QueueLifecycle::from_config(&config.shutdown);
    lifecycle.register(notifications_pool);
    lifecycle.register(images_pool);
    lifecycle.register(reports_pool);
    lifecycle.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for the shutdown signal: {}", e);
        return;
    }
    info!("shutdown signal received");
}
