//! Core application

use std::sync::Arc;

use anyhow::Result;

use crate::api::ApiServer;
use crate::api::rate_limit::RateLimiter;
use crate::core::cli::{self, Cli};
use crate::core::config::AppConfig;
use crate::core::shutdown::ShutdownService;
use crate::streams::StreamStore;
use crate::subscriptions::{SubscriptionStore, WebhookManager, WebhookManagerConfig};

const ENV_LOG: &str = "DURABLE_STREAMS_LOG";
const APP_NAME_LOWER: &str = "durable_streams_server";

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub stream_store: Arc<StreamStore>,
    pub subscription_store: Arc<SubscriptionStore>,
    pub webhook_manager: Arc<WebhookManager>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let cli = cli::parse();
        let app = Self::init(&cli).await?;
        Self::start_server(app).await
    }

    async fn init(cli: &Cli) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        let shutdown = ShutdownService::new();

        let stream_store = StreamStore::with_retention(shutdown.subscribe(), config.streams.max_retained_messages);
        let subscription_store = Arc::new(SubscriptionStore::new());
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.requests_per_minute));

        let webhook_manager = WebhookManager::new(
            subscription_store.clone(),
            stream_store.clone(),
            WebhookManagerConfig {
                request_timeout_ms: config.webhooks.request_timeout_ms,
                liveness_timeout_ms: config.webhooks.liveness_timeout_ms as i64,
                continuous_failure_gc_ms: config.webhooks.subscription_max_age_secs * 1000,
                callback_token_ttl_secs: config.webhooks.callback_token_ttl_secs,
                signing_secret: config.webhooks.signing_secret.clone(),
                callback_base_path: format!("http://{}:{}/callback", config.server.host, config.server.port),
            },
        );

        Ok(Self { config, shutdown, stream_store, subscription_store, webhook_manager, rate_limiter })
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG).or_else(|_| std::env::var("RUST_LOG")).unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) -> Result<()> {
        app.shutdown.install_signal_handlers();
        app.start_background_tasks().await?;

        tracing::info!(
            host = %app.config.server.host,
            port = app.config.server.port,
            "Durable Streams server starting"
        );

        let server = ApiServer::new(app);
        let app = server.start().await?;
        app.shutdown.shutdown().await;

        Ok(())
    }

    pub async fn start_background_tasks(&self) -> Result<()> {
        let store = self.stream_store.clone();
        let max_age_secs = self.config.streams.producer_max_age_secs;
        let interval_secs = self.config.streams.producer_gc_interval_secs;
        let mut gc_shutdown = self.shutdown.subscribe();
        let gc_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now_ms = chrono::Utc::now().timestamp_millis();
                        store.gc_producers(now_ms, max_age_secs * 1000);
                    }
                    _ = gc_shutdown.changed() => break,
                }
            }
        });
        self.shutdown.register(gc_handle).await;

        let webhooks = self.webhook_manager.clone();
        let webhook_shutdown = self.shutdown.subscribe();
        let webhook_handle = tokio::spawn(async move {
            webhooks.run(webhook_shutdown).await;
        });
        self.shutdown.register(webhook_handle).await;

        tracing::debug!("Background tasks started");
        Ok(())
    }
}
