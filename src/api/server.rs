//! API server initialization

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;

use super::middleware::{self, AllowedOrigins};
use super::rate_limit::{RateLimitState, rate_limit_middleware};
use super::routes::{callback, health, streams};
use crate::core::{AppConfig, CoreApp};
use crate::streams::StreamStore;
use crate::subscriptions::{SubscriptionStore, WebhookManager};

const DEFAULT_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Shared application state injected into every route handler.
#[derive(Clone)]
pub struct AppState {
    pub streams: Arc<StreamStore>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub webhooks: Arc<WebhookManager>,
    pub config: Arc<AppConfig>,
}

pub struct ApiServer {
    app: CoreApp,
    allowed_origins: AllowedOrigins,
}

impl ApiServer {
    pub fn new(app: CoreApp) -> Self {
        let allowed_origins = AllowedOrigins::new(&app.config.server.host, app.config.server.port);
        Self { app, allowed_origins }
    }

    /// Returns CoreApp for graceful shutdown
    pub async fn start(self) -> Result<CoreApp> {
        let Self { app, allowed_origins } = self;

        let shutdown = app.shutdown.clone();
        let host = app.config.server.host.clone();
        let port = app.config.server.port;
        let addr = SocketAddr::new(host.parse()?, port);

        let state = AppState {
            streams: app.stream_store.clone(),
            subscriptions: app.subscription_store.clone(),
            webhooks: app.webhook_manager.clone(),
            config: Arc::new(app.config.clone()),
        };

        let rate_limit_state = RateLimitState { limiter: app.rate_limiter.clone(), bypass_header: app.config.rate_limit.bypass_header.clone() };

        let router = Router::new()
            .route("/health", get(health::health))
            .route("/callback/{consumer_id}", axum::routing::post(callback::handle_callback))
            .route(
                "/{*path}",
                get(streams::read_stream)
                    .put(streams::create_stream)
                    .post(streams::append_stream)
                    .delete(streams::delete_stream)
                    .head(streams::head_stream),
            )
            .with_state(state);

        let router = if app.config.rate_limit.enabled {
            router.layer(axum::middleware::from_fn_with_state(rate_limit_state, rate_limit_middleware))
        } else {
            router
        };

        let router = router
            .fallback(middleware::handle_404)
            .layer(CompressionLayer::new())
            .layer(middleware::cors(&allowed_origins))
            .layer(DefaultBodyLimit::max(DEFAULT_BODY_LIMIT));

        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown.wait())
            .await?;

        Ok(app)
    }
}
