//! Validated, typed application configuration built from [`super::cli::Cli`].

use anyhow::Result;
use tracing::warn;

use super::cli::Cli;
use crate::utils::crypto;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct StreamsConfig {
    pub long_poll_timeout_ms: u64,
    pub producer_gc_interval_secs: u64,
    pub producer_max_age_secs: i64,
    pub max_retained_messages: usize,
}

#[derive(Debug, Clone)]
pub struct WebhooksConfig {
    pub signing_secret: String,
    pub callback_token_ttl_secs: u64,
    pub request_timeout_ms: u64,
    pub liveness_timeout_ms: u64,
    pub subscription_max_age_secs: i64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub bypass_header: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub debug: bool,
    pub server: ServerConfig,
    pub streams: StreamsConfig,
    pub webhooks: WebhooksConfig,
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        if cli.host.parse::<std::net::IpAddr>().is_err() {
            anyhow::bail!("invalid --host value: {}", cli.host);
        }

        let signing_secret = match &cli.signing_secret {
            Some(s) if !s.is_empty() => s.clone(),
            _ => {
                warn!(
                    "No signing secret configured; generating an ephemeral one. \
                     Webhook signatures and callback tokens will not survive a restart."
                );
                crypto::encode_hex(&crypto::generate_signing_key())
            }
        };

        Ok(Self {
            debug: cli.debug,
            server: ServerConfig { host: cli.host.clone(), port: cli.port },
            streams: StreamsConfig {
                long_poll_timeout_ms: cli.long_poll_timeout_ms,
                producer_gc_interval_secs: cli.producer_gc_interval_secs,
                producer_max_age_secs: cli.producer_max_age_secs,
                max_retained_messages: cli.max_retained_messages,
            },
            webhooks: WebhooksConfig {
                signing_secret,
                callback_token_ttl_secs: cli.callback_token_ttl_secs,
                request_timeout_ms: cli.webhook_request_timeout_ms,
                liveness_timeout_ms: cli.webhook_liveness_timeout_ms,
                subscription_max_age_secs: cli.subscription_max_age_secs,
            },
            rate_limit: RateLimitConfig {
                enabled: cli.rate_limit_rpm > 0,
                requests_per_minute: cli.rate_limit_rpm,
                bypass_header: cli.rate_limit_bypass_header.clone(),
            },
        })
    }
}
