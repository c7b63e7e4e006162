//! Command-line / environment configuration surface.

use clap::Parser;

/// Durable Streams HTTP server.
#[derive(Debug, Parser)]
#[command(name = "durable-streams", version, about)]
pub struct Cli {
    /// Address to bind the HTTP listener on.
    #[arg(long, env = "DURABLE_STREAMS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the HTTP listener on.
    #[arg(long, env = "DURABLE_STREAMS_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Maximum duration a long-poll GET may park before returning empty.
    #[arg(long, env = "DURABLE_STREAMS_LONG_POLL_TIMEOUT_MS", default_value_t = 30_000)]
    pub long_poll_timeout_ms: u64,

    /// How often the producer-ledger GC sweep runs.
    #[arg(long, env = "DURABLE_STREAMS_PRODUCER_GC_INTERVAL_SECS", default_value_t = 3600)]
    pub producer_gc_interval_secs: u64,

    /// Producer ledger entries idle longer than this are GC'd.
    #[arg(long, env = "DURABLE_STREAMS_PRODUCER_MAX_AGE_SECS", default_value_t = 7 * 24 * 3600)]
    pub producer_max_age_secs: i64,

    /// Maximum number of messages retained per stream; older messages are
    /// evicted and reads against their offsets return 410 OFFSET_EXPIRED.
    /// 0 disables retention (messages live as long as the stream does).
    #[arg(long, env = "DURABLE_STREAMS_MAX_RETAINED_MESSAGES", default_value_t = 0)]
    pub max_retained_messages: usize,

    /// HMAC/JWT signing secret for webhook deliveries and callback tokens.
    /// Generated ephemerally (and logged as a warning) when unset.
    #[arg(long, env = "DURABLE_STREAMS_SIGNING_SECRET")]
    pub signing_secret: Option<String>,

    /// How long a callback bearer token remains valid.
    #[arg(long, env = "DURABLE_STREAMS_CALLBACK_TOKEN_TTL_SECS", default_value_t = 300)]
    pub callback_token_ttl_secs: u64,

    /// Per-subscription webhook request timeout.
    #[arg(long, env = "DURABLE_STREAMS_WEBHOOK_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    pub webhook_request_timeout_ms: u64,

    /// How long a consumer may stay WAKING/LIVE without an ack before the
    /// manager considers it dead and retries.
    #[arg(long, env = "DURABLE_STREAMS_WEBHOOK_LIVENESS_TIMEOUT_MS", default_value_t = 45_000)]
    pub webhook_liveness_timeout_ms: u64,

    /// Subscriptions idle (no successful delivery) longer than this are GC'd.
    #[arg(long, env = "DURABLE_STREAMS_SUBSCRIPTION_MAX_AGE_SECS", default_value_t = 3 * 24 * 3600)]
    pub subscription_max_age_secs: i64,

    /// Requests per minute allowed per client before 429s, 0 disables limiting.
    #[arg(long, env = "DURABLE_STREAMS_RATE_LIMIT_RPM", default_value_t = 600)]
    pub rate_limit_rpm: u32,

    /// Header that bypasses rate limiting when present (internal tooling).
    #[arg(long, env = "DURABLE_STREAMS_RATE_LIMIT_BYPASS_HEADER")]
    pub rate_limit_bypass_header: Option<String>,

    /// Enables verbose request/response body logging on error paths.
    #[arg(long, env = "DURABLE_STREAMS_DEBUG", default_value_t = false)]
    pub debug: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
