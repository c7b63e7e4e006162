//! Rate limiting middleware, backed by an in-memory per-key token bucket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;

/// One token bucket per rate-limit key. Refills continuously at
/// `rpm / 60` tokens per second, capped at `rpm`.
struct TokenBucket {
    tokens_milli: AtomicI64, // tokens * 1000, to keep the bucket lock-free
    last_refill_ms: AtomicI64,
}

pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: i64,
    pub retry_after: Option<u64>,
}

pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    requests_per_minute: u32,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self { buckets: DashMap::new(), requests_per_minute }
    }

    pub fn check(&self, key: &str) -> RateLimitResult {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let limit = self.requests_per_minute as i64;
        let refill_per_ms = limit as f64 / 60_000.0;

        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket {
                tokens_milli: AtomicI64::new(limit * 1000),
                last_refill_ms: AtomicI64::new(now_ms),
            });

        let last = bucket.last_refill_ms.swap(now_ms, Ordering::AcqRel);
        let elapsed_ms = (now_ms - last).max(0) as f64;
        let refill_milli = (elapsed_ms * refill_per_ms * 1000.0) as i64;

        let mut current = bucket.tokens_milli.load(Ordering::Acquire);
        current = (current + refill_milli).min(limit * 1000);

        let allowed = current >= 1000;
        let remaining_milli = if allowed { current - 1000 } else { current };
        bucket.tokens_milli.store(remaining_milli, Ordering::Release);

        RateLimitResult {
            allowed,
            remaining: (remaining_milli / 1000).max(0) as u32,
            limit: self.requests_per_minute,
            reset_at: now_ms / 1000 + 60,
            retry_after: if allowed { None } else { Some(1) },
        }
    }
}

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub bypass_header: Option<String>,
}

pub struct RateLimitExceeded(RateLimitResult);

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        let r = &self.0;
        let mut response = Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("X-RateLimit-Limit", r.limit.to_string())
            .header("X-RateLimit-Remaining", r.remaining.to_string())
            .header("X-RateLimit-Reset", r.reset_at.to_string())
            .header(header::RETRY_AFTER, r.retry_after.unwrap_or(60).to_string())
            .body(Body::from(r#"{"code":"RATE_LIMITED","detail":"rate limit exceeded"}"#))
            .unwrap();

        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/problem+json"));
        response
    }
}

fn add_rate_limit_headers(response: &mut Response, result: &RateLimitResult) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&result.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&result.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&result.reset_at.to_string()) {
        headers.insert("X-RateLimit-Reset", v);
    }
}

fn extract_key(request: &Request, addr: SocketAddr) -> String {
    request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, RateLimitExceeded> {
    if let Some(ref bypass_secret) = state.bypass_header
        && let Some(header_val) = request.headers().get("X-RateLimit-Bypass")
        && header_val.to_str().ok() == Some(bypass_secret.as_str())
    {
        tracing::trace!("Rate limit bypassed via header");
        return Ok(next.run(request).await);
    }

    let key = extract_key(&request, addr);
    let result = state.limiter.check(&key);

    if !result.allowed {
        tracing::debug!(%key, "Rate limit exceeded");
        return Err(RateLimitExceeded(result));
    }

    let mut response = next.run(request).await;
    add_rate_limit_headers(&mut response, &result);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_within_budget() {
        let limiter = RateLimiter::new(60);
        for _ in 0..5 {
            assert!(limiter.check("client-a").allowed);
        }
    }

    #[test]
    fn rejects_once_budget_exhausted() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("client-b").allowed);
        assert!(!limiter.check("client-b").allowed);
    }

    #[test]
    fn separate_keys_have_separate_budgets() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("client-c").allowed);
        assert!(limiter.check("client-d").allowed);
    }

    #[test]
    fn rate_limit_exceeded_response_status() {
        let result = RateLimitResult { allowed: false, remaining: 0, limit: 100, reset_at: 1705593600, retry_after: Some(45) };
        let response = RateLimitExceeded(result).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
