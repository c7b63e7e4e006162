//! Stream endpoints (component F): PUT/POST/GET/HEAD/DELETE on a
//! wildcard stream path.
//!
//! Grounded on the reference HTTP surface (moneymq's
//! `crates/stream/src/server.rs`: `handle_create`/`handle_append`/
//! `handle_read`/`handle_head`/`handle_delete`), extended with producer
//! headers, `Stream-Seq`, `Stream-Closed`, and RFC 9457 error bodies.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use serde::Deserialize;

use super::subscriptions;
use crate::api::server::AppState;
use crate::api::types::ApiError;
use crate::streams::types::{AppendOptions, CreateOptions, ProducerHeaders};
use crate::streams::{offset, sse as sse_pump};

fn canonical_path(raw: &str) -> String {
    format!("/{}", raw.trim_start_matches('/'))
}

fn generate_etag(path: &str, offset: &str) -> String {
    format!("\"{}\"", BASE64.encode(format!("{path}:{offset}")))
}

fn unknown_protocol_header(headers: &HeaderMap) -> Option<String> {
    const KNOWN: &[&str] = &[
        "stream-ttl",
        "stream-expires-at",
        "stream-seq",
        "stream-closed",
        "producer-id",
        "producer-epoch",
        "producer-seq",
        "idempotency-key",
        "if-match",
    ];
    for name in headers.keys() {
        let lower = name.as_str().to_ascii_lowercase();
        if (lower.starts_with("stream-") || lower.starts_with("producer-")) && !KNOWN.contains(&lower.as_str()) {
            return Some(name.to_string());
        }
    }
    None
}

fn parse_ttl_and_expiry(headers: &HeaderMap) -> Result<(Option<u64>, Option<chrono::DateTime<chrono::Utc>>), ApiError> {
    let ttl = match headers.get("Stream-TTL") {
        Some(v) => Some(
            v.to_str()
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| ApiError::bad_request("BAD_REQUEST", "invalid Stream-TTL header"))?,
        ),
        None => None,
    };
    let expires_at = match headers.get("Stream-Expires-At") {
        Some(v) => {
            let raw = v.to_str().map_err(|_| ApiError::bad_request("BAD_REQUEST", "invalid Stream-Expires-At header"))?;
            Some(crate::utils::time::parse_iso_timestamp(raw).map_err(|_| ApiError::bad_request("BAD_REQUEST", "invalid Stream-Expires-At header"))?)
        }
        None => None,
    };
    Ok((ttl, expires_at))
}

/// Parses `Producer-*` headers, or, absent those, treats `Idempotency-Key`
/// as an alias producer identity: `Producer-Id = <key>`, `Producer-Epoch =
/// 0`, with `Producer-Seq` derived from the stream's producer ledger rather
/// than supplied by the caller.
fn parse_producer_headers(headers: &HeaderMap, state: &AppState, path: &str) -> Result<Option<ProducerHeaders>, ApiError> {
    let id = headers.get("Producer-Id").and_then(|v| v.to_str().ok());
    let epoch = headers.get("Producer-Epoch").and_then(|v| v.to_str().ok());
    let seq = headers.get("Producer-Seq").and_then(|v| v.to_str().ok());

    match (id, epoch, seq) {
        (None, None, None) => match headers.get("Idempotency-Key").and_then(|v| v.to_str().ok()) {
            Some(key) => {
                let seq = state.streams.next_producer_seq(path, key);
                Ok(Some(ProducerHeaders { producer_id: key.to_string(), epoch: 0, seq }))
            }
            None => Ok(None),
        },
        (Some(id), Some(epoch), Some(seq)) => {
            let epoch = epoch.parse::<u64>().map_err(|_| ApiError::bad_request("BAD_REQUEST", "invalid Producer-Epoch"))?;
            let seq = seq.parse::<u64>().map_err(|_| ApiError::bad_request("BAD_REQUEST", "invalid Producer-Seq"))?;
            Ok(Some(ProducerHeaders { producer_id: id.to_string(), epoch, seq }))
        }
        _ => Err(ApiError::bad_request(
            "INVALID_REQUEST",
            "Producer-Id, Producer-Epoch, and Producer-Seq must be supplied together",
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct WriteQuery {
    pub subscription: Option<String>,
}

pub async fn create_stream(
    State(state): State<AppState>,
    Path(raw_path): Path<String>,
    Query(query): Query<WriteQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let path = canonical_path(&raw_path);
    if let Some(subscription_id) = query.subscription {
        return subscriptions::register(&state, &path, &subscription_id, &body).await;
    }

    if let Some(name) = unknown_protocol_header(&headers) {
        return Err(ApiError::bad_request("BAD_REQUEST", format!("unrecognized protocol header: {name}")));
    }

    let (ttl_seconds, expires_at) = parse_ttl_and_expiry(&headers)?;
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
    let closed = headers.get("Stream-Closed").and_then(|v| v.to_str().ok()) == Some("true");

    let opts = CreateOptions {
        content_type,
        ttl_seconds,
        expires_at,
        initial_data: if body.is_empty() { None } else { Some(body.to_vec()) },
        closed,
    };

    let (stream, created) = state.streams.create(&path, opts)?;
    state.webhooks.on_stream_event(&path).await;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    let mut response = (status, ()).into_response();
    *response.status_mut() = status;
    let h = response.headers_mut();
    h.insert(header::CONTENT_TYPE, stream.content_type.parse().unwrap());
    h.insert("Stream-Next-Offset", stream.current_offset.parse().unwrap());
    h.insert(header::ETAG, generate_etag(&path, &stream.current_offset).parse().unwrap());
    Ok(response)
}

pub async fn append_stream(
    State(state): State<AppState>,
    Path(raw_path): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    if let Some(name) = unknown_protocol_header(&headers) {
        return Err(ApiError::bad_request("BAD_REQUEST", format!("unrecognized protocol header: {name}")));
    }

    let path = canonical_path(&raw_path);
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
    let stream_seq = match headers.get("Stream-Seq") {
        Some(v) => Some(
            v.to_str()
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| ApiError::bad_request("BAD_REQUEST", "invalid Stream-Seq header"))?,
        ),
        None => None,
    };
    let producer = parse_producer_headers(&headers, &state, &path)?;
    let close = headers.get("Stream-Closed").and_then(|v| v.to_str().ok()) == Some("true");

    let opts = AppendOptions { content_type, stream_seq, producer, close };
    let result = state.streams.append(&path, body.to_vec(), opts)?;
    state.webhooks.on_stream_event(&path).await;

    let mut response = (StatusCode::NO_CONTENT, ()).into_response();
    let h = response.headers_mut();
    h.insert("Stream-Next-Offset", result.next_offset.parse().unwrap());
    h.insert(header::ETAG, generate_etag(&path, &result.next_offset).parse().unwrap());
    if result.idempotent_replay {
        h.insert("Idempotency-Replayed", "true".parse().unwrap());
    }
    if result.stream_closed {
        h.insert("Stream-Closed", "true".parse().unwrap());
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub offset: Option<String>,
    pub live: Option<String>,
    #[allow(dead_code)] // accepted for wire compatibility; reconnection is offset-driven
    pub cursor: Option<String>,
    pub subscription: Option<String>,
    pub subscriptions: Option<String>,
}

pub async fn read_stream(
    State(state): State<AppState>,
    Path(raw_path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Response, ApiError> {
    if query.subscriptions.is_some() {
        return Ok(subscriptions::list(&state));
    }
    if let Some(subscription_id) = &query.subscription {
        return subscriptions::get(&state, subscription_id);
    }

    let path = canonical_path(&raw_path);
    let requested_offset = query.offset.unwrap_or_else(|| offset::BEFORE_BEGINNING.to_string());

    match query.live.as_deref() {
        Some("sse") => {
            // Existence check up front so a bad path gets a clean 404
            // instead of an SSE stream that immediately errors.
            state.streams.get(&path).ok_or_else(|| ApiError::not_found(format!("stream not found: {path}")))?;
            let stream = sse_pump::sse_stream(state.streams.clone(), path, requested_offset);
            Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
        }
        Some("long-poll") => {
            let result = state
                .streams
                .wait_for_messages(&path, &requested_offset, state.config.streams.long_poll_timeout_ms)
                .await?;
            if result.messages.is_empty() {
                let mut response = (StatusCode::NO_CONTENT, ()).into_response();
                let h = response.headers_mut();
                h.insert("Stream-Next-Offset", result.next_offset.parse().unwrap());
                if result.stream_closed {
                    h.insert("Stream-Closed", "true".parse().unwrap());
                }
                return Ok(response);
            }
            Ok(render_read_body(&state, &path, result.messages, &result.next_offset, result.stream_closed))
        }
        _ => {
            let result = state.streams.read(&path, &requested_offset)?;
            if result.messages.is_empty() {
                let mut response = (StatusCode::NO_CONTENT, ()).into_response();
                let h = response.headers_mut();
                h.insert("Stream-Next-Offset", result.next_offset.parse().unwrap());
                h.insert("Stream-Up-To-Date", "true".parse().unwrap());
                if result.stream_closed {
                    h.insert("Stream-Closed", "true".parse().unwrap());
                }
                return Ok(response);
            }
            Ok(render_read_body(&state, &path, result.messages, &result.next_offset, result.stream_closed))
        }
    }
}

fn render_read_body(
    state: &AppState,
    path: &str,
    messages: Vec<crate::streams::types::StreamMessage>,
    next_offset: &str,
    stream_closed: bool,
) -> Response {
    let content_type = state.streams.get(path).map(|s| s.content_type).unwrap_or_default();
    let body = state.streams.format_response(path, &messages);

    let mut response = (StatusCode::OK, body).into_response();
    let h = response.headers_mut();
    h.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
    h.insert("Stream-Next-Offset", next_offset.parse().unwrap());
    h.insert("Stream-Up-To-Date", "true".parse().unwrap());
    if stream_closed {
        h.insert("Stream-Closed", "true".parse().unwrap());
    }
    response
}

pub async fn head_stream(State(state): State<AppState>, Path(raw_path): Path<String>) -> Result<Response, ApiError> {
    let path = canonical_path(&raw_path);
    let stream = state.streams.get(&path).ok_or_else(|| ApiError::not_found(format!("stream not found: {path}")))?;

    let mut response = (StatusCode::OK, ()).into_response();
    let h = response.headers_mut();
    h.insert(header::CONTENT_TYPE, stream.content_type.parse().unwrap());
    h.insert("Stream-Next-Offset", stream.current_offset.parse().unwrap());
    if let Some(ttl) = stream.ttl_seconds {
        h.insert("Stream-TTL", ttl.to_string().parse().unwrap());
    }
    if let Some(expires_at) = stream.expires_at {
        h.insert("Stream-Expires-At", expires_at.to_rfc3339().parse().unwrap());
    }
    h.insert(header::ETAG, generate_etag(&path, &stream.current_offset).parse().unwrap());
    Ok(response)
}

pub async fn delete_stream(State(state): State<AppState>, Path(raw_path): Path<String>, Query(query): Query<WriteQuery>) -> Response {
    if let Some(subscription_id) = query.subscription {
        return subscriptions::delete(&state, &subscription_id);
    }
    let path = canonical_path(&raw_path);
    state.streams.delete(&path);
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_path_always_leading_slash() {
        assert_eq!(canonical_path("a/b"), "/a/b");
        assert_eq!(canonical_path("/a/b"), "/a/b");
    }

    #[test]
    fn etag_is_stable_for_same_inputs() {
        assert_eq!(generate_etag("/s", "0"), generate_etag("/s", "0"));
        assert_ne!(generate_etag("/s", "0"), generate_etag("/s", "1"));
    }

    #[test]
    fn unknown_protocol_header_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("Stream-Bogus", "x".parse().unwrap());
        assert!(unknown_protocol_header(&headers).is_some());
    }

    #[test]
    fn known_protocol_headers_are_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert("Stream-TTL", "60".parse().unwrap());
        headers.insert("Producer-Id", "p1".parse().unwrap());
        assert!(unknown_protocol_header(&headers).is_none());
    }
}
