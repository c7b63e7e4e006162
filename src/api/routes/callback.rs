//! Webhook callback endpoint (component I): the handler a consumer's
//! HTTP worker calls back into after a wake. Verifies the bearer token,
//! claims the wake, and processes acks/subscribe/unsubscribe/done.
//!
//! Response shape is callback-specific (`{ok, token?, streams?}` on
//! success, `{ok:false, error:{code,message}, token?}` on failure) rather
//! than the RFC 9457 problem document the rest of the API uses, so errors
//! are rendered through [`CallbackError`] instead of [`ApiError`] directly.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use serde::{Deserialize, Serialize};

use crate::api::server::AppState;
use crate::api::types::ApiError;
use crate::subscriptions::SubscriptionError;
use crate::subscriptions::token::{self, TokenError};

#[derive(Debug, Deserialize, Default)]
pub struct CallbackBody {
    pub epoch: Option<u64>,
    #[serde(default)]
    pub wake_id: Option<String>,
    #[serde(default)]
    pub acks: Vec<AckEntry>,
    #[serde(default)]
    pub subscribe: Vec<String>,
    #[serde(default)]
    pub unsubscribe: Vec<String>,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Deserialize)]
pub struct AckEntry {
    pub path: String,
    pub offset: String,
}

#[derive(Debug, Serialize)]
pub struct StreamCursor {
    pub path: String,
    pub offset: String,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub ok: bool,
    pub token: String,
    pub streams: Vec<StreamCursor>,
}

#[derive(Debug, Serialize)]
struct CallbackErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct CallbackErrorBody {
    ok: bool,
    error: CallbackErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

/// Callback-specific error wrapper: same status/code/detail as [`ApiError`],
/// rendered in the `{ok:false, error:{code,message}, token?}` shape §6
/// mandates for this endpoint, with room for a refreshed token on
/// `STALE_EPOCH`.
pub struct CallbackError {
    inner: ApiError,
    token: Option<String>,
}

impl CallbackError {
    fn new(inner: ApiError) -> Self {
        Self { inner, token: None }
    }

    fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

impl From<ApiError> for CallbackError {
    fn from(e: ApiError) -> Self {
        Self::new(e)
    }
}

impl From<SubscriptionError> for CallbackError {
    fn from(e: SubscriptionError) -> Self {
        Self::new(ApiError::from(e))
    }
}

impl From<TokenError> for CallbackError {
    fn from(e: TokenError) -> Self {
        Self::new(ApiError::from(e))
    }
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let body =
            CallbackErrorBody { ok: false, error: CallbackErrorDetail { code: self.inner.code.to_string(), message: self.inner.detail }, token: self.token };
        (self.inner.status, Json(body)).into_response()
    }
}

/// Mint a fresh token at the consumer's current epoch, for a `STALE_EPOCH`
/// response body (§4.7: "response includes a refreshed token").
fn refresh_token(state: &AppState, consumer_id: &str) -> Option<String> {
    let consumer = state.subscriptions.get_consumer(consumer_id)?;
    let now = chrono::Utc::now().timestamp();
    Some(token::mint(&state.config.webhooks.signing_secret, consumer_id, consumer.epoch, state.config.webhooks.callback_token_ttl_secs, now))
}

pub async fn handle_callback(
    State(state): State<AppState>,
    Path(consumer_id): Path<String>,
    TypedHeader(Authorization(bearer)): TypedHeader<Authorization<Bearer>>,
    Json(body): Json<CallbackBody>,
) -> Result<Response, CallbackError> {
    let claims = token::verify(&state.config.webhooks.signing_secret, bearer.token())?;
    if claims.sub != consumer_id {
        return Err(CallbackError::new(ApiError::new(StatusCode::UNAUTHORIZED, "TOKEN_INVALID", "token does not match this consumer")));
    }

    let epoch = body.epoch.ok_or_else(|| CallbackError::new(ApiError::bad_request("INVALID_REQUEST", "missing epoch")))?;

    if let Err(e) = state.subscriptions.claim_wake(&consumer_id, epoch) {
        let stale = matches!(e, SubscriptionError::StaleEpoch { .. });
        let err = CallbackError::from(e);
        return Err(if stale { err.with_token(refresh_token(&state, &consumer_id)) } else { err });
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    state.subscriptions.transition_to_live(&consumer_id, now_ms);

    if !body.acks.is_empty() {
        let acks: Vec<(String, String)> = body.acks.into_iter().map(|a| (a.path, a.offset)).collect();
        state.subscriptions.ack(&consumer_id, &acks)?;
    }
    for path in &body.subscribe {
        state.subscriptions.subscribe_stream(&consumer_id, path)?;
    }
    for path in &body.unsubscribe {
        let gone = state.subscriptions.unsubscribe_stream(&consumer_id, path)?;
        if gone {
            return Err(CallbackError::new(ApiError::new(StatusCode::GONE, "CONSUMER_GONE", "consumer has no remaining subscribed streams")));
        }
    }

    if body.done {
        state.webhooks.recheck(&consumer_id).await;
    }

    let now = chrono::Utc::now().timestamp();
    let token_out = if token::needs_rotation(&claims, state.config.webhooks.callback_token_ttl_secs, now) {
        token::mint(&state.config.webhooks.signing_secret, &consumer_id, epoch, state.config.webhooks.callback_token_ttl_secs, now)
    } else {
        bearer.token().to_string()
    };

    let streams = state
        .subscriptions
        .get_consumer(&consumer_id)
        .map(|c| c.streams.into_iter().map(|(path, offset)| StreamCursor { path, offset }).collect())
        .unwrap_or_default();

    Ok(Json(CallbackResponse { ok: true, token: token_out, streams }).into_response())
}
