//! Subscription registry logic (component G): register, inspect, list, and
//! delete webhook subscriptions against a glob pattern.
//!
//! Subscriptions share the stream path namespace rather than a dedicated
//! URL prefix — `PUT /**?subscription=S1` registers against pattern `/**`
//! the same way `PUT /**` would create a stream at that path — so these
//! are plain functions dispatched from `api::routes::streams`'s PUT/GET/
//! DELETE handlers based on the presence of a `subscription`/
//! `subscriptions` query parameter, not axum handlers in their own right.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::api::server::AppState;
use crate::api::types::ApiError;
use crate::utils::crypto;

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub webhook: String,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub subscription_id: String,
    pub pattern: String,
    pub webhook: String,
    pub webhook_secret: String,
    pub description: Option<String>,
}

impl From<crate::subscriptions::Subscription> for SubscriptionView {
    fn from(s: crate::subscriptions::Subscription) -> Self {
        Self { subscription_id: s.subscription_id, pattern: s.pattern, webhook: s.webhook_url, webhook_secret: s.webhook_secret, description: s.description }
    }
}

pub async fn register(state: &AppState, pattern: &str, subscription_id: &str, body: &[u8]) -> Result<Response, ApiError> {
    let body: RegisterBody =
        serde_json::from_slice(body).map_err(|_| ApiError::bad_request("INVALID_REQUEST", "invalid subscription registration body"))?;

    let (sub, created) = state
        .subscriptions
        .register(subscription_id, pattern, &body.webhook, body.description, || crypto::encode_hex(&crypto::generate_signing_key()))?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(SubscriptionView::from(sub))).into_response())
}

pub fn get(state: &AppState, subscription_id: &str) -> Result<Response, ApiError> {
    let sub = state.subscriptions.get(subscription_id).ok_or_else(|| ApiError::not_found("subscription not found"))?;
    Ok(Json(SubscriptionView::from(sub)).into_response())
}

pub fn list(state: &AppState) -> Response {
    let items: Vec<SubscriptionView> = state.subscriptions.list().into_iter().map(SubscriptionView::from).collect();
    Json(items).into_response()
}

pub fn delete(state: &AppState, subscription_id: &str) -> Response {
    state.subscriptions.delete(subscription_id);
    StatusCode::NO_CONTENT.into_response()
}
