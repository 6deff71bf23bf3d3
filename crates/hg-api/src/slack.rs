//! Slack-facing routes

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use hg_common::InboundRequest;
use hg_dispatch::{AckResponse, RedirectContext};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{ApiResult, HttpError};
use crate::AppState;

/// Webhook ingress shared by events, slash commands and interactions
pub async fn ingress_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = InboundRequest::new(
        body,
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v.to_string()))),
        Utc::now(),
    );

    let span = info_span!("ingress", delivery_id = %Uuid::new_v4());
    let ack = state.coordinator.dispatch(&request).instrument(span).await;
    ack_response(ack)
}

fn ack_response(ack: AckResponse) -> Response {
    let status =
        StatusCode::from_u16(ack.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    match &ack {
        AckResponse::Accepted => status.into_response(),
        AckResponse::TooManyRequests { retry_after_secs } => (
            status,
            [(header::RETRY_AFTER, retry_after_secs.to_string())],
            Json(ack.body()),
        )
            .into_response(),
        _ => (status, Json(ack.body())).into_response(),
    }
}

/// Start the install flow: redirect to the provider's authorize page
pub async fn install_handler(State(state): State<AppState>) -> ApiResult<Response> {
    let exchange = state.exchange.as_ref().ok_or(HttpError::NotConfigured)?;
    let oauth_state = exchange.issue_state().await?;
    let location = exchange.authorize_url(&oauth_state);

    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by the provider when the user denied the install
    pub error: Option<String>,
}

/// Finish the install flow
pub async fn oauth_callback_handler(
    State(state): State<AppState>,
    Query(query): Query<OAuthCallbackQuery>,
) -> ApiResult<Response> {
    let exchange = state.exchange.as_ref().ok_or(HttpError::NotConfigured)?;

    if let Some(error) = query.error {
        warn!(error = %error, "Install denied at provider");
        return Err(HttpError::BadRequest(format!("authorization denied: {}", error)));
    }
    let oauth_state = query
        .state
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HttpError::BadRequest("missing state parameter".to_string()))?;

    let context = RedirectContext {
        state: oauth_state,
        redirect_uri: None,
    };
    let installation = exchange
        .exchange(query.code.as_deref().unwrap_or_default(), &context)
        .await?;

    info!(tenant_id = %installation.tenant_id, "Install completed");
    Ok(Json(json!({
        "status": "installed",
        "tenant_id": installation.tenant_id,
        "team_name": installation.team_name,
    }))
    .into_response())
}
