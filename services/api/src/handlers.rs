//! Axum Handlers for the REST API
//!
//! Call placement, scenario listing, health, and the Telnyx call-control
//! webhook. It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::{
    models::{
        CallPlaced, ErrorResponse, Health, ScenarioSummary, TelnyxWebhook, WebhookAck,
        WebhookEvent,
    },
    state::AppState,
    telnyx::CreateCall,
};
use patient_sim_core::HangupOutcome;

/// Errors a REST handler reports to the client.
pub enum ApiError {
    BadRequest(String),
    BadGateway(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::BadGateway(message) => (StatusCode::BAD_GATEWAY, message),
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

/// Service health and a count of calls in flight.
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service is up", body = Health)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        scenarios: state.catalog.len(),
        active_calls: state.registry.len(),
    })
}

/// List the patient scenarios calls can be placed with.
#[utoipa::path(
    get,
    path = "/scenarios",
    responses(
        (status = 200, description = "Scenario catalog in index order", body = [ScenarioSummary])
    )
)]
pub async fn list_scenarios(State(state): State<Arc<AppState>>) -> Json<Vec<ScenarioSummary>> {
    let scenarios = state
        .catalog
        .iter()
        .enumerate()
        .map(|(index, scenario)| ScenarioSummary {
            index,
            id: scenario.id.clone(),
            name: scenario.name.clone(),
        })
        .collect();
    Json(scenarios)
}

/// Place an outbound call to the agent under test, played by scenario `index`.
#[utoipa::path(
    post,
    path = "/calls/{index}",
    responses(
        (status = 200, description = "Call placed", body = CallPlaced),
        (status = 400, description = "No scenario at this index", body = ErrorResponse),
        (status = 502, description = "Telnyx rejected the call", body = ErrorResponse)
    ),
    params(
        ("index" = usize, Path, description = "Scenario index, as listed by /scenarios")
    )
)]
pub async fn trigger_call(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<CallPlaced>, ApiError> {
    let scenario = state.catalog.get(index).cloned().ok_or_else(|| {
        ApiError::BadRequest(format!(
            "Invalid index. Use 0-{}",
            state.catalog.len().saturating_sub(1)
        ))
    })?;
    info!(scenario = %scenario.id, "Placing call");

    let config = &state.config;
    let webhook_url = config.webhook_url();
    let call = CreateCall {
        to: &config.target_number,
        from: &config.telnyx_from_number,
        connection_id: &config.telnyx_connection_id,
        webhook_url: &webhook_url,
    };
    let placed = state.telnyx.create_call(&call).await.map_err(|e| {
        error!(scenario = %scenario.id, error = %e, "Telnyx call failed");
        ApiError::BadGateway(format!("Telnyx API error: {e}"))
    })?;

    info!(call_id = %placed.call_control_id, scenario = %scenario.id, "Call placed");
    let name = scenario.name.clone();
    state
        .registry
        .expect_call(placed.call_control_id.clone(), scenario);
    let placed_at = state
        .registry
        .placed_at(&placed.call_control_id)
        .unwrap_or_else(Utc::now);

    Ok(Json(CallPlaced {
        status: "calling".to_string(),
        call_control_id: placed.call_control_id,
        scenario: name,
        placed_at,
    }))
}

/// Telnyx call-control webhook. Always acknowledged.
#[utoipa::path(
    post,
    path = "/webhook",
    request_body = TelnyxWebhook,
    responses(
        (status = 200, description = "Event acknowledged", body = WebhookAck)
    )
)]
pub async fn webhook(State(state): State<Arc<AppState>>, body: Bytes) -> Json<WebhookAck> {
    let hook: TelnyxWebhook = match serde_json::from_slice(&body) {
        Ok(hook) => hook,
        Err(e) => {
            warn!(error = %e, "Unparseable webhook body");
            return Json(WebhookAck::ok());
        }
    };
    let event_type = hook.data.event_type.as_str();
    let payload = &hook.data.payload;
    let call_id = payload.call_control_id.as_str();
    debug!(%event_type, %call_id, "Webhook received");

    match WebhookEvent::from(event_type) {
        WebhookEvent::CallInitiated => {
            info!(%call_id, to = ?payload.to, "Call initiated");
        }
        WebhookEvent::CallAnswered => on_answered(&state, call_id).await,
        WebhookEvent::CallHangup => match state.registry.hangup(call_id).await {
            HangupOutcome::Unknown => debug!(%call_id, "Hangup for untracked call"),
            HangupOutcome::Pending => {
                info!(%call_id, cause = ?payload.hangup_cause, "Call ended before streaming")
            }
            HangupOutcome::Bridged => {
                info!(%call_id, cause = ?payload.hangup_cause, "Call ended; stopping bridge")
            }
        },
        WebhookEvent::StreamingStarted => info!(%call_id, "Media streaming started"),
        WebhookEvent::StreamingStopped => info!(%call_id, "Media streaming stopped"),
        WebhookEvent::Other => debug!(%event_type, "Ignoring webhook event"),
    }

    Json(WebhookAck::ok())
}

/// Starts media streaming for an answered call and arms its max-duration timer.
async fn on_answered(state: &Arc<AppState>, call_id: &str) {
    if !state.registry.contains(call_id) {
        warn!(%call_id, "No state for answered call, skipping");
        return;
    }

    let stream_url = state.config.stream_url();
    info!(%call_id, %stream_url, "Call answered; starting media stream");
    if let Err(e) = state.telnyx.stream_start(call_id, &stream_url).await {
        error!(%call_id, error = %e, "Failed to start media streaming");
        return;
    }

    let max_duration = state.config.max_call_duration;
    let telnyx = state.telnyx.clone();
    let timer_call_id = call_id.to_string();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(max_duration).await;
        info!(call_id = %timer_call_id, ?max_duration, "Max call duration reached; hanging up");
        if let Err(e) = telnyx.hangup(&timer_call_id).await {
            warn!(call_id = %timer_call_id, error = %e, "Hangup failed");
        }
    });
    if !state.registry.set_timer(call_id, timer.abort_handle()) {
        debug!(%call_id, "Call ended before its timer was armed");
    }
}
