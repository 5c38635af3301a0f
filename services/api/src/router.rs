//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, the Telnyx webhook and media-stream endpoints,
//! and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        CallPlaced, ErrorResponse, Health, ScenarioSummary, TelnyxWebhook, WebhookAck,
        WebhookData, WebhookPayload,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_scenarios,
        handlers::trigger_call,
        handlers::webhook,
    ),
    components(
        schemas(CallPlaced, ScenarioSummary, Health, WebhookAck, ErrorResponse, TelnyxWebhook, WebhookData, WebhookPayload)
    ),
    tags(
        (name = "Patient Simulator API", description = "Outbound test calls voiced by a simulated patient")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/", get(handlers::health))
        .route("/scenarios", get(handlers::list_scenarios))
        .route("/calls/{index}", post(handlers::trigger_call))
        .route("/webhook", post(handlers::webhook))
        .route("/media-stream", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{app_state, scenario};
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use patient_sim_core::ModelConnector;
    use patient_sim_core::channel::ChannelHandle;
    use patient_sim_core::generic_types::ModelCommand;
    use serde_json::{Value, json};
    use std::path::Path;
    use tower::ServiceExt;

    struct NoModel;

    #[async_trait]
    impl ModelConnector for NoModel {
        async fn connect(&self) -> anyhow::Result<ChannelHandle<ModelCommand>> {
            anyhow::bail!("no model in router tests")
        }
    }

    async fn test_state() -> Arc<AppState> {
        app_state(Arc::new(NoModel), Path::new("./transcripts")).await
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_counts_scenarios_and_calls() {
        let state = test_state().await;
        state
            .registry
            .expect_call("v3:pending", scenario("reschedule", "Reschedule Appointment"));
        let (status, body) = send(create_router(state), get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "scenarios": 2, "active_calls": 1}));
    }

    #[tokio::test]
    async fn test_list_scenarios_in_index_order() {
        let (status, body) = send(create_router(test_state().await), get("/scenarios")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([
                {"index": 0, "id": "reschedule", "name": "Reschedule Appointment"},
                {"index": 1, "id": "refill", "name": "Prescription Refill"},
            ])
        );
    }

    #[tokio::test]
    async fn test_trigger_call_rejects_bad_index() {
        let (status, body) =
            send(create_router(test_state().await), post_json("/calls/7", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid index. Use 0-1");
    }

    #[tokio::test]
    async fn test_trigger_call_reports_telnyx_failure() {
        let state = test_state().await;
        let (status, body) =
            send(create_router(state.clone()), post_json("/calls/0", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["message"].as_str().unwrap().starts_with("Telnyx API error"));
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_hangup_webhook_drops_pending_call() {
        let state = test_state().await;
        state
            .registry
            .expect_call("v3:pending", scenario("refill", "Prescription Refill"));
        let hook = json!({
            "data": {
                "event_type": "call.hangup",
                "payload": {"call_control_id": "v3:pending", "hangup_cause": "normal_clearing"}
            }
        });
        let (status, body) = send(create_router(state.clone()), post_json("/webhook", hook)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
        assert!(!state.registry.contains("v3:pending"));
    }

    #[tokio::test]
    async fn test_webhook_always_acknowledges() {
        let state = test_state().await;
        let answered_unknown = json!({
            "data": {"event_type": "call.answered", "payload": {"call_control_id": "v3:nobody"}}
        });
        let (status, _) =
            send(create_router(state.clone()), post_json("/webhook", answered_unknown)).await;
        assert_eq!(status, StatusCode::OK);

        let garbage = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::from("not json"))
            .unwrap();
        let (status, body) = send(create_router(state), garbage).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_openapi_document_is_served() {
        let (status, body) =
            send(create_router(test_state().await), get("/api-docs/openapi.json")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"].get("/calls/{index}").is_some());
        assert!(body["paths"].get("/webhook").is_some());
    }
}
