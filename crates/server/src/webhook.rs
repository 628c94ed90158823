//! Generic inbound webhook. Channel adapters post normalized events here and
//! read the reply out of the HTTP response: `send_status` is `"TRUE"` only
//! when this event won delivery arbitration, so duplicated or superseded
//! deliveries never surface a second answer to the client.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use bookline_core::domain::message::InboundEvent;
use bookline_engine::TurnOutcome;

use crate::bootstrap::InboundDriver;

#[derive(Clone)]
pub struct WebhookState {
    driver: Arc<InboundDriver>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InboundPayload {
    pub project_id: String,
    pub client_id: String,
    pub text: String,
    #[serde(default)]
    pub retry: bool,
    #[serde(default = "default_delivery_count")]
    pub delivery_count: u32,
}

fn default_delivery_count() -> u32 {
    1
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookResponse {
    pub send_status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

impl WebhookResponse {
    fn send(reply: String) -> Self {
        Self { send_status: "TRUE", reply: Some(reply) }
    }

    fn silent() -> Self {
        Self { send_status: "FALSE", reply: None }
    }
}

pub fn router(driver: Arc<InboundDriver>) -> Router {
    Router::new().route("/hooks/inbound", post(inbound)).with_state(WebhookState { driver })
}

pub async fn inbound(
    State(state): State<WebhookState>,
    Json(payload): Json<InboundPayload>,
) -> (StatusCode, Json<WebhookResponse>) {
    let event = InboundEvent {
        project_id: payload.project_id,
        client_id: payload.client_id,
        text: payload.text,
        retry: payload.retry,
        delivery_count: payload.delivery_count,
    };

    match state.driver.run_turn(event).await {
        Ok(TurnOutcome::Delivered { reply, .. }) => {
            (StatusCode::OK, Json(WebhookResponse::send(reply)))
        }
        Ok(TurnOutcome::Skipped) | Ok(TurnOutcome::Discarded { .. }) => {
            (StatusCode::OK, Json(WebhookResponse::silent()))
        }
        Ok(TurnOutcome::Failed { item_id, error }) => {
            warn!(
                event_name = "webhook.turn_failed",
                item_id = %item_id,
                error = %error,
                "turn processing failed, suppressing reply"
            );
            (StatusCode::OK, Json(WebhookResponse::silent()))
        }
        Err(error) => {
            error!(
                event_name = "webhook.store_error",
                error = %error,
                "inbound event could not be coordinated"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, Json(WebhookResponse::silent()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};

    use bookline_db::{connect_with_settings, migrations};
    use bookline_engine::processor::{EchoTurnProcessor, NoopDelivery};
    use bookline_engine::{MessageCoordinator, TurnDriver};

    use super::{inbound, InboundPayload, WebhookState};

    async fn state() -> WebhookState {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        let driver =
            TurnDriver::new(MessageCoordinator::new(pool), EchoTurnProcessor, NoopDelivery);
        WebhookState { driver: Arc::new(driver) }
    }

    fn payload(text: &str, retry: bool, delivery_count: u32) -> InboundPayload {
        InboundPayload {
            project_id: "salon".to_string(),
            client_id: "c-1".to_string(),
            text: text.to_string(),
            retry,
            delivery_count,
        }
    }

    #[tokio::test]
    async fn fresh_event_answers_with_the_computed_reply() {
        let state = state().await;

        let (status, Json(body)) =
            inbound(State(state), Json(payload("Hi", false, 1))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.send_status, "TRUE");
        assert_eq!(body.reply.as_deref(), Some("received: Hi"));
    }

    #[tokio::test]
    async fn duplicated_retries_are_both_suppressed() {
        let state = state().await;

        for _ in 0..2 {
            let (status, Json(body)) =
                inbound(State(state.clone()), Json(payload("Hi", true, 0))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body.send_status, "FALSE");
            assert_eq!(body.reply, None);
        }
    }

    #[tokio::test]
    async fn store_failure_maps_to_a_server_error() {
        // A closed pool stands in for an unreachable store.
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 5)
            .await
            .expect("connect");
        pool.close().await;
        let driver =
            TurnDriver::new(MessageCoordinator::new(pool), EchoTurnProcessor, NoopDelivery);
        let state = WebhookState { driver: Arc::new(driver) };

        let (status, Json(body)) =
            inbound(State(state), Json(payload("Hi", false, 1))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.send_status, "FALSE");
    }
}
