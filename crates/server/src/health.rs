use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use bookline_db::DbPool;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "bookline-server runtime initialized".to_string(),
        },
        database,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, http::StatusCode, Json};

    use bookline_db::connect_with_settings;

    use crate::health::{health, HealthState};

    #[tokio::test]
    async fn health_returns_ready_when_database_is_reachable() {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 5)
            .await
            .expect("pool should connect");

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool.clone() })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.service.status, "ready");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 5)
            .await
            .expect("pool should connect");
        pool.close().await;

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }
}
