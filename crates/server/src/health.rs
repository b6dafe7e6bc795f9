use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use leadflow_core::resilience::{BreakerRegistry, BreakerSnapshot};
use leadflow_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub breakers: Arc<BreakerRegistry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BreakerReport {
    pub dependency: &'static str,
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub times_opened: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub database: HealthCheck,
    pub circuit_breakers: Vec<BreakerReport>,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

/// Ready as long as the database answers. Open breakers are reported but do
/// not fail the probe: they recover on their own after the cooldown.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: "leadflow-server",
        database,
        circuit_breakers: state.breakers.snapshot().iter().map(report).collect(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

fn report(snapshot: &BreakerSnapshot) -> BreakerReport {
    BreakerReport {
        dependency: snapshot.dependency.as_str(),
        state: snapshot.state.as_str(),
        consecutive_failures: snapshot.metrics.consecutive_failures,
        times_opened: snapshot.metrics.times_opened,
    }
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match leadflow_db::ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
