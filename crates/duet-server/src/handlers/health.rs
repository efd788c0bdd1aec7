use axum::Json;
use axum::extract::State;
use duet_core::HealthStatus;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(duet_core::health::check(&state.commands).await)
}
