use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::SERVICE_NAME;
use crate::protocol::{now_ms, RobotProjection};
use crate::registry::RelayState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRobot {
    robot_id: String,
    online: bool,
    last_seen: i64,
    mode: String,
    has_control: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    status: &'static str,
    service: &'static str,
    robots: Vec<StatusRobot>,
    ui_clients: usize,
    timestamp: i64,
}

/// GET / - service status summary.
pub async fn root_status(State(state): State<RelayState>) -> Json<StatusResponse> {
    let robots = state
        .list_robots()
        .await
        .into_iter()
        .map(|p| StatusRobot {
            robot_id: p.robot_id,
            online: p.online,
            last_seen: p.last_seen,
            mode: p.mode,
            has_control: p.control.owner_client_id.is_some(),
        })
        .collect();
    Json(StatusResponse {
        status: "ok",
        service: SERVICE_NAME,
        robots,
        ui_clients: state.client_count().await,
        timestamp: now_ms(),
    })
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

/// GET /health - liveness probe.
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "healthy" })
}

#[derive(Debug, Serialize)]
pub struct RobotsResponse {
    robots: Vec<RobotProjection>,
    timestamp: i64,
}

/// GET /robots - full projections of every registered robot.
pub async fn list_robots(State(state): State<RelayState>) -> Json<RobotsResponse> {
    Json(RobotsResponse {
        robots: state.list_robots().await,
        timestamp: now_ms(),
    })
}

/// GET /robots/:robot_id - one robot's projection, or 404.
pub async fn get_robot(
    State(state): State<RelayState>,
    Path(robot_id): Path<String>,
) -> Result<Json<RobotProjection>, (StatusCode, Json<Value>)> {
    match state.get_robot_projection(&robot_id).await {
        Some(projection) => Ok(Json(projection)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Robot not found"})),
        )),
    }
}
