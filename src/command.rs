use std::time::Instant;

use axum::extract::ws::Message;
use serde_json::Value;
use tracing::debug;

use crate::config::{MAX_ANGULAR_VELOCITY, MAX_LINEAR_VELOCITY, VALID_MODES};
use crate::protocol::{CommandRequest, ErrorCode, ErrorFrame, Poi, RobotBoundFrame, RobotCommand};
use crate::registry::RelayState;

/// Command kinds that move the robot; these require the control lease.
pub const MOTION_KINDS: [&str; 4] = ["teleop", "goto_poi", "dock", "navigate"];

pub fn is_motion_kind(kind: &str) -> bool {
    MOTION_KINDS.contains(&kind)
}

/// Duck-typed numeric coercion: numbers pass through, numeric strings
/// parse, anything else (including non-finite values) is 0.
fn coerce_number(value: Option<&Value>) -> f64 {
    let coerced = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(Value::Bool(b)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    };
    if coerced.is_finite() {
        coerced
    } else {
        0.0
    }
}

/// Inclusive clamp to ±limit.
fn clamp_velocity(value: f64, limit: f64) -> f64 {
    coerce_finite(value).clamp(-limit, limit)
}

fn coerce_finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn string_param(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Validate and translate one operator command into the robot-bound
/// body. Errors map straight onto the operator-visible codes.
pub fn translate_command(request: &CommandRequest, pois: &[Poi]) -> Result<RobotCommand, ErrorFrame> {
    let kind = request.kind.as_deref().unwrap_or("");
    match kind {
        "teleop" => Ok(RobotCommand::Teleop {
            linear_x: clamp_velocity(coerce_number(request.linear_x.as_ref()), MAX_LINEAR_VELOCITY),
            angular_z: clamp_velocity(
                coerce_number(request.angular_z.as_ref()),
                MAX_ANGULAR_VELOCITY,
            ),
        }),
        "stop" => Ok(RobotCommand::Stop),
        "set_mode" => {
            let mode = request.mode.as_ref().and_then(Value::as_str).unwrap_or("");
            if VALID_MODES.contains(&mode) {
                Ok(RobotCommand::SetMode {
                    mode: mode.to_string(),
                })
            } else {
                Err(ErrorFrame::new(
                    ErrorCode::InvalidMode,
                    format!("Invalid mode '{mode}'"),
                ))
            }
        }
        "load_map" => match string_param(request.map_name.as_ref()) {
            Some(map_name) => Ok(RobotCommand::LoadMap { map_name }),
            None => Err(missing_param("mapName")),
        },
        "save_map" => match string_param(request.map_name.as_ref()) {
            Some(map_name) => Ok(RobotCommand::StopSlam { map_name }),
            None => Err(missing_param("mapName")),
        },
        "goto_poi" => {
            let Some(poi_id) = string_param(request.poi_id.as_ref()) else {
                return Err(missing_param("poiId"));
            };
            // A robot with no POI catalogue gets the command unchecked.
            if !pois.is_empty() && !pois.iter().any(|p| p.matches(&poi_id)) {
                let mut err = ErrorFrame::new(
                    ErrorCode::UnknownPoi,
                    format!("Unknown POI '{poi_id}'"),
                );
                err.available_pois = Some(pois.to_vec());
                return Err(err);
            }
            Ok(RobotCommand::GoToPoi { poi_id })
        }
        "cancel_nav" => Ok(RobotCommand::CancelNav),
        "start_slam" => Ok(RobotCommand::StartSlam),
        "restart" => Ok(RobotCommand::Restart),
        other => Err(ErrorFrame::new(
            ErrorCode::UnknownCommand,
            format!("Unknown command kind '{other}'"),
        )),
    }
}

fn missing_param(name: &str) -> ErrorFrame {
    ErrorFrame::new(
        ErrorCode::MissingParam,
        format!("Missing required parameter '{name}'"),
    )
}

impl RelayState {
    /// Run one operator command through the pipeline: existence, lease
    /// authorisation for motion kinds, then validation and forwarding.
    /// Returns the error frame for the requester, if any; a command to a
    /// robot whose socket is no longer open is dropped without error.
    pub async fn handle_command(
        &self,
        client_id: &str,
        robot_id: &str,
        request: CommandRequest,
    ) -> Option<ErrorFrame> {
        let forward = {
            let mut inner = self.write().await;
            let Some(record) = inner.robots.get_mut(robot_id) else {
                return Some(ErrorFrame::robot_offline(robot_id));
            };

            let kind = request.kind.clone().unwrap_or_default();
            if is_motion_kind(&kind) {
                if !record.lease.is_owned_by(client_id) {
                    return Some(ErrorFrame::new(
                        ErrorCode::NoControl,
                        format!("You do not control robot '{robot_id}'"),
                    ));
                }
                record.lease.last_command = Some(Instant::now());
            }

            let pois = record.pois();
            match translate_command(&request, &pois) {
                Ok(command) => (record.tx.clone(), command),
                Err(err) => return Some(err),
            }
        };

        let (tx, command) = forward;
        let frame = RobotBoundFrame::Command { command };
        match serde_json::to_string(&frame) {
            Ok(text) => {
                if tx.try_send(Message::Text(text)).is_err() {
                    debug!(robot = %robot_id, "robot socket not open, dropping command");
                }
            }
            Err(err) => debug!(robot = %robot_id, error = %err, "failed to serialise command"),
        }
        None
    }
}
