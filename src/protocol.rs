use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Frames consumed on the `/robot` endpoint. Unrecognised types fall into
/// the `Unknown` arm and are logged and ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RobotFrame {
    Hello(RobotHello),
    /// Synonym for `hello`, kept for older agent builds.
    Register(RobotHello),
    Telemetry(TelemetryFrame),
    CommandResult(CommandResultFrame),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotHello {
    #[serde(default, alias = "robot_id")]
    pub robot_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    #[serde(default, alias = "robot_id")]
    pub robot_id: Option<String>,
    /// Preferred form: the whole snapshot under `payload`.
    #[serde(default)]
    pub payload: Option<Telemetry>,
    // Flat fallback fields, used by agents that predate the payload shape.
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub pose: Option<Value>,
    #[serde(default)]
    pub battery: Option<Value>,
    #[serde(default)]
    pub nav: Option<Value>,
    #[serde(default)]
    pub maps: Option<Value>,
    #[serde(default)]
    pub pois: Option<Vec<Poi>>,
}

impl TelemetryFrame {
    /// The payload object wins; otherwise a snapshot is synthesised from
    /// the flat top-level fields (`state` doubling for `mode`).
    pub fn into_telemetry(self) -> Telemetry {
        if let Some(payload) = self.payload {
            return payload;
        }
        Telemetry {
            mode: self.mode.or(self.state),
            pose: self.pose,
            battery: self.battery,
            nav: self.nav,
            maps: self.maps,
            pois: self.pois.unwrap_or_default(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultFrame {
    #[serde(default, alias = "robot_id")]
    pub robot_id: Option<String>,
    #[serde(default)]
    pub command: Option<Value>,
    #[serde(default)]
    pub success: Option<Value>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// Last-known robot telemetry. Opaque beyond `mode` (status projections)
/// and `pois` (consulted by `goto_poi` validation); everything else is
/// relayed as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nav: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maps: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pois: Vec<Poi>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poi {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Poi {
    pub fn matches(&self, wanted: &str) -> bool {
        let id_matches = match &self.id {
            Some(Value::String(s)) => s == wanted,
            Some(Value::Number(n)) => n.to_string() == wanted,
            _ => false,
        };
        id_matches || self.name.as_deref() == Some(wanted)
    }
}

/// Frames consumed on the `/ui` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe(SubscribeFrame),
    Unsubscribe(SubscribeFrame),
    Control(ControlFrame),
    Command(CommandFrame),
    Ping(PingFrame),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeFrame {
    #[serde(default, alias = "robot_id")]
    pub robot_id: Option<String>,
    #[serde(default, alias = "client_name")]
    pub client_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlFrame {
    #[serde(default, alias = "robot_id")]
    pub robot_id: Option<String>,
    pub payload: ControlRequest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, alias = "client_name")]
    pub client_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFrame {
    #[serde(default, alias = "robot_id")]
    pub robot_id: Option<String>,
    pub payload: CommandRequest,
}

/// A duck-typed operator command body. Parameters stay `Value` so the
/// pipeline can coerce them the way the robot agents expect.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub linear_x: Option<Value>,
    #[serde(default)]
    pub angular_z: Option<Value>,
    #[serde(default)]
    pub mode: Option<Value>,
    #[serde(default, rename = "mapName", alias = "map_name")]
    pub map_name: Option<Value>,
    #[serde(default, rename = "poiId", alias = "poi_id")]
    pub poi_id: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PingFrame {
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// Frames emitted to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiFrame {
    #[serde(rename_all = "camelCase")]
    Welcome {
        client_id: String,
        robots: Vec<RobotProjection>,
        timestamp: i64,
    },
    State(StateFrame),
    Event { payload: EventPayload },
    Error(ErrorFrame),
    Pong { timestamp: i64 },
}

/// A robot state snapshot: the latest telemetry flattened alongside the
/// liveness flag and the lease view, all observed in one critical section.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFrame {
    pub robot_id: String,
    pub online: bool,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nav: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maps: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pois: Vec<Poi>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub control: LeaseView,
}

impl StateFrame {
    /// Placeholder snapshot for a robot the registry does not know.
    pub fn offline(robot_id: &str) -> Self {
        Self {
            robot_id: robot_id.to_string(),
            online: false,
            mode: "unknown".to_string(),
            pose: None,
            battery: None,
            nav: None,
            maps: None,
            pois: Vec::new(),
            extra: Map::new(),
            control: LeaseView::default(),
        }
    }
}

/// Lease projection inlined into state frames and HTTP projections.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseView {
    pub owner_client_id: Option<String>,
    pub owner_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
}

/// Lifecycle and control events fanned out to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    #[serde(rename_all = "camelCase")]
    RobotOnline {
        robot_id: String,
        version: String,
        capabilities: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    RobotOffline {
        robot_id: String,
        reason: &'static str,
    },
    #[serde(rename_all = "camelCase")]
    ControlAcquired {
        robot_id: String,
        owner_client_id: String,
        owner_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ControlConfirmed {
        robot_id: String,
        owner_client_id: String,
        owner_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ControlReleased {
        robot_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_owner: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ControlForced {
        robot_id: String,
        owner_client_id: String,
        owner_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_owner: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CommandResult {
        robot_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        success: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
    ServerShutdown,
}

/// Operator-visible error codes, emitted verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RobotOffline,
    NoControl,
    ControlDenied,
    InvalidMode,
    MissingParam,
    UnknownPoi,
    UnknownCommand,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_pois: Option<Vec<Poi>>,
}

impl ErrorFrame {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            holder: None,
            available_pois: None,
        }
    }

    pub fn robot_offline(robot_id: &str) -> Self {
        Self::new(
            ErrorCode::RobotOffline,
            format!("Robot '{robot_id}' is not connected"),
        )
    }
}

/// Frames emitted to robots.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RobotBoundFrame {
    #[serde(rename_all = "camelCase")]
    Welcome {
        server_time: i64,
        safety: SafetyConfig,
    },
    Command {
        #[serde(flatten)]
        command: RobotCommand,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyConfig {
    pub telemetry_rate_hz: u32,
    pub max_linear_velocity: f64,
    pub max_angular_velocity: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            telemetry_rate_hz: crate::config::TELEMETRY_RATE_HZ,
            max_linear_velocity: crate::config::MAX_LINEAR_VELOCITY,
            max_angular_velocity: crate::config::MAX_ANGULAR_VELOCITY,
        }
    }
}

/// Validated, clamped command bodies as the robot agent expects them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RobotCommand {
    Teleop { linear_x: f64, angular_z: f64 },
    Stop,
    SetMode { mode: String },
    LoadMap { map_name: String },
    StopSlam { map_name: String },
    GoToPoi { poi_id: String },
    CancelNav,
    StartSlam,
    Restart,
}

/// Per-robot summary served over HTTP and in operator welcome frames.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotProjection {
    pub robot_id: String,
    pub online: bool,
    pub last_seen: i64,
    pub version: String,
    pub capabilities: Vec<String>,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Telemetry>,
    pub control: LeaseView,
}

/// Generate a unique operator ClientId.
pub fn generate_client_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
