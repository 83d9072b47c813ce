use std::env;
use std::time::Duration;

/// Hard safety ceiling for forwarded teleop linear velocity (m/s).
pub const MAX_LINEAR_VELOCITY: f64 = 0.5;
/// Hard safety ceiling for forwarded teleop angular velocity (rad/s).
pub const MAX_ANGULAR_VELOCITY: f64 = 1.5;

/// Telemetry rate hint sent to robots in the welcome frame.
pub const TELEMETRY_RATE_HZ: u32 = 2;

/// Modes accepted by `set_mode`. Comparison is exact (case-sensitive).
pub const VALID_MODES: [&str; 4] = ["idle", "slam", "nav", "localization"];

/// A lease whose owner has sent no motion command for this long is evicted.
pub const CONTROL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// A robot that has sent no frame for this long is reaped.
pub const ROBOT_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport-level ping cadence on every socket.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How often the staleness reaper scans the registry.
pub const STALE_SWEEP_PERIOD: Duration = Duration::from_secs(30);
/// How often the idle-lease reaper scans the registry.
pub const IDLE_SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// Outbound frame queue depth per connection. Overflow drops the frame.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Legacy robots omit their id; they are registered under this one.
pub const DEFAULT_ROBOT_ID: &str = "fordward";

pub const SERVICE_NAME: &str = "rover-relay";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { port: 8080 }
    }
}
