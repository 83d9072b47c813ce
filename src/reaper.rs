use std::time::Instant;

use axum::extract::ws::Message;
use tracing::info;

use crate::config::{CONTROL_IDLE_TIMEOUT, IDLE_SWEEP_PERIOD, ROBOT_TIMEOUT, STALE_SWEEP_PERIOD};
use crate::protocol::{EventPayload, UiFrame};
use crate::registry::RelayState;

/// Start the two background eviction loops.
pub fn spawn_reapers(state: &RelayState) {
    tokio::spawn(stale_robot_loop(state.clone()));
    tokio::spawn(idle_lease_loop(state.clone()));
}

async fn stale_robot_loop(state: RelayState) {
    let mut interval = tokio::time::interval(STALE_SWEEP_PERIOD);
    loop {
        interval.tick().await;
        for robot_id in state.sweep_stale_robots(Instant::now()).await {
            info!(robot = %robot_id, "reaped stale robot");
        }
    }
}

async fn idle_lease_loop(state: RelayState) {
    let mut interval = tokio::time::interval(IDLE_SWEEP_PERIOD);
    loop {
        interval.tick().await;
        for (robot_id, _) in state.sweep_idle_leases(Instant::now()).await {
            info!(robot = %robot_id, "evicted idle control lease");
        }
    }
}

impl RelayState {
    /// Remove every robot that has sent nothing for `ROBOT_TIMEOUT`,
    /// terminating its socket and announcing `robot_offline` to all
    /// operators. Detection, removal and the broadcast share one
    /// critical section, so a reconnect cannot race the eviction.
    /// Returns the evicted ids for logging.
    pub async fn sweep_stale_robots(&self, now: Instant) -> Vec<String> {
        let mut inner = self.write().await;
        let stale: Vec<String> = inner
            .robots
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) > ROBOT_TIMEOUT)
            .map(|(id, _)| id.clone())
            .collect();
        for robot_id in &stale {
            if let Some(record) = inner.robots.remove(robot_id) {
                let _ = record.tx.try_send(Message::Close(None));
            }
            inner.broadcast_to_all(&UiFrame::Event {
                payload: EventPayload::RobotOffline {
                    robot_id: robot_id.clone(),
                    reason: "timeout",
                },
            });
        }
        stale
    }

    /// Unown every lease whose holder has sent no motion command for
    /// `CONTROL_IDLE_TIMEOUT`, broadcasting each release to the robot's
    /// subscribers. Returns the release events for logging.
    pub async fn sweep_idle_leases(&self, now: Instant) -> Vec<(String, EventPayload)> {
        let mut inner = self.write().await;
        let mut released = Vec::new();
        for (robot_id, record) in inner.robots.iter_mut() {
            if record.lease.owner_client_id.is_none() {
                continue;
            }
            let Some(last_command) = record.lease.last_command else {
                continue;
            };
            if now.duration_since(last_command) > CONTROL_IDLE_TIMEOUT {
                let previous_owner = record.lease.owner_name.clone();
                record.lease.clear();
                released.push((
                    robot_id.clone(),
                    EventPayload::ControlReleased {
                        robot_id: robot_id.clone(),
                        reason: Some("idle_timeout"),
                        previous_owner,
                    },
                ));
            }
        }
        for (robot_id, payload) in &released {
            inner.broadcast_to_subscribers(
                robot_id,
                &UiFrame::Event {
                    payload: payload.clone(),
                },
            );
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OUTBOUND_QUEUE_CAPACITY;
    use crate::protocol::{CommandRequest, ControlRequest, ErrorCode};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn stale_sweep_evicts_only_silent_robots() {
        let state = RelayState::new();
        let (tx_old, mut rx_old) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (tx_new, mut rx_new) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        state
            .upsert_robot("quiet", "0.0.0".into(), vec![], tx_old)
            .await;
        state
            .upsert_robot("chatty", "0.0.0".into(), vec![], tx_new)
            .await;

        // Nothing is stale yet.
        assert!(state.sweep_stale_robots(Instant::now()).await.is_empty());

        // Advance the clock past the timeout, but refresh the chatty one.
        let later = Instant::now() + Duration::from_secs(61);
        {
            let mut inner = state.write().await;
            let record = inner.robots.get_mut("chatty").unwrap();
            record.last_seen = later;
        }

        let evicted = state.sweep_stale_robots(later).await;
        assert_eq!(evicted, vec!["quiet".to_string()]);
        assert!(matches!(rx_old.try_recv(), Ok(Message::Close(None))));
        assert!(rx_new.try_recv().is_err());
        assert_eq!(state.list_robots().await.len(), 1);
    }

    #[tokio::test]
    async fn idle_sweep_releases_leases_and_reports_previous_owner() {
        let state = RelayState::new();
        state
            .upsert_robot(
                "r1",
                "0.0.0".into(),
                vec![],
                mpsc::channel(OUTBOUND_QUEUE_CAPACITY).0,
            )
            .await;
        state
            .insert_client("aaa", mpsc::channel(OUTBOUND_QUEUE_CAPACITY).0)
            .await;
        state
            .handle_control(
                "aaa",
                "r1",
                ControlRequest {
                    action: Some("request".into()),
                    client_name: Some("A".into()),
                },
            )
            .await;

        // A fresh lease survives the sweep.
        assert!(state.sweep_idle_leases(Instant::now()).await.is_empty());

        // Sixty-one seconds of silence evicts the owner.
        let later = Instant::now() + Duration::from_secs(61);
        let released = state.sweep_idle_leases(later).await;
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, "r1");
        match &released[0].1 {
            EventPayload::ControlReleased {
                reason,
                previous_owner,
                ..
            } => {
                assert_eq!(*reason, Some("idle_timeout"));
                assert_eq!(previous_owner.as_deref(), Some("A"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The evicted owner is back to square one for motion commands.
        let err = state
            .handle_command(
                "aaa",
                "r1",
                CommandRequest {
                    kind: Some("teleop".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(err.code, ErrorCode::NoControl);
    }

    #[tokio::test]
    async fn idle_sweep_skips_unowned_leases() {
        let state = RelayState::new();
        state
            .upsert_robot(
                "r1",
                "0.0.0".into(),
                vec![],
                mpsc::channel(OUTBOUND_QUEUE_CAPACITY).0,
            )
            .await;
        let far_future = Instant::now() + Duration::from_secs(3600);
        assert!(state.sweep_idle_leases(far_future).await.is_empty());
    }
}
