use std::time::Instant;

use tracing::debug;

use crate::protocol::{ControlRequest, ErrorCode, ErrorFrame, EventPayload, UiFrame};
use crate::registry::RelayState;

/// What a control frame produced. `Broadcast` events have already been
/// enqueued to the robot's subscribers inside the state-machine critical
/// section (so no state frame reflecting the new lease can precede
/// them); `Reply` frames are for the requester alone and are sent by the
/// session that accepted the frame.
#[derive(Debug)]
pub enum ControlOutcome {
    Broadcast(EventPayload),
    Reply(UiFrame),
    Ignored,
}

impl RelayState {
    /// Drive the lease state machine for one operator `control` frame.
    ///
    /// Transitions: an unowned lease grants to the requester; a re-request
    /// from the owner refreshes the idle clock and is confirmed privately;
    /// a request against a foreign owner is denied with the holder's name;
    /// `release` by the owner unowns (no ack to the requester, broadcast
    /// only); `release` by anyone else is a silent no-op; `force` always
    /// seizes the lease.
    pub async fn handle_control(
        &self,
        client_id: &str,
        robot_id: &str,
        request: ControlRequest,
    ) -> ControlOutcome {
        let action = request.action.as_deref().unwrap_or("");
        let mut inner = self.write().await;

        if let Some(name) = request
            .client_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            if let Some(client) = inner.clients.get_mut(client_id) {
                client.client_name = name.to_string();
            }
        }
        let requester_name = inner
            .clients
            .get(client_id)
            .map(|c| c.client_name.clone())
            .unwrap_or_else(|| format!("Client-{client_id}"));

        let Some(record) = inner.robots.get_mut(robot_id) else {
            return ControlOutcome::Reply(UiFrame::Error(ErrorFrame::robot_offline(robot_id)));
        };

        let outcome = match action {
            "request" => match record.lease.owner_client_id.clone() {
                None => {
                    record.lease.grant(client_id, &requester_name);
                    ControlOutcome::Broadcast(EventPayload::ControlAcquired {
                        robot_id: robot_id.to_string(),
                        owner_client_id: client_id.to_string(),
                        owner_name: requester_name,
                    })
                }
                Some(owner) if owner == client_id => {
                    record.lease.last_command = Some(Instant::now());
                    let owner_name = record
                        .lease
                        .owner_name
                        .clone()
                        .unwrap_or(requester_name);
                    ControlOutcome::Reply(UiFrame::Event {
                        payload: EventPayload::ControlConfirmed {
                            robot_id: robot_id.to_string(),
                            owner_client_id: client_id.to_string(),
                            owner_name,
                        },
                    })
                }
                Some(owner) => {
                    let holder = record.lease.owner_name.clone().unwrap_or(owner);
                    ControlOutcome::Reply(UiFrame::Error(ErrorFrame {
                        code: ErrorCode::ControlDenied,
                        message: format!("Control is held by {holder}"),
                        holder: Some(holder),
                        available_pois: None,
                    }))
                }
            },
            "release" => {
                if record.lease.is_owned_by(client_id) {
                    let previous_owner = record.lease.owner_name.clone();
                    record.lease.clear();
                    ControlOutcome::Broadcast(EventPayload::ControlReleased {
                        robot_id: robot_id.to_string(),
                        reason: None,
                        previous_owner,
                    })
                } else {
                    ControlOutcome::Ignored
                }
            }
            "force" => {
                let previous_owner = record.lease.owner_name.clone();
                record.lease.grant(client_id, &requester_name);
                ControlOutcome::Broadcast(EventPayload::ControlForced {
                    robot_id: robot_id.to_string(),
                    owner_client_id: client_id.to_string(),
                    owner_name: requester_name,
                    previous_owner,
                })
            }
            other => {
                debug!(client = %client_id, robot = %robot_id, action = %other, "ignoring unknown control action");
                ControlOutcome::Ignored
            }
        };

        if let ControlOutcome::Broadcast(payload) = &outcome {
            inner.broadcast_to_subscribers(
                robot_id,
                &UiFrame::Event {
                    payload: payload.clone(),
                },
            );
        }
        outcome
    }

    /// Tear down an operator session: release every lease it holds
    /// (broadcasting each owner-disconnect release), then drop the
    /// client record, all in one critical section. Returns the released
    /// robot ids with their events, for logging.
    pub async fn evict_client(&self, client_id: &str) -> Vec<(String, EventPayload)> {
        let mut inner = self.write().await;
        let mut released = Vec::new();
        for (robot_id, record) in inner.robots.iter_mut() {
            if record.lease.is_owned_by(client_id) {
                let previous_owner = record.lease.owner_name.clone();
                record.lease.clear();
                released.push((
                    robot_id.clone(),
                    EventPayload::ControlReleased {
                        robot_id: robot_id.clone(),
                        reason: Some("owner_disconnected"),
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
        inner.clients.remove(client_id);
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OUTBOUND_QUEUE_CAPACITY;
    use crate::registry::OutboundTx;
    use tokio::sync::mpsc;

    fn request(action: &str, name: Option<&str>) -> ControlRequest {
        ControlRequest {
            action: Some(action.to_string()),
            client_name: name.map(str::to_string),
        }
    }

    fn test_tx() -> OutboundTx {
        mpsc::channel(OUTBOUND_QUEUE_CAPACITY).0
    }

    async fn state_with_robot_and_clients() -> RelayState {
        let state = RelayState::new();
        state
            .upsert_robot("r1", "0.0.0".into(), vec![], test_tx())
            .await;
        state.insert_client("aaa", test_tx()).await;
        state.insert_client("bbb", test_tx()).await;
        state
    }

    async fn owner_of(state: &RelayState, robot_id: &str) -> Option<String> {
        state
            .get_robot_projection(robot_id)
            .await
            .unwrap()
            .control
            .owner_client_id
    }

    #[tokio::test]
    async fn request_on_unowned_lease_grants_and_broadcasts() {
        let state = state_with_robot_and_clients().await;
        let outcome = state
            .handle_control("aaa", "r1", request("request", Some("A")))
            .await;
        match outcome {
            ControlOutcome::Broadcast(EventPayload::ControlAcquired {
                owner_client_id,
                owner_name,
                ..
            }) => {
                assert_eq!(owner_client_id, "aaa");
                assert_eq!(owner_name, "A");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(owner_of(&state, "r1").await.as_deref(), Some("aaa"));
    }

    #[tokio::test]
    async fn rerequest_from_owner_is_confirmed_privately() {
        let state = state_with_robot_and_clients().await;
        state
            .handle_control("aaa", "r1", request("request", Some("A")))
            .await;
        let outcome = state
            .handle_control("aaa", "r1", request("request", None))
            .await;
        assert!(matches!(
            outcome,
            ControlOutcome::Reply(UiFrame::Event {
                payload: EventPayload::ControlConfirmed { .. }
            })
        ));
        assert_eq!(owner_of(&state, "r1").await.as_deref(), Some("aaa"));
    }

    #[tokio::test]
    async fn request_against_foreign_owner_is_denied_with_holder() {
        let state = state_with_robot_and_clients().await;
        state
            .handle_control("aaa", "r1", request("request", Some("A")))
            .await;
        let outcome = state
            .handle_control("bbb", "r1", request("request", Some("B")))
            .await;
        match outcome {
            ControlOutcome::Reply(UiFrame::Error(err)) => {
                assert_eq!(err.code, ErrorCode::ControlDenied);
                assert_eq!(err.holder.as_deref(), Some("A"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(owner_of(&state, "r1").await.as_deref(), Some("aaa"));
    }

    #[tokio::test]
    async fn release_by_owner_unowns_and_broadcasts() {
        let state = state_with_robot_and_clients().await;
        state
            .handle_control("aaa", "r1", request("request", Some("A")))
            .await;
        let outcome = state
            .handle_control("aaa", "r1", request("release", None))
            .await;
        match outcome {
            ControlOutcome::Broadcast(EventPayload::ControlReleased {
                reason,
                previous_owner,
                ..
            }) => {
                assert!(reason.is_none());
                assert_eq!(previous_owner.as_deref(), Some("A"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(owner_of(&state, "r1").await.is_none());
    }

    #[tokio::test]
    async fn release_by_non_owner_is_silent() {
        let state = state_with_robot_and_clients().await;
        state
            .handle_control("aaa", "r1", request("request", Some("A")))
            .await;
        let outcome = state
            .handle_control("bbb", "r1", request("release", None))
            .await;
        assert!(matches!(outcome, ControlOutcome::Ignored));
        assert_eq!(owner_of(&state, "r1").await.as_deref(), Some("aaa"));
    }

    #[tokio::test]
    async fn force_seizes_the_lease_and_reports_previous_owner() {
        let state = state_with_robot_and_clients().await;
        state
            .handle_control("aaa", "r1", request("request", Some("A")))
            .await;
        let outcome = state
            .handle_control("bbb", "r1", request("force", Some("B")))
            .await;
        match outcome {
            ControlOutcome::Broadcast(EventPayload::ControlForced {
                owner_client_id,
                previous_owner,
                ..
            }) => {
                assert_eq!(owner_client_id, "bbb");
                assert_eq!(previous_owner.as_deref(), Some("A"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(owner_of(&state, "r1").await.as_deref(), Some("bbb"));
    }

    #[tokio::test]
    async fn control_against_unknown_robot_reports_offline() {
        let state = state_with_robot_and_clients().await;
        let outcome = state
            .handle_control("aaa", "ghost", request("request", None))
            .await;
        match outcome {
            ControlOutcome::Reply(UiFrame::Error(err)) => {
                assert_eq!(err.code, ErrorCode::RobotOffline);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn evict_client_releases_leases_before_removing_the_record() {
        let state = state_with_robot_and_clients().await;
        state
            .upsert_robot("r2", "0.0.0".into(), vec![], test_tx())
            .await;
        state
            .handle_control("aaa", "r1", request("request", Some("A")))
            .await;
        state
            .handle_control("aaa", "r2", request("request", None))
            .await;

        let mut released = state.evict_client("aaa").await;
        released.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].0, "r1");
        assert!(matches!(
            released[0].1,
            EventPayload::ControlReleased {
                reason: Some("owner_disconnected"),
                ..
            }
        ));
        assert!(owner_of(&state, "r1").await.is_none());
        assert!(owner_of(&state, "r2").await.is_none());
        assert_eq!(state.client_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_action_is_ignored() {
        let state = state_with_robot_and_clients().await;
        let outcome = state
            .handle_control("aaa", "r1", request("grab", None))
            .await;
        assert!(matches!(outcome, ControlOutcome::Ignored));
    }
}
