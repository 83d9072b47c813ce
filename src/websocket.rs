use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_ROBOT_ID, OUTBOUND_QUEUE_CAPACITY, PING_INTERVAL};
use crate::control::ControlOutcome;
use crate::protocol::{
    generate_client_id, now_ms, ClientFrame, EventPayload, RobotBoundFrame, RobotFrame,
    SafetyConfig, UiFrame,
};
use crate::registry::{enqueue_frame, RelayState};

fn resolve_robot_id(robot_id: Option<String>) -> String {
    robot_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_ROBOT_ID.to_string())
}

fn default_capabilities() -> Vec<String> {
    vec!["pose".to_string(), "battery".to_string(), "mode".to_string()]
}

/// Drain one connection's outbound queue into its socket sink, emitting
/// transport pings on the side. An explicit `Close` frame ends the task.
async fn run_writer(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(Message::Close(reason)) => {
                    let _ = sink.send(Message::Close(reason)).await;
                    break;
                }
                Some(frame) => {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// WebSocket upgrade handler for the `/robot` endpoint.
pub async fn robot_ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_robot_socket(socket, state))
}

async fn handle_robot_socket(socket: WebSocket, state: RelayState) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    tokio::spawn(run_writer(sink, rx));

    // (robot_id, session token) once the agent has said hello.
    let mut registration: Option<(String, u64)> = None;

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "robot socket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                if let Some((robot_id, session)) = &registration {
                    state.touch_robot(robot_id, *session).await;
                }
                let parsed: RobotFrame = match serde_json::from_str(&text) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(error = %err, "dropping malformed robot frame");
                        continue;
                    }
                };
                match parsed {
                    RobotFrame::Hello(hello) | RobotFrame::Register(hello) => {
                        let robot_id = resolve_robot_id(hello.robot_id);
                        let version = hello.version.unwrap_or_else(|| "0.0.0".to_string());
                        let capabilities = hello.capabilities.unwrap_or_else(default_capabilities);
                        let (session, superseded) = state
                            .upsert_robot(&robot_id, version.clone(), capabilities.clone(), tx.clone())
                            .await;
                        if let Some(old) = superseded {
                            info!(robot = %robot_id, "terminating superseded robot socket");
                            let _ = old.try_send(Message::Close(None));
                        }
                        registration = Some((robot_id.clone(), session));
                        info!(robot = %robot_id, version = %version, "robot registered");
                        enqueue_frame(
                            &robot_id,
                            &tx,
                            &RobotBoundFrame::Welcome {
                                server_time: now_ms(),
                                safety: SafetyConfig::default(),
                            },
                        );
                        state
                            .broadcast_to_all(&UiFrame::Event {
                                payload: EventPayload::RobotOnline {
                                    robot_id,
                                    version,
                                    capabilities,
                                },
                            })
                            .await;
                    }
                    RobotFrame::Telemetry(telemetry) => {
                        let Some((robot_id, session)) = registration.clone() else {
                            debug!("telemetry before registration, ignoring");
                            continue;
                        };
                        if !state
                            .record_telemetry(&robot_id, session, telemetry.into_telemetry())
                            .await
                        {
                            debug!(robot = %robot_id, "telemetry from superseded session, ignoring");
                        }
                    }
                    RobotFrame::CommandResult(result) => {
                        let Some((robot_id, _)) = registration.clone() else {
                            debug!("command result before registration, ignoring");
                            continue;
                        };
                        state
                            .broadcast_to_subscribers(
                                &robot_id,
                                &UiFrame::Event {
                                    payload: EventPayload::CommandResult {
                                        robot_id: robot_id.clone(),
                                        command: result.command,
                                        success: result.success,
                                        message: result.message,
                                        timestamp: result.timestamp,
                                    },
                                },
                            )
                            .await;
                    }
                    RobotFrame::Unknown => {
                        debug!("ignoring unknown robot frame type");
                    }
                }
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                debug!("ignoring binary robot frame");
            }
            // Ping/pong liveness is the library's concern.
            _ => {}
        }
    }

    if let Some((robot_id, session)) = registration {
        if state.remove_robot(&robot_id, session).await {
            info!(robot = %robot_id, "robot disconnected");
            state
                .broadcast_to_all(&UiFrame::Event {
                    payload: EventPayload::RobotOffline {
                        robot_id,
                        reason: "disconnected",
                    },
                })
                .await;
        }
    }
}

/// WebSocket upgrade handler for the `/ui` endpoint.
pub async fn ui_ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state))
}

async fn handle_ui_socket(socket: WebSocket, state: RelayState) {
    let client_id = generate_client_id();
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    tokio::spawn(run_writer(sink, rx));

    state.insert_client(&client_id, tx.clone()).await;
    info!(client = %client_id, "operator connected");

    let robots = state.list_robots().await;
    enqueue_frame(
        &client_id,
        &tx,
        &UiFrame::Welcome {
            client_id: client_id.clone(),
            robots,
            timestamp: now_ms(),
        },
    );

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(client = %client_id, error = %err, "operator socket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                let parsed: ClientFrame = match serde_json::from_str(&text) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(client = %client_id, error = %err, "dropping malformed client frame");
                        continue;
                    }
                };
                match parsed {
                    ClientFrame::Subscribe(sub) => {
                        let robot_id = resolve_robot_id(sub.robot_id);
                        let snapshot = state
                            .subscribe(&client_id, &robot_id, sub.client_name)
                            .await;
                        enqueue_frame(&client_id, &tx, &UiFrame::State(snapshot));
                    }
                    ClientFrame::Unsubscribe(sub) => {
                        let robot_id = resolve_robot_id(sub.robot_id);
                        state.unsubscribe(&client_id, &robot_id).await;
                    }
                    ClientFrame::Control(control) => {
                        let robot_id = resolve_robot_id(control.robot_id);
                        match state
                            .handle_control(&client_id, &robot_id, control.payload)
                            .await
                        {
                            // Broadcast outcomes were delivered inside
                            // the state machine's critical section.
                            ControlOutcome::Broadcast(payload) => {
                                debug!(client = %client_id, robot = %robot_id, ?payload, "lease transition");
                            }
                            ControlOutcome::Reply(frame) => {
                                enqueue_frame(&client_id, &tx, &frame);
                            }
                            ControlOutcome::Ignored => {}
                        }
                    }
                    ClientFrame::Command(command) => {
                        let robot_id = resolve_robot_id(command.robot_id);
                        if let Some(err) = state
                            .handle_command(&client_id, &robot_id, command.payload)
                            .await
                        {
                            enqueue_frame(&client_id, &tx, &UiFrame::Error(err));
                        }
                    }
                    ClientFrame::Ping(_) => {
                        enqueue_frame(
                            &client_id,
                            &tx,
                            &UiFrame::Pong {
                                timestamp: now_ms(),
                            },
                        );
                    }
                    ClientFrame::Unknown => {
                        debug!(client = %client_id, "ignoring unknown client frame type");
                    }
                }
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                debug!(client = %client_id, "ignoring binary client frame");
            }
            _ => {}
        }
    }

    // Leases this client held are released before its record goes away.
    let released = state.evict_client(&client_id).await;
    for (robot_id, _) in &released {
        info!(client = %client_id, robot = %robot_id, "released lease of disconnected owner");
    }
    info!(client = %client_id, "operator disconnected");
}
