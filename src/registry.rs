use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::protocol::{
    LeaseView, Poi, RobotProjection, StateFrame, Telemetry, UiFrame,
};

/// Outbound handle for one connection. Frames are enqueued non-blocking;
/// a writer task owns the socket sink and drains the queue.
pub type OutboundTx = mpsc::Sender<Message>;

/// Exclusive control of one robot. Unowned is all fields unset.
#[derive(Debug, Clone, Default)]
pub struct ControlLease {
    pub owner_client_id: Option<String>,
    pub owner_name: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    /// Drives idle eviction; refreshed by authorised motion commands and
    /// by a re-request from the current owner.
    pub last_command: Option<Instant>,
}

impl ControlLease {
    pub fn grant(&mut self, client_id: &str, name: &str) {
        self.owner_client_id = Some(client_id.to_string());
        self.owner_name = Some(name.to_string());
        self.acquired_at = Some(Utc::now());
        self.last_command = Some(Instant::now());
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_owned_by(&self, client_id: &str) -> bool {
        self.owner_client_id.as_deref() == Some(client_id)
    }

    pub fn view(&self) -> LeaseView {
        LeaseView {
            owner_client_id: self.owner_client_id.clone(),
            owner_name: self.owner_name.clone(),
            since: self.acquired_at.map(|t| t.timestamp_millis()),
        }
    }
}

/// Authoritative record for one connected robot.
pub struct RobotRecord {
    /// Identity token for this registration; compare-and-remove checks it
    /// so a late disconnect or reaper pass cannot evict a successor.
    pub session: u64,
    pub tx: OutboundTx,
    pub version: String,
    pub capabilities: Vec<String>,
    pub last_seen: Instant,
    pub last_seen_at: DateTime<Utc>,
    pub telemetry: Option<Telemetry>,
    pub lease: ControlLease,
}

impl RobotRecord {
    pub fn mode(&self) -> String {
        self.telemetry
            .as_ref()
            .and_then(|t| t.mode.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn pois(&self) -> Vec<Poi> {
        self.telemetry
            .as_ref()
            .map(|t| t.pois.clone())
            .unwrap_or_default()
    }

    pub fn state_frame(&self, robot_id: &str) -> StateFrame {
        let telemetry = self.telemetry.clone().unwrap_or_default();
        StateFrame {
            robot_id: robot_id.to_string(),
            online: true,
            mode: telemetry.mode.unwrap_or_else(|| "unknown".to_string()),
            pose: telemetry.pose,
            battery: telemetry.battery,
            nav: telemetry.nav,
            maps: telemetry.maps,
            pois: telemetry.pois,
            extra: telemetry.extra,
            control: self.lease.view(),
        }
    }

    pub fn projection(&self, robot_id: &str) -> RobotProjection {
        RobotProjection {
            robot_id: robot_id.to_string(),
            online: true,
            last_seen: self.last_seen_at.timestamp_millis(),
            version: self.version.clone(),
            capabilities: self.capabilities.clone(),
            mode: self.mode(),
            telemetry: self.telemetry.clone(),
            control: self.lease.view(),
        }
    }
}

/// One connected operator session.
pub struct ClientRecord {
    pub tx: OutboundTx,
    pub client_name: String,
    pub subscriptions: HashSet<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct RelayInner {
    pub robots: HashMap<String, RobotRecord>,
    pub clients: HashMap<String, ClientRecord>,
}

impl RelayInner {
    /// Enqueue a frame for every connected operator. Serialised once;
    /// enqueueing never blocks, so doing it under the lock keeps event
    /// ordering airtight while the socket writes stay in writer tasks.
    pub fn broadcast_to_all(&self, frame: &UiFrame) {
        let Ok(text) = serde_json::to_string(frame) else {
            return;
        };
        for (client_id, client) in &self.clients {
            send_or_drop(client_id, &client.tx, &text);
        }
    }

    /// Enqueue a frame for every operator subscribed to `robot_id`.
    pub fn broadcast_to_subscribers(&self, robot_id: &str, frame: &UiFrame) {
        let Ok(text) = serde_json::to_string(frame) else {
            return;
        };
        for (client_id, client) in &self.clients {
            if client.subscriptions.contains(robot_id) {
                send_or_drop(client_id, &client.tx, &text);
            }
        }
    }
}

/// Process-wide relay state: both maps behind one coarse lock, so every
/// invariant that spans robots and clients is checked in a single
/// critical section. Fan-out enqueues frames under the lock (never
/// blocking); the socket writes happen in per-connection writer tasks.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RwLock<RelayInner>>,
    session_counter: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayInner::default())),
            session_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_session(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, RelayInner> {
        self.inner.read().await
    }

    pub(crate) async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, RelayInner> {
        self.inner.write().await
    }

    /// Register (or re-register) a robot. Any prior record is replaced
    /// atomically; its outbound queue is handed back so the caller can
    /// terminate the superseded socket after the lock is released.
    pub async fn upsert_robot(
        &self,
        robot_id: &str,
        version: String,
        capabilities: Vec<String>,
        tx: OutboundTx,
    ) -> (u64, Option<OutboundTx>) {
        let session = self.next_session();
        let record = RobotRecord {
            session,
            tx: tx.clone(),
            version,
            capabilities,
            last_seen: Instant::now(),
            last_seen_at: Utc::now(),
            telemetry: None,
            lease: ControlLease::default(),
        };
        let previous = {
            let mut inner = self.write().await;
            inner.robots.insert(robot_id.to_string(), record)
        };
        let superseded = previous.and_then(|prev| {
            // A re-hello on the same socket replaces the record in place;
            // only a genuinely different connection gets terminated.
            if prev.tx.same_channel(&tx) {
                None
            } else {
                Some(prev.tx)
            }
        });
        (session, superseded)
    }

    /// Compare-and-remove: drops the record only if it still belongs to
    /// the given registration. Returns whether a record was removed.
    pub async fn remove_robot(&self, robot_id: &str, session: u64) -> bool {
        let mut inner = self.write().await;
        match inner.robots.get(robot_id) {
            Some(record) if record.session == session => {
                inner.robots.remove(robot_id);
                true
            }
            _ => false,
        }
    }

    /// Refresh liveness for the given registration.
    pub async fn touch_robot(&self, robot_id: &str, session: u64) {
        let mut inner = self.write().await;
        if let Some(record) = inner.robots.get_mut(robot_id) {
            if record.session == session {
                record.last_seen = Instant::now();
                record.last_seen_at = Utc::now();
            }
        }
    }

    /// Store a telemetry snapshot and fan the resulting state frame out
    /// to subscribers. Update, frame construction and enqueueing all
    /// happen in one critical section, so the telemetry and the lease
    /// view subscribers observe are mutually consistent and a lease
    /// transition broadcast can never land after a state frame that
    /// already reflects it. Returns false when the registration is no
    /// longer current.
    pub async fn record_telemetry(
        &self,
        robot_id: &str,
        session: u64,
        telemetry: Telemetry,
    ) -> bool {
        let mut inner = self.write().await;
        let Some(record) = inner.robots.get_mut(robot_id) else {
            return false;
        };
        if record.session != session {
            return false;
        }
        record.last_seen = Instant::now();
        record.last_seen_at = Utc::now();
        record.telemetry = Some(telemetry);
        let frame = UiFrame::State(record.state_frame(robot_id));
        inner.broadcast_to_subscribers(robot_id, &frame);
        true
    }

    /// Point-in-time projection of the registry, safe to serialise
    /// without holding the lock.
    pub async fn list_robots(&self) -> Vec<RobotProjection> {
        let inner = self.read().await;
        let mut robots: Vec<RobotProjection> = inner
            .robots
            .iter()
            .map(|(id, record)| record.projection(id))
            .collect();
        robots.sort_by(|a, b| a.robot_id.cmp(&b.robot_id));
        robots
    }

    pub async fn get_robot_projection(&self, robot_id: &str) -> Option<RobotProjection> {
        let inner = self.read().await;
        inner.robots.get(robot_id).map(|r| r.projection(robot_id))
    }

    pub async fn client_count(&self) -> usize {
        self.read().await.clients.len()
    }

    /// Register a new operator session.
    pub async fn insert_client(&self, client_id: &str, tx: OutboundTx) {
        let record = ClientRecord {
            tx,
            client_name: format!("Client-{client_id}"),
            subscriptions: HashSet::new(),
            connected_at: Utc::now(),
        };
        let mut inner = self.write().await;
        inner.clients.insert(client_id.to_string(), record);
    }

    /// Add `robot_id` to the client's subscription set and return the
    /// snapshot it should immediately see: the live record projection, or
    /// an offline placeholder for a robot the registry does not know.
    pub async fn subscribe(
        &self,
        client_id: &str,
        robot_id: &str,
        client_name: Option<String>,
    ) -> StateFrame {
        let mut inner = self.write().await;
        if let Some(client) = inner.clients.get_mut(client_id) {
            client.subscriptions.insert(robot_id.to_string());
            if let Some(name) = client_name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
            {
                client.client_name = name.to_string();
            }
        }
        match inner.robots.get(robot_id) {
            Some(record) => record.state_frame(robot_id),
            None => StateFrame::offline(robot_id),
        }
    }

    pub async fn unsubscribe(&self, client_id: &str, robot_id: &str) {
        let mut inner = self.write().await;
        if let Some(client) = inner.clients.get_mut(client_id) {
            client.subscriptions.remove(robot_id);
        }
    }

    /// Deliver a frame to every connected operator.
    pub async fn broadcast_to_all(&self, frame: &UiFrame) {
        self.read().await.broadcast_to_all(frame);
    }

    /// Deliver a frame to every operator subscribed to `robot_id`.
    pub async fn broadcast_to_subscribers(&self, robot_id: &str, frame: &UiFrame) {
        self.read().await.broadcast_to_subscribers(robot_id, frame);
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking enqueue; a full queue means a stalled peer and the frame
/// is dropped rather than holding up the rest of the fan-out.
fn send_or_drop(client_id: &str, tx: &OutboundTx, text: &str) {
    match tx.try_send(Message::Text(text.to_string())) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(client = %client_id, "outbound queue full, dropping frame");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(client = %client_id, "outbound queue closed, dropping frame");
        }
    }
}

/// Enqueue a frame on one connection, serialising it on the spot.
pub fn enqueue_frame<T: serde::Serialize>(peer: &str, tx: &OutboundTx, frame: &T) {
    match serde_json::to_string(frame) {
        Ok(text) => send_or_drop(peer, tx, &text),
        Err(err) => warn!(peer = %peer, error = %err, "failed to serialise frame"),
    }
}
