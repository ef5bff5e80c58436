use axum::extract::ws::Utf8Bytes;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::hub::HubHandle;
use crate::protocol::{GameStateView, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::types::ConnectionId;

/// Cadence of coalesced tally pushes while votes stream in
pub const VOTE_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// One queued item for a connection's writer task
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-serialized JSON text frame
    Frame(Utf8Bytes),
    /// Liveness probe (WebSocket Ping)
    Ping,
    Close { code: u16, reason: String },
}

/// Sending half of a connection's in-order outbound queue
pub type Outbox = mpsc::Sender<Outbound>;

/// Pushes state snapshots and events to every registered connection, plus
/// the secondary broadcast peer channel. Never blocks: a connection whose
/// outbox cannot take the frame is reported back for termination.
#[derive(Debug, Clone)]
pub struct Fanout {
    peer: broadcast::Sender<Utf8Bytes>,
}

impl Fanout {
    pub fn new(peer_capacity: usize) -> Self {
        let (peer, _rx) = broadcast::channel(peer_capacity.max(1));
        Self { peer }
    }

    /// Sender side of the peer channel (subscribe to receive every frame)
    pub fn peer_sender(&self) -> broadcast::Sender<Utf8Bytes> {
        self.peer.clone()
    }

    /// Serialize once for all recipients
    pub fn encode(msg: &ServerMessage) -> Option<Utf8Bytes> {
        match serde_json::to_string(msg) {
            Ok(json) => Some(Utf8Bytes::from(json)),
            Err(e) => {
                tracing::error!("Failed to serialize outbound message: {}", e);
                None
            }
        }
    }

    /// Returns the connections that could not take the frame
    pub fn push_state(
        &self,
        registry: &ConnectionRegistry,
        snapshot: GameStateView,
    ) -> Vec<ConnectionId> {
        self.push(registry, &ServerMessage::State { data: snapshot })
    }

    /// Returns the connections that could not take the frame
    pub fn push_event(&self, registry: &ConnectionRegistry, event: &ServerMessage) -> Vec<ConnectionId> {
        self.push(registry, event)
    }

    fn push(&self, registry: &ConnectionRegistry, msg: &ServerMessage) -> Vec<ConnectionId> {
        let Some(frame) = Self::encode(msg) else {
            return Vec::new();
        };

        // Ignore send errors (no peer connected is fine)
        let _ = self.peer.send(frame.clone());

        registry
            .registered()
            .filter(|conn| !conn.send(Outbound::Frame(frame.clone())))
            .map(|conn| conn.id.clone())
            .collect()
    }
}

/// Spawn a background task that drives heartbeat probing
pub fn spawn_heartbeat_ticker(hub: HubHandle, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if hub.heartbeat_tick().await.is_err() {
                tracing::debug!("Hub stopped, heartbeat ticker exiting");
                break;
            }
        }
    });
}

/// Spawn a background task that terminates stale connections
pub fn spawn_stale_sweeper(hub: HubHandle, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if hub.sweep_stale().await.is_err() {
                tracing::debug!("Hub stopped, stale sweeper exiting");
                break;
            }
        }
    });
}

/// Spawn a background task that pushes vote tallies at a fixed cadence
/// instead of once per vote
pub fn spawn_vote_broadcaster(hub: HubHandle, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if hub.flush_votes().await.is_err() {
                break;
            }
        }
    });
}
