//! Connection registry: live connections, declared roles, heartbeat liveness
//! and the counters admission control reads.
//!
//! Owned by the hub worker. Every termination goes through
//! [`ConnectionRegistry::terminate`] so role/origin counters stay exact.

use std::collections::HashMap;
use std::time::Instant;

use crate::broadcast::{Outbound, Outbox};
use crate::config::{HubConfig, TierConfig};
use crate::error::{close_code, HubError, HubResult};
use crate::types::{ConnectionCounts, ConnectionId, LivenessTier, Role};

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    /// `None` until the first `register` message
    pub role: Option<Role>,
    pub origin: String,
    pub joined_at: Instant,
    pub last_activity_at: Instant,
    pub last_heartbeat_ack_at: Instant,
    pub last_probe_at: Instant,
    pub awaiting_ack: bool,
    /// Upgrade request carried valid host credentials
    pub host_authorized: bool,
    outbox: Outbox,
}

impl Connection {
    pub fn tier(&self) -> LivenessTier {
        self.role
            .map(Role::liveness_tier)
            .unwrap_or(LivenessTier::Short)
    }

    /// Queue a frame without waiting. False means the outbox is full or the
    /// writer is gone; the caller should terminate the connection.
    pub fn send(&self, frame: Outbound) -> bool {
        self.outbox.try_send(frame).is_ok()
    }

    pub fn transport_closed(&self) -> bool {
        self.outbox.is_closed()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminationReason {
    /// Client closed or the socket errored
    Closed,
    /// Probe was not acked before the next heartbeat tick
    MissedHeartbeat,
    /// No ack within the tier's liveness timeout
    LivenessExpired,
    /// Writer side already gone
    TransportClosed,
    /// Outbox full or send failed
    SlowConsumer,
    /// Protocol violation that closes the connection
    Violation(HubError),
}

impl TerminationReason {
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed | Self::TransportClosed => None,
            Self::MissedHeartbeat | Self::LivenessExpired => Some(close_code::HEARTBEAT_TIMEOUT),
            Self::SlowConsumer => Some(close_code::SLOW_CONSUMER),
            Self::Violation(err) => err.close_code(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Closed => "closed".to_string(),
            Self::MissedHeartbeat => "missed heartbeat".to_string(),
            Self::LivenessExpired => "liveness timeout".to_string(),
            Self::TransportClosed => "transport closed".to_string(),
            Self::SlowConsumer => "slow consumer".to_string(),
            Self::Violation(err) => err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Termination {
    pub id: ConnectionId,
    pub role: Option<Role>,
    pub origin: String,
    pub reason: TerminationReason,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    origin_counts: HashMap<String, usize>,
    role_counts: HashMap<Role, usize>,
    unregistered: usize,
    role_quotas: HashMap<Role, usize>,
    short_tier: TierConfig,
    long_tier: TierConfig,
}

impl ConnectionRegistry {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            connections: HashMap::new(),
            origin_counts: HashMap::new(),
            role_counts: HashMap::new(),
            unregistered: 0,
            role_quotas: Role::ALL
                .into_iter()
                .map(|role| (role, config.role_quota(role)))
                .collect(),
            short_tier: config.short_tier,
            long_tier: config.long_tier,
        }
    }

    fn tier_config(&self, tier: LivenessTier) -> TierConfig {
        match tier {
            LivenessTier::Short => self.short_tier,
            LivenessTier::Long => self.long_tier,
        }
    }

    /// Add an admitted, not yet registered connection
    pub fn insert(
        &mut self,
        origin: &str,
        outbox: Outbox,
        host_authorized: bool,
        now: Instant,
    ) -> ConnectionId {
        let id = ulid::Ulid::new().to_string();
        let conn = Connection {
            id: id.clone(),
            role: None,
            origin: origin.to_string(),
            joined_at: now,
            last_activity_at: now,
            last_heartbeat_ack_at: now,
            last_probe_at: now,
            awaiting_ack: false,
            host_authorized,
            outbox,
        };
        self.connections.insert(id.clone(), conn);
        *self.origin_counts.entry(origin.to_string()).or_insert(0) += 1;
        self.unregistered += 1;
        tracing::debug!(conn = %id, origin, "Connection admitted");
        id
    }

    /// Declare the role of a connection (first registration only)
    pub fn register(&mut self, id: &str, role: Role) -> HubResult<()> {
        let quota = self.role_quotas.get(&role).copied().unwrap_or(1);
        let in_use = self.role_counts.get(&role).copied().unwrap_or(0);

        let conn = self.connections.get_mut(id).ok_or(HubError::NotRegistered)?;
        if let Some(existing) = conn.role {
            return Err(HubError::AlreadyRegistered(existing));
        }
        if in_use >= quota {
            return Err(HubError::RoleQuotaExceeded(role));
        }

        conn.role = Some(role);
        self.unregistered = self.unregistered.saturating_sub(1);
        *self.role_counts.entry(role).or_insert(0) += 1;
        tracing::info!(conn = %id, %role, "Connection registered");
        Ok(())
    }

    pub fn record_activity(&mut self, id: &str, now: Instant) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.last_activity_at = now;
        }
    }

    /// Any heartbeat ack clears the pending probe
    pub fn record_ack(&mut self, id: &str, now: Instant) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.awaiting_ack = false;
            conn.last_heartbeat_ack_at = now;
            conn.last_activity_at = now;
        }
    }

    /// Probe connections whose tier interval has elapsed. A connection that
    /// still has an unanswered probe from the previous tick is terminated.
    pub fn heartbeat_tick(&mut self, now: Instant) -> Vec<Termination> {
        let mut doomed = Vec::new();

        for conn in self.connections.values_mut() {
            let interval = match conn.tier() {
                LivenessTier::Short => self.short_tier.heartbeat_interval,
                LivenessTier::Long => self.long_tier.heartbeat_interval,
            };
            if now.saturating_duration_since(conn.last_probe_at) < interval {
                continue;
            }
            if conn.awaiting_ack {
                doomed.push((conn.id.clone(), TerminationReason::MissedHeartbeat));
                continue;
            }
            conn.awaiting_ack = true;
            conn.last_probe_at = now;
            if !conn.send(Outbound::Ping) {
                doomed.push((conn.id.clone(), TerminationReason::SlowConsumer));
            }
        }

        doomed
            .into_iter()
            .filter_map(|(id, reason)| self.terminate(&id, reason))
            .collect()
    }

    /// Terminate connections past their tier's liveness timeout, or whose
    /// transport is already gone
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<Termination> {
        let doomed: Vec<(ConnectionId, TerminationReason)> = self
            .connections
            .values()
            .filter_map(|conn| {
                if conn.transport_closed() {
                    return Some((conn.id.clone(), TerminationReason::TransportClosed));
                }
                let timeout = self.tier_config(conn.tier()).liveness_timeout;
                if now.saturating_duration_since(conn.last_heartbeat_ack_at) > timeout {
                    return Some((conn.id.clone(), TerminationReason::LivenessExpired));
                }
                None
            })
            .collect();

        doomed
            .into_iter()
            .filter_map(|(id, reason)| self.terminate(&id, reason))
            .collect()
    }

    /// Remove a connection, release its counters and send a close frame
    /// when the reason carries a close code
    pub fn terminate(&mut self, id: &str, reason: TerminationReason) -> Option<Termination> {
        let conn = self.connections.remove(id)?;

        if let Some(count) = self.origin_counts.get_mut(&conn.origin) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.origin_counts.remove(&conn.origin);
            }
        }
        match conn.role {
            Some(role) => {
                if let Some(count) = self.role_counts.get_mut(&role) {
                    *count = count.saturating_sub(1);
                }
            }
            None => self.unregistered = self.unregistered.saturating_sub(1),
        }

        if let Some(code) = reason.close_code() {
            // Best effort: a full outbox just means no close frame
            let _ = conn.send(Outbound::Close {
                code,
                reason: reason.describe(),
            });
        }

        tracing::info!(
            conn = %conn.id,
            role = ?conn.role,
            origin = %conn.origin,
            reason = %reason.describe(),
            "Connection terminated"
        );

        Some(Termination {
            id: conn.id,
            role: conn.role,
            origin: conn.origin,
            reason,
        })
    }

    pub fn get(&self, id: &str) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn role_of(&self, id: &str) -> Option<Role> {
        self.connections.get(id).and_then(|c| c.role)
    }

    /// Queue a frame for one connection; false if it could not be queued
    pub fn send_to(&self, id: &str, frame: Outbound) -> bool {
        self.connections
            .get(id)
            .map(|conn| conn.send(frame))
            .unwrap_or(false)
    }

    /// Connections that have declared a role (broadcast recipients)
    pub fn registered(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values().filter(|c| c.role.is_some())
    }

    pub fn live_count(&self) -> usize {
        self.connections.len()
    }

    pub fn origin_count(&self, origin: &str) -> usize {
        self.origin_counts.get(origin).copied().unwrap_or(0)
    }

    pub fn unregistered_count(&self) -> usize {
        self.unregistered
    }

    pub fn role_count(&self, role: Role) -> usize {
        self.role_counts.get(&role).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> ConnectionCounts {
        ConnectionCounts {
            total: self.live_count(),
            unregistered: self.unregistered,
            hosts: self.role_count(Role::Host),
            displays: self.role_count(Role::Display),
            overlays: self.role_count(Role::Overlay),
            moderators: self.role_count(Role::Moderator),
            chat: self.role_count(Role::Chat),
        }
    }
}
