//! Connection-level abuse protection
//!
//! - Admission control: global and per-origin connection caps
//! - Sliding-window rate limiting of inbound messages per connection
//! - Origin identity derivation (peer IP, or `X-Forwarded-For` behind a
//!   trusted proxy)
//!
//! All state here is owned by the hub worker, so nothing needs a lock.

use axum::http::HeaderMap;
use ipnet::IpNet;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::HubConfig;
use crate::error::AdmissionReason;
use crate::registry::ConnectionRegistry;
use crate::types::ConnectionId;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Sliding-window rate limiter keyed by connection
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Accepted message timestamps per connection, oldest first
    hits: HashMap<ConnectionId, VecDeque<Instant>>,
    /// Maximum messages per window
    max_messages: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_messages: usize, window: Duration) -> Self {
        Self {
            hits: HashMap::new(),
            max_messages,
            window,
        }
    }

    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.rate_limit_max, config.rate_limit_window)
    }

    /// Check if a message at `now` should be allowed
    /// Returns true if allowed, false if rate limited
    pub fn check_at(&mut self, conn: &str, now: Instant) -> bool {
        let hits = self.hits.entry(conn.to_string()).or_default();

        // Evict timestamps that fell out of the window
        while let Some(oldest) = hits.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= self.max_messages {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Drop all state for a terminated connection
    pub fn release(&mut self, conn: &str) {
        self.hits.remove(conn);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.hits.len()
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject(AdmissionReason),
}

/// Decides whether a new connection may join. Counters are read from the
/// registry, which is their only writer.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    pub max_connections: usize,
    pub max_per_origin: usize,
    pub max_unregistered: usize,
}

impl AdmissionController {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_per_origin: config.max_per_origin,
            max_unregistered: config.max_unregistered,
        }
    }

    pub fn try_admit(&self, registry: &ConnectionRegistry, origin: &str) -> Admission {
        if registry.live_count() >= self.max_connections
            || registry.unregistered_count() >= self.max_unregistered
        {
            return Admission::Reject(AdmissionReason::Capacity);
        }
        if registry.origin_count(origin) >= self.max_per_origin {
            return Admission::Reject(AdmissionReason::OriginLimit);
        }
        Admission::Accept
    }
}

/// Origin identity for per-origin quotas. Behind a trusted proxy the first
/// `X-Forwarded-For` hop is used; otherwise the peer address.
pub fn origin_identity(peer: IpAddr, headers: &HeaderMap, trusted_proxies: &[IpNet]) -> String {
    let peer = canonical_ip(peer);
    if trusted_proxies.iter().any(|net| net.contains(&peer)) {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(client) = forwarded {
            return canonical_ip(client).to_string();
        }
        tracing::debug!(%peer, "Trusted proxy sent no usable X-Forwarded-For");
    }
    peer.to_string()
}

/// IPv4-mapped IPv6 addresses count as their IPv4 origin
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
