//! Hub configuration.
//!
//! Every tunable can be overridden through an environment variable (a `.env`
//! file is loaded by `main` first). Unparseable values fall back to the
//! default with a warning.

use ipnet::IpNet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{Role, RoundKind};

/// Round durations are clamped into this range (milliseconds)
pub const MIN_ROUND_MS: u64 = 5_000;
pub const MAX_ROUND_MS: u64 = 600_000;

/// Heartbeat settings for one liveness tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierConfig {
    /// How often a liveness probe is sent
    pub heartbeat_interval: Duration,
    /// Terminate when no ack arrived for this long
    pub liveness_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundDurations {
    pub poll: Duration,
    pub revote: Duration,
    pub lifeline_vote: Duration,
    pub mod_assist: Duration,
}

impl RoundDurations {
    pub fn for_kind(&self, kind: RoundKind) -> Duration {
        match kind {
            RoundKind::Poll => self.poll,
            RoundKind::Revote => self.revote,
            RoundKind::LifelineVote => self.lifeline_vote,
            RoundKind::ModAssist => self.mod_assist,
        }
    }

    /// Clamp a requested duration into the allowed range
    pub fn clamp(duration: Duration) -> Duration {
        duration.clamp(
            Duration::from_millis(MIN_ROUND_MS),
            Duration::from_millis(MAX_ROUND_MS),
        )
    }
}

impl Default for RoundDurations {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(60_000),
            revote: Duration::from_millis(45_000),
            lifeline_vote: Duration::from_millis(30_000),
            mod_assist: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub chat_adapter_url: Option<String>,
    pub broadcast_peer_url: Option<String>,
    pub cap: Duration,
    pub jitter: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            chat_adapter_url: None,
            broadcast_peer_url: None,
            cap: Duration::from_millis(60_000),
            jitter: Duration::from_millis(1_000),
            connect_timeout: Duration::from_millis(10_000),
            idle_timeout: Duration::from_millis(120_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub max_per_origin: usize,
    /// Concurrent connections that have not declared a role yet
    pub max_unregistered: usize,
    pub rate_limit_window: Duration,
    pub rate_limit_max: usize,
    pub heartbeat_tick: Duration,
    pub sweep_interval: Duration,
    pub short_tier: TierConfig,
    pub long_tier: TierConfig,
    pub rounds: RoundDurations,
    pub max_payload_bytes: usize,
    pub outbox_capacity: usize,
    pub command_queue_capacity: usize,
    /// Per-role concurrent instance quota; roles not listed get 1
    pub role_quotas: HashMap<Role, usize>,
    pub trusted_proxies: Vec<IpNet>,
    pub snapshot_path: Option<PathBuf>,
    pub reconnect: ReconnectConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7373)),
            max_connections: 512,
            max_per_origin: 16,
            max_unregistered: 32,
            rate_limit_window: Duration::from_millis(1_000),
            rate_limit_max: 20,
            heartbeat_tick: Duration::from_millis(1_000),
            sweep_interval: Duration::from_millis(5_000),
            short_tier: TierConfig {
                heartbeat_interval: Duration::from_millis(10_000),
                liveness_timeout: Duration::from_millis(25_000),
            },
            long_tier: TierConfig {
                heartbeat_interval: Duration::from_millis(30_000),
                liveness_timeout: Duration::from_millis(90_000),
            },
            rounds: RoundDurations::default(),
            max_payload_bytes: 16 * 1024,
            outbox_capacity: 256,
            command_queue_capacity: 4096,
            role_quotas: default_role_quotas(),
            trusted_proxies: Vec::new(),
            snapshot_path: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn default_role_quotas() -> HashMap<Role, usize> {
    HashMap::from([(Role::Overlay, 2), (Role::Moderator, 8), (Role::Chat, 2)])
}

impl HubConfig {
    pub fn role_quota(&self, role: Role) -> usize {
        self.role_quotas.get(&role).copied().unwrap_or(1)
    }

    /// Load config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = std::env::var("HUB_BIND_ADDR")
            .ok()
            .and_then(|v| match v.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::warn!(value = %v, "Invalid HUB_BIND_ADDR: {}", e);
                    None
                }
            })
            .unwrap_or(defaults.bind_addr);

        let rounds = RoundDurations {
            poll: round_ms("HUB_POLL_MS", defaults.rounds.poll),
            revote: round_ms("HUB_REVOTE_MS", defaults.rounds.revote),
            lifeline_vote: round_ms("HUB_LIFELINE_VOTE_MS", defaults.rounds.lifeline_vote),
            mod_assist: round_ms("HUB_MOD_ASSIST_MS", defaults.rounds.mod_assist),
        };

        let mut role_quotas = defaults.role_quotas.clone();
        if let Ok(spec) = std::env::var("HUB_ROLE_QUOTAS") {
            role_quotas.extend(parse_role_quotas(&spec));
        }

        let trusted_proxies = std::env::var("HUB_TRUSTED_PROXIES")
            .map(|v| parse_cidrs(&v))
            .unwrap_or_default();

        let config = Self {
            bind_addr,
            max_connections: env_parse("HUB_MAX_CONNECTIONS", defaults.max_connections),
            max_per_origin: env_parse("HUB_MAX_PER_ORIGIN", defaults.max_per_origin),
            max_unregistered: env_parse("HUB_MAX_UNREGISTERED", defaults.max_unregistered),
            rate_limit_window: env_ms("HUB_RATE_LIMIT_WINDOW_MS", defaults.rate_limit_window),
            rate_limit_max: env_parse("HUB_RATE_LIMIT_MAX", defaults.rate_limit_max),
            heartbeat_tick: env_ms("HUB_HEARTBEAT_TICK_MS", defaults.heartbeat_tick),
            sweep_interval: env_ms("HUB_SWEEP_INTERVAL_MS", defaults.sweep_interval),
            short_tier: TierConfig {
                heartbeat_interval: env_ms(
                    "HUB_SHORT_HEARTBEAT_MS",
                    defaults.short_tier.heartbeat_interval,
                ),
                liveness_timeout: env_ms("HUB_SHORT_TIMEOUT_MS", defaults.short_tier.liveness_timeout),
            },
            long_tier: TierConfig {
                heartbeat_interval: env_ms(
                    "HUB_LONG_HEARTBEAT_MS",
                    defaults.long_tier.heartbeat_interval,
                ),
                liveness_timeout: env_ms("HUB_LONG_TIMEOUT_MS", defaults.long_tier.liveness_timeout),
            },
            rounds,
            max_payload_bytes: env_parse("HUB_MAX_PAYLOAD_BYTES", defaults.max_payload_bytes),
            outbox_capacity: env_parse("HUB_OUTBOX_CAPACITY", defaults.outbox_capacity).max(1),
            command_queue_capacity: env_parse(
                "HUB_COMMAND_QUEUE_CAPACITY",
                defaults.command_queue_capacity,
            )
            .max(1),
            role_quotas,
            trusted_proxies,
            snapshot_path: env_string("HUB_SNAPSHOT_PATH").map(PathBuf::from),
            reconnect: ReconnectConfig {
                chat_adapter_url: env_string("CHAT_ADAPTER_URL"),
                broadcast_peer_url: env_string("BROADCAST_PEER_URL"),
                cap: env_ms("RECONNECT_CAP_MS", defaults.reconnect.cap),
                jitter: env_ms("RECONNECT_JITTER_MS", defaults.reconnect.jitter),
                connect_timeout: env_ms(
                    "RECONNECT_CONNECT_TIMEOUT_MS",
                    defaults.reconnect.connect_timeout,
                ),
                idle_timeout: env_ms("RECONNECT_IDLE_TIMEOUT_MS", defaults.reconnect.idle_timeout),
            },
        };

        tracing::info!(
            bind_addr = %config.bind_addr,
            max_connections = config.max_connections,
            max_per_origin = config.max_per_origin,
            rate_limit_max = config.rate_limit_max,
            rate_limit_window_ms = config.rate_limit_window.as_millis() as u64,
            chat_adapter = config.reconnect.chat_adapter_url.is_some(),
            broadcast_peer = config.reconnect.broadcast_peer_url.is_some(),
            "Hub config loaded"
        );

        config
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => match v.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(key, value = %v, "Ignoring unparseable config value");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

fn round_ms(key: &str, default: Duration) -> Duration {
    let requested = env_ms(key, default);
    let clamped = RoundDurations::clamp(requested);
    if clamped != requested {
        tracing::warn!(
            key,
            requested_ms = requested.as_millis() as u64,
            clamped_ms = clamped.as_millis() as u64,
            "Round duration out of range, clamped"
        );
    }
    clamped
}

/// Parse `display=2,moderator=8`; malformed entries are skipped
fn parse_role_quotas(spec: &str) -> HashMap<Role, usize> {
    let mut quotas = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((role, quota)) = entry.split_once('=') else {
            tracing::warn!(entry, "Ignoring role quota without '='");
            continue;
        };
        match (role.parse::<Role>(), quota.trim().parse::<usize>()) {
            (Ok(role), Ok(quota)) => {
                quotas.insert(role, quota);
            }
            _ => tracing::warn!(entry, "Ignoring malformed role quota"),
        }
    }
    quotas
}

fn parse_cidrs(spec: &str) -> Vec<IpNet> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(e) => {
                tracing::warn!(cidr = s, "Ignoring invalid trusted proxy range: {}", e);
                None
            }
        })
        .collect()
}
