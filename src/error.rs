//! Error taxonomy for the hub.
//!
//! Everything here is recovered locally: the offending message, vote or
//! connection is dropped and the shared game state is left untouched.

use serde::Serialize;
use std::fmt;

use crate::types::{AnswerOption, LifelineKind, Role};

/// Application close codes sent on WebSocket close frames
pub mod close_code {
    pub const GOING_AWAY: u16 = 1001;
    pub const UNKNOWN_ROLE: u16 = 4001;
    pub const ROLE_QUOTA: u16 = 4002;
    pub const OVERSIZED: u16 = 4003;
    pub const HEARTBEAT_TIMEOUT: u16 = 4004;
    pub const SLOW_CONSUMER: u16 = 4005;
}

/// Why a connection attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdmissionReason {
    #[serde(rename = "capacity")]
    Capacity,
    #[serde(rename = "origin-limit")]
    OriginLimit,
}

impl AdmissionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::OriginLimit => "origin-limit",
        }
    }
}

impl fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HubError {
    #[error("connection refused: {0}")]
    AdmissionRejected(AdmissionReason),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    OversizedMessage { size: usize, max: usize },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("no free {0} slot")]
    RoleQuotaExceeded(Role),

    #[error("connection already registered as {0}")]
    AlreadyRegistered(Role),

    #[error("connection has not registered a role")]
    NotRegistered,

    #[error("only {0}")]
    Unauthorized(String),

    #[error("invalid in current phase: {0}")]
    InvalidPhaseAction(String),

    #[error("option {0} has been excluded")]
    ExcludedOption(AnswerOption),

    #[error("lifeline {0} is not available")]
    LifelineUnavailable(LifelineKind),

    #[error("identity has already voted this round")]
    DuplicateVote,

    #[error("timer for generation {fired} is stale (live generation {live})")]
    StaleRoundTimer { fired: u64, live: u64 },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("hub is not running")]
    HubUnavailable,
}

impl HubError {
    /// Error code used in `{type:"error"}` messages
    pub fn code(&self) -> &'static str {
        match self {
            Self::AdmissionRejected(_) => "ADMISSION_REJECTED",
            Self::RateLimited => "RATE_LIMIT",
            Self::OversizedMessage { .. } => "OVERSIZED_MESSAGE",
            Self::MalformedPayload(_) => "PARSE_ERROR",
            Self::UnknownRole(_) => "UNKNOWN_ROLE",
            Self::RoleQuotaExceeded(_) => "ROLE_QUOTA",
            Self::AlreadyRegistered(_) => "ALREADY_REGISTERED",
            Self::NotRegistered => "NOT_REGISTERED",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::InvalidPhaseAction(_) => "INVALID_PHASE_ACTION",
            Self::ExcludedOption(_) => "EXCLUDED_OPTION",
            Self::LifelineUnavailable(_) => "LIFELINE_UNAVAILABLE",
            Self::DuplicateVote => "DUPLICATE_VOTE",
            Self::StaleRoundTimer { .. } => "STALE_TIMER",
            Self::InvariantViolation(_) => "INVARIANT_VIOLATION",
            Self::HubUnavailable => "HUB_UNAVAILABLE",
        }
    }

    /// Close code for errors that terminate the connection
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::UnknownRole(_) => Some(close_code::UNKNOWN_ROLE),
            Self::RoleQuotaExceeded(_) => Some(close_code::ROLE_QUOTA),
            Self::OversizedMessage { .. } => Some(close_code::OVERSIZED),
            _ => None,
        }
    }
}
