use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::HubError;
use crate::state::RoundOutcome;
use crate::types::*;

/// Protocol revision announced in `welcome`
pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message from every connection
    Register {
        client: String,
    },
    Ping,
    /// Heartbeat ack for clients that cannot answer WebSocket pings
    Pong,
    // Chat-sourced (chat bridge or host)
    ChatMessage {
        username: String,
        text: String,
        #[serde(default)]
        platform: Option<String>,
        #[serde(default)]
        timestamp: Option<WireTimestamp>,
    },
    LifelineVote {
        username: String,
        vote: String,
        #[serde(default)]
        platform: Option<String>,
        #[serde(default)]
        timestamp: Option<WireTimestamp>,
    },
    AudiencePollVote {
        username: String,
        vote: String,
        #[serde(default)]
        platform: Option<String>,
        #[serde(default)]
        timestamp: Option<WireTimestamp>,
    },
    // Host-only messages
    HostShowQuestion {
        question: Question,
    },
    HostStartPoll {
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        allow_manual_override: bool,
    },
    HostLockAnswer {
        option: AnswerOption,
    },
    HostStartLifelineVote {
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        allow_manual_override: bool,
    },
    HostActivateLifeline {
        lifeline: LifelineKind,
    },
    HostEndRound,
    HostSetModerators {
        usernames: Vec<String>,
    },
    HostResetGame,
}

impl ClientMessage {
    /// Normalized chat event for chat-sourced messages, `None` otherwise
    pub fn into_chat_event(self) -> Option<ChatEvent> {
        let (username, text, platform, timestamp) = match self {
            ClientMessage::ChatMessage {
                username,
                text,
                platform,
                timestamp,
            } => (username, text, platform, timestamp),
            ClientMessage::LifelineVote {
                username,
                vote,
                platform,
                timestamp,
            }
            | ClientMessage::AudiencePollVote {
                username,
                vote,
                platform,
                timestamp,
            } => (username, vote, platform, timestamp),
            _ => return None,
        };
        Some(ChatEvent {
            source: platform.unwrap_or_else(|| "unknown".to_string()),
            username,
            text,
            timestamp: timestamp
                .and_then(WireTimestamp::into_datetime)
                .unwrap_or_else(Utc::now),
        })
    }
}

/// Adapters send either epoch milliseconds or an RFC 3339 string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(i64),
    Rfc3339(DateTime<Utc>),
}

impl WireTimestamp {
    pub fn into_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            WireTimestamp::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
            WireTimestamp::Rfc3339(dt) => Some(dt),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        protocol: String,
        role: Role,
        connection_id: ConnectionId,
        server_now: String,
    },
    State {
        data: GameStateView,
    },
    Pong {
        timestamp: String,
    },
    Error {
        code: String,
        msg: String,
    },
    // Events
    AudiencePollStarted {
        timestamp: String,
        round: RoundInfo,
    },
    AudiencePollEnded {
        timestamp: String,
        result: RoundReport,
    },
    LifelineVotingStarted {
        timestamp: String,
        round: RoundInfo,
    },
    LifelineVotingEnded {
        timestamp: String,
        result: RoundReport,
    },
    LifelineActivated {
        timestamp: String,
        lifeline: LifelineKind,
        /// Chosen by the host rather than the audience
        by_host: bool,
    },
    FiftyFiftyApplied {
        timestamp: String,
        removed: Vec<AnswerOption>,
        remaining: Vec<AnswerOption>,
    },
    AskAModActivated {
        timestamp: String,
        round: RoundInfo,
        moderators: Vec<Identity>,
    },
    AskAModEnded {
        timestamp: String,
        result: RoundReport,
        responses: Vec<ModResponse>,
    },
    ModResponse {
        timestamp: String,
        response: ModResponse,
    },
    AnswerRevealed {
        timestamp: String,
        reveal: RevealInfo,
    },
    ChatConnectionStatus {
        timestamp: String,
        platform: String,
        status: LinkState,
    },
    Diagnostic {
        timestamp: String,
        code: String,
        msg: String,
    },
}

impl ServerMessage {
    pub fn error(err: &HubError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            msg: err.to_string(),
        }
    }

    /// The `*_started` event for a freshly opened round
    pub fn round_started(round: RoundInfo, moderators: Vec<Identity>) -> Self {
        let timestamp = now_rfc3339();
        match round.kind {
            RoundKind::Poll | RoundKind::Revote => {
                ServerMessage::AudiencePollStarted { timestamp, round }
            }
            RoundKind::LifelineVote => ServerMessage::LifelineVotingStarted { timestamp, round },
            RoundKind::ModAssist => ServerMessage::AskAModActivated {
                timestamp,
                round,
                moderators,
            },
        }
    }

    /// The `*_ended` event for a closed round
    pub fn round_ended(result: RoundReport, responses: Vec<ModResponse>) -> Self {
        let timestamp = now_rfc3339();
        match result.kind {
            RoundKind::Poll | RoundKind::Revote => {
                ServerMessage::AudiencePollEnded { timestamp, result }
            }
            RoundKind::LifelineVote => ServerMessage::LifelineVotingEnded { timestamp, result },
            RoundKind::ModAssist => ServerMessage::AskAModEnded {
                timestamp,
                result,
                responses,
            },
        }
    }

    pub fn diagnostic(code: &str, msg: impl Into<String>) -> Self {
        ServerMessage::Diagnostic {
            timestamp: now_rfc3339(),
            code: code.to_string(),
            msg: msg.into(),
        }
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Public description of a round, sent when it starts
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoundInfo {
    pub kind: RoundKind,
    pub generation: u64,
    pub started_at: String,
    pub duration_ms: u64,
    pub deadline: String,
    pub allow_manual_override: bool,
    /// Ballots this round accepts (empty for ask-a-mod)
    pub options: Vec<Ballot>,
}

/// Final tally and outcome of a round
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoundReport {
    pub kind: RoundKind,
    pub generation: u64,
    pub tally: BTreeMap<String, u32>,
    pub total_votes: u32,
    pub outcome: RoundOutcome,
}

/// Live round as seen in the broadcast state
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoundView {
    #[serde(flatten)]
    pub info: RoundInfo,
    pub tally: BTreeMap<String, u32>,
    pub voter_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModResponse {
    pub username: Identity,
    pub text: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct RevealInfo {
    pub locked: AnswerOption,
    pub correct: AnswerOption,
    pub is_correct: bool,
}

/// Broadcast snapshot of the whole game
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GameStateView {
    pub version: u64,
    pub phase: GamePhase,
    pub generation: u64,
    pub question_no: u32,
    pub question: Option<PublicQuestion>,
    pub round: Option<RoundView>,
    pub excluded_options: Vec<AnswerOption>,
    pub available_options: Vec<AnswerOption>,
    pub lifelines: LifelineState,
    pub locked_answer: Option<AnswerOption>,
    /// Only present once the answer has been revealed
    pub reveal: Option<RevealInfo>,
    pub last_result: Option<RoundReport>,
    pub mod_responses: Vec<ModResponse>,
    pub moderators: Vec<Identity>,
    pub chat_links: BTreeMap<String, LinkState>,
    pub connections: ConnectionCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"register","client":"display"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Register { client } if client == "display"));
    }

    #[test]
    fn test_parse_host_start_poll_defaults() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"host_start_poll"}"#).unwrap();
        match msg {
            ClientMessage::HostStartPoll {
                duration_ms,
                allow_manual_override,
            } => {
                assert_eq!(duration_ms, None);
                assert!(!allow_manual_override);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_chat_message_with_millis_timestamp() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"chat_message","username":"User1","text":"!b","platform":"twitch","timestamp":1700000000000}"#,
        )
        .unwrap();
        let event = msg.into_chat_event().unwrap();
        assert_eq!(event.source, "twitch");
        assert_eq!(event.text, "!b");
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_lifeline_vote_uses_vote_field() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"lifeline_vote","username":"u","vote":"50:50","timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let event = msg.into_chat_event().unwrap();
        assert_eq!(event.text, "50:50");
        assert_eq!(event.source, "unknown");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"host_make_coffee"}"#).is_err());
    }

    #[test]
    fn test_error_message_shape() {
        let json = serde_json::to_value(ServerMessage::error(&HubError::RateLimited)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "RATE_LIMIT");
    }
}
