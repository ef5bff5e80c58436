use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::HubError;

/// Opaque ID types
pub type ConnectionId = String;
pub type QuestionId = String;

/// A voter identity: the chat username trimmed and case-folded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Returns `None` for usernames that are empty after trimming
    pub fn normalize(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_lowercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnswerOption {
    A,
    B,
    C,
    D,
}

impl AnswerOption {
    pub const ALL: [AnswerOption; 4] = [
        AnswerOption::A,
        AnswerOption::B,
        AnswerOption::C,
        AnswerOption::D,
    ];

    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'A' => Some(Self::A),
            'B' => Some(Self::B),
            'C' => Some(Self::C),
            'D' => Some(Self::D),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        }
    }

    /// Parse a chat vote such as `b`, `!B` or ` #c `
    pub fn parse_vote(text: &str) -> Option<Self> {
        let token = text.trim();
        let token = token
            .strip_prefix('!')
            .or_else(|| token.strip_prefix('#'))
            .unwrap_or(token);
        let mut chars = token.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_letter(c),
            _ => None,
        }
    }
}

impl fmt::Display for AnswerOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifelineKind {
    FiftyFifty,
    TakeAnotherVote,
    AskAMod,
}

impl LifelineKind {
    /// Order matters: chat shortcuts `1`, `2`, `3` index into it
    pub const ALL: [LifelineKind; 3] = [
        LifelineKind::FiftyFifty,
        LifelineKind::TakeAnotherVote,
        LifelineKind::AskAMod,
    ];

    /// Map a chat token (numeric shortcut or keyword synonym) to a lifeline
    pub fn from_token(text: &str) -> Option<Self> {
        let token = text.trim().trim_start_matches(['!', '#']).to_lowercase();
        let token = token.replace([' ', '-', '_'], "");
        match token.as_str() {
            "1" | "50" | "5050" | "50/50" | "50:50" | "fifty" | "fiftyfifty" => {
                Some(Self::FiftyFifty)
            }
            "2" | "revote" | "again" | "vote" | "takeanothervote" => Some(Self::TakeAnotherVote),
            "3" | "mod" | "mods" | "ask" | "askamod" => Some(Self::AskAMod),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FiftyFifty => "fifty_fifty",
            Self::TakeAnotherVote => "take_another_vote",
            Self::AskAMod => "ask_a_mod",
        }
    }
}

impl fmt::Display for LifelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything a round can tally: an answer letter or a lifeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ballot {
    Answer(AnswerOption),
    Lifeline(LifelineKind),
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ballot::Answer(option) => option.fmt(f),
            Ballot::Lifeline(kind) => kind.fmt(f),
        }
    }
}

impl Serialize for Ballot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Display,
    Overlay,
    Moderator,
    Chat,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Host,
        Role::Display,
        Role::Overlay,
        Role::Moderator,
        Role::Chat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Display => "display",
            Self::Overlay => "overlay",
            Self::Moderator => "moderator",
            Self::Chat => "chat",
        }
    }

    pub fn liveness_tier(self) -> LivenessTier {
        match self {
            Self::Host | Self::Display | Self::Overlay | Self::Moderator => LivenessTier::Long,
            Self::Chat => LivenessTier::Short,
        }
    }

    /// Roles allowed to inject chat-sourced votes
    pub fn can_submit_votes(self) -> bool {
        matches!(self, Self::Chat | Self::Host)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == normalized)
            .ok_or_else(|| HubError::UnknownRole(s.to_string()))
    }
}

/// Liveness timeout tier; undeclared connections always use `Short`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessTier {
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    #[default]
    Idle,
    Poll,
    Revote,
    LifelineVote,
    ModAssist,
    /// Poll or revote ended in a tie, host must lock an answer
    AwaitingAnswer,
    /// Lifeline vote ended in a tie, host must pick a lifeline
    AwaitingLifeline,
    Reveal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundKind {
    Poll,
    Revote,
    LifelineVote,
    ModAssist,
}

impl RoundKind {
    pub fn phase(self) -> GamePhase {
        match self {
            Self::Poll => GamePhase::Poll,
            Self::Revote => GamePhase::Revote,
            Self::LifelineVote => GamePhase::LifelineVote,
            Self::ModAssist => GamePhase::ModAssist,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub id: QuestionId,
    pub text: String,
    pub options: [String; 4],
    pub correct: AnswerOption,
}

/// Question as shown to clients before the reveal (no correct answer)
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PublicQuestion {
    pub id: QuestionId,
    pub text: String,
    pub options: [String; 4],
}

impl From<&Question> for PublicQuestion {
    fn from(q: &Question) -> Self {
        Self {
            id: q.id.clone(),
            text: q.text.clone(),
            options: q.options.clone(),
        }
    }
}

/// Lifelines for one game. Only the phase machine mutates this, and only
/// when a lifeline is actually activated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifelineState {
    pub used: BTreeSet<LifelineKind>,
    pub available_for_vote: BTreeSet<LifelineKind>,
}

impl Default for LifelineState {
    fn default() -> Self {
        Self {
            used: BTreeSet::new(),
            available_for_vote: LifelineKind::ALL.into_iter().collect(),
        }
    }
}

/// A normalized chat event as delivered by a chat-platform adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub source: String,
    pub username: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Status of an outbound link, as reported by the reconnection supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    Connected,
    Disconnected { cause: String },
    Reconnecting { attempt: u32, delay_ms: u64 },
}

/// Connection counts by role, included in the broadcast state
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ConnectionCounts {
    pub total: usize,
    pub unregistered: usize,
    pub hosts: usize,
    pub displays: usize,
    pub overlays: usize,
    pub moderators: usize,
    pub chat: usize,
}
