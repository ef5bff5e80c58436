use super::PhaseMachine;
use crate::error::HubError;
use crate::protocol::{ModResponse, ServerMessage};
use crate::types::*;

/// Moderator answers kept per ask-a-mod round
const MAX_MOD_RESPONSES: usize = 50;

/// Result of feeding one chat event to the phase machine
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Counted in the live round's tally
    Accepted,
    /// Identity already voted this round; dropped
    Duplicate,
    /// Moderator message relayed during ask-a-mod
    Relayed,
    Rejected(HubError),
}

impl PhaseMachine {
    /// Interpret a chat event against the live round
    pub fn submit(&mut self, event: &ChatEvent) -> SubmitOutcome {
        let Some(identity) = Identity::normalize(&event.username) else {
            return SubmitOutcome::Rejected(HubError::MalformedPayload("empty username".to_string()));
        };
        let Some(kind) = self.game.round.as_ref().map(|r| r.kind) else {
            return SubmitOutcome::Rejected(HubError::InvalidPhaseAction(
                "no round is accepting votes".to_string(),
            ));
        };

        let ballot = match kind {
            RoundKind::Poll | RoundKind::Revote => match AnswerOption::parse_vote(&event.text) {
                Some(option) if self.game.excluded.contains(&option) => {
                    return SubmitOutcome::Rejected(HubError::ExcludedOption(option));
                }
                Some(option) => Ballot::Answer(option),
                None => {
                    return SubmitOutcome::Rejected(HubError::MalformedPayload(
                        "not an answer letter".to_string(),
                    ))
                }
            },
            RoundKind::LifelineVote => match LifelineKind::from_token(&event.text) {
                Some(lifeline) if !self.game.lifelines.available_for_vote.contains(&lifeline) => {
                    return SubmitOutcome::Rejected(HubError::LifelineUnavailable(lifeline));
                }
                Some(lifeline) => Ballot::Lifeline(lifeline),
                None => {
                    return SubmitOutcome::Rejected(HubError::MalformedPayload(
                        "not a lifeline token".to_string(),
                    ))
                }
            },
            RoundKind::ModAssist => return self.relay_mod_response(identity, event),
        };

        let Some(round) = self.game.round.as_mut() else {
            return SubmitOutcome::Rejected(HubError::InvalidPhaseAction(
                "no round is accepting votes".to_string(),
            ));
        };
        let generation = round.generation;
        match round.record(identity.clone(), ballot) {
            Ok(()) => {
                tracing::debug!(generation, voter = %identity, %ballot, "Vote accepted");
                self.votes_dirty = true;
                SubmitOutcome::Accepted
            }
            Err(HubError::DuplicateVote) => {
                tracing::debug!(generation, voter = %identity, "Duplicate vote dropped");
                SubmitOutcome::Duplicate
            }
            Err(err) => SubmitOutcome::Rejected(err),
        }
    }

    fn relay_mod_response(&mut self, identity: Identity, event: &ChatEvent) -> SubmitOutcome {
        if !self.game.moderators.contains(&identity) {
            return SubmitOutcome::Rejected(HubError::InvalidPhaseAction(
                "only moderators answer during ask-a-mod".to_string(),
            ));
        }
        if self.game.mod_responses.len() >= MAX_MOD_RESPONSES {
            return SubmitOutcome::Rejected(HubError::InvalidPhaseAction(
                "moderator response limit reached".to_string(),
            ));
        }

        let response = ModResponse {
            username: identity,
            text: event.text.trim().to_string(),
            timestamp: event.timestamp.to_rfc3339(),
        };
        tracing::info!(moderator = %response.username, "Moderator response relayed");
        self.game.mod_responses.push(response.clone());
        self.emit(ServerMessage::ModResponse {
            timestamp: crate::protocol::now_rfc3339(),
            response,
        });
        self.touch();
        SubmitOutcome::Relayed
    }
}
