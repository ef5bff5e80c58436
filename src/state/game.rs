use std::collections::{BTreeMap, BTreeSet};

use super::{PhaseMachine, VotingRound};
use crate::error::{HubError, HubResult};
use crate::protocol::{GameStateView, ModResponse, RevealInfo, RoundReport, ServerMessage};
use crate::types::*;

/// The single authoritative game state
#[derive(Debug, Clone, Default)]
pub struct GameState {
    pub version: u64,
    pub phase: GamePhase,
    /// Generation of the most recently started round; never reused
    pub generation: u64,
    pub question_no: u32,
    pub question: Option<Question>,
    pub round: Option<VotingRound>,
    /// Options ruled out for the current question, only ever grows
    pub excluded: BTreeSet<AnswerOption>,
    pub lifelines: LifelineState,
    pub locked_answer: Option<AnswerOption>,
    pub reveal: Option<RevealInfo>,
    pub last_result: Option<RoundReport>,
    pub mod_responses: Vec<ModResponse>,
    pub moderators: BTreeSet<Identity>,
    pub chat_links: BTreeMap<String, LinkState>,
    /// Override flag for the revote a lifeline leads to
    pub revote_override: bool,
}

impl GameState {
    pub fn available_options(&self) -> Vec<AnswerOption> {
        AnswerOption::ALL
            .into_iter()
            .filter(|option| !self.excluded.contains(option))
            .collect()
    }

    /// Ballots a new round of `kind` accepts
    pub fn ballots_for(&self, kind: RoundKind) -> Vec<Ballot> {
        match kind {
            RoundKind::Poll | RoundKind::Revote => self
                .available_options()
                .into_iter()
                .map(Ballot::Answer)
                .collect(),
            RoundKind::LifelineVote => self
                .lifelines
                .available_for_vote
                .iter()
                .copied()
                .map(Ballot::Lifeline)
                .collect(),
            RoundKind::ModAssist => Vec::new(),
        }
    }

    pub fn has_active_round(&self) -> bool {
        self.round.is_some()
    }

    /// Last reveal was wrong and the audience may still use a lifeline
    pub fn lifeline_window_open(&self) -> bool {
        self.phase == GamePhase::Reveal
            && self.reveal.map(|r| !r.is_correct).unwrap_or(false)
            && !self.lifelines.available_for_vote.is_empty()
    }
}

impl PhaseMachine {
    /// Make `question` current. Clears per-question state.
    pub fn show_question(&mut self, question: Question) -> HubResult<()> {
        if self.game.has_active_round() {
            return Err(HubError::InvalidPhaseAction(
                "cannot change question while a round is running".to_string(),
            ));
        }

        self.game.question_no += 1;
        tracing::info!(
            question_no = self.game.question_no,
            question = %question.id,
            "Showing question"
        );
        self.game.question = Some(question);
        self.game.excluded.clear();
        self.game.locked_answer = None;
        self.game.reveal = None;
        self.game.last_result = None;
        self.game.mod_responses.clear();
        self.game.revote_override = false;
        self.game.phase = GamePhase::Idle;
        self.touch();
        Ok(())
    }

    pub fn start_poll(&mut self, duration_ms: Option<u64>, allow_manual_override: bool) -> HubResult<u64> {
        if self.game.question.is_none() {
            return Err(HubError::InvalidPhaseAction("no question is shown".to_string()));
        }
        if self.game.phase != GamePhase::Idle {
            return Err(HubError::InvalidPhaseAction(format!(
                "cannot start a poll during {:?}",
                self.game.phase
            )));
        }
        let duration = self.round_duration(RoundKind::Poll, duration_ms);
        Ok(self.start_round(RoundKind::Poll, duration, allow_manual_override))
    }

    /// Lock an answer. Ends a running poll/revote that allows manual
    /// override, or settles a tie.
    pub fn host_lock_answer(&mut self, option: AnswerOption) -> HubResult<()> {
        if self.game.question.is_none() {
            return Err(HubError::InvalidPhaseAction("no question is shown".to_string()));
        }
        if self.game.excluded.contains(&option) {
            return Err(HubError::ExcludedOption(option));
        }

        match self.game.phase {
            GamePhase::Poll | GamePhase::Revote => {
                let Some(round) = self.game.round.as_ref() else {
                    return Err(HubError::InvalidPhaseAction("no round is running".to_string()));
                };
                if !round.allow_manual_override {
                    return Err(HubError::InvalidPhaseAction(
                        "this round does not allow manual override".to_string(),
                    ));
                }
                let generation = round.generation;
                self.end_round(generation, super::EndCause::HostLock(Ballot::Answer(option)))?;
                Ok(())
            }
            GamePhase::AwaitingAnswer => {
                self.lock_and_reveal(option);
                Ok(())
            }
            phase => Err(HubError::InvalidPhaseAction(format!(
                "cannot lock an answer during {:?}",
                phase
            ))),
        }
    }

    /// End the running round now, resolved as if its timer fired
    pub fn host_end_round(&mut self) -> HubResult<()> {
        let Some(round) = self.game.round.as_ref() else {
            return Err(HubError::InvalidPhaseAction("no round is running".to_string()));
        };
        if !round.allow_manual_override {
            return Err(HubError::InvalidPhaseAction(
                "this round does not allow manual override".to_string(),
            ));
        }
        let generation = round.generation;
        self.end_round(generation, super::EndCause::HostEnd)?;
        Ok(())
    }

    pub(super) fn lock_and_reveal(&mut self, option: AnswerOption) {
        let Some(correct) = self.game.question.as_ref().map(|q| q.correct) else {
            return;
        };
        let reveal = RevealInfo {
            locked: option,
            correct,
            is_correct: option == correct,
        };

        self.game.locked_answer = Some(option);
        self.game.reveal = Some(reveal);
        if !reveal.is_correct {
            self.game.excluded.insert(option);
        }
        self.game.phase = GamePhase::Reveal;

        tracing::info!(
            locked = %option,
            correct = %correct,
            is_correct = reveal.is_correct,
            "Answer revealed"
        );
        self.emit(ServerMessage::AnswerRevealed {
            timestamp: crate::protocol::now_rfc3339(),
            reveal,
        });
        self.snapshot_due = true;
        self.touch();
    }

    /// Replace the moderator list. Empty names are skipped.
    pub fn set_moderators(&mut self, usernames: Vec<String>) {
        self.game.moderators = usernames
            .iter()
            .filter_map(|name| Identity::normalize(name))
            .collect();
        tracing::info!(count = self.game.moderators.len(), "Moderator list updated");
        self.snapshot_due = true;
        self.touch();
    }

    pub fn set_link_status(&mut self, platform: &str, status: LinkState) {
        if self.game.chat_links.get(platform) == Some(&status) {
            return;
        }
        self.game
            .chat_links
            .insert(platform.to_string(), status.clone());
        self.emit(ServerMessage::ChatConnectionStatus {
            timestamp: crate::protocol::now_rfc3339(),
            platform: platform.to_string(),
            status,
        });
        self.touch();
    }

    /// Start a new game. Moderators and link status survive.
    pub fn reset_game(&mut self) {
        self.cancel_pending_timer();
        let previous = std::mem::take(&mut self.game);
        self.game = GameState {
            version: previous.version,
            generation: previous.generation,
            moderators: previous.moderators,
            chat_links: previous.chat_links,
            ..GameState::default()
        };
        tracing::info!("Game reset");
        self.snapshot_due = true;
        self.touch();
    }

    /// Broadcast view; the correct answer only appears after the reveal
    pub fn view(&self, connections: ConnectionCounts) -> GameStateView {
        let game = &self.game;
        GameStateView {
            version: game.version,
            phase: game.phase,
            generation: game.generation,
            question_no: game.question_no,
            question: game.question.as_ref().map(PublicQuestion::from),
            round: game.round.as_ref().map(VotingRound::view),
            excluded_options: game.excluded.iter().copied().collect(),
            available_options: game.available_options(),
            lifelines: game.lifelines.clone(),
            locked_answer: game.locked_answer,
            reveal: game.reveal,
            last_result: game.last_result.clone(),
            mod_responses: game.mod_responses.clone(),
            moderators: game.moderators.iter().cloned().collect(),
            chat_links: game.chat_links.clone(),
            connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::ManualScheduler;
    use super::*;
    use crate::config::RoundDurations;

    fn machine() -> PhaseMachine {
        PhaseMachine::new(RoundDurations::default(), Box::new(ManualScheduler::default()))
    }

    fn question() -> Question {
        Question {
            id: "q".to_string(),
            text: "2 + 2?".to_string(),
            options: ["3".into(), "4".into(), "5".into(), "22".into()],
            correct: AnswerOption::B,
        }
    }

    #[test]
    fn test_view_hides_correct_answer_before_reveal() {
        let mut machine = machine();
        machine.show_question(question()).unwrap();

        let json = serde_json::to_value(machine.view(ConnectionCounts::default())).unwrap();
        assert!(json["question"].get("correct").is_none());
        assert!(json["reveal"].is_null());
        assert_eq!(json["phase"], "idle");
        assert_eq!(json["available_options"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_view_shows_reveal_afterwards() {
        let mut machine = machine();
        machine.show_question(question()).unwrap();
        machine.start_poll(None, true).unwrap();
        machine.host_lock_answer(AnswerOption::C).unwrap();

        let json = serde_json::to_value(machine.view(ConnectionCounts::default())).unwrap();
        assert_eq!(json["reveal"]["correct"], "B");
        assert_eq!(json["reveal"]["is_correct"], false);
        assert_eq!(json["excluded_options"], serde_json::json!(["C"]));
    }

    #[test]
    fn test_start_poll_needs_question() {
        let mut machine = machine();
        assert!(matches!(
            machine.start_poll(None, false),
            Err(HubError::InvalidPhaseAction(_))
        ));
    }

    #[test]
    fn test_lock_excluded_option_is_rejected() {
        let mut machine = machine();
        machine.show_question(question()).unwrap();
        machine.start_poll(None, true).unwrap();
        machine.host_lock_answer(AnswerOption::A).unwrap();
        assert_eq!(
            machine.host_lock_answer(AnswerOption::A),
            Err(HubError::ExcludedOption(AnswerOption::A))
        );
    }

    #[test]
    fn test_link_status_emits_only_on_change() {
        let mut machine = machine();
        machine.set_link_status("twitch", LinkState::Connected);
        machine.set_link_status("twitch", LinkState::Connected);
        let events = machine.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            machine.game().chat_links.get("twitch"),
            Some(&LinkState::Connected)
        );
    }
}
