use rand::seq::IndexedRandom;

use super::{EndCause, PhaseMachine};
use crate::error::{HubError, HubResult};
use crate::protocol::{now_rfc3339, ServerMessage};
use crate::types::*;

impl PhaseMachine {
    /// Open an audience vote over the remaining lifelines. Only after a
    /// wrong reveal.
    pub fn start_lifeline_vote(
        &mut self,
        duration_ms: Option<u64>,
        allow_manual_override: bool,
    ) -> HubResult<u64> {
        if !self.game.lifeline_window_open() {
            return Err(HubError::InvalidPhaseAction(
                "lifeline voting needs a wrong reveal and a remaining lifeline".to_string(),
            ));
        }
        self.game.revote_override = allow_manual_override;
        let duration = self.round_duration(RoundKind::LifelineVote, duration_ms);
        Ok(self.start_round(RoundKind::LifelineVote, duration, allow_manual_override))
    }

    /// Host picks a lifeline: right after a wrong reveal, to settle a
    /// lifeline-vote tie, or to cut short a lifeline vote that allows it
    pub fn host_activate_lifeline(&mut self, lifeline: LifelineKind) -> HubResult<()> {
        if !self.game.lifelines.available_for_vote.contains(&lifeline) {
            return Err(HubError::LifelineUnavailable(lifeline));
        }

        match self.game.phase {
            GamePhase::LifelineVote => {
                let Some(round) = self.game.round.as_ref() else {
                    return Err(HubError::InvalidPhaseAction("no round is running".to_string()));
                };
                if !round.allow_manual_override {
                    return Err(HubError::InvalidPhaseAction(
                        "this round does not allow manual override".to_string(),
                    ));
                }
                let generation = round.generation;
                self.end_round(generation, EndCause::HostLock(Ballot::Lifeline(lifeline)))?;
                Ok(())
            }
            GamePhase::AwaitingLifeline => self.activate_lifeline(lifeline, true),
            GamePhase::Reveal if self.game.lifeline_window_open() => {
                self.game.revote_override = true;
                self.activate_lifeline(lifeline, true)
            }
            phase => Err(HubError::InvalidPhaseAction(format!(
                "cannot activate a lifeline during {:?}",
                phase
            ))),
        }
    }

    /// Spend a lifeline and start the round it leads to. The lifeline is
    /// only marked used once this succeeds.
    pub(super) fn activate_lifeline(&mut self, lifeline: LifelineKind, by_host: bool) -> HubResult<()> {
        let lifelines = &self.game.lifelines;
        if lifelines.used.contains(&lifeline) || !lifelines.available_for_vote.contains(&lifeline) {
            return Err(HubError::LifelineUnavailable(lifeline));
        }
        if self.game.question.is_none() {
            return Err(HubError::InvalidPhaseAction("no question is shown".to_string()));
        }

        self.game.lifelines.available_for_vote.remove(&lifeline);
        self.game.lifelines.used.insert(lifeline);
        tracing::info!(%lifeline, by_host, "Lifeline activated");
        self.emit(ServerMessage::LifelineActivated {
            timestamp: now_rfc3339(),
            lifeline,
            by_host,
        });
        self.snapshot_due = true;

        match lifeline {
            LifelineKind::FiftyFifty => {
                self.apply_fifty_fifty();
                self.start_revote();
            }
            LifelineKind::TakeAnotherVote => self.start_revote(),
            LifelineKind::AskAMod => {
                self.game.mod_responses.clear();
                let duration = self.durations.mod_assist;
                let allow = self.game.revote_override;
                self.start_round(RoundKind::ModAssist, duration, allow);
            }
        }
        Ok(())
    }

    /// Exclude random wrong options until two remain
    fn apply_fifty_fifty(&mut self) {
        let Some(correct) = self.game.question.as_ref().map(|q| q.correct) else {
            return;
        };

        let mut removed = Vec::new();
        while self.game.available_options().len() > 2 {
            let wrong: Vec<AnswerOption> = self
                .game
                .available_options()
                .into_iter()
                .filter(|option| *option != correct)
                .collect();
            let Some(option) = wrong.choose(&mut self.rng).copied() else {
                break;
            };
            self.game.excluded.insert(option);
            removed.push(option);
        }

        let remaining = self.game.available_options();
        tracing::info!(?removed, ?remaining, "Fifty-fifty applied");
        self.emit(ServerMessage::FiftyFiftyApplied {
            timestamp: now_rfc3339(),
            removed,
            remaining,
        });
    }

    pub(super) fn start_revote(&mut self) {
        let duration = self.durations.revote;
        let allow = self.game.revote_override;
        self.start_round(RoundKind::Revote, duration, allow);
    }
}
