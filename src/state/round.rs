use chrono::{DateTime, TimeDelta, Utc};
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use super::{PendingTimer, PhaseMachine};
use crate::config::RoundDurations;
use crate::error::{HubError, HubResult};
use crate::protocol::{RoundInfo, RoundReport, RoundView, ServerMessage};
use crate::types::*;

/// Identities that already voted in one round. Built fresh for every round.
#[derive(Debug, Clone, Default)]
pub struct VoterSet(HashSet<Identity>);

impl VoterSet {
    /// False if the identity already voted
    pub fn insert(&mut self, identity: Identity) -> bool {
        self.0.insert(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.0.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Strictly the most votes
    Winner { choice: Ballot },
    /// Leading ballots are level; the host decides
    Tie { choices: Vec<Ballot> },
    /// Nobody voted; picked uniformly among the round's ballots
    #[serde(rename = "no-votes")]
    NoVotes { choice: Ballot },
    HostLocked { choice: Ballot },
    /// Ask-a-mod rounds have nothing to decide
    Completed,
}

impl RoundOutcome {
    pub fn decided(&self) -> Option<Ballot> {
        match self {
            RoundOutcome::Winner { choice }
            | RoundOutcome::NoVotes { choice }
            | RoundOutcome::HostLocked { choice } => Some(*choice),
            RoundOutcome::Tie { .. } | RoundOutcome::Completed => None,
        }
    }
}

/// What ended a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
    Timeout,
    HostLock(Ballot),
    /// Host ended early; resolved exactly like a timeout
    HostEnd,
}

#[derive(Debug, Clone)]
pub struct VotingRound {
    pub generation: u64,
    pub kind: RoundKind,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub allow_manual_override: bool,
    pub voters: VoterSet,
    /// One entry per ballot the round accepts, zero-initialised
    pub tally: BTreeMap<Ballot, u32>,
}

impl VotingRound {
    pub fn new(
        generation: u64,
        kind: RoundKind,
        duration: Duration,
        allow_manual_override: bool,
        ballots: impl IntoIterator<Item = Ballot>,
    ) -> Self {
        Self {
            generation,
            kind,
            started_at: Utc::now(),
            duration,
            allow_manual_override,
            voters: VoterSet::default(),
            tally: ballots.into_iter().map(|b| (b, 0)).collect(),
        }
    }

    pub fn accepts(&self, ballot: &Ballot) -> bool {
        self.tally.contains_key(ballot)
    }

    /// Fold a vote into the tally, first vote wins
    pub fn record(&mut self, identity: Identity, ballot: Ballot) -> HubResult<()> {
        let Some(count) = self.tally.get_mut(&ballot) else {
            return Err(match ballot {
                Ballot::Answer(option) => HubError::ExcludedOption(option),
                Ballot::Lifeline(kind) => HubError::LifelineUnavailable(kind),
            });
        };
        if !self.voters.insert(identity) {
            return Err(HubError::DuplicateVote);
        }
        *count += 1;
        Ok(())
    }

    pub fn total_votes(&self) -> u32 {
        self.tally.values().sum()
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.started_at + TimeDelta::from_std(self.duration).unwrap_or(TimeDelta::zero())
    }

    pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R) -> RoundOutcome {
        if self.kind == RoundKind::ModAssist || self.tally.is_empty() {
            return RoundOutcome::Completed;
        }

        let top = self.tally.values().copied().max().unwrap_or(0);
        if top == 0 {
            let ballots: Vec<Ballot> = self.tally.keys().copied().collect();
            return match ballots.choose(rng) {
                Some(choice) => RoundOutcome::NoVotes { choice: *choice },
                None => RoundOutcome::Completed,
            };
        }

        let leaders: Vec<Ballot> = self
            .tally
            .iter()
            .filter(|(_, count)| **count == top)
            .map(|(ballot, _)| *ballot)
            .collect();
        match leaders.as_slice() {
            [only] => RoundOutcome::Winner { choice: *only },
            _ => RoundOutcome::Tie { choices: leaders },
        }
    }

    fn tally_view(&self) -> BTreeMap<String, u32> {
        self.tally
            .iter()
            .map(|(ballot, count)| (ballot.to_string(), *count))
            .collect()
    }

    pub fn info(&self) -> RoundInfo {
        RoundInfo {
            kind: self.kind,
            generation: self.generation,
            started_at: self.started_at.to_rfc3339(),
            duration_ms: self.duration.as_millis() as u64,
            deadline: self.deadline().to_rfc3339(),
            allow_manual_override: self.allow_manual_override,
            options: self.tally.keys().copied().collect(),
        }
    }

    pub fn view(&self) -> RoundView {
        RoundView {
            info: self.info(),
            tally: self.tally_view(),
            voter_count: self.voters.len(),
        }
    }

    pub fn report(&self, outcome: &RoundOutcome) -> RoundReport {
        RoundReport {
            kind: self.kind,
            generation: self.generation,
            tally: self.tally_view(),
            total_votes: self.total_votes(),
            outcome: outcome.clone(),
        }
    }
}

impl PhaseMachine {
    /// Duration for a new round: the host's request clamped into range, or
    /// the configured default for the kind
    pub(super) fn round_duration(&self, kind: RoundKind, requested_ms: Option<u64>) -> Duration {
        requested_ms
            .map(|ms| RoundDurations::clamp(Duration::from_millis(ms)))
            .unwrap_or_else(|| self.durations.for_kind(kind))
    }

    /// Open a new round. Bumps the generation, starts with an empty voter
    /// set and tally, and schedules a timeout bound to the new generation.
    pub(super) fn start_round(
        &mut self,
        kind: RoundKind,
        duration: Duration,
        allow_manual_override: bool,
    ) -> u64 {
        self.cancel_pending_timer();

        self.game.generation += 1;
        let generation = self.game.generation;
        let round = VotingRound::new(
            generation,
            kind,
            duration,
            allow_manual_override,
            self.game.ballots_for(kind),
        );
        let info = round.info();
        self.game.round = Some(round);
        self.game.phase = kind.phase();

        let id = self.scheduler.schedule_round_timeout(generation, duration);
        self.pending = Some(PendingTimer { id, generation });

        tracing::info!(
            generation,
            kind = ?kind,
            duration_ms = duration.as_millis() as u64,
            allow_manual_override,
            "Round started"
        );

        let moderators = self.game.moderators.iter().cloned().collect();
        self.emit(ServerMessage::round_started(info, moderators));
        self.touch();
        generation
    }

    pub(super) fn cancel_pending_timer(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.scheduler.cancel(pending.id);
        }
    }

    /// End the live round. A no-op returning `StaleRoundTimer` unless
    /// `generation` is the live round's generation.
    pub fn end_round(&mut self, generation: u64, cause: EndCause) -> HubResult<RoundOutcome> {
        let live = self.game.round.as_ref().map(|r| r.generation);
        if live != Some(generation) {
            return Err(HubError::StaleRoundTimer {
                fired: generation,
                live: self.game.generation,
            });
        }

        // Neutralise the timer before anything else can observe the round
        self.cancel_pending_timer();
        let Some(round) = self.game.round.take() else {
            return Err(HubError::StaleRoundTimer {
                fired: generation,
                live: self.game.generation,
            });
        };

        let outcome = match cause {
            EndCause::Timeout | EndCause::HostEnd => round.resolve(&mut self.rng),
            EndCause::HostLock(choice) => RoundOutcome::HostLocked { choice },
        };
        let report = round.report(&outcome);

        tracing::info!(
            generation,
            kind = ?round.kind,
            cause = ?cause,
            outcome = ?outcome,
            total_votes = report.total_votes,
            "Round ended"
        );

        self.game.last_result = Some(report.clone());
        let responses = if round.kind == RoundKind::ModAssist {
            self.game.mod_responses.clone()
        } else {
            Vec::new()
        };
        self.emit(ServerMessage::round_ended(report, responses));
        self.touch();

        self.after_round(round.kind, &outcome);
        Ok(outcome)
    }

    /// Timer delivery from the scheduler
    pub fn on_round_timeout(&mut self, generation: u64) -> HubResult<RoundOutcome> {
        match self.end_round(generation, EndCause::Timeout) {
            Err(err @ HubError::StaleRoundTimer { .. }) => {
                tracing::debug!("Discarding round timer: {}", err);
                Err(err)
            }
            other => other,
        }
    }

    fn after_round(&mut self, kind: RoundKind, outcome: &RoundOutcome) {
        match (kind, outcome.decided()) {
            (RoundKind::Poll | RoundKind::Revote, Some(Ballot::Answer(option))) => {
                self.lock_and_reveal(option)
            }
            (RoundKind::Poll | RoundKind::Revote, _) => {
                self.game.phase = GamePhase::AwaitingAnswer;
            }
            (RoundKind::LifelineVote, Some(Ballot::Lifeline(lifeline))) => {
                if let Err(err) = self.activate_lifeline(lifeline, false) {
                    tracing::warn!("Lifeline vote winner could not be activated: {}", err);
                    self.game.phase = GamePhase::AwaitingLifeline;
                }
            }
            (RoundKind::LifelineVote, _) => {
                self.game.phase = GamePhase::AwaitingLifeline;
            }
            (RoundKind::ModAssist, _) => self.start_revote(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn answer_round() -> VotingRound {
        VotingRound::new(
            1,
            RoundKind::Poll,
            Duration::from_secs(60),
            false,
            AnswerOption::ALL.into_iter().map(Ballot::Answer),
        )
    }

    fn voter(name: &str) -> Identity {
        Identity::normalize(name).unwrap()
    }

    #[test]
    fn test_first_vote_wins() {
        let mut round = answer_round();
        assert!(round.record(voter("u1"), Ballot::Answer(AnswerOption::A)).is_ok());
        assert_eq!(
            round.record(voter("U1"), Ballot::Answer(AnswerOption::B)),
            Err(HubError::DuplicateVote)
        );
        assert_eq!(round.tally[&Ballot::Answer(AnswerOption::A)], 1);
        assert_eq!(round.tally[&Ballot::Answer(AnswerOption::B)], 0);
        assert_eq!(round.total_votes(), 1);
    }

    #[test]
    fn test_ballot_outside_round_is_rejected() {
        let mut round = VotingRound::new(
            1,
            RoundKind::Revote,
            Duration::from_secs(45),
            false,
            [AnswerOption::B, AnswerOption::C].map(Ballot::Answer),
        );
        assert_eq!(
            round.record(voter("u1"), Ballot::Answer(AnswerOption::A)),
            Err(HubError::ExcludedOption(AnswerOption::A))
        );
        assert!(round.voters.is_empty());
    }

    #[test]
    fn test_tie_of_three_and_three() {
        let mut round = answer_round();
        for i in 0..3 {
            round
                .record(voter(&format!("a{}", i)), Ballot::Answer(AnswerOption::B))
                .unwrap();
            round
                .record(voter(&format!("c{}", i)), Ballot::Answer(AnswerOption::C))
                .unwrap();
        }
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            round.resolve(&mut rng),
            RoundOutcome::Tie {
                choices: vec![Ballot::Answer(AnswerOption::B), Ballot::Answer(AnswerOption::C)]
            }
        );
    }

    #[test]
    fn test_zero_vote_fallback_is_uniform() {
        let round = answer_round();
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts: HashMap<Ballot, u32> = HashMap::new();
        let trials = 8_000;

        for _ in 0..trials {
            match round.resolve(&mut rng) {
                RoundOutcome::NoVotes { choice } => *counts.entry(choice).or_insert(0) += 1,
                other => panic!("Expected no-votes outcome, got {:?}", other),
            }
        }

        assert_eq!(counts.len(), 4);
        for (ballot, count) in counts {
            // Expected 2000 each; allow a generous band
            assert!(
                (1_700..=2_300).contains(&count),
                "{} picked {} times",
                ballot,
                count
            );
        }
    }

    #[test]
    fn test_mod_assist_round_has_nothing_to_decide() {
        let round = VotingRound::new(3, RoundKind::ModAssist, Duration::from_secs(60), true, []);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(round.resolve(&mut rng), RoundOutcome::Completed);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(RoundOutcome::NoVotes {
            choice: Ballot::Answer(AnswerOption::D),
        })
        .unwrap();
        assert_eq!(json["result"], "no-votes");
        assert_eq!(json["choice"], "D");

        let json = serde_json::to_value(RoundOutcome::Tie { choices: vec![] }).unwrap();
        assert_eq!(json["result"], "tie");
    }

    #[test]
    fn test_round_info_lists_ballots() {
        let round = answer_round();
        let info = round.info();
        assert_eq!(info.options.len(), 4);
        assert_eq!(info.duration_ms, 60_000);
        assert!(round.deadline() > round.started_at);
    }
}
