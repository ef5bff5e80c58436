//! Authoritative game state and the phase machine that mutates it.
//!
//! `PhaseMachine` is owned by the hub worker and is only ever touched from
//! that one task. Every method that changes state records the events to push
//! (drained with [`PhaseMachine::take_events`]) and marks the broadcast state
//! dirty.

mod export;
mod game;
mod lifeline;
mod round;
mod vote;

pub use export::{load_snapshot, save_snapshot, HubSnapshot, SNAPSHOT_SCHEMA_VERSION};
pub use game::GameState;
pub use round::{EndCause, RoundOutcome, VoterSet, VotingRound};
pub use vote::SubmitOutcome;

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;

use crate::config::RoundDurations;
use crate::error::{HubError, HubResult};
use crate::protocol::ServerMessage;
use crate::types::*;

pub type TimerId = u64;

/// Schedules round timeouts. Implementations deliver the timeout back to the
/// hub as a command carrying the generation it was scheduled for.
pub trait Scheduler: Send {
    fn schedule_round_timeout(&mut self, generation: u64, after: Duration) -> TimerId;
    /// Must be synchronous: once it returns the timer will not be delivered,
    /// or will be delivered and discarded as stale.
    fn cancel(&mut self, id: TimerId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingTimer {
    id: TimerId,
    generation: u64,
}

pub struct PhaseMachine {
    game: GameState,
    durations: RoundDurations,
    scheduler: Box<dyn Scheduler>,
    pending: Option<PendingTimer>,
    rng: StdRng,
    events: Vec<ServerMessage>,
    /// Full state needs pushing
    dirty: bool,
    /// Only the tally changed (coalesced by the vote broadcaster)
    votes_dirty: bool,
    snapshot_due: bool,
}

impl PhaseMachine {
    pub fn new(durations: RoundDurations, scheduler: Box<dyn Scheduler>) -> Self {
        Self::with_rng(durations, scheduler, StdRng::from_os_rng())
    }

    pub fn with_rng(durations: RoundDurations, scheduler: Box<dyn Scheduler>, rng: StdRng) -> Self {
        Self {
            game: GameState::default(),
            durations,
            scheduler,
            pending: None,
            rng,
            events: Vec::new(),
            dirty: false,
            votes_dirty: false,
            snapshot_due: false,
        }
    }

    pub fn game(&self) -> &GameState {
        &self.game
    }

    #[cfg(test)]
    pub(crate) fn game_mut(&mut self) -> &mut GameState {
        &mut self.game
    }

    /// Drain events in the order they were emitted
    pub fn take_events(&mut self) -> Vec<ServerMessage> {
        std::mem::take(&mut self.events)
    }

    pub fn take_dirty(&mut self) -> bool {
        let dirty = self.dirty;
        self.dirty = false;
        if dirty {
            // A full push carries the tally too
            self.votes_dirty = false;
        }
        dirty
    }

    pub fn take_votes_dirty(&mut self) -> bool {
        std::mem::take(&mut self.votes_dirty)
    }

    pub fn take_snapshot_due(&mut self) -> bool {
        std::mem::take(&mut self.snapshot_due)
    }

    fn emit(&mut self, event: ServerMessage) {
        self.events.push(event);
    }

    fn touch(&mut self) {
        self.game.version += 1;
        self.dirty = true;
    }

    /// Check the structural invariants of the game state
    pub fn check_invariants(&self) -> HubResult<()> {
        let game = &self.game;
        let violation = |msg: String| Err(HubError::InvariantViolation(msg));

        match &game.round {
            Some(round) => {
                if round.kind.phase() != game.phase {
                    return violation(format!(
                        "round kind {:?} does not match phase {:?}",
                        round.kind, game.phase
                    ));
                }
                if round.generation != game.generation {
                    return violation(format!(
                        "round generation {} behind live generation {}",
                        round.generation, game.generation
                    ));
                }
                let counted: u32 = round.tally.values().sum();
                if counted as usize != round.voters.len() {
                    return violation(format!(
                        "{} counted votes for {} voters",
                        counted,
                        round.voters.len()
                    ));
                }
                for (ballot, count) in &round.tally {
                    if let Ballot::Answer(option) = ballot {
                        if game.excluded.contains(option) && *count > 0 {
                            return violation(format!("votes counted for excluded option {}", option));
                        }
                    }
                }
                if self.pending.map(|p| p.generation) != Some(round.generation) {
                    return violation(format!(
                        "pending timer does not target round generation {}",
                        round.generation
                    ));
                }
            }
            None => {
                if matches!(
                    game.phase,
                    GamePhase::Poll | GamePhase::Revote | GamePhase::LifelineVote | GamePhase::ModAssist
                ) {
                    return violation(format!("phase {:?} without an active round", game.phase));
                }
                if self.pending.is_some() {
                    return violation("timer pending without an active round".to_string());
                }
            }
        }

        if let Some(kind) = game
            .lifelines
            .used
            .intersection(&game.lifelines.available_for_vote)
            .next()
        {
            return violation(format!("lifeline {} is both used and available", kind));
        }

        match &game.question {
            Some(question) if game.excluded.contains(&question.correct) => {
                violation("the correct answer was excluded".to_string())
            }
            None if game.phase != GamePhase::Idle => {
                violation(format!("phase {:?} without a question", game.phase))
            }
            _ => Ok(()),
        }
    }

    /// Validate after a mutation; on violation reset in-flight round state
    /// and report it. Returns false if a reset happened.
    pub fn enforce_invariants(&mut self) -> bool {
        match self.check_invariants() {
            Ok(()) => true,
            Err(err) => {
                self.recover(err);
                false
            }
        }
    }

    fn recover(&mut self, violation: HubError) {
        tracing::error!(
            generation = self.game.generation,
            phase = ?self.game.phase,
            "{}, resetting round state to idle",
            violation
        );

        self.cancel_pending_timer();
        self.game.round = None;
        self.game.phase = GamePhase::Idle;
        self.game.locked_answer = None;
        self.game.reveal = None;

        let used = self.game.lifelines.used.clone();
        self.game
            .lifelines
            .available_for_vote
            .retain(|kind| !used.contains(kind));
        if let Some(correct) = self.game.question.as_ref().map(|q| q.correct) {
            self.game.excluded.remove(&correct);
        }

        self.emit(ServerMessage::diagnostic(violation.code(), violation.to_string()));
        self.touch();
    }
}

/// Deterministic scheduler for tests: timers are recorded, never fired.
#[cfg(test)]
pub(crate) mod testing {
    use super::{Scheduler, TimerId};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct ScheduledTimer {
        pub id: TimerId,
        pub generation: u64,
        pub after: Duration,
        pub cancelled: bool,
    }

    #[derive(Debug, Default)]
    struct Timers {
        next_id: TimerId,
        scheduled: Vec<ScheduledTimer>,
    }

    /// Cloneable so a test can keep a handle after boxing it into the machine
    #[derive(Debug, Clone, Default)]
    pub struct ManualScheduler {
        timers: Arc<Mutex<Timers>>,
    }

    impl ManualScheduler {
        pub fn scheduled(&self) -> Vec<ScheduledTimer> {
            self.timers.lock().unwrap().scheduled.clone()
        }

        pub fn live(&self) -> Vec<ScheduledTimer> {
            self.scheduled().into_iter().filter(|t| !t.cancelled).collect()
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule_round_timeout(&mut self, generation: u64, after: Duration) -> TimerId {
            let mut timers = self.timers.lock().unwrap();
            timers.next_id += 1;
            let id = timers.next_id;
            timers.scheduled.push(ScheduledTimer {
                id,
                generation,
                after,
                cancelled: false,
            });
            id
        }

        fn cancel(&mut self, id: TimerId) {
            let mut timers = self.timers.lock().unwrap();
            if let Some(timer) = timers.scheduled.iter_mut().find(|t| t.id == id) {
                timer.cancelled = true;
            }
        }
    }
}
