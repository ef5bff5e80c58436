//! Host-only command handlers
//!
//! All handlers in this module require the Host role.
//! Authorization is checked in the main dispatch layer before calling these.
//! A successful command replies nothing: its effect reaches every client,
//! the host included, through the next state push.

use crate::error::HubResult;
use crate::hub::Hub;
use crate::protocol::ServerMessage;
use crate::types::{AnswerOption, LifelineKind, Question};

fn reply_on_error<T>(action: &str, result: HubResult<T>) -> Option<ServerMessage> {
    match result {
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Host {} refused: {}", action, e);
            Some(ServerMessage::error(&e))
        }
    }
}

pub fn handle_show_question(hub: &mut Hub, question: Question) -> Option<ServerMessage> {
    reply_on_error("show question", hub.machine.show_question(question))
}

pub fn handle_start_poll(
    hub: &mut Hub,
    duration_ms: Option<u64>,
    allow_manual_override: bool,
) -> Option<ServerMessage> {
    tracing::info!(?duration_ms, allow_manual_override, "Host starting poll");
    reply_on_error(
        "start poll",
        hub.machine.start_poll(duration_ms, allow_manual_override),
    )
}

pub fn handle_lock_answer(hub: &mut Hub, option: AnswerOption) -> Option<ServerMessage> {
    tracing::info!(%option, "Host locking answer");
    reply_on_error("lock answer", hub.machine.host_lock_answer(option))
}

pub fn handle_start_lifeline_vote(
    hub: &mut Hub,
    duration_ms: Option<u64>,
    allow_manual_override: bool,
) -> Option<ServerMessage> {
    tracing::info!(?duration_ms, allow_manual_override, "Host starting lifeline vote");
    reply_on_error(
        "start lifeline vote",
        hub.machine
            .start_lifeline_vote(duration_ms, allow_manual_override),
    )
}

pub fn handle_activate_lifeline(hub: &mut Hub, lifeline: LifelineKind) -> Option<ServerMessage> {
    tracing::info!(%lifeline, "Host activating lifeline");
    reply_on_error(
        "activate lifeline",
        hub.machine.host_activate_lifeline(lifeline),
    )
}

pub fn handle_end_round(hub: &mut Hub) -> Option<ServerMessage> {
    tracing::info!("Host ending round");
    reply_on_error("end round", hub.machine.host_end_round())
}

pub fn handle_set_moderators(hub: &mut Hub, usernames: Vec<String>) -> Option<ServerMessage> {
    hub.machine.set_moderators(usernames);
    None
}

pub fn handle_reset_game(hub: &mut Hub) -> Option<ServerMessage> {
    tracing::info!("Host resetting game");
    hub.machine.reset_game();
    None
}
