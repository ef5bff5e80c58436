//! WebSocket message dispatch
//!
//! Runs inside the hub task. Registration and authorization are checked
//! here, then messages go to the role-specific handler modules.

use std::time::Instant;

use crate::error::HubError;
use crate::hub::Hub;
use crate::protocol::{ClientMessage, ServerMessage, PROTOCOL_VERSION};
use crate::registry::TerminationReason;
use crate::types::Role;

use super::{chat, host};

/// Macro to check host authorization and return early if unauthorized
macro_rules! check_host {
    ($role:expr, $action:expr) => {
        if $role != Role::Host {
            return Some(ServerMessage::error(&HubError::Unauthorized(format!(
                "host can {}",
                $action
            ))));
        }
    };
}

/// Handle one parsed client message and return an optional direct reply
pub fn handle_message(
    hub: &mut Hub,
    conn: &str,
    msg: ClientMessage,
    now: Instant,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Ping => {
            return Some(ServerMessage::Pong {
                timestamp: crate::protocol::now_rfc3339(),
            })
        }
        ClientMessage::Pong => {
            hub.registry.record_ack(conn, now);
            return None;
        }
        ClientMessage::Register { client } => return handle_register(hub, conn, &client),
        _ => {}
    }

    let Some(role) = hub.registry.role_of(conn) else {
        return Some(ServerMessage::error(&HubError::NotRegistered));
    };

    match msg {
        ClientMessage::Register { .. } | ClientMessage::Ping | ClientMessage::Pong => None,

        // Chat-sourced messages
        msg @ (ClientMessage::ChatMessage { .. }
        | ClientMessage::LifelineVote { .. }
        | ClientMessage::AudiencePollVote { .. }) => {
            if !role.can_submit_votes() {
                return Some(ServerMessage::error(&HubError::Unauthorized(
                    "chat bridges and the host can submit votes".to_string(),
                )));
            }
            chat::handle_chat(hub, msg)
        }

        // Host-only commands (authorization checked before dispatch)
        ClientMessage::HostShowQuestion { question } => {
            check_host!(role, "show questions");
            host::handle_show_question(hub, question)
        }

        ClientMessage::HostStartPoll {
            duration_ms,
            allow_manual_override,
        } => {
            check_host!(role, "start polls");
            host::handle_start_poll(hub, duration_ms, allow_manual_override)
        }

        ClientMessage::HostLockAnswer { option } => {
            check_host!(role, "lock answers");
            host::handle_lock_answer(hub, option)
        }

        ClientMessage::HostStartLifelineVote {
            duration_ms,
            allow_manual_override,
        } => {
            check_host!(role, "start lifeline votes");
            host::handle_start_lifeline_vote(hub, duration_ms, allow_manual_override)
        }

        ClientMessage::HostActivateLifeline { lifeline } => {
            check_host!(role, "activate lifelines");
            host::handle_activate_lifeline(hub, lifeline)
        }

        ClientMessage::HostEndRound => {
            check_host!(role, "end rounds");
            host::handle_end_round(hub)
        }

        ClientMessage::HostSetModerators { usernames } => {
            check_host!(role, "set moderators");
            host::handle_set_moderators(hub, usernames)
        }

        ClientMessage::HostResetGame => {
            check_host!(role, "reset the game");
            host::handle_reset_game(hub)
        }
    }
}

/// Declare a role. Unknown roles and exhausted quotas close the connection.
fn handle_register(hub: &mut Hub, conn: &str, client: &str) -> Option<ServerMessage> {
    let role = match client.parse::<Role>() {
        Ok(role) => role,
        Err(err) => {
            tracing::warn!(conn, client, "Unknown role requested");
            hub.terminate(conn, TerminationReason::Violation(err));
            return None;
        }
    };

    let host_authorized = hub
        .registry
        .get(conn)
        .map(|c| c.host_authorized)
        .unwrap_or(false);
    if role == Role::Host && !host_authorized {
        tracing::warn!(conn, "Host registration without credentials");
        return Some(ServerMessage::error(&HubError::Unauthorized(
            "authenticated connections can register as host".to_string(),
        )));
    }

    match hub.registry.register(conn, role) {
        Ok(()) => {
            hub.mark_dirty();
            hub.reply(
                conn,
                &ServerMessage::Welcome {
                    protocol: PROTOCOL_VERSION.to_string(),
                    role,
                    connection_id: conn.to_string(),
                    server_now: crate::protocol::now_rfc3339(),
                },
            );
            hub.send_state_to(conn);
            None
        }
        Err(err @ HubError::RoleQuotaExceeded(_)) => {
            hub.terminate(conn, TerminationReason::Violation(err));
            None
        }
        Err(err) => Some(ServerMessage::error(&err)),
    }
}
