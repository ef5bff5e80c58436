//! Chat-sourced messages: audience votes and moderator answers relayed by a
//! chat bridge (or injected by the host).

use crate::hub::Hub;
use crate::protocol::{ClientMessage, ServerMessage};

/// Feed a chat message to the live round. Dropped votes are never answered,
/// the bridge has no one to tell.
pub fn handle_chat(hub: &mut Hub, msg: ClientMessage) -> Option<ServerMessage> {
    let event = msg.into_chat_event()?;
    hub.submit_chat(&event);
    None
}
