pub mod chat;
pub mod handlers;
pub mod host;

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as TungsteniteError};

use crate::abuse::origin_identity;
use crate::app::AppState;
use crate::broadcast::Outbound;
use crate::error::{AdmissionReason, HubError};
use crate::hub::{HubHandle, InboundFrame};
use crate::types::ConnectionId;

/// How long the writer may keep flushing (e.g. a close frame) after the
/// reader is done
const WRITER_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// WebSocket upgrade handler. Admission is decided before the upgrade, so a
/// rejected client never gets a socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = origin_identity(peer.ip(), &headers, &state.config.trusted_proxies);
    let host_authorized = state.auth.authorize_headers(&headers);
    let (outbox, outbox_rx) = mpsc::channel(state.config.outbox_capacity);

    let conn = match state.hub.admit(origin.clone(), host_authorized, outbox).await {
        Ok(conn) => conn,
        Err(HubError::AdmissionRejected(reason)) => {
            let status = match reason {
                AdmissionReason::Capacity => StatusCode::SERVICE_UNAVAILABLE,
                AdmissionReason::OriginLimit => StatusCode::TOO_MANY_REQUESTS,
            };
            return (status, reason.as_str()).into_response();
        }
        Err(e) => {
            tracing::error!("Admission failed: {}", e);
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    tracing::info!(%conn, %origin, host_authorized, "WebSocket connection admitted");

    let max_payload = state.config.max_payload_bytes;
    let hub = state.hub.clone();
    // Leave headroom so oversized frames reach us and get a proper close code
    ws.max_message_size(max_payload.saturating_mul(4))
        .on_upgrade(move |socket| handle_socket(socket, conn, hub, outbox_rx, max_payload))
}

/// Map a queued outbound item to a WebSocket message. The bool is true for
/// the close frame, after which nothing else is written.
fn to_message(out: Outbound) -> (Message, bool) {
    match out {
        Outbound::Frame(text) => (Message::Text(text), false),
        Outbound::Ping => (Message::Ping(Bytes::new()), false),
        Outbound::Close { code, reason } => (
            Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
            true,
        ),
    }
}

/// Size of an inbound message the websocket layer refused for exceeding its
/// message or frame limit
fn oversized_read(err: &axum::Error) -> Option<usize> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(TungsteniteError::Capacity(CapacityError::MessageTooLong { size, .. })) =
            e.downcast_ref::<TungsteniteError>()
        {
            return Some(*size);
        }
        source = e.source();
    }
    None
}

/// Handle individual WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    conn: ConnectionId,
    hub: HubHandle,
    mut outbox: mpsc::Receiver<Outbound>,
    max_payload: usize,
) {
    let (mut sender, mut receiver) = socket.split();

    // Single writer per connection keeps frames in enqueue order
    let mut writer = tokio::spawn(async move {
        while let Some(out) = outbox.recv().await {
            let (msg, closing) = to_message(out);
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut writer_done = false;
    loop {
        tokio::select! {
            _ = &mut writer => {
                writer_done = true;
                break;
            }

            ws_msg = receiver.next() => {
                let frame = match ws_msg {
                    Some(Ok(Message::Text(text))) if text.as_str().len() > max_payload => {
                        InboundFrame::Oversized(text.as_str().len())
                    }
                    Some(Ok(Message::Text(text))) => InboundFrame::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(data))) if data.len() > max_payload => {
                        InboundFrame::Oversized(data.len())
                    }
                    Some(Ok(Message::Binary(data))) => InboundFrame::Binary(data.to_vec()),
                    Some(Ok(Message::Pong(_))) => InboundFrame::Pong,
                    // Pings are answered by the websocket layer
                    Some(Ok(Message::Ping(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        tracing::debug!(%conn, "WebSocket closed by client");
                        break;
                    }
                    Some(Err(e)) => match oversized_read(&e) {
                        Some(size) => InboundFrame::Oversized(size),
                        None => {
                            tracing::debug!(%conn, "WebSocket error: {}", e);
                            break;
                        }
                    },
                    None => break,
                };

                if hub.inbound(conn.clone(), frame).await.is_err() {
                    break;
                }
            }
        }
    }

    // Terminating drops the outbox, so the writer ends once it has flushed
    let _ = hub.closed(conn.clone()).await;
    if !writer_done && tokio::time::timeout(WRITER_DRAIN_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::info!(%conn, "WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::close_code;

    #[test]
    fn test_close_is_last_frame() {
        let (msg, closing) = to_message(Outbound::Close {
            code: close_code::SLOW_CONSUMER,
            reason: "slow consumer".to_string(),
        });
        assert!(closing);
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, close_code::SLOW_CONSUMER);
                assert_eq!(frame.reason.as_str(), "slow consumer");
            }
            other => panic!("expected close frame, got {:?}", other),
        }

        let (msg, closing) = to_message(Outbound::Frame("{}".into()));
        assert!(!closing);
        assert!(matches!(msg, Message::Text(_)));
    }

    #[test]
    fn test_message_beyond_transport_limit_counts_as_oversized() {
        let max_payload = 1024;
        let err = axum::Error::new(TungsteniteError::Capacity(CapacityError::MessageTooLong {
            size: max_payload * 4 + 1,
            max_size: max_payload * 4,
        }));
        assert_eq!(oversized_read(&err), Some(max_payload * 4 + 1));
    }

    #[test]
    fn test_other_read_errors_are_not_oversized() {
        let err = axum::Error::new(TungsteniteError::ConnectionClosed);
        assert_eq!(oversized_read(&err), None);

        let err = axum::Error::new(std::io::Error::other("reset"));
        assert_eq!(oversized_read(&err), None);
    }
}
