//! Reconnection supervisor for outbound links.
//!
//! Keeps the chat-platform adapter link (and an optional secondary broadcast
//! peer) alive with capped exponential backoff plus jitter. Runs in its own
//! task: a dead link only stops new chat events, the hub and its round
//! timers carry on.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::HubConfig;
use crate::hub::HubHandle;
use crate::protocol::ClientMessage;
use crate::types::LinkState;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a link went down; picks the base reconnect delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    GracefulClose,
    TransportError,
    Timeout,
    CreationError,
}

impl DisconnectCause {
    pub fn base_delay(self) -> Duration {
        match self {
            Self::GracefulClose => Duration::from_millis(1_000),
            Self::TransportError => Duration::from_millis(2_000),
            Self::Timeout | Self::CreationError => Duration::from_millis(5_000),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GracefulClose => "graceful_close",
            Self::TransportError => "transport_error",
            Self::Timeout => "timeout",
            Self::CreationError => "creation_error",
        }
    }
}

/// Reconnect delay schedule
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    cap: Duration,
    jitter: Duration,
    last: Option<Duration>,
}

impl Backoff {
    pub fn new(cap: Duration, jitter: Duration) -> Self {
        Self {
            attempt: 0,
            cap,
            jitter,
            last: None,
        }
    }

    /// `min(base * 1.5^(attempt-1), cap)`, without jitter
    pub fn formula(cause: DisconnectCause, attempt: u32, cap: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let ms = cause.base_delay().as_millis() as f64 * 1.5f64.powi(exponent);
        let capped = ms.min(cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Count a disconnect and return how long to wait before reconnecting.
    /// Never shorter than the previous delay while that stays inside the
    /// jitter bound.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, cause: DisconnectCause, rng: &mut R) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = Self::formula(cause, self.attempt, self.cap);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.random_range(0..=jitter_ms))
        };

        let mut delay = base + jitter;
        if let Some(previous) = self.last {
            delay = delay.max(previous.min(base + self.jitter));
        }
        self.last = Some(delay);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Called after a successful connect
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = None;
    }
}

/// One outbound link the supervisor keeps alive
#[async_trait]
pub trait Link: Send + Sync + 'static {
    type Session: Send;

    /// Key under which the link's status appears in the game state
    fn platform(&self) -> &str;

    async fn connect(&self) -> Result<Self::Session, String>;

    /// Run the session until it ends and report why
    async fn serve(&self, session: Self::Session, hub: &HubHandle) -> DisconnectCause;
}

/// Status frame from the chat adapter about its upstream platform
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AdapterStatus {
    ConnectionStatus {
        platform: String,
        connected: bool,
        #[serde(default)]
        detail: Option<String>,
    },
}

enum AdapterFrame {
    Chat(ClientMessage),
    Status { platform: String, state: LinkState },
}

fn parse_adapter_frame(text: &str) -> Option<AdapterFrame> {
    if let Ok(AdapterStatus::ConnectionStatus {
        platform,
        connected,
        detail,
    }) = serde_json::from_str::<AdapterStatus>(text)
    {
        let state = if connected {
            LinkState::Connected
        } else {
            LinkState::Disconnected {
                cause: detail.unwrap_or_else(|| "adapter reported disconnect".to_string()),
            }
        };
        return Some(AdapterFrame::Status { platform, state });
    }
    serde_json::from_str::<ClientMessage>(text)
        .ok()
        .map(AdapterFrame::Chat)
}

/// Link to the chat-platform adapter process
pub struct ChatAdapterLink {
    url: String,
    idle_timeout: Duration,
}

impl ChatAdapterLink {
    pub fn new(url: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            idle_timeout,
        }
    }
}

#[async_trait]
impl Link for ChatAdapterLink {
    type Session = WsStream;

    fn platform(&self) -> &str {
        "chat_adapter"
    }

    async fn connect(&self) -> Result<WsStream, String> {
        let (ws, _resp) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| format!("connect to chat adapter at {}: {}", self.url, e))?;
        Ok(ws)
    }

    async fn serve(&self, mut ws: WsStream, hub: &HubHandle) -> DisconnectCause {
        loop {
            let msg = match tokio::time::timeout(self.idle_timeout, ws.next()).await {
                Err(_) => {
                    tracing::warn!("Chat adapter idle for {:?}", self.idle_timeout);
                    return DisconnectCause::Timeout;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return DisconnectCause::GracefulClose,
                Ok(Some(Err(e))) => {
                    tracing::warn!("Chat adapter transport error: {}", e);
                    return DisconnectCause::TransportError;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            let Message::Text(text) = msg else {
                continue;
            };
            let forwarded = match parse_adapter_frame(text.as_str()) {
                Some(AdapterFrame::Chat(msg)) => match msg.into_chat_event() {
                    Some(event) => hub.enqueue_chat(event).await,
                    None => Ok(()),
                },
                Some(AdapterFrame::Status { platform, state }) => {
                    hub.link_status(platform, state).await
                }
                None => {
                    tracing::debug!("Ignoring unrecognised adapter frame");
                    Ok(())
                }
            };
            if forwarded.is_err() {
                return DisconnectCause::GracefulClose;
            }
        }
    }
}

/// Mirrors every broadcast frame to a secondary display peer
pub struct PeerLink {
    url: String,
}

impl PeerLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Link for PeerLink {
    type Session = WsStream;

    fn platform(&self) -> &str {
        "broadcast_peer"
    }

    async fn connect(&self) -> Result<WsStream, String> {
        let (ws, _resp) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| format!("connect to broadcast peer at {}: {}", self.url, e))?;
        Ok(ws)
    }

    async fn serve(&self, mut ws: WsStream, hub: &HubHandle) -> DisconnectCause {
        let mut frames = hub.peer_frames().subscribe();
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        if let Err(e) = ws.send(Message::Text(frame.as_str().to_owned().into())).await {
                            tracing::warn!("Broadcast peer send failed: {}", e);
                            return DisconnectCause::TransportError;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Broadcast peer lagging, frames dropped");
                    }
                    Err(RecvError::Closed) => {
                        let _ = ws.close(None).await;
                        return DisconnectCause::GracefulClose;
                    }
                },
                incoming = ws.next() => match incoming {
                    None | Some(Ok(Message::Close(_))) => return DisconnectCause::GracefulClose,
                    Some(Err(e)) => {
                        tracing::warn!("Broadcast peer transport error: {}", e);
                        return DisconnectCause::TransportError;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

pub struct Supervisor<L: Link> {
    link: L,
    hub: HubHandle,
    backoff: Backoff,
    connect_timeout: Duration,
    rng: StdRng,
}

impl<L: Link> Supervisor<L> {
    pub fn new(link: L, hub: HubHandle, config: &HubConfig) -> Self {
        Self {
            link,
            hub,
            backoff: Backoff::new(config.reconnect.cap, config.reconnect.jitter),
            connect_timeout: config.reconnect.connect_timeout,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Connect, serve, back off, repeat. Returns once the hub is gone.
    pub async fn run(mut self) {
        let platform = self.link.platform().to_string();
        loop {
            let cause = match tokio::time::timeout(self.connect_timeout, self.link.connect()).await
            {
                Ok(Ok(session)) => {
                    self.backoff.reset();
                    tracing::info!(%platform, "Link connected");
                    if self
                        .hub
                        .link_status(platform.as_str(), LinkState::Connected)
                        .await
                        .is_err()
                    {
                        return;
                    }
                    self.link.serve(session, &self.hub).await
                }
                Ok(Err(e)) => {
                    tracing::warn!(%platform, "Link connect failed: {}", e);
                    DisconnectCause::CreationError
                }
                Err(_) => {
                    tracing::warn!(%platform, "Link connect timed out");
                    DisconnectCause::Timeout
                }
            };

            let delay = self.backoff.next_delay(cause, &mut self.rng);
            let attempt = self.backoff.attempt();
            tracing::info!(
                %platform,
                cause = cause.as_str(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Link down, reconnecting"
            );

            let disconnected = LinkState::Disconnected {
                cause: cause.as_str().to_string(),
            };
            let reconnecting = LinkState::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            };
            if self.hub.link_status(platform.as_str(), disconnected).await.is_err()
                || self.hub.link_status(platform.as_str(), reconnecting).await.is_err()
            {
                return;
            }
            tokio::time::sleep(delay).await;
        }
    }
}

/// Start a supervisor for each configured outbound link
pub fn spawn_supervisors(config: &HubConfig, hub: &HubHandle) {
    if let Some(url) = &config.reconnect.chat_adapter_url {
        let link = ChatAdapterLink::new(url.clone(), config.reconnect.idle_timeout);
        tokio::spawn(Supervisor::new(link, hub.clone(), config).run());
    } else {
        tracing::warn!("CHAT_ADAPTER_URL not set, chat votes only arrive over /ws");
    }
    if let Some(url) = &config.reconnect.broadcast_peer_url {
        tokio::spawn(Supervisor::new(PeerLink::new(url.clone()), hub.clone(), config).run());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::spawn_hub;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_five_disconnects_stay_within_formula_bounds() {
        let cap = Duration::from_millis(60_000);
        let jitter = Duration::from_millis(1_000);
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut backoff = Backoff::new(cap, jitter);
            let mut previous = Duration::ZERO;
            for attempt in 1..=5 {
                let delay = backoff.next_delay(DisconnectCause::GracefulClose, &mut rng);
                let floor = Backoff::formula(DisconnectCause::GracefulClose, attempt, cap);
                assert!(delay >= floor, "seed {} attempt {}", seed, attempt);
                assert!(delay <= floor + jitter, "seed {} attempt {}", seed, attempt);
                assert!(delay >= previous, "seed {} attempt {}", seed, attempt);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_formula_values_and_cap() {
        let cap = Duration::from_millis(10_000);
        let f = |attempt| Backoff::formula(DisconnectCause::GracefulClose, attempt, cap).as_millis();
        assert_eq!(f(1), 1_000);
        assert_eq!(f(2), 1_500);
        assert_eq!(f(3), 2_250);
        assert_eq!(f(7), 10_000);
        assert_eq!(f(500), 10_000);
    }

    #[test]
    fn test_timeout_backs_off_slower_than_graceful_close() {
        let cap = Duration::from_millis(60_000);
        assert!(
            Backoff::formula(DisconnectCause::Timeout, 1, cap)
                > Backoff::formula(DisconnectCause::GracefulClose, 1, cap)
        );
        assert_eq!(
            Backoff::formula(DisconnectCause::CreationError, 1, cap),
            Backoff::formula(DisconnectCause::Timeout, 1, cap)
        );
    }

    #[test]
    fn test_reset_starts_over() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = Backoff::new(Duration::from_millis(60_000), Duration::ZERO);
        backoff.next_delay(DisconnectCause::TransportError, &mut rng);
        backoff.next_delay(DisconnectCause::TransportError, &mut rng);
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(
            backoff.next_delay(DisconnectCause::GracefulClose, &mut rng),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn test_adapter_frames() {
        let status = r#"{"type":"connection_status","platform":"twitch","connected":false,"detail":"irc down"}"#;
        match parse_adapter_frame(status) {
            Some(AdapterFrame::Status { platform, state }) => {
                assert_eq!(platform, "twitch");
                assert_eq!(
                    state,
                    LinkState::Disconnected {
                        cause: "irc down".to_string()
                    }
                );
            }
            _ => panic!("expected status frame"),
        }

        let chat = r#"{"type":"chat_message","username":"u","text":"!b","platform":"youtube","timestamp":1700000000000}"#;
        match parse_adapter_frame(chat) {
            Some(AdapterFrame::Chat(msg)) => {
                let event = msg.into_chat_event().unwrap();
                assert_eq!(event.source, "youtube");
                assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_000);
            }
            _ => panic!("expected chat frame"),
        }

        assert!(parse_adapter_frame("not json").is_none());
    }

    /// Fails the first `failures` connects, then stays connected
    struct FlakyLink {
        connects: Arc<AtomicU32>,
        failures: u32,
    }

    #[async_trait]
    impl Link for FlakyLink {
        type Session = ();

        fn platform(&self) -> &str {
            "flaky"
        }

        async fn connect(&self) -> Result<(), String> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(format!("refused #{}", n))
            } else {
                Ok(())
            }
        }

        async fn serve(&self, _session: (), _hub: &HubHandle) -> DisconnectCause {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_reconnects_and_reports_status() {
        let config = HubConfig::default();
        let hub = spawn_hub(Arc::new(config.clone()), None);
        let connects = Arc::new(AtomicU32::new(0));
        let link = FlakyLink {
            connects: connects.clone(),
            failures: 2,
        };
        tokio::spawn(Supervisor::new(link, hub.clone(), &config).run());

        // Two creation errors: 5s and 7.5s, each plus at most 1s jitter
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(connects.load(Ordering::SeqCst), 3);
        let view = hub.snapshot().await.unwrap();
        assert_eq!(view.chat_links.get("flaky"), Some(&LinkState::Connected));
    }
}
