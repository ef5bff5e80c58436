//! The single-writer hub.
//!
//! One task owns the phase machine, the connection registry, the rate
//! limiter and the fanout. Everything else (socket readers, the chat link,
//! round timers, background tickers, HTTP handlers) talks to it through a
//! [`HubHandle`], which only ever enqueues a [`Command`].

use axum::extract::ws::Utf8Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use crate::abuse::{Admission, AdmissionController, RateLimiter};
use crate::broadcast::{Fanout, Outbound, Outbox};
use crate::config::HubConfig;
use crate::error::{close_code, HubError, HubResult};
use crate::protocol::{ClientMessage, GameStateView, ServerMessage};
use crate::registry::{ConnectionRegistry, Termination, TerminationReason};
use crate::state::{save_snapshot, HubSnapshot, PhaseMachine, Scheduler, SubmitOutcome, TimerId};
use crate::types::{ChatEvent, ConnectionId, LinkState};
use crate::ws::handlers;

/// Frames buffered on the secondary broadcast peer channel
const PEER_CHANNEL_CAPACITY: usize = 256;

/// One inbound WebSocket frame, already classified by the reader
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    /// Over the payload limit; only the size is kept
    Oversized(usize),
    /// WebSocket Pong (heartbeat ack)
    Pong,
}

pub enum Command {
    Admit {
        origin: String,
        host_authorized: bool,
        outbox: Outbox,
        respond_to: oneshot::Sender<HubResult<ConnectionId>>,
    },
    Inbound {
        conn: ConnectionId,
        frame: InboundFrame,
    },
    Closed {
        conn: ConnectionId,
    },
    Chat {
        event: ChatEvent,
        respond_to: Option<oneshot::Sender<SubmitOutcome>>,
    },
    LinkStatus {
        platform: String,
        state: LinkState,
    },
    RoundTimeout {
        generation: u64,
    },
    HeartbeatTick,
    SweepStale,
    FlushVotes,
    Snapshot {
        respond_to: oneshot::Sender<GameStateView>,
    },
    Export {
        respond_to: oneshot::Sender<HubSnapshot>,
    },
    Import {
        snapshot: HubSnapshot,
        respond_to: oneshot::Sender<HubResult<()>>,
    },
}

/// Cloneable front door to the hub task
#[derive(Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<Command>,
    peer: broadcast::Sender<Utf8Bytes>,
}

impl HubHandle {
    async fn send(&self, cmd: Command) -> HubResult<()> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| HubError::HubUnavailable)
    }

    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> Command) -> HubResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(cmd(tx)).await?;
        rx.await.map_err(|_| HubError::HubUnavailable)
    }

    /// Ask for admission. On success the connection exists, unregistered.
    pub async fn admit(
        &self,
        origin: String,
        host_authorized: bool,
        outbox: Outbox,
    ) -> HubResult<ConnectionId> {
        self.request(|respond_to| Command::Admit {
            origin,
            host_authorized,
            outbox,
            respond_to,
        })
        .await?
    }

    pub async fn inbound(&self, conn: ConnectionId, frame: InboundFrame) -> HubResult<()> {
        self.send(Command::Inbound { conn, frame }).await
    }

    pub async fn closed(&self, conn: ConnectionId) -> HubResult<()> {
        self.send(Command::Closed { conn }).await
    }

    /// Submit a chat event and wait for its outcome
    pub async fn submit(&self, event: ChatEvent) -> HubResult<SubmitOutcome> {
        self.request(|tx| Command::Chat {
            event,
            respond_to: Some(tx),
        })
        .await
    }

    /// Submit a chat event without waiting for the outcome
    pub async fn enqueue_chat(&self, event: ChatEvent) -> HubResult<()> {
        self.send(Command::Chat {
            event,
            respond_to: None,
        })
        .await
    }

    pub async fn link_status(&self, platform: impl Into<String>, state: LinkState) -> HubResult<()> {
        self.send(Command::LinkStatus {
            platform: platform.into(),
            state,
        })
        .await
    }

    pub async fn heartbeat_tick(&self) -> HubResult<()> {
        self.send(Command::HeartbeatTick).await
    }

    pub async fn sweep_stale(&self) -> HubResult<()> {
        self.send(Command::SweepStale).await
    }

    pub async fn flush_votes(&self) -> HubResult<()> {
        self.send(Command::FlushVotes).await
    }

    pub async fn snapshot(&self) -> HubResult<GameStateView> {
        self.request(|respond_to| Command::Snapshot { respond_to }).await
    }

    pub async fn export(&self) -> HubResult<HubSnapshot> {
        self.request(|respond_to| Command::Export { respond_to }).await
    }

    pub async fn import(&self, snapshot: HubSnapshot) -> HubResult<()> {
        self.request(|respond_to| Command::Import {
            snapshot,
            respond_to,
        })
        .await?
    }

    /// Every frame the fanout pushes, for the secondary broadcast peer
    pub fn peer_frames(&self) -> broadcast::Sender<Utf8Bytes> {
        self.peer.clone()
    }
}

/// Round timers as sleeping tasks that enqueue `RoundTimeout`. Holds only a
/// weak sender so pending timers never keep the hub alive.
pub struct TokioScheduler {
    commands: mpsc::WeakSender<Command>,
    timers: HashMap<TimerId, AbortHandle>,
    next_id: TimerId,
}

impl TokioScheduler {
    pub fn new(commands: &mpsc::Sender<Command>) -> Self {
        Self {
            commands: commands.downgrade(),
            timers: HashMap::new(),
            next_id: 0,
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_round_timeout(&mut self, generation: u64, after: Duration) -> TimerId {
        self.timers.retain(|_, handle| !handle.is_finished());
        self.next_id += 1;
        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::RoundTimeout { generation }).await;
            }
        });
        self.timers.insert(self.next_id, task.abort_handle());
        self.next_id
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
        }
    }
}

pub struct Hub {
    config: Arc<HubConfig>,
    pub(crate) machine: PhaseMachine,
    pub(crate) registry: ConnectionRegistry,
    limiter: RateLimiter,
    admission: AdmissionController,
    fanout: Fanout,
    /// Connection-level changes that need a state push
    dirty: bool,
    snapshots: Option<watch::Sender<Option<HubSnapshot>>>,
}

impl Hub {
    pub fn new(config: Arc<HubConfig>, machine: PhaseMachine, fanout: Fanout) -> Self {
        Self {
            registry: ConnectionRegistry::new(&config),
            limiter: RateLimiter::from_config(&config),
            admission: AdmissionController::from_config(&config),
            machine,
            fanout,
            dirty: false,
            snapshots: None,
            config,
        }
    }

    /// Persist snapshots through `writer` whenever one is due
    pub fn with_snapshot_writer(mut self, writer: watch::Sender<Option<HubSnapshot>>) -> Self {
        self.snapshots = Some(writer);
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Apply one command, then push whatever it produced
    pub fn handle_command(&mut self, cmd: Command) {
        self.apply(cmd, Instant::now());
        self.machine.enforce_invariants();
        self.flush();
    }

    fn apply(&mut self, cmd: Command, now: Instant) {
        match cmd {
            Command::Admit {
                origin,
                host_authorized,
                outbox,
                respond_to,
            } => {
                let result = self.admit(&origin, host_authorized, outbox, now);
                let _ = respond_to.send(result);
            }
            Command::Inbound { conn, frame } => self.on_inbound(&conn, frame, now),
            Command::Closed { conn } => self.terminate(&conn, TerminationReason::Closed),
            Command::Chat { event, respond_to } => {
                let outcome = self.submit_chat(&event);
                if let Some(tx) = respond_to {
                    let _ = tx.send(outcome);
                }
            }
            Command::LinkStatus { platform, state } => {
                tracing::info!(%platform, status = ?state, "Chat link status changed");
                self.machine.set_link_status(&platform, state);
            }
            Command::RoundTimeout { generation } => {
                // Stale timers are logged and discarded inside the machine
                let _ = self.machine.on_round_timeout(generation);
            }
            Command::HeartbeatTick => {
                let terminated = self.registry.heartbeat_tick(now);
                self.after_terminations(terminated);
            }
            Command::SweepStale => {
                let terminated = self.registry.sweep_stale(now);
                self.after_terminations(terminated);
            }
            Command::FlushVotes => {
                if self.machine.take_votes_dirty() {
                    self.dirty = true;
                }
            }
            Command::Snapshot { respond_to } => {
                let _ = respond_to.send(self.view());
            }
            Command::Export { respond_to } => {
                let _ = respond_to.send(self.machine.export_snapshot());
            }
            Command::Import {
                snapshot,
                respond_to,
            } => {
                let result = self.machine.import_snapshot(snapshot);
                if let Err(ref e) = result {
                    tracing::warn!("Snapshot import refused: {}", e);
                }
                let _ = respond_to.send(result);
            }
        }
    }

    fn admit(
        &mut self,
        origin: &str,
        host_authorized: bool,
        outbox: Outbox,
        now: Instant,
    ) -> HubResult<ConnectionId> {
        match self.admission.try_admit(&self.registry, origin) {
            Admission::Accept => {
                let id = self.registry.insert(origin, outbox, host_authorized, now);
                self.dirty = true;
                Ok(id)
            }
            Admission::Reject(reason) => {
                tracing::warn!(origin, %reason, "Connection refused");
                Err(HubError::AdmissionRejected(reason))
            }
        }
    }

    fn on_inbound(&mut self, conn: &str, frame: InboundFrame, now: Instant) {
        if self.registry.get(conn).is_none() {
            return;
        }

        let text = match frame {
            InboundFrame::Pong => {
                self.registry.record_ack(conn, now);
                return;
            }
            InboundFrame::Oversized(size) => {
                let max = self.config.max_payload_bytes;
                self.terminate(
                    conn,
                    TerminationReason::Violation(HubError::OversizedMessage { size, max }),
                );
                return;
            }
            InboundFrame::Text(text) => Ok(text),
            InboundFrame::Binary(bytes) => String::from_utf8(bytes),
        };

        self.registry.record_activity(conn, now);
        if !self.limiter.check_at(conn, now) {
            tracing::debug!(conn, "Rate limit hit");
            self.reply_error(conn, &HubError::RateLimited);
            return;
        }

        let text = match text {
            Ok(text) => text,
            Err(_) => {
                self.reply_error(
                    conn,
                    &HubError::MalformedPayload("frame is not valid UTF-8".to_string()),
                );
                return;
            }
        };
        if text.len() > self.config.max_payload_bytes {
            let max = self.config.max_payload_bytes;
            self.terminate(
                conn,
                TerminationReason::Violation(HubError::OversizedMessage {
                    size: text.len(),
                    max,
                }),
            );
            return;
        }

        let msg = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(conn, "Unparseable message: {}", e);
                self.reply_error(conn, &HubError::MalformedPayload(e.to_string()));
                return;
            }
        };

        if let Some(response) = handlers::handle_message(self, conn, msg, now) {
            self.reply(conn, &response);
        }
    }

    /// Feed a chat event to the phase machine. Drops are silent to the
    /// submitter.
    pub(crate) fn submit_chat(&mut self, event: &ChatEvent) -> SubmitOutcome {
        let outcome = self.machine.submit(event);
        if let SubmitOutcome::Rejected(ref err) = outcome {
            tracing::debug!(
                source = %event.source,
                username = %event.username,
                "Chat event dropped: {}",
                err
            );
        }
        outcome
    }

    /// Send one message to one connection
    pub(crate) fn reply(&mut self, conn: &str, msg: &ServerMessage) {
        let Some(frame) = Fanout::encode(msg) else {
            return;
        };
        if !self.registry.send_to(conn, Outbound::Frame(frame)) {
            self.terminate(conn, TerminationReason::SlowConsumer);
        }
    }

    pub(crate) fn reply_error(&mut self, conn: &str, err: &HubError) {
        self.reply(conn, &ServerMessage::error(err));
    }

    pub(crate) fn send_state_to(&mut self, conn: &str) {
        let view = self.view();
        self.reply(conn, &ServerMessage::State { data: view });
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn terminate(&mut self, conn: &str, reason: TerminationReason) {
        if let Some(termination) = self.registry.terminate(conn, reason) {
            self.after_terminations(vec![termination]);
        }
    }

    fn after_terminations(&mut self, terminated: Vec<Termination>) {
        if terminated.is_empty() {
            return;
        }
        for termination in &terminated {
            self.limiter.release(&termination.id);
        }
        self.dirty = true;
    }

    pub fn view(&self) -> GameStateView {
        self.machine.view(self.registry.counts())
    }

    /// Push events, then state, to every registered connection. Connections
    /// that cannot keep up are terminated.
    fn flush(&mut self) {
        let mut failed = Vec::new();
        for event in self.machine.take_events() {
            failed.extend(self.fanout.push_event(&self.registry, &event));
        }
        let state_dirty = self.machine.take_dirty() | std::mem::take(&mut self.dirty);
        if state_dirty {
            failed.extend(self.fanout.push_state(&self.registry, self.view()));
        }

        failed.sort();
        failed.dedup();
        for conn in failed {
            self.terminate(&conn, TerminationReason::SlowConsumer);
        }
        // Terminations above only change connection counts; the next flush
        // carries them
        if self.machine.take_snapshot_due() {
            if let Some(writer) = &self.snapshots {
                writer.send_replace(Some(self.machine.export_snapshot()));
            }
        }
    }

    /// Close every connection with "going away"
    pub fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self
            .registry
            .registered()
            .map(|conn| conn.id.clone())
            .collect();
        for id in ids {
            self.registry.send_to(
                &id,
                Outbound::Close {
                    code: close_code::GOING_AWAY,
                    reason: "hub shutting down".to_string(),
                },
            );
            self.registry.terminate(&id, TerminationReason::Closed);
        }
    }
}

async fn run_hub(mut hub: Hub, mut receiver: mpsc::Receiver<Command>) {
    while let Some(cmd) = receiver.recv().await {
        hub.handle_command(cmd);
    }
    tracing::info!("Hub command channel closed, shutting down");
    hub.shutdown();
}

/// Background writer that persists the latest snapshot
fn spawn_snapshot_writer(path: PathBuf) -> watch::Sender<Option<HubSnapshot>> {
    let (tx, mut rx) = watch::channel(None::<HubSnapshot>);
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let latest = rx.borrow_and_update().clone();
            if let Some(snapshot) = latest {
                match save_snapshot(&path, &snapshot).await {
                    Ok(()) => tracing::debug!(path = %path.display(), "Snapshot written"),
                    Err(e) => tracing::warn!(path = %path.display(), "Failed to write snapshot: {}", e),
                }
            }
        }
    });
    tx
}

/// Start the hub task, optionally restoring a snapshot first
pub fn spawn_hub(config: Arc<HubConfig>, restored: Option<HubSnapshot>) -> HubHandle {
    let (sender, receiver) = mpsc::channel(config.command_queue_capacity);
    let scheduler = TokioScheduler::new(&sender);
    let mut machine = PhaseMachine::new(config.rounds, Box::new(scheduler));
    if let Some(snapshot) = restored {
        if let Err(e) = machine.import_snapshot(snapshot) {
            tracing::warn!("Ignoring stored snapshot: {}", e);
        }
    }

    let fanout = Fanout::new(PEER_CHANNEL_CAPACITY);
    let peer = fanout.peer_sender();
    let mut hub = Hub::new(config.clone(), machine, fanout);
    if let Some(path) = config.snapshot_path.clone() {
        hub = hub.with_snapshot_writer(spawn_snapshot_writer(path));
    }

    tokio::spawn(run_hub(hub, receiver));
    HubHandle { sender, peer }
}
