use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use quizhub::app::{router, AppState};
use quizhub::auth::AuthConfig;
use quizhub::broadcast::Outbound;
use quizhub::config::HubConfig;
use quizhub::error::{close_code, AdmissionReason, HubError};
use quizhub::hub::{spawn_hub, HubHandle, InboundFrame};
use quizhub::protocol::GameStateView;
use quizhub::state::{load_snapshot, RoundOutcome};
use quizhub::types::{AnswerOption, Ballot, GamePhase, LifelineKind, RoundKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;

const QUESTION: &str = r#"{"type":"host_show_question","question":{"id":"q1","text":"Largest planet?","options":["Mars","Jupiter","Venus","Earth"],"correct":"B"}}"#;

struct Client {
    id: String,
    rx: mpsc::Receiver<Outbound>,
}

impl Client {
    /// Every JSON frame received so far
    fn drain(&mut self) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(out) = self.rx.try_recv() {
            if let Outbound::Frame(text) = out {
                frames.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        frames
    }

    fn drain_of_type(&mut self, kind: &str) -> Vec<serde_json::Value> {
        self.drain()
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }
}

async fn connect(hub: &HubHandle, origin: &str, role: &str) -> Client {
    let (tx, rx) = mpsc::channel(1024);
    let id = hub.admit(origin.to_string(), true, tx).await.unwrap();
    let client = Client { id, rx };
    send(hub, &client, &format!(r#"{{"type":"register","client":"{}"}}"#, role)).await;
    client
}

async fn send(hub: &HubHandle, client: &Client, json: &str) {
    hub.inbound(client.id.clone(), InboundFrame::Text(json.to_string()))
        .await
        .unwrap();
}

async fn vote(hub: &HubHandle, chat: &Client, username: &str, text: &str) {
    let msg = serde_json::json!({
        "type": "chat_message",
        "username": username,
        "text": text,
        "platform": "twitch",
    });
    send(hub, chat, &msg.to_string()).await;
}

/// Round-trips through the hub, so every earlier command has been applied
async fn state(hub: &HubHandle) -> GameStateView {
    hub.snapshot().await.unwrap()
}

fn hub_with(config: HubConfig) -> HubHandle {
    spawn_hub(Arc::new(config), None)
}

/// End-to-end: A:1, B:2 (with a duplicate) resolves to B on timeout
#[tokio::test(start_paused = true)]
async fn test_poll_resolves_winner_on_timeout() {
    let hub = hub_with(HubConfig::default());
    let mut host = connect(&hub, "10.0.0.1", "host").await;
    let chat = connect(&hub, "10.0.0.2", "chat").await;

    send(&hub, &host, QUESTION).await;
    send(&hub, &host, r#"{"type":"host_start_poll","duration_ms":60000}"#).await;
    assert_eq!(state(&hub).await.phase, GamePhase::Poll);

    vote(&hub, &chat, "alice", "A").await;
    vote(&hub, &chat, "bob", "b").await;
    vote(&hub, &chat, "carol", "!B").await;
    vote(&hub, &chat, "BOB", "a").await;

    let live = state(&hub).await;
    let round = live.round.unwrap();
    assert_eq!(round.voter_count, 3);
    assert_eq!(round.tally["A"], 1);
    assert_eq!(round.tally["B"], 2);
    host.drain();

    tokio::time::sleep(Duration::from_secs(61)).await;

    let view = state(&hub).await;
    assert_eq!(view.phase, GamePhase::Reveal);
    assert!(view.round.is_none());
    let reveal = view.reveal.unwrap();
    assert_eq!(reveal.locked, AnswerOption::B);
    assert!(reveal.is_correct);
    let result = view.last_result.unwrap();
    assert_eq!(result.total_votes, 3);
    assert_eq!(
        result.outcome,
        RoundOutcome::Winner {
            choice: Ballot::Answer(AnswerOption::B)
        }
    );

    let frames = host.drain();
    let kinds: Vec<&str> = frames.iter().filter_map(|f| f["type"].as_str()).collect();
    let ended = kinds.iter().position(|k| *k == "audience_poll_ended").unwrap();
    let revealed = kinds.iter().position(|k| *k == "answer_revealed").unwrap();
    assert!(ended < revealed);
}

/// Host locks C at 30s; the 60s timer must not change anything afterwards
#[tokio::test(start_paused = true)]
async fn test_host_lock_beats_timer() {
    let hub = hub_with(HubConfig::default());
    let host = connect(&hub, "10.0.0.1", "host").await;
    let chat = connect(&hub, "10.0.0.2", "chat").await;

    send(&hub, &host, QUESTION).await;
    send(
        &hub,
        &host,
        r#"{"type":"host_start_poll","duration_ms":60000,"allow_manual_override":true}"#,
    )
    .await;
    vote(&hub, &chat, "alice", "a").await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    send(&hub, &host, r#"{"type":"host_lock_answer","option":"C"}"#).await;

    let locked = state(&hub).await;
    assert_eq!(locked.phase, GamePhase::Reveal);
    assert_eq!(locked.locked_answer, Some(AnswerOption::C));
    assert_eq!(locked.excluded_options, vec![AnswerOption::C]);
    assert_eq!(
        locked.last_result.as_ref().unwrap().outcome,
        RoundOutcome::HostLocked {
            choice: Ballot::Answer(AnswerOption::C)
        }
    );

    tokio::time::sleep(Duration::from_secs(45)).await;

    let later = state(&hub).await;
    assert_eq!(later.version, locked.version);
    assert_eq!(later.generation, locked.generation);
    assert_eq!(later.locked_answer, Some(AnswerOption::C));
}

/// A revote started after a lifeline runs on its own timer, untouched by
/// the earlier poll's
#[tokio::test(start_paused = true)]
async fn test_generations_are_isolated() {
    let hub = hub_with(HubConfig::default());
    let host = connect(&hub, "10.0.0.1", "host").await;
    let chat = connect(&hub, "10.0.0.2", "chat").await;

    send(&hub, &host, QUESTION).await;
    send(
        &hub,
        &host,
        r#"{"type":"host_start_poll","allow_manual_override":true}"#,
    )
    .await;
    let poll_generation = state(&hub).await.generation;

    tokio::time::sleep(Duration::from_secs(10)).await;
    send(&hub, &host, r#"{"type":"host_lock_answer","option":"A"}"#).await;
    send(
        &hub,
        &host,
        r#"{"type":"host_activate_lifeline","lifeline":"take_another_vote"}"#,
    )
    .await;

    let revote = state(&hub).await;
    assert_eq!(revote.phase, GamePhase::Revote);
    assert_eq!(revote.generation, poll_generation + 1);
    assert_eq!(revote.round.as_ref().unwrap().info.kind, RoundKind::Revote);
    // Revote runs 45s from t=10s; still open at t=50s
    vote(&hub, &chat, "alice", "b").await;
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(state(&hub).await.phase, GamePhase::Revote);

    tokio::time::sleep(Duration::from_secs(6)).await;
    let revealed = state(&hub).await;
    assert_eq!(revealed.phase, GamePhase::Reveal);
    assert!(revealed.reveal.unwrap().is_correct);
    assert_eq!(revealed.last_result.as_ref().unwrap().generation, poll_generation + 1);

    // The poll's original 60s deadline passes without effect
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(state(&hub).await.version, revealed.version);
}

/// Wrong answer, audience votes fifty-fifty, revote runs on two options
#[tokio::test(start_paused = true)]
async fn test_lifeline_vote_flow() {
    let hub = hub_with(HubConfig::default());
    let mut host = connect(&hub, "10.0.0.1", "host").await;
    let chat = connect(&hub, "10.0.0.2", "chat").await;

    send(&hub, &host, QUESTION).await;
    send(
        &hub,
        &host,
        r#"{"type":"host_start_poll","allow_manual_override":true}"#,
    )
    .await;
    send(&hub, &host, r#"{"type":"host_lock_answer","option":"D"}"#).await;
    send(&hub, &host, r#"{"type":"host_start_lifeline_vote"}"#).await;
    assert_eq!(state(&hub).await.phase, GamePhase::LifelineVote);

    vote(&hub, &chat, "alice", "50").await;
    vote(&hub, &chat, "bob", "fifty").await;
    vote(&hub, &chat, "carol", "2").await;
    host.drain();

    tokio::time::sleep(Duration::from_secs(31)).await;

    let view = state(&hub).await;
    assert_eq!(view.phase, GamePhase::Revote);
    assert!(view.lifelines.used.contains(&LifelineKind::FiftyFifty));
    assert!(!view
        .lifelines
        .available_for_vote
        .contains(&LifelineKind::FiftyFifty));
    assert_eq!(view.available_options.len(), 2);
    assert!(view.available_options.contains(&AnswerOption::B));
    assert!(!view.available_options.contains(&AnswerOption::D));

    let applied = host.drain_of_type("fifty_fifty_applied");
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0]["remaining"].as_array().unwrap().len(), 2);
}

/// Tied poll waits for the host
#[tokio::test(start_paused = true)]
async fn test_tie_waits_for_host() {
    let hub = hub_with(HubConfig::default());
    let host = connect(&hub, "10.0.0.1", "host").await;
    let chat = connect(&hub, "10.0.0.2", "chat").await;

    send(&hub, &host, QUESTION).await;
    send(&hub, &host, r#"{"type":"host_start_poll"}"#).await;
    vote(&hub, &chat, "u1", "a").await;
    vote(&hub, &chat, "u2", "c").await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    let tied = state(&hub).await;
    assert_eq!(tied.phase, GamePhase::AwaitingAnswer);
    assert!(matches!(
        tied.last_result.unwrap().outcome,
        RoundOutcome::Tie { .. }
    ));

    send(&hub, &host, r#"{"type":"host_lock_answer","option":"B"}"#).await;
    let view = state(&hub).await;
    assert_eq!(view.phase, GamePhase::Reveal);
    assert!(view.reveal.unwrap().is_correct);
}

#[tokio::test]
async fn test_admission_origin_limit() {
    let hub = hub_with(HubConfig {
        max_per_origin: 2,
        ..HubConfig::default()
    });

    let mut ids = Vec::new();
    for _ in 0..2 {
        let (tx, _rx) = mpsc::channel(8);
        ids.push(hub.admit("203.0.113.9".to_string(), false, tx).await.unwrap());
    }
    let (tx, _rx) = mpsc::channel(8);
    assert_eq!(
        hub.admit("203.0.113.9".to_string(), false, tx).await,
        Err(HubError::AdmissionRejected(AdmissionReason::OriginLimit))
    );

    // Other origins are unaffected
    let (tx, _rx) = mpsc::channel(8);
    assert!(hub.admit("203.0.113.10".to_string(), false, tx).await.is_ok());

    // Closing one frees the slot
    hub.closed(ids[0].clone()).await.unwrap();
    let (tx, _rx) = mpsc::channel(8);
    assert!(hub.admit("203.0.113.9".to_string(), false, tx).await.is_ok());
}

#[tokio::test]
async fn test_rate_limit_boundary() {
    let hub = hub_with(HubConfig {
        rate_limit_max: 5,
        rate_limit_window: Duration::from_secs(60),
        ..HubConfig::default()
    });
    let mut display = connect(&hub, "10.0.0.3", "display").await;
    let before = state(&hub).await.version;
    display.drain();

    // Registration used one slot of the window
    for _ in 0..5 {
        send(&hub, &display, r#"{"type":"ping"}"#).await;
    }
    state(&hub).await;

    let frames = display.drain();
    let pongs = frames.iter().filter(|f| f["type"] == "pong").count();
    let errors: Vec<_> = frames.iter().filter(|f| f["type"] == "error").collect();
    assert_eq!(pongs, 4);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "RATE_LIMIT");
    assert_eq!(state(&hub).await.version, before);
}

#[tokio::test]
async fn test_missed_heartbeat_closes_connection() {
    let mut config = HubConfig::default();
    config.long_tier.heartbeat_interval = Duration::ZERO;
    let hub = hub_with(config);
    let mut lazy = connect(&hub, "10.0.0.4", "display").await;
    let diligent = connect(&hub, "10.0.0.5", "overlay").await;

    hub.heartbeat_tick().await.unwrap();
    hub.inbound(diligent.id.clone(), InboundFrame::Pong)
        .await
        .unwrap();
    hub.heartbeat_tick().await.unwrap();

    let counts = state(&hub).await.connections;
    assert_eq!(counts.total, 1);
    assert_eq!(counts.overlays, 1);

    let mut saw_ping = false;
    let mut close = None;
    while let Ok(out) = lazy.rx.try_recv() {
        match out {
            Outbound::Ping => saw_ping = true,
            Outbound::Close { code, .. } => close = Some(code),
            Outbound::Frame(_) => {}
        }
    }
    assert!(saw_ping);
    assert_eq!(close, Some(close_code::HEARTBEAT_TIMEOUT));
}

#[tokio::test]
async fn test_reveal_writes_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quizhub.json");
    let hub = hub_with(HubConfig {
        snapshot_path: Some(path.clone()),
        ..HubConfig::default()
    });
    let host = connect(&hub, "10.0.0.1", "host").await;

    send(&hub, &host, QUESTION).await;
    send(
        &hub,
        &host,
        r#"{"type":"host_start_poll","allow_manual_override":true}"#,
    )
    .await;
    send(&hub, &host, r#"{"type":"host_lock_answer","option":"A"}"#).await;
    state(&hub).await;

    let mut snapshot = None;
    for _ in 0..100 {
        if let Ok(Some(found)) = load_snapshot(&path).await {
            snapshot = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let snapshot = snapshot.expect("snapshot should be written after a reveal");
    assert_eq!(snapshot.question_no, 1);
    assert!(snapshot.excluded.contains(&AnswerOption::A));
}

fn app(auth: AuthConfig) -> axum::Router {
    let config = Arc::new(HubConfig::default());
    router(AppState {
        hub: spawn_hub(config.clone(), None),
        config,
        auth: Arc::new(auth),
    })
}

fn credentials() -> AuthConfig {
    AuthConfig {
        username: Some("host".to_string()),
        password: Some("hunter2".to_string()),
    }
}

fn basic_auth() -> String {
    format!("Basic {}", STANDARD.encode("host:hunter2"))
}

#[tokio::test]
async fn test_http_state_and_health() {
    let app = app(credentials());

    let response = app
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::get("/api/state").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["phase"], "idle");
    assert_eq!(json["connections"]["total"], 0);
}

#[tokio::test]
async fn test_http_export_import_require_auth() {
    let app = app(credentials());

    let response = app
        .clone()
        .oneshot(Request::get("/api/export").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/export")
                .header(header::AUTHORIZATION, basic_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let mut snapshot: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot["schema_version"], 1);

    snapshot["question_no"] = serde_json::json!(4);
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/import")
                .header(header::AUTHORIZATION, basic_auth())
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(snapshot.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::get("/api/state").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["question_no"], 4);
}

#[tokio::test]
async fn test_http_import_rejects_newer_schema() {
    let app = app(AuthConfig::default());
    let body = serde_json::json!({
        "schema_version": 99,
        "exported_at": "2026-01-01T00:00:00Z",
        "question": null,
        "question_no": 0,
        "excluded": [],
        "lifelines": {"used": [], "available_for_vote": ["fifty_fifty"]},
        "moderators": [],
    });
    let response = app
        .oneshot(
            Request::post("/api/import")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
