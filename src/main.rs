use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quizhub::{app, auth, broadcast, config::HubConfig, hub, state, supervisor};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quizhub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting quizhub...");

    let config = Arc::new(HubConfig::from_env());
    let auth_config = Arc::new(auth::AuthConfig::from_env());

    // Best-effort restore of the last snapshot
    let restored = match &config.snapshot_path {
        Some(path) => match state::load_snapshot(path).await {
            Ok(Some(snapshot)) => {
                tracing::info!(path = %path.display(), "Restoring snapshot");
                Some(snapshot)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Ignoring snapshot: {}", e);
                None
            }
        },
        None => None,
    };

    let hub = hub::spawn_hub(config.clone(), restored);

    // Liveness probing, stale sweeps and coalesced tally pushes
    broadcast::spawn_heartbeat_ticker(hub.clone(), config.heartbeat_tick);
    broadcast::spawn_stale_sweeper(hub.clone(), config.sweep_interval);
    broadcast::spawn_vote_broadcaster(hub.clone(), broadcast::VOTE_FLUSH_INTERVAL);

    // Outbound links to the chat adapter and the broadcast peer
    supervisor::spawn_supervisors(&config, &hub);

    let app = app::router(app::AppState {
        hub,
        config: config.clone(),
        auth: auth_config,
    });

    tracing::info!("Listening on http://{}", config.bind_addr);

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", config.bind_addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        tracing::error!("Server error: {}", e);
    }
}
