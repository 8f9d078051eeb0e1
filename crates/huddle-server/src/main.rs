mod config;

use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use huddle_api::AppStateInner;
use huddle_api::error::ApiError;
use huddle_gateway::connection;
use huddle_gateway::dispatcher::Dispatcher;
use huddle_gateway::identity::IdentityResolver;
use huddle_gateway::store::Store;

use crate::config::ServerConfig;

/// How often stale sessions are checked against the grace window.
const EVICTION_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct GatewayParams {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "huddle_server=debug,huddle_gateway=debug,huddle_api=debug,huddle_db=info,tower_http=debug".into()
            }),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            std::process::exit(1);
        }
    };

    let db = huddle_db::Database::open(&config.db_path)?;
    let store = Store::new(db, config.storage_workers);
    let identity = IdentityResolver::new(config.jwt_secret.clone(), config.token_ttl, store.clone());
    let dispatcher = Dispatcher::new(store, identity, config.session_grace);

    tokio::spawn(dispatcher.clone().run_eviction_loop(EVICTION_INTERVAL));

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(dispatcher.clone());

    let app = Router::new()
        .merge(huddle_api::router(AppStateInner::new(dispatcher)))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!("Huddle server listening on {}", addr);
    info!(
        "Session grace {:?}, {} storage workers",
        config.session_grace, config.storage_workers
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// With `?token=` the credential is checked before upgrading, and a bad one
/// is refused with 401. Without it the client must `identify` first.
async fn ws_upgrade(
    State(dispatcher): State<Dispatcher>,
    Query(params): Query<GatewayParams>,
    ws: WebSocketUpgrade,
) -> Response {
    match params.token {
        Some(token) => match dispatcher.identity().verify(&token).await {
            Ok(identity) => ws
                .on_upgrade(move |socket| {
                    connection::handle_connection_authenticated(socket, dispatcher, identity)
                })
                .into_response(),
            Err(e) => ApiError::from(e).into_response(),
        },
        None => ws
            .on_upgrade(move |socket| connection::handle_connection(socket, dispatcher))
            .into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
