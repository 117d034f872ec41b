//! Tabminal Server
//!
//! Thin HTTP/WebSocket front-end over the broker core: the REST session
//! surface, the per-session WebSocket attach channel, and static files for
//! the browser UI.

mod handlers;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tabminal_core::{CoreConfig, SessionRegistry};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}

#[tokio::main]
async fn main() {
    // Log crashes even when tracing never came up.
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));
        eprintln!("[PANIC] at {:?}: {}", location, info);
        tracing::error!("PANIC at {:?}: {}", location, info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting tabminal server v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run_server().await {
        error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_server() -> Result<()> {
    let config = load_config();
    info!("Config loaded: bind={}", config.bind_address);

    let registry = SessionRegistry::new(config.core.clone());

    // The registry keeps at least one session alive from here on through
    // auto-respawn.
    registry
        .create()
        .await
        .context("Failed to create initial session")?;

    let state = AppState {
        registry: registry.clone(),
    };

    let mut app = Router::new()
        .route("/api/heartbeat", get(handlers::heartbeat))
        .route(
            "/api/sessions",
            get(handlers::sessions::list).post(handlers::sessions::create),
        )
        .route(
            "/api/sessions/:id",
            get(handlers::sessions::get).delete(handlers::sessions::delete),
        )
        .route("/ws/:id", get(handlers::ws::attach));

    if let Some(static_dir) = &config.static_dir {
        info!("Static files directory: {}", static_dir.display());
        let index = static_dir.join("index.html");
        app = app
            .nest_service("/assets", ServeDir::new(static_dir.join("assets")))
            .fallback_service(ServeFile::new(index));
    }

    let app = app
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .context("Failed to parse bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, disposing sessions");
    registry.dispose().await;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[derive(Debug, Clone)]
struct Config {
    bind_address: String,
    static_dir: Option<PathBuf>,
    core: CoreConfig,
}

fn load_config() -> Config {
    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "127.0.0.1:4020".to_string());
    let static_dir = std::env::var("STATIC_DIR").ok().map(PathBuf::from);

    Config {
        bind_address,
        static_dir,
        core: CoreConfig::from_env(),
    }
}
