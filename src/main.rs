use axum::http::HeaderValue;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod constants;
mod crypto;
mod db;
mod error;
mod game;
mod models;
mod services;
mod transport;
mod utils;
mod websocket;

use config::Config;
use constants::API_VERSION;
use db::Database;
use services::{SessionHandle, Stores};

/// Process-wide resources, built once and torn down in reverse order.
struct AppContext {
    config: Config,
    db: Database,
    stores: Stores,
    session: SessionHandle,
    driver: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl AppContext {
    async fn build(config: Config) -> anyhow::Result<Self> {
        let db = Database::new(&config).await?;

        tracing::info!("Running database migrations...");
        db.run_migrations().await?;

        let stores = services::start_history_stores(&db, &config).await?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (session, driver) =
            services::start_background_services(db.clone(), config.clone(), &stores, shutdown_rx)
                .await?;

        Ok(Self {
            config,
            db,
            stores,
            session,
            driver,
            shutdown,
        })
    }

    fn app_state(&self) -> api::AppState {
        api::AppState {
            db: self.db.clone(),
            config: self.config.clone(),
            session: self.session.clone(),
            rounds: self.stores.rounds.clone(),
            chat: self.stores.chat.clone(),
        }
    }

    /// Stops the driver, drains the persistence writers, then closes the pool.
    async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.driver.await {
            tracing::error!("Session driver task failed: {}", e);
        }
        self.stores.shutdown().await;
        self.db.close().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries outbound intent frames, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crash_tracker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    config.validate()?;

    tracing::info!("Starting crash tracker");
    tracing::info!("Environment: {}", config.environment);
    tracing::info!("API Version: {}", API_VERSION);

    let context = AppContext::build(config).await?;
    let app = build_router(context.app_state());

    let addr: SocketAddr = format!("{}:{}", context.config.host, context.config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    context.shutdown().await;
    Ok(())
}

fn build_router(state: api::AppState) -> Router {
    let cors = cors_from_config(&state.config);

    Router::new()
        .route("/health", get(api::health::health_check))
        .route("/api/v1/session", get(api::session::get_session))
        .route("/api/v1/history/rounds", get(api::history::get_rounds))
        .route("/api/v1/history/chat", get(api::history::get_chat))
        .route("/ws/events", get(websocket::events::handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_from_config(config: &Config) -> CorsLayer {
    let raw = config.cors_allowed_origins.trim();
    if config.is_development() || raw.is_empty() || raw == "*" {
        return CorsLayer::very_permissive();
    }

    let allowed: Vec<HeaderValue> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<HeaderValue>().ok())
        .collect();

    if allowed.is_empty() {
        tracing::warn!("No valid CORS origins parsed; falling back to permissive");
        return CorsLayer::very_permissive();
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}
