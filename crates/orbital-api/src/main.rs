// Orbital API server
//
// Design Decision: the engine's background tick loop is the only executor;
// this process just wires HTTP onto `Engine` and owns its lifecycle.

mod error;
mod invoker;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use orbital_core::{Engine, EngineConfig, SqliteStore, SystemClock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use invoker::HttpStepInvoker;

#[derive(OpenApi)]
#[openapi(
    paths(
        routes::workflows::register,
        routes::runs::trigger,
        routes::runs::inspect,
        routes::runs::cancel,
        routes::runs::resume,
        routes::events::publish,
    ),
    components(schemas(
        routes::workflows::RegisterResponse,
        routes::runs::TriggerRequest,
        routes::runs::TriggerResponse,
        routes::runs::ResumeRequest,
        routes::runs::RunSnapshotResponse,
        routes::events::PublishEventRequest,
        routes::events::PublishEventResponse,
    )),
    tags(
        (name = "workflows", description = "Workflow registration"),
        (name = "runs", description = "Run lifecycle: trigger, inspect, resume, cancel"),
        (name = "events", description = "Event-driven pause resumption"),
    ),
    info(
        title = "Orbital API",
        version = "0.2.0",
        description = "HTTP ingress for the Orbital workflow orchestration engine",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orbital_api=info,orbital_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("orbital-api starting...");

    let db_path = std::env::var("ORBITAL_DB_PATH").unwrap_or_else(|_| "orbital.db".to_string());
    let store = Arc::new(
        SqliteStore::connect(&db_path)
            .await
            .context("failed to open SQLite store")?,
    );
    tracing::info!(db_path = %db_path, "store opened");

    let invoker_url = std::env::var("ORBITAL_INVOKER_URL")
        .context("ORBITAL_INVOKER_URL environment variable required")?;
    let invoker = Arc::new(HttpStepInvoker::new(invoker_url));

    let clock = Arc::new(SystemClock::new());

    let mut config = EngineConfig::default();
    if let Ok(ms) = std::env::var("ORBITAL_TICK_INTERVAL_MS").and_then(|v| {
        v.parse::<u64>().map_err(|_| std::env::VarError::NotPresent)
    }) {
        config.tick_interval = Duration::from_millis(ms);
    }
    if let Ok(ms) = std::env::var("ORBITAL_DEFAULT_TIMEOUT_MS").and_then(|v| {
        v.parse::<u64>().map_err(|_| std::env::VarError::NotPresent)
    }) {
        config.dispatcher.default_timeout = Duration::from_millis(ms);
    }

    let engine = Arc::new(Engine::without_hooks(store, clock, invoker, config));
    engine.start().await.context("failed to start engine")?;

    let workflows_state = routes::workflows::AppState { engine: engine.clone() };
    let runs_state = routes::runs::AppState { engine: engine.clone() };
    let events_state = routes::events::AppState { engine: engine.clone() };
    let webhooks_state = routes::webhooks::AppState { engine: engine.clone() };

    let app = Router::new()
        .route("/health", axum::routing::get(health))
        .merge(routes::workflows::routes(workflows_state))
        .merge(routes::runs::routes(runs_state))
        .merge(routes::events::routes(events_state))
        .merge(routes::webhooks::routes(webhooks_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("ORBITAL_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind to address")?;
    tracing::info!(addr = %addr, "listening");

    let shutdown = shutdown_signal(engine.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn shutdown_signal(engine: Arc<Engine>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, stopping engine");
    if let Err(err) = engine.stop().await {
        tracing::warn!(error = %err, "engine stop failed");
    }
}
