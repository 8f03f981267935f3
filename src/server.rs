/// Server setup and initialization
///
/// Wires together all components: definition storage, registry, workflow
/// engine, the event drain and HTTP routes.

use crate::{
    api::{create_api_routes, AppState},
    config::Config,
    runtime::{ChannelEventSink, WorkflowEngine, WorkflowEvent},
    workflow::{registry::DefinitionRegistry, storage::DefinitionStorage},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::mpsc};
use tracing_subscriber::EnvFilter;

/// Create the main Axum application with all routes
///
/// Opens the definition database, loads stored definitions, builds the engine
/// and starts draining lifecycle events into the log.
pub async fn create_app(config: Config) -> Result<(Router, Arc<WorkflowEngine>)> {
    tracing::info!("📋 Initializing definition storage");
    let storage = DefinitionStorage::connect(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open definition database: {}", e))?;

    tracing::info!("📊 Initializing definition registry");
    let registry = Arc::new(DefinitionRegistry::new(storage));
    registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load definitions from storage: {}", e))?;

    tracing::info!("📣 Initializing event channel (capacity {})", config.engine.event_buffer);
    let (event_sink, events) = ChannelEventSink::new(config.engine.event_buffer);
    tokio::spawn(drain_events(events));

    tracing::info!("🚀 Initializing workflow engine");
    let engine = WorkflowEngine::builder(registry.clone())
        .with_event_sink(Arc::new(event_sink))
        .with_settings(config.engine.clone())
        .build()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize workflow engine: {}", e))?;

    let app_state = AppState {
        engine: Arc::clone(&engine),
        registry,
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_api_routes().with_state(app_state));

    tracing::info!("✅ Application initialized successfully");
    Ok((app, engine))
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    // RUST_LOG overrides the default filter
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowpilot server...");

    let (app, engine) = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await?;
    tracing::info!("👋 Server stopped");
    Ok(())
}

/// Log every lifecycle event until the engine drops its sender
async fn drain_events(mut events: mpsc::Receiver<WorkflowEvent>) {
    while let Some(event) = events.recv().await {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(
            event = event.name(),
            instance_id = event.instance_id(),
            "📣 {}",
            payload
        );
    }
    tracing::debug!("Event channel closed");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown signal received");
}

async fn health_check() -> &'static str {
    "ok"
}
