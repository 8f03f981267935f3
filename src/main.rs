/// flowpilot server entry point
///
/// Loads configuration from the environment and serves the engine over HTTP:
/// - Definitions at /api/definitions
/// - Instances at /api/instances/*
/// - Tasks at /api/tasks/*
/// - Health check at /healthz

use flowpilot::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults to 0.0.0.0:3004 and sqlite://data/flowpilot.db
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
