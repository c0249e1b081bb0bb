use std::sync::Arc;

use mailflow::config::EngineConfig;
use mailflow::monitor::{MonitorSupervisor, SupervisorDeps};
use mailflow::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let engine = EngineConfig::from_env();

    let db_path =
        std::env::var("MAILFLOW_DB_PATH").unwrap_or_else(|_| "./data/mailflow.db".to_string());
    let backend = Arc::new(LibSqlBackend::new_local(std::path::Path::new(&db_path)).await?);

    eprintln!("mailflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {db_path}");
    eprintln!(
        "   Scan interval: {}s, match mode: {:?}",
        engine.scan_interval.as_secs(),
        engine.match_mode
    );

    let supervisor = Arc::new(MonitorSupervisor::new(SupervisorDeps::new(
        backend.clone(),
        backend.clone(),
        backend,
        engine,
    )));

    // Monitored mailboxes, comma-separated user ids. The API layer calls
    // start/stop at runtime; this seeds monitors for a standalone run.
    let users = std::env::var("MAILFLOW_USERS").unwrap_or_default();
    for user_id in users.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Err(e) = supervisor.start(user_id).await {
            tracing::error!(user_id, error = %e, "Failed to start monitor");
        }
    }

    if supervisor.running_count().await == 0 {
        tracing::warn!("No monitors running — set MAILFLOW_USERS or seed mailbox_settings");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    supervisor.stop_all().await;

    Ok(())
}
