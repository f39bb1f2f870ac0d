use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_api::background::job_cleanup::{self, CleanupSchedule};
use kiln_api::config::ServerConfig;
use kiln_api::engine::{BlobRelay, EngineSettings, JobExecutor};
use kiln_api::mcp::ToolRegistry;
use kiln_api::router::build_app_router;
use kiln_api::state::AppState;
use kiln_api::workflows::FileWorkflowSource;
use kiln_cloud::{S3BlobStore, S3Settings};
use kiln_core::service::ServiceRegistry;
use kiln_jobs::JobManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "kiln_api=debug,kiln_comfyui=debug,kiln_jobs=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Services ---
    let services_text = tokio::fs::read_to_string(&config.services_config)
        .await
        .with_context(|| format!("Failed to read {}", config.services_config.display()))?;
    let registry = Arc::new(ServiceRegistry::from_json(&services_text)?);
    tracing::info!(count = registry.len(), "Service registry loaded");

    // --- Engine ---
    let engine = EngineSettings {
        host: config.comfyui.host.clone(),
        secure: config.comfyui.secure,
        timeout: config.comfyui.timeout(),
    };
    tracing::info!(
        comfyui_host = %engine.host,
        secure = engine.secure,
        timeout_secs = config.comfyui.timeout_secs,
        "ComfyUI engine configured",
    );

    let manager = Arc::new(JobManager::new());
    let workflows = Arc::new(FileWorkflowSource::new(config.workflows_dir.clone()));
    let mut executor = JobExecutor::new(Arc::clone(&manager), Arc::clone(&registry), workflows, engine)
        .with_preemptive_cancel(config.cancel_preemptive);

    // --- Blob relay ---
    if let Some(blob) = &config.blob {
        let store = S3BlobStore::from_env(S3Settings {
            bucket: blob.bucket.clone(),
            public_url: blob.public_url.clone(),
        })
        .await;
        executor = executor.with_blob_relay(BlobRelay::new(Arc::new(store), blob.prefix.clone()));
        tracing::info!(bucket = %blob.bucket, prefix = %blob.prefix, "Blob relay enabled");
    }

    // --- Agent tools ---
    let tools = Arc::new(ToolRegistry::for_services(&registry));
    tracing::info!(count = tools.len(), "Agent tools registered");

    // --- Job cleanup ---
    let cleanup_cancel = tokio_util::sync::CancellationToken::new();
    let cleanup_handle = tokio::spawn(job_cleanup::run(
        Arc::clone(&manager),
        CleanupSchedule {
            retention: chrono::Duration::hours(config.cleanup.retention_hours),
            interval: Duration::from_secs(config.cleanup.interval_secs),
            policy: config.cleanup.policy,
        },
        cleanup_cancel.clone(),
    ));

    // --- App state ---
    let state = AppState {
        executor,
        tools,
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let ip = config
        .host
        .parse()
        .with_context(|| format!("Invalid HOST address '{}'", config.host))?;
    let addr = SocketAddr::new(ip, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    cleanup_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), cleanup_handle).await;
    tracing::info!("Job cleanup task stopped");

    let stats = manager.stats().await;
    tracing::info!(
        running = stats.running,
        pending = stats.pending,
        "Graceful shutdown complete",
    );
    Ok(())
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
