//! Session Coordinator
//!
//! WebSocket signaling server in front of a mediasoup worker, with HLS
//! egress of the active video track.
//!
//! # Servers
//!
//! - WebSocket signaling on `/ws` (default: 0.0.0.0:3000)
//! - HTTP health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize logging and the Prometheus metrics recorder
//! 3. Start the media engine (worker + router)
//! 4. Start the coordinator (egress bridge, registries, engine supervisor)
//! 5. Bind health and signaling servers
//! 6. Wait for a shutdown signal or worker death

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;

use sc_service::actors::SessionCoordinator;
use sc_service::config::Config;
use sc_service::egress::FfmpegTranscoder;
use sc_service::engine::mediasoup::MediasoupEngine;
use sc_service::observability::{health_router, init_metrics_recorder, HealthState};
use sc_service::signaling::signaling_router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration first: it decides the log format
    let config = Config::from_env()?;

    let filter = EnvFilter::try_new(&config.observability.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(common::config::DEFAULT_LOG_FILTER));
    if config.observability.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Session Coordinator");
    info!(
        sc_id = %config.sc_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        notification_scope = config.notification_scope.as_str(),
        rtc_min_port = config.engine.rtc_min_port,
        rtc_max_port = config.engine.rtc_max_port,
        hls_output_dir = %config.egress.output_dir.display(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());

    info!("Starting media engine...");
    let engine = MediasoupEngine::start(config.engine.clone())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start media engine");
            e
        })?;
    info!("Media engine started");

    let transcoder = Arc::new(FfmpegTranscoder::from_config(&config.egress));
    let coordinator = Arc::new(
        SessionCoordinator::start(
            Arc::new(engine),
            transcoder,
            &config,
            Arc::clone(&health_state),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start session coordinator");
            e
        })?,
    );

    let shutdown_token = CancellationToken::new();

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let health_listener = TcpListener::bind(health_addr).await.map_err(|e| {
        error!(error = %e, addr = %health_addr, "Failed to bind health server");
        format!("Failed to bind health server to {health_addr}: {e}")
    })?;

    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;
    let signaling_listener = TcpListener::bind(signaling_addr).await.map_err(|e| {
        error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
        format!("Failed to bind signaling server to {signaling_addr}: {e}")
    })?;

    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));
    let health_shutdown = shutdown_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });
    info!(addr = %health_addr, "Health server started");

    let signaling_app = signaling_router(Arc::clone(&coordinator));
    let signaling_shutdown = shutdown_token.child_token();
    tokio::spawn(async move {
        let server =
            axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(async move {
                signaling_shutdown.cancelled().await;
                info!("Signaling server shutting down");
            });
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });
    info!(addr = %signaling_addr, "Signaling server started");

    info!("Session Coordinator running - press Ctrl+C to shutdown");
    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        reason = coordinator.worker_died() => {
            // Readiness is already down; give probes a moment to observe it
            error!(
                reason = %reason,
                exit_delay_ms = config.worker_death_exit_delay.as_millis(),
                "Media worker died, exiting"
            );
            shutdown_token.cancel();
            tokio::time::sleep(config.worker_death_exit_delay).await;
            std::process::exit(1);
        }
    }

    coordinator.shutdown().await;
    shutdown_token.cancel();

    info!("Session Coordinator shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the service
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
