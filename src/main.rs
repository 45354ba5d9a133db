// Tracking Service - Main Entry Point
// Copyright (C) 2024 - discovery, calibration and session control for body-tracking data sources
// Licensed under AGPL v3

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use tracking_service::command_processor::CommandProcessor;
use tracking_service::config::Config;
use tracking_service::constants::SETTINGS_FILE;
use tracking_service::net::messages::{Command, CommandType};
use tracking_service::net::ControlServer;
use tracking_service::settings::JsonFileStore;
use tracking_service::TrackingService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let config = Config::parse();

    // Initialize logging
    init_logging(config.verbose);

    info!("Starting tracking service");
    std::fs::create_dir_all(&config.work_dir)?;

    let settings = Arc::new(JsonFileStore::open(Path::new(&config.work_dir).join(SETTINGS_FILE))?);
    let service = Arc::new(TrackingService::new(config.service_options(), settings));
    if let Err(e) = service.start() {
        // Stays in Error until an explicit restart; status queries still work
        error!("Service did not start cleanly: {}", e);
    }

    // Optional: HTTP server to expose the work directory (status.json, settings.json)
    if let Ok(port_str) = std::env::var("HTTP_PORT") {
        if let Ok(port) = port_str.parse::<u16>() {
            let work_dir = config.work_dir.clone();
            tokio::spawn(async move {
                let listener = match tokio::net::TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)).await {
                    Ok(l) => l,
                    Err(e) => {
                        error!("HTTP server failed to bind to port {}: {}", port, e);
                        return;
                    }
                };
                info!("HTTP server on port {} serving {}", port, work_dir);
                let app = axum::Router::new().nest_service("/", ServeDir::new(work_dir));
                if let Err(e) = axum::serve(listener, app).await {
                    error!("HTTP server error: {}", e);
                }
            });
        }
    }

    // Health probes and status snapshots
    let background = CancellationToken::new();
    let runner = {
        let service = Arc::clone(&service);
        let token = background.clone();
        tokio::spawn(async move { service.run(token).await })
    };

    let processor = Arc::new(CommandProcessor::new(service.clone()));
    processor.start();

    if !config.is_loopback_control() {
        warn!("Control surface on {} is reachable from the network and unauthenticated", config.control_listen);
    }
    let mut server = ControlServer::start(config.control_listen, Arc::clone(&processor), config.command_timeout()).await?;

    if config.discover_on_start {
        let discover = Command::new(CommandType::EnableAutoDiscovery);
        if let Err(e) = processor.enqueue_command(discover) {
            warn!("Initial discovery not queued: {}", e);
        }
    }

    info!("Service ready");

    // Wait for shutdown signal (Ctrl+C)
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal (Ctrl+C)");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            return Err(err.into());
        }
    }

    // Graceful shutdown
    info!("Shutting down...");
    server.shutdown().await;
    service.shutdown();
    processor.stop().await;
    background.cancel();
    let _ = runner.await;

    info!("Service stopped. Final state: {}", service.state());
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
