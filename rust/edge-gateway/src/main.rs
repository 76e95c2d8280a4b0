//! Edge Gateway - Main Entry Point
//!
//! Public front door for the private API: admission control, authentication,
//! caching, compression and proxying.

use std::net::SocketAddr;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use edge_gateway::config::AppConfig;
use edge_gateway::server::{create_app, spawn_maintenance};

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "edge-gateway")]
#[command(about = "Edge Gateway - admission, auth, caching and proxying for a private API")]
#[command(version)]
struct Args {
    /// Host to bind to. Overrides the configured value.
    #[arg(long, env = "GATEWAY_HOST")]
    host: Option<String>,

    /// Port to listen on. Overrides the configured value.
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Log level. `RUST_LOG` takes precedence when set.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load()?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_tracing(log_level, args.json || config.logging.json);

    tracing::info!("Starting Edge Gateway v{}", env!("CARGO_PKG_VERSION"));

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    tracing::info!("Configuration loaded");

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let (app, state) = create_app(config)?;
    let maintenance = spawn_maintenance(&state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in maintenance {
        task.abort();
    }

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Initialize tracing/logging.
fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
