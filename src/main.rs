use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;

use lumen_node::config::Config;
use lumen_node::db::Database;
use lumen_node::herder::InMemoryHerder;
use lumen_node::metrics;
use lumen_node::overlay::manager::OverlayManager;
use lumen_node::overlay::peer_record::PeerRecord;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    // Initialize logging
    init_logging();

    tracing::info!("Starting Lumen node");

    // Load configuration
    let config = Config::load()?;
    let node_info = config.node_info()?;
    tracing::info!(
        node = %node_info.public_key(),
        peer_port = config.overlay.peer_port,
        "Configuration loaded"
    );

    // Connect to database
    let db = Arc::new(Database::connect(&config.database.url).await?);
    tracing::info!("Database connected");

    // Run migrations
    db.run_migrations().await?;
    tracing::info!("Database migrations complete");

    // Seed the peer table with configured peers
    let now = Utc::now();
    for entry in &config.overlay.known_peers {
        let (ip, port) = config.parse_peer(entry)?;
        PeerRecord::new(ip, port, now).insert_if_new(db.pool()).await?;
    }

    // Overlay manager with the in-memory herder
    let herder = Arc::new(InMemoryHerder::new());
    let manager = OverlayManager::new(
        node_info,
        db.clone(),
        herder,
        config.overlay.target_peer_connections,
    );

    // Shutdown channel fed by SIGINT/SIGTERM
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    // Start metrics server
    let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.overlay.metrics_port));
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server error");
        }
    });

    // Keep dialing known peers in the background
    tokio::spawn(manager.clone().maintain_connections(Duration::from_secs(5)));

    // Accept inbound peers until shutdown
    let listen_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.overlay.peer_port));
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "Listening for peers");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, address)) => manager.accept_peer(stream, address),
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }

    manager.shutdown();
    tracing::info!("Lumen node stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lumen_node=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
