use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;

use roomcast::admission::AdmissionLimiter;
use roomcast::config;
use roomcast::logging;
use roomcast::media;
use roomcast::metrics::register_metrics;
use roomcast::room::Room;
use roomcast::server::{self, ServerContext};

/// Single-room audio/video SFU.
#[derive(Parser, Debug)]
#[command(name = "roomcast", about = "Single-room audio/video SFU")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// Path to the JSON configuration document.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Validate the configuration before starting the server
    let cfg = config::load(args.addr, args.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    // Initialize tracing with validated RUST_LOG
    logging::init(&cfg.rust_log);

    // Initialize Metrics
    register_metrics();

    let room = Room::new();
    let ctx = ServerContext {
        room: room.clone(),
        limiter: Arc::new(AdmissionLimiter::new()),
        api: Arc::new(media::build_api()?),
        rtc_config: media::rtc_config(),
        max_connections: cfg.max_connections,
    };

    let ticker = server::spawn_keyframe_ticker(room.clone());

    // Create shutdown signal handler
    let shutdown_signal = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal (SIGINT/SIGTERM)");
    };

    info!(addr = %cfg.addr, max_connections = cfg.max_connections, "SFU server listening");
    let (_, serving) =
        warp::serve(server::routes(ctx)).bind_with_graceful_shutdown(cfg.addr, shutdown_signal);
    serving.await;

    // Shutdown sequence
    info!("Shutting down SFU - closing active peer connections...");
    room.shutdown().await;
    ticker.abort();
    info!("SFU shutdown complete");

    Ok(())
}
