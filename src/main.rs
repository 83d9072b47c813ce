use clap::Parser;
use tracing::{error, info};

use rover_relay::cli::{self, Cli, Commands};
use rover_relay::config::Config;
use rover_relay::protocol::{EventPayload, UiFrame};
use rover_relay::{build_router, reaper, RelayState};

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Some(Commands::Watch { url, robot, name }) = cli.command {
        if let Err(err) = cli::run_watch(url, robot, name).await {
            error!("watch client error: {err}");
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    let state = RelayState::new();
    reaper::spawn_reapers(&state);

    let app = build_router(state.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };
    info!("rover relay listening on {addr}");

    tokio::select! {
        result = async { axum::serve(listener, app).await } => {
            if let Err(err) = result {
                error!("server error: {err}");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal(state) => {
            info!("shutting down");
        }
    }
}

/// Wait for the termination signal, then tell every operator the relay
/// is going away and give the writer tasks a moment to flush.
async fn shutdown_signal(state: RelayState) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, notifying operators");
    state
        .broadcast_to_all(&UiFrame::Event {
            payload: EventPayload::ServerShutdown,
        })
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
}
