use std::sync::Arc;

use notifycast::broker::Server;
use notifycast::config::load_config;
use notifycast::utils::logging;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.log.level, settings.log.json);

    let manager_interval = settings.broker.manager_interval();
    let delayed_sender_interval = settings.broker.delayed_sender_interval();
    let keepalive_interval = settings.broker.keepalive_interval();
    let server = match Server::new(settings).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(error = %e, "Failed to start server");
            std::process::exit(1);
        }
    };
    info!("notifycast core running");

    tokio::select! {
        _ = server.clone().run_manager(manager_interval) => {}
        _ = server.clone().run_delayed_sender(delayed_sender_interval) => {}
        _ = server.clone().run_keepalive_sender(keepalive_interval) => {}
        _ = server.clone().run_stats_resetter() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    if let Err(e) = server.close().await {
        error!(error = %e, "Error closing message cache");
    }
}
