//! Entry point: load configuration, open the database, connect the
//! brokers, and serve HTTP.

use argh::FromArgs;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use weather_gateway::broker::Broker;
use weather_gateway::config::Config;
use weather_gateway::db::Database;
use weather_gateway::http;

#[derive(FromArgs)]
/// Weather aggregation gateway - subscribes to station brokers and
/// re-exposes readings over HTTP.
struct Args {
    /// path to the TOML configuration file
    #[argh(positional, default = "String::from(\"config.toml\")")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args: Args = argh::from_env();

    let config = Config::from_file(&args.config)?;
    log::info!("Loaded configuration from {}", args.config);

    let db = Database::open(&config.database)?;
    log::info!("Opened database at {}", config.database);

    let mut brokers = HashMap::new();
    for (name, url) in &config.brokers {
        log::info!("Connecting to broker {name} at {url}...");
        let broker = Broker::connect(db.clone(), &config.id, name, url).await?;
        brokers.insert(name.clone(), broker);
    }
    let brokers = Arc::new(brokers);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(());
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, shutting down...");
        shutdown_tx.send(()).ok();
    })?;

    let state = http::AppState {
        db,
        brokers: brokers.clone(),
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    log::info!("HTTP server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.changed().await.ok();
        })
        .await?;

    for broker in brokers.values() {
        broker.disconnect().await;
    }
    log::info!("Weather gateway stopped.");

    Ok(())
}
