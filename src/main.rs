//! CLI for PopCore
//!
//! Subcommands:
//! - `serve`: open the store, start delivery and wait for ctrl-c
//! - `inspect`: print the persisted messages of one queue

use std::sync::Arc;

use clap::Parser;
use config::ConfigError;
use popcore::broker::Broker;
use popcore::config::{Settings, load_config, load_config_from};
use popcore::persistence::{MessageDao, SledMessageDao};
use popcore::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "popcore")]
enum Command {
    /// Start the broker core
    Serve {
        /// Configuration file to load instead of config/default
        #[arg(long)]
        config: Option<String>,
    },
    /// Print the messages stored for a queue
    Inspect {
        queue: String,
        #[arg(long)]
        config: Option<String>,
    },
}

fn settings(config: Option<&str>) -> Result<Settings, ConfigError> {
    match config {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let result = match cmd {
        Command::Serve { config } => run_server(config.as_deref()).await,
        Command::Inspect { queue, config } => inspect(&queue, config.as_deref()),
    };
    if let Err(e) = result {
        logging::init("info");
        error!("popcore failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_server(config: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = settings(config)?;
    logging::init(&settings.logging.level);

    let broker = Broker::open(settings)?;
    broker.scheduler().start();
    info!(path = %broker.settings().store.path, "broker core ready");

    let sweeper = tokio::spawn(expire_branches(broker.clone()));
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");

    sweeper.abort();
    broker.shutdown();
    Ok(())
}

/// Rolls back timed out distributed transactions once a second.
async fn expire_branches(broker: Arc<Broker>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        interval.tick().await;
        let expired = broker.dtx_registry().rollback_expired();
        if expired > 0 {
            info!(expired, "timed out transactions rolled back");
        }
    }
}

fn inspect(queue: &str, config: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = settings(config)?;
    logging::init(&settings.logging.level);

    let dao = SledMessageDao::open(&settings.store.path)?;
    for stored in dao.read_all(queue)? {
        let line = serde_json::json!({
            "id": stored.id,
            "routing_key": stored.metadata.routing_key,
            "exchange": stored.metadata.exchange_name,
            "content_length": stored.metadata.content_length,
            "queues": stored.queues,
            "redelivery_count": stored.redelivery_count,
        });
        println!("{line}");
    }
    Ok(())
}
