use std::sync::Arc;

use hostdhcp::agent::DhcpAgent;
use hostdhcp::config::{self, Config};
use hostdhcp::guest::StaticGuestTable;

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    if let Err(err) = run().await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run() -> hostdhcp::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_PATH.to_owned());
    let config = Config::from_file(&path)?;

    let guests = StaticGuestTable::new();
    for entry in &config.guests {
        guests.insert(entry.guest.clone(), entry.candidate);
    }
    tracing::info!("loaded {} guests from {}", guests.len(), path);

    let agent = DhcpAgent::new(&config, Arc::new(guests))?;
    tracing::info!("serving on {}", config.interface);
    agent.run().await
}
