use std::net::SocketAddr;

use anyhow::Result;
use cashback_ledger::{Config, init_router, init_state};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    info!(cashback_rate = %config.cashback_rate, "starting");

    let state = init_state(config).await?;
    let app = init_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
