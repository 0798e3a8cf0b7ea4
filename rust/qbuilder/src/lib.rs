pub mod aggregation;
pub mod config;
pub mod error;
pub mod filter;
pub mod group_by;
pub mod legacy;
pub mod legend;
pub mod model;
pub mod pagination;
pub mod payload;
pub mod server;
pub mod splitter;
pub mod state;
pub mod telemetry;
pub mod time;
pub mod views;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the composition service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).run().await
}
