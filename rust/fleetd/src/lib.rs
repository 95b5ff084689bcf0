#![recursion_limit = "256"]

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executions;
pub mod models;
pub mod permissions;
pub mod queries;
pub mod registry;
pub mod schema;
pub mod server;
pub mod state;
pub mod store;
pub mod targeting;
pub mod telemetry;
pub mod users;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the fleetd service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
