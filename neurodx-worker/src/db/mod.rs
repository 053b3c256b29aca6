//! PostgreSQL access
//!
//! The tables are owned by the main service; the worker only writes task
//! outcomes into them.

pub mod tasks;

pub use tasks::{PgTaskStore, TaskStore};

use neurodx_common::config::PostgresConfig;
use neurodx_common::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

/// Open the connection pool described by the configuration
pub async fn connect(config: &PostgresConfig) -> Result<PgPool> {
    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.database);

    tracing::debug!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        "Connecting to database"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    tracing::info!(host = %config.host, database = %config.database, "Database pool ready");
    Ok(pool)
}
