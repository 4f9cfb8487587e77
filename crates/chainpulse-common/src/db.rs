//! Postgres pool for the indexed store.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Executor, PgPool};

use crate::error::PulseError;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection cap so a wide rollup cannot hold a connection indefinitely.
const STATEMENT_TIMEOUT: &str = "SET statement_timeout = '10s'";

/// Open a pool and bring the schema up to date.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, PulseError> {
    let pool = create_pool(database_url, max_connections).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, PulseError> {
    let options: PgConnectOptions = database_url.parse()?;
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute(STATEMENT_TIMEOUT).await?;
                Ok(())
            })
        })
        .connect_with(options.application_name("chainpulse"))
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), PulseError> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| PulseError::Database(e.into()))
}
