//! Postgres pool setup and schema migration.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Pooled connections per instance.  Store calls are short keyed reads
/// and writes, so a small pool is enough.
const MAX_CONNECTIONS: u32 = 10;
/// Fail startup rather than hang when Postgres is unreachable.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect the pool and bring the schema current.  Runs once at startup,
/// before any traffic is served; the caller aborts on error.
pub async fn connect_and_migrate(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
