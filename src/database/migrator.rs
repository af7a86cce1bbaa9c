//! # Schema Migrations
//!
//! The staged message table ships as a sqlx migration under `migrations/`.
//!
//! ```rust,ignore
//! #[sqlx::test(migrator = "tasker_outbox::database::migrator::MIGRATOR")]
//! async fn test_feature(pool: PgPool) { /* ... */ }
//! ```

use sqlx::PgPool;
use tracing::info;

use crate::error::{OutboxError, OutboxResult};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply outstanding outbox migrations
pub async fn run_migrations(pool: &PgPool) -> OutboxResult<()> {
    info!("Running outbox migrations...");
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| OutboxError::store("migrate", e.to_string()))?;
    info!("Outbox migrations complete");
    Ok(())
}
