//! Schema migrations for the event and webhook delivery core.
//!
//! Migrations run once per physical database (they create the `eventd`
//! bootstrap schema and the `create_tenant_schema()` helper function); per
//! tenant schema creation itself happens through that helper at onboarding
//! time, not through this migrator.

use sqlx::PgPool;
use tracing::info;

use crate::{InfraError, Result};

/// One applied migration, as reported by `sqlx`'s migration table.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: String,
}

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Applies all pending migrations. Safe to call on every startup: already
/// applied migrations are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<Vec<Migration>> {
    info!("Applying database migrations");
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| InfraError::Migration(e.to_string()))?;

    let rows = sqlx::query_as::<_, (i64, String)>(
        "SELECT version, description FROM _sqlx_migrations ORDER BY version ASC",
    )
    .fetch_all(pool)
    .await
    .map_err(InfraError::Database)?;

    Ok(rows
        .into_iter()
        .map(|(version, description)| Migration { version, description })
        .collect())
}

/// Reverts the most recently applied migration. Intended for local
/// development only; production rollbacks go through a forward-fixing
/// migration instead.
pub async fn rollback_migrations(pool: &PgPool) -> Result<()> {
    info!("Rolling back last database migration");

    // `Migrator::undo` targets a specific version; roll back exactly one
    // step by undoing to the version before the most recently applied one.
    let applied: Vec<(i64,)> =
        sqlx::query_as("SELECT version FROM _sqlx_migrations ORDER BY version DESC LIMIT 2")
            .fetch_all(pool)
            .await
            .map_err(InfraError::Database)?;

    let target = applied.get(1).map(|(v,)| *v).unwrap_or(0);
    MIGRATOR
        .undo(pool, target)
        .await
        .map_err(|e| InfraError::Migration(e.to_string()))
}
