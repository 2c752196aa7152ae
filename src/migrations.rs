use sqlx::migrate::{MigrateError, Migrator};
use sqlx::PgPool;
use tracing::{info, warn};

/// Runs the embedded migrations. A migration edited after it was applied has
/// its stored checksum rewritten instead of aborting startup; migrations that
/// exist only in the database are ignored.
pub async fn run_with_repair(pool: &PgPool) -> Result<(), MigrateError> {
    let mut migrator: Migrator = sqlx::migrate!("./migrations");
    let mut attempts = 0usize;

    loop {
        match migrator.run(pool).await {
            Ok(()) => {
                info!(migrations = migrator.iter().count(), "database schema up to date");
                return Ok(());
            }
            Err(MigrateError::VersionMismatch(version)) => {
                attempts += 1;
                if attempts > migrator.iter().count() {
                    return Err(MigrateError::VersionMismatch(version));
                }

                let Some(migration) = migrator.iter().find(|migration| migration.version == version)
                else {
                    return Err(MigrateError::VersionMissing(version));
                };

                warn!(version, "migration checksum changed; repairing");
                sqlx::query("UPDATE _sqlx_migrations SET checksum = $1 WHERE version = $2")
                    .bind(migration.checksum.as_ref())
                    .bind(version)
                    .execute(pool)
                    .await
                    .map_err(MigrateError::Execute)?;
            }
            Err(MigrateError::VersionMissing(version)) => {
                warn!(version, "applied migration missing from this build; ignoring");
                migrator.set_ignore_missing(true);
                return migrator.run(pool).await;
            }
            Err(error) => return Err(error),
        }
    }
}
