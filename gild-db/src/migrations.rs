use crate::QueryError;
use diesel::{Connection, ConnectionError, PgConnection, RunQueryDsl};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{debug, info};
use std::error::Error;
use thiserror::Error;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

// "gild" in ascii. Every replica must use the same key so only one of
// them migrates at a time.
const SCHEMA_LOCK_KEY: i64 = 0x6769_6c64;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("couldn't connect to the triage database")]
    Connect(#[source] ConnectionError),

    #[error("couldn't take the schema advisory lock")]
    Lock(#[source] QueryError),

    #[error("schema migration failed")]
    Migrate(#[source] Box<dyn Error + Send + Sync>),
}

fn schema_lock(conn: &mut PgConnection, acquire: bool) -> Result<(), QueryError> {
    let call = if acquire {
        "pg_advisory_lock"
    } else {
        "pg_advisory_unlock"
    };
    diesel::sql_query(format!("SELECT {call}({SCHEMA_LOCK_KEY})"))
        .execute(conn)
        .map(|_| ())
}

/// Brings the `triage` and `data` schemas up to date. Replicas race to
/// run this at startup, so the whole pass happens under a session
/// advisory lock; whoever loses the race waits, then finds nothing left
/// to apply.
pub fn run_migrations(url: &str) -> Result<(), MigrationError> {
    let mut conn = PgConnection::establish(url).map_err(MigrationError::Connect)?;

    schema_lock(&mut conn, true).map_err(MigrationError::Lock)?;
    let outcome = conn
        .run_pending_migrations(MIGRATIONS)
        .map(|versions| versions.len())
        .map_err(MigrationError::Migrate);
    if schema_lock(&mut conn, false).is_err() {
        // Held per session, so postgres reclaims it when this connection
        // closes either way.
        debug!("Leaving the schema advisory lock to session teardown");
    }

    match outcome? {
        0 => debug!("Triage schema already up to date"),
        applied => info!("Applied {applied} schema migrations"),
    }
    Ok(())
}
