#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! `PostGIS` persistence for the SafeRoute scoring engine.
//!
//! Owns the grid schema: the seeded crime-category taxonomy, the
//! `crime_events` store, the `safety_cells` aggregate table, the
//! `grid_meta` version row the cache layer invalidates on, and the
//! `ingestion_runs` bookkeeping table. Spatial queries go through raw SQL
//! via `query_raw_params()`; everything temporal (recency, time-of-day)
//! stays out of this layer and is applied by the read services in memory.
//!
//! Migrations live at the workspace root (`migrations/`) rather than in
//! this package because both binaries — the API server and the admin CLI —
//! run them at startup, and the ingestion job may race the server on a
//! fresh database; every statement is therefore written `IF NOT EXISTS` /
//! `ON CONFLICT DO NOTHING` so a concurrent second run is harmless.

pub mod db;
pub mod queries;

use include_dir::{Dir, include_dir};
use switchy_database::Database;
use switchy_schema::discovery::embedded::EmbeddedMigrationSource;
use switchy_schema::runner::MigrationRunner;

/// SQL migrations embedded from the workspace-root `migrations/`
/// directory, shared by the server and CLI binaries.
static MIGRATIONS_DIR: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/../../migrations");

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Connecting to the database failed.
    #[error("Database connection error: {message}")]
    Connection {
        /// Description of what went wrong.
        message: String,
    },

    /// Database query error.
    #[error("Database error: {0}")]
    Database(#[from] switchy_database::DatabaseError),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] switchy_schema::MigrationError),

    /// A row failed to decode into its engine type (bad month text,
    /// unparseable stats JSON, unknown run status).
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}

impl DbError {
    /// Shorthand for a [`DbError::Conversion`] used by the row decoders in
    /// [`queries`].
    #[must_use]
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }
}

/// Applies all pending migrations: `PostGIS` extension, grid schema,
/// category seed, and the `grid_meta` singleton row.
///
/// Idempotent; safe for the server and the CLI to both call at startup.
///
/// # Errors
///
/// Returns [`DbError`] if any migration fails to apply (most commonly the
/// `CREATE EXTENSION postgis` step on an image without `PostGIS`).
pub async fn run_migrations(db: &dyn Database) -> Result<(), DbError> {
    let source = EmbeddedMigrationSource::new(&MIGRATIONS_DIR);
    let runner = MigrationRunner::new(Box::new(source));
    runner.run(db).await?;
    log::info!("Database migrations completed successfully");
    Ok(())
}
