//! Postgres connection handling shared by the durable stores.
//!
//! The stores expose synchronous traits (they are called from dispatcher
//! threads), so every query is driven to completion on a captured tokio
//! runtime handle. Callers must not invoke these stores from inside an async
//! task; use `spawn_blocking` there.

use std::future::Future;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/0001_scheduling_and_sessions.sql");

/// Failure classes surfaced by the Postgres adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbFailure {
    /// Connection-level problem; the operation may succeed later.
    Unavailable(String),
    /// Unique constraint violation (`23505`).
    Duplicate(String),
    /// The query ran but the data did not match expectations.
    Data(String),
}

/// Classify a sqlx error for the store-specific error enums.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DbFailure {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => DbFailure::Duplicate(msg),
                // Class 08: connection exceptions. 57P: operator intervention.
                Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                    DbFailure::Unavailable(msg)
                }
                _ => DbFailure::Data(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            DbFailure::Data(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::RowNotFound => DbFailure::Data(format!("row not found in {operation}")),
        other => DbFailure::Unavailable(format!("{operation}: {other}")),
    }
}

/// Pool plus the runtime that drives it.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
    runtime: Handle,
}

impl PgDatabase {
    /// Connect a pool on `runtime`. Blocks the calling thread until connected.
    pub fn connect(url: &str, max_connections: u32, runtime: Handle) -> Result<Self, sqlx::Error> {
        let pool = runtime.block_on(
            PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url),
        )?;
        info!(max_connections, "postgres pool connected");
        Ok(Self { pool, runtime })
    }

    pub fn from_pool(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job and session tables if they do not exist.
    pub fn migrate(&self) -> Result<(), sqlx::Error> {
        self.block_on(async { sqlx::raw_sql(SCHEMA).execute(&self.pool).await })?;
        info!("scheduling and session schema ready");
        Ok(())
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
