/// Database module for SQLite persistence
///
/// This module provides optional persistence for task history. The
/// executor calls the repository through a save-hook and never requires
/// a save to succeed for execution to proceed. It uses sqlx with
/// parameterized queries and WAL mode for better concurrency.
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

pub mod tasks;

// Re-export commonly used types
pub use tasks::{StepRecord, TaskRecord, TaskRepository};

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode for better concurrency
    /// 3. Run migrations to set up the schema
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {}", db_path.display());

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        // Configure SQLite connection with WAL mode
        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .disable_statement_logging();

        // Create connection pool
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    ///
    /// Migrations are idempotent and can be run multiple times safely.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_initial.sql")?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection pool gracefully
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
