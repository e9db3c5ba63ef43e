//! Database module for recording state storage.
//!
//! This module provides SQLite-based persistent storage for:
//! - Recording rules (user intent, with their post-processing tasks)
//! - Recording history (captured and in-progress recordings)
//! - The recorded-show ledger preventing duplicate captures
//! - The show cache used as the local guide
//! - Scheduler timing configuration

mod models;
mod recorded_show;
mod recording;
mod recording_rule;
mod schema;
mod show_airing;

pub use models::SchedulerConfigRecord;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use thiserror::Error;

/// Shared handle to the database used by all long-running tasks.
pub type DatabaseHandle = Arc<tokio::sync::Mutex<Database>>;

/// Database error types.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid model value: {0}")]
    Model(#[from] pvr_protocol::ModelError),

    #[error("Recording rule not found: {0}")]
    RuleNotFound(String),

    #[error("Recording not found: {0}")]
    RecordingNotFound(i64),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Main database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;

        let db = Self { conn };
        db.initialize_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self { conn };
        db.initialize_schema()?;

        Ok(db)
    }

    /// Wrap the database into the shared handle.
    pub fn into_handle(self) -> DatabaseHandle {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Initialize the database schema.
    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(schema::SCHEMA_SQL)?;
        self.apply_migrations()?;
        Ok(())
    }

    /// Add a column to a table if it doesn't exist.
    fn add_column_if_not_exists(&self, table: &str, column: &str, column_type: &str) -> Result<()> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let column_exists = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .any(|name| name == column);

        if !column_exists {
            let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type);
            self.conn.execute(&sql, [])?;
            log::info!("Migration: Added column {} to table {}", column, table);
        }

        Ok(())
    }

    /// Apply pending migrations.
    fn apply_migrations(&self) -> Result<()> {
        // Migration 001: channel display names on rules and recordings
        self.add_column_if_not_exists("recording_rules", "channel_name", "TEXT")?;
        self.add_column_if_not_exists("recordings", "channel_name", "TEXT")?;

        // Migration 002: watchdog policy moved into the scheduler config row
        self.add_column_if_not_exists("scheduler_config", "watchdog_check_interval_ms", "INTEGER DEFAULT 2000")?;
        self.add_column_if_not_exists("scheduler_config", "watchdog_failure_threshold", "INTEGER DEFAULT 20")?;

        // Migration 003: removals requested by the command line survive until the janitor runs
        self.add_column_if_not_exists("recordings", "pending_removal", "INTEGER DEFAULT 0")?;

        Ok(())
    }

    /// Get the underlying connection (for advanced queries).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// Scheduler configuration storage.
impl Database {
    /// Get the scheduler configuration row.
    ///
    /// When the row does not exist yet it is seeded from `seed` and the
    /// seed is returned.
    pub fn get_scheduler_config(&self, seed: &SchedulerConfigRecord) -> Result<SchedulerConfigRecord> {
        let result = self.conn.query_row(
            "SELECT tick_interval_secs, recheck_interval_secs, claim_retry_limit, claim_retry_backoff_ms,
                    watchdog_check_interval_ms, watchdog_failure_threshold
             FROM scheduler_config WHERE id = 1",
            [],
            |row| {
                Ok(SchedulerConfigRecord {
                    tick_interval_secs: row.get(0)?,
                    recheck_interval_secs: row.get(1)?,
                    claim_retry_limit: row.get(2)?,
                    claim_retry_backoff_ms: row.get(3)?,
                    watchdog_check_interval_ms: row.get(4)?,
                    watchdog_failure_threshold: row.get(5)?,
                })
            },
        );

        match result {
            Ok(config) => Ok(config),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                self.update_scheduler_config(seed)?;
                Ok(seed.clone())
            }
            Err(e) => Err(DatabaseError::Sqlite(e)),
        }
    }

    /// Update the scheduler configuration row.
    pub fn update_scheduler_config(&self, config: &SchedulerConfigRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO scheduler_config
             (id, tick_interval_secs, recheck_interval_secs, claim_retry_limit, claim_retry_backoff_ms,
              watchdog_check_interval_ms, watchdog_failure_threshold, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, strftime('%s', 'now'))",
            rusqlite::params![
                config.tick_interval_secs,
                config.recheck_interval_secs,
                config.claim_retry_limit,
                config.claim_retry_backoff_ms,
                config.watchdog_check_interval_ms,
                config.watchdog_failure_threshold,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.connection().is_autocommit());
    }

    #[test]
    fn test_schema_creation() {
        let db = Database::open_in_memory().unwrap();

        let count: i32 = db
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('recording_rules', 'recordings', 'recorded_shows', 'show_airings', 'scheduler_config')",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(count, 5);
    }

    #[test]
    fn test_scheduler_config_seeded_once() {
        let db = Database::open_in_memory().unwrap();
        let seed = SchedulerConfigRecord::default();

        let first = db.get_scheduler_config(&seed).unwrap();
        assert_eq!(first, seed);

        let mut changed = seed.clone();
        changed.tick_interval_secs = 30;
        db.update_scheduler_config(&changed).unwrap();

        // Stored row wins over the seed from now on
        let second = db.get_scheduler_config(&seed).unwrap();
        assert_eq!(second.tick_interval_secs, 30);
    }
}
