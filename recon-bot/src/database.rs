//! SQLite run store
//!
//! Durable bookkeeping of authorized chat identities and of every run they
//! triggered on the workflow platform.
//!
//! # Database Schema
//!
//! 1. **authorized_users** - presence set of identities allowed to use the bot
//! 2. **user_runs** - one row per (identity, run id) with name, date, status
//!    and the serialized scope
//!
//! Dates are stored as ISO `YYYY-MM-DD` text so ordering by the column is
//! chronological.
//!
//! Every operation opens its own connection and drops it before returning. No
//! transaction spans two operations, so a read followed by a write is not
//! atomic against another writer.

use chrono::NaiveDate;
use recon_bot_sdk::{Identity, Run, RunStatus, Scope};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run {run_id} is already recorded for user {identity}")]
    Conflict { identity: Identity, run_id: String },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to serialize run parameters: {0}")]
    Parameters(#[from] serde_json::Error),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the run database. Cheap to clone; holds only the path.
#[derive(Debug, Clone)]
pub struct RunStore {
    path: PathBuf,
}

impl RunStore {
    /// Create a store backed by the SQLite file at `path`
    pub fn new(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.path)?;
        // The poller and the dispatcher write from different tasks
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Create both tables if they do not exist yet
    pub fn initialize_schema(&self) -> StoreResult<()> {
        let conn = self.connect()?;

        // WAL is persistent on the database file
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS authorized_users (
                user_id INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS user_runs (
                user_id INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                name TEXT NOT NULL,
                date TEXT NOT NULL,
                status TEXT NOT NULL,
                parameters TEXT NOT NULL,
                PRIMARY KEY (user_id, run_id)
            );

            CREATE INDEX IF NOT EXISTS idx_user_runs_status ON user_runs(status);
            CREATE INDEX IF NOT EXISTS idx_user_runs_run_id ON user_runs(run_id);
            "#,
        )?;

        Ok(())
    }

    /// Add `identity` to the allow-list. Repeated calls are no-ops.
    pub fn authorize(&self, identity: Identity) -> StoreResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO authorized_users (user_id) VALUES (?1)",
            params![identity.0],
        )?;
        Ok(())
    }

    pub fn is_authorized(&self, identity: Identity) -> StoreResult<bool> {
        let conn = self.connect()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM authorized_users WHERE user_id = ?1",
                params![identity.0],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record a freshly triggered run in Pending state.
    ///
    /// Fails with [`StoreError::Conflict`] if the identity already has a run
    /// with this id.
    pub fn record_run(
        &self,
        identity: Identity,
        run_id: &str,
        name: &str,
        created_at: NaiveDate,
        parameters: &Scope,
    ) -> StoreResult<()> {
        let parameters = serde_json::to_string(parameters)?;
        let date = created_at.format(DATE_FORMAT).to_string();

        let conn = self.connect()?;
        let result = conn.execute(
            r#"
            INSERT INTO user_runs (user_id, run_id, name, date, status, parameters)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                identity.0,
                run_id,
                name,
                date,
                RunStatus::Pending.as_str(),
                parameters
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                Err(StoreError::Conflict {
                    identity,
                    run_id: run_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run id with the latest date for `identity`.
    ///
    /// Runs from the same day are ordered by insertion; callers should not
    /// rely on that.
    pub fn most_recent_run(&self, identity: Identity) -> StoreResult<Option<String>> {
        let conn = self.connect()?;
        let run_id = conn
            .query_row(
                r#"
                SELECT run_id FROM user_runs
                WHERE user_id = ?1
                ORDER BY date DESC, rowid DESC
                LIMIT 1
                "#,
                params![identity.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(run_id)
    }

    /// All runs of `identity` in insertion order
    pub fn list_runs(&self, identity: Identity) -> StoreResult<Vec<Run>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, run_id, name, date, status, parameters
            FROM user_runs
            WHERE user_id = ?1
            ORDER BY rowid ASC
            "#,
        )?;

        let runs = stmt
            .query_map(params![identity.0], map_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// A single run, only if it belongs to `identity`
    pub fn get_run(&self, identity: Identity, run_id: &str) -> StoreResult<Option<Run>> {
        let conn = self.connect()?;
        let run = conn
            .query_row(
                r#"
                SELECT user_id, run_id, name, date, status, parameters
                FROM user_runs
                WHERE user_id = ?1 AND run_id = ?2
                "#,
                params![identity.0, run_id],
                map_run_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Every run still waiting for the platform, across all identities
    pub fn pending_runs(&self) -> StoreResult<Vec<Run>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, run_id, name, date, status, parameters
            FROM user_runs
            WHERE status = ?1
            ORDER BY rowid ASC
            "#,
        )?;

        let runs = stmt
            .query_map(params![RunStatus::Pending.as_str()], map_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Move every Pending record with `run_id` to `status`.
    ///
    /// Returns the number of rows changed. Records already Completed or Failed
    /// are left alone, and an unknown run id changes nothing.
    pub fn set_status(&self, run_id: &str, status: RunStatus) -> StoreResult<usize> {
        if !RunStatus::Pending.can_transition_to(status) {
            return Ok(0);
        }

        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE user_runs SET status = ?1 WHERE run_id = ?2 AND status = ?3",
            params![status.as_str(), run_id, RunStatus::Pending.as_str()],
        )?;
        Ok(updated)
    }
}

/// Map a database row to a Run
fn map_run_row(row: &Row) -> rusqlite::Result<Run> {
    let user_id: i64 = row.get(0)?;
    let run_id: String = row.get(1)?;
    let name: String = row.get(2)?;
    let date_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let parameters_str: String = row.get(5)?;

    let created_at = NaiveDate::parse_from_str(&date_str, DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let status = status_str.parse::<RunStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let parameters: Scope = serde_json::from_str(&parameters_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Run {
        identity: Identity(user_id),
        run_id,
        name,
        created_at,
        status,
        parameters,
    })
}
