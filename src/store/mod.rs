//! SQLite-backed configuration and account store.
//!
//! All server configuration and worker accounts live in three tables:
//! `config(var, value)`, `workers(id, username)` and
//! `workerdata(worker, var, value)`. Values are stored as strings and
//! type-converted on read; a missing or unparseable value yields the
//! caller's default.

mod account;

pub use account::Account;

use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Cloneable handle to the SQLite store.
///
/// Queries are short, point lookups; the connection is shared behind a
/// mutex and never held across suspension points.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a transient in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }

    /// Create the schema and seed it with initial configuration plus an
    /// administrator account.
    pub fn populate(
        &self,
        config: &[(String, String)],
        admin_user: &str,
        admin_pass: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE config (var VARCHAR UNIQUE, value VARCHAR);
             CREATE TABLE workers (id INTEGER PRIMARY KEY, username VARCHAR UNIQUE);
             CREATE TABLE workerdata (worker INT, var VARCHAR, value VARCHAR);",
        )?;

        for (var, value) in config {
            conn.execute(
                "INSERT INTO config (var, value) VALUES (?1, ?2);",
                params![var, value],
            )?;
        }

        conn.execute(
            "INSERT INTO workers (username) VALUES (?1);",
            params![admin_user],
        )?;
        let admin = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO workerdata (worker, var, value) VALUES (?1, 'password', ?2);",
            params![admin, admin_pass],
        )?;
        conn.execute(
            "INSERT INTO workerdata (worker, var, value) VALUES (?1, 'admin', 1);",
            params![admin],
        )?;

        Ok(())
    }

    /// Read a raw configuration value.
    pub fn get_config_raw(&self, var: &str) -> Option<String> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM config WHERE var=?1 LIMIT 1;",
            params![var],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or_else(|e| {
            warn!("config read for {} failed: {}", var, e);
            None
        })
    }

    /// Read a configuration value converted to `T`, or `None` when the
    /// variable is missing or does not convert.
    pub fn get_config_opt<T: FromStr>(&self, var: &str) -> Option<T> {
        self.get_config_raw(var).and_then(|v| v.parse().ok())
    }

    /// Read a configuration value converted to `T`, falling back to the
    /// default when missing or unparseable.
    pub fn get_config<T: FromStr>(&self, var: &str, default: T) -> T {
        self.get_config_opt(var).unwrap_or(default)
    }

    /// Write a configuration value; `None` clears the variable.
    pub fn set_config(&self, var: &str, value: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM config WHERE var=?1;", params![var])?;
        if let Some(value) = value {
            conn.execute(
                "INSERT INTO config (var, value) VALUES (?1, ?2);",
                params![var, value],
            )?;
        }
        Ok(())
    }

    /// Retrieve every configuration variable.
    pub fn all_config(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT var, value FROM config;")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut config = HashMap::new();
        for row in rows {
            let (var, value): (String, String) = row?;
            config.insert(var, value);
        }
        Ok(config)
    }
}
