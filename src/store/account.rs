//! Worker accounts and per-account data.

use super::Database;
use crate::error::Result;
use rusqlite::{params, OptionalExtension};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::str::FromStr;

/// A worker account stored in the database.
///
/// Account data is a free-form variable map; well-known variables include
/// `password`, `admin`, `max_clones` and per-account configuration
/// overrides stored as `config_<var>`.
#[derive(Clone)]
pub struct Account {
    db: Database,
    id: i64,
    username: String,
}

impl Account {
    /// Look up an account by username.
    pub fn lookup(db: &Database, username: &str) -> Result<Option<Account>> {
        let id = db.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM workers WHERE username=?1 LIMIT 1;",
                params![username],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })?;

        Ok(id.map(|id| Account {
            db: db.clone(),
            id,
            username: username.to_string(),
        }))
    }

    /// Create a new account, or return the existing one.
    pub fn create(db: &Database, username: &str) -> Result<Account> {
        if let Some(existing) = Self::lookup(db, username)? {
            return Ok(existing);
        }

        let id = db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workers (username) VALUES (?1);",
                params![username],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        Ok(Account {
            db: db.clone(),
            id,
            username: username.to_string(),
        })
    }

    /// The account's row id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The account's username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Remove the account and every data row associated with it.
    pub fn delete(self) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM workers WHERE id=?1;", params![self.id])?;
            conn.execute("DELETE FROM workerdata WHERE worker=?1;", params![self.id])?;
            Ok(())
        })
    }

    /// Read a raw data variable for this account.
    pub fn get_data_raw(&self, var: &str) -> Option<String> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM workerdata WHERE worker=?1 AND var=?2 LIMIT 1;",
                    params![self.id, var],
                    |row| row.get(0),
                )
                .optional()
            })
            .unwrap_or(None)
    }

    /// Read a data variable converted to `T`, falling back to the default.
    pub fn get_data<T: FromStr>(&self, var: &str, default: T) -> T {
        self.get_data_raw(var)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Retrieve every data variable for this account.
    pub fn all_data(&self) -> Result<HashMap<String, String>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT var, value FROM workerdata WHERE worker=?1;")?;
            let rows = stmt.query_map(params![self.id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut data = HashMap::new();
            for row in rows {
                let (var, value): (String, String) = row?;
                data.insert(var, value);
            }
            Ok(data)
        })
    }

    /// Write a data variable; `None` clears it.
    pub fn set_data(&self, var: &str, value: Option<&str>) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM workerdata WHERE worker=?1 AND var=?2;",
                params![self.id, var],
            )?;
            if let Some(value) = value {
                conn.execute(
                    "INSERT INTO workerdata (worker, var, value) VALUES (?1, ?2, ?3);",
                    params![self.id, var, value],
                )?;
            }
            Ok(())
        })
    }

    /// Per-account configuration lookup: a `config_<var>` data variable
    /// overrides the server-wide configuration, which in turn falls back
    /// to the given default.
    pub fn get_config<T: FromStr>(&self, var: &str, default: T) -> T {
        if let Some(value) = self
            .get_data_raw(&format!("config_{}", var))
            .and_then(|v| v.parse().ok())
        {
            return value;
        }
        self.db.get_config(var, default)
    }

    /// Optional variant of [`Account::get_config`].
    pub fn get_config_opt<T: FromStr>(&self, var: &str) -> Option<T> {
        self.get_data_raw(&format!("config_{}", var))
            .and_then(|v| v.parse().ok())
            .or_else(|| self.db.get_config_opt(var))
    }

    /// Whether this account may use the administrative interface.
    pub fn is_admin(&self) -> bool {
        self.get_data::<i64>("admin", 0) != 0
    }

    /// The nonce mask size handed to this account's miners.
    pub fn work_mask(&self) -> u8 {
        self.get_config::<u8>("work_mask", 32).min(32)
    }

    /// Check a password against the stored entry.
    ///
    /// Entries starting with `*` hold a lowercase hex SHA-1 of the
    /// password; anything else is compared as plaintext.
    pub fn check_password(&self, password: &str) -> bool {
        if password.is_empty() {
            return false;
        }

        let stored = self.get_data_raw("password").unwrap_or_default();
        match stored.strip_prefix('*') {
            Some(digest) => {
                let hashed = hex::encode(Sha1::digest(password.as_bytes()));
                hashed == digest.to_lowercase()
            }
            None => password == stored,
        }
    }
}
