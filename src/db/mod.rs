//! SQLite store for projects, roles, users, remote sites and app settings
//!
//! Each submodule owns the rows of one concern and exposes plain functions
//! taking a `&Connection`, so they can run inside a caller's transaction
//! (a `rusqlite::Transaction` derefs to `Connection`).
//!
//! ## Tables
//!
//! - `projects` - Categories and projects (tree via `parent_uuid`)
//! - `users`, `user_groups` - Accounts and group memberships
//! - `roles`, `role_assignments` - Role vocabulary and (project, user) roles
//! - `remote_sites`, `remote_projects` - Linked sites and access edges
//! - `app_settings` - Plugin setting values

pub mod schema;
pub mod projects;
pub mod users;
pub mod roles;
pub mod remote;
pub mod settings;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SyncError;

/// SQLite database holding the local state of a site
///
/// The connection sits behind a mutex, so at most one reconciliation runs
/// against a store at a time.
pub struct SyncDb {
    conn: Mutex<Connection>,
}

impl SyncDb {
    /// Open or create the database
    pub fn open(db_path: &Path) -> Result<Self, SyncError> {
        info!("Opening SQLite database at {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| SyncError::Internal(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| SyncError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        Self::init(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, SyncError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, SyncError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read operation on the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&Connection) -> Result<T, SyncError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| SyncError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut Connection) -> Result<T, SyncError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| SyncError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, SyncError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, SyncError> {
                let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
                Ok(n as u64)
            };

            Ok(DbStats {
                project_count: count("projects")?,
                user_count: count("users")?,
                role_assignment_count: count("role_assignments")?,
                remote_site_count: count("remote_sites")?,
                remote_project_count: count("remote_projects")?,
                app_setting_count: count("app_settings")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub project_count: u64,
    pub user_count: u64,
    pub role_assignment_count: u64,
    pub remote_site_count: u64,
    pub remote_project_count: u64,
    pub app_setting_count: u64,
}

/// Current UTC timestamp as RFC 3339 string for SQLite TEXT columns
pub fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Read a TEXT column holding a UUID
pub(crate) fn uuid_column(row: &Row, name: &str) -> rusqlite::Result<Uuid> {
    let text: String = row.get(name)?;
    parse_uuid(row, name, &text)
}

/// Read a nullable TEXT column holding a UUID
pub(crate) fn opt_uuid_column(row: &Row, name: &str) -> rusqlite::Result<Option<Uuid>> {
    let text: Option<String> = row.get(name)?;
    text.map(|t| parse_uuid(row, name, &t)).transpose()
}

fn parse_uuid(row: &Row, name: &str, text: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| {
        let idx = row.as_ref().column_index(name).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

/// Bind helper for nullable UUID columns
pub(crate) fn opt_uuid_param(value: Option<Uuid>) -> Option<String> {
    value.map(|u| u.to_string())
}

// Re-exports
pub use projects::ProjectRow;
pub use users::UserRow;
pub use roles::{AssignmentRow, RoleRow};
pub use remote::{RemoteProjectRow, RemoteSiteRow};
pub use settings::AppSettingRow;
