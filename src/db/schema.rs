//! Database schema definitions

use rusqlite::{params, Connection};
use tracing::info;

use crate::access::RoleName;
use crate::error::SyncError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), SyncError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(SyncError::Internal(format!(
            "Database schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    seed_roles(conn)?;
    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, SyncError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    ).map_err(|e| SyncError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), SyncError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| SyncError::Internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| SyncError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(PROJECTS_SCHEMA)
        .map_err(|e| SyncError::Internal(format!("Failed to create project tables: {}", e)))?;

    conn.execute_batch(REMOTE_SCHEMA)
        .map_err(|e| SyncError::Internal(format!("Failed to create remote tables: {}", e)))?;

    conn.execute_batch(SETTINGS_SCHEMA)
        .map_err(|e| SyncError::Internal(format!("Failed to create settings tables: {}", e)))?;

    Ok(())
}

/// Make sure the fixed role vocabulary exists
fn seed_roles(conn: &Connection) -> Result<(), SyncError> {
    for role in RoleName::ALL {
        conn.execute(
            "INSERT OR IGNORE INTO roles (name, rank) VALUES (?, ?)",
            params![role.as_str(), role.rank()],
        ).map_err(|e| SyncError::Internal(format!("Failed to seed role {}: {}", role, e)))?;
    }
    Ok(())
}

/// Projects, users and roles
const PROJECTS_SCHEMA: &str = r#"
-- Categories and projects
CREATE TABLE IF NOT EXISTS projects (
    uuid TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    project_type TEXT NOT NULL,
    parent_uuid TEXT,
    description TEXT NOT NULL DEFAULT '',
    readme TEXT NOT NULL DEFAULT '',
    public_guest_access INTEGER NOT NULL DEFAULT 0,
    submit_status TEXT NOT NULL DEFAULT 'OK',
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),

    FOREIGN KEY (parent_uuid) REFERENCES projects(uuid)
);

-- Titles are unique among siblings, root level included
CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_sibling_title
    ON projects(COALESCE(parent_uuid, ''), title);

CREATE TABLE IF NOT EXISTS users (
    uuid TEXT PRIMARY KEY NOT NULL,
    username TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL DEFAULT '',
    first_name TEXT NOT NULL DEFAULT '',
    last_name TEXT NOT NULL DEFAULT '',
    email TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS auth_groups (
    name TEXT PRIMARY KEY NOT NULL
);

CREATE TABLE IF NOT EXISTS user_groups (
    user_uuid TEXT NOT NULL,
    group_name TEXT NOT NULL,
    PRIMARY KEY (user_uuid, group_name),
    FOREIGN KEY (user_uuid) REFERENCES users(uuid) ON DELETE CASCADE,
    FOREIGN KEY (group_name) REFERENCES auth_groups(name) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS roles (
    name TEXT PRIMARY KEY NOT NULL,
    rank INTEGER NOT NULL
);

-- One role per (project, user)
CREATE TABLE IF NOT EXISTS role_assignments (
    uuid TEXT PRIMARY KEY NOT NULL,
    project_uuid TEXT NOT NULL,
    user_uuid TEXT NOT NULL,
    role_name TEXT NOT NULL,
    UNIQUE (project_uuid, user_uuid),
    FOREIGN KEY (project_uuid) REFERENCES projects(uuid) ON DELETE CASCADE,
    FOREIGN KEY (user_uuid) REFERENCES users(uuid) ON DELETE CASCADE,
    FOREIGN KEY (role_name) REFERENCES roles(name)
);

CREATE INDEX IF NOT EXISTS idx_projects_parent ON projects(parent_uuid);
CREATE INDEX IF NOT EXISTS idx_role_assignments_project ON role_assignments(project_uuid);
"#;

/// Remote sites and per-project access edges
const REMOTE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS remote_sites (
    uuid TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    mode TEXT NOT NULL,
    -- NULL for PEER sites
    secret TEXT,
    user_display INTEGER NOT NULL DEFAULT 1,
    date_access TEXT
);

-- NOTE: No FK on project_uuid, VIEW_AVAILABILITY edges may point at
-- projects which only exist on the source
CREATE TABLE IF NOT EXISTS remote_projects (
    uuid TEXT PRIMARY KEY NOT NULL,
    site_uuid TEXT NOT NULL,
    project_uuid TEXT NOT NULL,
    level TEXT NOT NULL,
    date_access TEXT,
    UNIQUE (site_uuid, project_uuid),
    FOREIGN KEY (site_uuid) REFERENCES remote_sites(uuid) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_remote_projects_project ON remote_projects(project_uuid);
"#;

/// App settings
const SETTINGS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS app_settings (
    uuid TEXT PRIMARY KEY NOT NULL,
    -- NULL for core settings
    app_plugin TEXT,
    name TEXT NOT NULL,
    setting_type TEXT NOT NULL,
    value TEXT NOT NULL DEFAULT '',
    value_json TEXT NOT NULL DEFAULT '{}',
    project_uuid TEXT,
    user_uuid TEXT,
    local INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (project_uuid) REFERENCES projects(uuid) ON DELETE CASCADE,
    FOREIGN KEY (user_uuid) REFERENCES users(uuid) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_app_settings_key ON app_settings(
    COALESCE(app_plugin, ''), name, COALESCE(project_uuid, ''), COALESCE(user_uuid, '')
);
"#;
