//! Remote sites and remote project access edges

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{current_timestamp, uuid_column};
use crate::access::{AccessLevel, SiteMode};
use crate::error::SyncError;

/// Remote site row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSiteRow {
    pub uuid: Uuid,
    pub name: String,
    pub url: String,
    pub description: String,
    pub mode: SiteMode,
    /// Shared secret; never stored for PEER sites
    pub secret: Option<String>,
    /// Show usernames of this site to regular users
    pub user_display: bool,
    pub date_access: Option<String>,
}

impl RemoteSiteRow {
    pub fn new(name: impl Into<String>, url: impl Into<String>, mode: SiteMode) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            url: url.into(),
            description: String::new(),
            mode,
            secret: None,
            user_display: true,
            date_access: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            uuid: uuid_column(row, "uuid")?,
            name: row.get("name")?,
            url: row.get("url")?,
            description: row.get("description")?,
            mode: row.get("mode")?,
            secret: row.get("secret")?,
            user_display: row.get("user_display")?,
            date_access: row.get("date_access")?,
        })
    }
}

/// Access edge between a remote site and a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProjectRow {
    pub uuid: Uuid,
    pub site_uuid: Uuid,
    pub project_uuid: Uuid,
    pub level: AccessLevel,
    pub date_access: Option<String>,
}

impl RemoteProjectRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            uuid: uuid_column(row, "uuid")?,
            site_uuid: uuid_column(row, "site_uuid")?,
            project_uuid: uuid_column(row, "project_uuid")?,
            level: row.get("level")?,
            date_access: row.get("date_access")?,
        })
    }
}

/// Outcome of an edge upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeChange {
    Created,
    LevelChanged,
    Unchanged,
}

const SELECT_SITE: &str =
    "SELECT uuid, name, url, description, mode, secret, user_display, date_access FROM remote_sites";

const SELECT_EDGE: &str =
    "SELECT uuid, site_uuid, project_uuid, level, date_access FROM remote_projects";

pub fn get_site(conn: &Connection, uuid: Uuid) -> Result<Option<RemoteSiteRow>, SyncError> {
    let site = conn
        .query_row(
            &format!("{} WHERE uuid = ?", SELECT_SITE),
            params![uuid.to_string()],
            RemoteSiteRow::from_row,
        )
        .optional()?;
    Ok(site)
}

pub fn list_sites(conn: &Connection, mode: Option<SiteMode>) -> Result<Vec<RemoteSiteRow>, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE COALESCE(?, mode) = mode ORDER BY name",
        SELECT_SITE
    ))?;
    let rows = stmt
        .query_map(params![mode], RemoteSiteRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Find the TARGET site whose secret matches, compared in constant time
pub fn find_target_by_secret(conn: &Connection, secret: &str) -> Result<Option<RemoteSiteRow>, SyncError> {
    if secret.is_empty() {
        return Ok(None);
    }

    let site = list_sites(conn, Some(SiteMode::Target))?
        .into_iter()
        .find(|site| {
            site.secret
                .as_deref()
                .map(|s| constant_time_compare(s, secret))
                .unwrap_or(false)
        });
    Ok(site)
}

pub fn insert_site(conn: &Connection, site: &RemoteSiteRow) -> Result<(), SyncError> {
    let secret = if site.mode == SiteMode::Peer { None } else { site.secret.as_deref() };

    conn.execute(
        r#"
        INSERT INTO remote_sites (uuid, name, url, description, mode, secret, user_display, date_access)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            site.uuid.to_string(),
            site.name,
            site.url,
            site.description,
            site.mode,
            secret,
            site.user_display,
            site.date_access,
        ],
    )?;
    Ok(())
}

/// Update descriptive fields of a site; mode and secret are left untouched
pub fn update_site_info(conn: &Connection, site: &RemoteSiteRow) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE remote_sites SET name = ?, url = ?, description = ?, user_display = ? WHERE uuid = ?",
        params![
            site.name,
            site.url,
            site.description,
            site.user_display,
            site.uuid.to_string(),
        ],
    )?;
    Ok(())
}

pub fn touch_site(conn: &Connection, uuid: Uuid) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE remote_sites SET date_access = ? WHERE uuid = ?",
        params![current_timestamp(), uuid.to_string()],
    )?;
    Ok(())
}

/// All edges of a site
pub fn list_site_projects(conn: &Connection, site_uuid: Uuid) -> Result<Vec<RemoteProjectRow>, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE site_uuid = ? ORDER BY project_uuid",
        SELECT_EDGE
    ))?;
    let rows = stmt
        .query_map(params![site_uuid.to_string()], RemoteProjectRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All edges pointing at a project, with their site
pub fn list_project_sites(
    conn: &Connection,
    project_uuid: Uuid,
) -> Result<Vec<(RemoteProjectRow, RemoteSiteRow)>, SyncError> {
    let edges = {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE project_uuid = ? ORDER BY site_uuid",
            SELECT_EDGE
        ))?;
        let rows = stmt
            .query_map(params![project_uuid.to_string()], RemoteProjectRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut result = Vec::with_capacity(edges.len());
    for edge in edges {
        let site = get_site(conn, edge.site_uuid)?
            .ok_or_else(|| SyncError::SiteNotFound(edge.site_uuid))?;
        result.push((edge, site));
    }
    Ok(result)
}

pub fn get_remote_project(
    conn: &Connection,
    site_uuid: Uuid,
    project_uuid: Uuid,
) -> Result<Option<RemoteProjectRow>, SyncError> {
    let row = conn
        .query_row(
            &format!("{} WHERE site_uuid = ? AND project_uuid = ?", SELECT_EDGE),
            params![site_uuid.to_string(), project_uuid.to_string()],
            RemoteProjectRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Create the edge or set its level, refreshing the access timestamp
pub fn upsert_remote_project(
    conn: &Connection,
    site_uuid: Uuid,
    project_uuid: Uuid,
    level: AccessLevel,
) -> Result<EdgeChange, SyncError> {
    let now = current_timestamp();

    match get_remote_project(conn, site_uuid, project_uuid)? {
        Some(existing) => {
            conn.execute(
                "UPDATE remote_projects SET level = ?, date_access = ? WHERE uuid = ?",
                params![level, now, existing.uuid.to_string()],
            )?;
            if existing.level == level {
                Ok(EdgeChange::Unchanged)
            } else {
                Ok(EdgeChange::LevelChanged)
            }
        }
        None => {
            conn.execute(
                "INSERT INTO remote_projects (uuid, site_uuid, project_uuid, level, date_access) VALUES (?, ?, ?, ?, ?)",
                params![
                    Uuid::new_v4().to_string(),
                    site_uuid.to_string(),
                    project_uuid.to_string(),
                    level,
                    now,
                ],
            )?;
            Ok(EdgeChange::Created)
        }
    }
}

/// Change an edge level locally, following the access level state machine
pub fn set_remote_project_level(
    conn: &Connection,
    site_uuid: Uuid,
    project_uuid: Uuid,
    level: AccessLevel,
) -> Result<EdgeChange, SyncError> {
    let current = get_remote_project(conn, site_uuid, project_uuid)?
        .map(|edge| edge.level)
        .unwrap_or(AccessLevel::None);

    if !current.can_transition(level) {
        return Err(SyncError::IllegalTransition {
            from: current.to_string(),
            to: level.to_string(),
        });
    }

    upsert_remote_project(conn, site_uuid, project_uuid, level)
}

/// Refresh the access timestamp of an edge
pub fn touch_remote_project(conn: &Connection, uuid: Uuid) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE remote_projects SET date_access = ? WHERE uuid = ?",
        params![current_timestamp(), uuid.to_string()],
    )?;
    Ok(())
}

pub fn delete_remote_project(conn: &Connection, uuid: Uuid) -> Result<bool, SyncError> {
    let changes = conn.execute(
        "DELETE FROM remote_projects WHERE uuid = ?",
        params![uuid.to_string()],
    )?;
    Ok(changes > 0)
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
