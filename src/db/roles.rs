//! Role vocabulary and role assignments
//!
//! This is the role query API consumed by the sync engine.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::uuid_column;
use crate::access::RoleName;
use crate::error::SyncError;

/// Role definition row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRow {
    pub name: String,
    pub rank: i64,
}

/// Role assignment joined with the assignee's username
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRow {
    pub uuid: Uuid,
    pub project_uuid: Uuid,
    pub user_uuid: Uuid,
    pub username: String,
    pub role_name: String,
}

impl AssignmentRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            uuid: uuid_column(row, "uuid")?,
            project_uuid: uuid_column(row, "project_uuid")?,
            user_uuid: uuid_column(row, "user_uuid")?,
            username: row.get("username")?,
            role_name: row.get("role_name")?,
        })
    }

    pub fn is_role(&self, role: RoleName) -> bool {
        self.role_name == role.as_str()
    }
}

const SELECT_ASSIGNMENT: &str = "SELECT a.uuid, a.project_uuid, a.user_uuid, u.username, a.role_name \
     FROM role_assignments a JOIN users u ON u.uuid = a.user_uuid";

/// Look up a role definition by name
pub fn get_role(conn: &Connection, name: &str) -> Result<Option<RoleRow>, SyncError> {
    let role = conn
        .query_row(
            "SELECT name, rank FROM roles WHERE name = ?",
            params![name],
            |row| Ok(RoleRow { name: row.get(0)?, rank: row.get(1)? }),
        )
        .optional()?;
    Ok(role)
}

/// All assignments of a project ordered by role rank, then username
pub fn list_assignments(conn: &Connection, project_uuid: Uuid) -> Result<Vec<AssignmentRow>, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "{} JOIN roles r ON r.name = a.role_name WHERE a.project_uuid = ? ORDER BY r.rank, u.username",
        SELECT_ASSIGNMENT
    ))?;
    let rows = stmt
        .query_map(params![project_uuid.to_string()], AssignmentRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Assignment of a user in a project
pub fn get_assignment(
    conn: &Connection,
    project_uuid: Uuid,
    user_uuid: Uuid,
) -> Result<Option<AssignmentRow>, SyncError> {
    let row = conn
        .query_row(
            &format!("{} WHERE a.project_uuid = ? AND a.user_uuid = ?", SELECT_ASSIGNMENT),
            params![project_uuid.to_string(), user_uuid.to_string()],
            AssignmentRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Owner assignment of a project
pub fn get_owner(conn: &Connection, project_uuid: Uuid) -> Result<Option<AssignmentRow>, SyncError> {
    let row = conn
        .query_row(
            &format!("{} WHERE a.project_uuid = ? AND a.role_name = ?", SELECT_ASSIGNMENT),
            params![project_uuid.to_string(), RoleName::Owner.as_str()],
            AssignmentRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Whether an assignment UUID is already used
pub fn assignment_uuid_in_use(conn: &Connection, uuid: Uuid) -> Result<bool, SyncError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM role_assignments WHERE uuid = ?",
            params![uuid.to_string()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn insert_assignment(
    conn: &Connection,
    uuid: Uuid,
    project_uuid: Uuid,
    user_uuid: Uuid,
    role_name: &str,
) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO role_assignments (uuid, project_uuid, user_uuid, role_name) VALUES (?, ?, ?, ?)",
        params![
            uuid.to_string(),
            project_uuid.to_string(),
            user_uuid.to_string(),
            role_name,
        ],
    )?;
    Ok(())
}

pub fn update_assignment_role(conn: &Connection, uuid: Uuid, role_name: &str) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE role_assignments SET role_name = ? WHERE uuid = ?",
        params![role_name, uuid.to_string()],
    )?;
    Ok(())
}

pub fn delete_assignment(conn: &Connection, uuid: Uuid) -> Result<bool, SyncError> {
    let changes = conn.execute(
        "DELETE FROM role_assignments WHERE uuid = ?",
        params![uuid.to_string()],
    )?;
    Ok(changes > 0)
}
