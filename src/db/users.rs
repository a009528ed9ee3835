//! User accounts and group memberships

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::uuid_column;
use crate::error::SyncError;

/// User row from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub uuid: Uuid,
    pub username: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl UserRow {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            username: username.into(),
            name: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
        }
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            uuid: uuid_column(row, "uuid")?,
            username: row.get("username")?,
            name: row.get("name")?,
            first_name: row.get("first_name")?,
            last_name: row.get("last_name")?,
            email: row.get("email")?,
        })
    }
}

const SELECT_USER: &str = "SELECT uuid, username, name, first_name, last_name, email FROM users";

/// Get user by UUID
pub fn get_user(conn: &Connection, uuid: Uuid) -> Result<Option<UserRow>, SyncError> {
    let user = conn
        .query_row(
            &format!("{} WHERE uuid = ?", SELECT_USER),
            params![uuid.to_string()],
            UserRow::from_row,
        )
        .optional()?;
    Ok(user)
}

/// Get user by username
pub fn get_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>, SyncError> {
    let user = conn
        .query_row(
            &format!("{} WHERE username = ?", SELECT_USER),
            params![username],
            UserRow::from_row,
        )
        .optional()?;
    Ok(user)
}

/// Whether a UUID is already taken by another account
pub fn uuid_in_use(conn: &Connection, uuid: Uuid) -> Result<bool, SyncError> {
    Ok(get_user(conn, uuid)?.is_some())
}

pub fn insert_user(conn: &Connection, user: &UserRow) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO users (uuid, username, name, first_name, last_name, email) VALUES (?, ?, ?, ?, ?, ?)",
        params![
            user.uuid.to_string(),
            user.username,
            user.name,
            user.first_name,
            user.last_name,
            user.email,
        ],
    )?;
    Ok(())
}

/// Update profile fields; the username and UUID are identity and never change
pub fn update_user(conn: &Connection, user: &UserRow) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE users SET name = ?, first_name = ?, last_name = ?, email = ? WHERE uuid = ?",
        params![
            user.name,
            user.first_name,
            user.last_name,
            user.email,
            user.uuid.to_string(),
        ],
    )?;
    Ok(())
}

/// Group names of a user, sorted
pub fn get_user_groups(conn: &Connection, user_uuid: Uuid) -> Result<Vec<String>, SyncError> {
    let mut stmt = conn.prepare(
        "SELECT group_name FROM user_groups WHERE user_uuid = ? ORDER BY group_name",
    )?;
    let groups = stmt
        .query_map(params![user_uuid.to_string()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(groups)
}

/// Make the user's memberships equal to `groups`, creating missing groups
///
/// Returns true if any membership was added or removed.
pub fn set_user_groups(conn: &Connection, user_uuid: Uuid, groups: &[String]) -> Result<bool, SyncError> {
    let wanted: BTreeSet<&str> = groups.iter().map(String::as_str).collect();
    let current = get_user_groups(conn, user_uuid)?;
    let current: BTreeSet<&str> = current.iter().map(String::as_str).collect();

    if wanted == current {
        return Ok(false);
    }

    for group in wanted.difference(&current) {
        conn.execute("INSERT OR IGNORE INTO auth_groups (name) VALUES (?)", params![group])?;
        conn.execute(
            "INSERT INTO user_groups (user_uuid, group_name) VALUES (?, ?)",
            params![user_uuid.to_string(), group],
        )?;
    }
    for group in current.difference(&wanted) {
        conn.execute(
            "DELETE FROM user_groups WHERE user_uuid = ? AND group_name = ?",
            params![user_uuid.to_string(), group],
        )?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SyncDb;

    #[test]
    fn test_user_lookup() {
        let db = SyncDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let mut user = UserRow::new("alice@EXAMPLE");
            user.email = "alice@example.com".into();
            insert_user(conn, &user)?;

            assert_eq!(get_user_by_username(conn, "alice@EXAMPLE")?, Some(user.clone()));
            assert_eq!(get_user(conn, user.uuid)?, Some(user.clone()));
            assert!(uuid_in_use(conn, user.uuid)?);
            assert!(get_user_by_username(conn, "bob")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_set_user_groups_diff() {
        let db = SyncDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let user = UserRow::new("alice@EXAMPLE");
            insert_user(conn, &user)?;

            assert!(set_user_groups(conn, user.uuid, &["example".into(), "staff".into()])?);
            assert!(!set_user_groups(conn, user.uuid, &["staff".into(), "example".into()])?);
            assert!(set_user_groups(conn, user.uuid, &["example".into()])?);
            assert_eq!(get_user_groups(conn, user.uuid)?, vec!["example".to_string()]);
            Ok(())
        })
        .unwrap();
    }
}
