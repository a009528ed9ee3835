//! App setting values

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{opt_uuid_column, opt_uuid_param, uuid_column};
use crate::error::SyncError;
use crate::plugins::SettingType;

/// App setting row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettingRow {
    pub uuid: Uuid,
    /// `None` for core settings
    pub app_plugin: Option<String>,
    pub name: String,
    pub setting_type: SettingType,
    pub value: String,
    pub value_json: Value,
    pub project_uuid: Option<Uuid>,
    pub user_uuid: Option<Uuid>,
    /// This site's value is authoritative and survives remote syncs
    pub local: bool,
}

impl AppSettingRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            uuid: uuid_column(row, "uuid")?,
            app_plugin: row.get("app_plugin")?,
            name: row.get("name")?,
            setting_type: row.get("setting_type")?,
            value: row.get("value")?,
            value_json: row.get("value_json")?,
            project_uuid: opt_uuid_column(row, "project_uuid")?,
            user_uuid: opt_uuid_column(row, "user_uuid")?,
            local: row.get("local")?,
        })
    }
}

const SELECT_SETTING: &str = "SELECT uuid, app_plugin, name, setting_type, value, value_json, \
     project_uuid, user_uuid, local FROM app_settings";

/// Settings attached to a project, user-independent ones only
pub fn list_project_settings(conn: &Connection, project_uuid: Uuid) -> Result<Vec<AppSettingRow>, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE project_uuid = ? AND user_uuid IS NULL ORDER BY app_plugin, name",
        SELECT_SETTING
    ))?;
    let rows = stmt
        .query_map(params![project_uuid.to_string()], AppSettingRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Per-user settings of a project
pub fn list_project_user_settings(conn: &Connection, project_uuid: Uuid) -> Result<Vec<AppSettingRow>, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE project_uuid = ? AND user_uuid IS NOT NULL ORDER BY app_plugin, name",
        SELECT_SETTING
    ))?;
    let rows = stmt
        .query_map(params![project_uuid.to_string()], AppSettingRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Settings attached to a user and no project
pub fn list_user_settings(conn: &Connection, user_uuid: Uuid) -> Result<Vec<AppSettingRow>, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE user_uuid = ? AND project_uuid IS NULL ORDER BY app_plugin, name",
        SELECT_SETTING
    ))?;
    let rows = stmt
        .query_map(params![user_uuid.to_string()], AppSettingRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Find the stored value for (plugin, name, project, user)
pub fn find_setting(
    conn: &Connection,
    app_plugin: Option<&str>,
    name: &str,
    project_uuid: Option<Uuid>,
    user_uuid: Option<Uuid>,
) -> Result<Option<AppSettingRow>, SyncError> {
    let row = conn
        .query_row(
            &format!(
                "{} WHERE COALESCE(app_plugin, '') = COALESCE(?, '') AND name = ? \
                 AND COALESCE(project_uuid, '') = COALESCE(?, '') \
                 AND COALESCE(user_uuid, '') = COALESCE(?, '')",
                SELECT_SETTING
            ),
            params![
                app_plugin,
                name,
                opt_uuid_param(project_uuid),
                opt_uuid_param(user_uuid),
            ],
            AppSettingRow::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn get_setting(conn: &Connection, uuid: Uuid) -> Result<Option<AppSettingRow>, SyncError> {
    let row = conn
        .query_row(
            &format!("{} WHERE uuid = ?", SELECT_SETTING),
            params![uuid.to_string()],
            AppSettingRow::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn insert_setting(conn: &Connection, setting: &AppSettingRow) -> Result<(), SyncError> {
    conn.execute(
        r#"
        INSERT INTO app_settings (
            uuid, app_plugin, name, setting_type, value, value_json,
            project_uuid, user_uuid, local
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            setting.uuid.to_string(),
            setting.app_plugin,
            setting.name,
            setting.setting_type,
            setting.value,
            setting.value_json,
            opt_uuid_param(setting.project_uuid),
            opt_uuid_param(setting.user_uuid),
            setting.local,
        ],
    )?;
    Ok(())
}

pub fn delete_setting(conn: &Connection, uuid: Uuid) -> Result<bool, SyncError> {
    let changes = conn.execute("DELETE FROM app_settings WHERE uuid = ?", params![uuid.to_string()])?;
    Ok(changes > 0)
}
