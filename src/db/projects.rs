//! Project and category rows
//!
//! This is the project lookup-by-identity API consumed by the sync engine.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{opt_uuid_column, opt_uuid_param, uuid_column};
use crate::access::{ProjectType, SubmitStatus};
use crate::error::SyncError;

/// Project row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub uuid: Uuid,
    pub title: String,
    pub project_type: ProjectType,
    pub parent_uuid: Option<Uuid>,
    pub description: String,
    pub readme: String,
    pub public_guest_access: bool,
    pub submit_status: SubmitStatus,
}

impl ProjectRow {
    /// New row with empty text fields and OK submit status
    pub fn new(uuid: Uuid, title: impl Into<String>, project_type: ProjectType) -> Self {
        Self {
            uuid,
            title: title.into(),
            project_type,
            parent_uuid: None,
            description: String::new(),
            readme: String::new(),
            public_guest_access: false,
            submit_status: SubmitStatus::Ok,
        }
    }

    pub fn with_parent(mut self, parent_uuid: Uuid) -> Self {
        self.parent_uuid = Some(parent_uuid);
        self
    }

    pub fn is_category(&self) -> bool {
        self.project_type == ProjectType::Category
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            uuid: uuid_column(row, "uuid")?,
            title: row.get("title")?,
            project_type: row.get("project_type")?,
            parent_uuid: opt_uuid_column(row, "parent_uuid")?,
            description: row.get("description")?,
            readme: row.get("readme")?,
            public_guest_access: row.get("public_guest_access")?,
            submit_status: row.get("submit_status")?,
        })
    }
}

const SELECT_PROJECT: &str = "SELECT uuid, title, project_type, parent_uuid, description, readme, \
     public_guest_access, submit_status FROM projects";

/// Get project or category by UUID
pub fn get_project(conn: &Connection, uuid: Uuid) -> Result<Option<ProjectRow>, SyncError> {
    let project = conn
        .query_row(
            &format!("{} WHERE uuid = ?", SELECT_PROJECT),
            params![uuid.to_string()],
            ProjectRow::from_row,
        )
        .optional()?;
    Ok(project)
}

/// Find a sibling by title under the given parent (`None` = root level)
pub fn find_by_title(
    conn: &Connection,
    parent_uuid: Option<Uuid>,
    title: &str,
) -> Result<Option<ProjectRow>, SyncError> {
    let project = conn
        .query_row(
            &format!(
                "{} WHERE COALESCE(parent_uuid, '') = COALESCE(?, '') AND title = ?",
                SELECT_PROJECT
            ),
            params![opt_uuid_param(parent_uuid), title],
            ProjectRow::from_row,
        )
        .optional()?;
    Ok(project)
}

/// List all projects and categories ordered by title
pub fn list_projects(conn: &Connection) -> Result<Vec<ProjectRow>, SyncError> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY title", SELECT_PROJECT))?;
    let rows = stmt
        .query_map([], ProjectRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Ancestor chain of a project, nearest parent first
pub fn get_ancestors(conn: &Connection, project: &ProjectRow) -> Result<Vec<ProjectRow>, SyncError> {
    let mut ancestors: Vec<ProjectRow> = Vec::new();
    let mut next = project.parent_uuid;

    while let Some(parent_uuid) = next {
        if parent_uuid == project.uuid || ancestors.iter().any(|a| a.uuid == parent_uuid) {
            return Err(SyncError::Internal(format!(
                "Cycle in project hierarchy at {}",
                parent_uuid
            )));
        }
        let parent = get_project(conn, parent_uuid)?
            .ok_or_else(|| SyncError::NotFound(format!("parent project {}", parent_uuid)))?;
        next = parent.parent_uuid;
        ancestors.push(parent);
    }

    Ok(ancestors)
}

/// Insert a project row
pub fn insert_project(conn: &Connection, project: &ProjectRow) -> Result<(), SyncError> {
    validate_parent(conn, project)?;

    conn.execute(
        r#"
        INSERT INTO projects (
            uuid, title, project_type, parent_uuid, description, readme,
            public_guest_access, submit_status
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            project.uuid.to_string(),
            project.title,
            project.project_type,
            opt_uuid_param(project.parent_uuid),
            project.description,
            project.readme,
            project.public_guest_access,
            project.submit_status,
        ],
    )?;

    debug!(uuid = %project.uuid, title = %project.title, "Project inserted");
    Ok(())
}

/// Update every mutable field of a project row
pub fn update_project(conn: &Connection, project: &ProjectRow) -> Result<(), SyncError> {
    validate_parent(conn, project)?;

    let changes = conn.execute(
        r#"
        UPDATE projects SET
            title = ?, parent_uuid = ?, description = ?, readme = ?,
            public_guest_access = ?, submit_status = ?, updated_at = datetime('now')
        WHERE uuid = ?
        "#,
        params![
            project.title,
            opt_uuid_param(project.parent_uuid),
            project.description,
            project.readme,
            project.public_guest_access,
            project.submit_status,
            project.uuid.to_string(),
        ],
    )?;

    if changes == 0 {
        return Err(SyncError::NotFound(format!("project {}", project.uuid)));
    }
    Ok(())
}

/// A parent must exist, be a category and not create a cycle
fn validate_parent(conn: &Connection, project: &ProjectRow) -> Result<(), SyncError> {
    let Some(parent_uuid) = project.parent_uuid else {
        return Ok(());
    };

    let parent = get_project(conn, parent_uuid)?
        .ok_or_else(|| SyncError::NotFound(format!("parent project {}", parent_uuid)))?;

    if !parent.is_category() {
        return Err(SyncError::Internal(format!(
            "Parent {} of {} is not a category",
            parent_uuid, project.uuid
        )));
    }

    if parent_uuid == project.uuid
        || get_ancestors(conn, &parent)?.iter().any(|a| a.uuid == project.uuid)
    {
        return Err(SyncError::Internal(format!(
            "Setting parent {} on {} would create a cycle",
            parent_uuid, project.uuid
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SyncDb;

    #[test]
    fn test_insert_and_lookup() {
        let db = SyncDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let category = ProjectRow::new(Uuid::new_v4(), "Category", ProjectType::Category);
            let project = ProjectRow::new(Uuid::new_v4(), "Project", ProjectType::Project)
                .with_parent(category.uuid);
            insert_project(conn, &category)?;
            insert_project(conn, &project)?;

            assert_eq!(get_project(conn, project.uuid)?, Some(project.clone()));
            let found = find_by_title(conn, None, "Category")?.unwrap();
            assert_eq!(found.uuid, category.uuid);
            assert!(find_by_title(conn, None, "Project")?.is_none());

            let ancestors = get_ancestors(conn, &project)?;
            assert_eq!(ancestors.len(), 1);
            assert_eq!(ancestors[0].uuid, category.uuid);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_parent_must_be_category() {
        let db = SyncDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let project = ProjectRow::new(Uuid::new_v4(), "Project", ProjectType::Project);
            insert_project(conn, &project)?;
            let child = ProjectRow::new(Uuid::new_v4(), "Child", ProjectType::Project)
                .with_parent(project.uuid);
            assert!(insert_project(conn, &child).is_err());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_sibling_titles_unique_at_root() {
        let db = SyncDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_project(conn, &ProjectRow::new(Uuid::new_v4(), "Same", ProjectType::Category))?;
            let dup = ProjectRow::new(Uuid::new_v4(), "Same", ProjectType::Category);
            assert!(insert_project(conn, &dup).is_err());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_reparent_cycle_rejected() {
        let db = SyncDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let outer = ProjectRow::new(Uuid::new_v4(), "Outer", ProjectType::Category);
            let inner = ProjectRow::new(Uuid::new_v4(), "Inner", ProjectType::Category)
                .with_parent(outer.uuid);
            insert_project(conn, &outer)?;
            insert_project(conn, &inner)?;

            let looped = outer.clone().with_parent(inner.uuid);
            assert!(update_project(conn, &looped).is_err());
            Ok(())
        })
        .unwrap();
    }
}
