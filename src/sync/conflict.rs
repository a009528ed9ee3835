//! Pre-flight detection of category naming conflicts
//!
//! A remote category must never be merged into, or duplicated next to, a
//! local category that has the same title and parent but another UUID.
//! Such a snapshot is rejected before anything is written.

use std::collections::HashSet;

use rusqlite::Connection;
use tracing::warn;
use uuid::Uuid;

use super::snapshot::Snapshot;
use crate::access::ProjectType;
use crate::db::projects;
use crate::error::{Result, SyncError};

/// Walk the in-snapshot ancestor chain of every incoming project and fail
/// on the first local category clash
pub fn check_category_conflicts(conn: &Connection, snapshot: &Snapshot) -> Result<()> {
    let mut checked: HashSet<Uuid> = HashSet::new();

    for entry in snapshot.projects.values() {
        if entry.project_type != ProjectType::Project {
            continue;
        }

        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut next = entry.parent_uuid;

        while let Some(parent_uuid) = next {
            // Cycles are reported by the reconciler's ordering pass
            if !visited.insert(parent_uuid) {
                break;
            }
            let Some(parent) = snapshot.projects.get(&parent_uuid) else {
                break;
            };
            next = parent.parent_uuid;

            if !checked.insert(parent_uuid) {
                continue;
            }
            let Some(title) = parent.title.as_deref() else {
                continue;
            };

            if let Some(local) = projects::find_by_title(conn, parent.parent_uuid, title)? {
                if local.uuid != parent_uuid && local.is_category() {
                    warn!(
                        title = %title,
                        local = %local.uuid,
                        remote = %parent_uuid,
                        "Category conflict, aborting sync"
                    );
                    return Err(SyncError::CategoryConflict {
                        title: title.to_string(),
                        local_uuid: local.uuid,
                        remote_uuid: parent_uuid,
                    });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessLevel;
    use crate::db::projects::{insert_project, ProjectRow};
    use crate::db::SyncDb;
    use crate::sync::snapshot::{ProjectEntry, StatusInfo};

    fn entry(title: &str, project_type: ProjectType, parent: Option<Uuid>) -> ProjectEntry {
        ProjectEntry {
            title: Some(title.to_string()),
            project_type,
            level: AccessLevel::ReadInfo,
            parent_uuid: parent,
            description: None,
            readme: None,
            public_guest_access: None,
            available: None,
            roles: None,
            remote_sites: None,
            sync: StatusInfo::default(),
        }
    }

    #[test]
    fn test_same_title_other_uuid_conflicts() {
        let db = SyncDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_project(conn, &ProjectRow::new(Uuid::new_v4(), "Category", ProjectType::Category))?;

            let remote_category = Uuid::new_v4();
            let mut snapshot = Snapshot::default();
            snapshot.projects.insert(remote_category, entry("Category", ProjectType::Category, None));
            snapshot
                .projects
                .insert(Uuid::new_v4(), entry("Project", ProjectType::Project, Some(remote_category)));

            let err = check_category_conflicts(conn, &snapshot).unwrap_err();
            assert!(matches!(err, SyncError::CategoryConflict { remote_uuid, .. } if remote_uuid == remote_category));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_same_uuid_is_not_a_conflict() {
        let db = SyncDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let category = Uuid::new_v4();
            insert_project(conn, &ProjectRow::new(category, "Category", ProjectType::Category))?;

            let mut snapshot = Snapshot::default();
            snapshot.projects.insert(category, entry("Category", ProjectType::Category, None));
            snapshot
                .projects
                .insert(Uuid::new_v4(), entry("Project", ProjectType::Project, Some(category)));

            check_category_conflicts(conn, &snapshot)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_other_parent_is_not_a_conflict() {
        let db = SyncDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let top = Uuid::new_v4();
            insert_project(conn, &ProjectRow::new(top, "Top", ProjectType::Category))?;
            insert_project(
                conn,
                &ProjectRow::new(Uuid::new_v4(), "Category", ProjectType::Category).with_parent(top),
            )?;

            let remote_category = Uuid::new_v4();
            let mut snapshot = Snapshot::default();
            snapshot.projects.insert(remote_category, entry("Category", ProjectType::Category, None));
            snapshot
                .projects
                .insert(Uuid::new_v4(), entry("Project", ProjectType::Project, Some(remote_category)));

            check_category_conflicts(conn, &snapshot)?;
            Ok(())
        })
        .unwrap();
    }
}
