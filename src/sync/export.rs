//! Snapshot export for a requesting target site
//!
//! Levels are resolved in two passes. First every explicit edge of the
//! requesting site is collected and the ancestors of shared projects get an
//! inferred level: READ_ROLES if any shared descendant is READ_ROLES,
//! otherwise READ_INFO. An explicit edge which already shares info wins over
//! the inferred level. The second pass emits entries from the final map.

use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::snapshot::{
    AppSettingEntry, PeerSiteEntry, ProjectEntry, RoleEntry, Snapshot, StatusInfo, UserEntry,
};
use crate::access::{AccessLevel, ProjectType, RoleName, SiteMode};
use crate::db::{projects, remote, roles, settings, users, AppSettingRow, ProjectRow, RemoteSiteRow};
use crate::error::{Result, SyncError};
use crate::plugins::{PluginRegistry, SettingKey};

/// Builds the snapshot a target site is allowed to see
pub struct SnapshotExporter<'a> {
    conn: &'a Connection,
    registry: &'a PluginRegistry,
}

impl<'a> SnapshotExporter<'a> {
    pub fn new(conn: &'a Connection, registry: &'a PluginRegistry) -> Self {
        Self { conn, registry }
    }

    /// Export everything linked to `site_uuid`, which must be a TARGET site
    pub fn export(&self, site_uuid: Uuid) -> Result<Snapshot> {
        let site = remote::get_site(self.conn, site_uuid)?
            .ok_or(SyncError::SiteNotFound(site_uuid))?;

        if site.mode != SiteMode::Target {
            return Err(SyncError::InvalidSiteMode {
                site: site.uuid,
                mode: site.mode.to_string(),
                expected: SiteMode::Target.to_string(),
            });
        }

        let levels = self.resolve_levels(&site)?;
        let mut snapshot = Snapshot::default();

        for (uuid, level) in levels {
            let project = projects::get_project(self.conn, uuid)?;

            match (level, project) {
                (AccessLevel::ViewAvailability, project) => {
                    let project_type = project
                        .as_ref()
                        .map(|p| p.project_type)
                        .unwrap_or(ProjectType::Project);
                    snapshot
                        .projects
                        .insert(uuid, ProjectEntry::availability(project_type, project.is_some()));
                }
                (_, Some(project)) => self.add_project(&mut snapshot, &site, project, level)?,
                (_, None) => {
                    warn!(project = %uuid, level = %level, "Linked project not found, skipping");
                }
            }
        }

        let user_uuids: Vec<Uuid> = snapshot.users.keys().copied().collect();
        for user_uuid in user_uuids {
            let rows = settings::list_user_settings(self.conn, user_uuid)?;
            self.add_settings(&mut snapshot, rows);
        }

        // Per-user project settings, for users the target will know about
        let visible: Vec<Uuid> = snapshot
            .projects
            .iter()
            .filter(|(_, entry)| entry.level.is_peer_visible())
            .map(|(uuid, _)| *uuid)
            .collect();
        for project_uuid in visible {
            let rows = settings::list_project_user_settings(self.conn, project_uuid)?
                .into_iter()
                .filter(|row| row.user_uuid.is_some_and(|user| snapshot.users.contains_key(&user)))
                .collect();
            self.add_settings(&mut snapshot, rows);
        }

        remote::touch_site(self.conn, site.uuid)?;

        info!(
            site = %site.name,
            projects = snapshot.projects.len(),
            users = snapshot.users.len(),
            peer_sites = snapshot.peer_sites.len(),
            app_settings = snapshot.app_settings.len(),
            "Snapshot exported"
        );
        Ok(snapshot)
    }

    /// Final level of every project to export, including inferred ancestors
    fn resolve_levels(&self, site: &RemoteSiteRow) -> Result<BTreeMap<Uuid, AccessLevel>> {
        let mut explicit: BTreeMap<Uuid, AccessLevel> = BTreeMap::new();

        for edge in remote::list_site_projects(self.conn, site.uuid)? {
            remote::touch_remote_project(self.conn, edge.uuid)?;
            if edge.level != AccessLevel::None {
                explicit.insert(edge.project_uuid, edge.level);
            }
        }

        let mut inferred: BTreeMap<Uuid, AccessLevel> = BTreeMap::new();

        for (&uuid, &level) in &explicit {
            if !level.shares_info() {
                continue;
            }
            let Some(project) = projects::get_project(self.conn, uuid)? else {
                continue;
            };
            let required = if level == AccessLevel::ReadRoles {
                AccessLevel::ReadRoles
            } else {
                AccessLevel::ReadInfo
            };

            for ancestor in projects::get_ancestors(self.conn, &project)? {
                let slot = inferred.entry(ancestor.uuid).or_insert(required);
                if required > *slot {
                    *slot = required;
                }
            }
        }

        let mut levels = explicit;
        for (uuid, level) in inferred {
            match levels.get(&uuid) {
                Some(current) if current.shares_info() => {}
                _ => {
                    debug!(project = %uuid, level = %level, "Ancestor exported at inferred level");
                    levels.insert(uuid, level);
                }
            }
        }

        Ok(levels)
    }

    fn add_project(
        &self,
        snapshot: &mut Snapshot,
        site: &RemoteSiteRow,
        project: ProjectRow,
        level: AccessLevel,
    ) -> Result<()> {
        let mut entry = ProjectEntry {
            title: Some(project.title),
            project_type: project.project_type,
            level,
            parent_uuid: project.parent_uuid,
            description: Some(project.description),
            readme: Some(project.readme),
            public_guest_access: Some(project.public_guest_access),
            available: None,
            roles: None,
            remote_sites: None,
            sync: StatusInfo::default(),
        };

        if level.shares_roles() {
            let mut role_map = BTreeMap::new();

            for assignment in roles::list_assignments(self.conn, project.uuid)? {
                if level == AccessLevel::Revoked && !is_privileged(&assignment.role_name) {
                    continue;
                }
                self.add_user(snapshot, assignment.user_uuid)?;
                role_map.insert(
                    assignment.uuid,
                    RoleEntry::new(assignment.username, assignment.role_name),
                );
            }

            entry.roles = Some(role_map);
            entry.remote_sites = Some(if level == AccessLevel::ReadRoles {
                self.add_peer_sites(snapshot, site, project.uuid)?
            } else {
                Vec::new()
            });
        }

        if level.is_peer_visible() {
            let rows = settings::list_project_settings(self.conn, project.uuid)?;
            self.add_settings(snapshot, rows);
        }

        snapshot.projects.insert(project.uuid, entry);
        Ok(())
    }

    /// Other target sites seeing the project, registered as peer descriptors
    fn add_peer_sites(
        &self,
        snapshot: &mut Snapshot,
        site: &RemoteSiteRow,
        project_uuid: Uuid,
    ) -> Result<Vec<Uuid>> {
        let mut peers = Vec::new();

        for (edge, peer) in remote::list_project_sites(self.conn, project_uuid)? {
            if peer.uuid == site.uuid || peer.mode != SiteMode::Target || !edge.level.is_peer_visible() {
                continue;
            }
            snapshot.peer_sites.entry(peer.uuid).or_insert_with(|| PeerSiteEntry {
                name: peer.name.clone(),
                url: peer.url.clone(),
                description: peer.description.clone(),
                user_display: peer.user_display,
                sync: StatusInfo::default(),
            });
            peers.push(peer.uuid);
        }

        Ok(peers)
    }

    fn add_user(&self, snapshot: &mut Snapshot, user_uuid: Uuid) -> Result<()> {
        if snapshot.users.contains_key(&user_uuid) {
            return Ok(());
        }
        let Some(user) = users::get_user(self.conn, user_uuid)? else {
            return Ok(());
        };
        let groups = users::get_user_groups(self.conn, user_uuid)?;

        snapshot.users.insert(
            user.uuid,
            UserEntry {
                username: user.username,
                name: user.name,
                first_name: user.first_name,
                last_name: user.last_name,
                email: user.email,
                groups,
                sync: StatusInfo::default(),
            },
        );
        Ok(())
    }

    fn add_settings(&self, snapshot: &mut Snapshot, rows: Vec<AppSettingRow>) {
        for row in rows {
            let key = SettingKey::new(row.app_plugin.as_deref(), row.name.as_str());
            let Some(def) = self.registry.get_setting(&key) else {
                warn!(setting = %key, "Setting schema not found, skipping");
                continue;
            };

            snapshot.app_settings.insert(
                row.uuid,
                AppSettingEntry {
                    name: row.name,
                    setting_type: row.setting_type,
                    value: row.value,
                    value_json: row.value_json,
                    app_plugin: row.app_plugin,
                    project_uuid: row.project_uuid,
                    user_uuid: row.user_uuid,
                    local: def.local,
                    sync: StatusInfo::default(),
                },
            );
        }
    }
}

fn is_privileged(role_name: &str) -> bool {
    role_name
        .parse::<RoleName>()
        .map(|role| role.is_privileged())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::projects::insert_project;
    use crate::db::remote::{insert_site, upsert_remote_project};
    use crate::db::roles::insert_assignment;
    use crate::db::users::{insert_user, UserRow};
    use crate::db::SyncDb;

    struct Fixture {
        db: SyncDb,
        target: Uuid,
        category: Uuid,
        project: Uuid,
    }

    /// Category > Project, owner alice, guest bob, target site linked at `level`
    fn fixture(level: AccessLevel) -> Fixture {
        let db = SyncDb::open_in_memory().unwrap();
        let target = RemoteSiteRow::new("Target", "https://target.example", SiteMode::Target)
            .with_secret("s3cret");
        let category = Uuid::new_v4();
        let project = Uuid::new_v4();

        db.with_conn(|conn| {
            insert_site(conn, &target)?;
            insert_project(conn, &ProjectRow::new(category, "Category", ProjectType::Category))?;
            insert_project(
                conn,
                &ProjectRow::new(project, "Project", ProjectType::Project).with_parent(category),
            )?;
            let alice = UserRow::new("alice@EXAMPLE");
            let bob = UserRow::new("bob@EXAMPLE");
            insert_user(conn, &alice)?;
            insert_user(conn, &bob)?;
            insert_assignment(conn, Uuid::new_v4(), project, alice.uuid, RoleName::Owner.as_str())?;
            insert_assignment(conn, Uuid::new_v4(), project, bob.uuid, RoleName::Guest.as_str())?;
            insert_assignment(conn, Uuid::new_v4(), category, alice.uuid, RoleName::Owner.as_str())?;
            upsert_remote_project(conn, target.uuid, project, level)?;
            Ok(())
        })
        .unwrap();

        Fixture {
            db,
            target: target.uuid,
            category,
            project,
        }
    }

    fn export(fixture: &Fixture) -> Snapshot {
        let registry = PluginRegistry::default();
        fixture
            .db
            .with_conn(|conn| SnapshotExporter::new(conn, &registry).export(fixture.target))
            .unwrap()
    }

    #[test]
    fn test_read_info_includes_ancestor_without_roles() {
        let fixture = fixture(AccessLevel::ReadInfo);
        let snapshot = export(&fixture);

        assert_eq!(snapshot.projects.len(), 2);
        let category = &snapshot.projects[&fixture.category];
        assert_eq!(category.level, AccessLevel::ReadInfo);
        assert_eq!(category.title.as_deref(), Some("Category"));
        assert!(snapshot.projects[&fixture.project].roles.is_none());
        assert!(snapshot.users.is_empty());
    }

    #[test]
    fn test_read_roles_upgrades_ancestor() {
        let fixture = fixture(AccessLevel::ReadRoles);
        let snapshot = export(&fixture);

        let category = &snapshot.projects[&fixture.category];
        assert_eq!(category.level, AccessLevel::ReadRoles);
        assert_eq!(category.roles.as_ref().unwrap().len(), 1);
        assert_eq!(snapshot.projects[&fixture.project].roles.as_ref().unwrap().len(), 2);
        // alice appears in both role maps but only once in users
        assert_eq!(snapshot.users.len(), 2);
    }

    #[test]
    fn test_explicit_ancestor_edge_wins() {
        let fixture = fixture(AccessLevel::ReadRoles);
        fixture
            .db
            .with_conn(|conn| {
                upsert_remote_project(conn, fixture.target, fixture.category, AccessLevel::ReadInfo)?;
                Ok(())
            })
            .unwrap();

        let snapshot = export(&fixture);
        assert_eq!(snapshot.projects[&fixture.category].level, AccessLevel::ReadInfo);
    }

    #[test]
    fn test_revoked_keeps_privileged_roles_only() {
        let fixture = fixture(AccessLevel::Revoked);
        let snapshot = export(&fixture);

        let entry = &snapshot.projects[&fixture.project];
        let roles = entry.roles.as_ref().unwrap();
        assert_eq!(roles.len(), 1);
        assert!(roles.values().all(|r| r.role == RoleName::Owner.as_str()));
        assert_eq!(entry.remote_sites, Some(vec![]));
    }

    #[test]
    fn test_view_availability_of_missing_project() {
        let fixture = fixture(AccessLevel::ReadInfo);
        let ghost = Uuid::new_v4();
        fixture
            .db
            .with_conn(|conn| {
                upsert_remote_project(conn, fixture.target, ghost, AccessLevel::ViewAvailability)?;
                Ok(())
            })
            .unwrap();

        let snapshot = export(&fixture);
        let entry = &snapshot.projects[&ghost];
        assert_eq!(entry.available, Some(false));
        assert!(entry.title.is_none());
    }

    #[test]
    fn test_peer_sites_listed_for_read_roles() {
        let fixture = fixture(AccessLevel::ReadRoles);
        let peer = RemoteSiteRow::new("Other", "https://other.example", SiteMode::Target)
            .with_secret("other");
        fixture
            .db
            .with_conn(|conn| {
                insert_site(conn, &peer)?;
                upsert_remote_project(conn, peer.uuid, fixture.project, AccessLevel::ReadInfo)?;
                Ok(())
            })
            .unwrap();

        let snapshot = export(&fixture);
        assert_eq!(
            snapshot.projects[&fixture.project].remote_sites,
            Some(vec![peer.uuid])
        );
        assert_eq!(snapshot.peer_sites[&peer.uuid].name, "Other");
    }

    #[test]
    fn test_export_requires_target_site() {
        let db = SyncDb::open_in_memory().unwrap();
        let source = RemoteSiteRow::new("Source", "https://source.example", SiteMode::Source)
            .with_secret("s3cret");
        db.with_conn(|conn| insert_site(conn, &source)).unwrap();

        let registry = PluginRegistry::default();
        let err = db
            .with_conn(|conn| SnapshotExporter::new(conn, &registry).export(source.uuid))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidSiteMode { .. }));
    }
}
