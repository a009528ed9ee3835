//! Snapshot reconciliation
//!
//! Applies a snapshot received from a SOURCE site to the local store. A run
//! is one transaction: structural errors roll everything back, while
//! per-entity failures are written onto the snapshot as `status: error` and
//! the batch continues.
//!
//! Order of a run:
//! 1. originating site, category conflicts and default owner are checked
//! 2. users
//! 3. peer sites
//! 4. projects and categories, parents before children
//! 5. app settings

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::conflict::check_category_conflicts;
use super::snapshot::{AppSettingEntry, ProjectEntry, RoleEntry, Snapshot, SyncStatus};
use crate::access::{is_directory_username, AccessLevel, RoleName, SiteMode};
use crate::config::SyncConfig;
use crate::db::remote::EdgeChange;
use crate::db::{projects, remote, roles, settings, users};
use crate::db::{AppSettingRow, ProjectRow, RemoteSiteRow, UserRow};
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::plugins::{PluginRegistry, SettingKey, SettingScope};

/// Outcome of a single entity: `Err` carries the `status_msg` of a
/// recoverable failure
type EntityResult<T> = std::result::Result<T, String>;

/// Reconcile `snapshot` from `site_uuid` inside one transaction
///
/// Returns the events of the committed changes; the snapshot is annotated
/// in place.
pub fn reconcile(
    conn: &mut Connection,
    registry: &PluginRegistry,
    config: &SyncConfig,
    site_uuid: Uuid,
    snapshot: &mut Snapshot,
) -> Result<Vec<SyncEvent>> {
    let tx = conn.transaction()?;
    let events = Reconciler::new(&tx, registry, config, site_uuid, snapshot)?.run(snapshot)?;
    tx.commit()?;
    Ok(events)
}

/// Single reconciliation run against an open connection or transaction
pub struct Reconciler<'a> {
    conn: &'a Connection,
    registry: &'a PluginRegistry,
    config: &'a SyncConfig,
    site: RemoteSiteRow,
    default_owner: UserRow,
    /// Snapshot user UUID -> local user UUID
    user_map: HashMap<Uuid, Uuid>,
    /// Projects which failed; their descendants fail too
    failed: HashSet<Uuid>,
    events: Vec<SyncEvent>,
}

impl<'a> Reconciler<'a> {
    /// Check the preconditions of a run; nothing is written yet
    pub fn new(
        conn: &'a Connection,
        registry: &'a PluginRegistry,
        config: &'a SyncConfig,
        site_uuid: Uuid,
        snapshot: &Snapshot,
    ) -> Result<Self> {
        let site = remote::get_site(conn, site_uuid)?.ok_or(SyncError::SiteNotFound(site_uuid))?;

        if site.mode != SiteMode::Source {
            return Err(SyncError::InvalidSiteMode {
                site: site.uuid,
                mode: site.mode.to_string(),
                expected: SiteMode::Source.to_string(),
            });
        }

        check_category_conflicts(conn, snapshot)?;

        let default_owner = users::get_user_by_username(conn, &config.default_owner)?
            .ok_or_else(|| SyncError::DefaultOwnerMissing(config.default_owner.clone()))?;

        Ok(Self {
            conn,
            registry,
            config,
            site,
            default_owner,
            user_map: HashMap::new(),
            failed: HashSet::new(),
            events: Vec::new(),
        })
    }

    /// Apply the snapshot and return the collected events
    pub fn run(mut self, snapshot: &mut Snapshot) -> Result<Vec<SyncEvent>> {
        info!(
            site = %self.site.name,
            users = snapshot.users.len(),
            projects = snapshot.projects.len(),
            app_settings = snapshot.app_settings.len(),
            "Reconciling snapshot"
        );

        let order = processing_order(&snapshot.projects)?;

        self.sync_users(snapshot)?;
        self.sync_peer_sites(snapshot)?;
        for uuid in order {
            if let Some(entry) = snapshot.projects.get_mut(&uuid) {
                self.sync_project(uuid, entry)?;
            }
        }
        self.sync_app_settings(snapshot)?;

        remote::touch_site(self.conn, self.site.uuid)?;
        Ok(self.events)
    }

    // ---- users ----

    fn sync_users(&mut self, snapshot: &mut Snapshot) -> Result<()> {
        for (&uuid, entry) in snapshot.users.iter_mut() {
            let local = users::get_user_by_username(self.conn, &entry.username)?;

            if !is_directory_username(&entry.username) {
                match local {
                    Some(local) => {
                        self.user_map.insert(uuid, local.uuid);
                    }
                    None => debug!(username = %entry.username, "Local user not present, skipping"),
                }
                continue;
            }

            match local {
                None => {
                    let mut user = UserRow::new(entry.username.clone());
                    if !users::uuid_in_use(self.conn, uuid)? {
                        user.uuid = uuid;
                    }
                    user.name = entry.name.clone();
                    user.first_name = entry.first_name.clone();
                    user.last_name = entry.last_name.clone();
                    user.email = entry.email.clone();

                    users::insert_user(self.conn, &user)?;
                    users::set_user_groups(self.conn, user.uuid, &entry.groups)?;

                    debug!(username = %user.username, "User created");
                    entry.sync.set(SyncStatus::Created);
                    self.events.push(SyncEvent::UserCreated {
                        uuid: user.uuid,
                        username: user.username.clone(),
                    });
                    self.user_map.insert(uuid, user.uuid);
                }
                Some(mut user) => {
                    let profile_changed = user.name != entry.name
                        || user.first_name != entry.first_name
                        || user.last_name != entry.last_name
                        || user.email != entry.email;

                    if profile_changed {
                        user.name = entry.name.clone();
                        user.first_name = entry.first_name.clone();
                        user.last_name = entry.last_name.clone();
                        user.email = entry.email.clone();
                        users::update_user(self.conn, &user)?;
                    }
                    let groups_changed = users::set_user_groups(self.conn, user.uuid, &entry.groups)?;

                    if profile_changed || groups_changed {
                        debug!(username = %user.username, "User updated");
                        entry.sync.set(SyncStatus::Updated);
                        self.events.push(SyncEvent::UserUpdated {
                            uuid: user.uuid,
                            username: user.username.clone(),
                        });
                    }
                    self.user_map.insert(uuid, user.uuid);
                }
            }
        }

        Ok(())
    }

    // ---- peer sites ----

    fn sync_peer_sites(&mut self, snapshot: &mut Snapshot) -> Result<()> {
        for (&uuid, entry) in snapshot.peer_sites.iter_mut() {
            if uuid == self.site.uuid {
                warn!(site = %uuid, "Peer site entry names the source site");
                entry.sync.set_error("Peer site is the source site");
                continue;
            }

            match remote::get_site(self.conn, uuid)? {
                None => {
                    let site = RemoteSiteRow {
                        uuid,
                        name: entry.name.clone(),
                        url: entry.url.clone(),
                        description: entry.description.clone(),
                        mode: SiteMode::Peer,
                        secret: None,
                        user_display: entry.user_display,
                        date_access: None,
                    };
                    remote::insert_site(self.conn, &site)?;

                    debug!(site = %site.name, "Peer site created");
                    entry.sync.set(SyncStatus::Created);
                    self.events.push(SyncEvent::PeerSiteCreated {
                        uuid,
                        name: site.name,
                    });
                }
                Some(local) if local.mode != SiteMode::Peer => {
                    warn!(site = %uuid, mode = %local.mode, "Peer site exists locally with another mode");
                    entry.sync.set_error(format!("Site exists locally in {} mode", local.mode));
                }
                Some(mut local) => {
                    if local.name != entry.name
                        || local.url != entry.url
                        || local.description != entry.description
                        || local.user_display != entry.user_display
                    {
                        local.name = entry.name.clone();
                        local.url = entry.url.clone();
                        local.description = entry.description.clone();
                        local.user_display = entry.user_display;
                        remote::update_site_info(self.conn, &local)?;

                        entry.sync.set(SyncStatus::Updated);
                        self.events.push(SyncEvent::PeerSiteUpdated {
                            uuid,
                            name: local.name,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    // ---- projects ----

    fn sync_project(&mut self, uuid: Uuid, entry: &mut ProjectEntry) -> Result<()> {
        if !entry.level.shares_info() {
            let change = remote::upsert_remote_project(self.conn, self.site.uuid, uuid, entry.level)?;
            debug!(project = %uuid, level = %entry.level, change = ?change, "Availability edge stored");
            return Ok(());
        }

        if let Err(msg) = self.sync_project_info(uuid, entry)? {
            warn!(project = %uuid, "Project not synced: {}", msg);
            entry.sync.set_error(msg);
            self.failed.insert(uuid);
            return Ok(());
        }

        let change = remote::upsert_remote_project(self.conn, self.site.uuid, uuid, entry.level)?;
        if change == EdgeChange::LevelChanged && entry.sync.status.is_none() {
            entry.sync.set(SyncStatus::Updated);
        }

        if !entry.level.shares_roles() {
            return Ok(());
        }

        if entry.level == AccessLevel::ReadRoles {
            self.sync_roles(uuid, entry)?;
        }
        self.delete_absent_roles(uuid, entry)?;
        self.sync_peer_links(uuid, entry)?;

        Ok(())
    }

    /// Create or update the local project row
    fn sync_project_info(&mut self, uuid: Uuid, entry: &mut ProjectEntry) -> Result<EntityResult<()>> {
        let Some(title) = entry.title.clone() else {
            return Ok(Err("Title missing".to_string()));
        };

        if let Some(parent_uuid) = entry.parent_uuid {
            if self.failed.contains(&parent_uuid) {
                return Ok(Err(format!("Parent {} failed", parent_uuid)));
            }
            let Some(parent) = projects::get_project(self.conn, parent_uuid)? else {
                return Ok(Err(format!("Parent category {} not found", parent_uuid)));
            };
            if !parent.is_category() {
                return Ok(Err(format!("Parent {} is not a category", parent_uuid)));
            }
            if parent_uuid == uuid
                || projects::get_ancestors(self.conn, &parent)?.iter().any(|a| a.uuid == uuid)
            {
                return Ok(Err(format!("Parent {} would create a cycle", parent_uuid)));
            }
        }

        let sibling = projects::find_by_title(self.conn, entry.parent_uuid, &title)?
            .filter(|other| other.uuid != uuid);

        match projects::get_project(self.conn, uuid)? {
            None => {
                if let Some(other) = sibling {
                    return Ok(Err(format!("Title \"{}\" already in use by {}", title, other.uuid)));
                }

                let mut project = ProjectRow::new(uuid, title, entry.project_type);
                project.parent_uuid = entry.parent_uuid;
                project.description = entry.description.clone().unwrap_or_default();
                project.readme = entry.readme.clone().unwrap_or_default();
                project.public_guest_access = entry.public_guest_access.unwrap_or(false);
                projects::insert_project(self.conn, &project)?;

                debug!(project = %uuid, title = %project.title, "Project created");
                entry.sync.set(SyncStatus::Created);
                self.events.push(SyncEvent::ProjectCreated {
                    uuid,
                    title: project.title,
                    project_type: project.project_type,
                });
            }
            Some(local) => {
                if local.project_type != entry.project_type {
                    return Ok(Err(format!(
                        "Type mismatch: local {}, remote {}",
                        local.project_type, entry.project_type
                    )));
                }

                let mut project = local.clone();
                project.title = title;
                project.parent_uuid = entry.parent_uuid;
                if let Some(description) = &entry.description {
                    project.description = description.clone();
                }
                if let Some(readme) = &entry.readme {
                    project.readme = readme.clone();
                }
                if let Some(public_guest_access) = entry.public_guest_access {
                    project.public_guest_access = public_guest_access;
                }

                if project == local {
                    return Ok(Ok(()));
                }
                if let Some(other) = sibling {
                    return Ok(Err(format!(
                        "Title \"{}\" already in use by {}",
                        project.title, other.uuid
                    )));
                }

                projects::update_project(self.conn, &project)?;

                debug!(project = %uuid, title = %project.title, "Project updated");
                entry.sync.set(SyncStatus::Updated);
                self.events.push(SyncEvent::ProjectUpdated {
                    uuid,
                    title: project.title,
                });
            }
        }

        Ok(Ok(()))
    }

    // ---- roles ----

    fn sync_roles(&mut self, project_uuid: Uuid, entry: &mut ProjectEntry) -> Result<()> {
        let Some(role_map) = entry.roles.as_mut() else {
            return Ok(());
        };

        // Owner first, so a replaced owner no longer counts against other roles
        let mut keys: Vec<Uuid> = role_map.keys().copied().collect();
        keys.sort_by_key(|key| (role_map[key].role != RoleName::Owner.as_str(), *key));

        // Local delegates missing here are removed or demoted later in this run
        let incoming_delegates: HashSet<String> = role_map
            .values()
            .filter(|role| role.role == RoleName::Delegate.as_str())
            .map(|role| role.user.clone())
            .collect();

        let mut deleted = Vec::new();
        for key in keys {
            let Some(role_entry) = role_map.get_mut(&key) else {
                continue;
            };
            if let Err(msg) = self.sync_role(project_uuid, key, role_entry, &incoming_delegates, &mut deleted)? {
                warn!(project = %project_uuid, user = %role_entry.user, "Role not synced: {}", msg);
                role_entry.sync.set_error(msg);
            }
        }

        for (uuid, gone) in deleted {
            insert_deleted(role_map, uuid, gone);
        }
        Ok(())
    }

    fn sync_role(
        &mut self,
        project_uuid: Uuid,
        role_uuid: Uuid,
        role_entry: &mut RoleEntry,
        incoming_delegates: &HashSet<String>,
        deleted: &mut Vec<(Uuid, RoleEntry)>,
    ) -> Result<EntityResult<()>> {
        let Some(role) = roles::get_role(self.conn, &role_entry.role)? else {
            return Ok(Err(format!("Role \"{}\" not found", role_entry.role)));
        };
        let is_owner = role.name == RoleName::Owner.as_str();

        let user = match self.resolve_role_user(&role_entry.user)? {
            Ok(user) => user,
            Err(reason) if is_owner => {
                let msg = format!(
                    "{}; owner role assigned to default owner \"{}\"",
                    reason, self.default_owner.username
                );
                info!(project = %project_uuid, "{}", msg);
                role_entry.user = self.default_owner.username.clone();
                role_entry.sync.set_msg(msg);
                self.default_owner.clone()
            }
            Err(reason) => return Ok(Err(reason)),
        };

        if role.name == RoleName::Delegate.as_str() && self.config.delegate_limit > 0 {
            let delegates = roles::list_assignments(self.conn, project_uuid)?
                .into_iter()
                .filter(|assignment| {
                    assignment.is_role(RoleName::Delegate)
                        && assignment.user_uuid != user.uuid
                        && incoming_delegates.contains(&assignment.username)
                })
                .count();
            if delegates >= self.config.delegate_limit as usize {
                return Ok(Err(format!(
                    "Delegate limit of {} reached",
                    self.config.delegate_limit
                )));
            }
        }

        if is_owner {
            if let Some(old) = roles::get_owner(self.conn, project_uuid)? {
                if old.user_uuid != user.uuid {
                    roles::delete_assignment(self.conn, old.uuid)?;
                    debug!(project = %project_uuid, user = %old.username, "Previous owner removed");
                    self.push_role_deleted(project_uuid, &old.username, &old.role_name);
                    deleted.push((old.uuid, deleted_entry(old.username, old.role_name)));
                }
            }
        }

        match roles::get_assignment(self.conn, project_uuid, user.uuid)? {
            Some(existing) if existing.role_name == role.name => {}
            Some(existing) => {
                if existing.is_role(RoleName::Owner) {
                    return Ok(Err("Owner can only be replaced by a new owner".to_string()));
                }
                roles::update_assignment_role(self.conn, existing.uuid, &role.name)?;
                role_entry.sync.set(SyncStatus::Updated);
                self.events.push(SyncEvent::RoleUpdated {
                    project_uuid,
                    username: user.username.clone(),
                    role: role.name.clone(),
                });
            }
            None => {
                let uuid = if roles::assignment_uuid_in_use(self.conn, role_uuid)? {
                    Uuid::new_v4()
                } else {
                    role_uuid
                };
                roles::insert_assignment(self.conn, uuid, project_uuid, user.uuid, &role.name)?;
                role_entry.sync.set(SyncStatus::Created);
                self.events.push(SyncEvent::RoleCreated {
                    project_uuid,
                    username: user.username.clone(),
                    role: role.name.clone(),
                });
            }
        }

        Ok(Ok(()))
    }

    fn resolve_role_user(&self, username: &str) -> Result<EntityResult<UserRow>> {
        let directory = is_directory_username(username);

        if !directory && !self.config.allow_local_users {
            return Ok(Err(format!("Local user \"{}\" not allowed", username)));
        }

        match users::get_user_by_username(self.conn, username)? {
            Some(user) => Ok(Ok(user)),
            None if directory => Ok(Err(format!("User \"{}\" not found", username))),
            None => Ok(Err(format!("Local user \"{}\" not found", username))),
        }
    }

    /// Remove non-owner assignments whose user is not in the incoming list
    ///
    /// A user listed with a role that failed to apply still counts as listed,
    /// so their local assignment is kept unchanged.
    fn delete_absent_roles(&mut self, project_uuid: Uuid, entry: &mut ProjectEntry) -> Result<()> {
        let incoming: HashSet<String> = entry
            .roles
            .iter()
            .flat_map(|role_map| role_map.values())
            .filter(|role| role.sync.status != Some(SyncStatus::Deleted))
            .map(|role| role.user.clone())
            .collect();

        let mut removed = Vec::new();
        for assignment in roles::list_assignments(self.conn, project_uuid)? {
            if assignment.is_role(RoleName::Owner) || incoming.contains(&assignment.username) {
                continue;
            }
            roles::delete_assignment(self.conn, assignment.uuid)?;
            debug!(project = %project_uuid, user = %assignment.username, "Role deleted");
            self.push_role_deleted(project_uuid, &assignment.username, &assignment.role_name);
            removed.push((
                assignment.uuid,
                deleted_entry(assignment.username, assignment.role_name),
            ));
        }

        if !removed.is_empty() {
            let role_map = entry.roles.get_or_insert_with(BTreeMap::new);
            for (uuid, gone) in removed {
                insert_deleted(role_map, uuid, gone);
            }
        }
        Ok(())
    }

    fn push_role_deleted(&mut self, project_uuid: Uuid, username: &str, role: &str) {
        self.events.push(SyncEvent::RoleDeleted {
            project_uuid,
            username: username.to_string(),
            role: role.to_string(),
        });
    }

    // ---- peer links ----

    /// Make the project's PEER edges equal to `remote_sites`
    fn sync_peer_links(&mut self, project_uuid: Uuid, entry: &ProjectEntry) -> Result<()> {
        let wanted: BTreeSet<Uuid> = entry
            .remote_sites
            .iter()
            .flatten()
            .copied()
            .filter(|uuid| *uuid != self.site.uuid)
            .collect();

        let mut linked = BTreeSet::new();
        for site_uuid in wanted {
            match remote::get_site(self.conn, site_uuid)? {
                Some(peer) if peer.mode == SiteMode::Peer => {
                    remote::upsert_remote_project(self.conn, site_uuid, project_uuid, entry.level)?;
                    linked.insert(site_uuid);
                }
                Some(peer) => {
                    warn!(site = %site_uuid, mode = %peer.mode, "Linked site is not a peer, skipping");
                }
                None => {
                    warn!(site = %site_uuid, "Linked peer site unknown, skipping");
                }
            }
        }

        for (edge, site) in remote::list_project_sites(self.conn, project_uuid)? {
            if site.mode != SiteMode::Peer || linked.contains(&site.uuid) {
                continue;
            }
            remote::delete_remote_project(self.conn, edge.uuid)?;
            debug!(site = %site.name, project = %project_uuid, "Peer link removed");
            self.events.push(SyncEvent::PeerLinkRemoved {
                site_uuid: site.uuid,
                project_uuid,
            });
        }

        Ok(())
    }

    // ---- app settings ----

    fn sync_app_settings(&mut self, snapshot: &mut Snapshot) -> Result<()> {
        for (&uuid, entry) in snapshot.app_settings.iter_mut() {
            match self.sync_app_setting(uuid, entry)? {
                Ok(Some(status)) => entry.sync.set(status),
                Ok(None) => debug!(setting = %entry.name, "Local setting kept"),
                Err(msg) => {
                    warn!(setting = %entry.name, "Setting not synced: {}", msg);
                    entry.sync.set_error(msg);
                }
            }
        }
        Ok(())
    }

    /// `Ok(None)` when a local value was kept
    fn sync_app_setting(
        &mut self,
        uuid: Uuid,
        entry: &AppSettingEntry,
    ) -> Result<EntityResult<Option<SyncStatus>>> {
        let plugin = entry.app_plugin.as_deref();
        if self.registry.get_plugin(plugin).is_none() {
            return Ok(Err(format!("App plugin \"{}\" not installed", plugin.unwrap_or_default())));
        }

        let key = SettingKey::new(plugin, entry.name.as_str());
        let Some(def) = self.registry.get_setting(&key) else {
            return Ok(Err(format!("Setting {} not defined", key)));
        };
        if def.setting_type != entry.setting_type {
            return Ok(Err(format!(
                "Setting {} has type {}, received {}",
                key, def.setting_type, entry.setting_type
            )));
        }
        if let Err(msg) = entry.setting_type.validate(&entry.value, &entry.value_json) {
            return Ok(Err(msg));
        }

        let scope_ok = match def.scope {
            SettingScope::Project => entry.project_uuid.is_some() && entry.user_uuid.is_none(),
            SettingScope::User => entry.project_uuid.is_none() && entry.user_uuid.is_some(),
            SettingScope::ProjectUser => entry.project_uuid.is_some() && entry.user_uuid.is_some(),
            SettingScope::Site => entry.project_uuid.is_none() && entry.user_uuid.is_none(),
        };
        if !scope_ok {
            return Ok(Err(format!("Setting {} does not match scope {}", key, def.scope)));
        }

        if let Some(project_uuid) = entry.project_uuid {
            if projects::get_project(self.conn, project_uuid)?.is_none() {
                return Ok(Err(format!("Project {} not found", project_uuid)));
            }
        }

        let user_uuid = match entry.user_uuid {
            Some(remote_uuid) => match self.local_user(remote_uuid)? {
                Some(local) => Some(local),
                None => return Ok(Err(format!("User {} not found", remote_uuid))),
            },
            None => None,
        };

        let existing = settings::find_setting(self.conn, plugin, &entry.name, entry.project_uuid, user_uuid)?;
        if let Some(row) = &existing {
            if row.local {
                return Ok(Ok(None));
            }
            settings::delete_setting(self.conn, row.uuid)?;
        }

        let row_uuid = if settings::get_setting(self.conn, uuid)?.is_some() {
            Uuid::new_v4()
        } else {
            uuid
        };
        settings::insert_setting(
            self.conn,
            &AppSettingRow {
                uuid: row_uuid,
                app_plugin: entry.app_plugin.clone(),
                name: entry.name.clone(),
                setting_type: entry.setting_type,
                value: entry.value.clone(),
                value_json: entry.value_json.clone(),
                project_uuid: entry.project_uuid,
                user_uuid,
                local: entry.local,
            },
        )?;

        self.events.push(SyncEvent::SettingSet {
            key: key.to_string(),
            project_uuid: entry.project_uuid,
            user_uuid,
        });

        Ok(Ok(Some(if existing.is_some() {
            SyncStatus::Updated
        } else {
            SyncStatus::Created
        })))
    }

    /// Local UUID of a snapshot user, falling back to a direct UUID match
    fn local_user(&self, remote_uuid: Uuid) -> Result<Option<Uuid>> {
        if let Some(local) = self.user_map.get(&remote_uuid) {
            return Ok(Some(*local));
        }
        Ok(users::get_user(self.conn, remote_uuid)?.map(|user| user.uuid))
    }
}

/// Sort project UUIDs so every parent precedes its children
///
/// The depth of an entry is the length of its parent chain inside the
/// snapshot. Depths are memoized so each entry is walked once. A cycle is a
/// structural error.
pub fn processing_order(projects: &BTreeMap<Uuid, ProjectEntry>) -> Result<Vec<Uuid>> {
    let mut depths: HashMap<Uuid, usize> = HashMap::new();

    for &uuid in projects.keys() {
        let mut chain: Vec<Uuid> = Vec::new();
        let mut current = uuid;
        let mut known: Option<usize> = None;

        loop {
            if let Some(&depth) = depths.get(&current) {
                known = Some(depth);
                break;
            }
            if chain.contains(&current) {
                return Err(SyncError::InvalidSnapshot(format!(
                    "Cycle in project hierarchy at {}",
                    current
                )));
            }
            chain.push(current);

            match projects.get(&current).and_then(|entry| entry.parent_uuid) {
                Some(parent) if projects.contains_key(&parent) => current = parent,
                _ => break,
            }
        }

        let mut depth = known.map(|d| d + 1).unwrap_or(0);
        for node in chain.iter().rev() {
            depths.insert(*node, depth);
            depth += 1;
        }
    }

    let mut order: Vec<Uuid> = projects.keys().copied().collect();
    order.sort_by_key(|uuid| (depths.get(uuid).copied().unwrap_or(0), *uuid));
    Ok(order)
}

fn deleted_entry(username: String, role_name: String) -> RoleEntry {
    let mut entry = RoleEntry::new(username, role_name);
    entry.sync.set(SyncStatus::Deleted);
    entry
}

/// Add a `deleted` annotation without overwriting an incoming entry
fn insert_deleted(role_map: &mut BTreeMap<Uuid, RoleEntry>, uuid: Uuid, entry: RoleEntry) {
    let key = if role_map.contains_key(&uuid) {
        Uuid::new_v4()
    } else {
        uuid
    };
    role_map.insert(key, entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::ProjectType;
    use crate::db::remote::insert_site;
    use crate::db::roles::{insert_assignment, list_assignments};
    use crate::db::SyncDb;
    use crate::sync::snapshot::{StatusInfo, UserEntry};

    struct Fixture {
        db: SyncDb,
        source: Uuid,
        config: SyncConfig,
        registry: PluginRegistry,
    }

    fn fixture() -> Fixture {
        let db = SyncDb::open_in_memory().unwrap();
        let source = RemoteSiteRow::new("Source", "https://source.example", SiteMode::Source)
            .with_secret("s3cret");
        db.with_conn(|conn| {
            insert_site(conn, &source)?;
            users::insert_user(conn, &UserRow::new("admin"))?;
            Ok(())
        })
        .unwrap();

        Fixture {
            db,
            source: source.uuid,
            config: SyncConfig::default(),
            registry: PluginRegistry::default(),
        }
    }

    fn apply(fixture: &Fixture, snapshot: &mut Snapshot) -> Result<Vec<SyncEvent>> {
        fixture.db.with_conn_mut(|conn| {
            reconcile(conn, &fixture.registry, &fixture.config, fixture.source, snapshot)
        })
    }

    fn project(title: &str, project_type: ProjectType, level: AccessLevel, parent: Option<Uuid>) -> ProjectEntry {
        ProjectEntry {
            title: Some(title.to_string()),
            project_type,
            level,
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

    fn user(username: &str) -> UserEntry {
        UserEntry {
            username: username.to_string(),
            name: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
            groups: vec![],
            sync: StatusInfo::default(),
        }
    }

    #[test]
    fn test_processing_order_parents_first() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let mut projects = BTreeMap::new();
        projects.insert(c, project("C", ProjectType::Project, AccessLevel::ReadInfo, Some(b)));
        projects.insert(b, project("B", ProjectType::Category, AccessLevel::ReadInfo, Some(a)));
        projects.insert(a, project("A", ProjectType::Category, AccessLevel::ReadInfo, None));

        assert_eq!(processing_order(&projects).unwrap(), vec![a, b, c]);
    }

    #[test]
    fn test_processing_order_rejects_cycle() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut projects = BTreeMap::new();
        projects.insert(a, project("A", ProjectType::Category, AccessLevel::ReadInfo, Some(b)));
        projects.insert(b, project("B", ProjectType::Category, AccessLevel::ReadInfo, Some(a)));

        assert!(matches!(
            processing_order(&projects),
            Err(SyncError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_missing_default_owner_aborts() {
        let mut fixture = fixture();
        fixture.config.default_owner = "nobody".to_string();
        let mut snapshot = Snapshot::default();

        assert!(matches!(
            apply(&fixture, &mut snapshot),
            Err(SyncError::DefaultOwnerMissing(_))
        ));
    }

    #[test]
    fn test_unknown_source_site_aborts() {
        let mut fixture = fixture();
        fixture.source = Uuid::new_v4();
        let mut snapshot = Snapshot::default();

        assert!(matches!(apply(&fixture, &mut snapshot), Err(SyncError::SiteNotFound(_))));
    }

    #[test]
    fn test_missing_parent_fails_entry_and_descendants() {
        let fixture = fixture();
        let ghost = Uuid::new_v4();
        let child = Uuid::new_v4();
        let grandchild = Uuid::new_v4();

        let mut snapshot = Snapshot::default();
        snapshot
            .projects
            .insert(child, project("Child", ProjectType::Category, AccessLevel::ReadInfo, Some(ghost)));
        snapshot.projects.insert(
            grandchild,
            project("Grandchild", ProjectType::Project, AccessLevel::ReadInfo, Some(child)),
        );

        apply(&fixture, &mut snapshot).unwrap();

        assert!(snapshot.projects[&child].sync.is_error());
        let grandchild_entry = &snapshot.projects[&grandchild];
        assert!(grandchild_entry.sync.is_error());
        assert!(grandchild_entry.sync.status_msg.as_deref().unwrap().contains("failed"));
    }

    #[test]
    fn test_type_change_is_entity_error() {
        let fixture = fixture();
        let uuid = Uuid::new_v4();
        fixture
            .db
            .with_conn(|conn| projects::insert_project(conn, &ProjectRow::new(uuid, "Thing", ProjectType::Project)))
            .unwrap();

        let mut snapshot = Snapshot::default();
        snapshot
            .projects
            .insert(uuid, project("Thing", ProjectType::Category, AccessLevel::ReadInfo, None));
        apply(&fixture, &mut snapshot).unwrap();

        assert!(snapshot.projects[&uuid].sync.is_error());
    }

    #[test]
    fn test_local_user_roles_rejected_by_default() {
        let fixture = fixture();
        let uuid = Uuid::new_v4();
        let role_uuid = Uuid::new_v4();
        let owner_uuid = Uuid::new_v4();

        let mut entry = project("Project", ProjectType::Project, AccessLevel::ReadRoles, None);
        let mut role_map = BTreeMap::new();
        role_map.insert(owner_uuid, RoleEntry::new("carol", RoleName::Owner.as_str()));
        role_map.insert(role_uuid, RoleEntry::new("dave", RoleName::Guest.as_str()));
        entry.roles = Some(role_map);

        let mut snapshot = Snapshot::default();
        snapshot.projects.insert(uuid, entry);
        apply(&fixture, &mut snapshot).unwrap();

        let roles = snapshot.projects[&uuid].roles.as_ref().unwrap();
        // owner falls back to the default owner
        assert_eq!(roles[&owner_uuid].user, "admin");
        assert_eq!(roles[&owner_uuid].sync.status, Some(SyncStatus::Created));
        assert!(roles[&owner_uuid].sync.status_msg.is_some());
        // other roles fail
        assert!(roles[&role_uuid].sync.is_error());
    }

    #[test]
    fn test_unknown_role_is_entity_error() {
        let fixture = fixture();
        let uuid = Uuid::new_v4();
        let role_uuid = Uuid::new_v4();

        let mut snapshot = Snapshot::default();
        snapshot.users.insert(Uuid::new_v4(), user("alice@EXAMPLE"));
        let mut entry = project("Project", ProjectType::Project, AccessLevel::ReadRoles, None);
        let mut role_map = BTreeMap::new();
        role_map.insert(role_uuid, RoleEntry::new("alice@EXAMPLE", "project finder"));
        entry.roles = Some(role_map);
        snapshot.projects.insert(uuid, entry);

        apply(&fixture, &mut snapshot).unwrap();

        let role = &snapshot.projects[&uuid].roles.as_ref().unwrap()[&role_uuid];
        assert!(role.sync.is_error());
        assert_eq!(snapshot.projects[&uuid].sync.status, Some(SyncStatus::Created));
    }

    #[test]
    fn test_delegate_limit_enforced() {
        let fixture = fixture();
        let uuid = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let mut snapshot = Snapshot::default();
        snapshot.users.insert(Uuid::new_v4(), user("alice@EXAMPLE"));
        snapshot.users.insert(Uuid::new_v4(), user("bob@EXAMPLE"));
        let mut entry = project("Project", ProjectType::Project, AccessLevel::ReadRoles, None);
        let mut role_map = BTreeMap::new();
        role_map.insert(first, RoleEntry::new("alice@EXAMPLE", RoleName::Delegate.as_str()));
        role_map.insert(second, RoleEntry::new("bob@EXAMPLE", RoleName::Delegate.as_str()));
        entry.roles = Some(role_map);
        snapshot.projects.insert(uuid, entry);

        apply(&fixture, &mut snapshot).unwrap();

        let roles = snapshot.projects[&uuid].roles.as_ref().unwrap();
        let errors = roles.values().filter(|r| r.sync.is_error()).count();
        assert_eq!(errors, 1);
    }

    /// Local project with owner@EXAMPLE as owner plus extra assignments
    fn seed_project(fixture: &Fixture, uuid: Uuid, extra: &[(&str, RoleName)]) {
        fixture
            .db
            .with_conn(|conn| {
                projects::insert_project(conn, &ProjectRow::new(uuid, "Project", ProjectType::Project))?;
                let owner = UserRow::new("owner@EXAMPLE");
                users::insert_user(conn, &owner)?;
                insert_assignment(conn, Uuid::new_v4(), uuid, owner.uuid, RoleName::Owner.as_str())?;
                for (username, role) in extra {
                    let user = UserRow::new(*username);
                    users::insert_user(conn, &user)?;
                    insert_assignment(conn, Uuid::new_v4(), uuid, user.uuid, role.as_str())?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn roles_entry(roles: &[(Uuid, &str, RoleName)]) -> ProjectEntry {
        let mut entry = project("Project", ProjectType::Project, AccessLevel::ReadRoles, None);
        let mut role_map = BTreeMap::new();
        role_map.insert(Uuid::new_v4(), RoleEntry::new("owner@EXAMPLE", RoleName::Owner.as_str()));
        for (key, username, role) in roles {
            role_map.insert(*key, RoleEntry::new(*username, role.as_str()));
        }
        entry.roles = Some(role_map);
        entry
    }

    fn local_roles(fixture: &Fixture, uuid: Uuid) -> Vec<(String, String)> {
        let mut rows: Vec<_> = fixture
            .db
            .with_conn(|conn| list_assignments(conn, uuid))
            .unwrap()
            .into_iter()
            .map(|a| (a.username, a.role_name))
            .collect();
        rows.sort();
        rows
    }

    #[test]
    fn test_delegate_replaced_in_one_run() {
        let fixture = fixture();
        let uuid = Uuid::new_v4();
        seed_project(&fixture, uuid, &[("alice@EXAMPLE", RoleName::Delegate)]);
        fixture
            .db
            .with_conn(|conn| users::insert_user(conn, &UserRow::new("bob@EXAMPLE")))
            .unwrap();

        let bob_key = Uuid::new_v4();
        let mut snapshot = Snapshot::default();
        snapshot
            .projects
            .insert(uuid, roles_entry(&[(bob_key, "bob@EXAMPLE", RoleName::Delegate)]));
        apply(&fixture, &mut snapshot).unwrap();

        let roles = snapshot.projects[&uuid].roles.as_ref().unwrap();
        assert_eq!(roles[&bob_key].sync.status, Some(SyncStatus::Created));
        assert_eq!(
            local_roles(&fixture, uuid),
            vec![
                ("bob@EXAMPLE".to_string(), RoleName::Delegate.as_str().to_string()),
                ("owner@EXAMPLE".to_string(), RoleName::Owner.as_str().to_string()),
            ]
        );
    }

    #[test]
    fn test_delegate_and_contributor_exchange_roles() {
        let fixture = fixture();
        let uuid = Uuid::new_v4();
        seed_project(
            &fixture,
            uuid,
            &[
                ("alice@EXAMPLE", RoleName::Delegate),
                ("bob@EXAMPLE", RoleName::Contributor),
            ],
        );

        // bob's key sorts first, so the promotion runs before the demotion
        let bob_key = Uuid::from_u128(1);
        let alice_key = Uuid::from_u128(2);
        let mut snapshot = Snapshot::default();
        snapshot.projects.insert(
            uuid,
            roles_entry(&[
                (bob_key, "bob@EXAMPLE", RoleName::Delegate),
                (alice_key, "alice@EXAMPLE", RoleName::Contributor),
            ]),
        );
        apply(&fixture, &mut snapshot).unwrap();

        let roles = snapshot.projects[&uuid].roles.as_ref().unwrap();
        assert_eq!(roles[&bob_key].sync.status, Some(SyncStatus::Updated));
        assert_eq!(roles[&alice_key].sync.status, Some(SyncStatus::Updated));
        assert_eq!(
            local_roles(&fixture, uuid),
            vec![
                ("alice@EXAMPLE".to_string(), RoleName::Contributor.as_str().to_string()),
                ("bob@EXAMPLE".to_string(), RoleName::Delegate.as_str().to_string()),
                ("owner@EXAMPLE".to_string(), RoleName::Owner.as_str().to_string()),
            ]
        );
    }

    #[test]
    fn test_failed_role_keeps_local_assignment() {
        let fixture = fixture();
        let uuid = Uuid::new_v4();
        seed_project(&fixture, uuid, &[("dave", RoleName::Guest)]);

        let dave_key = Uuid::new_v4();
        let mut snapshot = Snapshot::default();
        snapshot
            .projects
            .insert(uuid, roles_entry(&[(dave_key, "dave", RoleName::Contributor)]));
        apply(&fixture, &mut snapshot).unwrap();

        let roles = snapshot.projects[&uuid].roles.as_ref().unwrap();
        assert!(roles[&dave_key].sync.is_error());
        assert!(!roles.values().any(|r| r.sync.status == Some(SyncStatus::Deleted)));
        assert!(local_roles(&fixture, uuid)
            .contains(&("dave".to_string(), RoleName::Guest.as_str().to_string())));
    }

    #[test]
    fn test_new_owner_replaces_old_owner() {
        let fixture = fixture();
        let uuid = Uuid::new_v4();
        let old_owner = UserRow::new("old@EXAMPLE");
        let old_assignment = Uuid::new_v4();

        fixture
            .db
            .with_conn(|conn| {
                users::insert_user(conn, &old_owner)?;
                projects::insert_project(conn, &ProjectRow::new(uuid, "Project", ProjectType::Project))?;
                insert_assignment(conn, old_assignment, uuid, old_owner.uuid, RoleName::Owner.as_str())?;
                Ok(())
            })
            .unwrap();

        let mut snapshot = Snapshot::default();
        snapshot.users.insert(Uuid::new_v4(), user("new@EXAMPLE"));
        let mut entry = project("Project", ProjectType::Project, AccessLevel::ReadRoles, None);
        let mut role_map = BTreeMap::new();
        role_map.insert(Uuid::new_v4(), RoleEntry::new("new@EXAMPLE", RoleName::Owner.as_str()));
        entry.roles = Some(role_map);
        snapshot.projects.insert(uuid, entry);

        apply(&fixture, &mut snapshot).unwrap();

        let assignments = fixture.db.with_conn(|conn| list_assignments(conn, uuid)).unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].username, "new@EXAMPLE");

        let roles = snapshot.projects[&uuid].roles.as_ref().unwrap();
        assert_eq!(roles[&old_assignment].sync.status, Some(SyncStatus::Deleted));
    }

    #[test]
    fn test_peer_site_conflicting_with_source() {
        let fixture = fixture();
        let mut snapshot = Snapshot::default();
        snapshot.peer_sites.insert(
            fixture.source,
            crate::sync::snapshot::PeerSiteEntry {
                name: "Source".into(),
                url: "https://source.example".into(),
                description: String::new(),
                user_display: true,
                sync: StatusInfo::default(),
            },
        );

        apply(&fixture, &mut snapshot).unwrap();
        assert!(snapshot.peer_sites[&fixture.source].sync.is_error());
    }
}
