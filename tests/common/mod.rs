//! Shared fixtures: a source site and a target site, each with its own store

#![allow(dead_code)]

use std::sync::Arc;

use projectroles_sync::access::{AccessLevel, ProjectType, RoleName, SiteMode};
use projectroles_sync::db::projects::{insert_project, ProjectRow};
use projectroles_sync::db::remote::{insert_site, upsert_remote_project};
use projectroles_sync::db::roles::insert_assignment;
use projectroles_sync::db::settings::{delete_setting, find_setting, insert_setting};
use projectroles_sync::db::users::{insert_user, UserRow};
use projectroles_sync::db::{AppSettingRow, RemoteSiteRow, SyncDb};
use projectroles_sync::plugins::SettingType;
use projectroles_sync::sync::{Snapshot, SyncOutcome};
use projectroles_sync::{PluginRegistry, SyncConfig, SyncEngine};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

pub const TARGET_SECRET: &str = "target-secret";

/// Open a file-backed store in a temporary directory
pub fn open_engine(name: &str) -> (Arc<SyncEngine>, TempDir) {
    open_engine_with(name, PluginRegistry::default())
}

pub fn open_engine_with(name: &str, registry: PluginRegistry) -> (Arc<SyncEngine>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = SyncDb::open(&temp_dir.path().join(format!("{}.db", name))).unwrap();
    let engine = SyncEngine::new(Arc::new(db), Arc::new(registry), SyncConfig::default());
    (Arc::new(engine), temp_dir)
}

pub struct World {
    pub source: Arc<SyncEngine>,
    pub target: Arc<SyncEngine>,
    /// TARGET row in the source store
    pub target_site: RemoteSiteRow,
    /// SOURCE row in the target store
    pub source_site: RemoteSiteRow,
    pub category: Uuid,
    pub project: Uuid,
    pub alice: UserRow,
    _dirs: (TempDir, TempDir),
}

/// Category > Project on the source, both owned by alice@EXAMPLE, with the
/// project linked to the target at READ_ROLES
pub fn world() -> World {
    world_with(PluginRegistry::default())
}

/// Same layout, both sites running with `registry`
pub fn world_with(registry: PluginRegistry) -> World {
    let (source, source_dir) = open_engine_with("source", registry.clone());
    let (target, target_dir) = open_engine_with("target", registry);

    let target_site = RemoteSiteRow::new("Target", "https://target.example", SiteMode::Target)
        .with_secret(TARGET_SECRET);
    let source_site = RemoteSiteRow::new("Source", "https://source.example", SiteMode::Source)
        .with_secret(TARGET_SECRET);

    let category = Uuid::new_v4();
    let project = Uuid::new_v4();
    let mut alice = UserRow::new("alice@EXAMPLE");
    alice.name = "Alice Example".into();
    alice.email = "alice@example.com".into();

    source
        .db()
        .with_conn(|conn| {
            insert_site(conn, &target_site)?;
            insert_user(conn, &alice)?;
            insert_project(conn, &ProjectRow::new(category, "Category", ProjectType::Category))?;
            insert_project(
                conn,
                &ProjectRow::new(project, "Project", ProjectType::Project).with_parent(category),
            )?;
            insert_assignment(conn, Uuid::new_v4(), category, alice.uuid, RoleName::Owner.as_str())?;
            insert_assignment(conn, Uuid::new_v4(), project, alice.uuid, RoleName::Owner.as_str())?;
            upsert_remote_project(conn, target_site.uuid, project, AccessLevel::ReadRoles)?;
            Ok(())
        })
        .unwrap();

    target
        .db()
        .with_conn(|conn| {
            insert_site(conn, &source_site)?;
            insert_user(conn, &UserRow::new("admin"))?;
            Ok(())
        })
        .unwrap();

    World {
        source,
        target,
        target_site,
        source_site,
        category,
        project,
        alice,
        _dirs: (source_dir, target_dir),
    }
}

impl World {
    /// Export on the source, serialize, parse and reconcile on the target
    pub fn transfer(&self) -> SyncOutcome {
        let snapshot = self.export_json();
        self.target
            .reconcile(self.source_site.uuid, serde_json::from_value(snapshot).unwrap())
            .unwrap()
    }

    /// Snapshot for the target as a JSON value
    pub fn export_json(&self) -> serde_json::Value {
        let snapshot: Snapshot = self.source.export(self.target_site.uuid).unwrap();
        serde_json::to_value(&snapshot).unwrap()
    }
}

pub fn add_user(engine: &SyncEngine, username: &str) -> UserRow {
    let user = UserRow::new(username);
    engine.db().with_conn(|conn| insert_user(conn, &user)).unwrap();
    user
}

pub fn assign(engine: &SyncEngine, project: Uuid, user: &UserRow, role: RoleName) {
    engine
        .db()
        .with_conn(|conn| insert_assignment(conn, Uuid::new_v4(), project, user.uuid, role.as_str()))
        .unwrap();
}

/// Replace a core setting value
pub fn put_setting(
    engine: &SyncEngine,
    name: &str,
    setting_type: SettingType,
    value: &str,
    project: Option<Uuid>,
    user: Option<Uuid>,
) {
    put_plugin_setting(engine, None, name, setting_type, value, project, user);
}

/// Replace a setting value, keeping the stored `local` flag
pub fn put_plugin_setting(
    engine: &SyncEngine,
    plugin: Option<&str>,
    name: &str,
    setting_type: SettingType,
    value: &str,
    project: Option<Uuid>,
    user: Option<Uuid>,
) {
    engine
        .db()
        .with_conn(|conn| {
            let mut local = false;
            if let Some(existing) = find_setting(conn, plugin, name, project, user)? {
                local = existing.local;
                delete_setting(conn, existing.uuid)?;
            }
            insert_setting(
                conn,
                &AppSettingRow {
                    uuid: Uuid::new_v4(),
                    app_plugin: plugin.map(str::to_string),
                    name: name.to_string(),
                    setting_type,
                    value: value.to_string(),
                    value_json: json!({}),
                    project_uuid: project,
                    user_uuid: user,
                    local,
                },
            )
        })
        .unwrap();
}

pub fn setting_value(engine: &SyncEngine, name: &str, project: Option<Uuid>, user: Option<Uuid>) -> Option<String> {
    plugin_setting_value(engine, None, name, project, user)
}

pub fn plugin_setting_value(
    engine: &SyncEngine,
    plugin: Option<&str>,
    name: &str,
    project: Option<Uuid>,
    user: Option<Uuid>,
) -> Option<String> {
    engine
        .db()
        .with_conn(|conn| find_setting(conn, plugin, name, project, user))
        .unwrap()
        .map(|row| row.value)
}
