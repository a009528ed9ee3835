//! Snapshot wire format
//!
//! A snapshot is exchanged as JSON. All maps are keyed by UUID and use
//! `BTreeMap` so serialization order is stable. After reconciliation each
//! entity may carry a `status` and a `status_msg`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::access::{AccessLevel, ProjectType};
use crate::plugins::SettingType;

/// Change applied to an entity by a reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Created,
    Updated,
    Deleted,
    Error,
}

/// Per-entity annotation written back by the reconciler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SyncStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,
}

impl StatusInfo {
    pub fn set(&mut self, status: SyncStatus) {
        self.status = Some(status);
    }

    pub fn set_error(&mut self, msg: impl Into<String>) {
        self.status = Some(SyncStatus::Error);
        self.status_msg = Some(msg.into());
    }

    /// Informational message which does not change the status
    pub fn set_msg(&mut self, msg: impl Into<String>) {
        self.status_msg = Some(msg.into());
    }

    pub fn is_error(&self) -> bool {
        self.status == Some(SyncStatus::Error)
    }

    pub fn clear(&mut self) {
        self.status = None;
        self.status_msg = None;
    }
}

/// Full snapshot sent from a source to a target site
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub users: BTreeMap<Uuid, UserEntry>,
    #[serde(default)]
    pub projects: BTreeMap<Uuid, ProjectEntry>,
    #[serde(default)]
    pub peer_sites: BTreeMap<Uuid, PeerSiteEntry>,
    #[serde(default)]
    pub app_settings: BTreeMap<Uuid, AppSettingEntry>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.projects.is_empty()
            && self.peer_sites.is_empty()
            && self.app_settings.is_empty()
    }

    /// Remove all annotations, e.g. before re-sending a reconciled snapshot
    pub fn clear_status(&mut self) {
        self.users.values_mut().for_each(|u| u.sync.clear());
        self.peer_sites.values_mut().for_each(|s| s.sync.clear());
        self.app_settings.values_mut().for_each(|s| s.sync.clear());
        for project in self.projects.values_mut() {
            project.sync.clear();
            if let Some(roles) = project.roles.as_mut() {
                roles.retain(|_, role| role.sync.status != Some(SyncStatus::Deleted));
                roles.values_mut().for_each(|r| r.sync.clear());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(flatten)]
    pub sync: StatusInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEntry {
    /// Withheld at VIEW_AVAILABILITY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub project_type: ProjectType,
    pub level: AccessLevel,
    #[serde(default)]
    pub parent_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_guest_access: Option<bool>,
    /// VIEW_AVAILABILITY only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<BTreeMap<Uuid, RoleEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_sites: Option<Vec<Uuid>>,
    #[serde(flatten)]
    pub sync: StatusInfo,
}

impl ProjectEntry {
    /// Entry carrying only the level and the availability flag
    pub fn availability(project_type: ProjectType, available: bool) -> Self {
        Self {
            title: None,
            project_type,
            level: AccessLevel::ViewAvailability,
            parent_uuid: None,
            description: None,
            readme: None,
            public_guest_access: None,
            available: Some(available),
            roles: None,
            remote_sites: None,
            sync: StatusInfo::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEntry {
    /// Username of the assignee
    pub user: String,
    /// Role name, e.g. "project owner"
    pub role: String,
    #[serde(flatten)]
    pub sync: StatusInfo,
}

impl RoleEntry {
    pub fn new(user: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            role: role.into(),
            sync: StatusInfo::default(),
        }
    }
}

/// Third-party site descriptor; secrets are never part of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSiteEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_user_display")]
    pub user_display: bool,
    #[serde(flatten)]
    pub sync: StatusInfo,
}

fn default_user_display() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettingEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub setting_type: SettingType,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub value_json: Value,
    /// `None` for core settings
    #[serde(default)]
    pub app_plugin: Option<String>,
    #[serde(default)]
    pub project_uuid: Option<Uuid>,
    #[serde(default)]
    pub user_uuid: Option<Uuid>,
    #[serde(default)]
    pub local: bool,
    #[serde(flatten)]
    pub sync: StatusInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wire_snapshot() {
        let category = Uuid::new_v4();
        let project = Uuid::new_v4();
        let role = Uuid::new_v4();
        let raw = json!({
            "users": {},
            "projects": {
                category.to_string(): {
                    "title": "Category", "type": "CATEGORY", "level": "READ_INFO",
                    "parent_uuid": null, "description": "", "readme": ""
                },
                project.to_string(): {
                    "title": "Project", "type": "PROJECT", "level": "READ_ROLES",
                    "parent_uuid": category.to_string(),
                    "roles": { role.to_string(): { "user": "alice@EXAMPLE", "role": "project owner" } },
                    "remote_sites": []
                }
            },
            "peer_sites": {},
            "app_settings": {}
        });

        let snapshot: Snapshot = serde_json::from_value(raw).unwrap();
        let entry = &snapshot.projects[&project];
        assert_eq!(entry.parent_uuid, Some(category));
        assert_eq!(entry.level, AccessLevel::ReadRoles);
        assert_eq!(entry.roles.as_ref().unwrap()[&role].user, "alice@EXAMPLE");
        assert_eq!(entry.remote_sites, Some(vec![]));
        assert_eq!(entry.sync.status, None);
    }

    #[test]
    fn test_status_serialized_only_when_set() {
        let mut entry = RoleEntry::new("alice@EXAMPLE", "project guest");
        let plain = serde_json::to_value(&entry).unwrap();
        assert!(plain.get("status").is_none());

        entry.sync.set_error("Unknown role");
        let annotated = serde_json::to_value(&entry).unwrap();
        assert_eq!(annotated["status"], "error");
        assert_eq!(annotated["status_msg"], "Unknown role");
    }

    #[test]
    fn test_view_availability_withholds_title() {
        let entry = ProjectEntry::availability(ProjectType::Project, true);
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("title").is_none());
        assert_eq!(value["available"], true);
        assert_eq!(value["level"], "VIEW_AVAILABILITY");
        assert!(value["parent_uuid"].is_null());
    }
}
