//! Change report derived from an annotated snapshot

use std::fmt;

use serde::Serialize;

use super::snapshot::{Snapshot, StatusInfo, SyncStatus};

/// Per-status counts for one entity kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub error: usize,
}

impl StatusCounts {
    fn record(&mut self, info: &StatusInfo) {
        match info.status {
            Some(SyncStatus::Created) => self.created += 1,
            Some(SyncStatus::Updated) => self.updated += 1,
            Some(SyncStatus::Deleted) => self.deleted += 1,
            Some(SyncStatus::Error) => self.error += 1,
            None => {}
        }
    }

    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    fn is_empty(&self) -> bool {
        self.changes() == 0 && self.error == 0
    }
}

/// Summary of one reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub users: StatusCounts,
    pub projects: StatusCounts,
    pub roles: StatusCounts,
    pub peer_sites: StatusCounts,
    pub app_settings: StatusCounts,
}

impl SyncReport {
    /// Count annotations without touching storage
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut report = Self::default();

        for user in snapshot.users.values() {
            report.users.record(&user.sync);
        }
        for project in snapshot.projects.values() {
            report.projects.record(&project.sync);
            for role in project.roles.iter().flat_map(|roles| roles.values()) {
                report.roles.record(&role.sync);
            }
        }
        for site in snapshot.peer_sites.values() {
            report.peer_sites.record(&site.sync);
        }
        for setting in snapshot.app_settings.values() {
            report.app_settings.record(&setting.sync);
        }

        report
    }

    pub fn error_count(&self) -> usize {
        self.kinds().iter().map(|(_, counts)| counts.error).sum()
    }

    pub fn change_count(&self) -> usize {
        self.kinds().iter().map(|(_, counts)| counts.changes()).sum()
    }

    fn kinds(&self) -> [(&'static str, &StatusCounts); 5] {
        [
            ("users", &self.users),
            ("projects", &self.projects),
            ("roles", &self.roles),
            ("peer sites", &self.peer_sites),
            ("app settings", &self.app_settings),
        ]
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .kinds()
            .iter()
            .filter(|(_, counts)| !counts.is_empty())
            .map(|(kind, c)| {
                format!(
                    "{}: {} created, {} updated, {} deleted, {} errors",
                    kind, c.created, c.updated, c.deleted, c.error
                )
            })
            .collect();

        if parts.is_empty() {
            f.write_str("no changes")
        } else {
            f.write_str(&parts.join("; "))
        }
    }
}

/// `status_msg` of every failed entity, prefixed with its kind and UUID
pub fn error_messages(snapshot: &Snapshot) -> Vec<String> {
    let mut messages = Vec::new();
    let mut push = |kind: &str, uuid: &uuid::Uuid, info: &StatusInfo| {
        if info.is_error() {
            messages.push(format!(
                "{} {}: {}",
                kind,
                uuid,
                info.status_msg.as_deref().unwrap_or("unknown error")
            ));
        }
    };

    for (uuid, user) in &snapshot.users {
        push("user", uuid, &user.sync);
    }
    for (uuid, project) in &snapshot.projects {
        push("project", uuid, &project.sync);
        for (role_uuid, role) in project.roles.iter().flatten() {
            push("role", role_uuid, &role.sync);
        }
    }
    for (uuid, site) in &snapshot.peer_sites {
        push("peer site", uuid, &site.sync);
    }
    for (uuid, setting) in &snapshot.app_settings {
        push("app setting", uuid, &setting.sync);
    }

    messages
}
