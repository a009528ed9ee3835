//! Sync Module - remote project synchronization
//!
//! A target site pulls a snapshot of projects, roles, users and settings
//! from its source site and reconciles it into the local store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Sync Engine                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  SnapshotExporter - Builds the snapshot a target may see        │
//! │  Conflict check   - Rejects clashing categories before writing  │
//! │  Reconciler       - Applies a snapshot in one transaction       │
//! │  SyncReport       - Counts the status annotations               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Access levels
//!
//! - **VIEW_AVAILABILITY**: existence and availability only
//! - **READ_INFO**: title, description, readme and ancestor categories
//! - **READ_ROLES**: full role list and peer sites
//! - **REVOKED**: owner and delegate roles only

pub mod conflict;
pub mod export;
pub mod import;
pub mod report;
pub mod snapshot;

pub use conflict::check_category_conflicts;
pub use export::SnapshotExporter;
pub use import::{processing_order, reconcile, Reconciler};
pub use report::{error_messages, StatusCounts, SyncReport};
pub use snapshot::{
    AppSettingEntry, PeerSiteEntry, ProjectEntry, RoleEntry, Snapshot, StatusInfo, SyncStatus,
    UserEntry,
};

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::access::AccessLevel;
use crate::client::SourceClient;
use crate::config::SyncConfig;
use crate::db::remote::{self, EdgeChange};
use crate::db::SyncDb;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::plugins::PluginRegistry;

/// Result of a reconciliation run
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// The snapshot with status annotations
    pub snapshot: Snapshot,
    pub report: SyncReport,
}

/// Sync engine coordinates export and reconciliation against one store
pub struct SyncEngine {
    db: Arc<SyncDb>,
    registry: Arc<PluginRegistry>,
    config: SyncConfig,
    events: Arc<EventBus>,
}

impl SyncEngine {
    /// Create a new sync engine
    pub fn new(db: Arc<SyncDb>, registry: Arc<PluginRegistry>, config: SyncConfig) -> Self {
        Self {
            db,
            registry,
            config,
            events: Arc::new(EventBus::new()),
        }
    }

    /// Use a shared event bus
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn db(&self) -> &Arc<SyncDb> {
        &self.db
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Export the snapshot for a TARGET site
    pub fn export(&self, site_uuid: Uuid) -> Result<Snapshot> {
        let snapshot = self
            .db
            .with_conn(|conn| SnapshotExporter::new(conn, &self.registry).export(site_uuid))?;

        self.events.emit(SyncEvent::SnapshotExported {
            site_uuid,
            projects: snapshot.projects.len(),
            users: snapshot.users.len(),
        });
        Ok(snapshot)
    }

    /// Export for the TARGET site owning `secret`
    pub fn export_for_secret(&self, secret: &str) -> Result<Snapshot> {
        let site = self
            .db
            .with_conn(|conn| remote::find_target_by_secret(conn, secret))?
            .ok_or(SyncError::Unauthorized)?;
        self.export(site.uuid)
    }

    /// Reconcile a snapshot received from a SOURCE site
    pub fn reconcile(&self, site_uuid: Uuid, mut snapshot: Snapshot) -> Result<SyncOutcome> {
        let events = self.db.with_conn_mut(|conn| {
            reconcile(conn, &self.registry, &self.config, site_uuid, &mut snapshot)
        })?;

        let report = SyncReport::from_snapshot(&snapshot);
        info!(site = %site_uuid, "Sync finished: {}", report);

        self.events.emit_all(events);
        self.events.emit(SyncEvent::SyncCompleted {
            site_uuid,
            summary: report.to_string(),
            errors: report.error_count(),
        });

        Ok(SyncOutcome { snapshot, report })
    }

    /// Fetch a snapshot from a SOURCE site and reconcile it
    pub async fn pull(&self, client: &SourceClient, site_uuid: Uuid) -> Result<SyncOutcome> {
        let site = self
            .db
            .with_conn(|conn| remote::get_site(conn, site_uuid))?
            .ok_or(SyncError::SiteNotFound(site_uuid))?;

        let snapshot = client.fetch_snapshot(&site).await?;
        self.reconcile(site_uuid, snapshot)
    }

    /// Set the level of a local edge, following the access level state machine
    pub fn set_level(&self, site_uuid: Uuid, project_uuid: Uuid, level: AccessLevel) -> Result<EdgeChange> {
        let change = self.db.with_conn(|conn| {
            remote::get_site(conn, site_uuid)?.ok_or(SyncError::SiteNotFound(site_uuid))?;
            remote::set_remote_project_level(conn, site_uuid, project_uuid, level)
        })?;

        if change != EdgeChange::Unchanged {
            self.events.emit(SyncEvent::LevelChanged {
                site_uuid,
                project_uuid,
                level,
            });
        }
        Ok(change)
    }
}
