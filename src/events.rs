//! Event system for sync operations
//!
//! Provides an event bus for notifying listeners about changes applied by
//! the exporter and the reconciler. Useful for:
//! - Timeline / audit logging
//! - Notifications about new role assignments
//!
//! Reconciliation events are only emitted after the transaction committed.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::access::{AccessLevel, ProjectType};

/// Sync events emitted by the engine
#[derive(Debug, Clone)]
pub enum SyncEvent {
    // User events
    UserCreated {
        uuid: Uuid,
        username: String,
    },
    UserUpdated {
        uuid: Uuid,
        username: String,
    },

    // Project events
    ProjectCreated {
        uuid: Uuid,
        title: String,
        project_type: ProjectType,
    },
    ProjectUpdated {
        uuid: Uuid,
        title: String,
    },

    // Role events
    RoleCreated {
        project_uuid: Uuid,
        username: String,
        role: String,
    },
    RoleUpdated {
        project_uuid: Uuid,
        username: String,
        role: String,
    },
    RoleDeleted {
        project_uuid: Uuid,
        username: String,
        role: String,
    },

    // Remote site events
    PeerSiteCreated {
        uuid: Uuid,
        name: String,
    },
    PeerSiteUpdated {
        uuid: Uuid,
        name: String,
    },
    PeerLinkRemoved {
        site_uuid: Uuid,
        project_uuid: Uuid,
    },

    // Setting events
    SettingSet {
        key: String,
        project_uuid: Option<Uuid>,
        user_uuid: Option<Uuid>,
    },

    // Run events
    SnapshotExported {
        site_uuid: Uuid,
        projects: usize,
        users: usize,
    },
    SyncCompleted {
        site_uuid: Uuid,
        summary: String,
        errors: usize,
    },
    LevelChanged {
        site_uuid: Uuid,
        project_uuid: Uuid,
        level: AccessLevel,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    /// Handle an event
    fn on_event(&self, event: &SyncEvent);
}

/// Event bus for broadcasting sync events
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: SyncEvent) {
        trace!(event = ?event, "Emitting sync event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Emit a batch collected during a transaction
    pub fn emit_all(&self, events: impl IntoIterator<Item = SyncEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::ProjectCreated { uuid, title, project_type } => {
                debug!(uuid = %uuid, title = %title, project_type = %project_type, "Project created");
            }
            SyncEvent::RoleCreated { project_uuid, username, role }
            | SyncEvent::RoleUpdated { project_uuid, username, role } => {
                debug!(project = %project_uuid, user = %username, role = %role, "Role set");
            }
            SyncEvent::RoleDeleted { project_uuid, username, role } => {
                debug!(project = %project_uuid, user = %username, role = %role, "Role deleted");
            }
            SyncEvent::PeerLinkRemoved { site_uuid, project_uuid } => {
                debug!(site = %site_uuid, project = %project_uuid, "Peer link removed");
            }
            SyncEvent::SyncCompleted { site_uuid, summary, errors } => {
                info!(site = %site_uuid, errors = errors, "Sync completed: {}", summary);
            }
            _ => {
                trace!(event = ?event, "Sync event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
