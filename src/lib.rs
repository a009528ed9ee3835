//! Projectroles Sync - remote project synchronization between sites
//!
//! A *source* site shares categories, projects, role assignments and app
//! settings with *target* sites, which reconcile the received snapshot into
//! their own store. Third-party *peer* sites are relayed to targets so they
//! know who else sees a project.
//!
//! ## Architecture
//!
//! - **access**: access levels, site modes and the role vocabulary
//! - **db**: SQLite store (projects, users, roles, remote sites, settings)
//! - **plugins**: registry of app plugins and their setting schemas
//! - **sync**: snapshot export, conflict check, reconciliation, report
//! - **http** / **client**: snapshot transport over HTTP
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/projectroles-sync/
//! ├── projectroles.db        # SQLite store
//! └── config.toml            # Configuration
//! ```

// Declared first: provides the `text_enum!` macro
#[macro_use]
pub mod access;

pub mod error;
pub mod config;
pub mod plugins;
pub mod db;
pub mod events;
pub mod sync;
pub mod http;
pub mod client;

// Re-exports
pub use access::{AccessLevel, ProjectType, RoleName, SiteMode};
pub use config::{Config, SyncConfig};
pub use db::SyncDb;
pub use error::SyncError;
pub use events::{EventBus, SyncEvent};
pub use http::HttpServer;
pub use client::SourceClient;
pub use plugins::PluginRegistry;
pub use sync::{Snapshot, SyncEngine, SyncOutcome, SyncReport};
