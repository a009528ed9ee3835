//! Projectroles Sync Daemon
//!
//! Serves snapshots to target sites and pulls snapshots from a source site.
//!
//! ## Usage
//!
//! ```bash
//! # Register a target site and serve snapshots to it
//! projectroles-sync add-site --name "Target" --url https://target.example --mode target
//! projectroles-sync link --site <site-uuid> --project <project-uuid> --level READ_ROLES
//! projectroles-sync serve --http-port 8000
//!
//! # On the target: register the source and pull from it
//! projectroles-sync add-site --name "Source" --url https://source.example --mode source --secret <secret>
//! projectroles-sync sync --site <site-uuid>
//!
//! # Inspect what a target would receive
//! projectroles-sync export --site <site-uuid>
//! ```
//!
//! ## HTTP API
//!
//! - `GET /health` - Health check
//! - `GET /remote/sync/{secret}` - Snapshot for a target site

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use projectroles_sync::access::{AccessLevel, SiteMode};
use projectroles_sync::client::SourceClient;
use projectroles_sync::db::remote;
use projectroles_sync::db::{RemoteSiteRow, SyncDb};
use projectroles_sync::events::{spawn_logging_listener, EventBus};
use projectroles_sync::sync::error_messages;
use projectroles_sync::{Config, HttpServer, PluginRegistry, SyncEngine};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "projectroles-sync")]
#[command(about = "Remote project synchronization between project management sites")]
struct Args {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, global = true, env = "PROJECTROLES_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Owner of last resort for roles that cannot be honored
    #[arg(long, global = true, env = "PROJECTROLES_DEFAULT_OWNER")]
    default_owner: Option<String>,

    /// Accept remote roles for existing local (non-directory) accounts
    #[arg(long, global = true, env = "PROJECTROLES_ALLOW_LOCAL_USERS")]
    allow_local_users: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve snapshots to target sites over HTTP
    Serve {
        /// HTTP API port
        #[arg(long, env = "PROJECTROLES_HTTP_PORT")]
        http_port: Option<u16>,
    },

    /// Pull a snapshot from a source site and reconcile it
    Sync {
        /// UUID of the SOURCE site
        #[arg(long)]
        site: Uuid,

        /// Print the annotated snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the snapshot a target site would receive
    Export {
        /// UUID of the TARGET site
        #[arg(long)]
        site: Uuid,
    },

    /// Register a remote site
    AddSite {
        #[arg(long)]
        name: String,

        #[arg(long)]
        url: String,

        /// source, target or peer
        #[arg(long)]
        mode: String,

        /// Shared secret; generated for target sites when omitted
        #[arg(long)]
        secret: Option<String>,

        #[arg(long, default_value = "")]
        description: String,

        /// Hide usernames of this site from regular users
        #[arg(long)]
        hide_users: bool,
    },

    /// Set the access level of a project for a remote site
    Link {
        #[arg(long)]
        site: Uuid,

        #[arg(long)]
        project: Uuid,

        /// NONE, VIEW_AVAILABILITY, READ_INFO, READ_ROLES or REVOKED
        #[arg(long)]
        level: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("projectroles_sync=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let db = Arc::new(SyncDb::open(&config.db_path()).context("Failed to open database")?);
    let registry = Arc::new(PluginRegistry::default());
    let events = Arc::new(EventBus::new());
    let engine = Arc::new(
        SyncEngine::new(db.clone(), registry, config.sync.clone()).with_event_bus(events.clone()),
    );

    match args.command {
        Command::Serve { http_port } => {
            let port = http_port.unwrap_or(config.http_port);
            serve(engine, events, port).await?;
        }

        Command::Sync { site, json } => {
            let _listener = spawn_logging_listener(events);
            let client = SourceClient::new(config.http_timeout_secs)?;
            let outcome = engine.pull(&client, site).await?;

            for message in error_messages(&outcome.snapshot) {
                warn!("{}", message);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.snapshot)?);
            } else {
                println!("{}", outcome.report);
            }
        }

        Command::Export { site } => {
            let snapshot = engine.export(site)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }

        Command::AddSite {
            name,
            url,
            mode,
            secret,
            description,
            hide_users,
        } => {
            let mode: SiteMode = mode.to_uppercase().parse()?;
            let secret = match (mode, secret) {
                (SiteMode::Peer, Some(_)) => bail!("Peer sites never store a secret"),
                (SiteMode::Peer, None) => None,
                (_, Some(secret)) => Some(secret),
                (SiteMode::Target, None) => Some(Uuid::new_v4().simple().to_string()),
                (SiteMode::Source, None) => bail!("A source site needs the secret it issued to us"),
            };

            let mut site = RemoteSiteRow::new(name, url, mode);
            site.description = description;
            site.user_display = !hide_users;
            site.secret = secret;
            db.with_conn(|conn| remote::insert_site(conn, &site))?;

            info!(site = %site.name, mode = %site.mode, "Remote site added");
            println!("{}", site.uuid);
            if mode == SiteMode::Target {
                if let Some(secret) = &site.secret {
                    println!("secret: {}", secret);
                }
            }
        }

        Command::Link { site, project, level } => {
            let level: AccessLevel = level.to_uppercase().parse()?;
            let change = engine.set_level(site, project, level)?;
            info!(site = %site, project = %project, level = %level, change = ?change, "Remote project linked");
        }
    }

    Ok(())
}

/// Config from `--config`, the storage dir or defaults, with CLI overrides
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?
    } else {
        let mut defaults = Config::default();
        if let Some(dir) = &args.storage_dir {
            defaults.storage_dir = dir.clone();
        }
        let default_path = defaults.config_path();
        if default_path.exists() {
            Config::load(&default_path)?
        } else {
            defaults
        }
    };

    // Apply CLI overrides
    if let Some(dir) = &args.storage_dir {
        config.storage_dir = dir.clone();
    }
    if let Some(owner) = &args.default_owner {
        config.sync.default_owner = owner.clone();
    }
    if args.allow_local_users {
        config.sync.allow_local_users = true;
    }

    // Ensure storage directory exists
    std::fs::create_dir_all(&config.storage_dir)?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    Ok(config)
}

async fn serve(engine: Arc<SyncEngine>, events: Arc<EventBus>, port: u16) -> anyhow::Result<()> {
    let _listener = spawn_logging_listener(events);

    let http_addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    let http_server = Arc::new(HttpServer::new(engine.clone(), http_addr));

    info!("HTTP API available at http://{}", http_addr);
    info!("Endpoints:");
    info!("  GET  /health                - Health check");
    info!("  GET  /remote/sync/{{secret}}  - Snapshot for a target site");
    info!("Press Ctrl+C to stop.");

    // Handle shutdown signal
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    if let Ok(stats) = engine.db().stats() {
        info!(
            projects = stats.project_count,
            remote_sites = stats.remote_site_count,
            "Final store stats"
        );
    }

    Ok(())
}
