//! HTTP client for pulling snapshots from a source site

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::access::SiteMode;
use crate::db::RemoteSiteRow;
use crate::error::{Result, SyncError};
use crate::sync::Snapshot;

/// Path prefix of the snapshot endpoint; the shared secret follows it
pub const SYNC_PATH: &str = "/remote/sync";

/// HTTP client for the remote sync API
///
/// # Example
///
/// ```rust,no_run
/// use projectroles_sync::client::SourceClient;
/// use projectroles_sync::access::SiteMode;
/// use projectroles_sync::db::RemoteSiteRow;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = SourceClient::new(60)?;
/// let source = RemoteSiteRow::new("Source", "https://source.example", SiteMode::Source)
///     .with_secret("s3cret");
/// let snapshot = client.fetch_snapshot(&source).await?;
/// println!("{} projects", snapshot.projects.len());
/// # Ok(())
/// # }
/// ```
pub struct SourceClient {
    client: Client,
}

impl SourceClient {
    /// Create a client with the given request timeout
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self { client })
    }

    /// URL of the snapshot endpoint of a source site
    pub fn snapshot_url(site: &RemoteSiteRow, secret: &str) -> String {
        format!("{}{}/{}", site.url.trim_end_matches('/'), SYNC_PATH, secret)
    }

    /// GET the snapshot a SOURCE site exports for us
    pub async fn fetch_snapshot(&self, site: &RemoteSiteRow) -> Result<Snapshot> {
        if site.mode != SiteMode::Source {
            return Err(SyncError::InvalidSiteMode {
                site: site.uuid,
                mode: site.mode.to_string(),
                expected: SiteMode::Source.to_string(),
            });
        }
        let secret = site
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::Config(format!("Site {} has no secret", site.uuid)))?;

        debug!(site = %site.name, url = %site.url, "Fetching snapshot");
        let response = self.client.get(Self::snapshot_url(site, secret)).send().await?;
        self.handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthorized);
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Server {
                status,
                message: body,
            });
        }

        let body = response.json().await?;
        Ok(body)
    }
}
