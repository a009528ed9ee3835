//! HTTP API for snapshot export
//!
//! ## Endpoints
//! - `GET /health` - Liveness and table counts
//! - `GET /remote/sync/{secret}` - Snapshot for the TARGET site owning `secret`
//!
//! A secret matching no TARGET site gets `401` with an empty body.
//!
//! ## Example Usage
//!
//! ```bash
//! curl http://localhost:8000/remote/sync/3f1c9a... > snapshot.json
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::client::SYNC_PATH;
use crate::error::SyncError;
use crate::sync::SyncEngine;

/// HTTP server state
pub struct HttpServer {
    engine: Arc<SyncEngine>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(engine: Arc<SyncEngine>, bind_addr: SocketAddr) -> Self {
        Self { engine, bind_addr }
    }

    /// Bind and run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), SyncError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), SyncError> {
        info!(addr = %listener.local_addr()?, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        // The path carries the secret; never log it
        debug!(method = %method, "Incoming request");

        let sync_prefix = format!("{}/", SYNC_PATH);
        let result = match (method, path.as_str()) {
            // Health check
            (Method::GET, "/health") => self.handle_health().await,

            // Snapshot export
            (Method::GET, p) if p.starts_with(&sync_prefix) => {
                let secret = p
                    .strip_prefix(&sync_prefix)
                    .unwrap_or("")
                    .trim_end_matches('/')
                    .to_string();
                self.handle_sync(secret).await
            }

            // Not found
            _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
        };

        match result {
            Ok(response) => Ok(response),
            Err(SyncError::Unauthorized) => Ok(empty_response(StatusCode::UNAUTHORIZED)),
            Err(e) => {
                error!(error = %e, "Request error");
                Ok(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error: {}", e),
                ))
            }
        }
    }

    /// Health check endpoint
    async fn handle_health(&self) -> Result<Response<Full<Bytes>>, SyncError> {
        let engine = self.engine.clone();
        let stats = tokio::task::spawn_blocking(move || engine.db().stats())
            .await
            .map_err(|e| SyncError::Internal(format!("Task failed: {}", e)))??;

        let body = serde_json::json!({
            "status": "ok",
            "projects": stats.project_count,
            "users": stats.user_count,
            "role_assignments": stats.role_assignment_count,
            "remote_sites": stats.remote_site_count,
            "remote_projects": stats.remote_project_count,
            "app_settings": stats.app_setting_count,
        });

        Ok(json_response(StatusCode::OK, body.to_string()))
    }

    /// GET /remote/sync/{secret} - Export the snapshot for a target site
    async fn handle_sync(&self, secret: String) -> Result<Response<Full<Bytes>>, SyncError> {
        let engine = self.engine.clone();
        let snapshot = tokio::task::spawn_blocking(move || engine.export_for_secret(&secret))
            .await
            .map_err(|e| SyncError::Internal(format!("Task failed: {}", e)))??;

        let body = serde_json::to_vec(&snapshot)?;
        Ok(json_response(StatusCode::OK, body))
    }
}

fn build_response(
    status: StatusCode,
    content_type: Option<&'static str>,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    build_response(status, Some("application/json"), body)
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    build_response(status, Some("text/plain"), body)
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    build_response(status, None, Bytes::new())
}
