//! HTTP surface: routes, status mapping and the LFS media type.
//!
//! | Route | |
//! |---|---|
//! | `POST /{repo}/info/lfs/objects/batch` | batch negotiation |
//! | `PUT  /{repo}/lfs/objects/{oid}` | upload bound to an action |
//! | `GET  /{repo}/lfs/objects/{oid}` | download bound to an action |
//! | `POST /{repo}/info/lfs/objects` | legacy single-object upload request |
//! | `GET  /{repo}/info/lfs/objects/{oid}` | legacy object description |
//! | `GET  /health` | liveness |

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tower_http::trace::TraceLayer;

use crate::action::ActionRegistry;
use crate::batch::{BatchRequest, BatchRequestObject, ErrorResponse, LegacyObject, ObjectLinks, LFS_MEDIA_TYPE};
use crate::config::ServerConfig;
use crate::gate::{AccessGate, AnonymousPolicy, Principal};
use crate::index::ObjectIndex;
use crate::negotiator::Negotiator;
use crate::repo::Projects;
use crate::store::PutOutcome;
use crate::transfer::{TransferEndpoint, Upload};
use crate::{Action, ContentStore, Error, Result};

/// Header a fronting proxy uses to pass the authenticated user.
pub const FORWARDED_USER_HEADER: &str = "x-forwarded-user";

const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Body chunks buffered ahead of the upload writer.
const UPLOAD_QUEUE: usize = 16;

/// Shared state behind every handler.
pub struct AppState {
    pub negotiator: Negotiator,
    pub transfer: TransferEndpoint,
}

impl AppState {
    /// Wire the negotiator and transfer endpoint to one store, index and
    /// action registry.
    pub fn new(config: &ServerConfig, gate: Arc<dyn AccessGate>) -> Result<Self> {
        let projects = Projects::new(&config.projects_root);
        let store = ContentStore::new();
        let index = Arc::new(ObjectIndex::new());
        let actions = Arc::new(ActionRegistry::new(config.server_url()?, config.action_ttl()?)?);

        let negotiator = Negotiator::new(
            projects.clone(),
            store.clone(),
            Arc::clone(&index),
            Arc::clone(&actions),
            Arc::clone(&gate),
            config.limits(),
        );
        let transfer = TransferEndpoint::new(projects, store, index, actions, gate);
        Ok(AppState {
            negotiator,
            transfer,
        })
    }
}

/// The LFS server: configuration plus the shared state it serves.
pub struct LfsServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl LfsServer {
    /// Build a server whose access gate follows the configured anonymous policy.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let gate = Arc::new(AnonymousPolicy {
            allow_download: config.allow_anonymous_download,
            allow_upload: config.allow_anonymous_upload,
        });
        Self::with_gate(config, gate)
    }

    pub fn with_gate(config: ServerConfig, gate: Arc<dyn AccessGate>) -> Result<Self> {
        let state = Arc::new(AppState::new(&config, gate)?);
        Ok(LfsServer { config, state })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until the process ends.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_on(listener, std::future::pending()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(
            addr = %listener.local_addr()?,
            root = %self.config.projects_root.display(),
            "LFS server listening"
        );
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

/// Build the axum router with all LFS endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/:repo/info/lfs/objects/batch", post(batch))
        .route("/:repo/info/lfs/objects", post(legacy_create))
        .route("/:repo/info/lfs/objects/:oid", get(legacy_describe))
        .route("/:repo/lfs/objects/:oid", get(download).put(upload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(err = %self, "request failed");
        } else {
            tracing::debug!(err = %self, %status, "request refused");
        }
        lfs_json(
            status,
            &ErrorResponse {
                message: self.to_string(),
            },
        )
    }
}

/// Serialize `value` with the LFS media type.
fn lfs_json<T: Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => (
            status,
            [(CONTENT_TYPE, HeaderValue::from_static(LFS_MEDIA_TYPE))],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(%err, "failed to encode response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// The caller as vouched for by the fronting proxy.
///
/// `X-Forwarded-User` wins; otherwise the username of a Basic
/// `Authorization` header; otherwise anonymous.
pub fn principal_from_headers(headers: &HeaderMap) -> Principal {
    let forwarded = headers
        .get(FORWARDED_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(user) = forwarded {
        return Principal::user(user);
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(Principal::from_basic_auth)
        .unwrap_or(Principal::Anonymous)
}

fn action_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

/// Run synchronous store work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(join_error)?
}

fn join_error(err: JoinError) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, err))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn batch(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request: BatchRequest = serde_json::from_slice(&body)?;
    let principal = principal_from_headers(&headers);
    let response =
        blocking(move || state.negotiator.batch(&repo, &request, &principal)).await?;
    Ok(lfs_json(StatusCode::OK, &response))
}

async fn legacy_create(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let requested: BatchRequestObject = serde_json::from_slice(&body)?;
    let principal = principal_from_headers(&headers);
    let (requested, action) = blocking(move || {
        let action = state.negotiator.request_upload(&repo, &requested, &principal)?;
        Ok((requested, action))
    })
    .await?;

    let (status, links) = match action {
        Some(action) => (
            StatusCode::ACCEPTED,
            Some(ObjectLinks {
                upload: Some(Action::from(&action)),
                download: None,
            }),
        ),
        None => (StatusCode::OK, None),
    };
    Ok(lfs_json(
        status,
        &LegacyObject {
            oid: requested.oid,
            size: requested.size,
            links,
        },
    ))
}

async fn legacy_describe(
    State(state): State<Arc<AppState>>,
    Path((repo, oid)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let principal = principal_from_headers(&headers);
    let (size, action, oid) = blocking(move || {
        let (size, action) = state.negotiator.describe(&repo, &oid, &principal)?;
        Ok((size, action, oid))
    })
    .await?;

    let size = i64::try_from(size).map_err(|_| Error::BadRequest("object too large".into()))?;
    Ok(lfs_json(
        StatusCode::OK,
        &LegacyObject {
            oid,
            size,
            links: Some(ObjectLinks {
                upload: None,
                download: Some(Action::from(&action)),
            }),
        },
    ))
}

async fn upload(
    State(state): State<Arc<AppState>>,
    Path((repo, oid)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let header = action_header(&headers).map(str::to_owned);
    let upload =
        blocking(move || state.transfer.begin_upload(&repo, &oid, header.as_deref())).await?;
    receive(upload, body).await?;
    Ok(lfs_json(StatusCode::OK, &serde_json::json!({ "ok": true })))
}

/// Feed the request body to a writer on the blocking pool, then commit.
///
/// A body error is handed to the writer, which then drops the staged data
/// instead of committing it.
async fn receive(mut upload: Upload, body: Body) -> Result<PutOutcome> {
    let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(UPLOAD_QUEUE);
    let writer = tokio::task::spawn_blocking(move || {
        while let Some(chunk) = rx.blocking_recv() {
            upload.write_chunk(&chunk?)?;
        }
        upload.finish()
    });

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e));
        let interrupted = chunk.is_err();
        // A closed channel means the writer already failed; its error is the answer.
        if tx.send(chunk).await.is_err() || interrupted {
            break;
        }
    }
    drop(tx);

    writer.await.map_err(join_error)?
}

async fn download(
    State(state): State<Arc<AppState>>,
    Path((repo, oid)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let header = action_header(&headers).map(str::to_owned);
    let (file, len) =
        blocking(move || state.transfer.download(&repo, &oid, header.as_deref())).await?;

    let file = tokio::fs::File::from_std(file);
    let stream = futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), file)))
    });

    Ok((
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (CONTENT_LENGTH, HeaderValue::from(len)),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
