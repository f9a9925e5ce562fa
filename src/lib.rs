//! # git-lfs-server
//!
//! A Git LFS server in pure Rust.
//!
//! This crate provides:
//! - Content-addressed object storage with SHA256 verification
//! - An object index reconciled lazily against the store
//! - Batch API negotiation with short-lived transfer actions
//! - Upload and download endpoints bound to those actions
//! - An axum HTTP surface with the legacy v1 object API alongside batch
//!
//! ## Example
//!
//! ```no_run
//! use git_lfs_server::{LfsServer, ServerConfig};
//!
//! # async fn run() -> git_lfs_server::Result<()> {
//! let config = ServerConfig::load("lfs-server.toml")?;
//! LfsServer::new(config)?.serve().await
//! # }
//! ```

mod action;
mod batch;
mod config;
mod error;
mod gate;
mod index;
mod negotiator;
mod oid;
mod repo;
mod server;
mod store;
mod transfer;

pub use action::{ActionGrant, ActionRegistry, TransferAction, ACTION_AUTH_SCHEME, ACTION_HEADER};
pub use batch::{
    Action, BatchError, BatchObject, BatchRequest, BatchRequestObject, BatchResponse,
    ErrorResponse, LegacyObject, ObjectLinks, Operation, LFS_MEDIA_TYPE,
};
pub use config::ServerConfig;
pub use error::{Error, ErrorKind, Result};
pub use gate::{AccessGate, AllowAll, AnonymousPolicy, Principal};
pub use index::{IndexEntry, ObjectIndex, ObjectState};
pub use negotiator::{Limits, NegotiatedObject, Negotiator, ObjectOutcome};
pub use oid::{Oid, OidHasher};
pub use repo::{Projects, RepoContext};
pub use server::{build_router, principal_from_headers, AppState, LfsServer, FORWARDED_USER_HEADER};
pub use store::{ContentStore, PutOutcome, StagedObject};
pub use transfer::{TransferEndpoint, Upload};
