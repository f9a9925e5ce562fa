//! LFS Batch API types.
//!
//! The Batch API is used to request upload/download URLs for LFS objects.
//! See: https://github.com/git-lfs/git-lfs/blob/main/docs/api/batch.md

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::action::TransferAction;
use crate::negotiator::{NegotiatedObject, ObjectOutcome};
use crate::{Error, Result};

/// Media type of Batch API requests and responses.
pub const LFS_MEDIA_TYPE: &str = "application/vnd.git-lfs+json";

/// The only transfer adapter this server speaks.
pub const BASIC_TRANSFER: &str = "basic";

/// Operation type for batch requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Download objects from the server.
    Download,
    /// Upload objects to the server.
    Upload,
}

impl Operation {
    /// Parse the wire name of an operation.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "download" => Ok(Operation::Download),
            "upload" => Ok(Operation::Upload),
            other => Err(Error::BadRequest(format!("unsupported operation: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Download => "download",
            Operation::Upload => "upload",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch request from an LFS client.
///
/// `operation` stays a string and `size` stays signed here so that an
/// unknown operation or a negative size is rejected by the negotiator with
/// the right scope instead of failing the whole body at parse time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    /// The operation to perform.
    pub operation: String,
    /// The transfer adapters the client supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfers: Option<Vec<String>>,
    /// Reference information (branch, etc).
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<RefInfo>,
    /// The objects to operate on.
    pub objects: Vec<BatchRequestObject>,
}

/// Reference information for a batch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefInfo {
    /// The reference name (e.g., "refs/heads/main").
    pub name: String,
}

/// An object in a batch request.
///
/// Any JSON value is accepted as an entry. A missing or mistyped `oid` or
/// `size` is kept as [`defect`](Self::defect) so that only this object is
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value")]
pub struct BatchRequestObject {
    /// The SHA256 OID of the object.
    pub oid: String,
    /// The size of the object in bytes.
    pub size: i64,
    #[serde(skip_serializing)]
    defect: Option<String>,
}

impl BatchRequest {
    /// Create a new batch request for downloading objects.
    pub fn download(objects: Vec<BatchRequestObject>) -> Self {
        BatchRequest {
            operation: Operation::Download.as_str().to_string(),
            transfers: Some(vec![BASIC_TRANSFER.to_string()]),
            r#ref: None,
            objects,
        }
    }

    /// Create a new batch request for uploading objects.
    pub fn upload(objects: Vec<BatchRequestObject>) -> Self {
        BatchRequest {
            operation: Operation::Upload.as_str().to_string(),
            transfers: Some(vec![BASIC_TRANSFER.to_string()]),
            r#ref: None,
            objects,
        }
    }

    /// Set the reference for this request.
    pub fn with_ref(mut self, name: &str) -> Self {
        self.r#ref = Some(RefInfo {
            name: name.to_string(),
        });
        self
    }

    /// Whether the client accepts the basic transfer adapter.
    ///
    /// Clients that omit `transfers` are assumed to speak basic.
    pub fn accepts_basic(&self) -> bool {
        match &self.transfers {
            Some(transfers) => transfers.iter().any(|t| t == BASIC_TRANSFER),
            None => true,
        }
    }
}

impl BatchRequestObject {
    /// Create a new batch request object.
    pub fn new(oid: &str, size: i64) -> Self {
        BatchRequestObject {
            oid: oid.to_string(),
            size,
            defect: None,
        }
    }

    /// Why this entry could not be read, if it could not.
    pub fn defect(&self) -> Option<&str> {
        self.defect.as_deref()
    }
}

impl From<Value> for BatchRequestObject {
    fn from(entry: Value) -> Self {
        let fields = match entry {
            Value::Object(fields) => fields,
            other => {
                return BatchRequestObject {
                    oid: String::new(),
                    size: 0,
                    defect: Some(format!("object entry must be a JSON object, got {}", other)),
                }
            }
        };

        let mut defects = Vec::new();
        let oid = match fields.get("oid") {
            Some(Value::String(oid)) => oid.clone(),
            Some(other) => {
                defects.push("oid must be a string");
                other.to_string()
            }
            None => {
                defects.push("missing oid");
                String::new()
            }
        };
        let size = match fields.get("size") {
            Some(Value::Number(n)) => match n.as_i64() {
                Some(size) => size,
                None if n.is_u64() => {
                    defects.push("size out of range");
                    0
                }
                None => {
                    defects.push("size must be an integer");
                    0
                }
            },
            Some(_) => {
                defects.push("size must be an integer");
                0
            }
            None => {
                defects.push("missing size");
                0
            }
        };

        BatchRequestObject {
            oid,
            size,
            defect: (!defects.is_empty()).then(|| defects.join(", ")),
        }
    }
}

/// A batch response to an LFS client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    /// The transfer adapter to use (always "basic").
    pub transfer: String,
    /// The objects with their actions, in request order.
    pub objects: Vec<BatchObject>,
}

impl BatchResponse {
    pub fn new(objects: Vec<BatchObject>) -> Self {
        BatchResponse {
            transfer: BASIC_TRANSFER.to_string(),
            objects,
        }
    }
}

/// An object in a batch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchObject {
    /// The SHA256 OID of the object.
    pub oid: String,
    /// The size of the object in bytes.
    pub size: i64,
    /// Whether the actions already carry the required authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    /// Actions available for this object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<BTreeMap<String, Action>>,
    /// Error information if the object failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchError>,
}

/// An action (upload/download URL) for an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// The URL for the action.
    pub href: String,
    /// HTTP headers to include in the request.
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    /// Seconds until the action expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    /// Absolute expiration time (ISO 8601).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Error information for a batch object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchError {
    /// HTTP status code.
    pub code: u16,
    /// Error message.
    pub message: String,
}

impl BatchObject {
    /// Get the download action if available.
    pub fn download_action(&self) -> Option<&Action> {
        self.actions.as_ref()?.get(Operation::Download.as_str())
    }

    /// Get the upload action if available.
    pub fn upload_action(&self) -> Option<&Action> {
        self.actions.as_ref()?.get(Operation::Upload.as_str())
    }

    /// Check if this object has an error.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

impl From<&TransferAction> for Action {
    fn from(action: &TransferAction) -> Self {
        Action {
            href: action.href.to_string(),
            header: action.header.clone(),
            expires_in: Some(action.expires_in()),
            expires_at: Some(action.expires_at),
        }
    }
}

impl From<NegotiatedObject> for BatchObject {
    fn from(negotiated: NegotiatedObject) -> Self {
        let NegotiatedObject { oid, size, outcome } = negotiated;
        let mut object = BatchObject {
            oid,
            size,
            authenticated: None,
            actions: None,
            error: None,
        };
        match outcome {
            ObjectOutcome::Present => {}
            ObjectOutcome::Action(action) => {
                let mut actions = BTreeMap::new();
                actions.insert(action.operation.as_str().to_string(), Action::from(&action));
                object.authenticated = Some(true);
                object.actions = Some(actions);
            }
            ObjectOutcome::Error(err) => {
                object.error = Some(BatchError {
                    code: err.object_code(),
                    message: err.to_string(),
                });
            }
        }
        object
    }
}

/// Hypermedia links of the legacy (v1) object API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectLinks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<Action>,
}

/// Object description of the legacy (v1) object API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyObject {
    pub oid: String,
    pub size: i64,
    #[serde(rename = "_links", default, skip_serializing_if = "Option::is_none")]
    pub links: Option<ObjectLinks>,
}

/// JSON error body for whole-request failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}
