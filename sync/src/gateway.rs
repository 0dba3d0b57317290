//! The remote gateway contract.
//!
//! The hosted backend is an external collaborator; this module pins down the
//! capabilities the engine needs (upsert, delete, point read, range read,
//! change feed) and classifies its failures into a closed set once, at the
//! boundary. Downstream code switches on [`GatewayError`] variants and never
//! inspects raw error codes.

use async_trait::async_trait;
use serde_json::Value;
use tempo_store::FieldMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Remote error code for a point read that matched no row.
pub const CODE_NOT_FOUND: &str = "PGRST116";
/// Remote error code for a row-level security rejection.
pub const CODE_PERMISSION_DENIED: &str = "42501";
/// Remote error code for a malformed identifier on the wire.
pub const CODE_MALFORMED_IDENTIFIER: &str = "22P02";

/// Failure classes surfaced by the remote gateway.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The referenced row does not exist remotely.
    #[error("row not found")]
    NotFound,

    /// Row-level security refused the operation: the local copy is foreign.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The primary key was rejected as malformed.
    #[error("malformed identifier: {0}")]
    MalformedIdentifier(String),

    /// Network unavailable, timeout, or a retryable server failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Anything else the remote reported.
    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },
}

impl GatewayError {
    /// Whether replaying the operation later can reasonably succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

/// Map a raw remote error code to its failure class. Gateway implementations
/// call this once per response; nothing downstream looks at codes.
pub fn classify_code(code: &str, message: &str) -> GatewayError {
    match code {
        CODE_NOT_FOUND => GatewayError::NotFound,
        CODE_PERMISSION_DENIED => GatewayError::PermissionDenied(message.to_string()),
        CODE_MALFORMED_IDENTIFIER => GatewayError::MalformedIdentifier(message.to_string()),
        _ => GatewayError::Remote {
            code: code.to_string(),
            message: message.to_string(),
        },
    }
}

/// One delta from a table's change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert { new: FieldMap },
    Update { new: FieldMap, old: Option<FieldMap> },
    Delete { old: FieldMap },
}

impl ChangeEvent {
    /// The id of the affected row under the given primary key column.
    pub fn record_id(&self, primary_key: &str) -> Option<String> {
        let fields = match self {
            ChangeEvent::Insert { new } | ChangeEvent::Update { new, .. } => new,
            ChangeEvent::Delete { old } => old,
        };
        match fields.get(primary_key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) if !other.is_null() => Some(other.to_string()),
            _ => None,
        }
    }
}

/// Capabilities the sync engine requires of the hosted backend.
///
/// `user_id`, where given, scopes the call to the active session's rows; the
/// remote additionally enforces row-level security on every operation.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Upsert rows with caller-supplied primary keys and `updated_at`,
    /// optionally against a server-side uniqueness key.
    async fn upsert(
        &self,
        table: &str,
        rows: Vec<FieldMap>,
        on_conflict: Option<&str>,
    ) -> Result<(), GatewayError>;

    /// Delete one row by primary key.
    async fn delete(&self, table: &str, primary_key: &str, id: &str) -> Result<(), GatewayError>;

    /// Point-read a row's `updated_at`. `Ok(None)` when the row is absent;
    /// every other failure propagates as its classified error.
    async fn fetch_updated_at(
        &self,
        table: &str,
        primary_key: &str,
        id: &str,
    ) -> Result<Option<String>, GatewayError>;

    /// Read every row visible to the caller, newest first, filtered by
    /// `user_id` when given.
    async fn fetch_rows(
        &self,
        table: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<FieldMap>, GatewayError>;

    /// Open the table's change feed, filtered by `user_id` when given.
    /// Deltas arrive in server delivery order.
    async fn subscribe(
        &self,
        table: &str,
        user_id: Option<&str>,
    ) -> Result<mpsc::Receiver<ChangeEvent>, GatewayError>;
}
