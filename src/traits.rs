//! Document Store Trait and Shared Types
//!
//! This module provides the core DocumentStore trait abstraction that enables
//! pluggable backends for the session container:
//! - InMemory: development and testing
//! - Cosmos: production, over the Cosmos DB REST surface
//!
//! Every session operation in the crate is expressed against this trait, so
//! the lock protocol and the content store can be exercised end-to-end
//! without a live account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::codec::CodecError;
use crate::config::ConsistencyLevel;
use crate::document::{ContentDocument, LockDocument};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, SessionStoreError>;

/// Unified error type for all session store backends
#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// A store request completed with a status the protocol does not absorb.
    /// Status and sub-status are preserved so the failure can be reproduced
    /// against the service.
    #[error("{operation} failed with status {status} (sub-status {sub_status}): {message}")]
    Store {
        operation: &'static str,
        status: u16,
        sub_status: u32,
        message: String,
    },

    #[error("transport failure during {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    #[error("rate limited beyond the configured retry budget during {operation}")]
    RateLimited { operation: &'static str },

    #[error("payload codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("document serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl SessionStoreError {
    /// HTTP status carried by a store failure, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            SessionStoreError::Store { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The two statuses the lock script is allowed to retry on:
    /// 400 with sub-status 409 ("Conflicting request") and
    /// 449 with sub-status 0 ("Retry to avoid conflicts").
    pub(crate) fn is_retryable_script_conflict(&self) -> bool {
        matches!(
            self,
            SessionStoreError::Store {
                status: 400,
                sub_status: 409,
                ..
            } | SessionStoreError::Store {
                status: 449,
                sub_status: 0,
                ..
            }
        )
    }
}

/// Outcome of the optimistic lock insert (phase 1 of acquisition).
#[derive(Debug, Clone)]
pub enum InsertLockOutcome {
    /// The lock record did not exist and was created; the returned ETag is
    /// the only credential that may release it.
    Created {
        etag: String,
        created_date: DateTime<Utc>,
    },
    /// Primary-key conflict: another holder got there first.
    Held,
}

/// Reply from the server-side try-lock script (phase 2 of acquisition).
///
/// `locked == true` means the script created the record and `etag` is ours;
/// `locked == false` means a holder exists and `etag`/`created_date` describe
/// it.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TryLockReply {
    pub locked: bool,
    pub etag: String,
    #[serde(rename = "createdDate")]
    pub created_date: DateTime<Utc>,
}

/// Outcome of an ETag-conditional replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced,
    /// The document is gone (deleted or TTL-expired).
    Missing,
    /// Someone else wrote the document since it was read.
    EtagMismatch,
}

/// Outcome of a delete, optionally conditioned on an ETag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    EtagMismatch,
}

/// Core trait for session container backends.
///
/// Both record kinds (content and lock) live in one container partitioned on
/// `/id`; every operation here is a single-partition point operation or a
/// single-partition script execution.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Backend name for logging and diagnostics
    fn backend_name(&self) -> &'static str;

    /// Idempotent creation of everything the backend needs: database,
    /// container with its indexing policy and default TTL, and the
    /// conflict-arbitration script. Pre-existing resources are tolerated.
    async fn bootstrap(&self) -> StoreResult<()>;

    /// Point-read of a content record. `Ok(None)` on not-found.
    async fn read_content(&self, id: &str) -> StoreResult<Option<ContentDocument>>;

    /// Upsert of a content record. The response body is suppressed; the
    /// caller never needs the written document back.
    async fn upsert_content(&self, doc: &ContentDocument) -> StoreResult<()>;

    /// Replace a content record only if its ETag still matches. Used by the
    /// sliding-expiration path, which deliberately runs at the given
    /// (usually weakened) consistency level.
    async fn replace_content_if_match(
        &self,
        etag: &str,
        doc: &ContentDocument,
        consistency: ConsistencyLevel,
    ) -> StoreResult<ReplaceOutcome>;

    /// Optimistic insert of a lock record; primary-key uniqueness arbitrates.
    async fn insert_lock(&self, doc: &LockDocument) -> StoreResult<InsertLockOutcome>;

    /// Execute the check-absence-then-insert script in the lock's partition.
    /// May fail with a retryable script conflict; the lock protocol owns the
    /// retry policy.
    async fn try_lock(
        &self,
        lock_id: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> StoreResult<TryLockReply>;

    /// Delete any document by id, optionally conditioned on an ETag.
    async fn delete_document(&self, id: &str, if_match: Option<&str>)
        -> StoreResult<DeleteOutcome>;
}

/// Type alias for a shared, dynamically-dispatched store
pub type SharedDocumentStore = std::sync::Arc<dyn DocumentStore>;
