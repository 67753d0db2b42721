//! # Distributed Session State over Cosmos DB
//!
//! **Shared user sessions for multi-process web front-ends, backed by a
//! strongly-consistent document database.**
//!
//! Front-end processes acquire exclusive access to a session while mutating
//! it, read concurrently without mutual exclusion otherwise, persist opaque
//! gzip-compressed blobs, and let idle sessions expire through server-side
//! TTL. There is no sweeper process, and no session is permanently orphaned
//! by a crashed holder.
//!
//! ## Installation
//!
//! ```toml
//! [dependencies]
//! cosmos-session-store = "0.2"
//! ```
//!
//! ## Design
//!
//! Both record kinds (the session content and a presence-only lock record)
//! live in one container partitioned on `/id`. Locks are taken with an
//! optimistic insert, falling back to a server-side stored procedure that
//! arbitrates races atomically within the partition; they are released with
//! an ETag-conditional delete and healed by TTL when a holder dies. Content
//! reads stash the raw resource per request so a dampened sliding-expiration
//! replace can run at request end.
//!
//! The [`DocumentStore`] trait keeps the protocol testable: the
//! [`in_memory::InMemoryDocumentStore`] backend reproduces ETag, TTL and
//! insert-uniqueness semantics so the whole lock and content flow runs
//! without a live account.

mod cancellation;
mod codec;
mod config;
mod document;
mod lock;
mod provider;
mod session;
mod traits;

/// Core document-store trait and shared types for pluggable backends
pub use traits::{
    DeleteOutcome, DocumentStore, InsertLockOutcome, ReplaceOutcome, SessionStoreError,
    SharedDocumentStore, StoreResult, TryLockReply,
};

pub mod cosmos;
pub mod in_memory;
pub mod prelude;

pub use cancellation::CancellationHandle;
pub use codec::{
    CodecError, JsonPayloadCodec, PayloadCodec, RecordCodec, SessionItems, SessionState,
};
pub use config::{ConsistencyLevel, ProviderConfig, CONTAINER_ID, DEFAULT_LOCK_TTL};
pub use cosmos::CosmosDocumentStore;
pub use document::{lock_id, ContentDocument, LockDocument, IS_NEW_MARKER, LOCK_ID_SUFFIX};
pub use in_memory::InMemoryDocumentStore;
pub use lock::{LockManager, LockOutcome, LockToken};
pub use provider::{ExclusiveGet, SessionStateProvider, MAX_SESSION_ID_LENGTH};
pub use session::{ContentStore, RequestScope};

/// Create an in-memory provider for development and testing.
pub async fn create_memory_provider(config: &ProviderConfig) -> StoreResult<SessionStateProvider> {
    let store = std::sync::Arc::new(InMemoryDocumentStore::new());
    SessionStateProvider::with_store(store, config).await
}

/// Open (or join) a named provider over Cosmos DB.
pub async fn create_cosmos_provider(
    name: &str,
    config: ProviderConfig,
) -> StoreResult<SessionStateProvider> {
    SessionStateProvider::open(name, config).await
}
