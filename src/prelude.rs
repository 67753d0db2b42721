//! # Session Store Prelude
//!
//! Convenient re-exports of the most commonly used types.
//!
//! ```rust
//! use cosmos_session_store::prelude::*;
//! ```

// Core trait and shared types
pub use crate::traits::{
    DeleteOutcome, DocumentStore, InsertLockOutcome, ReplaceOutcome, SessionStoreError,
    SharedDocumentStore, StoreResult, TryLockReply,
};

// Session values and the record codec
pub use crate::codec::{JsonPayloadCodec, PayloadCodec, RecordCodec, SessionItems, SessionState};

// Document schema
pub use crate::document::{lock_id, ContentDocument, LockDocument};

// Configuration
pub use crate::config::{ConsistencyLevel, ProviderConfig};

// Lock protocol and provider facade
pub use crate::cancellation::CancellationHandle;
pub use crate::lock::{LockManager, LockOutcome, LockToken};
pub use crate::provider::{ExclusiveGet, SessionStateProvider, MAX_SESSION_ID_LENGTH};
pub use crate::session::{ContentStore, RequestScope};

// Backends
pub use crate::cosmos::CosmosDocumentStore;
pub use crate::in_memory::InMemoryDocumentStore;

// Convenience constructors
pub use crate::{create_cosmos_provider, create_memory_provider};
