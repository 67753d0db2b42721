//! In-Memory Document Store Implementation
//!
//! This implementation keeps the session container in memory behind
//! Arc<RwLock<>>. Suitable for:
//! - Development and testing
//! - Exercising the full lock + content protocol without a live account
//!
//! It reproduces the store semantics the protocol relies on: server-assigned
//! ETags, TTL expiry counted from the last write, primary-key uniqueness on
//! insert, and an atomic check-absence-then-insert for the try-lock path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::config::ConsistencyLevel;
use crate::document::{ContentDocument, LockDocument};
use crate::traits::{
    DeleteOutcome, DocumentStore, InsertLockOutcome, ReplaceOutcome, SessionStoreError,
    StoreResult, TryLockReply,
};

#[derive(Debug, Clone)]
struct MemoryDoc {
    body: Value,
    etag: String,
    expires_at: DateTime<Utc>,
}

impl MemoryDoc {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// In-memory session container
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    docs: Arc<RwLock<HashMap<String, MemoryDoc>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) documents, for tests and diagnostics.
    pub async fn document_count(&self) -> usize {
        let now = Utc::now();
        let docs = self.docs.read().await;
        docs.values().filter(|doc| doc.is_live(now)).count()
    }

    fn fresh_etag() -> String {
        format!("\"{}\"", Uuid::new_v4())
    }

    fn stored(body: Value, created: DateTime<Utc>, ttl_secs: i64) -> MemoryDoc {
        MemoryDoc {
            body,
            etag: Self::fresh_etag(),
            expires_at: created + ChronoDuration::seconds(ttl_secs),
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn backend_name(&self) -> &'static str {
        "InMemory"
    }

    async fn bootstrap(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn read_content(&self, id: &str) -> StoreResult<Option<ContentDocument>> {
        let now = Utc::now();
        let docs = self.docs.read().await;
        let entry = match docs.get(id) {
            Some(doc) if doc.is_live(now) => doc,
            _ => return Ok(None),
        };
        let mut content: ContentDocument = serde_json::from_value(entry.body.clone())?;
        content.etag = Some(entry.etag.clone());
        Ok(Some(content))
    }

    async fn upsert_content(&self, doc: &ContentDocument) -> StoreResult<()> {
        let body = serde_json::to_value(doc)?;
        let mut docs = self.docs.write().await;
        docs.insert(
            doc.id.clone(),
            Self::stored(body, doc.created_date, doc.ttl),
        );
        Ok(())
    }

    async fn replace_content_if_match(
        &self,
        etag: &str,
        doc: &ContentDocument,
        _consistency: ConsistencyLevel,
    ) -> StoreResult<ReplaceOutcome> {
        let now = Utc::now();
        let mut docs = self.docs.write().await;
        let current = match docs.get(&doc.id) {
            Some(entry) if entry.is_live(now) => entry,
            _ => return Ok(ReplaceOutcome::Missing),
        };
        if current.etag != etag {
            return Ok(ReplaceOutcome::EtagMismatch);
        }
        let body = serde_json::to_value(doc)?;
        docs.insert(
            doc.id.clone(),
            Self::stored(body, doc.created_date, doc.ttl),
        );
        Ok(ReplaceOutcome::Replaced)
    }

    async fn insert_lock(&self, doc: &LockDocument) -> StoreResult<InsertLockOutcome> {
        let now = Utc::now();
        let mut docs = self.docs.write().await;
        if let Some(existing) = docs.get(&doc.id) {
            if existing.is_live(now) {
                return Ok(InsertLockOutcome::Held);
            }
        }
        let body = serde_json::to_value(doc)?;
        let stored = Self::stored(body, doc.created_date, doc.ttl);
        let etag = stored.etag.clone();
        docs.insert(doc.id.clone(), stored);
        debug!(lock_id = %doc.id, "lock record created");
        Ok(InsertLockOutcome::Created {
            etag,
            created_date: doc.created_date,
        })
    }

    async fn try_lock(
        &self,
        lock_id: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> StoreResult<TryLockReply> {
        // One write-lock critical section: the check and the insert are
        // atomic, matching the stored procedure's serializable transaction.
        let mut docs = self.docs.write().await;
        if let Some(existing) = docs.get(lock_id) {
            if existing.is_live(Utc::now()) {
                let created_date: DateTime<Utc> =
                    serde_json::from_value(existing.body["CreatedDate"].clone())
                        .map_err(SessionStoreError::Serialization)?;
                return Ok(TryLockReply {
                    locked: false,
                    etag: existing.etag.clone(),
                    created_date,
                });
            }
        }
        let doc = LockDocument {
            id: lock_id.to_string(),
            ttl: ttl_secs,
            created_date: now,
            etag: None,
        };
        let body = serde_json::to_value(&doc)?;
        let stored = Self::stored(body, now, ttl_secs);
        let etag = stored.etag.clone();
        docs.insert(lock_id.to_string(), stored);
        Ok(TryLockReply {
            locked: true,
            etag,
            created_date: now,
        })
    }

    async fn delete_document(
        &self,
        id: &str,
        if_match: Option<&str>,
    ) -> StoreResult<DeleteOutcome> {
        let now = Utc::now();
        let mut docs = self.docs.write().await;
        let current = match docs.get(id) {
            Some(entry) if entry.is_live(now) => entry,
            _ => return Ok(DeleteOutcome::NotFound),
        };
        if let Some(expected) = if_match {
            if current.etag != expected {
                return Ok(DeleteOutcome::EtagMismatch);
            }
        }
        docs.remove(id);
        Ok(DeleteOutcome::Deleted)
    }
}
