//! Content record operations and the sliding-expiration policy.
//!
//! Reads stash the raw resource into a caller-owned [`RequestScope`] so that
//! the lifetime-extension decision can run at request end without re-reading
//! the record and without any shared mutable state between the two call
//! sites.
//!
//! The dampening rule keeps extension cheap: a replace is issued only once
//! the record has consumed at least two-thirds of its TTL, so steady
//! read-only traffic refreshes a session a couple of times per timeout
//! period instead of on every request.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::codec::{RecordCodec, SessionState};
use crate::config::ConsistencyLevel;
use crate::document::{lock_id, ContentDocument};
use crate::traits::{DeleteOutcome, DocumentStore, ReplaceOutcome, StoreResult};

/// Per-request state owned by the facade caller.
///
/// Allocated at request start, carried to request end; never shared between
/// concurrent requests.
#[derive(Default)]
pub struct RequestScope {
    stashed: Option<ContentDocument>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the last read found a content record at all.
    pub fn has_read_record(&self) -> bool {
        self.stashed.is_some()
    }

    fn stash(&mut self, doc: ContentDocument) {
        self.stashed = Some(doc);
    }
}

/// Read/write/remove of content records plus lifetime extension.
#[derive(Clone)]
pub struct ContentStore {
    store: Arc<dyn DocumentStore>,
    codec: RecordCodec,
    compression_enabled: bool,
}

impl ContentStore {
    pub fn new(store: Arc<dyn DocumentStore>, codec: RecordCodec, compression_enabled: bool) -> Self {
        Self {
            store,
            codec,
            compression_enabled,
        }
    }

    /// Point-read of a session. Returns `(None, false)` when the record does
    /// not exist; otherwise the decoded value (which is itself `None` for an
    /// unpopulated session) and the new-session marker. The raw resource is
    /// stashed into `scope` for a possible later [`extend_lifetime`].
    ///
    /// [`extend_lifetime`]: ContentStore::extend_lifetime
    pub async fn get_session(
        &self,
        session_id: &str,
        scope: &mut RequestScope,
    ) -> StoreResult<(Option<SessionState>, bool)> {
        let doc = match self.store.read_content(session_id).await? {
            Some(doc) => doc,
            None => {
                debug!(session_id, "session record not found");
                return Ok((None, false));
            }
        };

        let is_new = doc.is_new_session();
        let state = match &doc.payload {
            Some(bytes) => Some(self.codec.decode(bytes, doc.compressed)?),
            None => None,
        };
        scope.stash(doc);
        Ok((state, is_new))
    }

    /// Upsert the session's content record, stamping `CreatedDate` now and
    /// deriving the record TTL from the value's timeout.
    pub async fn write_contents(
        &self,
        session_id: &str,
        state: &SessionState,
        is_new: bool,
    ) -> StoreResult<()> {
        let payload = self.codec.encode(state, self.compression_enabled)?;
        let doc = ContentDocument::new(
            session_id,
            state.ttl_secs(),
            Some(payload),
            self.compression_enabled,
            is_new,
        );
        self.store.upsert_content(&doc).await
    }

    /// Delete the content and lock records independently; a missing record
    /// on either side is tolerated.
    pub async fn remove(&self, session_id: &str) -> StoreResult<()> {
        if let DeleteOutcome::NotFound = self.store.delete_document(session_id, None).await? {
            error!(session_id, "content record missing on remove");
        }
        let lock = lock_id(session_id);
        if let DeleteOutcome::NotFound = self.store.delete_document(&lock, None).await? {
            error!(session_id, "lock record missing on remove");
        }
        Ok(())
    }

    /// Sliding-expiration write, dampened.
    ///
    /// No-op unless the stashed record has consumed at least two-thirds of
    /// its TTL (equivalently, less than one-third of the lifetime remains).
    /// The replace is conditional on the stashed ETag and deliberately runs
    /// at eventual consistency: front-ends racing to extend the same session
    /// all write equivalent values, so the last writer winning is fine.
    pub async fn extend_lifetime(
        &self,
        session_id: &str,
        scope: &RequestScope,
    ) -> StoreResult<()> {
        let stashed = match &scope.stashed {
            Some(doc) => doc,
            None => return Ok(()),
        };
        let etag = match &stashed.etag {
            Some(etag) => etag.clone(),
            None => return Ok(()),
        };

        let elapsed = (Utc::now() - stashed.created_date).num_seconds();
        let remaining = stashed.ttl - elapsed;
        if 3 * remaining >= stashed.ttl {
            return Ok(());
        }

        let mut replacement = stashed.clone();
        replacement.created_date = Utc::now();
        replacement.etag = None;

        match self
            .store
            .replace_content_if_match(&etag, &replacement, ConsistencyLevel::Eventual)
            .await?
        {
            ReplaceOutcome::Replaced => {
                debug!(session_id, "session lifetime extended");
            }
            ReplaceOutcome::Missing => {
                warn!(session_id, "session vanished before lifetime extension");
            }
            ReplaceOutcome::EtagMismatch => {
                debug!(session_id, "lifetime already extended by another front-end");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use crate::codec::SessionItems;
    use crate::document::LockDocument;
    use crate::in_memory::InMemoryDocumentStore;

    fn content_store(store: Arc<InMemoryDocumentStore>) -> ContentStore {
        ContentStore::new(store, RecordCodec::new(), true)
    }

    fn sample_state(timeout_minutes: i32) -> SessionState {
        let mut items = SessionItems::new();
        items.set("theme", json!("dark"));
        SessionState {
            timeout_minutes,
            items,
            static_objects: SessionItems::new(),
        }
    }

    #[tokio::test]
    async fn missing_session_reads_as_none() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let contents = content_store(store);
        let mut scope = RequestScope::new();
        let (state, is_new) = contents.get_session("s1", &mut scope).await.unwrap();
        assert!(state.is_none());
        assert!(!is_new);
        assert!(!scope.has_read_record());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let contents = content_store(store);
        let state = sample_state(20);

        contents.write_contents("s1", &state, true).await.unwrap();

        let mut scope = RequestScope::new();
        let (read, is_new) = contents.get_session("s1", &mut scope).await.unwrap();
        assert_eq!(read, Some(state));
        assert!(is_new);
        assert!(scope.has_read_record());
    }

    #[tokio::test]
    async fn rewrite_clears_new_marker() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let contents = content_store(store);
        contents
            .write_contents("s1", &sample_state(20), true)
            .await
            .unwrap();
        contents
            .write_contents("s1", &sample_state(20), false)
            .await
            .unwrap();

        let mut scope = RequestScope::new();
        let (_, is_new) = contents.get_session("s1", &mut scope).await.unwrap();
        assert!(!is_new);
    }

    #[tokio::test]
    async fn remove_deletes_both_records() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let contents = content_store(store.clone());
        contents
            .write_contents("s1", &sample_state(20), false)
            .await
            .unwrap();
        store
            .insert_lock(&LockDocument::for_session("s1", 30))
            .await
            .unwrap();
        assert_eq!(store.document_count().await, 2);

        contents.remove("s1").await.unwrap();
        assert_eq!(store.document_count().await, 0);

        // A second remove only hits the tolerated not-found paths.
        contents.remove("s1").await.unwrap();
    }

    #[tokio::test]
    async fn young_record_is_not_extended() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let contents = content_store(store);
        contents
            .write_contents("s1", &sample_state(1), false)
            .await
            .unwrap();

        let mut scope = RequestScope::new();
        contents.get_session("s1", &mut scope).await.unwrap();
        let written = scope.stashed.as_ref().unwrap().created_date;

        // 20 of 60 seconds consumed: two-thirds not yet reached.
        scope.stashed.as_mut().unwrap().created_date =
            Utc::now() - ChronoDuration::seconds(20);
        contents.extend_lifetime("s1", &scope).await.unwrap();

        let mut check = RequestScope::new();
        contents.get_session("s1", &mut check).await.unwrap();
        assert_eq!(check.stashed.unwrap().created_date, written);
    }

    #[tokio::test]
    async fn old_record_is_extended() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let contents = content_store(store);
        let state = sample_state(1);
        contents.write_contents("s1", &state, false).await.unwrap();

        let mut scope = RequestScope::new();
        contents.get_session("s1", &mut scope).await.unwrap();

        // 41 of 60 seconds consumed: less than one-third remains.
        let aged = Utc::now() - ChronoDuration::seconds(41);
        scope.stashed.as_mut().unwrap().created_date = aged;
        contents.extend_lifetime("s1", &scope).await.unwrap();

        let mut check = RequestScope::new();
        let (read, _) = contents.get_session("s1", &mut check).await.unwrap();
        assert!(check.stashed.as_ref().unwrap().created_date > aged);
        // Extension must not disturb the payload.
        assert_eq!(read, Some(state));
    }

    #[tokio::test]
    async fn stale_etag_extension_is_swallowed() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let contents = content_store(store);
        contents
            .write_contents("s1", &sample_state(1), false)
            .await
            .unwrap();

        let mut scope = RequestScope::new();
        contents.get_session("s1", &mut scope).await.unwrap();

        // Another writer replaces the record, rotating the ETag.
        contents
            .write_contents("s1", &sample_state(1), false)
            .await
            .unwrap();

        scope.stashed.as_mut().unwrap().created_date =
            Utc::now() - ChronoDuration::seconds(41);
        contents.extend_lifetime("s1", &scope).await.unwrap();
    }

    #[tokio::test]
    async fn vanished_record_extension_is_swallowed() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let contents = content_store(store.clone());
        contents
            .write_contents("s1", &sample_state(1), false)
            .await
            .unwrap();

        let mut scope = RequestScope::new();
        contents.get_session("s1", &mut scope).await.unwrap();
        store.delete_document("s1", None).await.unwrap();

        scope.stashed.as_mut().unwrap().created_date =
            Utc::now() - ChronoDuration::seconds(41);
        contents.extend_lifetime("s1", &scope).await.unwrap();
    }

    #[tokio::test]
    async fn extension_without_a_read_is_a_no_op() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let contents = content_store(store);
        let scope = RequestScope::new();
        contents.extend_lifetime("s1", &scope).await.unwrap();
    }
}
