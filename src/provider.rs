//! Provider facade.
//!
//! Translates the host framework's per-request session operations into lock
//! and content calls. Read-only requests never touch the lock; exclusive
//! requests bracket their content access with acquire/release. Lock releases
//! are fire-and-forget: they go onto a bounded, supervised queue so the
//! request-end path never blocks on best-effort cleanup.
//!
//! A process-wide registry holds one backend per provider name. The host may
//! construct any number of facade instances for the same name; they all share
//! that backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::cancellation::CancellationHandle;
use crate::codec::{RecordCodec, SessionState};
use crate::config::ProviderConfig;
use crate::cosmos::CosmosDocumentStore;
use crate::lock::{LockManager, LockOutcome, LockToken};
use crate::session::{ContentStore, RequestScope};
use crate::traits::{DocumentStore, SessionStoreError, StoreResult};

/// Longest accepted session id, matching the host framework's limit.
pub const MAX_SESSION_ID_LENGTH: usize = 80;

/// Pending releases the queue will hold before dropping new ones.
const RELEASE_QUEUE_DEPTH: usize = 32;

/// Result of an exclusive get.
#[derive(Debug)]
pub enum ExclusiveGet {
    /// No content record exists; any lock taken during the attempt has been
    /// scheduled for release.
    NotFound,
    /// Another request holds the session.
    Locked {
        held_since: DateTime<Utc>,
        lock_age: std::time::Duration,
    },
    /// The session is ours until the token is released.
    Item {
        state: Option<SessionState>,
        is_new: bool,
        token: LockToken,
    },
}

struct ReleaseJob {
    session_id: String,
    token: LockToken,
}

/// Bounded fire-and-forget queue for lock releases, drained by one
/// supervisor task. A dropped job is safe: the lock record's TTL reclaims it.
#[derive(Clone)]
struct ReleaseQueue {
    tx: mpsc::Sender<ReleaseJob>,
}

impl ReleaseQueue {
    fn start(locks: LockManager) -> Self {
        let (tx, mut rx) = mpsc::channel::<ReleaseJob>(RELEASE_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                locks.release(&job.session_id, &job.token).await;
            }
            debug!("release queue worker stopped");
        });
        Self { tx }
    }

    fn enqueue(&self, session_id: &str, token: LockToken) {
        let job = ReleaseJob {
            session_id: session_id.to_string(),
            token,
        };
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!(
                    session_id = %job.session_id,
                    "release queue full; dropping release, lock will expire via TTL"
                );
            }
            Err(TrySendError::Closed(job)) => {
                warn!(
                    session_id = %job.session_id,
                    "release queue stopped; lock will expire via TTL"
                );
            }
        }
    }
}

struct ProviderBackend {
    contents: ContentStore,
    locks: LockManager,
    release_queue: ReleaseQueue,
}

impl ProviderBackend {
    async fn initialize(
        store: Arc<dyn DocumentStore>,
        config: &ProviderConfig,
    ) -> StoreResult<Arc<Self>> {
        store.bootstrap().await?;
        let contents = ContentStore::new(
            Arc::clone(&store),
            RecordCodec::new(),
            config.compression_enabled,
        );
        let locks = LockManager::new(Arc::clone(&store), config.lock_ttl);
        let release_queue = ReleaseQueue::start(locks.clone());
        info!(
            backend = store.backend_name(),
            "session provider backend initialized"
        );
        Ok(Arc::new(Self {
            contents,
            locks,
            release_queue,
        }))
    }
}

type BackendCell = Arc<tokio::sync::OnceCell<Arc<ProviderBackend>>>;

fn registry() -> &'static Mutex<HashMap<String, BackendCell>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, BackendCell>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn registry_cell(name: &str) -> BackendCell {
    let mut map = registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    map.entry(name.to_string()).or_default().clone()
}

/// Session-state provider facade.
///
/// Cheap to clone; every clone of a given provider name shares one backend.
#[derive(Clone)]
pub struct SessionStateProvider {
    backend: Arc<ProviderBackend>,
}

impl SessionStateProvider {
    /// Open (or join) the named provider over Cosmos DB. The backend is
    /// constructed at most once per name; later calls observe the one built
    /// first and their configuration is ignored.
    pub async fn open(name: &str, config: ProviderConfig) -> StoreResult<Self> {
        let cell = registry_cell(name);
        let backend = cell
            .get_or_try_init(|| async {
                let store: Arc<dyn DocumentStore> =
                    Arc::new(CosmosDocumentStore::connect(&config)?);
                ProviderBackend::initialize(store, &config).await
            })
            .await?
            .clone();
        Ok(Self { backend })
    }

    /// Open (or join) the named provider over an explicit store backend.
    /// Shares the same registry as [`open`](SessionStateProvider::open).
    pub async fn open_with_store(
        name: &str,
        store: Arc<dyn DocumentStore>,
        config: &ProviderConfig,
    ) -> StoreResult<Self> {
        let cell = registry_cell(name);
        let backend = cell
            .get_or_try_init(|| ProviderBackend::initialize(store, config))
            .await?
            .clone();
        Ok(Self { backend })
    }

    /// Standalone provider outside the named registry, for single-owner use.
    pub async fn with_store(
        store: Arc<dyn DocumentStore>,
        config: &ProviderConfig,
    ) -> StoreResult<Self> {
        let backend = ProviderBackend::initialize(store, config).await?;
        Ok(Self { backend })
    }

    /// Create a session record that exists but has not been populated yet.
    pub async fn create_uninitialized_item(
        &self,
        session_id: &str,
        timeout_minutes: i32,
        cancel: &CancellationHandle,
    ) -> StoreResult<()> {
        validate_session_id(session_id)?;
        ensure_not_cancelled(cancel)?;
        self.backend
            .contents
            .write_contents(session_id, &SessionState::empty(timeout_minutes), true)
            .await
    }

    /// Shared (read-only) get. No lock is involved; the caller keeps `scope`
    /// and hands it back to [`extend_lifetime`] at request end.
    ///
    /// [`extend_lifetime`]: SessionStateProvider::extend_lifetime
    pub async fn get_item(
        &self,
        session_id: &str,
        scope: &mut RequestScope,
        cancel: &CancellationHandle,
    ) -> StoreResult<(Option<SessionState>, bool)> {
        validate_session_id(session_id)?;
        ensure_not_cancelled(cancel)?;
        self.backend.contents.get_session(session_id, scope).await
    }

    /// Exclusive get: take the lock, then read. On contention the result
    /// reports how long the current holder has had the session. A lock taken
    /// for a session that turns out not to exist is released on the way out.
    pub async fn get_item_exclusive(
        &self,
        session_id: &str,
        scope: &mut RequestScope,
        cancel: &CancellationHandle,
    ) -> StoreResult<ExclusiveGet> {
        validate_session_id(session_id)?;
        ensure_not_cancelled(cancel)?;

        let token = match self.backend.locks.acquire(session_id, cancel).await? {
            LockOutcome::Contended { held_since, .. } => {
                let lock_age = (Utc::now() - held_since).to_std().unwrap_or_default();
                return Ok(ExclusiveGet::Locked {
                    held_since,
                    lock_age,
                });
            }
            LockOutcome::Acquired { token, .. } => token,
        };

        match self.backend.contents.get_session(session_id, scope).await {
            Ok((state, is_new)) => {
                if scope.has_read_record() {
                    Ok(ExclusiveGet::Item {
                        state,
                        is_new,
                        token,
                    })
                } else {
                    self.backend.release_queue.enqueue(session_id, token);
                    Ok(ExclusiveGet::NotFound)
                }
            }
            Err(err) => {
                self.backend.release_queue.enqueue(session_id, token);
                Err(err)
            }
        }
    }

    /// Fire-and-forget release of an exclusive hold. Returns before the
    /// delete is issued and never reports failure; TTL covers anything that
    /// slips through.
    pub fn release_item_exclusive(&self, session_id: &str, token: LockToken) {
        if let Err(err) = validate_session_id(session_id) {
            warn!(session_id, error = %err, "release requested for invalid session id");
            return;
        }
        self.backend.release_queue.enqueue(session_id, token);
    }

    /// Write the session and, unless it was newly created this request,
    /// schedule the lock release. The release is attempted even when the
    /// write fails.
    pub async fn set_and_release_item(
        &self,
        session_id: &str,
        state: &SessionState,
        token: Option<&LockToken>,
        new_item: bool,
        cancel: &CancellationHandle,
    ) -> StoreResult<()> {
        validate_session_id(session_id)?;
        ensure_not_cancelled(cancel)?;

        let result = self
            .backend
            .contents
            .write_contents(session_id, state, new_item)
            .await;

        if !new_item {
            if let Some(token) = token {
                self.backend.release_queue.enqueue(session_id, token.clone());
            }
        }
        result
    }

    /// Delete the session's content and lock records.
    pub async fn remove_item(
        &self,
        session_id: &str,
        cancel: &CancellationHandle,
    ) -> StoreResult<()> {
        validate_session_id(session_id)?;
        ensure_not_cancelled(cancel)?;
        self.backend.contents.remove(session_id).await
    }

    /// Sliding-expiration write for a session read earlier in the request.
    /// Intended for request end; the dampening rule makes most calls no-ops.
    pub async fn extend_lifetime(
        &self,
        session_id: &str,
        scope: &RequestScope,
    ) -> StoreResult<()> {
        validate_session_id(session_id)?;
        self.backend.contents.extend_lifetime(session_id, scope).await
    }

    /// Timeout reset is deliberately a no-op: the dampening rule on the read
    /// path already keeps live sessions from expiring.
    pub fn reset_item_timeout(&self, _session_id: &str) {}
}

/// Ids are opaque strings; only the host framework's length bound is
/// enforced.
fn validate_session_id(session_id: &str) -> StoreResult<()> {
    if session_id.len() > MAX_SESSION_ID_LENGTH {
        return Err(SessionStoreError::InvalidSessionId(format!(
            "session id length {} exceeds maximum {}",
            session_id.len(),
            MAX_SESSION_ID_LENGTH
        )));
    }
    Ok(())
}

fn ensure_not_cancelled(cancel: &CancellationHandle) -> StoreResult<()> {
    if cancel.is_cancelled() {
        return Err(SessionStoreError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    use crate::in_memory::InMemoryDocumentStore;

    fn test_config() -> ProviderConfig {
        ProviderConfig::from_connection_string(
            "AccountEndpoint=https://unit.documents.azure.com/;AccountKey=dGVzdC1rZXk=;",
            "sessions",
        )
        .unwrap()
    }

    async fn provider() -> (SessionStateProvider, Arc<InMemoryDocumentStore>) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let provider = SessionStateProvider::with_store(store.clone(), &test_config())
            .await
            .unwrap();
        (provider, store)
    }

    fn state() -> SessionState {
        let mut state = SessionState::empty(20);
        state.items.set("k", json!("v"));
        state
    }

    #[tokio::test]
    async fn rejects_oversized_ids_only() {
        let (provider, _) = provider().await;
        let cancel = CancellationHandle::new();
        let mut scope = RequestScope::new();

        let long = "x".repeat(MAX_SESSION_ID_LENGTH + 1);
        let err = provider
            .get_item(&long, &mut scope, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionStoreError::InvalidSessionId(_)));

        // Exactly at the limit is fine.
        let max = "x".repeat(MAX_SESSION_ID_LENGTH);
        assert!(provider.get_item(&max, &mut scope, &cancel).await.is_ok());

        // Ids are otherwise opaque; even the empty string is accepted.
        let (state, is_new) = provider.get_item("", &mut scope, &cancel).await.unwrap();
        assert_eq!(state, None);
        assert!(!is_new);
    }

    #[tokio::test]
    async fn uninitialized_item_reads_back_as_new() {
        let (provider, _) = provider().await;
        let cancel = CancellationHandle::new();
        provider
            .create_uninitialized_item("s1", 20, &cancel)
            .await
            .unwrap();

        let mut scope = RequestScope::new();
        let (state, is_new) = provider.get_item("s1", &mut scope, &cancel).await.unwrap();
        assert_eq!(state, Some(SessionState::empty(20)));
        assert!(is_new);
    }

    #[tokio::test]
    async fn exclusive_get_of_missing_session_releases_lock() {
        let (provider, store) = provider().await;
        let cancel = CancellationHandle::new();
        let mut scope = RequestScope::new();

        let got = provider
            .get_item_exclusive("absent", &mut scope, &cancel)
            .await
            .unwrap();
        assert!(matches!(got, ExclusiveGet::NotFound));

        // The queued release should clear the lock record shortly.
        for _ in 0..50 {
            if store.document_count().await == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("lock record was not released");
    }

    #[tokio::test]
    async fn exclusive_roundtrip_with_set_and_release() {
        let (provider, _) = provider().await;
        let cancel = CancellationHandle::new();

        provider
            .create_uninitialized_item("s2", 20, &cancel)
            .await
            .unwrap();

        let mut scope = RequestScope::new();
        let token = match provider
            .get_item_exclusive("s2", &mut scope, &cancel)
            .await
            .unwrap()
        {
            ExclusiveGet::Item { token, is_new, .. } => {
                assert!(is_new);
                token
            }
            other => panic!("expected exclusive item, got {other:?}"),
        };

        // While held, another exclusive get reports the holder's age.
        let mut other_scope = RequestScope::new();
        match provider
            .get_item_exclusive("s2", &mut other_scope, &cancel)
            .await
            .unwrap()
        {
            ExclusiveGet::Locked { lock_age, .. } => {
                assert!(lock_age < std::time::Duration::from_secs(5));
            }
            other => panic!("expected locked, got {other:?}"),
        }

        provider
            .set_and_release_item("s2", &state(), Some(&token), false, &cancel)
            .await
            .unwrap();

        // The queued release eventually frees the session for the next writer.
        for _ in 0..50 {
            let mut scope = RequestScope::new();
            match provider
                .get_item_exclusive("s2", &mut scope, &cancel)
                .await
                .unwrap()
            {
                ExclusiveGet::Item { state: read, is_new, .. } => {
                    assert_eq!(read, Some(state()));
                    assert!(!is_new);
                    return;
                }
                ExclusiveGet::Locked { .. } => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                ExclusiveGet::NotFound => panic!("session vanished"),
            }
        }
        panic!("lock was never released after set_and_release_item");
    }

    #[tokio::test]
    async fn named_providers_share_a_backend() {
        let name = format!("test-{}", Uuid::new_v4());
        let config = test_config();
        let store_a: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let store_b: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());

        let first = SessionStateProvider::open_with_store(&name, store_a, &config)
            .await
            .unwrap();
        // Second open with a different store still joins the first backend.
        let second = SessionStateProvider::open_with_store(&name, store_b, &config)
            .await
            .unwrap();

        let cancel = CancellationHandle::new();
        first
            .create_uninitialized_item("shared", 20, &cancel)
            .await
            .unwrap();

        let mut scope = RequestScope::new();
        let (read, is_new) = second
            .get_item("shared", &mut scope, &cancel)
            .await
            .unwrap();
        assert!(read.is_some());
        assert!(is_new);
    }

    #[tokio::test]
    async fn cancelled_operations_do_not_reach_the_store() {
        let (provider, store) = provider().await;
        let cancel = CancellationHandle::new();
        cancel.cancel();

        let mut scope = RequestScope::new();
        assert!(matches!(
            provider.get_item("s3", &mut scope, &cancel).await,
            Err(SessionStoreError::Cancelled)
        ));
        assert!(matches!(
            provider.create_uninitialized_item("s3", 20, &cancel).await,
            Err(SessionStoreError::Cancelled)
        ));
        assert_eq!(store.document_count().await, 0);
    }

    #[tokio::test]
    async fn reset_item_timeout_is_a_no_op() {
        let (provider, store) = provider().await;
        provider.reset_item_timeout("anything");
        assert_eq!(store.document_count().await, 0);
    }
}
