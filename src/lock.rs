//! Distributed lock protocol.
//!
//! Acquisition is two-phase. Phase 1 is an optimistic insert of the lock
//! record: in the common uncontested case it costs one point write and no
//! script execution. A primary-key conflict means some holder exists, so
//! phase 2 executes the server-side try-lock script, which checks absence
//! and inserts atomically within the partition and reports the holder when
//! there is one. Neither phase ever blocks waiting for a contended lock.
//!
//! Release is ETag-conditional and best-effort; a holder that dies without
//! releasing is healed by the lock record's TTL.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};

use crate::cancellation::CancellationHandle;
use crate::document::{lock_id, LockDocument};
use crate::traits::{
    DeleteOutcome, DocumentStore, InsertLockOutcome, SessionStoreError, StoreResult,
};

/// Retries of the try-lock script after its first attempt.
const SCRIPT_RETRY_LIMIT: u32 = 3;

/// Randomized back-off between script attempts, sampled uniformly.
const RETRY_BACKOFF_MIN_MS: u64 = 10;
const RETRY_BACKOFF_MAX_MS: u64 = 50;

/// The credential returned by a successful acquisition: the lock record's
/// server-assigned ETag. It is the only value that can release the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(etag: impl Into<String>) -> Self {
        Self(etag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone)]
pub enum LockOutcome {
    Acquired {
        token: LockToken,
        acquired_at: DateTime<Utc>,
    },
    /// Someone else holds the lock; `held_since` is the holder's acquisition
    /// time as recorded on the lock record.
    Contended {
        holder: LockToken,
        held_since: DateTime<Utc>,
    },
}

/// Lock acquisition and release against a document store.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn DocumentStore>,
    lock_ttl_secs: i64,
}

impl LockManager {
    pub fn new(store: Arc<dyn DocumentStore>, lock_ttl: Duration) -> Self {
        Self {
            store,
            lock_ttl_secs: lock_ttl.as_secs() as i64,
        }
    }

    /// Try to take the session's lock. Returns immediately with
    /// [`LockOutcome::Contended`] when another holder exists.
    pub async fn acquire(
        &self,
        session_id: &str,
        cancel: &CancellationHandle,
    ) -> StoreResult<LockOutcome> {
        if cancel.is_cancelled() {
            return Err(SessionStoreError::Cancelled);
        }

        let doc = LockDocument::for_session(session_id, self.lock_ttl_secs);
        match self.store.insert_lock(&doc).await? {
            InsertLockOutcome::Created { etag, created_date } => {
                debug!(session_id, "lock acquired optimistically");
                Ok(LockOutcome::Acquired {
                    token: LockToken::new(etag),
                    acquired_at: created_date,
                })
            }
            InsertLockOutcome::Held => self.acquire_scripted(session_id, cancel).await,
        }
    }

    /// Phase 2: arbitration through the stored script, with bounded
    /// randomized retry on the two transient conflict statuses.
    async fn acquire_scripted(
        &self,
        session_id: &str,
        cancel: &CancellationHandle,
    ) -> StoreResult<LockOutcome> {
        let id = lock_id(session_id);
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SessionStoreError::Cancelled);
            }
            match self.store.try_lock(&id, Utc::now(), self.lock_ttl_secs).await {
                Ok(reply) => {
                    return Ok(if reply.locked {
                        debug!(session_id, attempt, "lock acquired via script");
                        LockOutcome::Acquired {
                            token: LockToken::new(reply.etag),
                            acquired_at: reply.created_date,
                        }
                    } else {
                        LockOutcome::Contended {
                            holder: LockToken::new(reply.etag),
                            held_since: reply.created_date,
                        }
                    });
                }
                Err(err) if attempt < SCRIPT_RETRY_LIMIT && err.is_retryable_script_conflict() => {
                    attempt += 1;
                    let backoff = Duration::from_millis(
                        rand::thread_rng().gen_range(RETRY_BACKOFF_MIN_MS..=RETRY_BACKOFF_MAX_MS),
                    );
                    debug!(
                        session_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient conflict on try-lock script, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(SessionStoreError::Cancelled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Delete the lock record if the token still matches. Never fails the
    /// caller: a vanished lock already healed via TTL, a mismatched token
    /// must leave the current holder's lock intact, and anything else is
    /// logged and left to TTL.
    pub async fn release(&self, session_id: &str, token: &LockToken) {
        let id = lock_id(session_id);
        match self.store.delete_document(&id, Some(token.as_str())).await {
            Ok(DeleteOutcome::Deleted) => {
                debug!(session_id, "lock released");
            }
            Ok(DeleteOutcome::NotFound) => {
                warn!(session_id, "lock record already gone on release");
            }
            Ok(DeleteOutcome::EtagMismatch) => {
                warn!(session_id, "release token did not match current lock");
            }
            Err(err) => {
                warn!(session_id, error = %err, "lock release failed; record will expire via TTL");
            }
        }
    }
}
