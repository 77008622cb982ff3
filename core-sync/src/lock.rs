//! # Sync Lock
//!
//! Lease-based mutual exclusion for reconciliation runs, stored in the
//! document store (`sync_locks`, one document per entity type).
//!
//! ## State Machine
//!
//! ```text
//! Unlocked ──acquire──> Locked ──release / expiry──> Unlocked
//! ```
//!
//! Acquisition is a single conditional upsert that succeeds only when no lease
//! exists, the lease was released, or it has expired. The storage layer
//! evaluates the condition, so two contenders can never both win.

use bridge_traits::store::{Document, DocumentStore, FieldCheck, Fields, UpsertCondition};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{Result, SyncError};

pub const LOCK_COLLECTION: &str = "sync_locks";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
}

/// Time-bounded claim on one entity type's reconciliation slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLease {
    pub key: String,
    pub locked: bool,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Distinguishes successive holders with the same owner name
    pub lease_id: String,
}

impl SyncLease {
    /// Active until the millisecond after `expires_at`, matching the
    /// `expires_at < now` reclaim condition of [`SyncLock::try_acquire`]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.locked && self.expires_at.timestamp_millis() >= now.timestamp_millis()
    }

    fn to_document(&self) -> Document {
        let mut fields = Fields::new();
        fields.insert("locked".into(), Value::Bool(self.locked));
        fields.insert("locked_by".into(), Value::String(self.locked_by.clone()));
        fields.insert("locked_at".into(), self.locked_at.timestamp_millis().into());
        fields.insert("expires_at".into(), self.expires_at.timestamp_millis().into());
        fields.insert("lease_id".into(), Value::String(self.lease_id.clone()));
        Document::new(self.key.clone(), fields)
    }

    fn from_document(document: &Document) -> Result<Self> {
        let invalid = |reason: &str| SyncError::InvalidDocument {
            id: document.id.clone(),
            reason: reason.to_string(),
        };
        let millis = |field: &str| {
            document
                .get_i64(field)
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| invalid(&format!("missing or invalid {}", field)))
        };

        Ok(Self {
            key: document.id.clone(),
            locked: document
                .get("locked")
                .and_then(Value::as_bool)
                .ok_or_else(|| invalid("missing locked flag"))?,
            locked_by: document.get_str("locked_by").unwrap_or_default().to_string(),
            locked_at: millis("locked_at")?,
            expires_at: millis("expires_at")?,
            lease_id: document.get_str("lease_id").unwrap_or_default().to_string(),
        })
    }
}

pub struct SyncLock {
    store: Arc<dyn DocumentStore>,
    lease_duration: ChronoDuration,
}

impl SyncLock {
    pub fn new(store: Arc<dyn DocumentStore>, lease_duration: Duration) -> Self {
        let lease_duration =
            ChronoDuration::from_std(lease_duration).unwrap_or_else(|_| ChronoDuration::minutes(10));
        Self {
            store,
            lease_duration,
        }
    }

    /// Try to take the lease. Returns `false` if someone else holds it.
    pub async fn acquire(&self, entity_type: &str, owner: &str) -> Result<bool> {
        Ok(self.try_acquire(entity_type, owner).await?.is_some())
    }

    /// Try to take the lease, returning it on success
    #[instrument(skip(self))]
    pub async fn try_acquire(&self, entity_type: &str, owner: &str) -> Result<Option<SyncLease>> {
        let now = self.store.now();
        let lease = SyncLease {
            key: entity_type.to_string(),
            locked: true,
            locked_by: owner.to_string(),
            locked_at: now,
            expires_at: now + self.lease_duration,
            lease_id: Uuid::new_v4().to_string(),
        };

        let condition = UpsertCondition::ExistingMatchesAny(vec![
            FieldCheck::Equals("locked".into(), Value::Bool(false)),
            FieldCheck::LessThan("expires_at".into(), now.timestamp_millis()),
        ]);

        let acquired = self
            .store
            .conditional_upsert(LOCK_COLLECTION, &lease.to_document(), &condition)
            .await?;

        if acquired {
            info!(expires_at = %lease.expires_at, "Lease acquired");
            Ok(Some(lease))
        } else {
            debug!("Lease held by another run");
            Ok(None)
        }
    }

    /// Release the lease regardless of who holds it
    #[instrument(skip(self))]
    pub async fn release(&self, entity_type: &str) -> Result<()> {
        let Some(current) = self.lease(entity_type).await? else {
            return Ok(());
        };

        let released = self.released(current);
        self.store
            .replace_one(LOCK_COLLECTION, &released.to_document())
            .await?;
        info!("Lease released");
        Ok(())
    }

    /// Release `lease` only if it is still the current holder's
    async fn release_lease(&self, lease: &SyncLease) -> Result<bool> {
        let released = self.released(lease.clone());
        let condition = UpsertCondition::ExistingMatchesAny(vec![FieldCheck::Equals(
            "lease_id".into(),
            Value::String(lease.lease_id.clone()),
        )]);

        let written = self
            .store
            .conditional_upsert(LOCK_COLLECTION, &released.to_document(), &condition)
            .await?;

        if written {
            info!(entity_type = %lease.key, "Lease released");
        } else {
            warn!(entity_type = %lease.key, "Lease expired and was taken over before release");
        }
        Ok(written)
    }

    fn released(&self, mut lease: SyncLease) -> SyncLease {
        lease.locked = false;
        lease.expires_at = self.store.now();
        lease
    }

    /// Current lease document, if any
    pub async fn lease(&self, entity_type: &str) -> Result<Option<SyncLease>> {
        self.store
            .find_one(LOCK_COLLECTION, entity_type)
            .await?
            .as_ref()
            .map(SyncLease::from_document)
            .transpose()
    }

    pub async fn state(&self, entity_type: &str) -> Result<LockState> {
        let now = self.store.now();
        Ok(match self.lease(entity_type).await? {
            Some(lease) if lease.is_active_at(now) => LockState::Locked,
            _ => LockState::Unlocked,
        })
    }

    pub async fn is_locked(&self, entity_type: &str) -> Result<bool> {
        Ok(self.state(entity_type).await? == LockState::Locked)
    }

    /// Run `f` while holding the lease for `entity_type`
    ///
    /// The lease is released on success, on error and on panic; a panic is
    /// resumed after release.
    ///
    /// # Errors
    ///
    /// [`SyncError::SyncInProgress`] without running `f` when the lease is held.
    pub async fn execute_with_lock<F, Fut, T>(&self, entity_type: &str, owner: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(lease) = self.try_acquire(entity_type, owner).await? else {
            return Err(SyncError::SyncInProgress {
                entity_type: entity_type.to_string(),
            });
        };

        let outcome = AssertUnwindSafe(f()).catch_unwind().await;

        if let Err(e) = self.release_lease(&lease).await {
            error!(entity_type, error = %e, "Failed to release lease; it will lapse at expiry");
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_desktop::SqliteDocumentStore;
    use bridge_traits::time::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn lock_with_clock() -> (SyncLock, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let store = SqliteDocumentStore::in_memory()
            .await
            .unwrap()
            .with_clock(clock.clone());
        (
            SyncLock::new(Arc::new(store), Duration::from_secs(600)),
            clock,
        )
    }

    #[tokio::test]
    async fn test_held_lease_blocks_acquire() {
        let (lock, _clock) = lock_with_clock().await;

        assert!(lock.acquire("users", "alice").await.unwrap());
        assert!(!lock.acquire("users", "bob").await.unwrap());
        assert!(lock.acquire("roles", "bob").await.unwrap());

        let lease = lock.lease("users").await.unwrap().unwrap();
        assert_eq!(lease.locked_by, "alice");
        assert_eq!(lease.expires_at - lease.locked_at, ChronoDuration::minutes(10));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let (lock, clock) = lock_with_clock().await;
        assert!(lock.acquire("users", "crashed-run").await.unwrap());

        clock.advance(ChronoDuration::minutes(9));
        assert!(lock.is_locked("users").await.unwrap());
        assert!(!lock.acquire("users", "scheduler").await.unwrap());

        clock.advance(ChronoDuration::minutes(2));
        assert!(!lock.is_locked("users").await.unwrap());
        assert!(lock.acquire("users", "scheduler").await.unwrap());
        assert_eq!(lock.lease("users").await.unwrap().unwrap().locked_by, "scheduler");
    }

    #[tokio::test]
    async fn test_lease_boundary_agrees_with_acquire() {
        let (lock, clock) = lock_with_clock().await;
        assert!(lock.acquire("users", "first").await.unwrap());
        let expires_at = lock.lease("users").await.unwrap().unwrap().expires_at;

        clock.set(expires_at);
        assert!(lock.is_locked("users").await.unwrap());
        assert!(!lock.acquire("users", "second").await.unwrap());

        clock.set(expires_at + ChronoDuration::microseconds(500));
        assert!(lock.is_locked("users").await.unwrap());
        assert!(!lock.acquire("users", "second").await.unwrap());

        clock.advance(ChronoDuration::milliseconds(1));
        assert!(!lock.is_locked("users").await.unwrap());
        assert!(lock.acquire("users", "second").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_unlocks() {
        let (lock, _clock) = lock_with_clock().await;
        assert!(lock.acquire("users", "alice").await.unwrap());

        lock.release("users").await.unwrap();

        assert_eq!(lock.state("users").await.unwrap(), LockState::Unlocked);
        assert!(lock.acquire("users", "bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_exactly_one_contender_wins_expired_lease() {
        let (lock, clock) = lock_with_clock().await;
        assert!(lock.acquire("users", "crashed-run").await.unwrap());
        clock.advance(ChronoDuration::minutes(11));

        let lock = Arc::new(lock);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lock = Arc::clone(&lock);
                tokio::spawn(async move { lock.acquire("users", &format!("worker-{}", i)).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_concurrent_execute_runs_once() {
        let (lock, _clock) = lock_with_clock().await;
        let runs = AtomicUsize::new(0);
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

        let first = lock.execute_with_lock("users", "alice", || async {
            runs.fetch_add(1, Ordering::SeqCst);
            let _ = entered_tx.send(());
            let _ = finish_rx.await;
            Ok(1)
        });

        let second = async {
            let _ = entered_rx.await;
            let result = lock
                .execute_with_lock("users", "bob", || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(2)
                })
                .await;
            let _ = finish_tx.send(());
            result
        };

        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap(), 1);
        assert!(matches!(second, Err(SyncError::SyncInProgress { .. })));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked("users").await.unwrap());
    }

    #[tokio::test]
    async fn test_error_releases_lease() {
        let (lock, _clock) = lock_with_clock().await;

        let result: Result<()> = lock
            .execute_with_lock("users", "alice", || async {
                Err(SyncError::ConsistencyViolation { failed: 2 })
            })
            .await;

        assert!(matches!(result, Err(SyncError::ConsistencyViolation { failed: 2 })));
        assert!(!lock.is_locked("users").await.unwrap());
    }

    #[tokio::test]
    async fn test_panic_releases_lease_and_resumes() {
        let (lock, _clock) = lock_with_clock().await;
        let lock = Arc::new(lock);

        let task_lock = Arc::clone(&lock);
        let joined = tokio::spawn(async move {
            task_lock
                .execute_with_lock("users", "alice", || async {
                    if true {
                        panic!("mapper exploded");
                    }
                    Ok(())
                })
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert!(!lock.is_locked("users").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_new_lease() {
        let (lock, clock) = lock_with_clock().await;
        let stale = lock.try_acquire("users", "slow-run").await.unwrap().unwrap();

        clock.advance(ChronoDuration::minutes(11));
        assert!(lock.acquire("users", "fresh-run").await.unwrap());

        assert!(!lock.release_lease(&stale).await.unwrap());
        assert!(lock.is_locked("users").await.unwrap());
    }
}
