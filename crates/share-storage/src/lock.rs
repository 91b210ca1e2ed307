//! Per-dataset mutual exclusion for grant, revoke and verify batches.
//!
//! A lock is a row in `dataset_lock`. Acquisition is a single conditional
//! `UPDATE ... WHERE is_locked = 0` inside an immediate transaction, so two
//! holders can never both observe the row unlocked. Rows are created lazily on
//! first use and are never deleted.

use crate::run_blocking;
use chrono::Utc;
use metafuse_share_core::{DatasetLock, Result, ShareError};
use rand::Rng;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Jitter factor for retry backoff (±25%)
const JITTER_FACTOR: f64 = 0.25;

/// Bounded wait for a busy dataset lock
#[derive(Debug, Clone, PartialEq)]
pub struct LockRetryPolicy {
    /// Number of acquisition attempts before giving up
    pub max_attempts: u32,
    /// Delay after the first failed attempt, doubled after each further one
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(120),
        }
    }
}

impl LockRetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_interval
            .saturating_mul(1u32 << exponent)
            .min(self.max_interval);
        let base_ms = base.as_millis() as u64;

        let jitter_range = (base_ms as f64 * JITTER_FACTOR) as u64;
        let jitter = if jitter_range > 0 {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..jitter_range * 2) as i64 - jitter_range as i64
        } else {
            0
        };

        Duration::from_millis((base_ms as i64 + jitter).max(1) as u64)
    }
}

/// Coordinates exclusive access to datasets across processes sharing one
/// SQLite database.
#[derive(Debug, Clone)]
pub struct DatasetLockCoordinator {
    db_path: PathBuf,
    policy: LockRetryPolicy,
}

impl DatasetLockCoordinator {
    pub fn new(db_path: impl Into<PathBuf>, policy: LockRetryPolicy) -> Self {
        Self {
            db_path: db_path.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &LockRetryPolicy {
        &self.policy
    }

    /// Try once to take the lock. Returns true if `holder` now owns it.
    pub async fn acquire(&self, dataset_uri: &str, holder: &str) -> Result<bool> {
        let dataset_uri = dataset_uri.to_string();
        let holder = holder.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR IGNORE INTO dataset_lock (dataset_uri, is_locked, acquired_by) VALUES (?1, 0, NULL)",
                [&dataset_uri],
            )?;
            let rows = tx.execute(
                "UPDATE dataset_lock SET is_locked = 1, acquired_by = ?1, acquired_at = ?2
                 WHERE dataset_uri = ?3 AND is_locked = 0",
                params![holder, Utc::now(), dataset_uri],
            )?;
            tx.commit()?;

            if rows == 1 {
                debug!(dataset_uri = %dataset_uri, holder = %holder, "Acquired dataset lock");
            }
            Ok(rows == 1)
        })
        .await
    }

    /// Release the lock if `holder` owns it.
    ///
    /// Returns false when the lock was not held by `holder`; that is not an
    /// error, so releasing twice is harmless.
    pub async fn release(&self, dataset_uri: &str, holder: &str) -> Result<bool> {
        let dataset_uri = dataset_uri.to_string();
        let holder = holder.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let rows = conn.execute(
                "UPDATE dataset_lock SET is_locked = 0, acquired_by = NULL, acquired_at = NULL
                 WHERE dataset_uri = ?1 AND acquired_by = ?2 AND is_locked = 1",
                params![dataset_uri, holder],
            )?;
            if rows == 1 {
                debug!(dataset_uri = %dataset_uri, holder = %holder, "Released dataset lock");
            }
            Ok(rows == 1)
        })
        .await
    }

    /// Clear a lock regardless of holder. Returns the previous holder.
    pub async fn force_release(&self, dataset_uri: &str) -> Result<Option<String>> {
        let dataset_uri = dataset_uri.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let previous: Option<String> = tx
                .query_row(
                    "SELECT acquired_by FROM dataset_lock WHERE dataset_uri = ?1 AND is_locked = 1",
                    [&dataset_uri],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            tx.execute(
                "UPDATE dataset_lock SET is_locked = 0, acquired_by = NULL, acquired_at = NULL
                 WHERE dataset_uri = ?1",
                [&dataset_uri],
            )?;
            tx.commit()?;

            if let Some(holder) = &previous {
                warn!(dataset_uri = %dataset_uri, holder = %holder, "Force-released dataset lock");
            }
            Ok(previous)
        })
        .await
    }

    pub async fn get_lock(&self, dataset_uri: &str) -> Result<Option<DatasetLock>> {
        let dataset_uri = dataset_uri.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let lock = conn
                .query_row(
                    "SELECT dataset_uri, is_locked, acquired_by, acquired_at FROM dataset_lock WHERE dataset_uri = ?1",
                    [&dataset_uri],
                    |row| {
                        Ok(DatasetLock {
                            dataset_uri: row.get(0)?,
                            is_locked: row.get(1)?,
                            acquired_by: row.get(2)?,
                            acquired_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(lock)
        })
        .await
    }

    /// Locks currently held, oldest first.
    pub async fn list_held_locks(&self) -> Result<Vec<DatasetLock>> {
        run_blocking(self.db_path.clone(), move |conn| {
            let mut stmt = conn.prepare(
                "SELECT dataset_uri, is_locked, acquired_by, acquired_at FROM dataset_lock
                 WHERE is_locked = 1 ORDER BY acquired_at",
            )?;
            let locks = stmt
                .query_map([], |row| {
                    Ok(DatasetLock {
                        dataset_uri: row.get(0)?,
                        is_locked: row.get(1)?,
                        acquired_by: row.get(2)?,
                        acquired_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(locks)
        })
        .await
    }

    /// Acquire with bounded retries.
    ///
    /// Returns the time spent waiting, or `ResourceLockTimeout` once every
    /// attempt has failed.
    pub async fn acquire_with_retry(
        &self,
        dataset_uri: &str,
        holder: &str,
        action: &str,
    ) -> Result<Duration> {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if self.acquire(dataset_uri, holder).await? {
                return Ok(started.elapsed());
            }

            if attempt < max_attempts {
                let delay = self.policy.delay_for(attempt);
                info!(
                    dataset_uri = %dataset_uri,
                    holder = %holder,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Dataset lock busy, waiting before retry"
                );
                tokio::time::sleep(delay).await;
            }
        }

        warn!(
            dataset_uri = %dataset_uri,
            holder = %holder,
            attempts = max_attempts,
            "Gave up waiting for dataset lock"
        );
        Err(ShareError::ResourceLockTimeout {
            action: action.to_string(),
            message: format!(
                "Failed to acquire lock for dataset {} after {} attempts",
                dataset_uri, max_attempts
            ),
        })
    }

    /// Run `f` while holding the dataset lock.
    ///
    /// The lock is released whether `f` succeeds or fails. If the future is
    /// dropped or panics mid-way, the release is handed to the runtime.
    pub async fn with_lock<T, F, Fut>(
        &self,
        dataset_uri: &str,
        holder: &str,
        action: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire_with_retry(dataset_uri, holder, action).await?;

        let mut guard = ReleaseOnDrop {
            coordinator: self.clone(),
            dataset_uri: dataset_uri.to_string(),
            holder: holder.to_string(),
            armed: true,
        };

        let result = f().await;

        guard.armed = false;
        match self.release(dataset_uri, holder).await {
            Ok(true) => {}
            Ok(false) => warn!(
                dataset_uri = %dataset_uri,
                holder = %holder,
                "Dataset lock was no longer held at release"
            ),
            Err(e) => warn!(
                dataset_uri = %dataset_uri,
                holder = %holder,
                error = %e,
                "Failed to release dataset lock"
            ),
        }

        result
    }
}

/// Releases a lock from `Drop` when the holding future never reached its
/// explicit release.
struct ReleaseOnDrop {
    coordinator: DatasetLockCoordinator,
    dataset_uri: String,
    holder: String,
    armed: bool,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let coordinator = self.coordinator.clone();
        let dataset_uri = std::mem::take(&mut self.dataset_uri);
        let holder = std::mem::take(&mut self.holder);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = coordinator.release(&dataset_uri, &holder).await {
                        warn!(
                            dataset_uri = %dataset_uri,
                            holder = %holder,
                            error = %e,
                            "Failed to release dataset lock after cancellation"
                        );
                    }
                });
            }
            Err(_) => warn!(
                dataset_uri = %dataset_uri,
                holder = %holder,
                "No runtime available to release dataset lock"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn coordinator(policy: LockRetryPolicy) -> (TempDir, DatasetLockCoordinator) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shares.db");
        crate::initialize_store(&path).await.unwrap();
        (dir, DatasetLockCoordinator::new(path, policy))
    }

    fn fast_policy(max_attempts: u32) -> LockRetryPolicy {
        LockRetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let (_dir, locks) = coordinator(fast_policy(1)).await;

        assert!(locks.acquire("sales", "share-a").await.unwrap());
        assert!(!locks.acquire("sales", "share-b").await.unwrap());
        // Same holder cannot re-enter either
        assert!(!locks.acquire("sales", "share-a").await.unwrap());

        let lock = locks.get_lock("sales").await.unwrap().unwrap();
        assert!(lock.is_locked);
        assert_eq!(lock.acquired_by.as_deref(), Some("share-a"));
        assert!(lock.acquired_at.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_single_winner() {
        let (_dir, locks) = coordinator(fast_policy(1)).await;
        let locks = Arc::new(locks);

        let mut handles = Vec::new();
        for i in 0..8 {
            let locks = Arc::clone(&locks);
            handles.push(tokio::spawn(async move {
                locks.acquire("sales", &format!("holder-{i}")).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_holder_scoped() {
        let (_dir, locks) = coordinator(fast_policy(1)).await;
        assert!(locks.acquire("sales", "share-a").await.unwrap());

        assert!(!locks.release("sales", "share-b").await.unwrap());
        assert!(locks.release("sales", "share-a").await.unwrap());
        assert!(!locks.release("sales", "share-a").await.unwrap());
        assert!(!locks.release("never-locked", "share-a").await.unwrap());

        let lock = locks.get_lock("sales").await.unwrap().unwrap();
        assert!(!lock.is_locked);
        assert!(lock.acquired_by.is_none());
    }

    #[tokio::test]
    async fn test_unrelated_datasets_do_not_contend() {
        let (_dir, locks) = coordinator(fast_policy(1)).await;
        assert!(locks.acquire("sales", "share-a").await.unwrap());
        assert!(locks.acquire("marketing", "share-b").await.unwrap());
        assert_eq!(locks.list_held_locks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_acquire_with_retry_times_out() {
        let (_dir, locks) = coordinator(fast_policy(3)).await;
        assert!(locks.acquire("sales", "share-a").await.unwrap());

        let err = locks
            .acquire_with_retry("sales", "share-b", "approve share object")
            .await
            .unwrap_err();
        match err {
            ShareError::ResourceLockTimeout { action, .. } => {
                assert_eq!(action, "approve share object")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_acquire_with_retry_waits_for_release() {
        let (_dir, locks) = coordinator(fast_policy(50)).await;
        assert!(locks.acquire("sales", "share-a").await.unwrap());

        let releaser = locks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            releaser.release("sales", "share-a").await.unwrap();
        });

        locks
            .acquire_with_retry("sales", "share-b", "approve share object")
            .await
            .unwrap();
        let lock = locks.get_lock("sales").await.unwrap().unwrap();
        assert_eq!(lock.acquired_by.as_deref(), Some("share-b"));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let (_dir, locks) = coordinator(fast_policy(1)).await;

        let result: Result<()> = locks
            .with_lock("sales", "share-a", "revoke items", || async {
                Err(ShareError::Other("grant blew up".to_string()))
            })
            .await;
        assert!(result.is_err());

        let lock = locks.get_lock("sales").await.unwrap().unwrap();
        assert!(!lock.is_locked);
    }

    #[tokio::test]
    async fn test_force_release_reports_previous_holder() {
        let (_dir, locks) = coordinator(fast_policy(1)).await;
        assert!(locks.acquire("sales", "crashed-task").await.unwrap());

        let previous = locks.force_release("sales").await.unwrap();
        assert_eq!(previous.as_deref(), Some("crashed-task"));
        assert_eq!(locks.force_release("sales").await.unwrap(), None);
        assert!(locks.acquire("sales", "share-a").await.unwrap());
    }

    #[test]
    fn test_backoff_is_capped_with_jitter() {
        let policy = LockRetryPolicy {
            max_attempts: 10,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
        };
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
        let late = policy.delay_for(9);
        assert!(late >= Duration::from_millis(300) && late <= Duration::from_millis(500));
    }
}
