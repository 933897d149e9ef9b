//! Document store seam
//!
//! Every component receives an explicit [`DataStore`] handle instead of
//! reaching for a global. Production uses [`SqliteStore`]; tests use
//! [`MemoryStore`]. [`TimedStore`] bounds every call with a timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::models::{AuditEntry, CheckInEvent, Pub, StoredAggregate, UserPage, UserRecord, UserStats};
use crate::{Error, Result};

pub mod memory;
pub mod retry;
#[cfg(feature = "sqlx")]
pub mod sqlite;

pub use memory::MemoryStore;
pub use retry::retry_transient;
#[cfg(feature = "sqlx")]
pub use sqlite::SqliteStore;

/// Access to the event log, user records, pub references and the audit sink
#[async_trait]
pub trait DataStore: Send + Sync {
    /// User record by uid; `None` if it does not exist
    async fn get_user(&self, uid: &str) -> Result<Option<UserRecord>>;

    /// One page of user records ordered by uid, strictly after `page.after`
    async fn list_users(&self, page: &UserPage) -> Result<Vec<UserRecord>>;

    /// All check-ins whose `userId` equals `uid`
    async fn query_events_by_user(&self, uid: &str) -> Result<Vec<CheckInEvent>>;

    /// Check-ins with `start <= dateKey <= end` (lexicographic)
    async fn query_events_by_date_range(&self, start: &str, end: &str)
        -> Result<Vec<CheckInEvent>>;

    /// Check-ins sharing the same (user, pub, day) visit key
    async fn query_events_by_visit(
        &self,
        user_id: &str,
        pub_id: &str,
        date_key: &str,
    ) -> Result<Vec<CheckInEvent>>;

    /// One page of the whole log ordered by event id, strictly after `after`
    async fn scan_events(&self, after: Option<&str>, limit: usize) -> Result<Vec<CheckInEvent>>;

    /// Pub reference by id; `None` if it does not exist
    async fn get_pub(&self, pub_id: &str) -> Result<Option<Pub>>;

    /// Unverified pub count, owned by the pub verification subsystem
    ///
    /// This is the only way stats code reads the field. Nothing in this
    /// workspace writes it.
    async fn get_unverified_pub_count(&self, uid: &str) -> Result<i64>;

    /// Overwrite the derived counters of a user's aggregate
    ///
    /// Writes `totalPoints`, `verifiedPubCount`, `totalPubCount` and
    /// `lastStatsUpdate`. Fails with `NotFound` if the user does not exist.
    async fn put_aggregate(&self, stats: &UserStats) -> Result<()>;

    /// Write the canonical aggregate and the `realUser` flag of a new user
    async fn init_user_profile(
        &self,
        uid: &str,
        aggregate: &StoredAggregate,
        real_user: bool,
    ) -> Result<()>;

    /// Append to the audit sink
    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;
}

/// Decorator bounding every store call with a timeout
///
/// Expiry is reported as [`Error::Timeout`], which is transient.
#[derive(Clone)]
pub struct TimedStore {
    inner: Arc<dyn DataStore>,
    timeout: Duration,
}

impl TimedStore {
    pub fn new(inner: Arc<dyn DataStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                warn!(operation, timeout_ms, "Store call timed out");
                Err(Error::Timeout {
                    operation,
                    timeout_ms,
                })
            }
        }
    }
}

#[async_trait]
impl DataStore for TimedStore {
    async fn get_user(&self, uid: &str) -> Result<Option<UserRecord>> {
        self.bounded("get_user", self.inner.get_user(uid)).await
    }

    async fn list_users(&self, page: &UserPage) -> Result<Vec<UserRecord>> {
        self.bounded("list_users", self.inner.list_users(page)).await
    }

    async fn query_events_by_user(&self, uid: &str) -> Result<Vec<CheckInEvent>> {
        self.bounded("query_events_by_user", self.inner.query_events_by_user(uid))
            .await
    }

    async fn query_events_by_date_range(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Vec<CheckInEvent>> {
        self.bounded(
            "query_events_by_date_range",
            self.inner.query_events_by_date_range(start, end),
        )
        .await
    }

    async fn query_events_by_visit(
        &self,
        user_id: &str,
        pub_id: &str,
        date_key: &str,
    ) -> Result<Vec<CheckInEvent>> {
        self.bounded(
            "query_events_by_visit",
            self.inner.query_events_by_visit(user_id, pub_id, date_key),
        )
        .await
    }

    async fn scan_events(&self, after: Option<&str>, limit: usize) -> Result<Vec<CheckInEvent>> {
        self.bounded("scan_events", self.inner.scan_events(after, limit))
            .await
    }

    async fn get_pub(&self, pub_id: &str) -> Result<Option<Pub>> {
        self.bounded("get_pub", self.inner.get_pub(pub_id)).await
    }

    async fn get_unverified_pub_count(&self, uid: &str) -> Result<i64> {
        self.bounded(
            "get_unverified_pub_count",
            self.inner.get_unverified_pub_count(uid),
        )
        .await
    }

    async fn put_aggregate(&self, stats: &UserStats) -> Result<()> {
        self.bounded("put_aggregate", self.inner.put_aggregate(stats))
            .await
    }

    async fn init_user_profile(
        &self,
        uid: &str,
        aggregate: &StoredAggregate,
        real_user: bool,
    ) -> Result<()> {
        self.bounded(
            "init_user_profile",
            self.inner.init_user_profile(uid, aggregate, real_user),
        )
        .await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.bounded("append_audit", self.inner.append_audit(entry))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timed_store_passes_through() {
        let memory = Arc::new(MemoryStore::new());
        memory.insert_user(UserRecord::new("u1"));
        let store = TimedStore::new(memory, Duration::from_millis(500));

        let user = store.get_user("u1").await.unwrap();
        assert_eq!(user.map(|u| u.uid), Some("u1".to_string()));
        assert!(store.get_user("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timed_store_maps_expiry_to_timeout() {
        let memory = Arc::new(MemoryStore::new());
        memory.insert_user(UserRecord::new("u1"));
        memory.set_latency(Duration::from_millis(200));
        let store = TimedStore::new(memory, Duration::from_millis(20));

        let err = store.query_events_by_user("u1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                operation: "query_events_by_user",
                ..
            }
        ));
        assert!(err.is_transient());
    }
}
