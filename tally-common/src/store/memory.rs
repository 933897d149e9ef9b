//! In-memory document store
//!
//! Behaves like the SQLite store and adds fault injection (failed reads,
//! failed writes, artificial latency) plus a write counter, so callers can
//! exercise failure isolation and assert that dry runs never write.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::retry::transient;
use super::DataStore;
use crate::models::{AuditEntry, CheckInEvent, Pub, StoredAggregate, UserPage, UserRecord, UserStats};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    users: BTreeMap<String, UserRecord>,
    events: BTreeMap<String, CheckInEvent>,
    pubs: BTreeMap<String, Pub>,
    audit: Vec<AuditEntry>,
    failing_event_reads: HashSet<String>,
    failing_user_reads: HashSet<String>,
    fail_date_range_reads: bool,
    fail_writes: bool,
    fail_audit: bool,
    latency: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    // ------------------------------------------------------------------
    // Fixture helpers (bypass the write counter)
    // ------------------------------------------------------------------

    pub fn insert_user(&self, user: UserRecord) {
        self.lock().users.insert(user.uid.clone(), user);
    }

    pub fn remove_user(&self, uid: &str) -> Option<UserRecord> {
        self.lock().users.remove(uid)
    }

    pub fn insert_event(&self, event: CheckInEvent) {
        self.lock().events.insert(event.id.clone(), event);
    }

    pub fn insert_pub(&self, pub_ref: Pub) {
        self.lock().pubs.insert(pub_ref.id.clone(), pub_ref);
    }

    pub fn remove_pub(&self, pub_id: &str) -> Option<Pub> {
        self.lock().pubs.remove(pub_id)
    }

    /// Stand-in for the verification subsystem writing its own field
    pub fn set_unverified_pub_count(&self, uid: &str, count: i64) {
        if let Some(user) = self.lock().users.get_mut(uid) {
            user.aggregate.unverified_pub_count = Some(count);
        }
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    pub fn fail_event_reads_for(&self, uid: &str) {
        self.lock().failing_event_reads.insert(uid.to_string());
    }

    pub fn fail_user_reads_for(&self, uid: &str) {
        self.lock().failing_user_reads.insert(uid.to_string());
    }

    pub fn fail_date_range_reads(&self, fail: bool) {
        self.lock().fail_date_range_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn fail_audit(&self, fail: bool) {
        self.lock().fail_audit = fail;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Successful aggregate/profile writes since creation
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn user(&self, uid: &str) -> Option<UserRecord> {
        self.lock().users.get(uid).cloned()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().audit.clone()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get_user(&self, uid: &str) -> Result<Option<UserRecord>> {
        self.simulate_latency().await;
        let inner = self.lock();
        if inner.failing_user_reads.contains(uid) {
            return Err(transient("get_user"));
        }
        Ok(inner.users.get(uid).cloned())
    }

    async fn list_users(&self, page: &UserPage) -> Result<Vec<UserRecord>> {
        self.simulate_latency().await;
        let inner = self.lock();
        Ok(inner
            .users
            .values()
            .filter(|u| page.after.as_deref().map_or(true, |after| u.uid.as_str() > after))
            .filter(|u| !page.real_users_only || u.is_real())
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn query_events_by_user(&self, uid: &str) -> Result<Vec<CheckInEvent>> {
        self.simulate_latency().await;
        let inner = self.lock();
        if inner.failing_event_reads.contains(uid) {
            return Err(transient("query_events_by_user"));
        }
        Ok(inner
            .events
            .values()
            .filter(|e| e.user_id.as_deref() == Some(uid))
            .cloned()
            .collect())
    }

    async fn query_events_by_date_range(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Vec<CheckInEvent>> {
        self.simulate_latency().await;
        let inner = self.lock();
        if inner.fail_date_range_reads {
            return Err(transient("query_events_by_date_range"));
        }
        Ok(inner
            .events
            .values()
            .filter(|e| {
                e.date_key
                    .as_deref()
                    .map_or(false, |key| key >= start && key <= end)
            })
            .cloned()
            .collect())
    }

    async fn query_events_by_visit(
        &self,
        user_id: &str,
        pub_id: &str,
        date_key: &str,
    ) -> Result<Vec<CheckInEvent>> {
        self.simulate_latency().await;
        Ok(self
            .lock()
            .events
            .values()
            .filter(|e| {
                e.user_id.as_deref() == Some(user_id)
                    && e.pub_id.as_deref() == Some(pub_id)
                    && e.date_key.as_deref() == Some(date_key)
            })
            .cloned()
            .collect())
    }

    async fn scan_events(&self, after: Option<&str>, limit: usize) -> Result<Vec<CheckInEvent>> {
        self.simulate_latency().await;
        Ok(self
            .lock()
            .events
            .values()
            .filter(|e| after.map_or(true, |after| e.id.as_str() > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_pub(&self, pub_id: &str) -> Result<Option<Pub>> {
        self.simulate_latency().await;
        Ok(self.lock().pubs.get(pub_id).cloned())
    }

    async fn get_unverified_pub_count(&self, uid: &str) -> Result<i64> {
        self.simulate_latency().await;
        let inner = self.lock();
        let user = inner
            .users
            .get(uid)
            .ok_or_else(|| Error::NotFound(format!("user {}", uid)))?;
        Ok(user.aggregate.unverified_pub_count.unwrap_or(0))
    }

    async fn put_aggregate(&self, stats: &UserStats) -> Result<()> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(transient("put_aggregate"));
        }
        let user = inner
            .users
            .get_mut(&stats.user_id)
            .ok_or_else(|| Error::NotFound(format!("user {}", stats.user_id)))?;
        user.aggregate.total_points = Some(stats.total_points);
        user.aggregate.verified_pub_count = Some(stats.verified_pub_count);
        user.aggregate.total_pub_count = Some(stats.total_pub_count);
        user.aggregate.last_stats_update = Some(stats.last_calculated_at);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn init_user_profile(
        &self,
        uid: &str,
        aggregate: &StoredAggregate,
        real_user: bool,
    ) -> Result<()> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(transient("init_user_profile"));
        }
        let user = inner
            .users
            .get_mut(uid)
            .ok_or_else(|| Error::NotFound(format!("user {}", uid)))?;
        user.aggregate = aggregate.clone();
        user.real_user = Some(real_user);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_audit {
            return Err(transient("append_audit"));
        }
        inner.audit.push(entry.clone());
        Ok(())
    }
}
