//! Stats Calculator
//!
//! Recomputes a user's aggregate from the check-in log. Never writes; the
//! repair executor owns persistence.
//!
//! # Derivation
//! - `verifiedPubCount`: number of distinct `pubId` values
//! - `totalPoints`: sum of `pointsEarned`, missing values count as zero
//! - `unverifiedPubCount`: read from the verification subsystem, not derived
//! - `totalPubCount`: verified + unverified

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_common::models::{CheckInEvent, UserStats};
use tally_common::{DataStore, Result};
use tracing::debug;

#[derive(Clone)]
pub struct StatsCalculator {
    store: Arc<dyn DataStore>,
}

impl StatsCalculator {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Recompute the aggregate for `user_id` from the current log snapshot
    ///
    /// Fails if the log read fails or the user record does not exist; the
    /// caller decides whether to retry.
    pub async fn calculate(&self, user_id: &str) -> Result<UserStats> {
        let events = self.store.query_events_by_user(user_id).await?;
        let unverified = self.store.get_unverified_pub_count(user_id).await?;

        let stats = fold_events(user_id, &events, unverified, Utc::now());
        debug!(
            user_id,
            events = events.len(),
            total_points = stats.total_points,
            verified_pub_count = stats.verified_pub_count,
            "Recalculated user stats"
        );
        Ok(stats)
    }
}

/// Fold a user's events into an aggregate
pub fn fold_events(
    user_id: &str,
    events: &[CheckInEvent],
    unverified_pub_count: i64,
    at: DateTime<Utc>,
) -> UserStats {
    let distinct_pubs: HashSet<&str> = events
        .iter()
        .filter_map(|e| e.pub_id.as_deref())
        .filter(|id| !id.is_empty())
        .collect();
    let total_points = events
        .iter()
        .map(CheckInEvent::points)
        .fold(0i64, i64::saturating_add);
    let verified_pub_count = distinct_pubs.len() as i64;

    UserStats {
        user_id: user_id.to_string(),
        total_points,
        verified_pub_count,
        unverified_pub_count,
        total_pub_count: verified_pub_count.saturating_add(unverified_pub_count),
        last_calculated_at: at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_common::models::UserRecord;
    use tally_common::MemoryStore;

    fn event(id: &str, pub_id: &str, points: i64) -> CheckInEvent {
        CheckInEvent::new(id, "u1", pub_id, Utc::now()).with_points(points)
    }

    #[test]
    fn test_fold_sums_points_and_counts_distinct_pubs() {
        let events = vec![event("c1", "A", 10), event("c2", "A", 5), event("c3", "B", 20)];
        let stats = fold_events("u1", &events, 0, Utc::now());
        assert_eq!(stats.total_points, 35);
        assert_eq!(stats.verified_pub_count, 2);
        assert_eq!(stats.total_pub_count, 2);
    }

    #[test]
    fn test_fold_treats_missing_points_as_zero() {
        let mut no_points = event("c1", "A", 0);
        no_points.points_earned = None;
        let mut no_pub = event("c2", "B", 7);
        no_pub.pub_id = None;

        let stats = fold_events("u1", &[no_points, no_pub], 0, Utc::now());
        assert_eq!(stats.total_points, 7);
        assert_eq!(stats.verified_pub_count, 1);
    }

    #[test]
    fn test_fold_total_includes_unverified() {
        let stats = fold_events("u1", &[event("c1", "A", 1)], 3, Utc::now());
        assert_eq!(stats.unverified_pub_count, 3);
        assert_eq!(stats.total_pub_count, stats.verified_pub_count + stats.unverified_pub_count);
        assert_eq!(stats.total_pub_count, 4);
    }

    #[test]
    fn test_fold_empty_log() {
        let stats = fold_events("u1", &[], 0, Utc::now());
        assert_eq!(stats.total_points, 0);
        assert_eq!(stats.verified_pub_count, 0);
        assert_eq!(stats.total_pub_count, 0);
    }

    #[test]
    fn test_fold_saturates_extreme_points() {
        let events = vec![event("c1", "A", i64::MAX), event("c2", "B", i64::MAX)];
        let stats = fold_events("u1", &events, i64::MAX, Utc::now());
        assert_eq!(stats.total_points, i64::MAX);
        assert_eq!(stats.total_pub_count, i64::MAX);
    }

    #[tokio::test]
    async fn test_calculate_reads_log_and_unverified_count() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(UserRecord::new("u1"));
        store.set_unverified_pub_count("u1", 2);
        store.insert_event(event("c1", "A", 10));
        store.insert_event(event("c2", "B", 4));
        store.insert_event(CheckInEvent::new("c3", "u2", "A", Utc::now()).with_points(99));

        let calculator = StatsCalculator::new(store.clone());
        let stats = calculator.calculate("u1").await.unwrap();
        assert_eq!(stats.total_points, 14);
        assert_eq!(stats.verified_pub_count, 2);
        assert_eq!(stats.total_pub_count, 4);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_calculate_propagates_fetch_error() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(UserRecord::new("u1"));
        store.fail_event_reads_for("u1");

        let calculator = StatsCalculator::new(store);
        let err = calculator.calculate("u1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_calculate_missing_user() {
        let store = Arc::new(MemoryStore::new());
        let calculator = StatsCalculator::new(store);
        assert!(calculator.calculate("ghost").await.unwrap_err().is_not_found());
    }
}
