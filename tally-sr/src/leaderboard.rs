//! Leaderboard Query Service
//!
//! Read-only ranking over stored aggregates (all-time) and over the current
//! month's slice of the log, computed on demand. Never writes.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_common::models::{CheckInEvent, UserPage, UserRecord};
use tally_common::time::{month_label, month_range};
use tally_common::{DataStore, Error, Result};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Period {
    Monthly,
    AllTime,
    #[default]
    Both,
}

impl Period {
    fn includes_monthly(self) -> bool {
        matches!(self, Period::Monthly | Period::Both)
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "monthly" => Ok(Period::Monthly),
            "all-time" => Ok(Period::AllTime),
            "both" => Ok(Period::Both),
            other => Err(Error::InvalidInput(format!(
                "period must be monthly, all-time or both (got {})",
                other
            ))),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Period::Monthly => "monthly",
            Period::AllTime => "all-time",
            Period::Both => "both",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    TotalPoints,
    MonthlyPoints,
    VerifiedPubCount,
    TotalPubCount,
    MonthlyPubs,
}

impl SortKey {
    fn is_monthly(self) -> bool {
        matches!(self, SortKey::MonthlyPoints | SortKey::MonthlyPubs)
    }
}

impl FromStr for SortKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "totalPoints" => Ok(SortKey::TotalPoints),
            "monthlyPoints" => Ok(SortKey::MonthlyPoints),
            "verifiedPubCount" => Ok(SortKey::VerifiedPubCount),
            "totalPubCount" => Ok(SortKey::TotalPubCount),
            "monthlyPubs" => Ok(SortKey::MonthlyPubs),
            other => Err(Error::InvalidInput(format!("unknown sortBy: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LeaderboardQuery {
    /// Single-user lookup instead of a ranked board
    pub user_id: Option<String>,
    pub real_users_only: bool,
    pub period: Period,
    /// Requested cap; clamped to `[1, max]`, default applied when absent
    pub limit: Option<usize>,
    /// Defaults to `monthlyPoints` for the monthly period, else `totalPoints`
    pub sort_by: Option<SortKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub total_points: i64,
    pub verified_pub_count: i64,
    pub total_pub_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_points: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_pubs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_check_ins: Option<usize>,
}

impl LeaderboardEntry {
    fn from_user(user: &UserRecord) -> Self {
        let stored = user.aggregate.snapshot();
        Self {
            rank: None,
            user_id: user.uid.clone(),
            display_name: user.display_name.clone(),
            total_points: stored.total_points,
            verified_pub_count: stored.verified_pub_count,
            total_pub_count: stored.total_pub_count,
            monthly_points: None,
            monthly_pubs: None,
            monthly_check_ins: None,
        }
    }

    fn with_monthly(mut self, monthly: &MonthlyTotals) -> Self {
        self.monthly_points = Some(monthly.points);
        self.monthly_pubs = Some(monthly.pubs.len() as i64);
        self.monthly_check_ins = Some(monthly.check_ins);
        self
    }

    fn sort_value(&self, key: SortKey) -> i64 {
        match key {
            SortKey::TotalPoints => self.total_points,
            SortKey::MonthlyPoints => self.monthly_points.unwrap_or(0),
            SortKey::VerifiedPubCount => self.verified_pub_count,
            SortKey::TotalPubCount => self.total_pub_count,
            SortKey::MonthlyPubs => self.monthly_pubs.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardMetadata {
    pub period: Period,
    pub sort_by: SortKey,
    pub limit: usize,
    pub total_users: usize,
    pub returned: usize,
    /// `YYYY-MM` of the monthly window
    pub month: String,
    pub real_users_only: bool,
    pub monthly_available: bool,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Leaderboard {
    pub users: Vec<LeaderboardEntry>,
    pub metadata: LeaderboardMetadata,
}

#[derive(Debug, Default)]
struct MonthlyTotals {
    points: i64,
    pubs: HashSet<String>,
    check_ins: usize,
}

impl MonthlyTotals {
    fn add(&mut self, event: &CheckInEvent) {
        self.points += event.points();
        if let Some(pub_id) = event.pub_id.as_deref().filter(|id| !id.is_empty()) {
            self.pubs.insert(pub_id.to_string());
        }
        self.check_ins += 1;
    }
}

#[derive(Clone)]
pub struct LeaderboardService {
    store: Arc<dyn DataStore>,
    page_size: usize,
    default_limit: usize,
    max_limit: usize,
}

impl LeaderboardService {
    pub fn new(
        store: Arc<dyn DataStore>,
        page_size: usize,
        default_limit: usize,
        max_limit: usize,
    ) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            default_limit,
            max_limit: max_limit.max(1),
        }
    }

    pub async fn query(&self, query: &LeaderboardQuery) -> Result<Leaderboard> {
        self.query_at(query, Utc::now()).await
    }

    /// Build the board as of `now`; the monthly window is the calendar month
    /// of `now`.
    pub async fn query_at(&self, query: &LeaderboardQuery, now: DateTime<Utc>) -> Result<Leaderboard> {
        let limit = query
            .limit
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit);
        let requested_sort = query.sort_by.unwrap_or(match query.period {
            Period::Monthly => SortKey::MonthlyPoints,
            _ => SortKey::TotalPoints,
        });
        let wants_monthly = query.period.includes_monthly() || requested_sort.is_monthly();

        let (mut users, monthly_available) = match query.user_id.as_deref() {
            Some(uid) => self.single_user(uid, wants_monthly, &now).await?,
            None => self.all_users(query.real_users_only, wants_monthly, &now).await?,
        };

        // Without monthly data a monthly key would rank everyone equal
        let sort_by = if requested_sort.is_monthly() && !monthly_available {
            SortKey::TotalPoints
        } else {
            requested_sort
        };

        let total_users = users.len();
        if query.user_id.is_none() {
            users.sort_by(|a, b| {
                b.sort_value(sort_by)
                    .cmp(&a.sort_value(sort_by))
                    .then_with(|| b.total_points.cmp(&a.total_points))
                    .then_with(|| a.user_id.cmp(&b.user_id))
            });
            users.truncate(limit);
            for (i, entry) in users.iter_mut().enumerate() {
                entry.rank = Some(i + 1);
            }
        }

        debug!(
            period = %query.period,
            ?sort_by,
            total_users,
            returned = users.len(),
            "Built leaderboard"
        );

        Ok(Leaderboard {
            metadata: LeaderboardMetadata {
                period: query.period,
                sort_by,
                limit,
                total_users,
                returned: users.len(),
                month: month_label(&now),
                real_users_only: query.real_users_only,
                monthly_available,
                generated_at: Utc::now(),
            },
            users,
        })
    }

    async fn single_user(
        &self,
        uid: &str,
        wants_monthly: bool,
        now: &DateTime<Utc>,
    ) -> Result<(Vec<LeaderboardEntry>, bool)> {
        let user = self
            .store
            .get_user(uid)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", uid)))?;
        let entry = LeaderboardEntry::from_user(&user);
        if !wants_monthly {
            return Ok((vec![entry], false));
        }

        let (start, end) = month_range(now);
        match self.store.query_events_by_user(uid).await {
            Ok(events) => {
                let mut monthly = MonthlyTotals::default();
                events
                    .iter()
                    .filter(|e| {
                        e.date_key
                            .as_deref()
                            .map_or(false, |key| key >= start.as_str() && key <= end.as_str())
                    })
                    .for_each(|e| monthly.add(e));
                Ok((vec![entry.with_monthly(&monthly)], true))
            }
            Err(e) => {
                warn!(user_id = uid, error = %e, "Monthly stats unavailable for user");
                Ok((vec![entry], false))
            }
        }
    }

    async fn all_users(
        &self,
        real_users_only: bool,
        wants_monthly: bool,
        now: &DateTime<Utc>,
    ) -> Result<(Vec<LeaderboardEntry>, bool)> {
        let users = self.list_all_users(real_users_only).await?;

        let monthly = if wants_monthly {
            self.monthly_totals(now).await
        } else {
            None
        };
        let monthly_available = monthly.is_some();
        let empty = MonthlyTotals::default();

        let entries = users
            .iter()
            .map(|user| {
                let entry = LeaderboardEntry::from_user(user);
                match &monthly {
                    Some(totals) => entry.with_monthly(totals.get(&user.uid).unwrap_or(&empty)),
                    None => entry,
                }
            })
            .collect();
        Ok((entries, monthly_available))
    }

    async fn list_all_users(&self, real_users_only: bool) -> Result<Vec<UserRecord>> {
        let mut users = Vec::new();
        let mut after = None;
        loop {
            let page = UserPage {
                after,
                limit: self.page_size,
                real_users_only,
            };
            let batch = self.store.list_users(&page).await?;
            let exhausted = batch.len() < self.page_size;
            after = batch.last().map(|u| u.uid.clone());
            users.extend(batch);
            if exhausted || after.is_none() {
                return Ok(users);
            }
        }
    }

    /// Per-user totals for the month of `now`; `None` when the scan fails
    async fn monthly_totals(&self, now: &DateTime<Utc>) -> Option<HashMap<String, MonthlyTotals>> {
        let (start, end) = month_range(now);
        let events = match self.store.query_events_by_date_range(&start, &end).await {
            Ok(events) => events,
            Err(e) => {
                warn!(month = %month_label(now), error = %e, "Monthly scan failed, serving all-time board only");
                return None;
            }
        };

        let mut totals: HashMap<String, MonthlyTotals> = HashMap::new();
        for event in &events {
            match event.user_id.as_deref().filter(|uid| !uid.is_empty()) {
                Some(uid) => totals.entry(uid.to_string()).or_default().add(event),
                None => warn!(event_id = %event.id, "Check-in without userId skipped"),
            }
        }
        Some(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tally_common::models::StoredAggregate;
    use tally_common::MemoryStore;

    fn user(uid: &str, points: i64, verified: i64) -> UserRecord {
        UserRecord::new(uid).with_aggregate(StoredAggregate {
            total_points: Some(points),
            verified_pub_count: Some(verified),
            total_pub_count: Some(verified),
            ..StoredAggregate::canonical()
        })
    }

    fn service(store: Arc<MemoryStore>) -> LeaderboardService {
        LeaderboardService::new(store, 2, 100, 500)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_period_and_sort_key() {
        assert_eq!("all-time".parse::<Period>().unwrap(), Period::AllTime);
        assert!("weekly".parse::<Period>().is_err());
        assert_eq!("monthlyPubs".parse::<SortKey>().unwrap(), SortKey::MonthlyPubs);
        assert!("points".parse::<SortKey>().is_err());
    }

    #[tokio::test]
    async fn test_all_time_ranking_with_tie_breaks() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user("b", 30, 3));
        store.insert_user(user("a", 30, 1));
        store.insert_user(user("c", 90, 2));

        let query = LeaderboardQuery {
            period: Period::AllTime,
            ..Default::default()
        };
        let board = service(store).query_at(&query, now()).await.unwrap();
        let order: Vec<_> = board.users.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        assert_eq!(board.users[0].rank, Some(1));
        assert_eq!(board.users[2].rank, Some(3));
        assert!(board.users[0].monthly_points.is_none());
        assert_eq!(board.metadata.sort_by, SortKey::TotalPoints);
        assert_eq!(board.metadata.total_users, 3);
    }

    #[tokio::test]
    async fn test_monthly_window_excludes_other_months() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user("x", 10, 1));
        let april = Utc.with_ymd_and_hms(2026, 4, 30, 23, 0, 0).unwrap();
        let may = Utc.with_ymd_and_hms(2026, 5, 31, 22, 0, 0).unwrap();
        store.insert_event(CheckInEvent::new("c1", "x", "p1", april).with_points(100));
        store.insert_event(CheckInEvent::new("c2", "x", "p1", may).with_points(4));
        store.insert_event(CheckInEvent::new("c3", "x", "p2", may).with_points(6));

        let board = service(store)
            .query_at(&LeaderboardQuery::default(), now())
            .await
            .unwrap();
        let entry = &board.users[0];
        assert_eq!(entry.monthly_points, Some(10));
        assert_eq!(entry.monthly_pubs, Some(2));
        assert_eq!(entry.monthly_check_ins, Some(2));
        assert_eq!(board.metadata.month, "2026-05");
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store.insert_user(user(&format!("u{}", i), i, 0));
        }
        let svc = service(store);

        let query = LeaderboardQuery {
            limit: Some(0),
            ..Default::default()
        };
        let board = svc.query_at(&query, now()).await.unwrap();
        assert_eq!(board.users.len(), 1);
        assert_eq!(board.metadata.limit, 1);

        let query = LeaderboardQuery {
            limit: Some(10_000),
            ..Default::default()
        };
        let board = svc.query_at(&query, now()).await.unwrap();
        assert_eq!(board.metadata.limit, 500);
        assert_eq!(board.users.len(), 5);
    }

    #[tokio::test]
    async fn test_real_users_only_filters_anonymous() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user("real", 5, 1));
        store.insert_user(user("anon", 50, 1).anonymous(true));

        let query = LeaderboardQuery {
            real_users_only: true,
            ..Default::default()
        };
        let board = service(store).query_at(&query, now()).await.unwrap();
        assert_eq!(board.users.len(), 1);
        assert_eq!(board.users[0].user_id, "real");
    }

    #[tokio::test]
    async fn test_monthly_scan_failure_degrades() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user("a", 5, 1));
        store.insert_user(user("b", 9, 1));
        store.fail_date_range_reads(true);

        let query = LeaderboardQuery {
            period: Period::Monthly,
            ..Default::default()
        };
        let board = service(store).query_at(&query, now()).await.unwrap();
        assert!(!board.metadata.monthly_available);
        assert_eq!(board.metadata.sort_by, SortKey::TotalPoints);
        assert_eq!(board.users[0].user_id, "b");
        assert!(board.users[0].monthly_points.is_none());
    }

    #[tokio::test]
    async fn test_single_user_lookup() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user("a", 25, 2).with_display_name("Ada"));
        store.insert_event(CheckInEvent::new("c1", "a", "p1", now()).with_points(25));

        let svc = service(store);
        let query = LeaderboardQuery {
            user_id: Some("a".to_string()),
            ..Default::default()
        };
        let board = svc.query_at(&query, now()).await.unwrap();
        assert_eq!(board.users.len(), 1);
        assert_eq!(board.users[0].display_name.as_deref(), Some("Ada"));
        assert_eq!(board.users[0].monthly_points, Some(25));

        let query = LeaderboardQuery {
            user_id: Some("ghost".to_string()),
            ..Default::default()
        };
        assert!(svc.query_at(&query, now()).await.unwrap_err().is_not_found());
    }
}
