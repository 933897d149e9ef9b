//! Data model shared by the stats services
//!
//! Check-in events are owned by the ingestion subsystem and are read-only here.
//! The aggregate fields embedded in a user record are owned by this workspace
//! and are only ever overwritten wholesale by the repair path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::date_key_for;

/// Points awarded for a single check-in, as computed by the points subsystem
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsBreakdown {
    pub base: i64,
    pub distance: i64,
    pub bonus: i64,
    pub multiplier: f64,
    pub total: i64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_quality: Option<f64>,
}

/// Immutable record of one pub visit
///
/// Documents come from a schemaless store, so every field the validator checks
/// for presence is optional here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInEvent {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub pub_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Calendar day of the visit, `YYYY-MM-DD`
    #[serde(default)]
    pub date_key: Option<String>,
    #[serde(default)]
    pub points_earned: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_breakdown: Option<PointsBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carpet_image_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub made_user_landlord: Option<bool>,
}

impl CheckInEvent {
    /// Build a well-formed event; `date_key` is derived from `timestamp` (UTC).
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        pub_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: Some(user_id.into()),
            pub_id: Some(pub_id.into()),
            timestamp: Some(timestamp),
            date_key: Some(date_key_for(&timestamp)),
            points_earned: None,
            points_breakdown: None,
            carpet_image_key: None,
            made_user_landlord: None,
        }
    }

    pub fn with_points(mut self, points: i64) -> Self {
        self.points_earned = Some(points);
        self
    }

    pub fn with_date_key(mut self, date_key: impl Into<String>) -> Self {
        self.date_key = Some(date_key.into());
        self
    }

    /// Points for aggregation; a missing value counts as zero.
    pub fn points(&self) -> i64 {
        self.points_earned.unwrap_or(0)
    }
}

/// Aggregate fields as they are stored on the user record
///
/// `None` means the field was never written, which is what distinguishes an
/// uninitialized aggregate from a zeroed one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAggregate {
    #[serde(default)]
    pub total_points: Option<i64>,
    #[serde(default)]
    pub verified_pub_count: Option<i64>,
    /// Owned by the pub verification subsystem; read but never derived here
    #[serde(default)]
    pub unverified_pub_count: Option<i64>,
    #[serde(default)]
    pub total_pub_count: Option<i64>,
    #[serde(default)]
    pub badge_count: Option<i64>,
    #[serde(default)]
    pub landlord_count: Option<i64>,
    #[serde(default)]
    pub verified_pubs_claimed: Option<Vec<String>>,
    #[serde(default)]
    pub unverified_pubs_claimed: Option<Vec<String>>,
    #[serde(default)]
    pub badge_ids: Option<Vec<String>>,
    #[serde(default)]
    pub landlord_pub_ids: Option<Vec<String>>,
    #[serde(default)]
    pub last_stats_update: Option<DateTime<Utc>>,
}

impl StoredAggregate {
    /// Zero state written when a user record is created
    pub fn canonical() -> Self {
        Self {
            total_points: Some(0),
            verified_pub_count: Some(0),
            unverified_pub_count: Some(0),
            total_pub_count: Some(0),
            badge_count: Some(0),
            landlord_count: Some(0),
            verified_pubs_claimed: Some(Vec::new()),
            unverified_pubs_claimed: Some(Vec::new()),
            badge_ids: Some(Vec::new()),
            landlord_pub_ids: Some(Vec::new()),
            last_stats_update: None,
        }
    }

    /// True when every counter and id list equals the canonical default.
    /// `last_stats_update` is not compared.
    pub fn is_canonical(&self) -> bool {
        let canonical = Self::canonical();
        self.total_points == canonical.total_points
            && self.verified_pub_count == canonical.verified_pub_count
            && self.unverified_pub_count == canonical.unverified_pub_count
            && self.total_pub_count == canonical.total_pub_count
            && self.badge_count == canonical.badge_count
            && self.landlord_count == canonical.landlord_count
            && self.verified_pubs_claimed == canonical.verified_pubs_claimed
            && self.unverified_pubs_claimed == canonical.unverified_pubs_claimed
            && self.badge_ids == canonical.badge_ids
            && self.landlord_pub_ids == canonical.landlord_pub_ids
    }

    pub fn is_initialized(&self) -> bool {
        self.total_points.is_some()
            && self.verified_pub_count.is_some()
            && self.total_pub_count.is_some()
    }

    /// Stored values with missing counters read as zero
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_points: self.total_points.unwrap_or(0),
            verified_pub_count: self.verified_pub_count.unwrap_or(0),
            unverified_pub_count: self.unverified_pub_count.unwrap_or(0),
            total_pub_count: self.total_pub_count.unwrap_or(0),
            badge_count: self.badge_count.unwrap_or(0),
            landlord_count: self.landlord_count.unwrap_or(0),
            last_stats_update: self.last_stats_update,
        }
    }

    /// Classify the stored aggregate against a fresh recomputation
    pub fn status_against(&self, correct: &UserStats) -> AggregateStatus {
        if !self.is_initialized() {
            return AggregateStatus::Uninitialized;
        }
        if correct.matches(&self.snapshot()) {
            AggregateStatus::Consistent
        } else {
            AggregateStatus::Drifted
        }
    }
}

/// Per-user aggregate lifecycle; `Drifted -> Consistent` only via repair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Uninitialized,
    Consistent,
    Drifted,
}

/// Read view of the stored counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_points: i64,
    pub verified_pub_count: i64,
    pub unverified_pub_count: i64,
    pub total_pub_count: i64,
    pub badge_count: i64,
    pub landlord_count: i64,
    pub last_stats_update: Option<DateTime<Utc>>,
}

/// Aggregate recomputed from the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub user_id: String,
    pub total_points: i64,
    pub verified_pub_count: i64,
    pub unverified_pub_count: i64,
    pub total_pub_count: i64,
    pub last_calculated_at: DateTime<Utc>,
}

impl UserStats {
    /// Compare the derived counters, ignoring timestamps and counters not
    /// derived from the log.
    pub fn matches(&self, stored: &StatsSnapshot) -> bool {
        self.total_points == stored.total_points
            && self.verified_pub_count == stored.verified_pub_count
            && self.total_pub_count == stored.total_pub_count
    }

    /// Same derived counters, regardless of when they were computed
    pub fn same_counts(&self, other: &UserStats) -> bool {
        self.user_id == other.user_id
            && self.total_points == other.total_points
            && self.verified_pub_count == other.verified_pub_count
            && self.unverified_pub_count == other.unverified_pub_count
            && self.total_pub_count == other.total_pub_count
    }
}

/// User document: externally owned identity fields plus the aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub uid: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_anonymous: Option<bool>,
    /// Set by the user-created trigger as `!is_anonymous`
    #[serde(default)]
    pub real_user: Option<bool>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub aggregate: StoredAggregate,
}

impl UserRecord {
    /// Fresh record with an uninitialized aggregate
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: None,
            is_anonymous: None,
            real_user: None,
            created_at: Some(Utc::now()),
            aggregate: StoredAggregate::default(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn anonymous(mut self, is_anonymous: bool) -> Self {
        self.is_anonymous = Some(is_anonymous);
        self
    }

    pub fn with_aggregate(mut self, aggregate: StoredAggregate) -> Self {
        self.aggregate = aggregate;
        self
    }

    /// Real (non-anonymous) user. Falls back to the anonymous flag when the
    /// user-created trigger has not stamped `real_user` yet.
    pub fn is_real(&self) -> bool {
        self.real_user
            .unwrap_or_else(|| !self.is_anonymous.unwrap_or(false))
    }
}

/// Pub reference; only existence matters here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pub {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Pub {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// Cursor-style page request over user records, ordered by uid
#[derive(Debug, Clone, Default)]
pub struct UserPage {
    pub after: Option<String>,
    pub limit: usize,
    pub real_users_only: bool,
}

/// Audit record category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    TriggerFailure,
    EventValidation,
    Inconsistency,
    UserCreated,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::TriggerFailure => "trigger_failure",
            AuditKind::EventValidation => "event_validation",
            AuditKind::Inconsistency => "inconsistency",
            AuditKind::UserCreated => "user_created",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trigger_failure" => Some(AuditKind::TriggerFailure),
            "event_validation" => Some(AuditKind::EventValidation),
            "inconsistency" => Some(AuditKind::Inconsistency),
            "user_created" => Some(AuditKind::UserCreated),
            _ => None,
        }
    }
}

/// Write-only audit sink record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub kind: AuditKind,
    /// Component that produced the entry, e.g. `on_check_in_created`
    pub source: String,
    pub user_id: Option<String>,
    pub message: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(kind: AuditKind, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source: source.into(),
            user_id: None,
            message: message.into(),
            details: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stats(points: i64, verified: i64, unverified: i64) -> UserStats {
        UserStats {
            user_id: "u1".to_string(),
            total_points: points,
            verified_pub_count: verified,
            unverified_pub_count: unverified,
            total_pub_count: verified + unverified,
            last_calculated_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_event_derives_date_key() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 0).unwrap();
        let event = CheckInEvent::new("c1", "u1", "p1", ts);
        assert_eq!(event.date_key.as_deref(), Some("2026-03-09"));
        assert_eq!(event.points(), 0);
        assert_eq!(event.with_points(12).points(), 12);
    }

    #[test]
    fn test_canonical_aggregate() {
        let canonical = StoredAggregate::canonical();
        assert!(canonical.is_canonical());
        assert!(canonical.is_initialized());
        assert!(!StoredAggregate::default().is_canonical());

        let mut drifted = StoredAggregate::canonical();
        drifted.badge_ids = Some(vec!["b1".to_string()]);
        assert!(!drifted.is_canonical());
    }

    #[test]
    fn test_status_against_recomputed_stats() {
        assert_eq!(
            StoredAggregate::default().status_against(&stats(0, 0, 0)),
            AggregateStatus::Uninitialized
        );
        assert_eq!(
            StoredAggregate::canonical().status_against(&stats(0, 0, 0)),
            AggregateStatus::Consistent
        );
        assert_eq!(
            StoredAggregate::canonical().status_against(&stats(10, 1, 0)),
            AggregateStatus::Drifted
        );
    }

    #[test]
    fn test_is_real_falls_back_to_anonymous_flag() {
        assert!(UserRecord::new("u1").is_real());
        assert!(!UserRecord::new("u1").anonymous(true).is_real());

        let mut stamped = UserRecord::new("u1").anonymous(true);
        stamped.real_user = Some(true);
        assert!(stamped.is_real());
    }

    #[test]
    fn test_user_record_json_flattens_aggregate() {
        let json = serde_json::json!({
            "uid": "u1",
            "isAnonymous": false,
            "totalPoints": 50,
            "verifiedPubCount": 2
        });
        let record: UserRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.aggregate.total_points, Some(50));
        assert_eq!(record.aggregate.verified_pub_count, Some(2));
        assert_eq!(record.aggregate.total_pub_count, None);
        assert!(record.is_real());
    }
}
