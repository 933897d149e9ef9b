//! Consistency Validator
//!
//! Three independent checks:
//! 1. [`ConsistencyValidator::validate`]: stored aggregate vs. recomputation
//! 2. [`ConsistencyValidator::find_inconsistencies`]: impossible states, each
//!    paired with a remediation suggestion
//! 3. [`ConsistencyValidator::validate_event`]: per-event checks at ingestion
//!
//! Duplicate detection in (3) runs after the event is already in the log, so
//! it flags duplicates rather than preventing them.

use std::sync::Arc;

use serde::Serialize;
use tally_common::models::{AggregateStatus, CheckInEvent, StatsSnapshot, UserStats};
use tally_common::time::{date_key_for, parse_date_key};
use tally_common::{DataStore, Error, Result};
use tracing::debug;

use super::calculator::{fold_events, StatsCalculator};
use super::findings::{Discrepancy, EventFinding, Finding, Severity};

/// Stored vs. recomputed aggregate for one user
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub user_id: String,
    pub is_valid: bool,
    pub status: AggregateStatus,
    pub discrepancies: Vec<String>,
    pub findings: Vec<Discrepancy>,
    pub current_stats: StatsSnapshot,
    pub correct_stats: UserStats,
}

/// Result of the impossible-state check
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inconsistency {
    pub has_inconsistencies: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub findings: Vec<Finding>,
}

impl Inconsistency {
    fn from_findings(findings: Vec<Finding>) -> Self {
        Self {
            has_inconsistencies: !findings.is_empty(),
            issues: findings.iter().map(ToString::to_string).collect(),
            suggestions: findings.iter().map(Finding::suggestion).collect(),
            findings,
        }
    }
}

/// Outcome of validating one check-in event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventValidation {
    pub event_id: String,
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub findings: Vec<EventFinding>,
}

impl EventValidation {
    fn from_findings(event_id: &str, findings: Vec<EventFinding>) -> Self {
        let (errors, warnings): (Vec<&EventFinding>, Vec<&EventFinding>) = findings
            .iter()
            .partition(|f| f.severity() == Severity::Error);
        Self {
            event_id: event_id.to_string(),
            is_valid: errors.is_empty(),
            errors: errors.iter().map(|f| f.to_string()).collect(),
            warnings: warnings.iter().map(|f| f.to_string()).collect(),
            findings,
        }
    }

    pub fn has(&self, predicate: impl Fn(&EventFinding) -> bool) -> bool {
        self.findings.iter().any(predicate)
    }
}

#[derive(Clone)]
pub struct ConsistencyValidator {
    store: Arc<dyn DataStore>,
    calculator: StatsCalculator,
    /// Points above this on one check-in produce a warning
    high_points_threshold: i64,
}

impl ConsistencyValidator {
    pub fn new(
        store: Arc<dyn DataStore>,
        calculator: StatsCalculator,
        high_points_threshold: i64,
    ) -> Self {
        Self {
            store,
            calculator,
            high_points_threshold,
        }
    }

    /// Compare the stored aggregate against a fresh recomputation
    ///
    /// `isValid` holds exactly when there are no discrepancies on the compared
    /// fields (`totalPoints`, `verifiedPubCount`, `totalPubCount`).
    pub async fn validate(&self, user_id: &str) -> Result<ValidationReport> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;

        let correct = self.calculator.calculate(user_id).await?;
        let current = user.aggregate.snapshot();

        let mut findings = Vec::new();
        if current.total_points != correct.total_points {
            findings.push(Discrepancy::PointsMismatch {
                stored: current.total_points,
                actual: correct.total_points,
            });
        }
        if current.verified_pub_count != correct.verified_pub_count {
            findings.push(Discrepancy::VerifiedPubCountMismatch {
                stored: current.verified_pub_count,
                actual: correct.verified_pub_count,
            });
        }
        if current.total_pub_count != correct.total_pub_count {
            findings.push(Discrepancy::TotalPubCountMismatch {
                stored: current.total_pub_count,
                actual: correct.total_pub_count,
            });
        }

        debug!(user_id, discrepancies = findings.len(), "Validated user stats");

        Ok(ValidationReport {
            user_id: user_id.to_string(),
            is_valid: findings.is_empty(),
            status: user.aggregate.status_against(&correct),
            discrepancies: findings.iter().map(ToString::to_string).collect(),
            findings,
            current_stats: current,
            correct_stats: correct,
        })
    }

    /// Detect impossible aggregate states for a user
    pub async fn find_inconsistencies(&self, user_id: &str) -> Result<Inconsistency> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;
        let events = self.store.query_events_by_user(user_id).await?;

        let stored = user.aggregate.snapshot();
        let recomputed = fold_events(
            user_id,
            &events,
            stored.unverified_pub_count,
            chrono::Utc::now(),
        );

        let mut findings = Vec::new();
        if events.is_empty() {
            if stored.total_points != 0 {
                findings.push(Finding::PointsWithoutCheckIns {
                    points: stored.total_points,
                });
            }
            if stored.verified_pub_count != 0 {
                findings.push(Finding::PubsWithoutCheckIns {
                    count: stored.verified_pub_count,
                });
            }
        } else {
            if stored.verified_pub_count != recomputed.verified_pub_count {
                findings.push(Finding::VerifiedPubCountDrift {
                    stored: stored.verified_pub_count,
                    actual: recomputed.verified_pub_count,
                });
            }
            if stored.total_points != recomputed.total_points {
                findings.push(Finding::PointsDrift {
                    stored: stored.total_points,
                    actual: recomputed.total_points,
                });
            }
        }
        if stored.total_pub_count != stored.verified_pub_count + stored.unverified_pub_count {
            findings.push(Finding::PubCountSumMismatch {
                total: stored.total_pub_count,
                verified: stored.verified_pub_count,
                unverified: stored.unverified_pub_count,
            });
        }

        Ok(Inconsistency::from_findings(findings))
    }

    /// Per-event ingestion checks
    ///
    /// Structural problems (missing fields, dangling references, duplicates,
    /// bad points, date mismatch) are errors; unusually high points is a
    /// warning. Store failures during the reference lookups are returned as
    /// errors of the call itself.
    pub async fn validate_event(&self, event: &CheckInEvent) -> Result<EventValidation> {
        let mut findings = Vec::new();

        let user_id = present(&event.user_id);
        let pub_id = present(&event.pub_id);
        let date_key = present(&event.date_key);

        if user_id.is_none() {
            findings.push(EventFinding::MissingField { field: "userId" });
        }
        if pub_id.is_none() {
            findings.push(EventFinding::MissingField { field: "pubId" });
        }
        if event.timestamp.is_none() {
            findings.push(EventFinding::MissingField { field: "timestamp" });
        }
        if date_key.is_none() {
            findings.push(EventFinding::MissingField { field: "dateKey" });
        }

        if let Some(uid) = user_id {
            if self.store.get_user(uid).await?.is_none() {
                findings.push(EventFinding::UnknownUser {
                    user_id: uid.to_string(),
                });
            }
        }
        if let Some(pid) = pub_id {
            if self.store.get_pub(pid).await?.is_none() {
                findings.push(EventFinding::UnknownPub {
                    pub_id: pid.to_string(),
                });
            }
        }

        if let (Some(uid), Some(pid), Some(key)) = (user_id, pub_id, date_key) {
            let same_visit = self.store.query_events_by_visit(uid, pid, key).await?;
            findings.extend(
                same_visit
                    .into_iter()
                    .filter(|other| other.id != event.id)
                    .map(|other| EventFinding::Duplicate { other_id: other.id }),
            );
        }

        if let Some(points) = event.points_earned {
            if points < 0 {
                findings.push(EventFinding::NegativePoints { points });
            } else if points > self.high_points_threshold {
                findings.push(EventFinding::HighPoints {
                    points,
                    threshold: self.high_points_threshold,
                });
            }
        }

        if let (Some(timestamp), Some(key)) = (event.timestamp.as_ref(), date_key) {
            if parse_date_key(key).is_none() {
                findings.push(EventFinding::UnparseableDateKey {
                    date_key: key.to_string(),
                });
            } else {
                let derived = date_key_for(timestamp);
                if derived != key {
                    findings.push(EventFinding::DateMismatch {
                        date_key: key.to_string(),
                        derived,
                    });
                }
            }
        }

        Ok(EventValidation::from_findings(&event.id, findings))
    }
}

/// Treat empty strings like absent fields
fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|v| !v.trim().is_empty())
}
