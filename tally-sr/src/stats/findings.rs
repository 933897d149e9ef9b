//! Structured validation findings
//!
//! Each finding renders to the human-readable line operators see, while tests
//! and callers match on the variant.

use serde::Serialize;
use std::fmt;

/// Stored aggregate field that disagrees with the recomputed value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Discrepancy {
    PointsMismatch { stored: i64, actual: i64 },
    VerifiedPubCountMismatch { stored: i64, actual: i64 },
    TotalPubCountMismatch { stored: i64, actual: i64 },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::PointsMismatch { stored, actual } => {
                write!(f, "points mismatch: stored={}, actual={}", stored, actual)
            }
            Discrepancy::VerifiedPubCountMismatch { stored, actual } => write!(
                f,
                "verified pub count mismatch: stored={}, actual={}",
                stored, actual
            ),
            Discrepancy::TotalPubCountMismatch { stored, actual } => write!(
                f,
                "total pub count mismatch: stored={}, actual={}",
                stored, actual
            ),
        }
    }
}

/// Impossible or drifted aggregate state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Finding {
    /// Nonzero points but no check-ins at all
    PointsWithoutCheckIns { points: i64 },
    /// Nonzero verified pubs but no check-ins at all
    PubsWithoutCheckIns { count: i64 },
    VerifiedPubCountDrift { stored: i64, actual: i64 },
    PointsDrift { stored: i64, actual: i64 },
    /// Stored total is not verified + unverified
    PubCountSumMismatch {
        total: i64,
        verified: i64,
        unverified: i64,
    },
}

impl Finding {
    /// Remediation to pair with the finding
    pub fn suggestion(&self) -> String {
        match self {
            Finding::PointsWithoutCheckIns { .. } => {
                "Repair the user to reset totalPoints to 0".to_string()
            }
            Finding::PubsWithoutCheckIns { .. } => {
                "Repair the user to reset verifiedPubCount to 0".to_string()
            }
            Finding::VerifiedPubCountDrift { actual, .. } => format!(
                "Repair the user to set verifiedPubCount to {}",
                actual
            ),
            Finding::PointsDrift { actual, .. } => {
                format!("Repair the user to set totalPoints to {}", actual)
            }
            Finding::PubCountSumMismatch {
                verified,
                unverified,
                ..
            } => format!(
                "Repair the user to set totalPubCount to {}",
                verified + unverified
            ),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::PointsWithoutCheckIns { points } => {
                write!(f, "user has {} points but no check-ins", points)
            }
            Finding::PubsWithoutCheckIns { count } => {
                write!(f, "user has {} verified pubs but no check-ins", count)
            }
            Finding::VerifiedPubCountDrift { stored, actual } => write!(
                f,
                "verifiedPubCount is {} but check-ins cover {} distinct pubs",
                stored, actual
            ),
            Finding::PointsDrift { stored, actual } => write!(
                f,
                "totalPoints is {} but check-ins sum to {}",
                stored, actual
            ),
            Finding::PubCountSumMismatch {
                total,
                verified,
                unverified,
            } => write!(
                f,
                "totalPubCount is {} but verified ({}) + unverified ({}) is {}",
                total,
                verified,
                unverified,
                verified + unverified
            ),
        }
    }
}

/// Severity of a per-event finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Problem found with a single check-in event at ingestion time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventFinding {
    MissingField { field: &'static str },
    UnknownUser { user_id: String },
    UnknownPub { pub_id: String },
    /// Another event shares (userId, pubId, dateKey)
    Duplicate { other_id: String },
    NegativePoints { points: i64 },
    HighPoints { points: i64, threshold: i64 },
    DateMismatch { date_key: String, derived: String },
    UnparseableDateKey { date_key: String },
}

impl EventFinding {
    pub fn severity(&self) -> Severity {
        match self {
            EventFinding::HighPoints { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for EventFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFinding::MissingField { field } => write!(f, "missing required field: {}", field),
            EventFinding::UnknownUser { user_id } => write!(f, "user {} does not exist", user_id),
            EventFinding::UnknownPub { pub_id } => write!(f, "pub {} does not exist", pub_id),
            EventFinding::Duplicate { other_id } => write!(
                f,
                "duplicate check-in: event {} has the same user, pub and date",
                other_id
            ),
            EventFinding::NegativePoints { points } => {
                write!(f, "points cannot be negative: {}", points)
            }
            EventFinding::HighPoints { points, threshold } => write!(
                f,
                "unusually high points: {} (threshold {})",
                points, threshold
            ),
            EventFinding::DateMismatch { date_key, derived } => write!(
                f,
                "dateKey {} does not match timestamp date {}",
                date_key, derived
            ),
            EventFinding::UnparseableDateKey { date_key } => {
                write!(f, "dateKey {} is not a valid YYYY-MM-DD date", date_key)
            }
        }
    }
}
