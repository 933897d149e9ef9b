//! POST /validate

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tally_common::models::UserStats;
use tracing::info;

use super::json_body;
use crate::error::{ApiError, ApiResult};
use crate::stats::{Inconsistency, ValidationReport};
use crate::{AppState, Services};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub user_id: Option<String>,
    pub user_ids: Option<Vec<String>>,
    #[serde(default)]
    pub repair: bool,
    #[serde(default = "default_true")]
    pub include_inconsistencies: bool,
}

fn default_true() -> bool {
    true
}

/// Outcome for one requested user; `error` is set instead of failing the
/// whole request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserValidation {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inconsistencies: Option<Inconsistency>,
    pub repaired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repaired_stats: Option<UserStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ValidateSummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub repaired: usize,
    pub errors: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub user_count: usize,
    pub repair: bool,
    pub include_inconsistencies: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub summary: ValidateSummary,
    pub reports: Vec<UserValidation>,
    pub request_info: RequestInfo,
}

impl ValidateRequest {
    /// Exactly one of `userId` / `userIds`, within the configured cap
    fn user_ids(&self, max_users: usize) -> ApiResult<Vec<String>> {
        match (&self.user_id, &self.user_ids) {
            (Some(uid), None) if !uid.is_empty() => Ok(vec![uid.clone()]),
            (Some(_), None) => Err(ApiError::BadRequest("userId must not be empty".to_string())),
            (None, Some(ids)) if ids.is_empty() => {
                Err(ApiError::BadRequest("userIds must not be empty".to_string()))
            }
            (None, Some(ids)) if ids.len() > max_users => Err(ApiError::BadRequest(format!(
                "userIds accepts at most {} users (got {})",
                max_users,
                ids.len()
            ))),
            (None, Some(ids)) => Ok(ids.clone()),
            _ => Err(ApiError::BadRequest(
                "exactly one of userId or userIds is required".to_string(),
            )),
        }
    }
}

/// POST /validate
pub async fn post_validate(
    State(state): State<AppState>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> ApiResult<Json<ValidateResponse>> {
    let request = json_body(payload)?;
    let user_ids = request.user_ids(state.settings.max_validate_users)?;

    let repair = request.repair;
    let include_inconsistencies = request.include_inconsistencies;
    let reports: Vec<UserValidation> = stream::iter(user_ids)
        .map(|uid| {
            let services = state.services.clone();
            async move { validate_user(&services, &uid, repair, include_inconsistencies).await }
        })
        .buffered(state.settings.batch_concurrency.max(1))
        .collect()
        .await;

    let mut summary = ValidateSummary {
        total: reports.len(),
        ..Default::default()
    };
    for entry in &reports {
        match (&entry.error, &entry.report) {
            (Some(_), _) => summary.errors += 1,
            (None, Some(report)) if report.is_valid => summary.valid += 1,
            (None, _) => summary.invalid += 1,
        }
        if entry.repaired {
            summary.repaired += 1;
        }
    }

    info!(
        users = summary.total,
        valid = summary.valid,
        invalid = summary.invalid,
        repaired = summary.repaired,
        errors = summary.errors,
        "Validation request complete"
    );

    Ok(Json(ValidateResponse {
        summary,
        request_info: RequestInfo {
            user_count: reports.len(),
            repair: request.repair,
            include_inconsistencies: request.include_inconsistencies,
            timestamp: Utc::now(),
        },
        reports,
    }))
}

async fn validate_user(
    services: &Services,
    user_id: &str,
    repair: bool,
    include_inconsistencies: bool,
) -> UserValidation {
    let mut outcome = UserValidation {
        user_id: user_id.to_string(),
        report: None,
        inconsistencies: None,
        repaired: false,
        repaired_stats: None,
        error: None,
    };

    let report = match services.validator.validate(user_id).await {
        Ok(report) => report,
        Err(e) => {
            outcome.error = Some(e.to_string());
            return outcome;
        }
    };

    if include_inconsistencies {
        match services.validator.find_inconsistencies(user_id).await {
            Ok(found) => outcome.inconsistencies = Some(found),
            Err(e) => {
                outcome.error = Some(e.to_string());
                outcome.report = Some(report);
                return outcome;
            }
        }
    }

    let needs_repair = !report.is_valid
        || outcome
            .inconsistencies
            .as_ref()
            .map_or(false, |found| found.has_inconsistencies);
    if repair && needs_repair {
        match services.repair.repair(user_id).await {
            Ok(stats) => {
                outcome.repaired = true;
                outcome.repaired_stats = Some(stats);
            }
            Err(e) => outcome.error = Some(format!("repair failed: {}", e)),
        }
    }

    outcome.report = Some(report);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user_id: Option<&str>, user_ids: Option<Vec<&str>>) -> ValidateRequest {
        ValidateRequest {
            user_id: user_id.map(str::to_string),
            user_ids: user_ids.map(|ids| ids.into_iter().map(str::to_string).collect()),
            repair: false,
            include_inconsistencies: true,
        }
    }

    #[test]
    fn test_exactly_one_selector_required() {
        assert!(request(None, None).user_ids(50).is_err());
        assert!(request(Some("a"), Some(vec!["b"])).user_ids(50).is_err());
        assert_eq!(request(Some("a"), None).user_ids(50).unwrap(), vec!["a"]);
        assert_eq!(request(None, Some(vec!["a", "b"])).user_ids(50).unwrap().len(), 2);
    }

    #[test]
    fn test_user_ids_bounds() {
        assert!(request(None, Some(vec![])).user_ids(50).is_err());
        assert!(request(None, Some(vec!["a", "b", "c"])).user_ids(2).is_err());
    }
}
