//! POST /repair-all

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use tracing::{info, warn};

use super::json_body;
use crate::error::{ApiError, ApiResult};
use crate::repair::{RepairBatchOptions, RepairBatchReport};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairAllRequest {
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default = "default_max_users")]
    pub max_users: usize,
    #[serde(default = "default_true")]
    pub real_users_only: bool,
    #[serde(default)]
    pub confirm_repair: Option<bool>,
}

fn default_true() -> bool {
    true
}

fn default_max_users() -> usize {
    100
}

impl RepairAllRequest {
    /// Shape checks done before any work starts
    fn options(&self, max_batch_users: usize) -> ApiResult<RepairBatchOptions> {
        if self.max_users == 0 || self.max_users > max_batch_users {
            return Err(ApiError::BadRequest(format!(
                "maxUsers must be between 1 and {} (got {})",
                max_batch_users, self.max_users
            )));
        }
        if !self.dry_run && self.confirm_repair != Some(true) {
            return Err(ApiError::BadRequest(
                "confirmRepair: true is required when dryRun is false".to_string(),
            ));
        }
        Ok(RepairBatchOptions {
            dry_run: self.dry_run,
            max_users: self.max_users,
            real_users_only: self.real_users_only,
        })
    }
}

/// POST /repair-all
///
/// Dry run unless `dryRun: false` and `confirmRepair: true`.
pub async fn post_repair_all(
    State(state): State<AppState>,
    payload: Result<Json<RepairAllRequest>, JsonRejection>,
) -> ApiResult<Json<RepairBatchReport>> {
    let request = json_body(payload)?;
    let options = request.options(state.settings.max_batch_users)?;

    if options.dry_run {
        info!(max_users = options.max_users, "Batch repair requested (dry run)");
    } else {
        warn!(max_users = options.max_users, "Batch repair requested; aggregates will be overwritten");
    }

    let report = state.services.repair.repair_batch(&options).await;
    Ok(Json(report))
}
