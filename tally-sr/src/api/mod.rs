//! HTTP API handlers for tally-sr

pub mod health;
pub mod leaderboard;
pub mod repair;
pub mod triggers;
pub mod validate;

pub use health::health_routes;
pub use leaderboard::get_leaderboard;
pub use repair::post_repair_all;
pub use triggers::{check_in_created, user_created};
pub use validate::post_validate;

use axum::extract::rejection::JsonRejection;
use axum::Json;

use crate::error::{ApiError, ApiResult};

/// Unwrap a JSON body, reporting malformed payloads as 400 in the API's
/// error shape
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}
