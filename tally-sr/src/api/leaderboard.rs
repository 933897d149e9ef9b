//! GET /leaderboard

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::leaderboard::{Leaderboard, LeaderboardQuery, Period, SortKey};
use crate::AppState;

/// Raw query parameters; parsed by hand so bad values get the JSON error body
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardParams {
    pub user_id: Option<String>,
    pub real_users_only: Option<String>,
    pub period: Option<String>,
    pub limit: Option<String>,
    pub sort_by: Option<String>,
}

impl LeaderboardParams {
    fn into_query(self) -> ApiResult<LeaderboardQuery> {
        let real_users_only = match self.real_users_only.as_deref() {
            None | Some("true") => true,
            Some("false") => false,
            Some(other) => {
                return Err(ApiError::BadRequest(format!(
                    "realUsersOnly must be true or false (got {})",
                    other
                )))
            }
        };
        let period = self
            .period
            .as_deref()
            .map(str::parse::<Period>)
            .transpose()?
            .unwrap_or_default();
        let sort_by = self
            .sort_by
            .as_deref()
            .map(str::parse::<SortKey>)
            .transpose()?;
        let limit = self
            .limit
            .as_deref()
            .map(|raw| {
                raw.parse::<usize>().map_err(|_| {
                    ApiError::BadRequest(format!("limit must be a non-negative integer (got {})", raw))
                })
            })
            .transpose()?;

        Ok(LeaderboardQuery {
            user_id: self.user_id.filter(|uid| !uid.is_empty()),
            real_users_only,
            period,
            limit,
            sort_by,
        })
    }
}

/// GET /leaderboard
///
/// Ranked board, or a single user when `userId` is given (404 if unknown).
pub async fn get_leaderboard(
    State(state): State<AppState>,
    Query(params): Query<LeaderboardParams>,
) -> ApiResult<Json<Leaderboard>> {
    let query = params.into_query()?;
    let board = state.services.leaderboard.query(&query).await?;
    Ok(Json(board))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_defaults() {
        let query = LeaderboardParams::default().into_query().unwrap();
        assert!(query.real_users_only);
        assert_eq!(query.period, Period::Both);
        assert!(query.limit.is_none());
        assert!(query.sort_by.is_none());
    }

    #[test]
    fn test_params_reject_unknown_values() {
        let params = LeaderboardParams {
            period: Some("weekly".to_string()),
            ..Default::default()
        };
        assert!(params.into_query().is_err());

        let params = LeaderboardParams {
            limit: Some("-3".to_string()),
            ..Default::default()
        };
        assert!(matches!(params.into_query(), Err(ApiError::BadRequest(_))));
    }
}
