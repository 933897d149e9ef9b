//! Platform webhooks
//!
//! Each webhook publishes to the notification bus and answers 202; the
//! dispatcher applies it asynchronously. When the bus backlog is full the
//! webhook applies the notification itself before answering, so an accepted
//! notification is never evicted.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tally_common::events::{PlatformNotification, UserCreatedEvent};
use tally_common::models::CheckInEvent;
use tracing::{debug, warn};

use super::json_body;
use crate::error::{ApiError, ApiResult};
use crate::triggers::NotificationHandler;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub accepted: bool,
    pub kind: &'static str,
    pub id: String,
}

/// POST /triggers/check-in-created
pub async fn check_in_created(
    State(state): State<AppState>,
    payload: Result<Json<CheckInEvent>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let event = json_body(payload)?;
    if event.id.is_empty() {
        return Err(ApiError::BadRequest("check-in id is required".to_string()));
    }
    let id = event.id.clone();
    Ok(accept(&state, PlatformNotification::CheckInCreated(event), id).await)
}

/// POST /triggers/user-created
pub async fn user_created(
    State(state): State<AppState>,
    payload: Result<Json<UserCreatedEvent>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let event = json_body(payload)?;
    if event.uid.is_empty() {
        return Err(ApiError::BadRequest("uid is required".to_string()));
    }
    let id = event.uid.clone();
    Ok(accept(&state, PlatformNotification::UserCreated(event), id).await)
}

async fn accept(
    state: &AppState,
    notification: PlatformNotification,
    id: String,
) -> (StatusCode, Json<Accepted>) {
    let kind = notification.kind();
    if state.bus.is_saturated() {
        warn!(kind, %id, "Notification bus saturated, handling inline");
        if let Err(e) = state.services.triggers.handle(notification).await {
            warn!(kind, %id, error = %e, "Inline notification handling failed");
        }
        return accepted(kind, id);
    }

    match state.bus.publish(notification) {
        Ok(subscribers) => debug!(kind, %id, subscribers, "Notification published"),
        Err(unsent) => {
            // No dispatcher subscribed; handle inline on a background task
            warn!(kind, %id, "No dispatcher subscribed, handling directly");
            let dispatcher = state.services.triggers.clone();
            tokio::spawn(async move {
                let _ = dispatcher.handle(unsent.0).await;
            });
        }
    }
    accepted(kind, id)
}

fn accepted(kind: &'static str, id: String) -> (StatusCode, Json<Accepted>) {
    (
        StatusCode::ACCEPTED,
        Json(Accepted {
            accepted: true,
            kind,
            id,
        }),
    )
}
