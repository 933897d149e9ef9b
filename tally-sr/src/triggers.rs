//! Trigger Dispatcher
//!
//! Reacts to platform notifications. The originating record already exists
//! when a handler runs, so handlers never fail outward: every internal error
//! is written to the audit sink and swallowed.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tally_common::events::{PlatformNotification, UserCreatedEvent};
use tally_common::models::{AuditEntry, AuditKind, CheckInEvent, StoredAggregate};
use tally_common::store::retry_transient;
use tally_common::{DataStore, Error, Result};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::repair::RepairExecutor;
use crate::stats::ConsistencyValidator;

const CHECK_IN_SOURCE: &str = "on_check_in_created";
const USER_SOURCE: &str = "on_user_created";
const DISPATCHER_SOURCE: &str = "run_dispatcher";

/// Consumer contract for platform notifications
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, notification: PlatformNotification) -> Result<()>;

    /// Called when the bus evicted `skipped` notifications before they were
    /// received
    async fn on_lagged(&self, skipped: u64);
}

#[derive(Clone)]
pub struct TriggerDispatcher {
    store: Arc<dyn DataStore>,
    validator: ConsistencyValidator,
    repair: RepairExecutor,
    retry_max_wait_ms: u64,
}

impl TriggerDispatcher {
    pub fn new(
        store: Arc<dyn DataStore>,
        validator: ConsistencyValidator,
        repair: RepairExecutor,
        retry_max_wait_ms: u64,
    ) -> Self {
        Self {
            store,
            validator,
            repair,
            retry_max_wait_ms,
        }
    }

    /// Fold a newly created check-in into its owner's aggregate
    ///
    /// Runs event validation (report only), a full-recompute repair of the
    /// owner, then the impossible-state check. Safe to deliver repeatedly.
    pub async fn on_check_in_created(&self, event: &CheckInEvent) {
        debug!(event_id = %event.id, "Check-in created");

        match self.validator.validate_event(event).await {
            Ok(result) if !result.errors.is_empty() || !result.warnings.is_empty() => {
                warn!(
                    event_id = %event.id,
                    errors = ?result.errors,
                    warnings = ?result.warnings,
                    "Check-in failed validation"
                );
                let mut entry = AuditEntry::new(
                    AuditKind::EventValidation,
                    CHECK_IN_SOURCE,
                    format!("check-in {} has validation findings", event.id),
                )
                .with_details(json!({
                    "eventId": event.id,
                    "isValid": result.is_valid,
                    "errors": result.errors,
                    "warnings": result.warnings,
                    "findings": result.findings,
                }));
                if let Some(uid) = &event.user_id {
                    entry = entry.for_user(uid.clone());
                }
                self.audit(entry).await;
            }
            Ok(_) => {}
            Err(e) => {
                self.record_failure(CHECK_IN_SOURCE, event.user_id.as_deref(), "validate_event", &e)
                    .await
            }
        }

        let Some(user_id) = event.user_id.as_deref().filter(|uid| !uid.is_empty()) else {
            self.record_failure(
                CHECK_IN_SOURCE,
                None,
                "repair",
                &Error::InvalidInput(format!("check-in {} has no userId", event.id)),
            )
            .await;
            return;
        };

        let repaired = retry_transient("trigger_repair", self.retry_max_wait_ms, || {
            self.repair.repair(user_id)
        })
        .await;
        match repaired {
            Ok(stats) => info!(
                user_id,
                event_id = %event.id,
                total_points = stats.total_points,
                verified_pub_count = stats.verified_pub_count,
                "Aggregate updated from check-in"
            ),
            Err(e) => {
                self.record_failure(CHECK_IN_SOURCE, Some(user_id), "repair", &e).await;
                return;
            }
        }

        match self.validator.find_inconsistencies(user_id).await {
            Ok(found) if found.has_inconsistencies => {
                warn!(user_id, issues = ?found.issues, "Inconsistencies remain after repair");
                let entry = AuditEntry::new(
                    AuditKind::Inconsistency,
                    CHECK_IN_SOURCE,
                    format!("{} inconsistencies after repair", found.issues.len()),
                )
                .for_user(user_id)
                .with_details(json!({
                    "issues": found.issues,
                    "suggestions": found.suggestions,
                }));
                self.audit(entry).await;
            }
            Ok(_) => {}
            Err(e) => {
                self.record_failure(CHECK_IN_SOURCE, Some(user_id), "find_inconsistencies", &e)
                    .await
            }
        }
    }

    /// Normalize a new user's aggregate to the canonical zero state
    ///
    /// Writes only when the stored aggregate or the `realUser` flag differs
    /// from what it should be, so redelivery is a no-op.
    pub async fn on_user_created(&self, event: &UserCreatedEvent) {
        let uid = event.uid.as_str();
        let real_user = !event.is_anonymous.unwrap_or(false);

        let user = match self.store.get_user(uid).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                let e = Error::NotFound(format!("user {}", uid));
                self.record_failure(USER_SOURCE, Some(uid), "get_user", &e).await;
                return;
            }
            Err(e) => {
                self.record_failure(USER_SOURCE, Some(uid), "get_user", &e).await;
                return;
            }
        };

        let needs_write = !user.aggregate.is_canonical() || user.real_user != Some(real_user);
        if needs_write {
            let aggregate = StoredAggregate {
                last_stats_update: Some(chrono::Utc::now()),
                ..StoredAggregate::canonical()
            };
            if let Err(e) = self.store.init_user_profile(uid, &aggregate, real_user).await {
                self.record_failure(USER_SOURCE, Some(uid), "init_user_profile", &e).await;
                return;
            }
            info!(user_id = uid, real_user, "Initialized user aggregate");
        } else {
            debug!(user_id = uid, "User aggregate already canonical");
        }

        let entry = AuditEntry::new(AuditKind::UserCreated, USER_SOURCE, "user created")
            .for_user(uid)
            .with_details(json!({
                "realUser": real_user,
                "isAnonymous": event.is_anonymous,
                "displayName": event.display_name,
                "normalized": needs_write,
            }));
        self.audit(entry).await;
    }

    async fn record_failure(
        &self,
        source: &'static str,
        user_id: Option<&str>,
        step: &str,
        e: &Error,
    ) {
        error!(source, user_id = ?user_id, step, error = %e, "Trigger step failed");
        let mut entry = AuditEntry::new(
            AuditKind::TriggerFailure,
            source,
            format!("{} failed: {}", step, e),
        )
        .with_details(json!({
            "step": step,
            "transient": e.is_transient(),
        }));
        if let Some(uid) = user_id {
            entry = entry.for_user(uid);
        }
        self.audit(entry).await;
    }

    /// Fire-and-forget audit write
    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append_audit(&entry).await {
            error!(kind = entry.kind.as_str(), error = %e, "Failed to write audit entry");
        }
    }
}

#[async_trait]
impl NotificationHandler for TriggerDispatcher {
    async fn handle(&self, notification: PlatformNotification) -> Result<()> {
        match notification {
            PlatformNotification::CheckInCreated(event) => self.on_check_in_created(&event).await,
            PlatformNotification::UserCreated(event) => self.on_user_created(&event).await,
        }
        Ok(())
    }

    async fn on_lagged(&self, skipped: u64) {
        let entry = AuditEntry::new(
            AuditKind::TriggerFailure,
            DISPATCHER_SOURCE,
            format!("{} notifications dropped by the bus", skipped),
        )
        .with_details(json!({
            "step": "receive",
            "skipped": skipped,
            "suggestion": "run repair-all to reconcile affected users",
        }));
        self.audit(entry).await;
    }
}

/// Consume notifications from the bus until every sender is dropped
///
/// Each notification is handled on its own task, so a slow user never holds
/// up others.
pub async fn run_dispatcher(
    handler: Arc<dyn NotificationHandler>,
    mut rx: broadcast::Receiver<PlatformNotification>,
) {
    debug!("Trigger dispatcher started");

    loop {
        match rx.recv().await {
            Ok(notification) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let kind = notification.kind();
                    if let Err(e) = handler.handle(notification).await {
                        error!(kind, error = %e, "Notification handler failed");
                    }
                });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Trigger dispatcher lagged; notifications dropped");
                handler.on_lagged(skipped).await;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Notification bus closed, shutting down dispatcher");
                break;
            }
        }
    }

    debug!("Trigger dispatcher stopped");
}
