//! Repair Executor
//!
//! The only writer of user aggregates. Every repair is a full recompute from
//! the log followed by a wholesale overwrite, so repeated or concurrent
//! repairs of the same user converge on the last snapshot read.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tally_common::models::{StatsSnapshot, UserPage, UserStats};
use tally_common::{DataStore, Result};
use tracing::{debug, info, warn};

use crate::stats::{ConsistencyValidator, StatsCalculator};

/// Options for a batch repair run
#[derive(Debug, Clone, Copy)]
pub struct RepairBatchOptions {
    pub dry_run: bool,
    pub max_users: usize,
    pub real_users_only: bool,
}

impl Default for RepairBatchOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            max_users: 100,
            real_users_only: true,
        }
    }
}

/// Batch stage at which a per-item failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStage {
    ListUsers,
    Validate,
    Repair,
    OrphanScan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub stage: BatchStage,
    pub message: String,
}

/// Before/after state of one user that needed repair
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairEntry {
    pub user_id: String,
    pub dry_run: bool,
    pub before: StatsSnapshot,
    pub after: UserStats,
    pub discrepancies: Vec<String>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedEvent {
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pub_id: Option<String>,
    pub missing_user: bool,
    pub missing_pub: bool,
}

/// Events whose references no longer resolve; flagged, never deleted
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanReport {
    pub events_scanned: usize,
    pub orphaned_events: Vec<OrphanedEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairBatchReport {
    pub dry_run: bool,
    pub users_checked: usize,
    pub users_with_issues: usize,
    pub users_repaired: usize,
    pub entries: Vec<RepairEntry>,
    pub orphans: OrphanReport,
    pub errors: Vec<BatchError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Per-user outcome inside a batch
enum UserOutcome {
    Clean,
    Entry { entry: RepairEntry, repaired: bool },
    Failed(BatchError),
}

#[derive(Clone)]
pub struct RepairExecutor {
    store: Arc<dyn DataStore>,
    calculator: StatsCalculator,
    validator: ConsistencyValidator,
    concurrency: usize,
    page_size: usize,
}

impl RepairExecutor {
    pub fn new(
        store: Arc<dyn DataStore>,
        calculator: StatsCalculator,
        validator: ConsistencyValidator,
        concurrency: usize,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            calculator,
            validator,
            concurrency: concurrency.max(1),
            page_size: page_size.max(1),
        }
    }

    /// Recompute and persist one user's aggregate
    pub async fn repair(&self, user_id: &str) -> Result<UserStats> {
        let stats = self.calculator.calculate(user_id).await?;
        self.store.put_aggregate(&stats).await?;
        debug!(
            user_id,
            total_points = stats.total_points,
            verified_pub_count = stats.verified_pub_count,
            "Repaired user aggregate"
        );
        Ok(stats)
    }

    /// Check up to `max_users` users and repair (or report) those with issues,
    /// then scan the whole log for orphaned events.
    ///
    /// Never fails as a whole: every per-user or per-page failure is recorded
    /// in `errors` and the run continues.
    pub async fn repair_batch(&self, options: &RepairBatchOptions) -> RepairBatchReport {
        let started_at = Utc::now();
        let mut errors = Vec::new();

        let user_ids = self.collect_user_ids(options, &mut errors).await;
        info!(
            users = user_ids.len(),
            dry_run = options.dry_run,
            concurrency = self.concurrency,
            "Starting batch repair"
        );

        let users_checked = user_ids.len();
        let dry_run = options.dry_run;
        let outcomes: Vec<UserOutcome> = stream::iter(user_ids)
            .map(|uid| {
                let this = self.clone();
                async move { this.check_user(&uid, dry_run).await }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut entries = Vec::new();
        let mut users_repaired = 0;
        for outcome in outcomes {
            match outcome {
                UserOutcome::Clean => {}
                UserOutcome::Entry { entry, repaired } => {
                    if repaired {
                        users_repaired += 1;
                    }
                    entries.push(entry);
                }
                UserOutcome::Failed(error) => errors.push(error),
            }
        }

        let orphans = self.scan_orphans(&mut errors).await;

        let report = RepairBatchReport {
            dry_run: options.dry_run,
            users_checked,
            users_with_issues: entries.len(),
            users_repaired,
            entries,
            orphans,
            errors,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            users_checked = report.users_checked,
            users_with_issues = report.users_with_issues,
            users_repaired = report.users_repaired,
            orphaned_events = report.orphans.orphaned_events.len(),
            errors = report.errors.len(),
            "Batch repair complete"
        );
        report
    }

    async fn collect_user_ids(
        &self,
        options: &RepairBatchOptions,
        errors: &mut Vec<BatchError>,
    ) -> Vec<String> {
        let mut user_ids = Vec::new();
        let mut after: Option<String> = None;

        while user_ids.len() < options.max_users {
            let page = UserPage {
                after: after.clone(),
                limit: self.page_size.min(options.max_users - user_ids.len()),
                real_users_only: options.real_users_only,
            };
            let users = match self.store.list_users(&page).await {
                Ok(users) => users,
                Err(e) => {
                    warn!(error = %e, "Failed to list users, batch continues with users collected so far");
                    errors.push(BatchError {
                        user_id: None,
                        stage: BatchStage::ListUsers,
                        message: e.to_string(),
                    });
                    break;
                }
            };
            let Some(last) = users.last() else { break };
            after = Some(last.uid.clone());
            let exhausted = users.len() < page.limit;
            user_ids.extend(users.into_iter().map(|u| u.uid));
            if exhausted {
                break;
            }
        }

        user_ids
    }

    async fn check_user(&self, user_id: &str, dry_run: bool) -> UserOutcome {
        let failed = |stage: BatchStage, e: tally_common::Error| {
            warn!(user_id, ?stage, error = %e, "Batch item failed");
            UserOutcome::Failed(BatchError {
                user_id: Some(user_id.to_string()),
                stage,
                message: e.to_string(),
            })
        };

        let report = match self.validator.validate(user_id).await {
            Ok(report) => report,
            Err(e) => return failed(BatchStage::Validate, e),
        };
        let inconsistency = match self.validator.find_inconsistencies(user_id).await {
            Ok(inconsistency) => inconsistency,
            Err(e) => return failed(BatchStage::Validate, e),
        };

        if report.is_valid && !inconsistency.has_inconsistencies {
            return UserOutcome::Clean;
        }

        let after = if dry_run {
            report.correct_stats
        } else {
            match self.repair(user_id).await {
                Ok(stats) => stats,
                Err(e) => return failed(BatchStage::Repair, e),
            }
        };

        UserOutcome::Entry {
            entry: RepairEntry {
                user_id: user_id.to_string(),
                dry_run,
                before: report.current_stats,
                after,
                discrepancies: report.discrepancies,
                issues: inconsistency.issues,
            },
            repaired: !dry_run,
        }
    }

    /// Single pass over the log flagging events with dangling references
    pub async fn scan_orphans(&self, errors: &mut Vec<BatchError>) -> OrphanReport {
        let mut report = OrphanReport::default();
        let mut user_exists: HashMap<String, bool> = HashMap::new();
        let mut pub_exists: HashMap<String, bool> = HashMap::new();
        let mut after: Option<String> = None;

        loop {
            let page = match self.store.scan_events(after.as_deref(), self.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "Orphan scan aborted");
                    errors.push(BatchError {
                        user_id: None,
                        stage: BatchStage::OrphanScan,
                        message: e.to_string(),
                    });
                    break;
                }
            };
            let Some(last) = page.last() else { break };
            after = Some(last.id.clone());
            let exhausted = page.len() < self.page_size;

            for event in page {
                report.events_scanned += 1;
                // A failed lookup is recorded and counts as resolved, so the
                // other reference is still checked
                let missing_user = match event.user_id.as_deref() {
                    Some(uid) => match self.resolve(&mut user_exists, uid, true).await {
                        Ok(exists) => !exists,
                        Err(e) => {
                            errors.push(orphan_error(event.user_id.clone(), e));
                            false
                        }
                    },
                    None => true,
                };
                let missing_pub = match event.pub_id.as_deref() {
                    Some(pid) => match self.resolve(&mut pub_exists, pid, false).await {
                        Ok(exists) => !exists,
                        Err(e) => {
                            errors.push(orphan_error(event.user_id.clone(), e));
                            false
                        }
                    },
                    None => true,
                };

                if missing_user || missing_pub {
                    report.orphaned_events.push(OrphanedEvent {
                        event_id: event.id,
                        user_id: event.user_id,
                        pub_id: event.pub_id,
                        missing_user,
                        missing_pub,
                    });
                }
            }

            if exhausted {
                break;
            }
        }

        if !report.orphaned_events.is_empty() {
            warn!(
                orphaned = report.orphaned_events.len(),
                scanned = report.events_scanned,
                "Orphaned check-ins found; manual review required"
            );
        }
        report
    }

    async fn resolve(
        &self,
        cache: &mut HashMap<String, bool>,
        id: &str,
        is_user: bool,
    ) -> Result<bool> {
        if let Some(exists) = cache.get(id) {
            return Ok(*exists);
        }
        let exists = if is_user {
            self.store.get_user(id).await?.is_some()
        } else {
            self.store.get_pub(id).await?.is_some()
        };
        cache.insert(id.to_string(), exists);
        Ok(exists)
    }
}

fn orphan_error(user_id: Option<String>, e: tally_common::Error) -> BatchError {
    BatchError {
        user_id,
        stage: BatchStage::OrphanScan,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_common::models::{CheckInEvent, Pub, StoredAggregate, UserRecord};
    use tally_common::MemoryStore;

    fn executor(store: Arc<MemoryStore>) -> RepairExecutor {
        let calculator = StatsCalculator::new(store.clone());
        let validator = ConsistencyValidator::new(store.clone(), calculator.clone(), 100);
        RepairExecutor::new(store, calculator, validator, 2, 3)
    }

    #[tokio::test]
    async fn test_repair_overwrites_drifted_aggregate() {
        let store = Arc::new(MemoryStore::new());
        let drifted = StoredAggregate {
            total_points: Some(50),
            ..StoredAggregate::canonical()
        };
        store.insert_user(UserRecord::new("u1").with_aggregate(drifted));

        let stats = executor(store.clone()).repair("u1").await.unwrap();
        assert_eq!(stats.total_points, 0);
        assert_eq!(store.user("u1").unwrap().aggregate.total_points, Some(0));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_repair_missing_user_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let err = executor(store.clone()).repair("ghost").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_collect_user_ids_pages_and_caps() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..8 {
            store.insert_user(UserRecord::new(format!("u{}", i)));
        }
        let executor = executor(store);
        let mut errors = Vec::new();
        let options = RepairBatchOptions {
            max_users: 7,
            ..Default::default()
        };
        let ids = executor.collect_user_ids(&options, &mut errors).await;
        assert_eq!(ids.len(), 7);
        assert_eq!(ids.first().map(String::as_str), Some("u0"));
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_scan_orphans_flags_dangling_references() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(UserRecord::new("u1"));
        store.insert_pub(Pub::new("p1"));
        store.insert_event(CheckInEvent::new("c1", "u1", "p1", Utc::now()));
        store.insert_event(CheckInEvent::new("c2", "gone", "p1", Utc::now()));
        store.insert_event(CheckInEvent::new("c3", "u1", "closed", Utc::now()));
        store.insert_event(CheckInEvent::new("c4", "u1", "p1", Utc::now()));

        let mut errors = Vec::new();
        let report = executor(store.clone()).scan_orphans(&mut errors).await;
        assert!(errors.is_empty());
        assert_eq!(report.events_scanned, 4);
        assert_eq!(
            report.orphaned_events,
            vec![
                OrphanedEvent {
                    event_id: "c2".to_string(),
                    user_id: Some("gone".to_string()),
                    pub_id: Some("p1".to_string()),
                    missing_user: true,
                    missing_pub: false,
                },
                OrphanedEvent {
                    event_id: "c3".to_string(),
                    user_id: Some("u1".to_string()),
                    pub_id: Some("closed".to_string()),
                    missing_user: false,
                    missing_pub: true,
                },
            ]
        );
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_scan_orphans_checks_pub_when_user_lookup_fails() {
        let store = Arc::new(MemoryStore::new());
        store.insert_event(CheckInEvent::new("c1", "flaky", "closed", Utc::now()));
        store.fail_user_reads_for("flaky");

        let mut errors = Vec::new();
        let report = executor(store).scan_orphans(&mut errors).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage, BatchStage::OrphanScan);
        assert_eq!(errors[0].user_id.as_deref(), Some("flaky"));
        assert_eq!(report.orphaned_events.len(), 1);
        assert!(!report.orphaned_events[0].missing_user);
        assert!(report.orphaned_events[0].missing_pub);
    }

    #[tokio::test]
    async fn test_batch_real_users_only_skips_anonymous() {
        let store = Arc::new(MemoryStore::new());
        let drifted = StoredAggregate {
            total_points: Some(10),
            ..StoredAggregate::canonical()
        };
        store.insert_user(UserRecord::new("anon").anonymous(true).with_aggregate(drifted.clone()));
        store.insert_user(UserRecord::new("real").with_aggregate(drifted));

        let options = RepairBatchOptions {
            dry_run: false,
            ..Default::default()
        };
        let report = executor(store.clone()).repair_batch(&options).await;
        assert_eq!(report.users_checked, 1);
        assert_eq!(report.entries[0].user_id, "real");
        assert_eq!(store.user("anon").unwrap().aggregate.total_points, Some(10));
        assert_eq!(store.user("real").unwrap().aggregate.total_points, Some(0));
    }

    #[tokio::test]
    async fn test_batch_isolates_per_user_failures() {
        let store = Arc::new(MemoryStore::new());
        for uid in ["a", "b", "c"] {
            let drifted = StoredAggregate {
                total_points: Some(10),
                ..StoredAggregate::canonical()
            };
            store.insert_user(UserRecord::new(uid).with_aggregate(drifted));
        }
        store.fail_event_reads_for("b");

        let options = RepairBatchOptions {
            dry_run: false,
            ..Default::default()
        };
        let report = executor(store.clone()).repair_batch(&options).await;
        assert_eq!(report.users_checked, 3);
        assert_eq!(report.users_repaired, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].user_id.as_deref(), Some("b"));
        assert_eq!(report.errors[0].stage, BatchStage::Validate);
        assert_eq!(store.user("a").unwrap().aggregate.total_points, Some(0));
        assert_eq!(store.user("c").unwrap().aggregate.total_points, Some(0));
        assert_eq!(store.user("b").unwrap().aggregate.total_points, Some(10));
    }

    #[tokio::test]
    async fn test_batch_write_failure_is_repair_stage() {
        let store = Arc::new(MemoryStore::new());
        let drifted = StoredAggregate {
            total_points: Some(10),
            ..StoredAggregate::canonical()
        };
        store.insert_user(UserRecord::new("a").with_aggregate(drifted));
        store.fail_writes(true);

        let options = RepairBatchOptions {
            dry_run: false,
            ..Default::default()
        };
        let report = executor(store).repair_batch(&options).await;
        assert_eq!(report.users_repaired, 0);
        assert!(report.entries.is_empty());
        assert_eq!(report.errors[0].stage, BatchStage::Repair);
    }
}
