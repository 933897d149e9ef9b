//! tally-sr library - Stats Reconciliation service
//!
//! Keeps per-user check-in aggregates consistent with the check-in log:
//! recompute, validate, repair (single and batch) and rank.

use std::sync::Arc;

use axum::Router;
use tally_common::config::StatsSettings;
use tally_common::events::NotificationBus;
use tally_common::DataStore;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod error;
pub mod leaderboard;
pub mod repair;
pub mod stats;
pub mod triggers;

pub use error::{ApiError, ApiResult};

use leaderboard::LeaderboardService;
use repair::RepairExecutor;
use stats::{ConsistencyValidator, StatsCalculator};
use triggers::TriggerDispatcher;

/// The reconciliation components, wired to one store
#[derive(Clone)]
pub struct Services {
    pub calculator: StatsCalculator,
    pub validator: ConsistencyValidator,
    pub repair: RepairExecutor,
    pub triggers: TriggerDispatcher,
    pub leaderboard: LeaderboardService,
}

impl Services {
    pub fn new(store: Arc<dyn DataStore>, settings: &StatsSettings) -> Self {
        let calculator = StatsCalculator::new(store.clone());
        let validator = ConsistencyValidator::new(
            store.clone(),
            calculator.clone(),
            settings.high_points_threshold,
        );
        let repair = RepairExecutor::new(
            store.clone(),
            calculator.clone(),
            validator.clone(),
            settings.batch_concurrency,
            settings.batch_page_size,
        );
        let triggers = TriggerDispatcher::new(
            store.clone(),
            validator.clone(),
            repair.clone(),
            settings.trigger_retry_max_wait_ms,
        );
        let leaderboard = LeaderboardService::new(
            store,
            settings.batch_page_size,
            settings.leaderboard_default_limit,
            settings.leaderboard_max_limit,
        );
        Self {
            calculator,
            validator,
            repair,
            triggers,
            leaderboard,
        }
    }
}

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub bus: NotificationBus,
    pub settings: Arc<StatsSettings>,
}

impl AppState {
    /// Create new application state
    pub fn new(store: Arc<dyn DataStore>, bus: NotificationBus, settings: StatsSettings) -> Self {
        let services = Services::new(store, &settings);
        Self {
            services,
            bus,
            settings: Arc::new(settings),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post};

    Router::new()
        .route("/leaderboard", get(api::get_leaderboard))
        .route("/validate", post(api::post_validate))
        .route("/repair-all", post(api::post_repair_all))
        .route("/triggers/check-in-created", post(api::check_in_created))
        .route("/triggers/user-created", post(api::user_created))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
