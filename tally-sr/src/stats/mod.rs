//! Stats recomputation and consistency checks

pub mod calculator;
pub mod findings;
pub mod validator;

pub use calculator::{fold_events, StatsCalculator};
pub use findings::{Discrepancy, EventFinding, Finding, Severity};
pub use validator::{ConsistencyValidator, EventValidation, Inconsistency, ValidationReport};
