//! # Tally Common Library
//!
//! Shared code for the Tally check-in services including:
//! - Check-in, user and aggregate models
//! - The `DataStore` seam (SQLite, in-memory, timeout decorator)
//! - Platform notification types and the notification bus
//! - Bootstrap configuration loading
//! - Calendar and timestamp helpers

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod store;
pub mod time;

pub use error::{Error, Result};
pub use store::{DataStore, MemoryStore, TimedStore};
