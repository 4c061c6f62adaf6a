#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Plancap Shared
//!
//! Types and database helpers used across the Plancap crates.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{BillingPeriod, ParseCatalogError, PlanTier};
