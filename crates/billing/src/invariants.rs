//! Seat Billing Invariants
//!
//! Read-only consistency checks over the seat data. The worker runs them after
//! each reconciliation sweep; a violation that survives a sweep needs a human.
//!
//! ## Checks
//!
//! 1. `cached_seats_match_active_users`: the cached count is a projection of
//!    the active user count
//! 2. `seat_item_matches_extra_seats`: a seat item exists exactly when there
//!    are extra seats
//! 3. `seats_within_plan_max`: no workspace is above its plan's seat ceiling
//! 4. `included_seats_match_plan`: included seats follow the plan catalog

use std::collections::HashSet;

use plancap_shared::PlanTier;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub workspace_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customers are being billed for seats they cannot have
    Critical,
    /// Remote billing and local state disagree
    High,
    /// Cached data drifted; the next sweep repairs it
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SeatDriftRow {
    workspace_id: Uuid,
    workspace_name: String,
    current_seats: i32,
    active_users: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct SeatItemMismatchRow {
    workspace_id: Uuid,
    current_seats: i32,
    included_seats: i32,
    stripe_seat_item_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct OverLimitRow {
    workspace_id: Uuid,
    workspace_name: String,
    plan: String,
    active_users: i64,
    max_seats: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct IncludedMismatchRow {
    workspace_id: Uuid,
    plan: String,
    included_seats: i32,
    expected: i32,
}

/// `CASE` expression mapping the plan column to a per-tier limit
fn plan_limit_case(column: &str, limit: impl Fn(PlanTier) -> u32) -> String {
    let arms: String = PlanTier::ALL
        .iter()
        .map(|tier| format!(" WHEN '{}' THEN {}", tier.as_str(), limit(*tier)))
        .collect();
    format!("(CASE {column}{arms} END)")
}

/// Service for running seat billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_cached_seats().await?);
        violations.extend(self.check_seat_item_presence().await?);
        violations.extend(self.check_seats_within_max().await?);
        violations.extend(self.check_included_seats().await?);

        let summary = InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        );

        if summary.healthy {
            tracing::info!(checks = summary.checks_run, "Seat invariants hold");
        } else {
            for violation in &summary.violations {
                tracing::warn!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    workspaces = ?violation.workspace_ids,
                    "{}",
                    violation.description
                );
            }
        }
        Ok(summary)
    }

    /// Invariant 1: cached seat count equals active users
    async fn check_cached_seats(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SeatDriftRow> = sqlx::query_as(
            r#"
            SELECT w.id AS workspace_id,
                   w.name AS workspace_name,
                   w.current_seats,
                   COUNT(u.id) FILTER (WHERE u.active) AS active_users
            FROM workspaces w
            LEFT JOIN users u ON u.workspace_id = w.id
            GROUP BY w.id
            HAVING w.current_seats <> COUNT(u.id) FILTER (WHERE u.active)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cached_seats_match_active_users".to_string(),
                workspace_ids: vec![row.workspace_id],
                description: format!(
                    "Workspace '{}' caches {} seats but has {} active users",
                    row.workspace_name, row.current_seats, row.active_users
                ),
                context: serde_json::json!({
                    "current_seats": row.current_seats,
                    "active_users": row.active_users,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 2: seat item present iff current seats exceed included seats
    async fn check_seat_item_presence(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SeatItemMismatchRow> = sqlx::query_as(
            r#"
            SELECT id AS workspace_id, current_seats, included_seats, stripe_seat_item_id
            FROM workspaces
            WHERE stripe_subscription_id IS NOT NULL
              AND (current_seats > included_seats) <> (stripe_seat_item_id IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let extra = (row.current_seats - row.included_seats).max(0);
                InvariantViolation {
                    invariant: "seat_item_matches_extra_seats".to_string(),
                    workspace_ids: vec![row.workspace_id],
                    description: match &row.stripe_seat_item_id {
                        Some(item) => {
                            format!("Seat item {item} exists but there are no extra seats")
                        }
                        None => format!("{extra} extra seats but no seat item"),
                    },
                    context: serde_json::json!({
                        "current_seats": row.current_seats,
                        "included_seats": row.included_seats,
                        "stripe_seat_item_id": row.stripe_seat_item_id,
                    }),
                    severity: ViolationSeverity::High,
                }
            })
            .collect())
    }

    /// Invariant 3: active users never exceed the plan maximum
    async fn check_seats_within_max(&self) -> BillingResult<Vec<InvariantViolation>> {
        let max_case = plan_limit_case("w.plan", |tier| tier.max_seats());
        let rows: Vec<OverLimitRow> = sqlx::query_as(&format!(
            r#"
            SELECT w.id AS workspace_id,
                   w.name AS workspace_name,
                   w.plan,
                   COUNT(u.id) AS active_users,
                   {max_case} AS max_seats
            FROM workspaces w
            JOIN users u ON u.workspace_id = w.id AND u.active
            GROUP BY w.id
            HAVING COUNT(u.id) > {max_case}
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "seats_within_plan_max".to_string(),
                workspace_ids: vec![row.workspace_id],
                description: format!(
                    "Workspace '{}' on {} has {} active users, limit is {}",
                    row.workspace_name, row.plan, row.active_users, row.max_seats
                ),
                context: serde_json::json!({
                    "plan": row.plan,
                    "active_users": row.active_users,
                    "max_seats": row.max_seats,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: included seats follow the plan catalog
    async fn check_included_seats(&self) -> BillingResult<Vec<InvariantViolation>> {
        let included_case = plan_limit_case("plan", |tier| tier.included_seats());
        let rows: Vec<IncludedMismatchRow> = sqlx::query_as(&format!(
            r#"
            SELECT id AS workspace_id, plan, included_seats, {included_case} AS expected
            FROM workspaces
            WHERE included_seats <> {included_case}
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "included_seats_match_plan".to_string(),
                workspace_ids: vec![row.workspace_id],
                description: format!(
                    "Plan {} includes {} seats but workspace records {}",
                    row.plan, row.expected, row.included_seats
                ),
                context: serde_json::json!({
                    "plan": row.plan,
                    "included_seats": row.included_seats,
                    "expected": row.expected,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "cached_seats_match_active_users" => self.check_cached_seats().await,
            "seat_item_matches_extra_seats" => self.check_seat_item_presence().await,
            "seats_within_plan_max" => self.check_seats_within_max().await,
            "included_seats_match_plan" => self.check_included_seats().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "cached_seats_match_active_users",
            "seat_item_matches_extra_seats",
            "seats_within_plan_max",
            "included_seats_match_plan",
        ]
    }
}
