//! Seat counting, admission decisions and downgrade validation
//!
//! A seat is an active user. The workspace's cached `current_seats` is only a
//! projection; every decision here recounts active users.

use std::fmt;
use std::sync::Arc;

use plancap_shared::PlanTier;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{UsageSnapshot, WorkspaceStore};

/// Seats billed on top of the plan's included seats
pub fn calculate_extra_seats(current_seats: u32, included_seats: u32) -> u32 {
    current_seats.saturating_sub(included_seats)
}

// =============================================================================
// Limit errors
// =============================================================================

/// Adding a seat would exceed the plan's hard maximum
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeatLimitExceeded {
    pub current: u32,
    pub max: u32,
    /// Tier to suggest in the upgrade prompt (None on the top tier)
    pub next_plan: Option<PlanTier>,
}

impl fmt::Display for SeatLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Seat limit reached ({}/{} seats in use).",
            self.current, self.max
        )?;
        match self.next_plan {
            Some(next) => write!(f, " Upgrade to {next} to add more users."),
            None => write!(f, " Contact sales to raise the limit."),
        }
    }
}

/// Plan-limited resource a downgrade is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageDimension {
    TeamMembers,
    Projects,
    Seats,
}

impl UsageDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TeamMembers => "team members",
            Self::Projects => "projects",
            Self::Seats => "seats",
        }
    }
}

/// Current usage does not fit the target plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DowngradeBlocked {
    pub target_plan: PlanTier,
    pub dimension: UsageDimension,
    pub current: u32,
    pub limit: u32,
}

impl DowngradeBlocked {
    /// How many units must be removed before the downgrade can proceed
    pub fn excess(&self) -> u32 {
        self.current.saturating_sub(self.limit)
    }
}

impl fmt::Display for DowngradeBlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cannot downgrade to {}: {} {} in use, limit is {}. Remove {} to continue.",
            self.target_plan,
            self.current,
            self.dimension.as_str(),
            self.limit,
            self.excess()
        )
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// Outcome of asking whether one more seat may be added
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SeatDecision {
    Blocked(SeatLimitExceeded),
    /// The new seat is covered by the included seats
    AllowedNoRemoteUpdate,
    /// The new seat is billable; the seat item must grow
    AllowedRequiresRemoteUpdate { extra_seats: u32 },
}

impl SeatDecision {
    /// Decide for a workspace on `plan` that currently has `current` active users
    pub fn evaluate(plan: PlanTier, current: u32) -> Self {
        let max = plan.max_seats();
        let next = current.saturating_add(1);

        if next > max {
            return Self::Blocked(SeatLimitExceeded {
                current,
                max,
                next_plan: plan.next(),
            });
        }

        let extra_seats = calculate_extra_seats(next, plan.included_seats());
        if extra_seats == 0 {
            Self::AllowedNoRemoteUpdate
        } else {
            Self::AllowedRequiresRemoteUpdate { extra_seats }
        }
    }

    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Blocked(_))
    }
}

/// Outcome of validating a downgrade against current usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DowngradeCheck {
    Allowed,
    Blocked(DowngradeBlocked),
}

/// Check usage against the limits of `target`.
///
/// Dimensions are checked in a fixed order (team members, projects, seats)
/// and the first violation is reported.
pub fn can_downgrade_to(target: PlanTier, usage: &UsageSnapshot) -> DowngradeCheck {
    let checks = [
        (
            UsageDimension::TeamMembers,
            usage.team_members,
            target.max_team_members(),
        ),
        (
            UsageDimension::Projects,
            usage.active_projects,
            target.max_projects(),
        ),
        (UsageDimension::Seats, usage.active_seats, target.max_seats()),
    ];

    for (dimension, current, limit) in checks {
        if current > limit {
            return DowngradeCheck::Blocked(DowngradeBlocked {
                target_plan: target,
                dimension,
                current,
                limit,
            });
        }
    }
    DowngradeCheck::Allowed
}

/// Seat usage of a workspace for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeatSummary {
    pub plan: PlanTier,
    pub current_seats: u32,
    pub included_seats: u32,
    pub extra_seats: u32,
    pub max_seats: u32,
    pub remaining_seats: u32,
    pub next_seat: SeatDecision,
}

impl SeatSummary {
    pub fn new(plan: PlanTier, current_seats: u32) -> Self {
        Self {
            plan,
            current_seats,
            included_seats: plan.included_seats(),
            extra_seats: calculate_extra_seats(current_seats, plan.included_seats()),
            max_seats: plan.max_seats(),
            remaining_seats: plan.max_seats().saturating_sub(current_seats),
            next_seat: SeatDecision::evaluate(plan, current_seats),
        }
    }
}

// =============================================================================
// Services
// =============================================================================

/// Derives the authoritative seat count
#[derive(Clone)]
pub struct SeatCounter {
    store: Arc<dyn WorkspaceStore>,
}

impl SeatCounter {
    pub fn new(store: Arc<dyn WorkspaceStore>) -> Self {
        Self { store }
    }

    /// Active users of the workspace. Never reads the cached count.
    pub async fn current_seats(&self, workspace_id: Uuid) -> BillingResult<u32> {
        self.store.count_active_users(workspace_id).await
    }
}

/// Read-only seat admission checks
#[derive(Clone)]
pub struct SeatAdmission {
    store: Arc<dyn WorkspaceStore>,
}

impl SeatAdmission {
    pub fn new(store: Arc<dyn WorkspaceStore>) -> Self {
        Self { store }
    }

    /// Would one more active user fit the workspace's plan?
    ///
    /// Advisory only: the decision can go stale before the caller acts on it.
    /// Admission that must hold goes through the transactional guard.
    pub async fn can_add_seat(&self, workspace_id: Uuid) -> BillingResult<SeatDecision> {
        let snapshot = self
            .store
            .seat_snapshot(workspace_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("workspace {workspace_id}")))?;

        Ok(SeatDecision::evaluate(snapshot.plan, snapshot.active_users))
    }

    pub async fn seat_summary(&self, workspace_id: Uuid) -> BillingResult<SeatSummary> {
        let snapshot = self
            .store
            .seat_snapshot(workspace_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("workspace {workspace_id}")))?;

        Ok(SeatSummary::new(snapshot.plan, snapshot.active_users))
    }

    pub async fn check_downgrade(
        &self,
        workspace_id: Uuid,
        target: PlanTier,
    ) -> BillingResult<DowngradeCheck> {
        let usage = self.store.usage_snapshot(workspace_id).await?;
        Ok(can_downgrade_to(target, &usage))
    }
}
