//! Workspace persistence
//!
//! [`WorkspaceStore`] abstracts the relational store so seat logic can run
//! against Postgres in production and an in-memory store in tests. Seat-changing
//! writes go through a [`SeatTransaction`], which Postgres runs at
//! `SERIALIZABLE` isolation.

use async_trait::async_trait;
use plancap_shared::{BillingPeriod, PlanTier};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

// =============================================================================
// Records
// =============================================================================

/// Billing view of a workspace row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub plan: PlanTier,
    pub billing_period: BillingPeriod,
    /// Cached seat count; authoritative value is the active user count
    pub current_seats: u32,
    pub included_seats: u32,
    pub stripe_subscription_id: Option<String>,
    pub stripe_base_item_id: Option<String>,
    pub stripe_seat_item_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct WorkspaceRow {
    id: Uuid,
    name: String,
    plan: PlanTier,
    billing_period: BillingPeriod,
    current_seats: i32,
    included_seats: i32,
    stripe_subscription_id: Option<String>,
    stripe_base_item_id: Option<String>,
    stripe_seat_item_id: Option<String>,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            plan: row.plan,
            billing_period: row.billing_period,
            current_seats: non_negative(row.current_seats),
            included_seats: non_negative(row.included_seats),
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_base_item_id: row.stripe_base_item_id,
            stripe_seat_item_id: row.stripe_seat_item_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub email: String,
    pub name: String,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Input for creating a user
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub name: String,
}

impl NewUser {
    pub fn validate(&self) -> BillingResult<()> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(BillingError::InvalidInput(format!(
                "invalid email address '{}'",
                self.email
            )));
        }
        if self.name.trim().is_empty() {
            return Err(BillingError::InvalidInput("name must not be empty".into()));
        }
        Ok(())
    }
}

/// Plan plus active-user count, read in one query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatSnapshot {
    pub plan: PlanTier,
    pub active_users: u32,
}

/// Current usage along every dimension a plan limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UsageSnapshot {
    pub team_members: u32,
    pub active_projects: u32,
    pub active_seats: u32,
}

/// Local state written after a remote plan change succeeded.
///
/// The seat count is not part of it: it is recounted under the row lock when
/// the change is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanChange {
    pub plan: PlanTier,
    pub billing_period: BillingPeriod,
    pub included_seats: u32,
    pub base_item_id: Option<String>,
    pub seat_item_id: Option<String>,
}

fn non_negative(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn to_column(value: u32) -> BillingResult<i32> {
    i32::try_from(value)
        .map_err(|_| BillingError::Internal(format!("seat count {value} out of range")))
}

// =============================================================================
// Store contract
// =============================================================================

/// Read and write access to workspace billing state
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn get_workspace(&self, workspace_id: Uuid) -> BillingResult<Option<Workspace>>;

    /// Authoritative seat count: active users of the workspace
    async fn count_active_users(&self, workspace_id: Uuid) -> BillingResult<u32>;

    /// Plan and active-user count in a single round trip
    async fn seat_snapshot(&self, workspace_id: Uuid) -> BillingResult<Option<SeatSnapshot>>;

    async fn usage_snapshot(&self, workspace_id: Uuid) -> BillingResult<UsageSnapshot>;

    async fn is_owner(&self, workspace_id: Uuid, user_id: Uuid) -> BillingResult<bool>;

    async fn save_current_seats(&self, workspace_id: Uuid, seats: u32) -> BillingResult<()>;

    async fn save_seat_item(&self, workspace_id: Uuid, item_id: Option<&str>) -> BillingResult<()>;

    /// Workspaces with a remote subscription, for the periodic sweep
    async fn list_subscribed_workspaces(&self) -> BillingResult<Vec<Uuid>>;

    async fn begin_seat_transaction(
        &self,
        workspace_id: Uuid,
    ) -> BillingResult<Box<dyn SeatTransaction>>;
}

/// Serializable unit of work over one workspace's seats.
///
/// Dropping the transaction without calling [`SeatTransaction::commit`] rolls
/// it back.
#[async_trait]
pub trait SeatTransaction: Send {
    async fn count_active_users(&mut self) -> BillingResult<u32>;

    /// Plan of the workspace as seen inside the transaction. Locks the
    /// workspace row until commit.
    async fn plan(&mut self) -> BillingResult<PlanTier>;

    /// Plan an in-flight change is moving to. While set, admission is capped
    /// by the lower of the two plans' maximums.
    async fn pending_plan(&mut self) -> BillingResult<Option<PlanTier>>;

    async fn set_pending_plan(&mut self, plan: Option<PlanTier>) -> BillingResult<()>;

    /// Persist a completed plan change with the seat count taken in this
    /// transaction, clearing any pending plan
    async fn apply_plan_change(
        &mut self,
        change: &PlanChange,
        current_seats: u32,
    ) -> BillingResult<()>;

    async fn find_user(&mut self, user_id: Uuid) -> BillingResult<Option<User>>;

    async fn insert_user(&mut self, user: &NewUser) -> BillingResult<User>;

    async fn set_user_active(&mut self, user_id: Uuid, active: bool) -> BillingResult<User>;

    async fn set_current_seats(&mut self, seats: u32) -> BillingResult<()>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;
}

// =============================================================================
// Postgres
// =============================================================================

const WORKSPACE_COLUMNS: &str = "id, name, plan, billing_period, current_seats, included_seats, \
     stripe_subscription_id, stripe_base_item_id, stripe_seat_item_id";

const USER_COLUMNS: &str = "id, workspace_id, email, name, active, created_at";

/// Age after which a pending plan no longer caps admission
const PENDING_PLAN_TTL_MINUTES: u32 = 15;

/// Postgres-backed [`WorkspaceStore`]
#[derive(Clone)]
pub struct PgWorkspaceStore {
    pool: PgPool,
}

impl PgWorkspaceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WorkspaceStore for PgWorkspaceStore {
    async fn get_workspace(&self, workspace_id: Uuid) -> BillingResult<Option<Workspace>> {
        let row: Option<WorkspaceRow> = sqlx::query_as(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = $1"
        ))
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Workspace::from))
    }

    async fn count_active_users(&self, workspace_id: Uuid) -> BillingResult<u32> {
        let (active,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM users WHERE workspace_id = $1 AND active = TRUE",
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count(active))
    }

    async fn seat_snapshot(&self, workspace_id: Uuid) -> BillingResult<Option<SeatSnapshot>> {
        let row: Option<(PlanTier, i64)> = sqlx::query_as(
            r#"
            SELECT w.plan,
                   (SELECT COUNT(*) FROM users u
                    WHERE u.workspace_id = w.id AND u.active = TRUE)
            FROM workspaces w
            WHERE w.id = $1
            "#,
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(plan, active)| SeatSnapshot {
            plan,
            active_users: count(active),
        }))
    }

    async fn usage_snapshot(&self, workspace_id: Uuid) -> BillingResult<UsageSnapshot> {
        let (members, projects, seats): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM workspace_members
                 WHERE workspace_id = $1 AND status = 'active'),
                (SELECT COUNT(*) FROM projects
                 WHERE workspace_id = $1 AND archived = FALSE),
                (SELECT COUNT(*) FROM users
                 WHERE workspace_id = $1 AND active = TRUE)
            "#,
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageSnapshot {
            team_members: count(members),
            active_projects: count(projects),
            active_seats: count(seats),
        })
    }

    async fn is_owner(&self, workspace_id: Uuid, user_id: Uuid) -> BillingResult<bool> {
        let (owner,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM workspace_members
                WHERE workspace_id = $1 AND user_id = $2
                  AND role = 'owner' AND status = 'active'
            )
            "#,
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(owner)
    }

    async fn save_current_seats(&self, workspace_id: Uuid, seats: u32) -> BillingResult<()> {
        sqlx::query(
            "UPDATE workspaces SET current_seats = $2, seats_synced_at = NOW(), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(workspace_id)
        .bind(to_column(seats)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_seat_item(&self, workspace_id: Uuid, item_id: Option<&str>) -> BillingResult<()> {
        sqlx::query(
            "UPDATE workspaces SET stripe_seat_item_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(workspace_id)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_subscribed_workspaces(&self) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM workspaces WHERE stripe_subscription_id IS NOT NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn begin_seat_transaction(
        &self,
        workspace_id: Uuid,
    ) -> BillingResult<Box<dyn SeatTransaction>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgSeatTransaction { tx, workspace_id }))
    }
}

struct PgSeatTransaction {
    tx: Transaction<'static, Postgres>,
    workspace_id: Uuid,
}

#[async_trait]
impl SeatTransaction for PgSeatTransaction {
    async fn count_active_users(&mut self) -> BillingResult<u32> {
        let (active,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM users WHERE workspace_id = $1 AND active = TRUE",
        )
        .bind(self.workspace_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(count(active))
    }

    async fn plan(&mut self) -> BillingResult<PlanTier> {
        // Row lock makes concurrent admissions queue behind each other
        let row: Option<(PlanTier,)> =
            sqlx::query_as("SELECT plan FROM workspaces WHERE id = $1 FOR UPDATE")
                .bind(self.workspace_id)
                .fetch_optional(&mut *self.tx)
                .await?;

        row.map(|(plan,)| plan)
            .ok_or_else(|| BillingError::NotFound(format!("workspace {}", self.workspace_id)))
    }

    async fn pending_plan(&mut self) -> BillingResult<Option<PlanTier>> {
        // A reservation left behind by a crashed change stops capping after the TTL
        let row: Option<(Option<PlanTier>,)> = sqlx::query_as(&format!(
            "SELECT pending_plan FROM workspaces \
             WHERE id = $1 AND pending_plan_at > NOW() - INTERVAL '{PENDING_PLAN_TTL_MINUTES} minutes'"
        ))
        .bind(self.workspace_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.and_then(|(plan,)| plan))
    }

    async fn set_pending_plan(&mut self, plan: Option<PlanTier>) -> BillingResult<()> {
        sqlx::query(
            "UPDATE workspaces \
             SET pending_plan = $2, pending_plan_at = CASE WHEN $2 IS NULL THEN NULL ELSE NOW() END, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(self.workspace_id)
        .bind(plan)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn apply_plan_change(
        &mut self,
        change: &PlanChange,
        current_seats: u32,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET plan = $2,
                billing_period = $3,
                included_seats = $4,
                current_seats = $5,
                stripe_base_item_id = COALESCE($6, stripe_base_item_id),
                stripe_seat_item_id = $7,
                pending_plan = NULL,
                pending_plan_at = NULL,
                seats_synced_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(self.workspace_id)
        .bind(change.plan)
        .bind(change.billing_period)
        .bind(to_column(change.included_seats)?)
        .bind(to_column(current_seats)?)
        .bind(change.base_item_id.as_deref())
        .bind(change.seat_item_id.as_deref())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("workspace {}", self.workspace_id)));
        }
        Ok(())
    }

    async fn find_user(&mut self, user_id: Uuid) -> BillingResult<Option<User>> {
        let user: Option<User> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND workspace_id = $2"
        ))
        .bind(user_id)
        .bind(self.workspace_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(user)
    }

    async fn insert_user(&mut self, user: &NewUser) -> BillingResult<User> {
        let created: User = sqlx::query_as(&format!(
            "INSERT INTO users (id, workspace_id, email, name, active) \
             VALUES ($1, $2, $3, $4, TRUE) RETURNING {USER_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(self.workspace_id)
        .bind(user.email.trim().to_lowercase())
        .bind(user.name.trim())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| {
            let duplicate = e
                .as_database_error()
                .and_then(|d| d.code())
                .is_some_and(|code| code == "23505");
            if duplicate {
                BillingError::InvalidInput(format!(
                    "a user with email '{}' already exists in this workspace",
                    user.email
                ))
            } else {
                BillingError::from(e)
            }
        })?;

        Ok(created)
    }

    async fn set_user_active(&mut self, user_id: Uuid, active: bool) -> BillingResult<User> {
        let user: Option<User> = sqlx::query_as(&format!(
            "UPDATE users SET active = $3, updated_at = NOW() \
             WHERE id = $1 AND workspace_id = $2 RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(self.workspace_id)
        .bind(active)
        .fetch_optional(&mut *self.tx)
        .await?;

        user.ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))
    }

    async fn set_current_seats(&mut self, seats: u32) -> BillingResult<()> {
        sqlx::query("UPDATE workspaces SET current_seats = $2, updated_at = NOW() WHERE id = $1")
            .bind(self.workspace_id)
            .bind(to_column(seats)?)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user_validation() {
        let ok = NewUser {
            email: "ada@example.com".into(),
            name: "Ada".into(),
        };
        assert!(ok.validate().is_ok());

        let bad_email = NewUser {
            email: "ada.example.com".into(),
            name: "Ada".into(),
        };
        assert!(matches!(
            bad_email.validate(),
            Err(BillingError::InvalidInput(_))
        ));

        let blank_name = NewUser {
            email: "ada@example.com".into(),
            name: "   ".into(),
        };
        assert!(blank_name.validate().is_err());
    }

    #[test]
    fn test_negative_column_clamps_to_zero() {
        assert_eq!(non_negative(-3), 0);
        assert_eq!(non_negative(42), 42);
        assert_eq!(count(7), 7);
    }

    #[test]
    fn test_row_conversion() {
        let row = WorkspaceRow {
            id: Uuid::nil(),
            name: "Acme".into(),
            plan: PlanTier::Growth,
            billing_period: BillingPeriod::Yearly,
            current_seats: 33,
            included_seats: 30,
            stripe_subscription_id: Some("sub_1".into()),
            stripe_base_item_id: None,
            stripe_seat_item_id: Some("si_seat".into()),
        };
        let workspace = Workspace::from(row);
        assert_eq!(workspace.current_seats, 33);
        assert_eq!(workspace.included_seats, 30);
        assert_eq!(workspace.plan, PlanTier::Growth);
    }
}
