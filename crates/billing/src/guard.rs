//! Transactional seat admission
//!
//! Every operation that adds an active user recounts seats and re-reads the
//! plan inside one serializable transaction, so two concurrent admissions can
//! never both take the last seat. The remote seat item is reconciled after
//! commit and never inside the transaction.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::reconcile::SeatSyncHandle;
use crate::seats::SeatLimitExceeded;
use crate::store::{NewUser, SeatTransaction, User, WorkspaceStore};

/// Attempts per operation when the database reports a serialization failure
const MAX_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct TransactionalSeatGuard {
    store: Arc<dyn WorkspaceStore>,
    sync: Option<SeatSyncHandle>,
}

impl TransactionalSeatGuard {
    pub fn new(store: Arc<dyn WorkspaceStore>) -> Self {
        Self { store, sync: None }
    }

    /// Queue a reconciliation after every committed seat change
    pub fn with_sync(mut self, sync: SeatSyncHandle) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Create an active user if the plan has a free seat
    pub async fn add_user_with_seat_check(
        &self,
        workspace_id: Uuid,
        user: NewUser,
    ) -> BillingResult<User> {
        user.validate()?;

        let mut attempt = 1;
        let created = loop {
            match self.try_add_user(workspace_id, &user).await {
                Err(BillingError::ConcurrentModification(reason)) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(
                        workspace_id = %workspace_id,
                        attempt = attempt,
                        reason = %reason,
                        "Seat admission conflicted with a concurrent change, retrying"
                    );
                    attempt += 1;
                }
                result => break result?,
            }
        };

        tracing::info!(
            workspace_id = %workspace_id,
            user_id = %created.id,
            "User added"
        );
        self.schedule_sync(workspace_id);
        Ok(created)
    }

    /// Re-activate a user, consuming a seat
    pub async fn activate_user_with_seat_check(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> BillingResult<User> {
        let mut attempt = 1;
        let (user, changed) = loop {
            match self.try_activate(workspace_id, user_id).await {
                Err(BillingError::ConcurrentModification(reason)) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(
                        workspace_id = %workspace_id,
                        user_id = %user_id,
                        attempt = attempt,
                        reason = %reason,
                        "Seat activation conflicted with a concurrent change, retrying"
                    );
                    attempt += 1;
                }
                result => break result?,
            }
        };

        if changed {
            tracing::info!(workspace_id = %workspace_id, user_id = %user_id, "User activated");
            self.schedule_sync(workspace_id);
        }
        Ok(user)
    }

    /// Deactivate a user, releasing their seat. Always allowed.
    pub async fn deactivate_user(&self, workspace_id: Uuid, user_id: Uuid) -> BillingResult<User> {
        let mut attempt = 1;
        let (user, changed) = loop {
            match self.try_deactivate(workspace_id, user_id).await {
                Err(BillingError::ConcurrentModification(_)) if attempt < MAX_ATTEMPTS => {
                    attempt += 1;
                }
                result => break result?,
            }
        };

        if changed {
            tracing::info!(workspace_id = %workspace_id, user_id = %user_id, "User deactivated");
            self.schedule_sync(workspace_id);
        }
        Ok(user)
    }

    async fn try_add_user(&self, workspace_id: Uuid, user: &NewUser) -> BillingResult<User> {
        let mut tx = self.store.begin_seat_transaction(workspace_id).await?;

        let active = tx.count_active_users().await?;
        ensure_free_seat(tx.as_mut(), active).await?;

        let created = tx.insert_user(user).await?;
        tx.set_current_seats(active + 1).await?;
        tx.commit().await?;

        Ok(created)
    }

    async fn try_activate(&self, workspace_id: Uuid, user_id: Uuid) -> BillingResult<(User, bool)> {
        let mut tx = self.store.begin_seat_transaction(workspace_id).await?;

        let existing = tx
            .find_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))?;
        if existing.active {
            return Ok((existing, false));
        }

        let active = tx.count_active_users().await?;
        ensure_free_seat(tx.as_mut(), active).await?;

        let user = tx.set_user_active(user_id, true).await?;
        tx.set_current_seats(active + 1).await?;
        tx.commit().await?;

        Ok((user, true))
    }

    async fn try_deactivate(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> BillingResult<(User, bool)> {
        let mut tx = self.store.begin_seat_transaction(workspace_id).await?;

        let existing = tx
            .find_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))?;
        if !existing.active {
            return Ok((existing, false));
        }

        let user = tx.set_user_active(user_id, false).await?;
        let active = tx.count_active_users().await?;
        tx.set_current_seats(active).await?;
        tx.commit().await?;

        Ok((user, true))
    }

    fn schedule_sync(&self, workspace_id: Uuid) {
        if let Some(sync) = &self.sync {
            sync.enqueue(workspace_id);
        }
    }
}

/// Fail with [`BillingError::SeatLimitExceeded`] when one more seat would pass the plan maximum.
///
/// While a plan change is in flight the lower of the two maximums applies, so
/// a downgrade cannot complete over its target's limit.
async fn ensure_free_seat(tx: &mut dyn SeatTransaction, active: u32) -> BillingResult<()> {
    let plan = tx.plan().await?;
    let max = match tx.pending_plan().await? {
        Some(pending) => plan.max_seats().min(pending.max_seats()),
        None => plan.max_seats(),
    };
    if active.saturating_add(1) > max {
        return Err(BillingError::SeatLimitExceeded(SeatLimitExceeded {
            current: active,
            max,
            next_plan: plan.next(),
        }));
    }
    Ok(())
}
