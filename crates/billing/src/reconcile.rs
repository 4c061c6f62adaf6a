//! Seat reconciliation against the billing provider
//!
//! The local database is the source of truth for seats. Reconciliation pushes
//! the derived extra-seat count into the subscription's seat item, creating,
//! resizing or deleting it as needed. Remote failures are logged and left for
//! the next sync; they never undo a committed local change.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::{BillingGateway, PriceIds, ProrationMode, RemoteLineItem};
use crate::error::{BillingError, BillingResult};
use crate::seats::{calculate_extra_seats, SeatCounter};
use crate::store::{Workspace, WorkspaceStore};

/// What reconciliation did to the remote seat item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SeatItemAction {
    /// Workspace has no remote subscription
    LocalOnly,
    /// Remote state already matched
    Unchanged,
    Created {
        item_id: String,
        quantity: u64,
    },
    Resized {
        item_id: String,
        from: u64,
        to: u64,
        proration: ProrationMode,
    },
    Deleted {
        item_id: String,
    },
    /// Seat item could not be brought in line; see `remote_error`
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub workspace_id: Uuid,
    /// Cached seat count before this sync
    pub previous_seats: u32,
    /// Extra seats implied by the cached count before this sync
    pub previous_extra_seats: u32,
    pub current_seats: u32,
    pub extra_seats: u32,
    pub stripe_updated: bool,
    pub action: SeatItemAction,
    /// Why the seat item step failed, whether remote or configuration
    pub remote_error: Option<String>,
}

/// Outcome of a full sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub workspaces_checked: usize,
    pub remote_updates: usize,
    pub remote_failures: usize,
    pub local_failures: usize,
}

pub struct SubscriptionReconciler {
    store: Arc<dyn WorkspaceStore>,
    gateway: Arc<dyn BillingGateway>,
    prices: Arc<PriceIds>,
    counter: SeatCounter,
}

impl SubscriptionReconciler {
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        gateway: Arc<dyn BillingGateway>,
        prices: Arc<PriceIds>,
    ) -> Self {
        let counter = SeatCounter::new(Arc::clone(&store));
        Self {
            store,
            gateway,
            prices,
            counter,
        }
    }

    /// Bring the cached seat count and the remote seat item in line with the
    /// active user count.
    ///
    /// Only failures to load the workspace or persist the recount are returned
    /// as errors. Anything that goes wrong while aligning the seat item is
    /// logged and reported in [`SyncResult::remote_error`]; the next sync
    /// retries it. Running it again with nothing changed makes no remote writes.
    pub async fn sync_workspace_seats(&self, workspace_id: Uuid) -> BillingResult<SyncResult> {
        let workspace = self
            .store
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("workspace {workspace_id}")))?;

        let current_seats = self.counter.current_seats(workspace_id).await?;
        if current_seats != workspace.current_seats {
            self.store
                .save_current_seats(workspace_id, current_seats)
                .await?;
        }

        let extra_seats = calculate_extra_seats(current_seats, workspace.included_seats);
        let mut result = SyncResult {
            workspace_id,
            previous_seats: workspace.current_seats,
            previous_extra_seats: calculate_extra_seats(
                workspace.current_seats,
                workspace.included_seats,
            ),
            current_seats,
            extra_seats,
            stripe_updated: false,
            action: SeatItemAction::LocalOnly,
            remote_error: None,
        };

        let Some(subscription_id) = workspace.stripe_subscription_id.as_deref() else {
            return Ok(result);
        };

        match self
            .sync_seat_item(&workspace, subscription_id, extra_seats)
            .await
        {
            Ok(action) => {
                result.stripe_updated = !matches!(action, SeatItemAction::Unchanged);
                result.action = action;
            }
            Err(e) => {
                tracing::error!(
                    workspace_id = %workspace_id,
                    subscription_id = %subscription_id,
                    extra_seats = extra_seats,
                    error = %e,
                    "Seat item sync failed; local seats are committed and the next sync will retry"
                );
                result.action = SeatItemAction::Failed;
                result.remote_error = Some(e.to_string());
            }
        }

        Ok(result)
    }

    async fn sync_seat_item(
        &self,
        workspace: &Workspace,
        subscription_id: &str,
        extra_seats: u32,
    ) -> BillingResult<SeatItemAction> {
        let existing = self.remote_seat_item(workspace, subscription_id).await?;
        let target = u64::from(extra_seats);

        match (existing, target) {
            (None, 0) => Ok(SeatItemAction::Unchanged),
            (None, quantity) => {
                let price = self
                    .prices
                    .seat_price(workspace.plan, workspace.billing_period)?;
                let item = self
                    .gateway
                    .create_item(subscription_id, price, quantity, ProrationMode::AlwaysInvoice)
                    .await?;
                self.store
                    .save_seat_item(workspace.id, Some(&item.id))
                    .await?;

                tracing::info!(
                    workspace_id = %workspace.id,
                    item_id = %item.id,
                    quantity = quantity,
                    "Created seat item"
                );
                Ok(SeatItemAction::Created {
                    item_id: item.id,
                    quantity,
                })
            }
            (Some(item), 0) => {
                self.gateway.delete_item(&item.id).await?;
                self.store.save_seat_item(workspace.id, None).await?;

                tracing::info!(
                    workspace_id = %workspace.id,
                    item_id = %item.id,
                    "Deleted seat item, no extra seats left"
                );
                Ok(SeatItemAction::Deleted { item_id: item.id })
            }
            (Some(item), quantity) if item.quantity == quantity => Ok(SeatItemAction::Unchanged),
            (Some(item), quantity) => {
                // Growth is charged now; a reduction becomes a credit on the next invoice.
                // Direction is judged against the billed quantity, not the cached
                // count, so a drifted cache cannot invert it.
                let proration = if quantity > item.quantity {
                    ProrationMode::AlwaysInvoice
                } else {
                    ProrationMode::CreateProrations
                };
                self.gateway
                    .update_item(&item.id, None, Some(quantity), proration)
                    .await?;

                tracing::info!(
                    workspace_id = %workspace.id,
                    item_id = %item.id,
                    from = item.quantity,
                    to = quantity,
                    proration = proration.as_str(),
                    "Resized seat item"
                );
                Ok(SeatItemAction::Resized {
                    item_id: item.id,
                    from: item.quantity,
                    to: quantity,
                    proration,
                })
            }
        }
    }

    /// The seat item as the provider currently bills it.
    ///
    /// Without a usable stored id, an item already priced at the plan's seat
    /// price is adopted, so an item whose id was never saved is not billed twice.
    async fn remote_seat_item(
        &self,
        workspace: &Workspace,
        subscription_id: &str,
    ) -> BillingResult<Option<RemoteLineItem>> {
        let subscription = self.gateway.retrieve_subscription(subscription_id).await?;

        if let Some(item_id) = workspace.stripe_seat_item_id.as_deref() {
            if let Some(item) = subscription.item(item_id) {
                return Ok(Some(item.clone()));
            }
            tracing::warn!(
                workspace_id = %workspace.id,
                item_id = %item_id,
                "Stored seat item is gone from the subscription, forgetting it"
            );
            self.store.save_seat_item(workspace.id, None).await?;
        }

        let seat_price = self
            .prices
            .seat_price(workspace.plan, workspace.billing_period)?;
        let Some(orphan) = subscription.item_with_price(seat_price) else {
            return Ok(None);
        };

        tracing::warn!(
            workspace_id = %workspace.id,
            item_id = %orphan.id,
            quantity = orphan.quantity,
            "Adopting unrecorded seat item"
        );
        self.store
            .save_seat_item(workspace.id, Some(&orphan.id))
            .await?;
        Ok(Some(orphan.clone()))
    }

    /// Reconcile every workspace with a remote subscription
    pub async fn reconcile_all(&self) -> BillingResult<SweepSummary> {
        let workspaces = self.store.list_subscribed_workspaces().await?;
        let mut summary = SweepSummary::default();

        for workspace_id in workspaces {
            summary.workspaces_checked += 1;
            match self.sync_workspace_seats(workspace_id).await {
                Ok(result) if result.remote_error.is_some() => summary.remote_failures += 1,
                Ok(result) if result.stripe_updated => summary.remote_updates += 1,
                Ok(_) => {}
                Err(e) => {
                    summary.local_failures += 1;
                    tracing::error!(
                        workspace_id = %workspace_id,
                        error = %e,
                        "Seat reconciliation failed"
                    );
                }
            }
        }

        tracing::info!(
            checked = summary.workspaces_checked,
            updated = summary.remote_updates,
            remote_failures = summary.remote_failures,
            local_failures = summary.local_failures,
            "Seat sweep complete"
        );
        Ok(summary)
    }
}

// =============================================================================
// Post-commit sync queue
// =============================================================================

/// Queues workspaces for reconciliation after a seat change commits
#[derive(Clone)]
pub struct SeatSyncHandle {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl SeatSyncHandle {
    pub fn enqueue(&self, workspace_id: Uuid) {
        if self.tx.send(workspace_id).is_err() {
            tracing::warn!(
                workspace_id = %workspace_id,
                "Seat sync worker stopped; change will be picked up by the next sweep"
            );
        }
    }
}

/// Start the background task that drains the sync queue.
///
/// Requests that pile up while a sync runs are coalesced per workspace. The
/// task ends once every [`SeatSyncHandle`] is dropped.
pub fn spawn_seat_sync_worker(
    reconciler: Arc<SubscriptionReconciler>,
) -> (SeatSyncHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Uuid>();

    let task = tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            let mut seen = HashSet::from([first]);
            while let Ok(next) = rx.try_recv() {
                if seen.insert(next) {
                    batch.push(next);
                }
            }

            for workspace_id in batch {
                match reconciler.sync_workspace_seats(workspace_id).await {
                    Ok(result) => tracing::debug!(
                        workspace_id = %workspace_id,
                        seats = result.current_seats,
                        stripe_updated = result.stripe_updated,
                        "Seat sync finished"
                    ),
                    Err(e) => tracing::error!(
                        workspace_id = %workspace_id,
                        error = %e,
                        "Seat sync failed"
                    ),
                }
            }
        }
        tracing::debug!("Seat sync worker stopped");
    });

    (SeatSyncHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        test_prices, workspace, GatewayCall, InMemoryWorkspaceStore, MockBillingGateway,
    };
    use plancap_shared::PlanTier;

    struct Fixture {
        store: InMemoryWorkspaceStore,
        gateway: MockBillingGateway,
        reconciler: SubscriptionReconciler,
        workspace_id: Uuid,
    }

    fn fixture(active_users: u32, seat_item: Option<(&str, u64)>) -> Fixture {
        let store = InMemoryWorkspaceStore::new();
        let gateway = MockBillingGateway::new();

        let mut ws = workspace(PlanTier::Growth);
        ws.stripe_subscription_id = Some("sub_1".into());
        ws.stripe_base_item_id = Some("si_base".into());
        ws.current_seats = active_users;

        let mut items = vec![("si_base", "price_growth_monthly", 1)];
        if let Some((item_id, quantity)) = seat_item {
            ws.stripe_seat_item_id = Some(item_id.to_string());
            items.push((item_id, "price_growth_monthly_seat", quantity));
        }
        gateway.add_subscription("sub_1", &items);

        let workspace_id = store.insert_workspace(ws);
        store.seed_active_users(workspace_id, active_users);

        let reconciler = SubscriptionReconciler::new(
            Arc::new(store.clone()),
            Arc::new(gateway.clone()),
            Arc::new(test_prices()),
        );
        Fixture {
            store,
            gateway,
            reconciler,
            workspace_id,
        }
    }

    #[tokio::test]
    async fn test_within_included_seats_makes_no_remote_writes() {
        let f = fixture(28, None);
        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();

        assert_eq!(result.action, SeatItemAction::Unchanged);
        assert!(!result.stripe_updated);
        assert_eq!(f.gateway.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_creates_seat_item_when_crossing_included() {
        let f = fixture(33, None);
        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();

        assert_eq!(result.extra_seats, 3);
        assert!(result.stripe_updated);
        let calls: Vec<_> = f
            .gateway
            .calls()
            .into_iter()
            .filter(GatewayCall::is_mutation)
            .collect();
        assert_eq!(calls.len(), 1);
        assert!(matches!(
            &calls[0],
            GatewayCall::CreateItem { quantity: 3, proration: ProrationMode::AlwaysInvoice, price_id, .. }
                if price_id == "price_growth_monthly_seat"
        ));
        assert!(f.store.workspace(f.workspace_id).stripe_seat_item_id.is_some());
    }

    #[tokio::test]
    async fn test_growth_is_invoiced_and_reduction_is_credited() {
        let f = fixture(36, Some(("si_seat", 3)));
        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();
        assert_eq!(
            result.action,
            SeatItemAction::Resized {
                item_id: "si_seat".into(),
                from: 3,
                to: 6,
                proration: ProrationMode::AlwaysInvoice,
            }
        );

        let f = fixture(31, Some(("si_seat", 6)));
        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();
        assert_eq!(
            result.action,
            SeatItemAction::Resized {
                item_id: "si_seat".into(),
                from: 6,
                to: 1,
                proration: ProrationMode::CreateProrations,
            }
        );
    }

    #[tokio::test]
    async fn test_deletes_seat_item_when_back_within_included() {
        let f = fixture(28, Some(("si_seat", 3)));
        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();

        assert_eq!(
            result.action,
            SeatItemAction::Deleted {
                item_id: "si_seat".into()
            }
        );
        assert!(f.store.workspace(f.workspace_id).stripe_seat_item_id.is_none());
        assert!(f.gateway.subscription("sub_1").item("si_seat").is_none());
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_local_seats() {
        let f = fixture(33, None);
        f.gateway.fail_requests(true);

        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();

        assert_eq!(result.action, SeatItemAction::Failed);
        assert!(result.remote_error.is_some());
        assert_eq!(f.store.workspace(f.workspace_id).current_seats, 33);
        assert!(f.store.workspace(f.workspace_id).stripe_seat_item_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_workspace_is_an_error() {
        let f = fixture(1, None);
        let err = f
            .reconciler
            .sync_workspace_seats(Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cached_count_is_repaired() {
        let f = fixture(12, None);
        f.store.seed_active_users(f.workspace_id, 3);

        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();

        assert_eq!(result.previous_seats, 12);
        assert_eq!(result.current_seats, 15);
        assert_eq!(f.store.workspace(f.workspace_id).current_seats, 15);
    }

    #[tokio::test]
    async fn test_stale_seat_item_reference_is_recreated() {
        let f = fixture(33, None);
        f.store
            .save_seat_item(f.workspace_id, Some("si_deleted_elsewhere"))
            .await
            .unwrap();

        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();

        assert!(matches!(result.action, SeatItemAction::Created { quantity: 3, .. }));
        let stored = f.store.workspace(f.workspace_id).stripe_seat_item_id;
        assert_ne!(stored.as_deref(), Some("si_deleted_elsewhere"));
    }

    #[tokio::test]
    async fn test_resize_direction_follows_billed_quantity() {
        let f = fixture(36, Some(("si_seat", 3)));
        f.store.save_current_seats(f.workspace_id, 40).await.unwrap();

        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();

        assert_eq!(result.previous_seats, 40);
        assert_eq!(result.previous_extra_seats, 10);
        assert_eq!(result.extra_seats, 6);
        assert_eq!(
            result.action,
            SeatItemAction::Resized {
                item_id: "si_seat".into(),
                from: 3,
                to: 6,
                proration: ProrationMode::AlwaysInvoice,
            }
        );
    }

    #[tokio::test]
    async fn test_unrecorded_seat_item_is_adopted() {
        let f = fixture(33, None);
        f.gateway.add_subscription(
            "sub_1",
            &[
                ("si_base", "price_growth_monthly", 1),
                ("si_orphan", "price_growth_monthly_seat", 3),
            ],
        );

        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();

        assert_eq!(result.action, SeatItemAction::Unchanged);
        assert_eq!(f.gateway.mutation_count(), 0);
        assert_eq!(
            f.store.workspace(f.workspace_id).stripe_seat_item_id.as_deref(),
            Some("si_orphan")
        );
    }

    #[tokio::test]
    async fn test_unrecorded_seat_item_is_resized_not_duplicated() {
        let f = fixture(36, None);
        f.gateway.add_subscription(
            "sub_1",
            &[
                ("si_base", "price_growth_monthly", 1),
                ("si_orphan", "price_growth_monthly_seat", 3),
            ],
        );

        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();

        assert_eq!(
            result.action,
            SeatItemAction::Resized {
                item_id: "si_orphan".into(),
                from: 3,
                to: 6,
                proration: ProrationMode::AlwaysInvoice,
            }
        );
        let remote = f.gateway.subscription("sub_1");
        let seat_items = remote
            .items
            .iter()
            .filter(|item| item.price_id.as_deref() == Some("price_growth_monthly_seat"))
            .count();
        assert_eq!(seat_items, 1);
        assert_eq!(remote.item("si_orphan").unwrap().quantity, 6);
    }

    #[tokio::test]
    async fn test_unrecorded_seat_item_is_deleted_within_included() {
        let f = fixture(28, None);
        f.gateway.add_subscription(
            "sub_1",
            &[
                ("si_base", "price_growth_monthly", 1),
                ("si_orphan", "price_growth_monthly_seat", 3),
            ],
        );

        let result = f
            .reconciler
            .sync_workspace_seats(f.workspace_id)
            .await
            .unwrap();

        assert_eq!(
            result.action,
            SeatItemAction::Deleted {
                item_id: "si_orphan".into()
            }
        );
        assert!(f.gateway.subscription("sub_1").item("si_orphan").is_none());
        assert!(f.store.workspace(f.workspace_id).stripe_seat_item_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_seat_price_is_reported_not_returned() {
        let f = fixture(33, None);
        let reconciler = SubscriptionReconciler::new(
            Arc::new(f.store.clone()),
            Arc::new(f.gateway.clone()),
            Arc::new(PriceIds::default()),
        );

        let result = reconciler.sync_workspace_seats(f.workspace_id).await.unwrap();

        assert_eq!(result.action, SeatItemAction::Failed);
        assert!(!result.stripe_updated);
        assert!(result.remote_error.is_some());
        assert_eq!(f.store.workspace(f.workspace_id).current_seats, 33);
        assert_eq!(f.gateway.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_counts_outcomes() {
        let f = fixture(33, None);
        let mut local = workspace(PlanTier::Starter);
        local.stripe_subscription_id = None;
        f.store.insert_workspace(local);

        let summary = f.reconciler.reconcile_all().await.unwrap();
        assert_eq!(summary.workspaces_checked, 1);
        assert_eq!(summary.remote_updates, 1);
        assert_eq!(summary.remote_failures, 0);
    }

    #[tokio::test]
    async fn test_sync_worker_drains_queue() {
        let f = fixture(33, None);
        let (handle, task) = spawn_seat_sync_worker(Arc::new(f.reconciler));

        handle.enqueue(f.workspace_id);
        handle.enqueue(f.workspace_id);
        drop(handle);
        task.await.unwrap();

        let creates = f
            .gateway
            .calls()
            .into_iter()
            .filter(|c| matches!(c, GatewayCall::CreateItem { .. }))
            .count();
        assert_eq!(creates, 1);
        assert!(f.store.workspace(f.workspace_id).stripe_seat_item_id.is_some());
    }
}
