// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Seat Billing
//!
//! Tests critical boundary conditions and race conditions in:
//! - Seat admission (SEAT-A01 to SEAT-A04)
//! - Seat item reconciliation (SEAT-R01 to SEAT-R04)
//! - Plan transitions (SEAT-T01 to SEAT-T06)

#[cfg(test)]
mod admission_tests {
    use std::sync::Arc;

    use plancap_shared::PlanTier;
    use tokio::sync::Barrier;

    use crate::error::BillingError;
    use crate::guard::TransactionalSeatGuard;
    use crate::seats::SeatDecision;
    use crate::store::NewUser;
    use crate::testing::{workspace, InMemoryWorkspaceStore};

    fn new_user(n: usize) -> NewUser {
        NewUser {
            email: format!("racer{n}@example.com"),
            name: format!("Racer {n}"),
        }
    }

    // =========================================================================
    // SEAT-A01: 10 concurrent admissions for the last free seat - one winner
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_for_last_seat() {
        let store = InMemoryWorkspaceStore::new();
        let id = store.insert_workspace(workspace(PlanTier::Starter));
        store.seed_active_users(id, 19);

        let guard = TransactionalSeatGuard::new(Arc::new(store.clone()));
        let barrier = Arc::new(Barrier::new(10));

        let handles: Vec<_> = (0..10)
            .map(|n| {
                let guard = guard.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    guard.add_user_with_seat_check(id, new_user(n)).await
                })
            })
            .collect();

        let mut admitted = 0;
        let mut refused = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(BillingError::SeatLimitExceeded(limit)) => {
                    assert_eq!(limit.current, 20);
                    refused += 1;
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        assert_eq!(admitted, 1, "Exactly one request may take the last seat");
        assert_eq!(refused, 9);
        assert_eq!(store.active_users(id), 20);
        assert_eq!(store.workspace(id).current_seats, 20);
    }

    // =========================================================================
    // SEAT-A02: Growth at 59 allows one more, at 60 refuses
    // =========================================================================
    #[test]
    fn test_growth_boundary_decisions() {
        assert_eq!(
            SeatDecision::evaluate(PlanTier::Growth, 59),
            SeatDecision::AllowedRequiresRemoteUpdate { extra_seats: 30 }
        );
        assert!(!SeatDecision::evaluate(PlanTier::Growth, 60).is_allowed());
    }

    // =========================================================================
    // SEAT-A03: Crossing the included allowance needs a remote update
    // =========================================================================
    #[test]
    fn test_included_boundary_decisions() {
        assert_eq!(
            SeatDecision::evaluate(PlanTier::Growth, 28),
            SeatDecision::AllowedNoRemoteUpdate
        );
        assert_eq!(
            SeatDecision::evaluate(PlanTier::Growth, 29),
            SeatDecision::AllowedNoRemoteUpdate
        );
        assert_eq!(
            SeatDecision::evaluate(PlanTier::Growth, 30),
            SeatDecision::AllowedRequiresRemoteUpdate { extra_seats: 1 }
        );
    }

    // =========================================================================
    // SEAT-A04: Drifted cache is corrected by the next admission
    // =========================================================================
    #[tokio::test]
    async fn test_admission_heals_stale_cache() {
        let store = InMemoryWorkspaceStore::new();
        let mut ws = workspace(PlanTier::Growth);
        ws.current_seats = 2;
        let id = store.insert_workspace(ws);
        store.seed_active_users(id, 7);

        TransactionalSeatGuard::new(Arc::new(store.clone()))
            .add_user_with_seat_check(id, new_user(0))
            .await
            .unwrap();

        assert_eq!(store.workspace(id).current_seats, 8);
    }
}

#[cfg(test)]
mod reconciliation_tests {
    use std::sync::Arc;

    use plancap_shared::PlanTier;
    use uuid::Uuid;

    use crate::client::ProrationMode;
    use crate::guard::TransactionalSeatGuard;
    use crate::reconcile::{SeatItemAction, SubscriptionReconciler};
    use crate::store::NewUser;
    use crate::testing::{test_prices, workspace, InMemoryWorkspaceStore, MockBillingGateway};

    struct Setup {
        store: InMemoryWorkspaceStore,
        gateway: MockBillingGateway,
        guard: TransactionalSeatGuard,
        reconciler: SubscriptionReconciler,
        workspace_id: Uuid,
    }

    fn growth_workspace(active_users: u32) -> Setup {
        let store = InMemoryWorkspaceStore::new();
        let gateway = MockBillingGateway::new();

        let mut ws = workspace(PlanTier::Growth);
        ws.stripe_subscription_id = Some("sub_edge".into());
        ws.stripe_base_item_id = Some("si_base".into());
        ws.current_seats = active_users;
        gateway.add_subscription("sub_edge", &[("si_base", "price_growth_monthly", 1)]);

        let workspace_id = store.insert_workspace(ws);
        store.seed_active_users(workspace_id, active_users);

        let guard = TransactionalSeatGuard::new(Arc::new(store.clone()));
        let reconciler = SubscriptionReconciler::new(
            Arc::new(store.clone()),
            Arc::new(gateway.clone()),
            Arc::new(test_prices()),
        );
        Setup {
            store,
            gateway,
            guard,
            reconciler,
            workspace_id,
        }
    }

    async fn add_users(setup: &Setup, count: usize) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for n in 0..count {
            let user = setup
                .guard
                .add_user_with_seat_check(
                    setup.workspace_id,
                    NewUser {
                        email: format!("{}@example.com", Uuid::new_v4().simple()),
                        name: format!("Added {n}"),
                    },
                )
                .await
                .unwrap();
            ids.push(user.id);
        }
        ids
    }

    // =========================================================================
    // SEAT-R01: 28 -> 33 users creates the seat item with quantity 3
    // =========================================================================
    #[tokio::test]
    async fn test_crossing_allowance_creates_seat_item() {
        let setup = growth_workspace(28);
        add_users(&setup, 5).await;

        let result = setup
            .reconciler
            .sync_workspace_seats(setup.workspace_id)
            .await
            .unwrap();

        let SeatItemAction::Created { item_id, quantity } = result.action else {
            panic!("expected a created seat item, got {:?}", result.action);
        };
        assert_eq!(quantity, 3);
        assert_eq!(result.current_seats, 33);
        assert!(result.stripe_updated);

        let remote = setup.gateway.subscription("sub_edge");
        let item = remote.item(&item_id).unwrap();
        assert_eq!(item.price_id.as_deref(), Some("price_growth_monthly_seat"));
        assert_eq!(item.quantity, 3);
        assert_eq!(
            setup.store.workspace(setup.workspace_id).stripe_seat_item_id,
            Some(item_id)
        );
    }

    // =========================================================================
    // SEAT-R02: 33 -> 36 resizes the same item to 6, charged now
    // =========================================================================
    #[tokio::test]
    async fn test_growth_resizes_existing_item() {
        let setup = growth_workspace(28);
        add_users(&setup, 5).await;
        let first = setup
            .reconciler
            .sync_workspace_seats(setup.workspace_id)
            .await
            .unwrap();
        let SeatItemAction::Created { item_id, .. } = first.action else {
            panic!("expected a created seat item");
        };

        add_users(&setup, 3).await;
        let result = setup
            .reconciler
            .sync_workspace_seats(setup.workspace_id)
            .await
            .unwrap();

        assert_eq!(
            result.action,
            SeatItemAction::Resized {
                item_id: item_id.clone(),
                from: 3,
                to: 6,
                proration: ProrationMode::AlwaysInvoice,
            }
        );
        let remote = setup.gateway.subscription("sub_edge");
        assert_eq!(remote.items.len(), 2, "No second seat item may appear");
        assert_eq!(remote.item(&item_id).unwrap().quantity, 6);
    }

    // =========================================================================
    // SEAT-R03: 33 -> 28 removes the seat item entirely
    // =========================================================================
    #[tokio::test]
    async fn test_dropping_below_allowance_deletes_item() {
        let setup = growth_workspace(28);
        let added = add_users(&setup, 5).await;
        setup
            .reconciler
            .sync_workspace_seats(setup.workspace_id)
            .await
            .unwrap();

        for user_id in added {
            setup
                .guard
                .deactivate_user(setup.workspace_id, user_id)
                .await
                .unwrap();
        }
        let result = setup
            .reconciler
            .sync_workspace_seats(setup.workspace_id)
            .await
            .unwrap();

        assert!(matches!(result.action, SeatItemAction::Deleted { .. }));
        assert_eq!(result.extra_seats, 0);
        assert_eq!(setup.gateway.subscription("sub_edge").items.len(), 1);
        assert_eq!(
            setup.store.workspace(setup.workspace_id).stripe_seat_item_id,
            None
        );
    }

    // =========================================================================
    // SEAT-R04: A second sync with nothing changed makes no remote writes
    // =========================================================================
    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let setup = growth_workspace(34);
        setup
            .reconciler
            .sync_workspace_seats(setup.workspace_id)
            .await
            .unwrap();
        setup.gateway.clear_calls();

        let again = setup
            .reconciler
            .sync_workspace_seats(setup.workspace_id)
            .await
            .unwrap();

        assert_eq!(again.action, SeatItemAction::Unchanged);
        assert!(!again.stripe_updated);
        assert_eq!(setup.gateway.mutation_count(), 0);
    }
}

#[cfg(test)]
mod transition_tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use plancap_shared::{BillingPeriod, PlanTier};
    use uuid::Uuid;

    use crate::client::{
        BillingGateway, InvoiceStatus, ItemOperation, ProrationMode, RemoteInvoice,
        RemoteLineItem, RemoteSubscription, SubscriptionUpdate,
    };
    use crate::error::{BillingError, BillingResult};
    use crate::guard::TransactionalSeatGuard;
    use crate::seats::UsageDimension;
    use crate::store::{NewUser, User};
    use crate::subscriptions::{SubscriptionService, TransitionKind};
    use crate::testing::{
        test_prices, workspace, GatewayCall, InMemoryWorkspaceStore, MockBillingGateway,
    };

    /// Gateway that admits one user through the seat guard while the
    /// subscription update is in flight
    struct AdmitDuringUpdate {
        inner: MockBillingGateway,
        guard: TransactionalSeatGuard,
        workspace_id: Uuid,
        admitted: Mutex<Option<BillingResult<User>>>,
    }

    #[async_trait]
    impl BillingGateway for AdmitDuringUpdate {
        async fn retrieve_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<RemoteSubscription> {
            self.inner.retrieve_subscription(subscription_id).await
        }

        async fn create_item(
            &self,
            subscription_id: &str,
            price_id: &str,
            quantity: u64,
            proration: ProrationMode,
        ) -> BillingResult<RemoteLineItem> {
            self.inner
                .create_item(subscription_id, price_id, quantity, proration)
                .await
        }

        async fn update_item(
            &self,
            item_id: &str,
            price_id: Option<&str>,
            quantity: Option<u64>,
            proration: ProrationMode,
        ) -> BillingResult<RemoteLineItem> {
            self.inner
                .update_item(item_id, price_id, quantity, proration)
                .await
        }

        async fn delete_item(&self, item_id: &str) -> BillingResult<()> {
            self.inner.delete_item(item_id).await
        }

        async fn update_subscription(
            &self,
            subscription_id: &str,
            update: SubscriptionUpdate,
        ) -> BillingResult<RemoteSubscription> {
            let admitted = self
                .guard
                .add_user_with_seat_check(
                    self.workspace_id,
                    NewUser {
                        email: "late@example.com".into(),
                        name: "Late Arrival".into(),
                    },
                )
                .await;
            *self.admitted.lock().unwrap() = Some(admitted);
            self.inner.update_subscription(subscription_id, update).await
        }

        async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
            self.inner.retrieve_invoice(invoice_id).await
        }

        async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
            self.inner.finalize_invoice(invoice_id).await
        }

        async fn pay_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
            self.inner.pay_invoice(invoice_id).await
        }
    }

    fn admitting(setup: &Setup) -> (Arc<AdmitDuringUpdate>, SubscriptionService) {
        let gateway = Arc::new(AdmitDuringUpdate {
            inner: setup.gateway.clone(),
            guard: TransactionalSeatGuard::new(Arc::new(setup.store.clone())),
            workspace_id: setup.workspace_id,
            admitted: Mutex::new(None),
        });
        let service = SubscriptionService::new(
            Arc::new(setup.store.clone()),
            Arc::clone(&gateway) as Arc<dyn BillingGateway>,
            Arc::new(test_prices()),
        );
        (gateway, service)
    }

    struct Setup {
        store: InMemoryWorkspaceStore,
        gateway: MockBillingGateway,
        service: SubscriptionService,
        workspace_id: Uuid,
        owner: Uuid,
    }

    fn subscribed(plan: PlanTier, active_users: u32) -> Setup {
        let store = InMemoryWorkspaceStore::new();
        let gateway = MockBillingGateway::new();

        let mut ws = workspace(plan);
        ws.stripe_subscription_id = Some("sub_t".into());
        ws.stripe_base_item_id = Some("si_base".into());
        ws.current_seats = active_users;
        let base_price = format!("price_{plan}_monthly");
        gateway.add_subscription("sub_t", &[("si_base", &base_price, 1)]);

        let workspace_id = store.insert_workspace(ws);
        store.seed_active_users(workspace_id, active_users);
        let owner = Uuid::new_v4();
        store.add_owner(workspace_id, owner);

        let service = SubscriptionService::new(
            Arc::new(store.clone()),
            Arc::new(gateway.clone()),
            Arc::new(test_prices()),
        );
        Setup {
            store,
            gateway,
            service,
            workspace_id,
            owner,
        }
    }

    // =========================================================================
    // SEAT-T01: Same plan and period - no remote calls at all
    // =========================================================================
    #[tokio::test]
    async fn test_noop_transition_is_silent() {
        let setup = subscribed(PlanTier::Growth, 12);
        let result = setup
            .service
            .change_plan(
                setup.workspace_id,
                setup.owner,
                PlanTier::Growth,
                BillingPeriod::Monthly,
            )
            .await
            .unwrap();

        assert_eq!(result.kind, TransitionKind::NoOp);
        assert_eq!(result.proration, None);
        assert!(setup.gateway.calls().is_empty());
    }

    // =========================================================================
    // SEAT-T02: 12 team members cannot move to Growth (limit 10)
    // =========================================================================
    #[tokio::test]
    async fn test_downgrade_blocked_by_team_members() {
        let setup = subscribed(PlanTier::Scale, 20);
        setup.store.set_usage(setup.workspace_id, 12, 5);

        let err = setup
            .service
            .change_plan(
                setup.workspace_id,
                setup.owner,
                PlanTier::Growth,
                BillingPeriod::Monthly,
            )
            .await
            .unwrap_err();

        match err {
            BillingError::DowngradeBlocked(blocked) => {
                assert_eq!(blocked.dimension, UsageDimension::TeamMembers);
                assert_eq!(blocked.current, 12);
                assert_eq!(blocked.limit, 10);
                assert_eq!(blocked.excess(), 2);
            }
            other => panic!("expected downgrade block, got {other:?}"),
        }
        assert!(setup.gateway.calls().is_empty());
        assert_eq!(
            setup.store.workspace(setup.workspace_id).plan,
            PlanTier::Scale
        );
    }

    // =========================================================================
    // SEAT-T03: Starter -> Growth swaps the base price and collects now
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_swaps_price_and_settles_invoice() {
        let setup = subscribed(PlanTier::Starter, 8);
        let result = setup
            .service
            .change_plan(
                setup.workspace_id,
                setup.owner,
                PlanTier::Growth,
                BillingPeriod::Monthly,
            )
            .await
            .unwrap();

        assert_eq!(result.kind, TransitionKind::Upgrade);
        assert_eq!(result.proration, Some(ProrationMode::AlwaysInvoice));
        assert_eq!(result.included_seats, 30);
        assert_eq!(result.extra_seats, 0);

        let update = setup
            .gateway
            .calls()
            .into_iter()
            .find_map(|call| match call {
                GatewayCall::UpdateSubscription { update, .. } => Some(update),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            update.items,
            vec![ItemOperation::SetPrice {
                item_id: "si_base".into(),
                price_id: "price_growth_monthly".into(),
            }]
        );
        assert_eq!(update.proration, ProrationMode::AlwaysInvoice);
        assert!(update.keep_billing_anchor);
        assert!(update.error_if_incomplete);

        let invoice = result.invoice.unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.payment_error, None);
        let calls = setup.gateway.calls();
        assert!(calls.contains(&GatewayCall::FinalizeInvoice(invoice.invoice_id.clone())));
        assert!(calls.contains(&GatewayCall::PayInvoice(invoice.invoice_id)));

        let ws = setup.store.workspace(setup.workspace_id);
        assert_eq!(ws.plan, PlanTier::Growth);
        assert_eq!(ws.included_seats, 30);
    }

    // =========================================================================
    // SEAT-T04: Provider outage during the update leaves the plan untouched
    // =========================================================================
    #[tokio::test]
    async fn test_provider_failure_keeps_local_plan() {
        let setup = subscribed(PlanTier::Starter, 8);
        setup.gateway.fail_requests(true);

        let err = setup
            .service
            .change_plan(
                setup.workspace_id,
                setup.owner,
                PlanTier::Growth,
                BillingPeriod::Monthly,
            )
            .await
            .unwrap_err();

        assert!(err.is_external());
        let ws = setup.store.workspace(setup.workspace_id);
        assert_eq!(ws.plan, PlanTier::Starter);
        assert_eq!(ws.included_seats, 10);
    }

    // =========================================================================
    // SEAT-T05: Admission racing a downgrade cannot exceed the target maximum
    // =========================================================================
    #[tokio::test]
    async fn test_admission_during_downgrade_respects_target_max() {
        let setup = subscribed(PlanTier::Scale, 60);
        let (gateway, service) = admitting(&setup);

        let result = service
            .change_plan(
                setup.workspace_id,
                setup.owner,
                PlanTier::Growth,
                BillingPeriod::Monthly,
            )
            .await
            .unwrap();
        assert_eq!(result.kind, TransitionKind::Downgrade);

        let admitted = gateway.admitted.lock().unwrap().take().unwrap();
        match admitted {
            Err(BillingError::SeatLimitExceeded(limit)) => {
                assert_eq!(limit.current, 60);
                assert_eq!(limit.max, 60);
            }
            other => panic!("expected the in-flight admission to be refused, got {other:?}"),
        }

        let ws = setup.store.workspace(setup.workspace_id);
        assert_eq!(ws.plan, PlanTier::Growth);
        assert!(setup.store.active_users(setup.workspace_id) <= PlanTier::Growth.max_seats());
        assert_eq!(ws.current_seats, setup.store.active_users(setup.workspace_id));
        assert_eq!(setup.store.pending_plan(setup.workspace_id), None);
    }

    // =========================================================================
    // SEAT-T06: A user admitted during an upgrade is kept in the cached count
    // =========================================================================
    #[tokio::test]
    async fn test_admission_during_upgrade_is_counted() {
        let setup = subscribed(PlanTier::Starter, 10);
        let (gateway, service) = admitting(&setup);

        let result = service
            .change_plan(
                setup.workspace_id,
                setup.owner,
                PlanTier::Growth,
                BillingPeriod::Monthly,
            )
            .await
            .unwrap();

        assert!(gateway.admitted.lock().unwrap().take().unwrap().is_ok());
        let ws = setup.store.workspace(setup.workspace_id);
        assert_eq!(setup.store.active_users(setup.workspace_id), 11);
        assert_eq!(ws.current_seats, 11);
        assert_eq!(result.extra_seats, 0);
    }
}
