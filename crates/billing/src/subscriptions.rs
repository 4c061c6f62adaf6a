//! Plan transitions
//!
//! Moves a workspace between tiers and billing periods. The base item's price
//! is rewritten in place and the seat item is recomputed against the target
//! tier's included seats, all in one subscription update. The billing anchor
//! is never moved.

use std::collections::HashMap;
use std::sync::Arc;

use plancap_shared::{BillingPeriod, PlanTier};
use serde::Serialize;
use uuid::Uuid;

use crate::client::{
    BillingGateway, InvoiceStatus, ItemOperation, PriceIds, ProrationMode, RemoteLineItem,
    RemoteSubscription, SubscriptionUpdate,
};
use crate::error::{BillingError, BillingResult};
use crate::reconcile::SeatSyncHandle;
use crate::seats::{calculate_extra_seats, can_downgrade_to, DowngradeCheck, SeatCounter};
use crate::store::{PlanChange, Workspace, WorkspaceStore};

/// Kind of plan change, decided by tier order first and period second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Upgrade,
    Downgrade,
    PeriodChange,
    NoOp,
}

impl TransitionKind {
    pub fn classify(
        from_plan: PlanTier,
        from_period: BillingPeriod,
        to_plan: PlanTier,
        to_period: BillingPeriod,
    ) -> Self {
        match to_plan.cmp(&from_plan) {
            std::cmp::Ordering::Greater => Self::Upgrade,
            std::cmp::Ordering::Less => Self::Downgrade,
            std::cmp::Ordering::Equal if to_period != from_period => Self::PeriodChange,
            std::cmp::Ordering::Equal => Self::NoOp,
        }
    }

    /// Upgrades and period changes are charged immediately; downgrades take
    /// effect without a credit.
    pub fn proration(&self) -> ProrationMode {
        match self {
            Self::Upgrade | Self::PeriodChange => ProrationMode::AlwaysInvoice,
            Self::Downgrade | Self::NoOp => ProrationMode::None,
        }
    }

    /// Whether the change leaves an invoice that must be settled right away
    pub fn settles_invoice(&self) -> bool {
        matches!(self, Self::Upgrade | Self::PeriodChange)
    }
}

/// Which remote item carries the base price.
///
/// Subscriptions created before seat billing have a single item and no
/// stored base item id; for those the first item is the base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseItemRef {
    Stored(String),
    LegacyFirstItem(String),
}

impl BaseItemRef {
    pub fn resolve(
        stored_base: Option<&str>,
        stored_seat: Option<&str>,
        subscription: &RemoteSubscription,
    ) -> BillingResult<Self> {
        if let Some(id) = stored_base {
            if subscription.item(id).is_some() {
                return Ok(Self::Stored(id.to_string()));
            }
            tracing::warn!(
                subscription_id = %subscription.id,
                item_id = %id,
                "Stored base item missing from subscription, falling back to first item"
            );
        }

        subscription
            .items
            .iter()
            .find(|item| Some(item.id.as_str()) != stored_seat)
            .map(|item| Self::LegacyFirstItem(item.id.clone()))
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "subscription {} has no base item",
                    subscription.id
                ))
            })
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Stored(id) | Self::LegacyFirstItem(id) => id,
        }
    }
}

/// Item operations that move a subscription onto the target prices
pub fn build_item_operations(
    base: &BaseItemRef,
    seat_item: Option<&RemoteLineItem>,
    base_price: &str,
    seat_price: &str,
    extra_seats: u32,
) -> Vec<ItemOperation> {
    let mut ops = vec![ItemOperation::SetPrice {
        item_id: base.id().to_string(),
        price_id: base_price.to_string(),
    }];

    let quantity = u64::from(extra_seats);
    match (seat_item, quantity) {
        (Some(item), 0) => ops.push(ItemOperation::Delete {
            item_id: item.id.clone(),
        }),
        (Some(item), quantity) => ops.push(ItemOperation::SetPriceAndQuantity {
            item_id: item.id.clone(),
            price_id: seat_price.to_string(),
            quantity,
        }),
        (None, 0) => {}
        (None, quantity) => ops.push(ItemOperation::Add {
            price_id: seat_price.to_string(),
            quantity,
        }),
    }
    ops
}

/// State of the invoice produced by an immediate-charge transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceSettlement {
    pub invoice_id: String,
    pub status: InvoiceStatus,
    pub amount_due: i64,
    /// Set when finalizing or paying failed; the plan change is kept
    pub payment_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionResult {
    pub workspace_id: Uuid,
    pub kind: TransitionKind,
    pub from_plan: PlanTier,
    pub from_period: BillingPeriod,
    pub plan: PlanTier,
    pub billing_period: BillingPeriod,
    pub included_seats: u32,
    pub extra_seats: u32,
    pub proration: Option<ProrationMode>,
    pub invoice: Option<InvoiceSettlement>,
}

/// What a plan change would do, computed without touching the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanChangePreview {
    pub kind: TransitionKind,
    pub proration: Option<ProrationMode>,
    pub downgrade: DowngradeCheck,
    pub current_seats: u32,
    pub included_seats: u32,
    pub extra_seats: u32,
    pub max_seats: u32,
}

/// Attempts to persist a plan change when the database reports a serialization failure
const APPLY_ATTEMPTS: u32 = 3;

/// Remote side of a plan change, as accepted by the provider
struct PushedChange {
    base_item_id: String,
    seat_item_id: Option<String>,
    subscription: RemoteSubscription,
    /// Seat count the seat item was sized for
    counted_seats: u32,
    extra_seats: u32,
}

/// Executes plan transitions for workspace owners
pub struct SubscriptionService {
    store: Arc<dyn WorkspaceStore>,
    gateway: Arc<dyn BillingGateway>,
    prices: Arc<PriceIds>,
    counter: SeatCounter,
    sync: Option<SeatSyncHandle>,
}

impl SubscriptionService {
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
            sync: None,
        }
    }

    /// Queue a seat sync when seats moved while a plan change was in flight
    pub fn with_sync(mut self, sync: SeatSyncHandle) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Move a workspace to `target_plan` billed every `target_period`.
    ///
    /// Only owners may change plans. Downgrades are refused while usage
    /// exceeds the target's limits. A failed invoice payment after an upgrade
    /// is reported in the result but does not roll the plan back.
    ///
    /// The cached seat count is recounted when the new plan is saved, so users
    /// admitted while the provider call was in flight are not lost.
    pub async fn change_plan(
        &self,
        workspace_id: Uuid,
        requested_by: Uuid,
        target_plan: PlanTier,
        target_period: BillingPeriod,
    ) -> BillingResult<TransitionResult> {
        self.ensure_owner(workspace_id, requested_by).await?;
        let workspace = self.load_workspace(workspace_id).await?;

        let kind = TransitionKind::classify(
            workspace.plan,
            workspace.billing_period,
            target_plan,
            target_period,
        );

        tracing::info!(
            workspace_id = %workspace_id,
            from_plan = %workspace.plan,
            from_period = %workspace.billing_period,
            to_plan = %target_plan,
            to_period = %target_period,
            kind = ?kind,
            "Starting plan change"
        );

        if kind == TransitionKind::NoOp {
            return Ok(TransitionResult {
                workspace_id,
                kind,
                from_plan: workspace.plan,
                from_period: workspace.billing_period,
                plan: workspace.plan,
                billing_period: workspace.billing_period,
                included_seats: workspace.included_seats,
                extra_seats: calculate_extra_seats(
                    workspace.current_seats,
                    workspace.included_seats,
                ),
                proration: None,
                invoice: None,
            });
        }

        let subscription_id = workspace.stripe_subscription_id.clone().ok_or_else(|| {
            BillingError::NotFound(format!("workspace {workspace_id} has no subscription"))
        })?;

        let proration = kind.proration();
        let prices = self.prices.prices_for(target_plan, target_period)?;

        // Admissions queue behind the row lock and, once the reservation is
        // committed, are capped by the target's maximum until the change lands.
        let reserved = kind == TransitionKind::Downgrade;
        if reserved {
            self.reserve_downgrade(workspace_id, target_plan).await?;
        }

        let pushed = match self
            .push_remote(&workspace, &subscription_id, target_plan, target_period, proration)
            .await
        {
            Ok(pushed) => pushed,
            Err(e) => {
                tracing::error!(
                    workspace_id = %workspace_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Subscription update rejected, plan unchanged"
                );
                if reserved {
                    self.release_reservation(workspace_id).await;
                }
                return Err(e);
            }
        };

        let invoice = if kind.settles_invoice() {
            match pushed.subscription.latest_invoice_id.as_deref() {
                Some(invoice_id) => Some(self.settle_invoice(workspace_id, invoice_id).await),
                None => None,
            }
        } else {
            None
        };

        let included_seats = target_plan.included_seats();
        let seat_item_id = if pushed.extra_seats == 0 {
            None
        } else {
            pushed.seat_item_id.clone().or_else(|| {
                pushed
                    .subscription
                    .item_with_price(&prices.seat)
                    .map(|item| item.id.clone())
            })
        };

        let change = PlanChange {
            plan: target_plan,
            billing_period: target_period,
            included_seats,
            base_item_id: Some(pushed.base_item_id.clone()),
            seat_item_id,
        };

        // A failure here leaves any reservation in place: the provider already
        // bills the target plan, and the next sync or a retry converges.
        let current_seats = match self.apply_locally(workspace_id, &change).await {
            Ok(seats) => seats,
            Err(e) => {
                tracing::error!(
                    workspace_id = %workspace_id,
                    subscription_id = %subscription_id,
                    plan = %target_plan,
                    error = %e,
                    "Subscription updated but local plan could not be saved"
                );
                return Err(e);
            }
        };

        if current_seats != pushed.counted_seats {
            tracing::info!(
                workspace_id = %workspace_id,
                counted = pushed.counted_seats,
                current = current_seats,
                "Seats changed during plan change, scheduling seat sync"
            );
            if let Some(sync) = &self.sync {
                sync.enqueue(workspace_id);
            }
        }

        let extra_seats = calculate_extra_seats(current_seats, included_seats);
        tracing::info!(
            workspace_id = %workspace_id,
            plan = %target_plan,
            period = %target_period,
            current_seats = current_seats,
            extra_seats = extra_seats,
            proration = proration.as_str(),
            "Plan changed"
        );

        Ok(TransitionResult {
            workspace_id,
            kind,
            from_plan: workspace.plan,
            from_period: workspace.billing_period,
            plan: target_plan,
            billing_period: target_period,
            included_seats,
            extra_seats,
            proration: Some(proration),
            invoice,
        })
    }

    /// Check a downgrade against usage under the workspace row lock and mark
    /// it pending, so no admission can slip past the target's seat maximum
    async fn reserve_downgrade(
        &self,
        workspace_id: Uuid,
        target_plan: PlanTier,
    ) -> BillingResult<()> {
        let mut usage = self.store.usage_snapshot(workspace_id).await?;

        let mut tx = self.store.begin_seat_transaction(workspace_id).await?;
        tx.plan().await?;
        usage.active_seats = tx.count_active_users().await?;

        if let DowngradeCheck::Blocked(blocked) = can_downgrade_to(target_plan, &usage) {
            tracing::info!(
                workspace_id = %workspace_id,
                target_plan = %target_plan,
                dimension = blocked.dimension.as_str(),
                current = blocked.current,
                limit = blocked.limit,
                "Downgrade refused, usage exceeds target plan"
            );
            return Err(BillingError::DowngradeBlocked(blocked));
        }

        tx.set_pending_plan(Some(target_plan)).await?;
        tx.commit().await
    }

    async fn release_reservation(&self, workspace_id: Uuid) {
        let released = async {
            let mut tx = self.store.begin_seat_transaction(workspace_id).await?;
            tx.plan().await?;
            tx.set_pending_plan(None).await?;
            tx.commit().await
        }
        .await;

        if let Err(e) = released {
            tracing::warn!(
                workspace_id = %workspace_id,
                error = %e,
                "Could not clear pending plan; it expires on its own"
            );
        }
    }

    /// Rewrite the subscription's items for the target plan in one update
    async fn push_remote(
        &self,
        workspace: &Workspace,
        subscription_id: &str,
        target_plan: PlanTier,
        target_period: BillingPeriod,
        proration: ProrationMode,
    ) -> BillingResult<PushedChange> {
        let prices = self.prices.prices_for(target_plan, target_period)?;
        let counted_seats = self.counter.current_seats(workspace.id).await?;
        let extra_seats = calculate_extra_seats(counted_seats, target_plan.included_seats());

        let remote = self.gateway.retrieve_subscription(subscription_id).await?;
        let base = BaseItemRef::resolve(
            workspace.stripe_base_item_id.as_deref(),
            workspace.stripe_seat_item_id.as_deref(),
            &remote,
        )?;
        let seat_item = workspace
            .stripe_seat_item_id
            .as_deref()
            .and_then(|id| remote.item(id));

        let items =
            build_item_operations(&base, seat_item, &prices.base, &prices.seat, extra_seats);

        let mut metadata = HashMap::new();
        metadata.insert("workspace_id".to_string(), workspace.id.to_string());
        metadata.insert("plan".to_string(), target_plan.to_string());
        metadata.insert("billing_period".to_string(), target_period.to_string());

        let update = SubscriptionUpdate {
            items,
            metadata,
            proration,
            keep_billing_anchor: true,
            error_if_incomplete: true,
        };

        let subscription = self
            .gateway
            .update_subscription(subscription_id, update)
            .await?;

        Ok(PushedChange {
            base_item_id: base.id().to_string(),
            seat_item_id: seat_item.map(|item| item.id.clone()),
            subscription,
            counted_seats,
            extra_seats,
        })
    }

    /// Persist the plan with a fresh seat count taken under the row lock
    async fn apply_locally(&self, workspace_id: Uuid, change: &PlanChange) -> BillingResult<u32> {
        let mut attempt = 1;
        loop {
            let result = async {
                let mut tx = self.store.begin_seat_transaction(workspace_id).await?;
                tx.plan().await?;
                let seats = tx.count_active_users().await?;
                tx.apply_plan_change(change, seats).await?;
                tx.commit().await?;
                Ok::<_, BillingError>(seats)
            }
            .await;

            match result {
                Err(BillingError::ConcurrentModification(_)) if attempt < APPLY_ATTEMPTS => {
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Classify a change and run the downgrade check without remote calls
    pub async fn preview_plan_change(
        &self,
        workspace_id: Uuid,
        requested_by: Uuid,
        target_plan: PlanTier,
        target_period: BillingPeriod,
    ) -> BillingResult<PlanChangePreview> {
        self.ensure_owner(workspace_id, requested_by).await?;
        let workspace = self.load_workspace(workspace_id).await?;

        let kind = TransitionKind::classify(
            workspace.plan,
            workspace.billing_period,
            target_plan,
            target_period,
        );
        let usage = self.store.usage_snapshot(workspace_id).await?;
        let downgrade = match kind {
            TransitionKind::Downgrade => can_downgrade_to(target_plan, &usage),
            _ => DowngradeCheck::Allowed,
        };

        let included_seats = target_plan.included_seats();
        Ok(PlanChangePreview {
            kind,
            proration: (kind != TransitionKind::NoOp).then_some(kind.proration()),
            downgrade,
            current_seats: usage.active_seats,
            included_seats,
            extra_seats: calculate_extra_seats(usage.active_seats, included_seats),
            max_seats: target_plan.max_seats(),
        })
    }

    pub async fn ensure_owner(&self, workspace_id: Uuid, user_id: Uuid) -> BillingResult<()> {
        if self.store.is_owner(workspace_id, user_id).await? {
            Ok(())
        } else {
            tracing::warn!(
                workspace_id = %workspace_id,
                user_id = %user_id,
                "Plan change attempted by non-owner"
            );
            Err(BillingError::Unauthorized {
                workspace_id,
                user_id,
            })
        }
    }

    async fn load_workspace(&self, workspace_id: Uuid) -> BillingResult<Workspace> {
        self.store
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("workspace {workspace_id}")))
    }

    /// Finalize a draft invoice and try to collect it.
    ///
    /// Failures are logged and returned in the settlement, never as an error.
    async fn settle_invoice(&self, workspace_id: Uuid, invoice_id: &str) -> InvoiceSettlement {
        let mut settlement = InvoiceSettlement {
            invoice_id: invoice_id.to_string(),
            status: InvoiceStatus::Draft,
            amount_due: 0,
            payment_error: None,
        };

        if let Err(e) = self.try_settle(invoice_id, &mut settlement).await {
            let failure = BillingError::InvoicePayment {
                invoice_id: invoice_id.to_string(),
                message: e.to_string(),
            };
            tracing::error!(
                workspace_id = %workspace_id,
                invoice_id = %invoice_id,
                status = ?settlement.status,
                error = %failure,
                "Invoice payment failed after plan change; plan change kept"
            );
            settlement.payment_error = Some(failure.to_string());
        }
        settlement
    }

    async fn try_settle(
        &self,
        invoice_id: &str,
        settlement: &mut InvoiceSettlement,
    ) -> BillingResult<()> {
        let mut invoice = self.gateway.retrieve_invoice(invoice_id).await?;
        settlement.status = invoice.status;
        settlement.amount_due = invoice.amount_due;

        if invoice.status == InvoiceStatus::Draft {
            invoice = self.gateway.finalize_invoice(invoice_id).await?;
            settlement.status = invoice.status;
        }

        if invoice.status == InvoiceStatus::Open && invoice.amount_due > 0 {
            invoice = self.gateway.pay_invoice(invoice_id).await?;
            settlement.status = invoice.status;
            tracing::info!(
                invoice_id = %invoice_id,
                amount_due = invoice.amount_due,
                "Collected invoice for plan change"
            );
        }
        Ok(())
    }
}
