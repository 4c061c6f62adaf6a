// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries seat and downgrade details
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Plancap Billing Module
//!
//! Seat-based billing: admission of users against plan limits, reconciliation
//! of the per-seat subscription item with Stripe, and plan transitions.
//!
//! ## Features
//!
//! - **Seat Admission**: Serializable check-then-insert so the plan maximum holds under concurrency
//! - **Seat Reconciliation**: Create, resize or delete the seat item after each committed change
//! - **Plan Transitions**: Upgrades and period changes charged immediately, downgrades at renewal
//! - **Downgrade Validation**: Team member, project and seat limits of the target plan
//! - **Invariants**: Periodic consistency checks over cached seats and remote items

pub mod client;
pub mod error;
pub mod guard;
pub mod invariants;
pub mod reconcile;
pub mod seats;
pub mod store;
pub mod subscriptions;

#[cfg(any(test, feature = "test-billing"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{
    BillingGateway, InvoiceStatus, ItemOperation, PriceIds, ProrationMode, RemoteInvoice,
    RemoteLineItem, RemoteSubscription, StripeClient, StripeConfig, SubscriptionUpdate,
    TierPrices,
};

// Error
pub use error::{BillingError, BillingResult};

// Guard
pub use guard::TransactionalSeatGuard;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Reconciliation
pub use reconcile::{
    spawn_seat_sync_worker, SeatItemAction, SeatSyncHandle, SubscriptionReconciler,
    SweepSummary, SyncResult,
};

// Seats
pub use seats::{
    calculate_extra_seats, can_downgrade_to, DowngradeBlocked, DowngradeCheck, SeatAdmission,
    SeatCounter, SeatDecision, SeatLimitExceeded, SeatSummary, UsageDimension,
};

// Store
pub use store::{
    NewUser, PgWorkspaceStore, PlanChange, SeatSnapshot, SeatTransaction, UsageSnapshot, User,
    Workspace, WorkspaceStore,
};

// Subscriptions
pub use subscriptions::{
    BaseItemRef, InvoiceSettlement, PlanChangePreview, SubscriptionService, TransitionKind,
    TransitionResult,
};

use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinHandle;

/// Main billing service that combines all seat billing functionality
pub struct BillingService {
    pub admission: SeatAdmission,
    pub guard: TransactionalSeatGuard,
    pub reconciler: Arc<SubscriptionReconciler>,
    pub subscriptions: SubscriptionService,
    sync_task: JoinHandle<()>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let prices = Arc::new(config.price_ids.clone());
        let store: Arc<dyn WorkspaceStore> = Arc::new(PgWorkspaceStore::new(pool));
        let gateway: Arc<dyn BillingGateway> = Arc::new(StripeClient::new(config));
        Self::with_parts(store, gateway, prices)
    }

    /// Assemble the service from any store and gateway.
    ///
    /// Spawns the post-commit seat sync task, so it must be called inside a
    /// Tokio runtime.
    pub fn with_parts(
        store: Arc<dyn WorkspaceStore>,
        gateway: Arc<dyn BillingGateway>,
        prices: Arc<PriceIds>,
    ) -> Self {
        let reconciler = Arc::new(SubscriptionReconciler::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&prices),
        ));
        let (sync, sync_task) = spawn_seat_sync_worker(Arc::clone(&reconciler));

        Self {
            admission: SeatAdmission::new(Arc::clone(&store)),
            guard: TransactionalSeatGuard::new(Arc::clone(&store)).with_sync(sync.clone()),
            reconciler,
            subscriptions: SubscriptionService::new(store, gateway, prices).with_sync(sync),
            sync_task,
        }
    }

    /// Stop the seat sync task. Queued syncs not yet started are dropped and
    /// left to the periodic sweep.
    pub fn shutdown(&self) {
        self.sync_task.abort();
    }
}
