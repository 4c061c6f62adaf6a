//! In-memory store and recording gateway for tests.
//!
//! Available to other crates through the `test-billing` feature.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use plancap_shared::{BillingPeriod, PlanTier};
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::client::{
    BillingGateway, InvoiceStatus, ItemOperation, PriceIds, ProrationMode, RemoteInvoice,
    RemoteLineItem, RemoteSubscription, SubscriptionUpdate,
};
use crate::error::{BillingError, BillingResult};
use crate::store::{
    NewUser, PlanChange, SeatSnapshot, SeatTransaction, UsageSnapshot, User, Workspace,
    WorkspaceStore,
};

/// Price IDs for every tier and period, named `price_<tier>_<period>[_seat]`
pub fn test_prices() -> PriceIds {
    let mut prices = PriceIds::default();
    for tier in PlanTier::ALL {
        for period in [BillingPeriod::Monthly, BillingPeriod::Yearly] {
            prices = prices.with(
                tier,
                period,
                format!("price_{tier}_{period}"),
                format!("price_{tier}_{period}_seat"),
            );
        }
    }
    prices
}

/// A workspace on `plan` with no remote subscription
pub fn workspace(plan: PlanTier) -> Workspace {
    Workspace {
        id: Uuid::new_v4(),
        name: "Acme".to_string(),
        plan,
        billing_period: BillingPeriod::Monthly,
        current_seats: 0,
        included_seats: plan.included_seats(),
        stripe_subscription_id: None,
        stripe_base_item_id: None,
        stripe_seat_item_id: None,
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Default)]
struct StoreState {
    workspaces: HashMap<Uuid, Workspace>,
    users: HashMap<Uuid, User>,
    owners: HashSet<(Uuid, Uuid)>,
    team_members: HashMap<Uuid, u32>,
    projects: HashMap<Uuid, u32>,
    pending_plans: HashMap<Uuid, PlanTier>,
    failing_commits: u32,
    committed_transactions: u32,
}

impl StoreState {
    fn active_users(&self, workspace_id: Uuid) -> u32 {
        let count = self
            .users
            .values()
            .filter(|u| u.workspace_id == workspace_id && u.active)
            .count();
        u32::try_from(count).unwrap()
    }

    fn workspace_mut(&mut self, workspace_id: Uuid) -> BillingResult<&mut Workspace> {
        self.workspaces
            .get_mut(&workspace_id)
            .ok_or_else(|| BillingError::NotFound(format!("workspace {workspace_id}")))
    }
}

/// [`WorkspaceStore`] held in memory.
///
/// Seat transactions on the same workspace are serialized by a per-workspace
/// async mutex, which gives the same outcome as a serializable transaction.
#[derive(Clone, Default)]
pub struct InMemoryWorkspaceStore {
    state: Arc<Mutex<StoreState>>,
    locks: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl InMemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_workspace(&self, workspace: Workspace) -> Uuid {
        let id = workspace.id;
        self.state.lock().unwrap().workspaces.insert(id, workspace);
        id
    }

    pub fn workspace(&self, workspace_id: Uuid) -> Workspace {
        self.state.lock().unwrap().workspaces[&workspace_id].clone()
    }

    pub fn add_owner(&self, workspace_id: Uuid, user_id: Uuid) {
        self.state
            .lock()
            .unwrap()
            .owners
            .insert((workspace_id, user_id));
    }

    /// Insert `count` active users directly, bypassing the seat guard
    pub fn seed_active_users(&self, workspace_id: Uuid, count: u32) -> Vec<Uuid> {
        let mut state = self.state.lock().unwrap();
        (0..count)
            .map(|n| {
                let user = User {
                    id: Uuid::new_v4(),
                    workspace_id,
                    email: format!("seed-{n}-{}@example.com", Uuid::new_v4().simple()),
                    name: format!("Seed {n}"),
                    active: true,
                    created_at: OffsetDateTime::now_utc(),
                };
                let id = user.id;
                state.users.insert(id, user);
                id
            })
            .collect()
    }

    /// Flip users inactive directly, bypassing the seat guard
    pub fn deactivate_directly(&self, user_ids: &[Uuid]) {
        let mut state = self.state.lock().unwrap();
        for id in user_ids {
            if let Some(user) = state.users.get_mut(id) {
                user.active = false;
            }
        }
    }

    pub fn set_usage(&self, workspace_id: Uuid, team_members: u32, projects: u32) {
        let mut state = self.state.lock().unwrap();
        state.team_members.insert(workspace_id, team_members);
        state.projects.insert(workspace_id, projects);
    }

    pub fn active_users(&self, workspace_id: Uuid) -> u32 {
        self.state.lock().unwrap().active_users(workspace_id)
    }

    /// Mark a plan change as in flight, as `change_plan` does before the remote update
    pub fn set_pending_plan(&self, workspace_id: Uuid, plan: Option<PlanTier>) {
        let mut state = self.state.lock().unwrap();
        match plan {
            Some(plan) => state.pending_plans.insert(workspace_id, plan),
            None => state.pending_plans.remove(&workspace_id),
        };
    }

    pub fn pending_plan(&self, workspace_id: Uuid) -> Option<PlanTier> {
        self.state
            .lock()
            .unwrap()
            .pending_plans
            .get(&workspace_id)
            .copied()
    }

    /// Make the next `n` seat transaction commits fail with a serialization error
    pub fn fail_next_commits(&self, n: u32) {
        self.state.lock().unwrap().failing_commits = n;
    }

    pub fn committed_transactions(&self) -> u32 {
        self.state.lock().unwrap().committed_transactions
    }

    fn lock_for(&self, workspace_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(workspace_id)
            .or_default()
            .clone()
    }
}

#[async_trait]
impl WorkspaceStore for InMemoryWorkspaceStore {
    async fn get_workspace(&self, workspace_id: Uuid) -> BillingResult<Option<Workspace>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .workspaces
            .get(&workspace_id)
            .cloned())
    }

    async fn count_active_users(&self, workspace_id: Uuid) -> BillingResult<u32> {
        Ok(self.state.lock().unwrap().active_users(workspace_id))
    }

    async fn seat_snapshot(&self, workspace_id: Uuid) -> BillingResult<Option<SeatSnapshot>> {
        let state = self.state.lock().unwrap();
        Ok(state.workspaces.get(&workspace_id).map(|w| SeatSnapshot {
            plan: w.plan,
            active_users: state.active_users(workspace_id),
        }))
    }

    async fn usage_snapshot(&self, workspace_id: Uuid) -> BillingResult<UsageSnapshot> {
        let state = self.state.lock().unwrap();
        Ok(UsageSnapshot {
            team_members: state
                .team_members
                .get(&workspace_id)
                .copied()
                .unwrap_or(0),
            active_projects: state.projects.get(&workspace_id).copied().unwrap_or(0),
            active_seats: state.active_users(workspace_id),
        })
    }

    async fn is_owner(&self, workspace_id: Uuid, user_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .owners
            .contains(&(workspace_id, user_id)))
    }

    async fn save_current_seats(&self, workspace_id: Uuid, seats: u32) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        state.workspace_mut(workspace_id)?.current_seats = seats;
        Ok(())
    }

    async fn save_seat_item(&self, workspace_id: Uuid, item_id: Option<&str>) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        state.workspace_mut(workspace_id)?.stripe_seat_item_id = item_id.map(str::to_string);
        Ok(())
    }

    async fn list_subscribed_workspaces(&self) -> BillingResult<Vec<Uuid>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<Uuid> = state
            .workspaces
            .values()
            .filter(|w| w.stripe_subscription_id.is_some())
            .map(|w| w.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn begin_seat_transaction(
        &self,
        workspace_id: Uuid,
    ) -> BillingResult<Box<dyn SeatTransaction>> {
        let guard = self.lock_for(workspace_id).lock_owned().await;
        Ok(Box::new(InMemorySeatTransaction {
            workspace_id,
            state: Arc::clone(&self.state),
            _guard: guard,
            new_users: Vec::new(),
            activation: HashMap::new(),
            current_seats: None,
            pending_plan: None,
            plan_change: None,
        }))
    }
}

/// Buffers writes and applies them on commit
struct InMemorySeatTransaction {
    workspace_id: Uuid,
    state: Arc<Mutex<StoreState>>,
    _guard: OwnedMutexGuard<()>,
    new_users: Vec<User>,
    activation: HashMap<Uuid, bool>,
    current_seats: Option<u32>,
    pending_plan: Option<Option<PlanTier>>,
    plan_change: Option<(PlanChange, u32)>,
}

impl InMemorySeatTransaction {
    fn view_user(&self, state: &StoreState, user_id: Uuid) -> Option<User> {
        let mut user = self
            .new_users
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
            .or_else(|| {
                state
                    .users
                    .get(&user_id)
                    .filter(|u| u.workspace_id == self.workspace_id)
                    .cloned()
            })?;
        if let Some(active) = self.activation.get(&user_id) {
            user.active = *active;
        }
        Some(user)
    }
}

#[async_trait]
impl SeatTransaction for InMemorySeatTransaction {
    async fn count_active_users(&mut self) -> BillingResult<u32> {
        let state = self.state.lock().unwrap();
        let mut ids: HashSet<Uuid> = state
            .users
            .values()
            .filter(|u| u.workspace_id == self.workspace_id)
            .map(|u| u.id)
            .collect();
        ids.extend(self.new_users.iter().map(|u| u.id));

        let active = ids
            .into_iter()
            .filter_map(|id| self.view_user(&state, id))
            .filter(|u| u.active)
            .count();
        Ok(u32::try_from(active).unwrap())
    }

    async fn plan(&mut self) -> BillingResult<PlanTier> {
        if let Some((change, _)) = &self.plan_change {
            return Ok(change.plan);
        }
        let state = self.state.lock().unwrap();
        state
            .workspaces
            .get(&self.workspace_id)
            .map(|w| w.plan)
            .ok_or_else(|| BillingError::NotFound(format!("workspace {}", self.workspace_id)))
    }

    async fn pending_plan(&mut self) -> BillingResult<Option<PlanTier>> {
        if let Some(pending) = self.pending_plan {
            return Ok(pending);
        }
        let state = self.state.lock().unwrap();
        Ok(state.pending_plans.get(&self.workspace_id).copied())
    }

    async fn set_pending_plan(&mut self, plan: Option<PlanTier>) -> BillingResult<()> {
        self.pending_plan = Some(plan);
        Ok(())
    }

    async fn apply_plan_change(
        &mut self,
        change: &PlanChange,
        current_seats: u32,
    ) -> BillingResult<()> {
        self.plan_change = Some((change.clone(), current_seats));
        self.pending_plan = Some(None);
        Ok(())
    }

    async fn find_user(&mut self, user_id: Uuid) -> BillingResult<Option<User>> {
        let state = self.state.lock().unwrap();
        Ok(self.view_user(&state, user_id))
    }

    async fn insert_user(&mut self, user: &NewUser) -> BillingResult<User> {
        let email = user.email.trim().to_lowercase();
        let duplicate = {
            let state = self.state.lock().unwrap();
            state
                .users
                .values()
                .any(|u| u.workspace_id == self.workspace_id && u.email == email)
                || self.new_users.iter().any(|u| u.email == email)
        };
        if duplicate {
            return Err(BillingError::InvalidInput(format!(
                "a user with email '{}' already exists in this workspace",
                user.email
            )));
        }

        let created = User {
            id: Uuid::new_v4(),
            workspace_id: self.workspace_id,
            email,
            name: user.name.trim().to_string(),
            active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        self.new_users.push(created.clone());
        Ok(created)
    }

    async fn set_user_active(&mut self, user_id: Uuid, active: bool) -> BillingResult<User> {
        let exists = {
            let state = self.state.lock().unwrap();
            self.view_user(&state, user_id).is_some()
        };
        if !exists {
            return Err(BillingError::NotFound(format!("user {user_id}")));
        }
        self.activation.insert(user_id, active);

        let state = self.state.lock().unwrap();
        self.view_user(&state, user_id)
            .ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))
    }

    async fn set_current_seats(&mut self, seats: u32) -> BillingResult<()> {
        self.current_seats = Some(seats);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(BillingError::ConcurrentModification(
                "could not serialize access due to read/write dependencies".to_string(),
            ));
        }

        for user in &self.new_users {
            state.users.insert(user.id, user.clone());
        }
        for (id, active) in &self.activation {
            if let Some(user) = state.users.get_mut(id) {
                user.active = *active;
            }
        }
        if let Some(seats) = self.current_seats {
            state.workspace_mut(self.workspace_id)?.current_seats = seats;
        }
        if let Some((change, seats)) = &self.plan_change {
            let workspace = state.workspace_mut(self.workspace_id)?;
            workspace.plan = change.plan;
            workspace.billing_period = change.billing_period;
            workspace.included_seats = change.included_seats;
            workspace.current_seats = *seats;
            if let Some(base) = &change.base_item_id {
                workspace.stripe_base_item_id = Some(base.clone());
            }
            workspace.stripe_seat_item_id = change.seat_item_id.clone();
        }
        match self.pending_plan {
            Some(Some(plan)) => {
                state.pending_plans.insert(self.workspace_id, plan);
            }
            Some(None) => {
                state.pending_plans.remove(&self.workspace_id);
            }
            None => {}
        }
        state.committed_transactions += 1;
        Ok(())
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// A call received by [`MockBillingGateway`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    RetrieveSubscription(String),
    CreateItem {
        subscription_id: String,
        price_id: String,
        quantity: u64,
        proration: ProrationMode,
    },
    UpdateItem {
        item_id: String,
        price_id: Option<String>,
        quantity: Option<u64>,
        proration: ProrationMode,
    },
    DeleteItem(String),
    UpdateSubscription {
        subscription_id: String,
        update: SubscriptionUpdate,
    },
    RetrieveInvoice(String),
    FinalizeInvoice(String),
    PayInvoice(String),
}

impl GatewayCall {
    /// True for calls that change remote state
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::RetrieveSubscription(_) | Self::RetrieveInvoice(_)
        )
    }
}

#[derive(Default)]
struct GatewayState {
    subscriptions: HashMap<String, RemoteSubscription>,
    invoices: HashMap<String, RemoteInvoice>,
    calls: Vec<GatewayCall>,
    fail_requests: bool,
    fail_payments: bool,
    next_id: u64,
}

impl GatewayState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_mock_{}", self.next_id)
    }

    fn check(&self, operation: &'static str) -> BillingResult<()> {
        if self.fail_requests {
            return Err(BillingError::ExternalService {
                operation,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn subscription_with_item(&mut self, item_id: &str) -> Option<&mut RemoteSubscription> {
        self.subscriptions
            .values_mut()
            .find(|sub| sub.items.iter().any(|item| item.id == item_id))
    }
}

/// [`BillingGateway`] that keeps subscriptions in memory and records every call.
///
/// Updates with `AlwaysInvoice` proration open a draft invoice of 1000 cents
/// and set it as the subscription's latest invoice.
#[derive(Clone, Default)]
pub struct MockBillingGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl MockBillingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription with the given `(item_id, price_id, quantity)` items
    pub fn add_subscription(&self, subscription_id: &str, items: &[(&str, &str, u64)]) {
        let subscription = RemoteSubscription {
            id: subscription_id.to_string(),
            status: "active".to_string(),
            items: items
                .iter()
                .map(|(id, price, quantity)| RemoteLineItem {
                    id: id.to_string(),
                    price_id: Some(price.to_string()),
                    quantity: *quantity,
                })
                .collect(),
            latest_invoice_id: None,
        };
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .insert(subscription_id.to_string(), subscription);
    }

    pub fn subscription(&self, subscription_id: &str) -> RemoteSubscription {
        self.state.lock().unwrap().subscriptions[subscription_id].clone()
    }

    pub fn invoice(&self, invoice_id: &str) -> RemoteInvoice {
        self.state.lock().unwrap().invoices[invoice_id].clone()
    }

    pub fn fail_requests(&self, fail: bool) {
        self.state.lock().unwrap().fail_requests = fail;
    }

    pub fn fail_payments(&self, fail: bool) {
        self.state.lock().unwrap().fail_payments = fail;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls().iter().filter(|c| c.is_mutation()).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn record(&self, call: GatewayCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl BillingGateway for MockBillingGateway {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<RemoteSubscription> {
        self.record(GatewayCall::RetrieveSubscription(
            subscription_id.to_string(),
        ));
        let state = self.state.lock().unwrap();
        state.check("retrieve_subscription")?;
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::ExternalService {
                operation: "retrieve_subscription",
                message: format!("No such subscription: '{subscription_id}'"),
            })
    }

    async fn create_item(
        &self,
        subscription_id: &str,
        price_id: &str,
        quantity: u64,
        proration: ProrationMode,
    ) -> BillingResult<RemoteLineItem> {
        self.record(GatewayCall::CreateItem {
            subscription_id: subscription_id.to_string(),
            price_id: price_id.to_string(),
            quantity,
            proration,
        });
        let mut state = self.state.lock().unwrap();
        state.check("create_item")?;
        let item = RemoteLineItem {
            id: state.next_id("si"),
            price_id: Some(price_id.to_string()),
            quantity,
        };
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::ExternalService {
                operation: "create_item",
                message: format!("No such subscription: '{subscription_id}'"),
            })?;
        sub.items.push(item.clone());
        Ok(item)
    }

    async fn update_item(
        &self,
        item_id: &str,
        price_id: Option<&str>,
        quantity: Option<u64>,
        proration: ProrationMode,
    ) -> BillingResult<RemoteLineItem> {
        self.record(GatewayCall::UpdateItem {
            item_id: item_id.to_string(),
            price_id: price_id.map(str::to_string),
            quantity,
            proration,
        });
        let mut state = self.state.lock().unwrap();
        state.check("update_item")?;
        let sub = state
            .subscription_with_item(item_id)
            .ok_or_else(|| BillingError::ExternalService {
                operation: "update_item",
                message: format!("No such subscription item: '{item_id}'"),
            })?;
        let item = sub
            .items
            .iter_mut()
            .find(|item| item.id == item_id)
            .expect("item located above");
        if let Some(price) = price_id {
            item.price_id = Some(price.to_string());
        }
        if let Some(quantity) = quantity {
            item.quantity = quantity;
        }
        Ok(item.clone())
    }

    async fn delete_item(&self, item_id: &str) -> BillingResult<()> {
        self.record(GatewayCall::DeleteItem(item_id.to_string()));
        let mut state = self.state.lock().unwrap();
        state.check("delete_item")?;
        let sub = state
            .subscription_with_item(item_id)
            .ok_or_else(|| BillingError::ExternalService {
                operation: "delete_item",
                message: format!("No such subscription item: '{item_id}'"),
            })?;
        sub.items.retain(|item| item.id != item_id);
        Ok(())
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: SubscriptionUpdate,
    ) -> BillingResult<RemoteSubscription> {
        self.record(GatewayCall::UpdateSubscription {
            subscription_id: subscription_id.to_string(),
            update: update.clone(),
        });
        let mut state = self.state.lock().unwrap();
        state.check("update_subscription")?;

        let mut sub = state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::ExternalService {
                operation: "update_subscription",
                message: format!("No such subscription: '{subscription_id}'"),
            })?;

        for op in update.items {
            match op {
                ItemOperation::SetPrice { item_id, price_id } => {
                    let item = sub
                        .items
                        .iter_mut()
                        .find(|i| i.id == item_id)
                        .ok_or_else(|| BillingError::ExternalService {
                            operation: "update_subscription",
                            message: format!("No such subscription item: '{item_id}'"),
                        })?;
                    item.price_id = Some(price_id);
                }
                ItemOperation::SetPriceAndQuantity {
                    item_id,
                    price_id,
                    quantity,
                } => {
                    let item = sub
                        .items
                        .iter_mut()
                        .find(|i| i.id == item_id)
                        .ok_or_else(|| BillingError::ExternalService {
                            operation: "update_subscription",
                            message: format!("No such subscription item: '{item_id}'"),
                        })?;
                    item.price_id = Some(price_id);
                    item.quantity = quantity;
                }
                ItemOperation::Add { price_id, quantity } => {
                    let id = state.next_id("si");
                    sub.items.push(RemoteLineItem {
                        id,
                        price_id: Some(price_id),
                        quantity,
                    });
                }
                ItemOperation::Delete { item_id } => {
                    sub.items.retain(|i| i.id != item_id);
                }
            }
        }

        if update.proration == ProrationMode::AlwaysInvoice {
            let invoice_id = state.next_id("in");
            state.invoices.insert(
                invoice_id.clone(),
                RemoteInvoice {
                    id: invoice_id.clone(),
                    status: InvoiceStatus::Draft,
                    amount_due: 1000,
                },
            );
            sub.latest_invoice_id = Some(invoice_id);
        }

        state
            .subscriptions
            .insert(subscription_id.to_string(), sub.clone());
        Ok(sub)
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        self.record(GatewayCall::RetrieveInvoice(invoice_id.to_string()));
        let state = self.state.lock().unwrap();
        state.check("retrieve_invoice")?;
        state
            .invoices
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| BillingError::ExternalService {
                operation: "retrieve_invoice",
                message: format!("No such invoice: '{invoice_id}'"),
            })
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        self.record(GatewayCall::FinalizeInvoice(invoice_id.to_string()));
        let mut state = self.state.lock().unwrap();
        state.check("finalize_invoice")?;
        let invoice = state.invoices.get_mut(invoice_id).ok_or_else(|| {
            BillingError::ExternalService {
                operation: "finalize_invoice",
                message: format!("No such invoice: '{invoice_id}'"),
            }
        })?;
        if invoice.status == InvoiceStatus::Draft {
            invoice.status = InvoiceStatus::Open;
        }
        Ok(invoice.clone())
    }

    async fn pay_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        self.record(GatewayCall::PayInvoice(invoice_id.to_string()));
        let mut state = self.state.lock().unwrap();
        state.check("pay_invoice")?;
        if state.fail_payments {
            return Err(BillingError::ExternalService {
                operation: "pay_invoice",
                message: "Your card was declined.".to_string(),
            });
        }
        let invoice = state.invoices.get_mut(invoice_id).ok_or_else(|| {
            BillingError::ExternalService {
                operation: "pay_invoice",
                message: format!("No such invoice: '{invoice_id}'"),
            }
        })?;
        invoice.status = InvoiceStatus::Paid;
        Ok(invoice.clone())
    }
}
