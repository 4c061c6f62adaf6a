//! Billing provider client
//!
//! [`BillingGateway`] is the seam between seat accounting and the payment
//! provider. [`StripeClient`] is the production implementation; every call is
//! bounded by a timeout and reads are retried with exponential backoff.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plancap_shared::{BillingPeriod, PlanTier};
use serde::Serialize;
use stripe::generated::billing::subscription::{
    SubscriptionBillingCycleAnchor, SubscriptionPaymentBehavior, SubscriptionProrationBehavior,
};
use stripe::generated::billing::subscription_item::SubscriptionProrationBehavior as ItemProrationBehavior;
use stripe::{
    CreateSubscriptionItem, FinalizeInvoiceParams, Invoice, InvoiceId, PriceId, Subscription,
    SubscriptionId, SubscriptionItem, SubscriptionItemId, UpdateSubscription,
    UpdateSubscriptionItem, UpdateSubscriptionItems,
};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

// =============================================================================
// Configuration
// =============================================================================

/// Base and seat price of one (tier, period) combination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPrices {
    pub base: String,
    pub seat: String,
}

/// Stripe price IDs for every purchasable (tier, period) combination
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    prices: HashMap<(PlanTier, BillingPeriod), TierPrices>,
}

impl PriceIds {
    /// Load price IDs from `STRIPE_PRICE_<TIER>_<PERIOD>_BASE` / `_SEAT`.
    ///
    /// Combinations with a missing variable are skipped; asking for them later
    /// yields a configuration error.
    pub fn from_env() -> Self {
        let mut prices = Self::default();
        for tier in PlanTier::ALL {
            for period in [BillingPeriod::Monthly, BillingPeriod::Yearly] {
                let prefix = format!(
                    "STRIPE_PRICE_{}_{}",
                    tier.as_str().to_uppercase(),
                    period.as_str().to_uppercase()
                );
                let base = std::env::var(format!("{prefix}_BASE")).ok();
                let seat = std::env::var(format!("{prefix}_SEAT")).ok();
                match (base, seat) {
                    (Some(base), Some(seat)) => prices = prices.with(tier, period, base, seat),
                    _ => tracing::debug!(
                        tier = %tier,
                        period = %period,
                        "No Stripe prices configured for plan"
                    ),
                }
            }
        }
        prices
    }

    /// Register the prices of one combination
    pub fn with(
        mut self,
        tier: PlanTier,
        period: BillingPeriod,
        base: impl Into<String>,
        seat: impl Into<String>,
    ) -> Self {
        self.prices.insert(
            (tier, period),
            TierPrices {
                base: base.into(),
                seat: seat.into(),
            },
        );
        self
    }

    pub fn prices_for(&self, tier: PlanTier, period: BillingPeriod) -> BillingResult<&TierPrices> {
        self.prices.get(&(tier, period)).ok_or_else(|| {
            BillingError::Config(format!("no Stripe prices configured for {tier} {period}"))
        })
    }

    pub fn base_price(&self, tier: PlanTier, period: BillingPeriod) -> BillingResult<&str> {
        self.prices_for(tier, period).map(|p| p.base.as_str())
    }

    pub fn seat_price(&self, tier: PlanTier, period: BillingPeriod) -> BillingResult<&str> {
        self.prices_for(tier, period).map(|p| p.seat.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// Stripe connection settings
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub price_ids: PriceIds,
    /// Upper bound for a single provider call
    pub request_timeout: Duration,
    /// Retries for idempotent reads
    pub max_retries: usize,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let request_timeout = std::env::var("STRIPE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(20));

        let max_retries = std::env::var("STRIPE_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(3);

        let price_ids = PriceIds::from_env();
        if price_ids.is_empty() {
            return Err(BillingError::Config(
                "no STRIPE_PRICE_<TIER>_<PERIOD>_BASE/_SEAT variables set".to_string(),
            ));
        }

        Ok(Self {
            secret_key,
            price_ids,
            request_timeout,
            max_retries,
        })
    }
}

// =============================================================================
// Gateway contract
// =============================================================================

/// How the provider should bill a mid-cycle change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationMode {
    /// Prorate and invoice the difference immediately
    AlwaysInvoice,
    /// Prorate into the next regular invoice
    CreateProrations,
    /// No proration; new price applies from the next cycle
    None,
}

impl ProrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlwaysInvoice => "always_invoice",
            Self::CreateProrations => "create_prorations",
            Self::None => "none",
        }
    }
}

/// A line item of a remote subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteLineItem {
    pub id: String,
    pub price_id: Option<String>,
    pub quantity: u64,
}

/// A remote subscription as seen by the billing core
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteSubscription {
    pub id: String,
    pub status: String,
    pub items: Vec<RemoteLineItem>,
    pub latest_invoice_id: Option<String>,
}

impl RemoteSubscription {
    pub fn item(&self, item_id: &str) -> Option<&RemoteLineItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    pub fn item_with_price(&self, price_id: &str) -> Option<&RemoteLineItem> {
        self.items
            .iter()
            .find(|item| item.price_id.as_deref() == Some(price_id))
    }
}

/// One change to the line items of a subscription, applied atomically with the rest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ItemOperation {
    /// Swap the price of an existing item, keeping its quantity
    SetPrice { item_id: String, price_id: String },
    /// Swap price and quantity of an existing item
    SetPriceAndQuantity {
        item_id: String,
        price_id: String,
        quantity: u64,
    },
    Add { price_id: String, quantity: u64 },
    Delete { item_id: String },
}

/// Atomic multi-item update of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionUpdate {
    pub items: Vec<ItemOperation>,
    pub metadata: HashMap<String, String>,
    pub proration: ProrationMode,
    /// Keep the renewal date where it is
    pub keep_billing_anchor: bool,
    /// Reject the update outright if the immediate payment fails
    pub error_if_incomplete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteInvoice {
    pub id: String,
    pub status: InvoiceStatus,
    pub amount_due: i64,
}

/// Operations the billing core needs from the payment provider
#[async_trait]
pub trait BillingGateway: Send + Sync {
    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<RemoteSubscription>;

    async fn create_item(
        &self,
        subscription_id: &str,
        price_id: &str,
        quantity: u64,
        proration: ProrationMode,
    ) -> BillingResult<RemoteLineItem>;

    async fn update_item(
        &self,
        item_id: &str,
        price_id: Option<&str>,
        quantity: Option<u64>,
        proration: ProrationMode,
    ) -> BillingResult<RemoteLineItem>;

    async fn delete_item(&self, item_id: &str) -> BillingResult<()>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: SubscriptionUpdate,
    ) -> BillingResult<RemoteSubscription>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice>;

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice>;

    async fn pay_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice>;
}

// =============================================================================
// Stripe implementation
// =============================================================================

/// Stripe-backed [`BillingGateway`]
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Run a single call under the configured timeout
    async fn call<T, Fut>(&self, operation: &'static str, fut: Fut) -> BillingResult<T>
    where
        Fut: Future<Output = Result<T, stripe::StripeError>>,
    {
        bounded(operation, self.config.request_timeout, fut).await
    }

    /// Run an idempotent call, retrying transient failures with backoff
    async fn retrying<T, F, Fut>(&self, operation: &'static str, mut action: F) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, stripe::StripeError>>,
    {
        let strategy = ExponentialBackoff::from_millis(10)
            .factor(10)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.config.max_retries);
        let timeout = self.config.request_timeout;

        RetryIf::spawn(
            strategy,
            || {
                let fut = action();
                async move {
                    let result = bounded(operation, timeout, fut).await;
                    if let Err(e) = &result {
                        if e.is_transient() {
                            tracing::warn!(operation, error = %e, "Transient Stripe failure");
                        }
                    }
                    result
                }
            },
            BillingError::is_transient,
        )
        .await
    }
}

async fn bounded<T, Fut>(
    operation: &'static str,
    timeout: Duration,
    fut: Fut,
) -> BillingResult<T>
where
    Fut: Future<Output = Result<T, stripe::StripeError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BillingError::from_stripe(operation, e)),
        Err(_) => Err(BillingError::Timeout(operation)),
    }
}

fn parse_id<T>(raw: &str, kind: &str) -> BillingResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| BillingError::InvalidInput(format!("invalid {kind} '{raw}': {e}")))
}

fn subscription_proration(mode: ProrationMode) -> SubscriptionProrationBehavior {
    match mode {
        ProrationMode::AlwaysInvoice => SubscriptionProrationBehavior::AlwaysInvoice,
        ProrationMode::CreateProrations => SubscriptionProrationBehavior::CreateProrations,
        ProrationMode::None => SubscriptionProrationBehavior::None,
    }
}

fn item_proration(mode: ProrationMode) -> ItemProrationBehavior {
    match mode {
        ProrationMode::AlwaysInvoice => ItemProrationBehavior::AlwaysInvoice,
        ProrationMode::CreateProrations => ItemProrationBehavior::CreateProrations,
        ProrationMode::None => ItemProrationBehavior::None,
    }
}

fn map_item(item: &SubscriptionItem) -> RemoteLineItem {
    RemoteLineItem {
        id: item.id.to_string(),
        price_id: item.price.as_ref().map(|price| price.id.to_string()),
        quantity: item.quantity.unwrap_or(1),
    }
}

fn map_subscription(sub: &Subscription) -> RemoteSubscription {
    let status = match sub.status {
        stripe::SubscriptionStatus::Active => "active",
        stripe::SubscriptionStatus::Canceled => "canceled",
        stripe::SubscriptionStatus::Incomplete => "incomplete",
        stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        stripe::SubscriptionStatus::PastDue => "past_due",
        stripe::SubscriptionStatus::Trialing => "trialing",
        stripe::SubscriptionStatus::Unpaid => "unpaid",
        stripe::SubscriptionStatus::Paused => "paused",
    };

    RemoteSubscription {
        id: sub.id.to_string(),
        status: status.to_string(),
        items: sub.items.data.iter().map(map_item).collect(),
        latest_invoice_id: sub
            .latest_invoice
            .as_ref()
            .map(|invoice| invoice.id().to_string()),
    }
}

fn map_invoice(invoice: &Invoice) -> RemoteInvoice {
    let status = match invoice.status {
        Some(stripe::InvoiceStatus::Paid) => InvoiceStatus::Paid,
        Some(stripe::InvoiceStatus::Open) => InvoiceStatus::Open,
        Some(stripe::InvoiceStatus::Uncollectible) => InvoiceStatus::Uncollectible,
        Some(stripe::InvoiceStatus::Void) => InvoiceStatus::Void,
        Some(stripe::InvoiceStatus::Draft) | None => InvoiceStatus::Draft,
    };

    RemoteInvoice {
        id: invoice.id.to_string(),
        status,
        amount_due: invoice.amount_due.unwrap_or(0),
    }
}

fn to_stripe_item(op: ItemOperation) -> UpdateSubscriptionItems {
    match op {
        ItemOperation::SetPrice { item_id, price_id } => UpdateSubscriptionItems {
            id: Some(item_id),
            price: Some(price_id),
            ..Default::default()
        },
        ItemOperation::SetPriceAndQuantity {
            item_id,
            price_id,
            quantity,
        } => UpdateSubscriptionItems {
            id: Some(item_id),
            price: Some(price_id),
            quantity: Some(quantity),
            ..Default::default()
        },
        ItemOperation::Add { price_id, quantity } => UpdateSubscriptionItems {
            price: Some(price_id),
            quantity: Some(quantity),
            ..Default::default()
        },
        ItemOperation::Delete { item_id } => UpdateSubscriptionItems {
            id: Some(item_id),
            deleted: Some(true),
            ..Default::default()
        },
    }
}

#[async_trait]
impl BillingGateway for StripeClient {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<RemoteSubscription> {
        let sub_id: SubscriptionId = parse_id(subscription_id, "subscription ID")?;
        let subscription = self
            .retrying("retrieve_subscription", || {
                let client = self.inner.clone();
                let sub_id = sub_id.clone();
                async move { Subscription::retrieve(&client, &sub_id, &[]).await }
            })
            .await?;
        Ok(map_subscription(&subscription))
    }

    async fn create_item(
        &self,
        subscription_id: &str,
        price_id: &str,
        quantity: u64,
        proration: ProrationMode,
    ) -> BillingResult<RemoteLineItem> {
        let sub_id: SubscriptionId = parse_id(subscription_id, "subscription ID")?;
        let price: PriceId = parse_id(price_id, "price ID")?;

        let mut params = CreateSubscriptionItem::new(sub_id);
        params.price = Some(price);
        params.quantity = Some(quantity);
        params.proration_behavior = Some(item_proration(proration));

        let item = self
            .call(
                "create_item",
                SubscriptionItem::create(&self.inner, params),
            )
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            item_id = %item.id,
            quantity = quantity,
            proration = proration.as_str(),
            "Created subscription item"
        );
        Ok(map_item(&item))
    }

    async fn update_item(
        &self,
        item_id: &str,
        price_id: Option<&str>,
        quantity: Option<u64>,
        proration: ProrationMode,
    ) -> BillingResult<RemoteLineItem> {
        let id: SubscriptionItemId = parse_id(item_id, "subscription item ID")?;

        let mut params = UpdateSubscriptionItem::new();
        params.price = price_id
            .map(|p| parse_id::<PriceId>(p, "price ID"))
            .transpose()?;
        params.quantity = quantity;
        params.proration_behavior = Some(item_proration(proration));

        let item = self
            .call(
                "update_item",
                SubscriptionItem::update(&self.inner, &id, params),
            )
            .await?;
        Ok(map_item(&item))
    }

    async fn delete_item(&self, item_id: &str) -> BillingResult<()> {
        let id: SubscriptionItemId = parse_id(item_id, "subscription item ID")?;
        self.call("delete_item", SubscriptionItem::delete(&self.inner, &id))
            .await?;
        tracing::info!(item_id = %item_id, "Deleted subscription item");
        Ok(())
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: SubscriptionUpdate,
    ) -> BillingResult<RemoteSubscription> {
        let sub_id: SubscriptionId = parse_id(subscription_id, "subscription ID")?;
        let item_count = update.items.len();

        let mut params = UpdateSubscription::new();
        params.items = Some(update.items.into_iter().map(to_stripe_item).collect());
        params.metadata = Some(update.metadata);
        params.proration_behavior = Some(subscription_proration(update.proration));
        if update.keep_billing_anchor {
            params.billing_cycle_anchor = Some(SubscriptionBillingCycleAnchor::Unchanged);
        }
        if update.error_if_incomplete {
            params.payment_behavior = Some(SubscriptionPaymentBehavior::ErrorIfIncomplete);
        }

        let subscription = self
            .call(
                "update_subscription",
                Subscription::update(&self.inner, &sub_id, params),
            )
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            item_operations = item_count,
            proration = update.proration.as_str(),
            "Updated subscription items"
        );
        Ok(map_subscription(&subscription))
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        let id: InvoiceId = parse_id(invoice_id, "invoice ID")?;
        let invoice = self
            .retrying("retrieve_invoice", || {
                let client = self.inner.clone();
                let id = id.clone();
                async move { Invoice::retrieve(&client, &id, &[]).await }
            })
            .await?;
        Ok(map_invoice(&invoice))
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        let id: InvoiceId = parse_id(invoice_id, "invoice ID")?;
        let invoice = self
            .call(
                "finalize_invoice",
                Invoice::finalize(&self.inner, &id, FinalizeInvoiceParams::default()),
            )
            .await?;
        Ok(map_invoice(&invoice))
    }

    async fn pay_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        let id: InvoiceId = parse_id(invoice_id, "invoice ID")?;
        let invoice = self
            .call("pay_invoice", Invoice::pay(&self.inner, &id))
            .await?;
        Ok(map_invoice(&invoice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices() -> PriceIds {
        PriceIds::default()
            .with(
                PlanTier::Growth,
                BillingPeriod::Monthly,
                "price_growth_m",
                "price_growth_m_seat",
            )
            .with(
                PlanTier::Growth,
                BillingPeriod::Yearly,
                "price_growth_y",
                "price_growth_y_seat",
            )
    }

    #[test]
    fn test_price_lookup() {
        let prices = prices();
        assert_eq!(
            prices
                .base_price(PlanTier::Growth, BillingPeriod::Yearly)
                .unwrap(),
            "price_growth_y"
        );
        assert_eq!(
            prices
                .seat_price(PlanTier::Growth, BillingPeriod::Monthly)
                .unwrap(),
            "price_growth_m_seat"
        );
    }

    #[test]
    fn test_missing_price_is_config_error() {
        let err = prices()
            .base_price(PlanTier::Scale, BillingPeriod::Monthly)
            .unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }

    #[test]
    fn test_proration_strings() {
        assert_eq!(ProrationMode::AlwaysInvoice.as_str(), "always_invoice");
        assert_eq!(ProrationMode::CreateProrations.as_str(), "create_prorations");
        assert_eq!(ProrationMode::None.as_str(), "none");
    }

    #[test]
    fn test_item_operation_mapping() {
        let delete = to_stripe_item(ItemOperation::Delete {
            item_id: "si_seat".into(),
        });
        assert_eq!(delete.id.as_deref(), Some("si_seat"));
        assert_eq!(delete.deleted, Some(true));
        assert!(delete.price.is_none());

        let add = to_stripe_item(ItemOperation::Add {
            price_id: "price_seat".into(),
            quantity: 3,
        });
        assert!(add.id.is_none());
        assert_eq!(add.quantity, Some(3));
    }

    #[test]
    fn test_remote_subscription_lookup() {
        let sub = RemoteSubscription {
            id: "sub_1".into(),
            status: "active".into(),
            items: vec![
                RemoteLineItem {
                    id: "si_base".into(),
                    price_id: Some("price_base".into()),
                    quantity: 1,
                },
                RemoteLineItem {
                    id: "si_seat".into(),
                    price_id: Some("price_seat".into()),
                    quantity: 4,
                },
            ],
            latest_invoice_id: None,
        };
        assert_eq!(sub.item("si_seat").map(|i| i.quantity), Some(4));
        assert_eq!(
            sub.item_with_price("price_base").map(|i| i.id.as_str()),
            Some("si_base")
        );
        assert!(sub.item("si_missing").is_none());
    }

    #[test]
    fn test_invalid_id_is_rejected_before_network() {
        let err = parse_id::<SubscriptionId>("not-a-sub", "subscription ID").unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }
}
