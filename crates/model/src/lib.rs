use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// CartLine — one product variant in a cart, with the price snapshotted
/// at add-to-cart time. All amounts are whole rupees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CartLine {
    pub product_id: String,
    pub variant_sku: String,
    pub unit_price: i64,
    pub quantity: i32,
}

impl CartLine {
    /// Line subtotal: unit price times quantity.
    pub fn line_total(&self) -> i64 {
        self.unit_price * i64::from(self.quantity)
    }
}

/// Discount shape of a coupon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CouponKind {
    Percentage,
    Fixed,
}

/// Coupon — a named discount rule. Codes are stored uppercase and matched
/// exactly after normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coupon {
    pub code: String,
    pub kind: CouponKind,
    pub discount_value: i64,
    pub min_purchase: Option<i64>,
    pub max_discount: Option<i64>,
    pub is_active: bool,
    pub usage_limit: Option<i32>,
    pub usage_count: i32,
}

/// AppliedCoupon — session-scoped result of a successful coupon evaluation.
/// Never persisted before order creation; cleared on any cart change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedCoupon {
    pub coupon: Coupon,
    pub discount: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Home,
    Office,
}

/// Address — a user's saved delivery address. Orders snapshot these fields
/// rather than referencing the row, since the row can be edited later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Address {
    pub id: i64,
    pub kind: AddressKind,
    pub name: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub pincode: String,
    pub phone: String,
}

/// Address fields as submitted by the user, before an id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewAddress {
    pub kind: AddressKind,
    pub name: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub pincode: String,
    pub phone: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    Upi,
    Cod,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
}

/// OrderTotals — the single authoritative breakdown of an order amount.
/// Invariant: `total == max(0, subtotal + shipping - discount)`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: i64,
    pub shipping: i64,
    pub discount: i64,
    pub total: i64,
}

/// Order — the main aggregate, created exactly once per successful checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub order_uid: String,
    pub user_id: String,
    pub items: Vec<CartLine>,
    pub address: Address,
    pub payment_method: PaymentMethod,
    pub totals: OrderTotals,
    pub status: OrderStatus,
    /// Gateway payment id; None for cash-on-delivery.
    pub payment_reference: Option<String>,
    /// Client-supplied token guarding duplicate COD submits.
    pub idempotency_key: Option<String>,
    pub coupon_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Where the checkout's line items come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CheckoutSource {
    /// Lines are read from the user's persistent cart.
    Cart,
    /// A single ad-hoc line bypassing the cart ("buy now"). Cleared on
    /// success instead of the cart.
    BuyNow { line: CartLine },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutStep {
    Address,
    Payment,
    Review,
}

impl CheckoutStep {
    pub fn back(self) -> Self {
        match self {
            Self::Address | Self::Payment => Self::Address,
            Self::Review => Self::Payment,
        }
    }
}

/// CheckoutSession — mutable state of one checkout flow. Nothing here is
/// committed until finalize.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub user_id: String,
    pub source: CheckoutSource,
    pub step: CheckoutStep,
    pub address: Option<Address>,
    pub payment_method: Option<PaymentMethod>,
    pub created_at: DateTime<Utc>,
}

impl CheckoutSession {
    pub fn new(user_id: &str, source: CheckoutSource) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            source,
            step: CheckoutStep::Address,
            address: None,
            payment_method: None,
            created_at: Utc::now(),
        }
    }
}

/// CheckoutSnapshot — the immutable item/address/total snapshot produced at
/// review time. Both finalize paths trust this value, not client resends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutSnapshot {
    pub lines: Vec<CartLine>,
    pub address: Address,
    pub payment_method: PaymentMethod,
    pub totals: OrderTotals,
    pub coupon: Option<AppliedCoupon>,
}

/// PendingPayment — a gateway intent awaiting its client-relayed callback.
/// Keyed by the gateway's opaque order id. Carries the checkout source so a
/// callback arriving after the session is gone still clears the right state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingPayment {
    pub gateway_order_id: String,
    pub user_id: String,
    pub session_id: String,
    pub source: CheckoutSource,
    pub snapshot: CheckoutSnapshot,
    pub created_at: DateTime<Utc>,
}
