//! Business logic layer for the storefront checkout pipeline.
//!
//! [`CheckoutService`] drives everything between the cart and a persisted
//! order: cart CRUD, coupon application, the address → payment → review
//! orchestration, payment reconciliation against the gateway, and the single
//! finalize step. It is generic over the repository traits (dependency
//! injection for testability) and holds the gateway/catalog/notifier
//! collaborators as trait objects.
//!
//! Correctness properties enforced here:
//! - the server-side total is the only one that may create an order;
//! - coupon usage is consumed only inside the finalize transaction;
//! - at most one order per verified gateway payment id;
//! - a failed finalize leaves cart and coupon state intact.

mod checkout;
mod payment;

use clients::{AuthClient, CatalogClient, ClientError};
use gateway::{GatewayError, PaymentGateway};
use model::{Address, AppliedCoupon, CartLine, Coupon, NewAddress, Order, OrderTotals};
use notifier::ConfirmationSink;
use pricing::{CouponError, ShippingPolicy, compute_totals, evaluate_coupon, normalize_code};
use repository::{
    AddressesRepository, CartsRepository, CouponsRepository, OrdersRepository, RepositoryError,
};
use serde::Serialize;
use session::SessionStore;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

pub use checkout::AddressSelection;

/// The main error type for all operations in [`CheckoutService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No valid session token was presented.
    #[error("Authentication required")]
    Unauthenticated,
    /// A cart line quantity below 1.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i32),
    /// The catalog no longer knows this variant.
    #[error("Unknown product variant {0}")]
    UnknownVariant(String),
    /// Checkout requires at least one line.
    #[error("Cart is empty")]
    EmptyCart,
    /// Review/finalize reached without a selected address.
    #[error("A delivery address has not been selected")]
    AddressMissing,
    /// Review/finalize reached without a payment method.
    #[error("A payment method has not been selected")]
    PaymentMethodMissing,
    /// The finalize path does not match the selected payment method.
    #[error("Selected payment method does not match this operation")]
    PaymentMethodMismatch,
    /// Unknown or foreign checkout session id.
    #[error("Checkout session not found")]
    SessionNotFound,
    /// Coupon rejections; non-fatal, checkout state unaffected.
    #[error(transparent)]
    Coupon(#[from] CouponError),
    /// The catalog price moved beyond the configured tolerance since the
    /// line was snapshotted.
    #[error("Price of {variant_sku} changed from {cart_price} to {catalog_price}")]
    PriceDrift {
        variant_sku: String,
        cart_price: i64,
        catalog_price: i64,
    },
    /// The gateway refused to open a payment session, or was unreachable.
    #[error("Payment gateway rejected the request: {0}")]
    GatewayRejected(String),
    /// The client-relayed callback failed server-side verification. No order
    /// is ever created from an unverified callback.
    #[error("Payment could not be verified")]
    VerificationFailed,
    /// The order write failed after the rest of the pipeline succeeded. For
    /// gateway payments this is paid-but-unfulfilled state: retry with the
    /// same payment id, never re-charge.
    #[error("Order could not be persisted: {0}")]
    PersistenceFailure(RepositoryError),
    /// A repository (database) read failed.
    #[error("Database error: {0}")]
    Db(#[from] RepositoryError),
    /// A collaborator (catalog/auth) call failed.
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] ClientError),
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        Self::GatewayRejected(err.to_string())
    }
}

/// Cart contents plus display totals, as shown before checkout.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CartView {
    pub lines: Vec<CartLine>,
    pub totals: OrderTotals,
    pub coupon: Option<AppliedCoupon>,
}

/// Checkout pipeline service wired from repositories and collaborators.
pub struct CheckoutService<R1, R2, R3, R4> {
    carts: R1,
    coupons: R2,
    addresses: R3,
    orders: R4,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<dyn CatalogClient>,
    confirmations: Arc<dyn ConfirmationSink>,
    sessions: Arc<SessionStore>,
    shipping: ShippingPolicy,
    currency: String,
    price_drift_tolerance: i64,
}

impl<R1, R2, R3, R4> CheckoutService<R1, R2, R3, R4>
where
    R1: CartsRepository,
    R2: CouponsRepository,
    R3: AddressesRepository,
    R4: OrdersRepository,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        carts: R1,
        coupons: R2,
        addresses: R3,
        orders: R4,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<dyn CatalogClient>,
        confirmations: Arc<dyn ConfirmationSink>,
        sessions: Arc<SessionStore>,
        shipping: ShippingPolicy,
        currency: &str,
        price_drift_tolerance: i64,
    ) -> Self {
        Self {
            carts,
            coupons,
            addresses,
            orders,
            gateway,
            catalog,
            confirmations,
            sessions,
            shipping,
            currency: currency.to_string(),
            price_drift_tolerance,
        }
    }

    /// The user's cart with display totals. Totals shown here use the same
    /// computation as checkout; the two views can never disagree on the fee.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: &str) -> Result<CartView, ServiceError> {
        let lines = self.carts.get_lines(user_id).await?;
        let coupon = self.sessions.applied_coupon(user_id).await;
        let discount = coupon.as_ref().map_or(0, |c| c.discount);
        let totals = compute_totals(&lines, discount, &self.shipping);
        Ok(CartView {
            lines,
            totals,
            coupon,
        })
    }

    /// Adds a variant to the cart, snapshotting the catalog's current price.
    /// Any cart mutation invalidates the applied coupon.
    #[instrument(skip(self))]
    pub async fn add_to_cart(
        &self,
        user_id: &str,
        product_id: &str,
        variant_sku: &str,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::InvalidQuantity(quantity));
        }
        let variant = self
            .catalog
            .get_variant(product_id, variant_sku)
            .await?
            .ok_or_else(|| ServiceError::UnknownVariant(variant_sku.to_string()))?;

        let line = CartLine {
            product_id: product_id.to_string(),
            variant_sku: variant.sku,
            unit_price: variant.price,
            quantity,
        };
        self.carts.upsert_line(user_id, &line).await?;
        self.sessions.clear_applied_coupon(user_id).await;
        self.get_cart(user_id).await
    }

    /// Sets the quantity of an existing cart line.
    #[instrument(skip(self))]
    pub async fn change_quantity(
        &self,
        user_id: &str,
        variant_sku: &str,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::InvalidQuantity(quantity));
        }
        self.carts
            .set_quantity(user_id, variant_sku, quantity)
            .await?;
        self.sessions.clear_applied_coupon(user_id).await;
        self.get_cart(user_id).await
    }

    /// Removes a line from the cart.
    #[instrument(skip(self))]
    pub async fn remove_from_cart(
        &self,
        user_id: &str,
        variant_sku: &str,
    ) -> Result<CartView, ServiceError> {
        self.carts.remove_line(user_id, variant_sku).await?;
        self.sessions.clear_applied_coupon(user_id).await;
        self.get_cart(user_id).await
    }

    /// Applies a coupon code against the current cart subtotal.
    ///
    /// Evaluation is idempotent and records nothing server-side; the use is
    /// consumed only when an order is finalized.
    #[instrument(skip(self))]
    pub async fn apply_coupon(
        &self,
        user_id: &str,
        code: &str,
    ) -> Result<AppliedCoupon, ServiceError> {
        let lines = self.carts.get_lines(user_id).await?;
        let subtotal: i64 = lines.iter().map(CartLine::line_total).sum();

        let normalized = normalize_code(code);
        let coupon = self
            .coupons
            .find_active(&normalized)
            .await?
            .ok_or(CouponError::InvalidCode)?;

        let discount = evaluate_coupon(&coupon, subtotal)?;
        let applied = AppliedCoupon { coupon, discount };
        self.sessions
            .set_applied_coupon(user_id, applied.clone())
            .await;
        Ok(applied)
    }

    /// Clears the session-scoped applied coupon. No server-visible effect.
    pub async fn remove_coupon(&self, user_id: &str) {
        self.sessions.clear_applied_coupon(user_id).await;
    }

    /// Active coupons, for display.
    pub async fn list_coupons(&self) -> Result<Vec<Coupon>, ServiceError> {
        Ok(self.coupons.list_active().await?)
    }

    /// The user's saved addresses.
    pub async fn list_addresses(&self, user_id: &str) -> Result<Vec<Address>, ServiceError> {
        Ok(self.addresses.list(user_id).await?)
    }

    /// Saves a new address to the user's address book.
    #[instrument(skip(self, address))]
    pub async fn create_address(
        &self,
        user_id: &str,
        address: &NewAddress,
    ) -> Result<Address, ServiceError> {
        Ok(self.addresses.insert(user_id, address).await?)
    }

    /// Updates an existing address. Orders hold snapshots, so edits never
    /// rewrite history.
    #[instrument(skip(self, address))]
    pub async fn update_address(
        &self,
        user_id: &str,
        address_id: i64,
        address: &NewAddress,
    ) -> Result<Address, ServiceError> {
        Ok(self.addresses.update(user_id, address_id, address).await?)
    }

    /// Full order by id, scoped to its owner.
    pub async fn get_order(&self, user_id: &str, order_uid: &str) -> Result<Order, ServiceError> {
        Ok(self.orders.get_by_id(user_id, order_uid).await?)
    }
}

/// Resolves a bearer token through the auth collaborator.
///
/// Absence of a valid session rejects every mutating call.
pub async fn authenticate(
    auth: &dyn AuthClient,
    token: Option<&str>,
) -> Result<String, ServiceError> {
    let token = token.ok_or(ServiceError::Unauthenticated)?;
    match auth.current_user(token).await? {
        Some(user_id) => Ok(user_id),
        None => Err(ServiceError::Unauthenticated),
    }
}
