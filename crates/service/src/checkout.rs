//! Checkout orchestration: a linear Address -> Payment -> Review flow with
//! back-navigation, plus construction of the authoritative review snapshot.
//!
//! Nothing is committed before finalize; navigating back or abandoning the
//! session loses no persistent state.

use crate::{CheckoutService, ServiceError};
use model::{
    CartLine, CheckoutSession, CheckoutSnapshot, CheckoutSource, CheckoutStep, NewAddress,
};
use pricing::{compute_totals, evaluate_coupon};
use repository::{AddressesRepository, CartsRepository, CouponsRepository, OrdersRepository};
use serde::Deserialize;
use tracing::{instrument, warn};

/// How the user picks the delivery address: an existing book entry or a new
/// one, which is persisted and auto-selected.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", untagged)]
pub enum AddressSelection {
    Existing { address_id: i64 },
    New { address: NewAddress },
}

impl<R1, R2, R3, R4> CheckoutService<R1, R2, R3, R4>
where
    R1: CartsRepository,
    R2: CouponsRepository,
    R3: AddressesRepository,
    R4: OrdersRepository,
{
    /// Opens a checkout session from the persistent cart or a buy-now line.
    ///
    /// Buy-now lines get a fresh price snapshot from the catalog so the
    /// ephemeral path cannot smuggle in a client-chosen price.
    #[instrument(skip(self, source))]
    pub async fn start_checkout(
        &self,
        user_id: &str,
        source: CheckoutSource,
    ) -> Result<CheckoutSession, ServiceError> {
        let source = match source {
            CheckoutSource::Cart => {
                let lines = self.carts.get_lines(user_id).await?;
                if lines.is_empty() {
                    return Err(ServiceError::EmptyCart);
                }
                CheckoutSource::Cart
            }
            CheckoutSource::BuyNow { line } => {
                if line.quantity < 1 {
                    return Err(ServiceError::InvalidQuantity(line.quantity));
                }
                let variant = self
                    .catalog
                    .get_variant(&line.product_id, &line.variant_sku)
                    .await?
                    .ok_or_else(|| ServiceError::UnknownVariant(line.variant_sku.clone()))?;
                CheckoutSource::BuyNow {
                    line: CartLine {
                        unit_price: variant.price,
                        ..line
                    },
                }
            }
        };

        let session = CheckoutSession::new(user_id, source);
        self.sessions.put_session(session.clone()).await;
        Ok(session)
    }

    pub(crate) async fn session_for(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        match self.sessions.get_session(session_id).await {
            Some(session) if session.user_id == user_id => Ok(session),
            _ => Err(ServiceError::SessionNotFound),
        }
    }

    /// Selects (or creates and selects) the delivery address and advances to
    /// the payment step.
    #[instrument(skip(self, selection))]
    pub async fn set_address(
        &self,
        user_id: &str,
        session_id: &str,
        selection: AddressSelection,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.session_for(user_id, session_id).await?;

        let address = match selection {
            AddressSelection::Existing { address_id } => {
                self.addresses.get(user_id, address_id).await?
            }
            AddressSelection::New { address } => self.addresses.insert(user_id, &address).await?,
        };

        session.address = Some(address);
        session.step = CheckoutStep::Payment;
        self.sessions.put_session(session.clone()).await;
        Ok(session)
    }

    /// Records the payment method and advances to review. Requires an
    /// address; no further validation beyond presence.
    #[instrument(skip(self))]
    pub async fn set_payment_method(
        &self,
        user_id: &str,
        session_id: &str,
        method: model::PaymentMethod,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.session_for(user_id, session_id).await?;
        if session.address.is_none() {
            return Err(ServiceError::AddressMissing);
        }

        session.payment_method = Some(method);
        session.step = CheckoutStep::Review;
        self.sessions.put_session(session.clone()).await;
        Ok(session)
    }

    /// Steps back one screen. Always permitted; loses no committed state.
    pub async fn step_back(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.session_for(user_id, session_id).await?;
        session.step = session.step.back();
        self.sessions.put_session(session.clone()).await;
        Ok(session)
    }

    /// Builds the review snapshot both finalize paths trust.
    #[instrument(skip(self))]
    pub async fn review(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<CheckoutSnapshot, ServiceError> {
        let session = self.session_for(user_id, session_id).await?;
        self.build_snapshot(&session).await
    }

    /// The authoritative snapshot: lines, address, method, totals, coupon.
    ///
    /// Re-fetches catalog prices and rejects drift beyond the configured
    /// tolerance; a catalog outage degrades to the stored snapshot price. The
    /// applied coupon is re-validated against the current subtotal; an
    /// invalid one is dropped, never silently honored.
    pub(crate) async fn build_snapshot(
        &self,
        session: &CheckoutSession,
    ) -> Result<CheckoutSnapshot, ServiceError> {
        let lines = match &session.source {
            CheckoutSource::Cart => self.carts.get_lines(&session.user_id).await?,
            CheckoutSource::BuyNow { line } => vec![line.clone()],
        };
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let address = session
            .address
            .clone()
            .ok_or(ServiceError::AddressMissing)?;
        let payment_method = session
            .payment_method
            .ok_or(ServiceError::PaymentMethodMissing)?;

        for line in &lines {
            match self
                .catalog
                .get_variant(&line.product_id, &line.variant_sku)
                .await
            {
                Ok(Some(variant)) => {
                    let drift = (variant.price - line.unit_price).abs();
                    if drift > self.price_drift_tolerance {
                        return Err(ServiceError::PriceDrift {
                            variant_sku: line.variant_sku.clone(),
                            cart_price: line.unit_price,
                            catalog_price: variant.price,
                        });
                    }
                }
                Ok(None) => {
                    return Err(ServiceError::UnknownVariant(line.variant_sku.clone()));
                }
                Err(e) => {
                    // Catalog outage degrades to the snapshot price rather
                    // than blocking checkout.
                    warn!(sku = %line.variant_sku, error = ?e,
                        "Catalog unreachable, keeping snapshot price");
                }
            }
        }

        let subtotal: i64 = lines.iter().map(CartLine::line_total).sum();
        let coupon = match self.sessions.applied_coupon(&session.user_id).await {
            Some(applied) => match evaluate_coupon(&applied.coupon, subtotal) {
                Ok(discount) => Some(model::AppliedCoupon {
                    coupon: applied.coupon,
                    discount,
                }),
                Err(e) => {
                    warn!(code = %applied.coupon.code, reason = %e,
                        "Applied coupon no longer valid, dropping");
                    self.sessions.clear_applied_coupon(&session.user_id).await;
                    None
                }
            },
            None => None,
        };
        let discount = coupon.as_ref().map_or(0, |c| c.discount);
        let totals = compute_totals(&lines, discount, &self.shipping);

        Ok(CheckoutSnapshot {
            lines,
            address,
            payment_method,
            totals,
            coupon,
        })
    }
}
