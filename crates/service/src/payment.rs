//! Payment reconciliation and order finalization.
//!
//! Per checkout attempt the gateway path moves through
//! `IntentCreated -> AwaitingGatewayCallback -> (Verified -> OrderFinalized)
//! | (Failed -> Abandoned)`. The intent is created against the server-side
//! total, the callback is verified before anything is trusted, and finalize
//! is idempotent on the gateway payment id. COD skips the gateway but shares
//! the same finalize step, keyed by a client idempotency token.

use crate::{CheckoutService, ServiceError};
use chrono::Utc;
use model::{
    CheckoutSession, CheckoutSnapshot, CheckoutSource, Order, OrderStatus, PaymentMethod,
    PendingPayment,
};
use notifier::OrderConfirmation;
use repository::{AddressesRepository, CartsRepository, CouponsRepository, OrdersRepository};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

impl<R1, R2, R3, R4> CheckoutService<R1, R2, R3, R4>
where
    R1: CartsRepository,
    R2: CouponsRepository,
    R3: AddressesRepository,
    R4: OrdersRepository,
{
    /// Places a cash-on-delivery order directly from the reviewed session.
    ///
    /// A duplicated submit with the same idempotency key is a no-op that
    /// returns the first order.
    #[instrument(skip(self))]
    pub async fn place_cod_order(
        &self,
        user_id: &str,
        session_id: &str,
        idempotency_key: &str,
    ) -> Result<Order, ServiceError> {
        // Checked before the session lookup: a retried submit after success
        // arrives with the session already gone.
        if let Some(existing) = self.orders.find_by_idempotency_key(idempotency_key).await? {
            info!(order_uid = %existing.order_uid, "Duplicate COD submit, returning existing order");
            return Ok(existing);
        }

        let session = self.session_for(user_id, session_id).await?;
        let snapshot = self.build_snapshot(&session).await?;
        if snapshot.payment_method != PaymentMethod::Cod {
            return Err(ServiceError::PaymentMethodMismatch);
        }

        let order = build_order(
            &session,
            &snapshot,
            OrderStatus::Pending,
            None,
            Some(idempotency_key.to_string()),
        );
        self.finalize(&session, snapshot, order).await
    }

    /// Creates a gateway payment session keyed to the authoritative total
    /// and stores the snapshot it was computed from. The client never
    /// supplies an amount.
    #[instrument(skip(self))]
    pub async fn create_payment_intent(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<PendingPayment, ServiceError> {
        let session = self.session_for(user_id, session_id).await?;
        let snapshot = self.build_snapshot(&session).await?;
        if snapshot.payment_method == PaymentMethod::Cod {
            return Err(ServiceError::PaymentMethodMismatch);
        }

        let gateway_session = self
            .gateway
            .create_session(snapshot.totals.total, &self.currency, &session.id)
            .await?;

        let pending = PendingPayment {
            gateway_order_id: gateway_session.gateway_order_id,
            user_id: user_id.to_string(),
            session_id: session.id.clone(),
            source: session.source.clone(),
            snapshot,
            created_at: Utc::now(),
        };
        self.sessions.put_pending_payment(pending.clone()).await;
        info!(gateway_order_id = %pending.gateway_order_id,
            amount = pending.snapshot.totals.total, "Payment intent created");
        Ok(pending)
    }

    /// Handles the client-relayed gateway callback.
    ///
    /// The signature is verified server-side before anything is trusted; the
    /// order is then created from the *stored* snapshot, not from anything
    /// the client resends. Finalize is keyed by the gateway payment id, so a
    /// callback delivered twice yields the same single order. A failed
    /// verification keeps the intent so the client may retry verification
    /// without a fresh charge.
    #[instrument(skip(self, signature))]
    pub async fn confirm_payment(
        &self,
        gateway_order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<Order, ServiceError> {
        // Duplicate callback for an already-finalized payment.
        if let Some(existing) = self.orders.find_by_payment_reference(payment_id).await? {
            info!(order_uid = %existing.order_uid, "Callback replay, returning existing order");
            return Ok(existing);
        }

        let pending = match self.sessions.pending_payment(gateway_order_id).await {
            Some(pending) => pending,
            None => {
                warn!(%gateway_order_id, "Callback for unknown payment intent");
                return Err(ServiceError::VerificationFailed);
            }
        };

        if !self
            .gateway
            .verify_callback(gateway_order_id, payment_id, signature)
        {
            warn!(%gateway_order_id, %payment_id, "Callback signature verification failed");
            return Err(ServiceError::VerificationFailed);
        }

        let session = match self.sessions.get_session(&pending.session_id).await {
            Some(session) => session,
            None => {
                // Session already dropped; rebuild enough context to finalize
                // from the stored intent alone. The stored source decides
                // whether the persistent cart is cleared, so a buy-now
                // payment never touches it.
                CheckoutSession {
                    id: pending.session_id.clone(),
                    user_id: pending.user_id.clone(),
                    source: pending.source.clone(),
                    step: model::CheckoutStep::Review,
                    address: Some(pending.snapshot.address.clone()),
                    payment_method: Some(pending.snapshot.payment_method),
                    created_at: pending.created_at,
                }
            }
        };

        let order = build_order(
            &session,
            &pending.snapshot,
            OrderStatus::Paid,
            Some(payment_id.to_string()),
            None,
        );
        let snapshot = pending.snapshot.clone();
        let order = self.finalize(&session, snapshot, order).await?;
        self.sessions.remove_pending_payment(gateway_order_id).await;
        Ok(order)
    }

    /// The single authoritative step converting a reviewed checkout into a
    /// persisted order.
    ///
    /// Order insert, coupon consumption, and cart clearing are one database
    /// transaction; if it fails, cart and coupon state remain intact and the
    /// error is surfaced as a distinct, retryable `PersistenceFailure`. On
    /// success the session state is cleared and the confirmation message is
    /// fired without awaiting it.
    pub(crate) async fn finalize(
        &self,
        session: &CheckoutSession,
        snapshot: CheckoutSnapshot,
        order: Order,
    ) -> Result<Order, ServiceError> {
        let consume_coupon = snapshot.coupon.as_ref().map(|c| c.coupon.code.clone());
        let clear_cart_for = match &session.source {
            CheckoutSource::Cart => Some(session.user_id.as_str()),
            CheckoutSource::BuyNow { .. } => None,
        };

        if let Err(e) = self
            .orders
            .insert_finalized(&order, consume_coupon.as_deref(), clear_cart_for)
            .await
        {
            if order.payment_reference.is_some() {
                // Payment has been captured but the order write failed. This
                // must alert: paid-but-unfulfilled until the retry lands.
                error!(order_uid = %order.order_uid,
                    payment_reference = ?order.payment_reference, error = %e,
                    "Order persistence failed after verified payment");
            } else {
                error!(order_uid = %order.order_uid, error = %e, "Order persistence failed");
            }
            return Err(ServiceError::PersistenceFailure(e));
        }

        self.sessions.clear_applied_coupon(&session.user_id).await;
        self.sessions.remove_session(&session.id).await;

        notifier::send_fire_and_forget(
            self.confirmations.clone(),
            OrderConfirmation {
                user_phone: order.address.phone.clone(),
                order_uid: order.order_uid.clone(),
                amount: order.totals.total,
            },
        );

        info!(order_uid = %order.order_uid, total = order.totals.total,
            method = ?order.payment_method, "Order finalized");
        Ok(order)
    }
}

fn build_order(
    session: &CheckoutSession,
    snapshot: &CheckoutSnapshot,
    status: OrderStatus,
    payment_reference: Option<String>,
    idempotency_key: Option<String>,
) -> Order {
    Order {
        order_uid: Uuid::new_v4().to_string(),
        user_id: session.user_id.clone(),
        items: snapshot.lines.clone(),
        address: snapshot.address.clone(),
        payment_method: snapshot.payment_method,
        totals: snapshot.totals,
        status,
        payment_reference,
        idempotency_key,
        coupon_code: snapshot.coupon.as_ref().map(|c| c.coupon.code.clone()),
        created_at: Utc::now(),
    }
}
