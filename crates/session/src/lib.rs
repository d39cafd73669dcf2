//! In-memory session-scoped state with thread-safe access: checkout
//! sessions, applied coupons, and pending payment intents.
//!
//! Nothing here survives a restart on purpose — everything session-scoped is
//! recomputable, and orders themselves live in Postgres. Checkout sessions
//! and payment intents carry a creation time and expire after the configured
//! TTL; expired entries are evicted on read, so an abandoned checkout or an
//! unconsumed intent does not accumulate.

use chrono::{DateTime, Duration, Utc};
use model::{AppliedCoupon, CheckoutSession, PendingPayment};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;

/// Thread-safe store for all per-user checkout state.
#[derive(Debug)]
pub struct SessionStore {
    /// Lifetime of checkout sessions and unconsumed payment intents.
    ttl: Duration,
    /// Checkout sessions keyed by session id.
    sessions: Arc<RwLock<HashMap<String, CheckoutSession>>>,
    /// Applied coupons keyed by user id. An entry must never outlive the
    /// cart it was computed against; cart mutations clear it.
    applied_coupons: Arc<RwLock<HashMap<String, AppliedCoupon>>>,
    /// Payment intents awaiting their gateway callback, keyed by the
    /// gateway's opaque order id.
    pending_payments: Arc<RwLock<HashMap<String, PendingPayment>>>,
}

impl SessionStore {
    pub fn new(ttl: StdDuration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or(Duration::MAX),
            sessions: Arc::default(),
            applied_coupons: Arc::default(),
            pending_payments: Arc::default(),
        }
    }

    fn expired(&self, created_at: DateTime<Utc>) -> bool {
        Utc::now() - created_at > self.ttl
    }

    /// Get a cloned checkout session by its id. An expired session is
    /// evicted and reported as absent.
    pub async fn get_session(&self, session_id: &str) -> Option<CheckoutSession> {
        let session = {
            let map = self.sessions.read().await;
            map.get(session_id).cloned()
        }?;
        if self.expired(session.created_at) {
            self.sessions.write().await.remove(session_id);
            return None;
        }
        Some(session)
    }

    /// Insert or update a checkout session.
    pub async fn put_session(&self, session: CheckoutSession) {
        let mut map = self.sessions.write().await;
        map.insert(session.id.clone(), session);
    }

    /// Drop a checkout session (checkout completed or abandoned).
    pub async fn remove_session(&self, session_id: &str) {
        let mut map = self.sessions.write().await;
        map.remove(session_id);
    }

    /// The coupon currently applied by this user, if any.
    pub async fn applied_coupon(&self, user_id: &str) -> Option<AppliedCoupon> {
        let map = self.applied_coupons.read().await;
        map.get(user_id).cloned()
    }

    /// Record a successful coupon application for this user.
    pub async fn set_applied_coupon(&self, user_id: &str, applied: AppliedCoupon) {
        let mut map = self.applied_coupons.write().await;
        map.insert(user_id.to_string(), applied);
    }

    /// Clear the applied coupon: on cart change, checkout completion, or
    /// explicit removal.
    pub async fn clear_applied_coupon(&self, user_id: &str) {
        let mut map = self.applied_coupons.write().await;
        map.remove(user_id);
    }

    /// Pending payment intent by gateway order id. An intent past its TTL is
    /// evicted and reported as absent; its callback can then never finalize.
    pub async fn pending_payment(&self, gateway_order_id: &str) -> Option<PendingPayment> {
        let pending = {
            let map = self.pending_payments.read().await;
            map.get(gateway_order_id).cloned()
        }?;
        if self.expired(pending.created_at) {
            self.pending_payments.write().await.remove(gateway_order_id);
            return None;
        }
        Some(pending)
    }

    /// Store an intent awaiting its callback. Kept on verification failure so
    /// the client can retry verification without a fresh charge.
    pub async fn put_pending_payment(&self, pending: PendingPayment) {
        let mut map = self.pending_payments.write().await;
        map.insert(pending.gateway_order_id.clone(), pending);
    }

    /// Remove an intent once its order is finalized (or it is abandoned).
    pub async fn remove_pending_payment(&self, gateway_order_id: &str) {
        let mut map = self.pending_payments.write().await;
        map.remove(gateway_order_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{
        Address, AddressKind, AppliedCoupon, CartLine, CheckoutSnapshot, CheckoutSource,
        CheckoutStep, Coupon, CouponKind, OrderTotals, PaymentMethod, PendingPayment,
    };

    const TTL: StdDuration = StdDuration::from_secs(60);

    fn sample_coupon() -> AppliedCoupon {
        AppliedCoupon {
            coupon: Coupon {
                code: "SAVE10".to_string(),
                kind: CouponKind::Percentage,
                discount_value: 10,
                min_purchase: None,
                max_discount: Some(80),
                is_active: true,
                usage_limit: None,
                usage_count: 0,
            },
            discount: 80,
        }
    }

    fn sample_pending(gateway_order_id: &str) -> PendingPayment {
        PendingPayment {
            gateway_order_id: gateway_order_id.to_string(),
            user_id: "user-1".to_string(),
            session_id: "sess-1".to_string(),
            source: CheckoutSource::Cart,
            snapshot: CheckoutSnapshot {
                lines: vec![CartLine {
                    product_id: "prod-1".to_string(),
                    variant_sku: "SKU-1".to_string(),
                    unit_price: 600,
                    quantity: 1,
                }],
                address: Address {
                    id: 1,
                    kind: AddressKind::Home,
                    name: "Asha Rao".to_string(),
                    street: "12 MG Road".to_string(),
                    city: "Bengaluru".to_string(),
                    state: "Karnataka".to_string(),
                    pincode: "560001".to_string(),
                    phone: "+919800000000".to_string(),
                },
                payment_method: PaymentMethod::Card,
                totals: OrderTotals {
                    subtotal: 600,
                    shipping: 0,
                    discount: 0,
                    total: 600,
                },
                coupon: None,
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_empty_store() {
        let store = SessionStore::new(TTL);
        assert!(store.get_session("nonexistent").await.is_none());
        assert!(store.applied_coupon("user-1").await.is_none());
        assert!(store.pending_payment("gw-1").await.is_none());
    }

    #[tokio::test]
    async fn test_put_and_get_session() {
        let store = SessionStore::new(TTL);
        let session = CheckoutSession::new("user-1", CheckoutSource::Cart);
        let id = session.id.clone();
        store.put_session(session).await;

        let got = store.get_session(&id).await.unwrap();
        assert_eq!(got.step, CheckoutStep::Address);

        store.remove_session(&id).await;
        assert!(store.get_session(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_session_evicted_on_read() {
        let store = SessionStore::new(TTL);
        let mut session = CheckoutSession::new("user-1", CheckoutSource::Cart);
        session.created_at = Utc::now() - Duration::hours(1);
        let id = session.id.clone();
        store.put_session(session).await;

        assert!(store.get_session(&id).await.is_none());
        assert!(store.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_applied_coupon_lifecycle() {
        let store = SessionStore::new(TTL);
        store.set_applied_coupon("user-1", sample_coupon()).await;
        assert_eq!(store.applied_coupon("user-1").await.unwrap().discount, 80);

        store.clear_applied_coupon("user-1").await;
        assert!(store.applied_coupon("user-1").await.is_none());
    }

    #[tokio::test]
    async fn test_pending_payment_survives_until_removed() {
        let store = SessionStore::new(TTL);
        store.put_pending_payment(sample_pending("gw_order_1")).await;

        let got = store.pending_payment("gw_order_1").await.unwrap();
        assert_eq!(got.snapshot.totals.total, 600);

        // A failed verification leaves the intent in place for retry.
        assert!(store.pending_payment("gw_order_1").await.is_some());

        store.remove_pending_payment("gw_order_1").await;
        assert!(store.pending_payment("gw_order_1").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_intent_evicted_on_read() {
        let store = SessionStore::new(TTL);
        let mut pending = sample_pending("gw_order_2");
        pending.created_at = Utc::now() - Duration::hours(1);
        store.put_pending_payment(pending).await;

        assert!(store.pending_payment("gw_order_2").await.is_none());
        assert!(store.pending_payments.read().await.is_empty());
    }
}
