//! Pure pricing rules: order total computation and coupon evaluation.
//!
//! Both functions are referentially transparent; the server-side call to
//! [`compute_totals`] is the only computation allowed to create an order.

use model::{CartLine, Coupon, CouponKind, OrderTotals};
use serde::Serialize;
use thiserror::Error;

/// Shipping rule: free above the threshold, a flat fee otherwise.
///
/// One configured pair is used everywhere; the cart and checkout views must
/// never disagree on the fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippingPolicy {
    pub free_shipping_threshold: i64,
    pub flat_fee: i64,
}

impl ShippingPolicy {
    /// Shipping cost for a given subtotal. Zero for an empty cart.
    pub fn fee_for(&self, subtotal: i64) -> i64 {
        if subtotal == 0 || subtotal > self.free_shipping_threshold {
            0
        } else {
            self.flat_fee
        }
    }
}

/// Combines line items, the shipping rule, and an already-computed discount
/// into the authoritative totals.
///
/// The discount may exceed subtotal + shipping (a fixed coupon is not capped
/// at evaluation time); the floor is enforced here, never earlier.
pub fn compute_totals(lines: &[CartLine], discount: i64, policy: &ShippingPolicy) -> OrderTotals {
    let subtotal: i64 = lines.iter().map(CartLine::line_total).sum();
    let shipping = policy.fee_for(subtotal);
    let total = (subtotal + shipping - discount).max(0);
    OrderTotals {
        subtotal,
        shipping,
        discount,
        total,
    }
}

/// Reasons a coupon cannot be applied. Non-fatal: cart and checkout state are
/// unaffected by a rejection.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum CouponError {
    #[error("Invalid or inactive coupon code")]
    InvalidCode,
    #[error("Order subtotal is below the minimum purchase of {0}")]
    BelowMinimumPurchase(i64),
    #[error("Coupon has reached its usage limit")]
    UsageLimitReached,
}

/// Normalizes a user-supplied coupon code for lookup: trim plus uppercase.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Evaluates a coupon against a subtotal and returns the discount amount.
///
/// Evaluation has no side effects: usage counters are only advanced inside
/// the finalize transaction, so an applied-then-abandoned cart never consumes
/// a use. Re-evaluating with the same subtotal yields the same discount.
pub fn evaluate_coupon(coupon: &Coupon, subtotal: i64) -> Result<i64, CouponError> {
    if !coupon.is_active {
        return Err(CouponError::InvalidCode);
    }
    if let Some(limit) = coupon.usage_limit {
        if coupon.usage_count >= limit {
            return Err(CouponError::UsageLimitReached);
        }
    }
    if let Some(min) = coupon.min_purchase {
        if subtotal < min {
            return Err(CouponError::BelowMinimumPurchase(min));
        }
    }

    let discount = match coupon.kind {
        CouponKind::Percentage => {
            let raw = subtotal * coupon.discount_value / 100;
            match coupon.max_discount {
                Some(cap) => raw.min(cap),
                None => raw,
            }
        }
        // Deliberately not capped by subtotal; compute_totals floors at zero.
        CouponKind::Fixed => coupon.discount_value,
    };

    Ok(discount)
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: ShippingPolicy = ShippingPolicy {
        free_shipping_threshold: 499,
        flat_fee: 99,
    };

    fn line(price: i64, qty: i32) -> CartLine {
        CartLine {
            product_id: "prod-1".to_string(),
            variant_sku: "SKU-1".to_string(),
            unit_price: price,
            quantity: qty,
        }
    }

    fn percentage_coupon(value: i64, max: Option<i64>, min: Option<i64>) -> Coupon {
        Coupon {
            code: "SAVE10".to_string(),
            kind: CouponKind::Percentage,
            discount_value: value,
            min_purchase: min,
            max_discount: max,
            is_active: true,
            usage_limit: None,
            usage_count: 0,
        }
    }

    #[test]
    fn test_subtotal_above_threshold_ships_free() {
        // Scenario A: subtotal 600, no coupon.
        let totals = compute_totals(&[line(600, 1)], 0, &POLICY);
        assert_eq!(totals.subtotal, 600);
        assert_eq!(totals.shipping, 0);
        assert_eq!(totals.total, 600);
    }

    #[test]
    fn test_subtotal_below_threshold_pays_flat_fee() {
        // Scenario B: subtotal 300, no coupon.
        let totals = compute_totals(&[line(150, 2)], 0, &POLICY);
        assert_eq!(totals.subtotal, 300);
        assert_eq!(totals.shipping, 99);
        assert_eq!(totals.total, 399);
    }

    #[test]
    fn test_subtotal_exactly_at_threshold_is_not_free() {
        let totals = compute_totals(&[line(499, 1)], 0, &POLICY);
        assert_eq!(totals.shipping, 99);
    }

    #[test]
    fn test_empty_cart_yields_zero_totals() {
        let totals = compute_totals(&[], 0, &POLICY);
        assert_eq!(totals, OrderTotals::default());
    }

    #[test]
    fn test_shipping_is_monotonic_in_subtotal() {
        let mut previous = i64::MAX;
        for subtotal in [1, 100, 499, 500, 1000, 10_000] {
            let fee = POLICY.fee_for(subtotal);
            assert!(fee <= previous, "fee must never rise with subtotal");
            previous = fee;
        }
    }

    #[test]
    fn test_discount_never_drives_total_negative() {
        let totals = compute_totals(&[line(200, 1)], 1000, &POLICY);
        assert_eq!(totals.total, 0);
        assert_eq!(totals.discount, 1000);
    }

    #[test]
    fn test_percentage_discount_clamped_to_max() {
        // Scenario C: subtotal 1000, 10% with max 80 -> 80, not 100.
        let coupon = percentage_coupon(10, Some(80), None);
        assert_eq!(evaluate_coupon(&coupon, 1000).unwrap(), 80);

        let totals = compute_totals(&[line(1000, 1)], 80, &POLICY);
        assert_eq!(totals.total, 920);
    }

    #[test]
    fn test_percentage_discount_without_cap() {
        let coupon = percentage_coupon(10, None, None);
        assert_eq!(evaluate_coupon(&coupon, 1000).unwrap(), 100);
    }

    #[test]
    fn test_below_minimum_purchase_rejected() {
        // Scenario D: subtotal 200, min purchase 500.
        let coupon = percentage_coupon(10, None, Some(500));
        assert_eq!(
            evaluate_coupon(&coupon, 200),
            Err(CouponError::BelowMinimumPurchase(500))
        );
    }

    #[test]
    fn test_fixed_discount_ignores_subtotal() {
        let coupon = Coupon {
            code: "FLAT150".to_string(),
            kind: CouponKind::Fixed,
            discount_value: 150,
            min_purchase: None,
            max_discount: None,
            is_active: true,
            usage_limit: None,
            usage_count: 0,
        };
        assert_eq!(evaluate_coupon(&coupon, 100).unwrap(), 150);
        assert_eq!(evaluate_coupon(&coupon, 10_000).unwrap(), 150);
        // The floor lives in compute_totals, not in the evaluator.
        let totals = compute_totals(&[line(100, 1)], 150, &POLICY);
        assert_eq!(totals.total, 0);
    }

    #[test]
    fn test_inactive_coupon_rejected() {
        let mut coupon = percentage_coupon(10, None, None);
        coupon.is_active = false;
        assert_eq!(evaluate_coupon(&coupon, 1000), Err(CouponError::InvalidCode));
    }

    #[test]
    fn test_exhausted_coupon_rejected() {
        let mut coupon = percentage_coupon(10, None, None);
        coupon.usage_limit = Some(5);
        coupon.usage_count = 5;
        assert_eq!(
            evaluate_coupon(&coupon, 1000),
            Err(CouponError::UsageLimitReached)
        );
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let coupon = percentage_coupon(15, Some(120), None);
        let first = evaluate_coupon(&coupon, 900).unwrap();
        let second = evaluate_coupon(&coupon, 900).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("  save10 "), "SAVE10");
        assert_eq!(normalize_code("Save10"), "SAVE10");
    }
}
