//! Payment gateway client and callback signature verification.
//!
//! The gateway hands out an opaque order id for an amount ("this amount is
//! ready to be charged"); after the user pays in the gateway's own widget,
//! the client relays back `(gateway_order_id, payment_id, signature)`. The
//! signature is HMAC-SHA256 over `"{gateway_order_id}|{payment_id}"` with the
//! API secret, and must be verified server-side before any order is created.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Errors from the payment gateway boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport-level failure talking to the gateway.
    #[error("Gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The gateway refused to create a payment session.
    #[error("Gateway rejected the request: {0}")]
    Rejected(String),
}

/// An open payment session at the gateway for a fixed amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySession {
    pub gateway_order_id: String,
    pub amount: i64,
    pub currency: String,
}

/// Boundary to the payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Ask the gateway for a payment session keyed to the server-computed
    /// amount. The amount must never come from the client.
    async fn create_session(
        &self,
        amount: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewaySession, GatewayError>;

    /// Verify a client-relayed callback against the gateway secret.
    fn verify_callback(&self, gateway_order_id: &str, payment_id: &str, signature: &str) -> bool;
}

/// Computes the callback signature for a (gateway order, payment) pair.
pub fn sign_callback(secret: &str, gateway_order_id: &str, payment_id: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{gateway_order_id}|{payment_id}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a relayed callback signature with a constant-time comparison.
pub fn verify_callback_signature(
    secret: &str,
    gateway_order_id: &str,
    payment_id: &str,
    signature: &str,
) -> bool {
    let expected = sign_callback(secret, gateway_order_id, payment_id);
    constant_time_eq(&expected, signature)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    id: String,
}

/// HTTP implementation of [`PaymentGateway`] against the provider's REST API.
pub struct HttpPaymentGateway {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: &str, key_id: &str, key_secret: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key_id: key_id.to_string(),
            key_secret: key_secret.to_string(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_session(
        &self,
        amount: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewaySession, GatewayError> {
        let url = format!("{}/v1/orders", self.base_url);
        let body = serde_json::json!({
            "amount": amount,
            "currency": currency,
            "receipt": receipt,
        });

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            warn!(%status, "Gateway refused session creation");
            return Err(GatewayError::Rejected(format!("{status}: {detail}")));
        }

        let created: CreateOrderResponse = response.json().await?;
        Ok(GatewaySession {
            gateway_order_id: created.id,
            amount,
            currency: currency.to_string(),
        })
    }

    fn verify_callback(&self, gateway_order_id: &str, payment_id: &str, signature: &str) -> bool {
        verify_callback_signature(&self.key_secret, gateway_order_id, payment_id, signature)
    }
}
