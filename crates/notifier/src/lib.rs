//! Fire-and-forget order-confirmation messaging.
//!
//! Confirmations are published to a Kafka topic for the downstream messaging
//! worker (WhatsApp/SMS). Delivery is best-effort and never authoritative for
//! order correctness: a publish failure is logged and nothing else.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Payload of one order-confirmation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderConfirmation {
    pub user_phone: String,
    pub order_uid: String,
    pub amount: i64,
}

/// Sink for confirmation messages.
#[async_trait]
pub trait ConfirmationSink: Send + Sync {
    async fn send(&self, confirmation: &OrderConfirmation) -> Result<()>;
}

/// Kafka-backed confirmation sink.
pub struct KafkaConfirmationSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaConfirmationSink {
    /// Create a producer for the given brokers and topic.
    pub fn new(brokers: &[String], topic: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", "5000")
            .create()
            .context("Failed to create Kafka producer")?;

        info!(topic = %topic, "Confirmation producer initialized");
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl ConfirmationSink for KafkaConfirmationSink {
    async fn send(&self, confirmation: &OrderConfirmation) -> Result<()> {
        let data = serde_json::to_string(confirmation)
            .context("Failed to serialize confirmation to JSON")?;

        let record = FutureRecord::to(&self.topic)
            .key(&confirmation.order_uid)
            .payload(&data);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(kafka_err, _)| anyhow::anyhow!("Kafka error: {kafka_err:?}"))
            .context("Failed to publish confirmation")?;

        info!(order_uid = %confirmation.order_uid, "Confirmation published");
        Ok(())
    }
}

/// Publishes a confirmation in the background. Failures are logged only —
/// they must never fail or roll back the order that triggered them.
pub fn send_fire_and_forget(sink: Arc<dyn ConfirmationSink>, confirmation: OrderConfirmation) {
    tokio::spawn(async move {
        if let Err(e) = sink.send(&confirmation).await {
            error!(order_uid = %confirmation.order_uid, error = ?e,
                "Failed to send order confirmation");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        sent: Mutex<Vec<OrderConfirmation>>,
    }

    #[async_trait]
    impl ConfirmationSink for RecordingSink {
        async fn send(&self, confirmation: &OrderConfirmation) -> Result<()> {
            self.sent.lock().unwrap().push(confirmation.clone());
            Ok(())
        }
    }

    #[test]
    fn test_confirmation_serializes() {
        let confirmation = OrderConfirmation {
            user_phone: "+919800000000".to_string(),
            order_uid: "order-1".to_string(),
            amount: 820,
        };
        let json = serde_json::to_string(&confirmation).unwrap();
        assert!(json.contains(r#""order_uid":"order-1""#));
        assert!(json.contains(r#""amount":820"#));
    }

    #[tokio::test]
    async fn test_fire_and_forget_delivers() {
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
        });
        let confirmation = OrderConfirmation {
            user_phone: "+919800000000".to_string(),
            order_uid: "order-2".to_string(),
            amount: 399,
        };
        send_fire_and_forget(sink.clone(), confirmation.clone());

        // The publish runs on a spawned task; yield until it lands.
        for _ in 0..100 {
            if !sink.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.sent.lock().unwrap().as_slice(), &[confirmation]);
    }
}
