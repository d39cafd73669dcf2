use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the storefront
/// backend.
///
/// The configuration is loaded from environment variables (optionally via a
/// `.env` file) or falls back to default values. Fields cover the database,
/// the HTTP server, pricing rules, the payment gateway, collaborator base
/// URLs, and Kafka for confirmation messages.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- Database settings ---
    /// Database hostname or service name.
    pub db_host: String,
    /// Database port (default: 5432).
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,

    // --- HTTP server ---
    /// The port on which the HTTP server will listen.
    pub http_port: u16,

    // --- Shutdown timeout ---
    /// Graceful shutdown timeout (human-friendly format, e.g. "5s", "1m").
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub shutdown_timeout: Duration,

    // --- Sessions ---
    /// Lifetime of checkout sessions and unconsumed payment intents
    /// (human-friendly format, e.g. "30m").
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub checkout_session_ttl: Duration,

    // --- Pricing ---
    /// Subtotal above which shipping is free. One value for the whole
    /// pipeline; cart and checkout must never disagree.
    pub free_shipping_threshold: i64,
    /// Flat shipping fee charged below the threshold.
    pub flat_shipping_fee: i64,
    /// ISO currency code passed to the payment gateway.
    pub currency: String,
    /// Allowed absolute difference between the cart's snapshotted unit price
    /// and the live catalog price before checkout is rejected.
    pub price_drift_tolerance: i64,

    // --- Payment gateway ---
    /// Base URL of the payment gateway API.
    pub gateway_base_url: String,
    /// Gateway API key id.
    pub gateway_key_id: String,
    /// Gateway API key secret; also used to verify callback signatures.
    pub gateway_key_secret: String,

    // --- Collaborators ---
    /// Base URL of the product catalog service.
    pub catalog_base_url: String,
    /// Base URL of the auth/session service.
    pub auth_base_url: String,

    // --- Kafka (order confirmations) ---
    /// List of Kafka brokers (comma-separated string in env, parsed to Vec<String>).
    pub kafka_brokers: Vec<String>,
    /// Topic order-confirmation messages are published to.
    pub confirmation_topic: String,
}

/// Custom deserializer for graceful shutdown timeout.
/// Accepts human-readable formats like "5s", "1m", etc.
fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from `.env` file).
    ///
    /// Fields not set via env will be filled with default values.
    ///
    /// # Errors
    /// Returns an error if environment variables are invalid or missing required values.
    pub fn load() -> Result<Self> {
        // Load from .env file (for Docker environment)
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "storefront_user")?
            .set_default("db_password", "securepassword")?
            .set_default("db_name", "storefront_db")?
            // HTTP
            .set_default("http_port", 8081)?
            // Shutdown
            .set_default("shutdown_timeout", "5s")?
            // Sessions
            .set_default("checkout_session_ttl", "30m")?
            // Pricing
            .set_default("free_shipping_threshold", 499)?
            .set_default("flat_shipping_fee", 99)?
            .set_default("currency", "INR")?
            .set_default("price_drift_tolerance", 0)?
            // Payment gateway
            .set_default("gateway_base_url", "https://api.gateway.test")?
            .set_default("gateway_key_id", "key_test")?
            .set_default("gateway_key_secret", "secret_test")?
            // Collaborators
            .set_default("catalog_base_url", "http://localhost:8090")?
            .set_default("auth_base_url", "http://localhost:8091")?
            // Kafka
            .set_default("kafka_brokers", vec!["localhost:9092"])?
            .set_default("confirmation_topic", "order-confirmations")?
            .add_source(config::Environment::default().separator("_"))
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }
}
