//! Storefront backend entry point.
//!
//! Wires configuration, the database pool, the payment gateway and
//! collaborator clients, the Kafka confirmation producer, and the HTTP
//! server together, then runs until a shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::{error, info};

use app_config::AppConfig;
use clients::{HttpAuthClient, HttpCatalogClient};
use gateway::HttpPaymentGateway;
use notifier::KafkaConfirmationSink;
use pricing::ShippingPolicy;
use repository::{
    PgAddressesRepository, PgCartsRepository, PgCouponsRepository, PgOrdersRepository,
};
use server::Server;
use service::CheckoutService;
use session::SessionStore;

/// Initialize the tracing subscriber for logging
fn init_logger() -> Result<()> {
    tracing_subscriber::fmt::init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = init_logger() {
        eprintln!("Failed to initialize logger: {}", err);
        return Err(anyhow::anyhow!("Failed to initialize logger"));
    }

    info!("Storefront backend starting...");

    let config = AppConfig::load().context("Failed to load configuration")?;

    let db_pool = match db::init_db_pool(&config).await {
        Ok(pool) => {
            info!("Database initialized successfully");
            pool
        }
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return Err(anyhow::anyhow!("Failed to initialize database"));
        }
    };

    // Repositories share the pool; each clone is cheap.
    let carts_repo = PgCartsRepository::new(db_pool.clone());
    let coupons_repo = PgCouponsRepository::new(db_pool.clone());
    let addresses_repo = PgAddressesRepository::new(db_pool.clone());
    let orders_repo = PgOrdersRepository::new(db_pool.clone());

    let payment_gateway = Arc::new(HttpPaymentGateway::new(
        &config.gateway_base_url,
        &config.gateway_key_id,
        &config.gateway_key_secret,
    ));
    let catalog = Arc::new(HttpCatalogClient::new(&config.catalog_base_url));
    let auth = Arc::new(HttpAuthClient::new(&config.auth_base_url));

    let confirmations = Arc::new(
        KafkaConfirmationSink::new(&config.kafka_brokers, &config.confirmation_topic)
            .context("Failed to initialize confirmation producer")?,
    );

    let checkout_service = Arc::new(CheckoutService::new(
        carts_repo,
        coupons_repo,
        addresses_repo,
        orders_repo,
        payment_gateway,
        catalog,
        confirmations,
        Arc::new(SessionStore::new(config.checkout_session_ttl)),
        ShippingPolicy {
            free_shipping_threshold: config.free_shipping_threshold,
            flat_fee: config.flat_shipping_fee,
        },
        &config.currency,
        config.price_drift_tolerance,
    ));

    let mut tasks = JoinSet::new();

    let http_server = Server::new(config.http_port, checkout_service, auth);
    tasks.spawn(async move {
        if let Err(err) = http_server.start().await {
            error!("HTTP server error: {}", err);
            std::process::exit(1);
        }
    });

    while let Some(res) = tasks.join_next().await {
        if let Err(err) = res {
            error!("Task error: {}", err);
        }
    }

    info!("Application stopped");
    Ok(())
}
