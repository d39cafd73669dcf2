//! HTTP server for the storefront checkout pipeline.
//!
//! Exposes the cart, coupon, address, checkout, and payment endpoints over
//! axum, with bearer-token authentication resolved through the auth
//! collaborator and Prometheus metrics on every request.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use clients::AuthClient;
use model::{CheckoutSource, NewAddress, PaymentMethod};
use prometheus::{Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use repository::{
    PgAddressesRepository, PgCartsRepository, PgCouponsRepository, PgOrdersRepository,
};
use serde::Deserialize;
use service::{AddressSelection, CheckoutService, ServiceError};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// The service as wired in production: all four repositories on Postgres.
pub type StorefrontService =
    CheckoutService<PgCartsRepository, PgCouponsRepository, PgAddressesRepository, PgOrdersRepository>;

/// HTTP server for the storefront API.
pub struct Server {
    port: u16,
    state: AppState,
}

/// Metrics collects and exposes HTTP server metrics.
struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    errors_total: CounterVec,
    orders_placed_total: CounterVec,
    payment_verification_failures_total: Counter,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )
        .expect("Failed to create http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "endpoint"],
        )
        .expect("Failed to create http_request_duration_seconds metric");

        let errors_total = CounterVec::new(
            Opts::new("errors_total", "Total number of errors"),
            &["source", "endpoint"],
        )
        .expect("Failed to create errors_total metric");

        let orders_placed_total = CounterVec::new(
            Opts::new("orders_placed_total", "Orders finalized, by payment path"),
            &["path"],
        )
        .expect("Failed to create orders_placed_total metric");

        let payment_verification_failures_total = Counter::new(
            "payment_verification_failures_total",
            "Gateway callbacks that failed signature verification",
        )
        .expect("Failed to create payment_verification_failures_total metric");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("Failed to register http_requests_total metric");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("Failed to register http_request_duration_seconds metric");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("Failed to register errors_total metric");
        registry
            .register(Box::new(orders_placed_total.clone()))
            .expect("Failed to register orders_placed_total metric");
        registry
            .register(Box::new(payment_verification_failures_total.clone()))
            .expect("Failed to register payment_verification_failures_total metric");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            errors_total,
            orders_placed_total,
            payment_verification_failures_total,
        }
    }

    fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
    }

    fn record_error(&self, source: &str, endpoint: &str) {
        self.errors_total
            .with_label_values(&[source, endpoint])
            .inc();
    }

    fn record_order_placed(&self, path: &str) {
        self.orders_placed_total.with_label_values(&[path]).inc();
    }
}

/// Application state shared between request handlers.
#[derive(Clone)]
struct AppState {
    service: Arc<StorefrontService>,
    auth: Arc<dyn AuthClient>,
    metrics: Arc<Metrics>,
}

impl AppState {
    /// Resolve the caller from the `Authorization: Bearer <token>` header.
    async fn user(&self, headers: &HeaderMap) -> Result<String, ApiError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        Ok(service::authenticate(self.auth.as_ref(), token).await?)
    }
}

/// Wraps [`ServiceError`] with its HTTP status mapping.
struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ServiceError::SessionNotFound | ServiceError::UnknownVariant(_) => {
                StatusCode::NOT_FOUND
            }
            ServiceError::Db(repository::RepositoryError::NotFound) => StatusCode::NOT_FOUND,
            ServiceError::InvalidQuantity(_)
            | ServiceError::EmptyCart
            | ServiceError::AddressMissing
            | ServiceError::PaymentMethodMissing
            | ServiceError::PaymentMethodMismatch
            | ServiceError::VerificationFailed => StatusCode::BAD_REQUEST,
            ServiceError::Coupon(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::PriceDrift { .. } => StatusCode::CONFLICT,
            ServiceError::GatewayRejected(_) => StatusCode::BAD_GATEWAY,
            ServiceError::PersistenceFailure(_)
            | ServiceError::Db(_)
            | ServiceError::Collaborator(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            warn!(error = %self.0, "Request rejected");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct AddItemBody {
    product_id: String,
    variant_sku: String,
    quantity: i32,
}

#[derive(Deserialize)]
struct QuantityBody {
    quantity: i32,
}

#[derive(Deserialize)]
struct CouponBody {
    code: String,
}

#[derive(Deserialize)]
struct PaymentMethodBody {
    method: PaymentMethod,
}

#[derive(Deserialize)]
struct PlaceOrderBody {
    idempotency_key: String,
}

#[derive(Deserialize)]
struct ConfirmPaymentBody {
    gateway_order_id: String,
    payment_id: String,
    signature: String,
}

impl Server {
    pub fn new(port: u16, service: Arc<StorefrontService>, auth: Arc<dyn AuthClient>) -> Self {
        info!("Initializing HTTP server on port {}", port);
        Self {
            port,
            state: AppState {
                service,
                auth,
                metrics: Arc::new(Metrics::new()),
            },
        }
    }

    /// Starts the server and blocks until it's shut down.
    pub async fn start(&self) -> Result<()> {
        let app = self.create_router();

        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.port))
            .await
            .context("Failed to bind to port")?;

        info!("HTTP server listening on port {}", self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }

    fn create_router(&self) -> Router {
        let metrics = self.state.metrics.clone();

        Router::new()
            .route("/api/cart", get(Self::handle_get_cart))
            .route("/api/cart/items", post(Self::handle_add_item))
            .route("/api/cart/items/{sku}", put(Self::handle_set_quantity))
            .route("/api/cart/items/{sku}", delete(Self::handle_remove_item))
            .route("/api/cart/coupon", post(Self::handle_apply_coupon))
            .route("/api/cart/coupon", delete(Self::handle_remove_coupon))
            .route("/api/coupons", get(Self::handle_list_coupons))
            .route("/api/addresses", get(Self::handle_list_addresses))
            .route("/api/addresses", post(Self::handle_create_address))
            .route("/api/addresses/{id}", put(Self::handle_update_address))
            .route("/api/checkout", post(Self::handle_start_checkout))
            .route(
                "/api/checkout/{session_id}/address",
                post(Self::handle_set_address),
            )
            .route(
                "/api/checkout/{session_id}/payment-method",
                post(Self::handle_set_payment_method),
            )
            .route("/api/checkout/{session_id}/back", post(Self::handle_step_back))
            .route("/api/checkout/{session_id}/review", get(Self::handle_review))
            .route("/api/checkout/{session_id}/place", post(Self::handle_place_order))
            .route("/api/checkout/{session_id}/intent", post(Self::handle_payment_intent))
            .route("/api/payments/confirm", post(Self::handle_confirm_payment))
            .route("/api/orders/{order_uid}", get(Self::handle_get_order))
            .route("/health", get(Self::handle_health))
            .route("/metrics", get(Self::handle_metrics))
            .layer(axum::middleware::from_fn_with_state(
                metrics,
                Self::metrics_middleware,
            ))
            .with_state(self.state.clone())
    }

    /// Middleware for collecting metrics on HTTP requests.
    async fn metrics_middleware(
        State(metrics): State<Arc<Metrics>>,
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> Response {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let start = std::time::Instant::now();

        let response = next.run(req).await;

        let status = response.status().as_u16();
        metrics.record_request(&method, &path, status, start.elapsed());
        if status >= 400 {
            metrics.record_error("http", &path);
        }
        response
    }

    async fn handle_get_cart(State(state): State<AppState>, headers: HeaderMap) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state.service.get_cart(&user_id).await {
            Ok(view) => axum::Json(view).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_add_item(
        State(state): State<AppState>,
        headers: HeaderMap,
        axum::Json(body): axum::Json<AddItemBody>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state
            .service
            .add_to_cart(&user_id, &body.product_id, &body.variant_sku, body.quantity)
            .await
        {
            Ok(view) => (StatusCode::CREATED, axum::Json(view)).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_set_quantity(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(sku): Path<String>,
        axum::Json(body): axum::Json<QuantityBody>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state
            .service
            .change_quantity(&user_id, &sku, body.quantity)
            .await
        {
            Ok(view) => axum::Json(view).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_remove_item(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(sku): Path<String>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state.service.remove_from_cart(&user_id, &sku).await {
            Ok(view) => axum::Json(view).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_apply_coupon(
        State(state): State<AppState>,
        headers: HeaderMap,
        axum::Json(body): axum::Json<CouponBody>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state.service.apply_coupon(&user_id, &body.code).await {
            Ok(applied) => axum::Json(applied).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_remove_coupon(State(state): State<AppState>, headers: HeaderMap) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        state.service.remove_coupon(&user_id).await;
        StatusCode::NO_CONTENT.into_response()
    }

    async fn handle_list_coupons(State(state): State<AppState>) -> Response {
        match state.service.list_coupons().await {
            Ok(coupons) => axum::Json(coupons).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_list_addresses(State(state): State<AppState>, headers: HeaderMap) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state.service.list_addresses(&user_id).await {
            Ok(addresses) => axum::Json(addresses).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_create_address(
        State(state): State<AppState>,
        headers: HeaderMap,
        axum::Json(body): axum::Json<NewAddress>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state.service.create_address(&user_id, &body).await {
            Ok(address) => (StatusCode::CREATED, axum::Json(address)).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_update_address(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(id): Path<i64>,
        axum::Json(body): axum::Json<NewAddress>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state.service.update_address(&user_id, id, &body).await {
            Ok(address) => axum::Json(address).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_start_checkout(
        State(state): State<AppState>,
        headers: HeaderMap,
        axum::Json(source): axum::Json<CheckoutSource>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state.service.start_checkout(&user_id, source).await {
            Ok(session) => (StatusCode::CREATED, axum::Json(session)).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_set_address(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
        axum::Json(selection): axum::Json<AddressSelection>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state
            .service
            .set_address(&user_id, &session_id, selection)
            .await
        {
            Ok(session) => axum::Json(session).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_set_payment_method(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
        axum::Json(body): axum::Json<PaymentMethodBody>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state
            .service
            .set_payment_method(&user_id, &session_id, body.method)
            .await
        {
            Ok(session) => axum::Json(session).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_step_back(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state.service.step_back(&user_id, &session_id).await {
            Ok(session) => axum::Json(session).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_review(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state.service.review(&user_id, &session_id).await {
            Ok(snapshot) => axum::Json(snapshot).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_place_order(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
        axum::Json(body): axum::Json<PlaceOrderBody>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state
            .service
            .place_cod_order(&user_id, &session_id, &body.idempotency_key)
            .await
        {
            Ok(order) => {
                state.metrics.record_order_placed("cod");
                (StatusCode::CREATED, axum::Json(order)).into_response()
            }
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_payment_intent(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(session_id): Path<String>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state
            .service
            .create_payment_intent(&user_id, &session_id)
            .await
        {
            Ok(pending) => (StatusCode::CREATED, axum::Json(pending)).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_confirm_payment(
        State(state): State<AppState>,
        axum::Json(body): axum::Json<ConfirmPaymentBody>,
    ) -> Response {
        match state
            .service
            .confirm_payment(&body.gateway_order_id, &body.payment_id, &body.signature)
            .await
        {
            Ok(order) => {
                state.metrics.record_order_placed("gateway");
                axum::Json(order).into_response()
            }
            Err(err) => {
                if matches!(err, ServiceError::VerificationFailed) {
                    state.metrics.payment_verification_failures_total.inc();
                }
                ApiError(err).into_response()
            }
        }
    }

    async fn handle_get_order(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(order_uid): Path<String>,
    ) -> Response {
        let user_id = match state.user(&headers).await {
            Ok(user_id) => user_id,
            Err(err) => return err.into_response(),
        };
        match state.service.get_order(&user_id, &order_uid).await {
            Ok(order) => axum::Json(order).into_response(),
            Err(err) => ApiError(err).into_response(),
        }
    }

    async fn handle_health() -> &'static str {
        "OK"
    }

    async fn handle_metrics(State(state): State<AppState>) -> Response {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
        }

        match String::from_utf8(buffer) {
            Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
            Err(e) => {
                error!("Failed to convert metrics to UTF-8: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
            }
        }
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricing::CouponError;

    fn status_of(err: ServiceError) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_of(ServiceError::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(ServiceError::SessionNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ServiceError::EmptyCart), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(ServiceError::VerificationFailed), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(ServiceError::Coupon(CouponError::InvalidCode)),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(ServiceError::PriceDrift {
                variant_sku: "LIP-RED-01".to_string(),
                cart_price: 450,
                catalog_price: 500,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ServiceError::GatewayRejected("boom".to_string())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_metrics_register_without_collision() {
        let metrics = Metrics::new();
        metrics.record_request("GET", "/api/cart", 200, Duration::from_millis(3));
        metrics.record_error("http", "/api/cart");
        metrics.record_order_placed("cod");
        assert!(!metrics.registry.gather().is_empty());
    }
}
