//! # Data Repository Layer
//!
//! Repository traits and PostgreSQL implementations for the storefront
//! entities: cart lines, coupons, addresses, orders.
//!
//! Order finalization spans three tables (orders + items, coupon usage, cart
//! clearing) and must be atomic, so the orders repository owns that
//! transaction; the service layer stays a pure composition of traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, PoolError};
use model::{
    Address, AddressKind, CartLine, Coupon, CouponKind, NewAddress, Order, OrderStatus,
    OrderTotals, PaymentMethod,
};
use thiserror::Error;
use tokio_postgres::Row;

/// Error types that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    /// No result found.
    #[error("Not found")]
    NotFound,
    /// A stored value could not be mapped back to a domain type.
    #[error("Decode error: {0}")]
    Decode(String),
}

fn address_kind_str(kind: AddressKind) -> &'static str {
    match kind {
        AddressKind::Home => "home",
        AddressKind::Office => "office",
    }
}

fn parse_address_kind(s: &str) -> Result<AddressKind, RepositoryError> {
    match s {
        "home" => Ok(AddressKind::Home),
        "office" => Ok(AddressKind::Office),
        other => Err(RepositoryError::Decode(format!(
            "unknown address kind '{other}'"
        ))),
    }
}

fn coupon_kind_str(kind: CouponKind) -> &'static str {
    match kind {
        CouponKind::Percentage => "percentage",
        CouponKind::Fixed => "fixed",
    }
}

fn parse_coupon_kind(s: &str) -> Result<CouponKind, RepositoryError> {
    match s {
        "percentage" => Ok(CouponKind::Percentage),
        "fixed" => Ok(CouponKind::Fixed),
        other => Err(RepositoryError::Decode(format!(
            "unknown coupon kind '{other}'"
        ))),
    }
}

fn payment_method_str(method: PaymentMethod) -> &'static str {
    match method {
        PaymentMethod::Card => "card",
        PaymentMethod::Upi => "upi",
        PaymentMethod::Cod => "cod",
    }
}

fn parse_payment_method(s: &str) -> Result<PaymentMethod, RepositoryError> {
    match s {
        "card" => Ok(PaymentMethod::Card),
        "upi" => Ok(PaymentMethod::Upi),
        "cod" => Ok(PaymentMethod::Cod),
        other => Err(RepositoryError::Decode(format!(
            "unknown payment method '{other}'"
        ))),
    }
}

fn order_status_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "pending",
        OrderStatus::Paid => "paid",
        OrderStatus::Cancelled => "cancelled",
    }
}

fn parse_order_status(s: &str) -> Result<OrderStatus, RepositoryError> {
    match s {
        "pending" => Ok(OrderStatus::Pending),
        "paid" => Ok(OrderStatus::Paid),
        "cancelled" => Ok(OrderStatus::Cancelled),
        other => Err(RepositoryError::Decode(format!(
            "unknown order status '{other}'"
        ))),
    }
}

/// # CartsRepository
///
/// Repository interface for the per-user persistent cart. Pure CRUD: line
/// validation and coupon clearing live in the service layer.
#[async_trait]
pub trait CartsRepository: Send + Sync {
    /// All lines of the user's cart.
    async fn get_lines(&self, user_id: &str) -> Result<Vec<CartLine>, RepositoryError>;

    /// Insert a line, or add its quantity to an existing line with the same
    /// variant (keeping the stored price snapshot).
    async fn upsert_line(&self, user_id: &str, line: &CartLine) -> Result<(), RepositoryError>;

    /// Set the quantity of an existing line. `NotFound` if the line is absent.
    async fn set_quantity(
        &self,
        user_id: &str,
        variant_sku: &str,
        quantity: i32,
    ) -> Result<(), RepositoryError>;

    /// Remove one line from the cart.
    async fn remove_line(&self, user_id: &str, variant_sku: &str) -> Result<(), RepositoryError>;
}

/// PostgreSQL implementation of the CartsRepository trait.
pub struct PgCartsRepository {
    pool: Pool,
}

impl PgCartsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CartsRepository for PgCartsRepository {
    async fn get_lines(&self, user_id: &str) -> Result<Vec<CartLine>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT product_id, variant_sku, unit_price, quantity
            FROM cart_lines WHERE user_id = $1
            ORDER BY variant_sku
        "#;
        let rows = client.query(query, &[&user_id]).await?;
        let mut lines = Vec::with_capacity(rows.len());
        for row in rows {
            lines.push(CartLine {
                product_id: row.get("product_id"),
                variant_sku: row.get("variant_sku"),
                unit_price: row.get("unit_price"),
                quantity: row.get("quantity"),
            });
        }
        Ok(lines)
    }

    async fn upsert_line(&self, user_id: &str, line: &CartLine) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO cart_lines (user_id, product_id, variant_sku, unit_price, quantity)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, variant_sku)
            DO UPDATE SET quantity = cart_lines.quantity + EXCLUDED.quantity
        "#;
        client
            .execute(
                query,
                &[
                    &user_id,
                    &line.product_id,
                    &line.variant_sku,
                    &line.unit_price,
                    &line.quantity,
                ],
            )
            .await?;
        Ok(())
    }

    async fn set_quantity(
        &self,
        user_id: &str,
        variant_sku: &str,
        quantity: i32,
    ) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            UPDATE cart_lines SET quantity = $3
            WHERE user_id = $1 AND variant_sku = $2
        "#;
        let updated = client
            .execute(query, &[&user_id, &variant_sku, &quantity])
            .await?;
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn remove_line(&self, user_id: &str, variant_sku: &str) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        let query = "DELETE FROM cart_lines WHERE user_id = $1 AND variant_sku = $2";
        client.execute(query, &[&user_id, &variant_sku]).await?;
        Ok(())
    }
}

/// # CouponsRepository
///
/// Read access to coupon definitions. Usage accounting is not exposed here:
/// a use is consumed only inside the finalize transaction, so evaluation
/// never burns a use on an abandoned cart.
#[async_trait]
pub trait CouponsRepository: Send + Sync {
    /// Look up an active coupon by its normalized (uppercase) code.
    async fn find_active(&self, code: &str) -> Result<Option<Coupon>, RepositoryError>;

    /// All currently active coupons, for display.
    async fn list_active(&self) -> Result<Vec<Coupon>, RepositoryError>;
}

/// PostgreSQL implementation of the CouponsRepository trait.
pub struct PgCouponsRepository {
    pool: Pool,
}

impl PgCouponsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn coupon_from_row(row: &Row) -> Result<Coupon, RepositoryError> {
    let kind: String = row.get("kind");
    Ok(Coupon {
        code: row.get("code"),
        kind: parse_coupon_kind(&kind)?,
        discount_value: row.get("discount_value"),
        min_purchase: row.get("min_purchase"),
        max_discount: row.get("max_discount"),
        is_active: row.get("is_active"),
        usage_limit: row.get("usage_limit"),
        usage_count: row.get("usage_count"),
    })
}

#[async_trait]
impl CouponsRepository for PgCouponsRepository {
    async fn find_active(&self, code: &str) -> Result<Option<Coupon>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT code, kind, discount_value, min_purchase, max_discount,
                   is_active, usage_limit, usage_count
            FROM coupons WHERE code = $1 AND is_active = TRUE
        "#;
        let row = client.query_opt(query, &[&code]).await?;
        match row {
            Some(row) => Ok(Some(coupon_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_active(&self) -> Result<Vec<Coupon>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT code, kind, discount_value, min_purchase, max_discount,
                   is_active, usage_limit, usage_count
            FROM coupons WHERE is_active = TRUE
            ORDER BY code
        "#;
        let rows = client.query(query, &[]).await?;
        let mut coupons = Vec::with_capacity(rows.len());
        for row in rows {
            coupons.push(coupon_from_row(&row)?);
        }
        Ok(coupons)
    }
}

/// # AddressesRepository
///
/// Repository interface for the user's address book. Orders snapshot address
/// fields at checkout; nothing here is referenced by an order row.
#[async_trait]
pub trait AddressesRepository: Send + Sync {
    async fn list(&self, user_id: &str) -> Result<Vec<Address>, RepositoryError>;

    /// Fetch one address owned by the user. `NotFound` if absent or owned by
    /// someone else.
    async fn get(&self, user_id: &str, address_id: i64) -> Result<Address, RepositoryError>;

    async fn insert(&self, user_id: &str, address: &NewAddress)
    -> Result<Address, RepositoryError>;

    async fn update(
        &self,
        user_id: &str,
        address_id: i64,
        address: &NewAddress,
    ) -> Result<Address, RepositoryError>;
}

/// PostgreSQL implementation of the AddressesRepository trait.
pub struct PgAddressesRepository {
    pool: Pool,
}

impl PgAddressesRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn address_from_row(row: &Row) -> Result<Address, RepositoryError> {
    let kind: String = row.get("kind");
    Ok(Address {
        id: row.get("id"),
        kind: parse_address_kind(&kind)?,
        name: row.get("name"),
        street: row.get("street"),
        city: row.get("city"),
        state: row.get("state"),
        pincode: row.get("pincode"),
        phone: row.get("phone"),
    })
}

#[async_trait]
impl AddressesRepository for PgAddressesRepository {
    async fn list(&self, user_id: &str) -> Result<Vec<Address>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT id, kind, name, street, city, state, pincode, phone
            FROM addresses WHERE user_id = $1 ORDER BY id
        "#;
        let rows = client.query(query, &[&user_id]).await?;
        let mut addresses = Vec::with_capacity(rows.len());
        for row in rows {
            addresses.push(address_from_row(&row)?);
        }
        Ok(addresses)
    }

    async fn get(&self, user_id: &str, address_id: i64) -> Result<Address, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT id, kind, name, street, city, state, pincode, phone
            FROM addresses WHERE user_id = $1 AND id = $2
        "#;
        let row = client.query_opt(query, &[&user_id, &address_id]).await?;
        match row {
            Some(row) => address_from_row(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn insert(
        &self,
        user_id: &str,
        address: &NewAddress,
    ) -> Result<Address, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO addresses (user_id, kind, name, street, city, state, pincode, phone)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
        "#;
        let row = client
            .query_one(
                query,
                &[
                    &user_id,
                    &address_kind_str(address.kind),
                    &address.name,
                    &address.street,
                    &address.city,
                    &address.state,
                    &address.pincode,
                    &address.phone,
                ],
            )
            .await?;
        Ok(Address {
            id: row.get("id"),
            kind: address.kind,
            name: address.name.clone(),
            street: address.street.clone(),
            city: address.city.clone(),
            state: address.state.clone(),
            pincode: address.pincode.clone(),
            phone: address.phone.clone(),
        })
    }

    async fn update(
        &self,
        user_id: &str,
        address_id: i64,
        address: &NewAddress,
    ) -> Result<Address, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            UPDATE addresses
            SET kind = $3, name = $4, street = $5, city = $6, state = $7, pincode = $8, phone = $9
            WHERE user_id = $1 AND id = $2
        "#;
        let updated = client
            .execute(
                query,
                &[
                    &user_id,
                    &address_id,
                    &address_kind_str(address.kind),
                    &address.name,
                    &address.street,
                    &address.city,
                    &address.state,
                    &address.pincode,
                    &address.phone,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(Address {
            id: address_id,
            kind: address.kind,
            name: address.name.clone(),
            street: address.street.clone(),
            city: address.city.clone(),
            state: address.state.clone(),
            pincode: address.pincode.clone(),
            phone: address.phone.clone(),
        })
    }
}

/// # OrdersRepository
///
/// Orders are the main aggregate. `insert_finalized` performs the whole
/// finalize unit atomically; the unique indexes on `payment_reference` and
/// `idempotency_key` back the at-most-once guarantees.
#[async_trait]
pub trait OrdersRepository: Send + Sync {
    /// Full order (with items) by id, scoped to its owner.
    async fn get_by_id(&self, user_id: &str, order_uid: &str) -> Result<Order, RepositoryError>;

    /// Order previously finalized against this gateway payment id, if any.
    async fn find_by_payment_reference(
        &self,
        payment_id: &str,
    ) -> Result<Option<Order>, RepositoryError>;

    /// Order previously finalized with this client idempotency token, if any.
    async fn find_by_idempotency_key(&self, key: &str)
    -> Result<Option<Order>, RepositoryError>;

    /// Atomically persists the order and its items, consumes one coupon use
    /// (when a coupon was applied), and clears the user's persistent cart
    /// (when the checkout was cart-sourced). On any failure the whole
    /// transaction rolls back: cart and coupon usage remain intact.
    async fn insert_finalized(
        &self,
        order: &Order,
        consume_coupon: Option<&str>,
        clear_cart_for: Option<&str>,
    ) -> Result<(), RepositoryError>;
}

/// PostgreSQL implementation of the OrdersRepository trait.
pub struct PgOrdersRepository {
    pool: Pool,
}

impl PgOrdersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn load_items(
        &self,
        client: &deadpool_postgres::Object,
        order_uid: &str,
    ) -> Result<Vec<CartLine>, RepositoryError> {
        let query = r#"
            SELECT product_id, variant_sku, unit_price, quantity
            FROM order_items WHERE order_uid = $1
            ORDER BY variant_sku
        "#;
        let rows = client.query(query, &[&order_uid]).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(CartLine {
                product_id: row.get("product_id"),
                variant_sku: row.get("variant_sku"),
                unit_price: row.get("unit_price"),
                quantity: row.get("quantity"),
            });
        }
        Ok(items)
    }
}

fn order_from_row(row: &Row) -> Result<Order, RepositoryError> {
    let address_kind: String = row.get("address_kind");
    let payment_method: String = row.get("payment_method");
    let status: String = row.get("status");
    let created_at: DateTime<Utc> = row.get("created_at");
    Ok(Order {
        order_uid: row.get("order_uid"),
        user_id: row.get("user_id"),
        items: Vec::new(), // filled by the caller
        address: Address {
            id: row.get("address_id"),
            kind: parse_address_kind(&address_kind)?,
            name: row.get("address_name"),
            street: row.get("street"),
            city: row.get("city"),
            state: row.get("state"),
            pincode: row.get("pincode"),
            phone: row.get("phone"),
        },
        payment_method: parse_payment_method(&payment_method)?,
        totals: OrderTotals {
            subtotal: row.get("subtotal"),
            shipping: row.get("shipping"),
            discount: row.get("discount"),
            total: row.get("total"),
        },
        status: parse_order_status(&status)?,
        payment_reference: row.get("payment_reference"),
        idempotency_key: row.get("idempotency_key"),
        coupon_code: row.get("coupon_code"),
        created_at,
    })
}

const ORDER_COLUMNS: &str = r#"
    order_uid, user_id, address_id, address_kind, address_name, street, city,
    state, pincode, phone, payment_method, subtotal, shipping, discount, total,
    status, payment_reference, idempotency_key, coupon_code, created_at
"#;

#[async_trait]
impl OrdersRepository for PgOrdersRepository {
    async fn get_by_id(&self, user_id: &str, order_uid: &str) -> Result<Order, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 AND order_uid = $2"
        );
        let row = client.query_opt(&query, &[&user_id, &order_uid]).await?;
        match row {
            Some(row) => {
                let mut order = order_from_row(&row)?;
                order.items = self.load_items(&client, order_uid).await?;
                Ok(order)
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn find_by_payment_reference(
        &self,
        payment_id: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE payment_reference = $1");
        let row = client.query_opt(&query, &[&payment_id]).await?;
        match row {
            Some(row) => {
                let mut order = order_from_row(&row)?;
                let uid = order.order_uid.clone();
                order.items = self.load_items(&client, &uid).await?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE idempotency_key = $1");
        let row = client.query_opt(&query, &[&key]).await?;
        match row {
            Some(row) => {
                let mut order = order_from_row(&row)?;
                let uid = order.order_uid.clone();
                order.items = self.load_items(&client, &uid).await?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    async fn insert_finalized(
        &self,
        order: &Order,
        consume_coupon: Option<&str>,
        clear_cart_for: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let query = r#"
            INSERT INTO orders (
                order_uid, user_id, address_id, address_kind, address_name,
                street, city, state, pincode, phone, payment_method,
                subtotal, shipping, discount, total, status,
                payment_reference, idempotency_key, coupon_code, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)
        "#;
        tx.execute(
            query,
            &[
                &order.order_uid,
                &order.user_id,
                &order.address.id,
                &address_kind_str(order.address.kind),
                &order.address.name,
                &order.address.street,
                &order.address.city,
                &order.address.state,
                &order.address.pincode,
                &order.address.phone,
                &payment_method_str(order.payment_method),
                &order.totals.subtotal,
                &order.totals.shipping,
                &order.totals.discount,
                &order.totals.total,
                &order_status_str(order.status),
                &order.payment_reference,
                &order.idempotency_key,
                &order.coupon_code,
                &order.created_at,
            ],
        )
        .await?;

        let items_query = r#"
            INSERT INTO order_items (order_uid, product_id, variant_sku, unit_price, quantity)
            VALUES ($1, $2, $3, $4, $5)
        "#;
        for item in &order.items {
            tx.execute(
                items_query,
                &[
                    &order.order_uid,
                    &item.product_id,
                    &item.variant_sku,
                    &item.unit_price,
                    &item.quantity,
                ],
            )
            .await?;
        }

        if let Some(code) = consume_coupon {
            tx.execute(
                "UPDATE coupons SET usage_count = usage_count + 1 WHERE code = $1",
                &[&code],
            )
            .await?;
        }

        if let Some(user_id) = clear_cart_for {
            tx.execute("DELETE FROM cart_lines WHERE user_id = $1", &[&user_id])
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
