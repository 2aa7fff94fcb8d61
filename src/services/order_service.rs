use chrono::Utc;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::{
    audit,
    dto::orders::{CheckoutRequest, OrderList, OrderWithItems, PayOrderRequest},
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{CartStatus, Coupon, Order, OrderItem},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    services::cart_service,
    state::AppState,
};

const VALID_PAYMENT_METHODS: [&str; 3] = ["stripe", "paypal", "cash_on_delivery"];
const TAX_RATE_PERCENT: i64 = 7;
const FLAT_SHIPPING_COST: i64 = 599;

/// Convert the caller's active cart into an order. Stock was already taken
/// out of the ledger while the lines sat in the cart, so checkout only
/// prices the order and flips the cart out of the active state.
pub async fn checkout(
    state: &AppState,
    user: &AuthUser,
    payload: CheckoutRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    if !VALID_PAYMENT_METHODS.contains(&payload.payment_method.as_str()) {
        return Err(AppError::BadRequest("Invalid payment method".into()));
    }

    let mut txn = state.pool.begin().await?;

    let mut cart = cart_service::fetch_active_cart(&mut *txn, user.user_id, true)
        .await?
        .ok_or(AppError::CartNotFound)?;
    if cart.items.is_empty() {
        return Err(AppError::BadRequest("Cart is empty".into()));
    }

    let subtotal = cart.total_amount;
    let discount_amount = match payload.coupon_code.as_deref() {
        Some(code) => redeem_percent_coupon(&mut txn, code, user.user_id, subtotal).await?,
        None => 0,
    };
    let tax_amount = subtotal * TAX_RATE_PERCENT / 100;
    let total_amount = (subtotal - discount_amount).max(0) + tax_amount + FLAT_SHIPPING_COST;

    let order_id = Uuid::new_v4();
    let invoice_number = build_invoice_number(order_id);

    let order: Order = sqlx::query_as(
        r#"
        INSERT INTO orders (id, user_id, total_amount, discount_amount, tax_amount,
                            shipping_cost, coupon_code, status, payment_status,
                            invoice_number, shipping_address, payment_method,
                            delivery_instructions)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 'unpaid', $8, $9, $10, $11)
        RETURNING *
        "#,
    )
    .bind(order_id)
    .bind(user.user_id)
    .bind(total_amount)
    .bind(discount_amount)
    .bind(tax_amount)
    .bind(FLAT_SHIPPING_COST)
    .bind(payload.coupon_code.as_ref().map(|c| c.to_uppercase()))
    .bind(&invoice_number)
    .bind(&payload.address)
    .bind(&payload.payment_method)
    .bind(payload.delivery_instructions.as_deref())
    .fetch_one(&mut *txn)
    .await?;

    let mut items = Vec::with_capacity(cart.items.len());
    for line in &cart.items {
        let item: OrderItem = sqlx::query_as(
            r#"
            INSERT INTO order_items (id, order_id, product_id, quantity, size, color, price)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order.id)
        .bind(line.product_id)
        .bind(line.quantity)
        .bind(line.size.as_deref())
        .bind(line.color.as_deref())
        .bind(line.price)
        .fetch_one(&mut *txn)
        .await?;
        items.push(item);
    }

    cart.status = CartStatus::Converted;
    sqlx::query("UPDATE carts SET status = $2, last_updated = $3 WHERE id = $1")
        .bind(cart.id)
        .bind(cart.status.as_str())
        .bind(Utc::now())
        .execute(&mut *txn)
        .await?;

    txn.commit().await?;

    audit::record(
        &state.pool,
        Some(user.user_id),
        "checkout",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id })),
    )
    .await;

    Ok(ApiResponse::success(
        "Checkout success",
        OrderWithItems { order, items },
        Some(Meta::empty()),
    ))
}

/// Order-level coupon redemption. Unlike the cart flow, the stored discount
/// is read as a percentage of the subtotal, and an unusable code silently
/// yields no discount instead of failing the checkout. Redemption is
/// recorded here, the flow that finalizes the order.
async fn redeem_percent_coupon(
    txn: &mut Transaction<'_, Postgres>,
    code: &str,
    user_id: Uuid,
    subtotal: i64,
) -> AppResult<i64> {
    let coupon: Option<Coupon> = sqlx::query_as("SELECT * FROM coupons WHERE code = $1 FOR UPDATE")
        .bind(code.to_uppercase())
        .fetch_optional(&mut **txn)
        .await?;
    let Some(coupon) = coupon else {
        return Ok(0);
    };
    if coupon.valid_until < Utc::now() {
        return Ok(0);
    }
    if let Some(max_uses) = coupon.max_uses {
        if coupon.used_by.len() as i32 >= max_uses {
            return Ok(0);
        }
    }

    sqlx::query("UPDATE coupons SET used_by = array_append(used_by, $2) WHERE id = $1")
        .bind(coupon.id)
        .bind(user_id)
        .execute(&mut **txn)
        .await?;

    // the stored magnitude is whole units x100; read it as a percentage
    Ok(subtotal * coupon.discount / 10_000)
}

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let status = query.status.clone().filter(|s| !s.is_empty());

    let order_by = match query.sort_order.unwrap_or(SortOrder::Desc) {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    let sql = format!(
        "SELECT * FROM orders \
         WHERE user_id = $1 AND ($2::text IS NULL OR status = $2) \
         ORDER BY created_at {order_by} LIMIT $3 OFFSET $4"
    );
    let orders: Vec<Order> = sqlx::query_as(&sql)
        .bind(user.user_id)
        .bind(status.as_deref())
        .bind(limit)
        .bind(offset)
        .fetch_all(&state.pool)
        .await?;

    let total: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM orders WHERE user_id = $1 AND ($2::text IS NULL OR status = $2)",
    )
    .bind(user.user_id)
    .bind(status.as_deref())
    .fetch_one(&state.pool)
    .await?;

    let meta = Meta::new(page, limit, total.0);
    Ok(ApiResponse::success(
        "Ok",
        OrderList { items: orders },
        Some(meta),
    ))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order: Option<Order> =
        sqlx::query_as("SELECT * FROM orders WHERE user_id = $1 AND id = $2")
            .bind(user.user_id)
            .bind(id)
            .fetch_optional(&state.pool)
            .await?;
    let order = order.ok_or(AppError::NotFound)?;

    let items: Vec<OrderItem> =
        sqlx::query_as("SELECT * FROM order_items WHERE order_id = $1 ORDER BY created_at")
            .bind(order.id)
            .fetch_all(&state.pool)
            .await?;

    Ok(ApiResponse::success(
        "OK",
        OrderWithItems { order, items },
        Some(Meta::empty()),
    ))
}

pub async fn pay_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    _payload: PayOrderRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let mut txn = state.pool.begin().await?;

    let order: Option<Order> =
        sqlx::query_as("SELECT * FROM orders WHERE user_id = $1 AND id = $2 FOR UPDATE")
            .bind(user.user_id)
            .bind(id)
            .fetch_optional(&mut *txn)
            .await?;
    let order = order.ok_or(AppError::NotFound)?;

    if order.payment_status == "paid" {
        return Err(AppError::BadRequest("Order already paid".into()));
    }

    let order: Order = sqlx::query_as(
        r#"
        UPDATE orders
        SET payment_status = 'paid', status = 'paid', paid_at = $2, updated_at = $2
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(order.id)
    .bind(Utc::now())
    .fetch_one(&mut *txn)
    .await?;

    let items: Vec<OrderItem> =
        sqlx::query_as("SELECT * FROM order_items WHERE order_id = $1 ORDER BY created_at")
            .bind(order.id)
            .fetch_all(&mut *txn)
            .await?;

    txn.commit().await?;

    audit::record(
        &state.pool,
        Some(user.user_id),
        "order_paid",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id })),
    )
    .await;

    Ok(ApiResponse::success(
        "Payment recorded",
        OrderWithItems { order, items },
        Some(Meta::empty()),
    ))
}

fn build_invoice_number(order_id: Uuid) -> String {
    let date = Utc::now().format("%Y%m%d");
    let suffix = order_id.to_string();
    let short = &suffix[..8];
    format!("INV-{}-{}", date, short)
}
