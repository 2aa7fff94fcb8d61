//! Cart use cases. Every operation follows the same shape: validate, adjust
//! inventory, adjust the cart lines, recompute totals, persist. The
//! inventory write commits in its own transaction *before* the cart write,
//! so a crash in between strands reserved units instead of over-selling;
//! there is deliberately no compensation step spanning the two stores.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use crate::{
    audit,
    db::DbPool,
    dto::cart::{AddToCartRequest, ApplyCouponRequest, RemoveCartItemParams, UpdateCartItemRequest},
    error::{AppError, AppResult},
    inventory,
    middleware::auth::AuthUser,
    models::{AppliedCoupon, Cart, CartItem, CartStatus},
    response::ApiResponse,
    services::coupon_service,
    state::AppState,
};

#[derive(FromRow)]
struct CartRow {
    id: Uuid,
    user_id: Uuid,
    items: Json<Vec<CartItem>>,
    total_amount: i64,
    total_items: i32,
    status: String,
    applied_coupon: Option<Json<AppliedCoupon>>,
    last_updated: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl CartRow {
    fn into_cart(self) -> Cart {
        Cart {
            id: self.id,
            user_id: self.user_id,
            items: self.items.0,
            total_amount: self.total_amount,
            total_items: self.total_items,
            status: CartStatus::parse(&self.status).unwrap_or(CartStatus::Active),
            applied_coupon: self.applied_coupon.map(|c| c.0),
            last_updated: self.last_updated,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct ProductRow {
    price: i64,
    size_options: Json<Vec<String>>,
    color_options: Json<Vec<String>>,
}

async fn find_product(pool: &DbPool, product_id: Uuid) -> AppResult<ProductRow> {
    let row: Option<ProductRow> = sqlx::query_as(
        "SELECT price, size_options, color_options FROM products WHERE id = $1",
    )
    .bind(product_id)
    .fetch_optional(pool)
    .await?;
    row.ok_or(AppError::ProductNotFound)
}

fn validate_options(
    product: &ProductRow,
    size: Option<&str>,
    color: Option<&str>,
) -> AppResult<()> {
    if let Some(size) = size {
        if !product.size_options.0.iter().any(|s| s == size) {
            return Err(AppError::InvalidVariant(format!("Invalid size: {size}")));
        }
    }
    if let Some(color) = color {
        if !product.color_options.0.iter().any(|c| c == color) {
            return Err(AppError::InvalidVariant(format!("Invalid color: {color}")));
        }
    }
    Ok(())
}

/// Fetch the user's active cart, optionally locking the row for the rest of
/// the surrounding transaction.
pub(crate) async fn fetch_active_cart<'e, E>(
    executor: E,
    user_id: Uuid,
    lock: bool,
) -> AppResult<Option<Cart>>
where
    E: sqlx::PgExecutor<'e>,
{
    let sql = if lock {
        "SELECT * FROM carts WHERE user_id = $1 AND status = 'active' FOR UPDATE"
    } else {
        "SELECT * FROM carts WHERE user_id = $1 AND status = 'active'"
    };
    let row: Option<CartRow> = sqlx::query_as(sql)
        .bind(user_id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(CartRow::into_cart))
}

async fn load_active_cart(pool: &DbPool, user_id: Uuid) -> AppResult<Cart> {
    fetch_active_cart(pool, user_id, false)
        .await?
        .ok_or(AppError::CartNotFound)
}

/// Explicit get-or-create: the partial unique index on (user_id) WHERE
/// status = 'active' keeps concurrent first-touch requests from creating
/// two active carts; the loser of that race re-reads the winner's row.
pub async fn load_or_create_active_cart(pool: &DbPool, user_id: Uuid) -> AppResult<Cart> {
    if let Some(cart) = fetch_active_cart(pool, user_id, false).await? {
        return Ok(cart);
    }

    let row: Option<CartRow> = sqlx::query_as(
        r#"
        INSERT INTO carts (id, user_id)
        VALUES ($1, $2)
        ON CONFLICT (user_id) WHERE status = 'active' DO NOTHING
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(row.into_cart()),
        None => fetch_active_cart(pool, user_id, false)
            .await?
            .ok_or(AppError::CartNotFound),
    }
}

/// Persist the cart document whole; no partial-field updates.
async fn save_cart(pool: &DbPool, cart: &Cart) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE carts
        SET items = $2, total_amount = $3, total_items = $4,
            applied_coupon = $5, status = $6, last_updated = $7
        WHERE id = $1
        "#,
    )
    .bind(cart.id)
    .bind(Json(&cart.items))
    .bind(cart.total_amount)
    .bind(cart.total_items)
    .bind(cart.applied_coupon.as_ref().map(Json))
    .bind(cart.status.as_str())
    .bind(cart.last_updated)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_cart(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<Cart>> {
    let cart = load_or_create_active_cart(&state.pool, user.user_id).await?;
    let message = if cart.items.is_empty() {
        "There are no items in your cart"
    } else {
        "OK"
    };
    Ok(ApiResponse::success(message, cart, None))
}

pub async fn add_to_cart(
    state: &AppState,
    user: &AuthUser,
    product_id: Uuid,
    payload: AddToCartRequest,
) -> AppResult<ApiResponse<Cart>> {
    if payload.quantity < 1 {
        return Err(AppError::InvalidQuantity);
    }

    let product = find_product(&state.pool, product_id).await?;
    if product.price <= 0 {
        return Err(AppError::InvalidProduct);
    }
    validate_options(&product, payload.size.as_deref(), payload.color.as_deref())?;

    let key = inventory::variant_key(payload.size.as_deref(), payload.color.as_deref());
    inventory::reserve(
        &state.pool,
        product_id,
        key.as_deref(),
        i64::from(payload.quantity),
    )
    .await?;

    let mut cart = load_or_create_active_cart(&state.pool, user.user_id).await?;
    cart.upsert_item(
        product_id,
        payload.quantity,
        payload.size.clone(),
        payload.color.clone(),
        product.price,
    );
    cart.recompute_totals();
    save_cart(&state.pool, &cart).await?;

    audit::record(
        &state.pool,
        Some(user.user_id),
        "cart_add",
        Some("carts"),
        Some(serde_json::json!({
            "product_id": product_id,
            "quantity": payload.quantity,
            "size": payload.size,
            "color": payload.color,
        })),
    )
    .await;

    Ok(ApiResponse::success("OK", cart, None))
}

pub async fn update_cart_item(
    state: &AppState,
    user: &AuthUser,
    product_id: Uuid,
    payload: UpdateCartItemRequest,
) -> AppResult<ApiResponse<Cart>> {
    let mut cart = load_active_cart(&state.pool, user.user_id).await?;
    let idx = cart
        .position_of(product_id, payload.size.as_deref(), payload.color.as_deref())
        .ok_or(AppError::ItemNotFound)?;

    if payload.quantity <= 0 {
        // non-positive quantity means "remove": give the full reservation back
        let item = cart.items[idx].clone();
        let key = inventory::variant_key(item.size.as_deref(), item.color.as_deref());
        inventory::release(
            &state.pool,
            product_id,
            key.as_deref(),
            i64::from(item.quantity),
        )
        .await?;
        cart.items.remove(idx);
    } else {
        let product = find_product(&state.pool, product_id).await?;
        validate_options(&product, payload.size.as_deref(), payload.color.as_deref())?;

        let key = inventory::variant_key(payload.size.as_deref(), payload.color.as_deref());
        let old_quantity = cart.items[idx].quantity;
        let delta = i64::from(payload.quantity) - i64::from(old_quantity);
        if delta > 0 {
            // a failed delta reservation leaves the existing line untouched
            inventory::reserve(&state.pool, product_id, key.as_deref(), delta).await?;
        } else if delta < 0 {
            inventory::release(&state.pool, product_id, key.as_deref(), -delta).await?;
        }

        let item = &mut cart.items[idx];
        item.quantity = payload.quantity;
        item.sub_total = i64::from(payload.quantity) * product.price;
    }

    cart.recompute_totals();
    save_cart(&state.pool, &cart).await?;

    audit::record(
        &state.pool,
        Some(user.user_id),
        "cart_update",
        Some("carts"),
        Some(serde_json::json!({
            "product_id": product_id,
            "quantity": payload.quantity,
        })),
    )
    .await;

    Ok(ApiResponse::success("OK", cart, None))
}

pub async fn remove_from_cart(
    state: &AppState,
    user: &AuthUser,
    product_id: Uuid,
    params: RemoveCartItemParams,
) -> AppResult<ApiResponse<Cart>> {
    let mut cart = load_active_cart(&state.pool, user.user_id).await?;
    let idx = cart
        .position_of(product_id, params.size.as_deref(), params.color.as_deref())
        .ok_or(AppError::ItemNotFound)?;

    let item = cart.items[idx].clone();
    let key = inventory::variant_key(item.size.as_deref(), item.color.as_deref());
    inventory::release(
        &state.pool,
        product_id,
        key.as_deref(),
        i64::from(item.quantity),
    )
    .await?;

    cart.items.remove(idx);
    cart.recompute_totals();
    save_cart(&state.pool, &cart).await?;

    audit::record(
        &state.pool,
        Some(user.user_id),
        "cart_remove",
        Some("carts"),
        Some(serde_json::json!({ "product_id": product_id })),
    )
    .await;

    Ok(ApiResponse::success("OK", cart, None))
}

pub async fn clear_cart(
    state: &AppState,
    user: &AuthUser,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let mut cart = load_active_cart(&state.pool, user.user_id).await?;

    for item in &cart.items {
        let key = inventory::variant_key(item.size.as_deref(), item.color.as_deref());
        match inventory::release(
            &state.pool,
            item.product_id,
            key.as_deref(),
            i64::from(item.quantity),
        )
        .await
        {
            Ok(()) => {}
            // the product was deleted since the line was added; nothing to restore
            Err(AppError::ProductNotFound) => {}
            Err(err) => return Err(err),
        }
    }

    cart.items.clear();
    cart.total_amount = 0;
    cart.total_items = 0;
    cart.applied_coupon = None;
    cart.last_updated = Utc::now();
    save_cart(&state.pool, &cart).await?;

    audit::record(
        &state.pool,
        Some(user.user_id),
        "cart_clear",
        Some("carts"),
        None,
    )
    .await;

    Ok(ApiResponse::message("Cart cleared successfully"))
}

pub async fn apply_coupon(
    state: &AppState,
    user: &AuthUser,
    payload: ApplyCouponRequest,
) -> AppResult<ApiResponse<Cart>> {
    let mut cart = load_active_cart(&state.pool, user.user_id).await?;

    let discount = coupon_service::validate_for_cart(
        &state.pool,
        &payload.coupon_code,
        user.user_id,
        cart.total_amount,
    )
    .await?;

    cart.applied_coupon = Some(AppliedCoupon {
        code: payload.coupon_code.to_uppercase(),
        discount,
    });
    cart.recompute_totals();
    save_cart(&state.pool, &cart).await?;

    audit::record(
        &state.pool,
        Some(user.user_id),
        "coupon_apply",
        Some("carts"),
        Some(serde_json::json!({ "code": payload.coupon_code })),
    )
    .await;

    Ok(ApiResponse::success("OK", cart, None))
}

pub async fn remove_coupon(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<Cart>> {
    let mut cart = load_active_cart(&state.pool, user.user_id).await?;
    cart.applied_coupon = None;
    cart.recompute_totals();
    save_cart(&state.pool, &cart).await?;

    audit::record(
        &state.pool,
        Some(user.user_id),
        "coupon_remove",
        Some("carts"),
        None,
    )
    .await;

    Ok(ApiResponse::success("OK", cart, None))
}
