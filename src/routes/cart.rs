use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{delete, get, post, put},
};
use uuid::Uuid;

use crate::{
    dto::cart::{AddToCartRequest, ApplyCouponRequest, RemoveCartItemParams, UpdateCartItemRequest},
    error::AppResult,
    middleware::auth::AuthUser,
    models::Cart,
    response::ApiResponse,
    services::cart_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart))
        .route("/add/{id}", post(add_to_cart))
        .route("/update/{id}", put(update_cart_item))
        .route("/remove/{id}", delete(remove_from_cart))
        .route("/clear", delete(clear_cart))
        .route("/coupon", post(apply_coupon).delete(remove_coupon))
}

#[utoipa::path(
    get,
    path = "/api/cart",
    responses(
        (status = 200, description = "Current user's active cart, created on first access", body = ApiResponse<Cart>)
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<ApiResponse<Cart>>> {
    let resp = cart_service::get_cart(&state, &user).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/api/cart/add/{id}",
    params(
        ("id" = Uuid, Path, description = "Product ID")
    ),
    request_body = AddToCartRequest,
    responses(
        (status = 200, description = "Item added, stock reserved", body = ApiResponse<Cart>),
        (status = 400, description = "Invalid quantity/variant or insufficient stock"),
        (status = 404, description = "Product not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn add_to_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<AddToCartRequest>,
) -> AppResult<Json<ApiResponse<Cart>>> {
    let resp = cart_service::add_to_cart(&state, &user, id, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    put,
    path = "/api/cart/update/{id}",
    params(
        ("id" = Uuid, Path, description = "Product ID")
    ),
    request_body = UpdateCartItemRequest,
    responses(
        (status = 200, description = "Line quantity updated; a non-positive quantity removes the line", body = ApiResponse<Cart>),
        (status = 400, description = "Insufficient stock for the increase"),
        (status = 404, description = "Cart or item not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn update_cart_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateCartItemRequest>,
) -> AppResult<Json<ApiResponse<Cart>>> {
    let resp = cart_service::update_cart_item(&state, &user, id, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    delete,
    path = "/api/cart/remove/{id}",
    params(
        ("id" = Uuid, Path, description = "Product ID"),
        ("size" = Option<String>, Query, description = "Variant size"),
        ("color" = Option<String>, Query, description = "Variant color"),
    ),
    responses(
        (status = 200, description = "Line removed, stock released", body = ApiResponse<Cart>),
        (status = 404, description = "Cart or item not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn remove_from_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Query(params): Query<RemoveCartItemParams>,
) -> AppResult<Json<ApiResponse<Cart>>> {
    let resp = cart_service::remove_from_cart(&state, &user, id, params).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    delete,
    path = "/api/cart/clear",
    responses(
        (status = 200, description = "Every line released back to stock, coupon dropped", body = ApiResponse<serde_json::Value>),
        (status = 404, description = "Cart not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn clear_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<ApiResponse<serde_json::Value>>> {
    let resp = cart_service::clear_cart(&state, &user).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/api/cart/coupon",
    request_body = ApplyCouponRequest,
    responses(
        (status = 200, description = "Flat discount applied to the cart total", body = ApiResponse<Cart>),
        (status = 400, description = "Coupon not found / expired / used / limit reached / minimum unmet"),
        (status = 404, description = "Cart not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn apply_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ApplyCouponRequest>,
) -> AppResult<Json<ApiResponse<Cart>>> {
    let resp = cart_service::apply_coupon(&state, &user, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    delete,
    path = "/api/cart/coupon",
    responses(
        (status = 200, description = "Coupon removed, totals restored", body = ApiResponse<Cart>),
        (status = 404, description = "Cart not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn remove_coupon(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<ApiResponse<Cart>>> {
    let resp = cart_service::remove_coupon(&state, &user).await?;
    Ok(Json(resp))
}
