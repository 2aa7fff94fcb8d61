use axum::{Json, Router, extract::State, routing::post};

use crate::{
    dto::coupons::GenerateCouponRequest,
    error::AppResult,
    middleware::auth::AuthUser,
    models::Coupon,
    response::ApiResponse,
    services::coupon_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(generate_coupon))
}

#[utoipa::path(
    post,
    path = "/api/coupons",
    request_body = GenerateCouponRequest,
    responses(
        (status = 201, description = "Coupon with a random unique code (admin only)", body = ApiResponse<Coupon>),
        (status = 403, description = "Forbidden"),
    ),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn generate_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<GenerateCouponRequest>,
) -> AppResult<Json<ApiResponse<Coupon>>> {
    let resp = coupon_service::generate_coupon(&state, &user, payload).await?;
    Ok(Json(resp))
}
