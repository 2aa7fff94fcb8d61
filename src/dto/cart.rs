use serde::Deserialize;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddToCartRequest {
    pub quantity: i32,
    pub size: Option<String>,
    pub color: Option<String>,
}

/// `quantity <= 0` means "remove the line".
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateCartItemRequest {
    pub quantity: i32,
    pub size: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RemoveCartItemParams {
    pub size: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ApplyCouponRequest {
    pub coupon_code: String,
}
