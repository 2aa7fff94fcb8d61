use serde::Deserialize;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct GenerateCouponRequest {
    /// Days until expiry, default 30.
    pub valid_days: Option<i64>,
    /// `None` leaves the coupon unbounded.
    pub max_uses: Option<i32>,
    pub min_purchase: Option<i64>,
}
