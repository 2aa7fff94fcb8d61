use chrono::{Duration, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::{
    audit,
    db::DbPool,
    dto::coupons::GenerateCouponRequest,
    error::{AppError, AppResult, CouponError},
    middleware::auth::{AuthUser, ensure_admin},
    models::Coupon,
    response::ApiResponse,
    state::AppState,
};

const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

fn random_code(min_len: usize, max_len: usize) -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(min_len..=max_len);
    (0..len)
        .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
        .collect()
}

fn random_discount() -> i64 {
    // 5..=50 whole currency units
    i64::from(rand::thread_rng().gen_range(5..=50u32)) * 100
}

pub async fn find_by_code(pool: &DbPool, code: &str) -> AppResult<Option<Coupon>> {
    let coupon: Option<Coupon> = sqlx::query_as("SELECT * FROM coupons WHERE code = $1")
        .bind(code.to_uppercase())
        .fetch_optional(pool)
        .await?;
    Ok(coupon)
}

/// Lookup plus the cart-flow applicability rules; yields the flat discount
/// amount. `used_by` is left alone here.
pub async fn validate_for_cart(
    pool: &DbPool,
    code: &str,
    user_id: Uuid,
    cart_total: i64,
) -> AppResult<i64> {
    let coupon = find_by_code(pool, code)
        .await?
        .ok_or(AppError::CouponInvalid(CouponError::NotFound))?;
    let discount = coupon.validate(user_id, cart_total, Utc::now())?;
    Ok(discount)
}

/// Admin-only: mint a coupon with a random unique code and a random
/// discount magnitude.
pub async fn generate_coupon(
    state: &AppState,
    user: &AuthUser,
    payload: GenerateCouponRequest,
) -> AppResult<ApiResponse<Coupon>> {
    ensure_admin(user)?;

    let valid_days = payload.valid_days.unwrap_or(30);
    if valid_days <= 0 {
        return Err(AppError::BadRequest("valid_days must be positive".into()));
    }
    if payload.max_uses.is_some_and(|m| m < 1) {
        return Err(AppError::BadRequest("max_uses must be at least 1".into()));
    }
    let min_purchase = payload.min_purchase.unwrap_or(0);
    if min_purchase < 0 {
        return Err(AppError::BadRequest("min_purchase cannot be negative".into()));
    }

    let code = loop {
        let candidate = random_code(5, 10);
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM coupons WHERE code = $1")
            .bind(&candidate)
            .fetch_optional(&state.pool)
            .await?;
        if exists.is_none() {
            break candidate;
        }
    };

    let valid_until = Utc::now() + Duration::days(valid_days);
    let coupon: Coupon = sqlx::query_as(
        r#"
        INSERT INTO coupons (id, code, discount, valid_until, max_uses, min_purchase)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&code)
    .bind(random_discount())
    .bind(valid_until)
    .bind(payload.max_uses)
    .bind(min_purchase)
    .fetch_one(&state.pool)
    .await?;

    audit::record(
        &state.pool,
        Some(user.user_id),
        "coupon_generate",
        Some("coupons"),
        Some(serde_json::json!({ "code": coupon.code })),
    )
    .await;

    Ok(ApiResponse::success(
        "Coupon generated successfully",
        coupon,
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_code_stays_in_charset_and_bounds() {
        for _ in 0..50 {
            let code = random_code(5, 10);
            assert!(code.len() >= 5 && code.len() <= 10);
            assert!(code.bytes().all(|b| CODE_CHARSET.contains(&b)));
        }
    }

    #[test]
    fn random_discount_is_whole_units_in_range() {
        for _ in 0..50 {
            let discount = random_discount();
            assert!(discount >= 500 && discount <= 5000);
            assert_eq!(discount % 100, 0);
        }
    }
}
