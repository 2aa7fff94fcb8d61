use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::response::{ApiResponse, Meta};

/// Reasons a coupon can be refused by the cart flow. Each maps to its own
/// user-facing message; the check order lives in `Coupon::validate`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CouponError {
    #[error("Coupon not found")]
    NotFound,

    #[error("Coupon has expired")]
    Expired,

    #[error("Coupon already used by this user")]
    AlreadyUsed,

    #[error("Coupon usage limit reached")]
    UsageLimitReached,

    #[error("Minimum purchase of {0} required")]
    MinPurchase(i64),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not Found")]
    NotFound,

    #[error("Bad Request {0}")]
    BadRequest(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Quantity must be a positive integer")]
    InvalidQuantity,

    #[error("Invalid product price")]
    InvalidProduct,

    #[error("{0}")]
    InvalidVariant(String),

    #[error("Product not found")]
    ProductNotFound,

    #[error("Cart not found")]
    CartNotFound,

    #[error("Item not found in cart")]
    ItemNotFound,

    #[error(
        "Insufficient stock{}: {available} available",
        .variant.as_deref().map(|v| format!(" for {v}")).unwrap_or_default()
    )]
    InsufficientStock {
        available: i64,
        variant: Option<String>,
    },

    #[error(transparent)]
    CouponInvalid(#[from] CouponError),

    #[error("Database error")]
    DbError(#[from] sqlx::Error),

    #[error("ORM error")]
    OrmError(#[from] sea_orm::DbErr),

    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorData {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound
            | AppError::ProductNotFound
            | AppError::CartNotFound
            | AppError::ItemNotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_)
            | AppError::InvalidQuantity
            | AppError::InvalidProduct
            | AppError::InvalidVariant(_)
            | AppError::InsufficientStock { .. }
            | AppError::CouponInvalid(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::DbError(_) | AppError::OrmError(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ApiResponse {
            message: self.to_string(),
            data: Some(ErrorData {
                error: self.to_string(),
            }),
            meta: Some(Meta::empty()),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
