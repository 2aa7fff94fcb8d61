//! Variant-aware inventory ledger.
//!
//! A product's stock is either a single scalar count or a map keyed by
//! `"<size>-<color>"`. [`StockLevel`] owns that dispatch, so callers never
//! branch on the representation. The database-side operations each run in
//! their own short transaction holding a row lock on the product, and the
//! updated stock document is committed before the caller touches any cart
//! state. A crash after `reserve` therefore under-counts available stock
//! rather than over-selling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    db::DbPool,
    error::{AppError, AppResult},
};

/// Stock representation, fixed at product creation time: scalar when the
/// product has no size/color options, per-variant otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum StockLevel {
    Scalar(i64),
    PerVariant(BTreeMap<String, i64>),
}

impl StockLevel {
    /// Units currently available for the given variant key. Scalar products
    /// ignore the key; per-variant products report 0 for an absent key.
    pub fn available(&self, variant: Option<&str>) -> i64 {
        match self {
            StockLevel::Scalar(count) => *count,
            StockLevel::PerVariant(map) => {
                variant.and_then(|key| map.get(key)).copied().unwrap_or(0)
            }
        }
    }

    /// Decrement by `amount`. Fails with the available count when short,
    /// leaving the stock untouched, so the stored value can never go
    /// negative.
    pub fn reserve(&mut self, variant: Option<&str>, amount: i64) -> Result<(), i64> {
        let available = self.available(variant);
        if available < amount {
            return Err(available);
        }
        self.adjust(variant, -amount);
        Ok(())
    }

    /// Increment by `amount`, rolling back a previous reservation.
    pub fn release(&mut self, variant: Option<&str>, amount: i64) {
        self.adjust(variant, amount);
    }

    /// Units across every variant, or the scalar count.
    pub fn total(&self) -> i64 {
        match self {
            StockLevel::Scalar(count) => *count,
            StockLevel::PerVariant(map) => map.values().sum(),
        }
    }

    fn adjust(&mut self, variant: Option<&str>, delta: i64) {
        match self {
            StockLevel::Scalar(count) => *count += delta,
            StockLevel::PerVariant(map) => {
                let key = variant.unwrap_or("").to_string();
                *map.entry(key).or_insert(0) += delta;
            }
        }
    }
}

/// Composite key addressing one (size, color) cell of a per-variant
/// product. `None` when the line has neither a size nor a color.
pub fn variant_key(size: Option<&str>, color: Option<&str>) -> Option<String> {
    if size.is_none() && color.is_none() {
        return None;
    }
    Some(format!("{}-{}", size.unwrap_or(""), color.unwrap_or("")))
}

pub async fn get_available(
    pool: &DbPool,
    product_id: Uuid,
    variant: Option<&str>,
) -> AppResult<i64> {
    let row: Option<(Json<StockLevel>,)> =
        sqlx::query_as("SELECT stock FROM products WHERE id = $1")
            .bind(product_id)
            .fetch_optional(pool)
            .await?;
    let Json(stock) = row.ok_or(AppError::ProductNotFound)?.0;
    Ok(stock.available(variant))
}

/// Atomically take `amount` units out of the product's stock. The row lock
/// serializes concurrent reservations against the same product; the
/// decremented document is committed before this returns.
pub async fn reserve(
    pool: &DbPool,
    product_id: Uuid,
    variant: Option<&str>,
    amount: i64,
) -> AppResult<()> {
    let mut txn = pool.begin().await?;
    let row: Option<(Json<StockLevel>,)> =
        sqlx::query_as("SELECT stock FROM products WHERE id = $1 FOR UPDATE")
            .bind(product_id)
            .fetch_optional(&mut *txn)
            .await?;
    let Json(mut stock) = row.ok_or(AppError::ProductNotFound)?.0;

    stock
        .reserve(variant, amount)
        .map_err(|available| AppError::InsufficientStock {
            available,
            variant: variant.map(str::to_string),
        })?;

    sqlx::query("UPDATE products SET stock = $2 WHERE id = $1")
        .bind(product_id)
        .bind(Json(stock))
        .execute(&mut *txn)
        .await?;
    txn.commit().await?;
    Ok(())
}

/// Return `amount` units to the product's stock (item removed, quantity
/// reduced, or cart cleared).
pub async fn release(
    pool: &DbPool,
    product_id: Uuid,
    variant: Option<&str>,
    amount: i64,
) -> AppResult<()> {
    let mut txn = pool.begin().await?;
    let row: Option<(Json<StockLevel>,)> =
        sqlx::query_as("SELECT stock FROM products WHERE id = $1 FOR UPDATE")
            .bind(product_id)
            .fetch_optional(&mut *txn)
            .await?;
    let Json(mut stock) = row.ok_or(AppError::ProductNotFound)?.0;

    stock.release(variant, amount);

    sqlx::query("UPDATE products SET stock = $2 WHERE id = $1")
        .bind(product_id)
        .bind(Json(stock))
        .execute(&mut *txn)
        .await?;
    txn.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_variant(cells: &[(&str, i64)]) -> StockLevel {
        StockLevel::PerVariant(
            cells
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        )
    }

    #[test]
    fn scalar_reserve_and_release_round_trip() {
        let mut stock = StockLevel::Scalar(10);
        assert!(stock.reserve(None, 4).is_ok());
        assert_eq!(stock.available(None), 6);
        stock.release(None, 4);
        assert_eq!(stock.available(None), 10);
    }

    #[test]
    fn scalar_reserve_fails_when_short() {
        let mut stock = StockLevel::Scalar(3);
        let err = stock.reserve(None, 5).unwrap_err();
        assert_eq!(err, 3);
        // stock untouched, never negative
        assert_eq!(stock.available(None), 3);
    }

    #[test]
    fn scalar_reserve_exact_amount_hits_zero() {
        let mut stock = StockLevel::Scalar(5);
        assert!(stock.reserve(None, 5).is_ok());
        assert_eq!(stock.available(None), 0);
        assert_eq!(stock.reserve(None, 1).unwrap_err(), 0);
    }

    #[test]
    fn variant_reserve_and_release_round_trip() {
        let mut stock = per_variant(&[("M-red", 5), ("L-blue", 2)]);
        assert!(stock.reserve(Some("M-red"), 2).is_ok());
        assert_eq!(stock.available(Some("M-red")), 3);
        assert_eq!(stock.available(Some("L-blue")), 2);
        stock.release(Some("M-red"), 2);
        assert_eq!(stock.available(Some("M-red")), 5);
    }

    #[test]
    fn variant_absent_key_has_zero_available() {
        let mut stock = per_variant(&[("M-red", 5)]);
        assert_eq!(stock.available(Some("XL-green")), 0);
        assert_eq!(stock.reserve(Some("XL-green"), 1).unwrap_err(), 0);
        // addressing a per-variant product without a key behaves the same
        assert_eq!(stock.available(None), 0);
        assert_eq!(stock.reserve(None, 1).unwrap_err(), 0);
    }

    #[test]
    fn scalar_ignores_variant_key() {
        let mut stock = StockLevel::Scalar(7);
        assert_eq!(stock.available(Some("M-red")), 7);
        assert!(stock.reserve(Some("M-red"), 3).is_ok());
        assert_eq!(stock.available(None), 4);
    }

    #[test]
    fn total_sums_all_variants() {
        assert_eq!(StockLevel::Scalar(9).total(), 9);
        assert_eq!(per_variant(&[("M-red", 5), ("L-blue", 2)]).total(), 7);
    }

    #[test]
    fn partial_update_scenario() {
        // cart holds 2 of M-red, stock at 3; update to 5 takes delta 3
        let mut stock = per_variant(&[("M-red", 3)]);
        assert!(stock.reserve(Some("M-red"), 3).is_ok());
        assert_eq!(stock.available(Some("M-red")), 0);
        // a further delta of 1 must fail and leave the cell at 0
        assert_eq!(stock.reserve(Some("M-red"), 1).unwrap_err(), 0);
        assert_eq!(stock.available(Some("M-red")), 0);
    }

    #[test]
    fn variant_key_formatting() {
        assert_eq!(variant_key(Some("M"), Some("red")).as_deref(), Some("M-red"));
        assert_eq!(variant_key(Some("M"), None).as_deref(), Some("M-"));
        assert_eq!(variant_key(None, Some("red")).as_deref(), Some("-red"));
        assert_eq!(variant_key(None, None), None);
    }

    #[test]
    fn stock_document_round_trips_both_representations() {
        let scalar: StockLevel = serde_json::from_str("12").unwrap();
        assert_eq!(scalar, StockLevel::Scalar(12));

        let map: StockLevel = serde_json::from_str(r#"{"M-red":5,"L-blue":2}"#).unwrap();
        assert_eq!(map, per_variant(&[("M-red", 5), ("L-blue", 2)]));
        assert_eq!(
            serde_json::to_string(&StockLevel::Scalar(12)).unwrap(),
            "12"
        );
    }
}
