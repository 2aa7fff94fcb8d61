use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::CouponError;
use crate::inventory::StockLevel;

#[derive(Debug, Serialize, Deserialize, FromRow, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: i64,
    pub size_options: Vec<String>,
    pub color_options: Vec<String>,
    pub stock: StockLevel,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CartStatus {
    Active,
    Abandoned,
    Converted,
}

impl CartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CartStatus::Active => "active",
            CartStatus::Abandoned => "abandoned",
            CartStatus::Converted => "converted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(CartStatus::Active),
            "abandoned" => Some(CartStatus::Abandoned),
            "converted" => Some(CartStatus::Converted),
            _ => None,
        }
    }
}

/// One line of a cart: the unit price is captured when the line is created
/// and the subtotal is kept in lockstep with the quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CartItem {
    pub product_id: Uuid,
    pub quantity: i32,
    pub size: Option<String>,
    pub color: Option<String>,
    pub price: i64,
    pub sub_total: i64,
}

impl CartItem {
    pub fn matches(&self, product_id: Uuid, size: Option<&str>, color: Option<&str>) -> bool {
        self.product_id == product_id
            && self.size.as_deref() == size
            && self.color.as_deref() == color
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AppliedCoupon {
    pub code: String,
    pub discount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Cart {
    pub id: Uuid,
    pub user_id: Uuid,
    pub items: Vec<CartItem>,
    pub total_amount: i64,
    pub total_items: i32,
    pub status: CartStatus,
    pub applied_coupon: Option<AppliedCoupon>,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Cart {
    /// Recompute the cached totals from the line items and the applied
    /// coupon. `total_amount` and `total_items` are never derived lazily at
    /// read time; every structural change goes through here. A corrupt
    /// (negative) line value counts as 0 instead of poisoning the total,
    /// and the coupon discount never takes the total below zero.
    pub fn recompute_totals(&mut self) {
        self.total_amount = self.items.iter().map(|item| item.sub_total.max(0)).sum();
        self.total_items = self.items.iter().map(|item| item.quantity.max(0)).sum();
        if let Some(coupon) = &self.applied_coupon {
            self.total_amount = (self.total_amount - coupon.discount.max(0)).max(0);
        }
        self.last_updated = Utc::now();
    }

    pub fn position_of(
        &self,
        product_id: Uuid,
        size: Option<&str>,
        color: Option<&str>,
    ) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.matches(product_id, size, color))
    }

    /// Merge into an existing line matching (product, size, color) or append
    /// a new one with the unit price captured now.
    pub fn upsert_item(
        &mut self,
        product_id: Uuid,
        quantity: i32,
        size: Option<String>,
        color: Option<String>,
        price: i64,
    ) {
        match self.position_of(product_id, size.as_deref(), color.as_deref()) {
            Some(idx) => {
                let item = &mut self.items[idx];
                item.quantity += quantity;
                item.sub_total = i64::from(item.quantity) * item.price;
            }
            None => self.items.push(CartItem {
                product_id,
                quantity,
                size,
                color,
                price,
                sub_total: i64::from(quantity) * price,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Coupon {
    pub id: Uuid,
    pub code: String,
    pub discount: i64,
    pub valid_until: DateTime<Utc>,
    /// `None` means unbounded.
    pub max_uses: Option<i32>,
    pub used_by: Vec<Uuid>,
    pub min_purchase: i64,
    pub created_at: DateTime<Utc>,
}

impl Coupon {
    /// Applicability check for the cart flow: first failing rule wins, so a
    /// coupon that is both expired and already redeemed reports the expiry.
    /// Success yields the flat discount amount. This never touches
    /// `used_by`; redemption bookkeeping belongs to order checkout.
    pub fn validate(
        &self,
        user_id: Uuid,
        cart_total: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, CouponError> {
        if self.valid_until < now {
            return Err(CouponError::Expired);
        }
        if self.used_by.contains(&user_id) {
            return Err(CouponError::AlreadyUsed);
        }
        if let Some(max_uses) = self.max_uses {
            if self.used_by.len() as i32 >= max_uses {
                return Err(CouponError::UsageLimitReached);
            }
        }
        if cart_total < self.min_purchase {
            return Err(CouponError::MinPurchase(self.min_purchase));
        }
        Ok(self.discount)
    }
}

#[derive(Debug, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub total_amount: i64,
    pub discount_amount: i64,
    pub tax_amount: i64,
    pub shipping_cost: i64,
    pub coupon_code: Option<String>,
    pub status: String,
    pub payment_status: String,
    pub invoice_number: String,
    pub shipping_address: String,
    pub payment_method: String,
    pub delivery_instructions: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow, ToSchema)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub size: Option<String>,
    pub color: Option<String>,
    pub price: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn empty_cart() -> Cart {
        Cart {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            items: vec![],
            total_amount: 0,
            total_items: 0,
            status: CartStatus::Active,
            applied_coupon: None,
            last_updated: Utc::now(),
            created_at: Utc::now(),
        }
    }

    fn coupon(discount: i64) -> Coupon {
        Coupon {
            id: Uuid::new_v4(),
            code: "FLAT20".into(),
            discount,
            valid_until: Utc::now() + Duration::days(7),
            max_uses: Some(10),
            used_by: vec![],
            min_purchase: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_merges_matching_lines() {
        let mut cart = empty_cart();
        let product_id = Uuid::new_v4();
        cart.upsert_item(product_id, 2, Some("M".into()), Some("red".into()), 1000);
        cart.upsert_item(product_id, 1, Some("M".into()), Some("red".into()), 1000);
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity, 3);
        assert_eq!(cart.items[0].sub_total, 3000);

        // a different variant of the same product is its own line
        cart.upsert_item(product_id, 1, Some("L".into()), Some("red".into()), 1000);
        assert_eq!(cart.items.len(), 2);
    }

    #[test]
    fn totals_reconcile_with_items() {
        let mut cart = empty_cart();
        cart.upsert_item(Uuid::new_v4(), 2, None, None, 1500);
        cart.upsert_item(Uuid::new_v4(), 1, None, None, 700);
        cart.recompute_totals();
        assert_eq!(cart.total_amount, 3700);
        assert_eq!(cart.total_items, 3);
    }

    #[test]
    fn coupon_discount_is_flat_and_floored_at_zero() {
        let mut cart = empty_cart();
        cart.upsert_item(Uuid::new_v4(), 1, None, None, 12000);
        cart.applied_coupon = Some(AppliedCoupon {
            code: "FLAT20".into(),
            discount: 2000,
        });
        cart.recompute_totals();
        assert_eq!(cart.total_amount, 10000);

        cart.applied_coupon = Some(AppliedCoupon {
            code: "HUGE".into(),
            discount: 50000,
        });
        cart.recompute_totals();
        assert_eq!(cart.total_amount, 0);

        cart.applied_coupon = None;
        cart.recompute_totals();
        assert_eq!(cart.total_amount, 12000);
    }

    #[test]
    fn corrupt_line_subtotal_counts_as_zero() {
        let mut cart = empty_cart();
        cart.items.push(CartItem {
            product_id: Uuid::new_v4(),
            quantity: 1,
            size: None,
            color: None,
            price: 500,
            sub_total: -42,
        });
        cart.upsert_item(Uuid::new_v4(), 1, None, None, 800);
        cart.recompute_totals();
        assert_eq!(cart.total_amount, 800);
        assert_eq!(cart.total_items, 2);
    }

    #[test]
    fn coupon_expiry_is_checked_before_per_user_use() {
        let user = Uuid::new_v4();
        let mut c = coupon(1000);
        c.valid_until = Utc::now() - Duration::days(1);
        c.used_by = vec![user];
        // expired and already used: the expiry must win
        assert_eq!(c.validate(user, 5000, Utc::now()), Err(CouponError::Expired));
    }

    #[test]
    fn coupon_already_used_by_this_user() {
        let user = Uuid::new_v4();
        let mut c = coupon(1000);
        c.used_by = vec![user];
        assert_eq!(
            c.validate(user, 5000, Utc::now()),
            Err(CouponError::AlreadyUsed)
        );
    }

    #[test]
    fn coupon_usage_limit_reached() {
        let mut c = coupon(1000);
        c.max_uses = Some(2);
        c.used_by = vec![Uuid::new_v4(), Uuid::new_v4()];
        assert_eq!(
            c.validate(Uuid::new_v4(), 5000, Utc::now()),
            Err(CouponError::UsageLimitReached)
        );
    }

    #[test]
    fn coupon_unbounded_uses_never_hits_the_limit() {
        let mut c = coupon(1000);
        c.max_uses = None;
        c.used_by = (0..100).map(|_| Uuid::new_v4()).collect();
        assert_eq!(c.validate(Uuid::new_v4(), 5000, Utc::now()), Ok(1000));
    }

    #[test]
    fn coupon_minimum_purchase_carries_the_floor() {
        let mut c = coupon(2000);
        c.min_purchase = 10000;
        assert_eq!(
            c.validate(Uuid::new_v4(), 9999, Utc::now()),
            Err(CouponError::MinPurchase(10000))
        );
        assert_eq!(
            CouponError::MinPurchase(10000).to_string(),
            "Minimum purchase of 10000 required"
        );
        assert_eq!(c.validate(Uuid::new_v4(), 10000, Utc::now()), Ok(2000));
    }
}
