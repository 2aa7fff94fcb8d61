use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{inventory::StockLevel, models::Product};

/// The stock representation is derived from the option lists: products with
/// both size and color options take a per-variant map, everything else a
/// scalar count. Omitting `stock` starts the product at zero.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateProductRequest {
    pub name: String,
    pub description: Option<String>,
    pub price: i64,
    #[serde(default)]
    pub size_options: Vec<String>,
    #[serde(default)]
    pub color_options: Vec<String>,
    pub stock: Option<StockLevel>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateProductRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Serialize, ToSchema)]
#[serde(transparent)]
pub struct ProductList {
    #[schema(value_type = Vec<Product>)]
    pub items: Vec<Product>,
}
