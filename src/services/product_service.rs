use std::collections::BTreeMap;

use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::Expr;
use sea_orm::sea_query::extension::postgres::PgExpr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::{
    audit,
    dto::products::{CreateProductRequest, ProductList, UpdateProductRequest},
    entity::products::{ActiveModel, Column, Entity as Products, Model as ProductModel},
    error::{AppError, AppResult},
    inventory::StockLevel,
    middleware::auth::{AuthUser, ensure_admin},
    models::Product,
    response::{ApiResponse, Meta},
    routes::params::{ProductQuery, ProductSortBy, SortOrder},
    state::AppState,
};

pub(crate) fn to_json(value: impl Serialize) -> AppResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(e.into()))
}

pub(crate) fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> AppResult<T> {
    serde_json::from_value(value).map_err(|e| AppError::Internal(e.into()))
}

pub(crate) fn product_from_entity(model: ProductModel) -> AppResult<Product> {
    Ok(Product {
        id: model.id,
        name: model.name,
        description: model.description,
        price: model.price,
        size_options: from_json(model.size_options)?,
        color_options: from_json(model.color_options)?,
        stock: from_json(model.stock)?,
        is_active: model.is_active,
        created_at: model.created_at.with_timezone(&Utc),
    })
}

pub async fn list_products(
    state: &AppState,
    query: ProductQuery,
) -> AppResult<ApiResponse<ProductList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all();

    if let Some(search) = query.q.as_ref().filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search);
        condition = condition.add(
            Condition::any()
                .add(Expr::col(Column::Name).ilike(pattern.clone()))
                .add(Expr::col(Column::Description).ilike(pattern)),
        );
    }

    if let Some(min_price) = query.min_price {
        condition = condition.add(Column::Price.gte(min_price));
    }

    if let Some(max_price) = query.max_price {
        condition = condition.add(Column::Price.lte(max_price));
    }

    let sort_by = query.sort_by.unwrap_or(ProductSortBy::CreatedAt);
    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let sort_col = match sort_by {
        ProductSortBy::CreatedAt => Column::CreatedAt,
        ProductSortBy::Price => Column::Price,
        ProductSortBy::Name => Column::Name,
    };

    let mut finder = Products::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(sort_col),
        SortOrder::Desc => finder.order_by_desc(sort_col),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let items = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(product_from_entity)
        .collect::<AppResult<Vec<_>>>()?;

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Products",
        ProductList { items },
        Some(meta),
    ))
}

pub async fn get_product(state: &AppState, id: Uuid) -> AppResult<ApiResponse<Product>> {
    let model = Products::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::ProductNotFound)?;
    Ok(ApiResponse::success(
        "Product",
        product_from_entity(model)?,
        None,
    ))
}

/// The stock representation is locked in here: products carrying both size
/// and color options get a per-variant map, everything else a scalar count.
fn initial_stock(payload: &CreateProductRequest) -> AppResult<StockLevel> {
    let per_variant = !payload.size_options.is_empty() && !payload.color_options.is_empty();
    match (payload.stock.clone(), per_variant) {
        (None, true) => Ok(StockLevel::PerVariant(BTreeMap::new())),
        (None, false) => Ok(StockLevel::Scalar(0)),
        (Some(StockLevel::Scalar(count)), false) => {
            if count < 0 {
                return Err(AppError::BadRequest("stock cannot be negative".into()));
            }
            Ok(StockLevel::Scalar(count))
        }
        (Some(StockLevel::PerVariant(map)), true) => {
            for (key, count) in &map {
                if *count < 0 {
                    return Err(AppError::BadRequest("stock cannot be negative".into()));
                }
                let known = key.split_once('-').is_some_and(|(size, color)| {
                    payload.size_options.iter().any(|s| s == size)
                        && payload.color_options.iter().any(|c| c == color)
                });
                if !known {
                    return Err(AppError::BadRequest(format!("Unknown variant key: {key}")));
                }
            }
            Ok(StockLevel::PerVariant(map))
        }
        (Some(StockLevel::Scalar(_)), true) => Err(AppError::BadRequest(
            "products with size and color options take a per-variant stock map".into(),
        )),
        (Some(StockLevel::PerVariant(_)), false) => Err(AppError::BadRequest(
            "per-variant stock requires both size and color options".into(),
        )),
    }
}

pub async fn create_product(
    state: &AppState,
    user: &AuthUser,
    payload: CreateProductRequest,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;
    if payload.price <= 0 {
        return Err(AppError::InvalidProduct);
    }
    let stock = initial_stock(&payload)?;

    let id = Uuid::new_v4();
    let active = ActiveModel {
        id: Set(id),
        name: Set(payload.name),
        description: Set(payload.description),
        price: Set(payload.price),
        size_options: Set(to_json(&payload.size_options)?),
        color_options: Set(to_json(&payload.color_options)?),
        stock: Set(to_json(&stock)?),
        is_active: Set(true),
        created_at: NotSet,
    };
    let product = active.insert(&state.orm).await?;

    audit::record(
        &state.pool,
        Some(user.user_id),
        "product_create",
        Some("products"),
        Some(serde_json::json!({ "product_id": product.id })),
    )
    .await;

    Ok(ApiResponse::success(
        "Product created",
        product_from_entity(product)?,
        Some(Meta::empty()),
    ))
}

pub async fn update_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateProductRequest,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;
    let existing = Products::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::ProductNotFound)?;

    let mut active: ActiveModel = existing.into();
    if let Some(name) = payload.name {
        active.name = Set(name);
    }
    if let Some(description) = payload.description {
        active.description = Set(Some(description));
    }
    if let Some(price) = payload.price {
        if price <= 0 {
            return Err(AppError::InvalidProduct);
        }
        active.price = Set(price);
    }
    if let Some(is_active) = payload.is_active {
        active.is_active = Set(is_active);
    }

    let product = active.update(&state.orm).await?;

    audit::record(
        &state.pool,
        Some(user.user_id),
        "product_update",
        Some("products"),
        Some(serde_json::json!({ "product_id": product.id })),
    )
    .await;

    Ok(ApiResponse::success(
        "Updated",
        product_from_entity(product)?,
        Some(Meta::empty()),
    ))
}

pub async fn delete_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;
    let result = Products::delete_by_id(id).exec(&state.orm).await?;

    if result.rows_affected == 0 {
        return Err(AppError::ProductNotFound);
    }

    audit::record(
        &state.pool,
        Some(user.user_id),
        "product_delete",
        Some("products"),
        Some(serde_json::json!({ "product_id": id })),
    )
    .await;

    Ok(ApiResponse::success(
        "Deleted",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        size_options: &[&str],
        color_options: &[&str],
        stock: Option<StockLevel>,
    ) -> CreateProductRequest {
        CreateProductRequest {
            name: "Shirt".into(),
            description: None,
            price: 1000,
            size_options: size_options.iter().map(|s| s.to_string()).collect(),
            color_options: color_options.iter().map(|s| s.to_string()).collect(),
            stock,
        }
    }

    #[test]
    fn scalar_products_default_to_zero_stock() {
        let stock = initial_stock(&request(&[], &[], None)).unwrap();
        assert_eq!(stock, StockLevel::Scalar(0));
    }

    #[test]
    fn option_lists_force_the_per_variant_representation() {
        let stock = initial_stock(&request(&["M"], &["red"], None)).unwrap();
        assert_eq!(stock, StockLevel::PerVariant(BTreeMap::new()));

        // a scalar count is not accepted for a variant product
        assert!(
            initial_stock(&request(&["M"], &["red"], Some(StockLevel::Scalar(5)))).is_err()
        );
    }

    #[test]
    fn variant_keys_must_come_from_the_option_lists() {
        let map = StockLevel::PerVariant(BTreeMap::from([("M-red".to_string(), 5)]));
        assert!(initial_stock(&request(&["M"], &["red"], Some(map.clone()))).is_ok());
        assert!(initial_stock(&request(&["L"], &["red"], Some(map))).is_err());
    }

    #[test]
    fn negative_counts_are_rejected() {
        assert!(initial_stock(&request(&[], &[], Some(StockLevel::Scalar(-1)))).is_err());
        let map = StockLevel::PerVariant(BTreeMap::from([("M-red".to_string(), -3)]));
        assert!(initial_stock(&request(&["M"], &["red"], Some(map))).is_err());
    }
}
