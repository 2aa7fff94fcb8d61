use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        auth as auth_dto, cart as cart_dto, coupons as coupon_dto,
        orders::{OrderList, OrderWithItems},
        products as product_dto,
    },
    inventory::StockLevel,
    models::{AppliedCoupon, Cart, CartItem, CartStatus, Coupon, Order, OrderItem, Product, User},
    response::{ApiResponse, Meta},
    routes::{admin, auth, cart, coupons, health, orders, params, products as product_routes},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        auth::login,
        auth::register,
        cart::get_cart,
        cart::add_to_cart,
        cart::update_cart_item,
        cart::remove_from_cart,
        cart::clear_cart,
        cart::apply_coupon,
        cart::remove_coupon,
        coupons::generate_coupon,
        product_routes::list_products,
        product_routes::create_product,
        product_routes::get_product,
        product_routes::update_product,
        product_routes::delete_product,
        orders::list_orders,
        orders::checkout,
        orders::get_order,
        orders::pay_order,
        admin::list_all_orders,
        admin::get_order_admin,
        admin::update_order_status,
        admin::list_low_stock,
        admin::adjust_inventory
    ),
    components(
        schemas(
            User,
            Product,
            StockLevel,
            Cart,
            CartItem,
            CartStatus,
            AppliedCoupon,
            Coupon,
            Order,
            OrderItem,
            auth_dto::RegisterRequest,
            auth_dto::LoginRequest,
            auth_dto::LoginResponse,
            cart_dto::AddToCartRequest,
            cart_dto::UpdateCartItemRequest,
            cart_dto::RemoveCartItemParams,
            cart_dto::ApplyCouponRequest,
            coupon_dto::GenerateCouponRequest,
            product_dto::CreateProductRequest,
            product_dto::UpdateProductRequest,
            product_dto::ProductList,
            OrderList,
            OrderWithItems,
            admin::ProductList,
            admin::UpdateOrderStatusRequest,
            admin::InventoryAdjustRequest,
            admin::LowStockQuery,
            params::Pagination,
            params::ProductQuery,
            params::OrderListQuery,
            Meta,
            ApiResponse<Cart>,
            ApiResponse<Product>,
            ApiResponse<Coupon>,
            ApiResponse<OrderWithItems>,
            ApiResponse<OrderList>,
            ApiResponse<product_dto::ProductList>,
            ApiResponse<admin::ProductList>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Products", description = "Product catalog endpoints"),
        (name = "Cart", description = "Cart and cart coupon endpoints"),
        (name = "Coupons", description = "Coupon administration"),
        (name = "Orders", description = "Order endpoints"),
        (name = "Admin", description = "Admin endpoints"),
        (name = "Auth", description = "Authentication endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
