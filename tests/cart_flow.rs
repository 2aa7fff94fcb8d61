use axum_storefront_api::{
    config::AppConfig,
    db::{create_orm_conn, create_pool, run_migrations},
    dto::cart::{AddToCartRequest, ApplyCouponRequest, RemoveCartItemParams, UpdateCartItemRequest},
    dto::orders::CheckoutRequest,
    entity::users::ActiveModel as UserActive,
    error::{AppError, CouponError},
    inventory,
    middleware::auth::AuthUser,
    services::{cart_service, order_service},
    state::AppState,
};
use chrono::{Duration, Utc};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ConnectionTrait, Set, Statement};
use uuid::Uuid;

// Both tests truncate the same database; run them one at a time.
static DB_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

// Full cart/inventory consistency flow: every mutation keeps per-variant
// stock and cart totals in lockstep, and failures leave both untouched.
#[tokio::test]
async fn cart_inventory_and_coupon_flow() -> anyhow::Result<()> {
    let _guard = DB_LOCK.lock().await;
    // Allow skipping when no DB is configured in the environment.
    let database_url = match std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => url,
        Err(_) => {
            eprintln!(
                "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
            );
            return Ok(());
        }
    };

    let state = setup_state(&database_url).await?;

    let user_id = create_user(&state, "user", "shopper@example.com").await?;
    let user = AuthUser {
        user_id,
        role: "user".into(),
    };

    // Per-variant product: M-red starts at 5.
    let shirt = create_product(
        &state,
        "Flow Tee",
        2500,
        serde_json::json!(["M", "L"]),
        serde_json::json!(["red", "blue"]),
        serde_json::json!({ "M-red": 5, "L-blue": 4 }),
    )
    .await?;

    // --- add then remove restores stock exactly ---
    let cart = cart_service::add_to_cart(
        &state,
        &user,
        shirt,
        AddToCartRequest {
            quantity: 2,
            size: Some("M".into()),
            color: Some("red".into()),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(
        inventory::get_available(&state.pool, shirt, Some("M-red")).await?,
        3
    );
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].quantity, 2);
    assert_eq!(cart.total_items, 2);
    assert_eq!(cart.total_amount, 5000);

    let cart = cart_service::remove_from_cart(
        &state,
        &user,
        shirt,
        RemoveCartItemParams {
            size: Some("M".into()),
            color: Some("red".into()),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(
        inventory::get_available(&state.pool, shirt, Some("M-red")).await?,
        5
    );
    assert!(cart.items.is_empty());
    assert_eq!(cart.total_amount, 0);

    // --- partial quantity update reserves only the delta ---
    cart_service::add_to_cart(
        &state,
        &user,
        shirt,
        AddToCartRequest {
            quantity: 2,
            size: Some("M".into()),
            color: Some("red".into()),
        },
    )
    .await?;
    let cart = cart_service::update_cart_item(
        &state,
        &user,
        shirt,
        UpdateCartItemRequest {
            quantity: 5,
            size: Some("M".into()),
            color: Some("red".into()),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(
        inventory::get_available(&state.pool, shirt, Some("M-red")).await?,
        0
    );
    assert_eq!(cart.items[0].quantity, 5);
    assert_eq!(cart.total_amount, 12500);

    // a further increase must fail and change nothing
    let err = cart_service::update_cart_item(
        &state,
        &user,
        shirt,
        UpdateCartItemRequest {
            quantity: 6,
            size: Some("M".into()),
            color: Some("red".into()),
        },
    )
    .await
    .unwrap_err();
    match err {
        AppError::InsufficientStock { available, .. } => assert_eq!(available, 0),
        other => panic!("expected InsufficientStock, got {other:?}"),
    }
    assert_eq!(
        inventory::get_available(&state.pool, shirt, Some("M-red")).await?,
        0
    );
    let cart = cart_service::get_cart(&state, &user).await?.data.unwrap();
    assert_eq!(cart.items[0].quantity, 5);
    assert_eq!(cart.total_amount, 12500);

    // --- failed add leaves both stores untouched ---
    let tote = create_product(
        &state,
        "Flow Tote",
        1800,
        serde_json::json!([]),
        serde_json::json!([]),
        serde_json::json!(3),
    )
    .await?;
    let err = cart_service::add_to_cart(
        &state,
        &user,
        tote,
        AddToCartRequest {
            quantity: 4,
            size: None,
            color: None,
        },
    )
    .await
    .unwrap_err();
    match err {
        AppError::InsufficientStock { available, .. } => assert_eq!(available, 3),
        other => panic!("expected InsufficientStock, got {other:?}"),
    }
    assert_eq!(inventory::get_available(&state.pool, tote, None).await?, 3);
    let cart = cart_service::get_cart(&state, &user).await?.data.unwrap();
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.total_amount, 12500);

    // --- flat coupon applies against the cart total and comes back off ---
    create_coupon(&state, "FLAT20", 2000, Utc::now() + Duration::days(7), 10000, &[]).await?;
    let cart = cart_service::apply_coupon(
        &state,
        &user,
        ApplyCouponRequest {
            coupon_code: "flat20".into(),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(cart.total_amount, 10500);
    assert_eq!(cart.applied_coupon.as_ref().unwrap().code, "FLAT20");

    let cart = cart_service::remove_coupon(&state, &user).await?.data.unwrap();
    assert_eq!(cart.total_amount, 12500);
    assert!(cart.applied_coupon.is_none());

    // --- a coupon that is both expired and already used reports the expiry ---
    create_coupon(
        &state,
        "STALE",
        1000,
        Utc::now() - Duration::days(1),
        0,
        &[user_id],
    )
    .await?;
    let err = cart_service::apply_coupon(
        &state,
        &user,
        ApplyCouponRequest {
            coupon_code: "STALE".into(),
        },
    )
    .await
    .unwrap_err();
    match err {
        AppError::CouponInvalid(reason) => assert_eq!(reason, CouponError::Expired),
        other => panic!("expected CouponInvalid, got {other:?}"),
    }

    // --- clear releases every line ---
    cart_service::clear_cart(&state, &user).await?;
    assert_eq!(
        inventory::get_available(&state.pool, shirt, Some("M-red")).await?,
        5
    );
    let cart = cart_service::get_cart(&state, &user).await?.data.unwrap();
    assert!(cart.items.is_empty());
    assert_eq!(cart.total_amount, 0);
    assert!(cart.applied_coupon.is_none());

    Ok(())
}

// Checkout converts the active cart into a priced order; the order-level
// coupon is percentage-based and gets its redemption recorded.
#[tokio::test]
async fn checkout_converts_cart_and_prices_order() -> anyhow::Result<()> {
    let _guard = DB_LOCK.lock().await;
    let database_url = match std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => url,
        Err(_) => {
            eprintln!(
                "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
            );
            return Ok(());
        }
    };

    let state = setup_state(&database_url).await?;
    let user_id = create_user(&state, "user", "buyer@example.com").await?;
    let user = AuthUser {
        user_id,
        role: "user".into(),
    };

    let mug = create_product(
        &state,
        "Checkout Mug",
        12000,
        serde_json::json!([]),
        serde_json::json!([]),
        serde_json::json!(10),
    )
    .await?;
    cart_service::add_to_cart(
        &state,
        &user,
        mug,
        AddToCartRequest {
            quantity: 2,
            size: None,
            color: None,
        },
    )
    .await?;

    // stored magnitude 1000 reads as "10" percent in the order flow
    create_coupon(&state, "TEN", 1000, Utc::now() + Duration::days(7), 0, &[]).await?;

    let resp = order_service::checkout(
        &state,
        &user,
        CheckoutRequest {
            address: "1 Main St".into(),
            payment_method: "cash_on_delivery".into(),
            delivery_instructions: None,
            coupon_code: Some("TEN".into()),
        },
    )
    .await?
    .data
    .unwrap();

    // subtotal 24000: -2400 coupon, +1680 tax, +599 shipping
    assert_eq!(resp.order.discount_amount, 2400);
    assert_eq!(resp.order.tax_amount, 1680);
    assert_eq!(resp.order.shipping_cost, 599);
    assert_eq!(resp.order.total_amount, 23879);
    assert_eq!(resp.order.status, "pending");
    assert_eq!(resp.items.len(), 1);
    assert_eq!(resp.items[0].quantity, 2);

    // the redemption was recorded against this user
    let (used_by,): (Vec<Uuid>,) =
        sqlx::query_as("SELECT used_by FROM coupons WHERE code = 'TEN'")
            .fetch_one(&state.pool)
            .await?;
    assert_eq!(used_by, vec![user_id]);

    // the old cart left the active state; the next access starts fresh
    let cart = cart_service::get_cart(&state, &user).await?.data.unwrap();
    assert!(cart.items.is_empty());

    // stock stays where the cart reservations put it
    assert_eq!(inventory::get_available(&state.pool, mug, None).await?, 8);

    Ok(())
}

async fn setup_state(database_url: &str) -> anyhow::Result<AppState> {
    let pool = create_pool(database_url).await?;
    let orm = create_orm_conn(database_url).await?;
    run_migrations(&orm).await?;

    // Clean tables between runs
    let backend = orm.get_database_backend();
    orm.execute(Statement::from_string(
        backend,
        "TRUNCATE TABLE order_items, orders, carts, coupons, audit_logs, products, users RESTART IDENTITY CASCADE",
    ))
    .await?;

    Ok(AppState {
        pool,
        orm,
        config: AppConfig {
            database_url: database_url.to_string(),
            jwt_secret: "test-secret".into(),
            host: "127.0.0.1".into(),
            port: 0,
        },
    })
}

async fn create_user(state: &AppState, role: &str, email: &str) -> anyhow::Result<Uuid> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(email.to_string()),
        password_hash: Set("dummy".into()),
        role: Set(role.into()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(user.id)
}

async fn create_product(
    state: &AppState,
    name: &str,
    price: i64,
    size_options: serde_json::Value,
    color_options: serde_json::Value,
    stock: serde_json::Value,
) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO products (id, name, description, price, size_options, color_options, stock)
        VALUES ($1, $2, NULL, $3, $4, $5, $6)
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(price)
    .bind(size_options)
    .bind(color_options)
    .bind(stock)
    .execute(&state.pool)
    .await?;
    Ok(id)
}

async fn create_coupon(
    state: &AppState,
    code: &str,
    discount: i64,
    valid_until: chrono::DateTime<Utc>,
    min_purchase: i64,
    used_by: &[Uuid],
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO coupons (id, code, discount, valid_until, max_uses, used_by, min_purchase)
        VALUES ($1, $2, $3, $4, NULL, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(code)
    .bind(discount)
    .bind(valid_until)
    .bind(used_by)
    .bind(min_purchase)
    .execute(&state.pool)
    .await?;
    Ok(())
}
