use argon2::{
    Argon2, PasswordHasher,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum_storefront_api::{config::AppConfig, db::create_pool};
use chrono::{Duration, Utc};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url).await?;
    // Ensure migrations are applied.
    sqlx::migrate!("./migrations").run(&pool).await?;

    let admin_id = ensure_user_with_role(&pool, "admin@example.com", "admin123", "admin").await?;
    let user_id = ensure_user_with_role(&pool, "user@example.com", "user123", "user").await?;
    seed_products(&pool).await?;
    seed_coupon(&pool).await?;

    println!("Seed completed. Admin ID: {admin_id}, User ID: {user_id}");
    Ok(())
}

async fn ensure_user_with_role(
    pool: &sqlx::PgPool,
    email: &str,
    password: &str,
    role: &str,
) -> anyhow::Result<Uuid> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .to_string();

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO users (id, email, password_hash, role)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO UPDATE SET role = EXCLUDED.role
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(email)
    .bind(password_hash)
    .bind(role)
    .fetch_optional(pool)
    .await?;

    // If user already exists, fetch id
    let user_id = match row {
        Some((id,)) => id,
        None => {
            let existing: (Uuid,) = sqlx::query_as("SELECT id FROM users WHERE email = $1")
                .bind(email)
                .fetch_one(pool)
                .await?;
            existing.0
        }
    };

    println!("Ensured user {email} (role={role})");
    Ok(user_id)
}

async fn seed_products(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    // (name, description, price, size options, color options, stock document)
    let products = vec![
        (
            "Logo Tee",
            "Soft cotton tee",
            2500_i64,
            serde_json::json!(["S", "M", "L"]),
            serde_json::json!(["red", "blue", "black"]),
            serde_json::json!({ "S-red": 10, "M-red": 25, "M-blue": 15, "L-black": 8 }),
        ),
        (
            "Canvas Tote",
            "Carries groceries and laptops alike",
            1800_i64,
            serde_json::json!([]),
            serde_json::json!([]),
            serde_json::json!(120),
        ),
        (
            "Enamel Mug",
            "Campfire classic",
            1200_i64,
            serde_json::json!([]),
            serde_json::json!([]),
            serde_json::json!(60),
        ),
    ];

    for (name, desc, price, sizes, colors, stock) in products {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, description, price, size_options, color_options, stock)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(desc)
        .bind(price)
        .bind(sizes)
        .bind(colors)
        .bind(stock)
        .execute(pool)
        .await?;
    }

    println!("Seeded products");
    Ok(())
}

async fn seed_coupon(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO coupons (id, code, discount, valid_until, max_uses, min_purchase)
        VALUES ($1, 'WELCOME10', 1000, $2, NULL, 2000)
        ON CONFLICT (code) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(Utc::now() + Duration::days(90))
    .execute(pool)
    .await?;

    println!("Seeded coupon WELCOME10");
    Ok(())
}
