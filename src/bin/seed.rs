use sokoni_api::{config::AppConfig, db::create_pool};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url).await?;
    // Ensure migrations are applied.
    sqlx::migrate!("./migrations").run(&pool).await?;

    seed_products(&pool).await?;

    println!("Seed completed");
    Ok(())
}

async fn seed_products(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    // Prices in TZS.
    let products = vec![
        ("Mchele (Rice)", "Local white rice", "kg", 3200, 500),
        ("Maharage (Beans)", "Red kidney beans", "kg", 4000, 300),
        ("Unga wa Ngano (Wheat Flour)", "All-purpose flour", "kg", 2800, 400),
        ("Sukari (Sugar)", "White sugar", "kg", 3000, 350),
        ("Mafuta ya Alizeti (Sunflower Oil)", "Cooking oil", "litre", 7500, 200),
        ("Nyanya (Tomatoes)", "Fresh tomatoes", "kg", 2500, 150),
        ("Vitunguu (Onions)", "Red onions", "kg", 2200, 180),
        ("Ndizi (Bananas)", "Cooking bananas", "bunch", 5000, 80),
        ("Maziwa (Milk)", "Fresh pasteurized milk", "litre", 2600, 120),
        ("Mayai (Eggs)", "Tray of 30", "tray", 10500, 60),
        ("Mkate (Bread)", "White loaf", "piece", 1700, 90),
        ("Chai Majani (Tea Leaves)", "Loose black tea", "packet", 3500, 100),
    ];

    for (name, desc, unit, price, stock) in products {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, description, unit, price, stock)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(desc)
        .bind(unit)
        .bind(price)
        .bind(stock)
        .execute(pool)
        .await?;
    }

    println!("Seeded products");
    Ok(())
}
