use clap::Parser;
use fake::faker::internet::en::SafeEmail;
use fake::faker::name::en::{FirstName, LastName};
use fake::faker::phone_number::en::PhoneNumber;
use fake::Fake;
use sqlx::sqlite::SqlitePoolOptions;

use confpay::{
    domain::CreateOrderRequest,
    repository::{OrderRepository, SqliteOrderRepository},
};

#[derive(Parser)]
#[command(about = "Seed demo registration orders for local development")]
struct Args {
    /// Number of orders to create
    #[arg(short, long, default_value_t = 5)]
    count: usize,

    /// Registration fee in minor units
    #[arg(long, default_value_t = 10000)]
    amount_cents: i64,

    #[arg(long, default_value = "USD")]
    currency: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("🌱 Seeding demo orders...");

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:confpay.db".to_string());

    let db_pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    println!("📋 Running migrations...");
    sqlx::migrate!("./migrations").run(&db_pool).await?;

    let order_repo = SqliteOrderRepository::new(db_pool.clone());

    for i in 0..args.count {
        let first_name: String = FirstName().fake();
        let last_name: String = LastName().fake();
        let email: String = SafeEmail().fake();
        let phone: String = PhoneNumber().fake();

        let order = order_repo
            .create(CreateOrderRequest {
                code: format!("APSC-{:05}", i + 1),
                first_name,
                last_name,
                email,
                phone: Some(phone),
                amount_cents: args.amount_cents,
                currency: args.currency.clone(),
            })
            .await?;

        println!("  ✅ Created order {} ({})", order.code, order.id);
    }

    println!("Done. {} orders created.", args.count);
    Ok(())
}
