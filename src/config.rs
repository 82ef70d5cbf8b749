use std::env;

pub struct StripeSettings {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Price ids of the paid catalog, used for auxiliary tier display.
    pub pro_price_ids: Vec<String>,
}

pub struct Config {
    pub database_url: String,
    pub frontend_origin: String,
    pub stripe: StripeSettings,
    pub sentry_dsn: Option<String>,
    /// Internal endpoint of the read-path cache; unset means no-op
    /// invalidation (local development).
    pub cache_invalidation_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok(); // Load .env file

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let frontend_origin = env::var("FRONTEND_ORIGIN").expect("FRONTEND_ORIGIN must be set");

        let stripe = StripeSettings {
            secret_key: env::var("STRIPE_SECRET_KEY").expect("STRIPE_SECRET_KEY must be set"),
            webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                .expect("STRIPE_WEBHOOK_SECRET must be set"),
            pro_price_ids: env::var("STRIPE_PRO_PRICE_IDS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        Config {
            database_url,
            frontend_origin,
            stripe,
            sentry_dsn: env::var("SENTRY_DSN").ok(),
            cache_invalidation_url: env::var("CACHE_INVALIDATION_URL").ok(),
        }
    }
}
