use std::{net::SocketAddr, sync::Arc};

use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderValue;
use axum::http::Method;
use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use reqwest::Client;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use plumage_billing::config::Config;
use plumage_billing::db::billing_store::BillingStore;
use plumage_billing::db::postgres_billing_store::PostgresBillingStore;
use plumage_billing::responses::JsonResponse;
use plumage_billing::routes::webhooks::webhook;
use plumage_billing::services::cache::{
    CacheInvalidator, HttpCacheInvalidator, NoopCacheInvalidator,
};
use plumage_billing::services::observability::{ObservabilitySink, SentryObservability};
use plumage_billing::services::stripe::{LiveStripeService, StripeService};
use plumage_billing::state::AppState;
use plumage_billing::webhooks::dispatcher::HandlerRegistry;
use plumage_billing::webhooks::handlers::{PaymentHandler, SubscriptionHandler};
use plumage_billing::webhooks::processor::WebhookProcessor;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    let _sentry_guard = config.sentry_dsn.as_ref().map(|dsn| {
        sentry::init((
            dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let pg_pool = establish_connection(&config.database_url).await;
    let store = Arc::new(PostgresBillingStore {
        pool: pg_pool.clone(),
    }) as Arc<dyn BillingStore>;

    let stripe =
        Arc::new(LiveStripeService::from_settings(&config.stripe)) as Arc<dyn StripeService>;
    let observability = Arc::new(SentryObservability::new()) as Arc<dyn ObservabilitySink>;

    let http_client = Client::new();
    let cache: Arc<dyn CacheInvalidator> = match &config.cache_invalidation_url {
        Some(url) => Arc::new(HttpCacheInvalidator::new(http_client.clone(), url.clone())),
        None => Arc::new(NoopCacheInvalidator),
    };

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(SubscriptionHandler::new(
        config.stripe.pro_price_ids.clone(),
    )));
    registry.register(Arc::new(PaymentHandler::new(
        stripe.clone(),
        observability.clone(),
    )));

    let processor = Arc::new(WebhookProcessor::new(
        store,
        registry,
        observability,
        cache,
    ));

    let config = Arc::new(config);
    let state = AppState {
        stripe,
        processor,
        config: config.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(config.frontend_origin.parse::<HeaderValue>().unwrap())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    let app = Router::new()
        .route("/", get(root))
        .route("/api/billing/webhook", post(webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    let listener = TcpListener::bind(addr).await.unwrap();
    println!("Running at http://{}", addr);
    axum::serve(listener, app).await.unwrap();
}

/// A simple root route.
async fn root() -> Response {
    JsonResponse::success("Hello, Plumage Billing!").into_response()
}

/// Establish a connection to the database and verify it.
async fn establish_connection(database_url: &str) -> PgPool {
    let pool = PgPool::connect(database_url)
        .await
        .expect("Failed to connect to the database");

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .expect("Failed to verify database connection");

    info!("✅ Successfully connected to the database");
    pool
}
