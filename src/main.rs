//! ResQ dispatch core HTTP entrypoint.
//!
//! Boot order: `.env` values, telemetry, configuration, database pool and
//! schema, engine assembly, Axum server with CORS and request tracing, then
//! graceful shutdown on SIGTERM/SIGINT.

use axum::Router;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use resq_core::config::Config;
use resq_core::dispatch::DispatchEngine;
use resq_core::handlers::{self, AppState};
use resq_core::lifecycle::Lifecycle;
use resq_core::notifier::Notifier;
use resq_core::payment::{Payments, RazorpayGateway};
use resq_core::pricing::PlatformPricing;
use resq_core::routing::RoutingClient;
use resq_core::sig_down;
use resq_core::store::Store;
use resq_core::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::init();
    let config = Config::load();

    let store = Store::connect(&config.database_url, config.db_pool_size).await?;
    store.migrate().await?;

    let pricing = PlatformPricing::new(store.clone(), config.pricing_cache_ttl());
    let notifier = Notifier::new();

    let routing = match &config.routing_service_url {
        Some(url) => Some(RoutingClient::new(url.clone())?),
        None => {
            tracing::warn!("ROUTING_SERVICE_URL not set, ETA ranking uses Haversine fallback");
            None
        }
    };

    let gateway = match (&config.razorpay_key_id, &config.razorpay_key_secret) {
        (Some(key_id), Some(key_secret)) => Some(RazorpayGateway::new(
            key_id.clone(),
            key_secret.clone(),
            config.razorpay_webhook_secret.clone(),
        )?),
        _ => {
            tracing::warn!(
                "Razorpay credentials not set, payment endpoints will answer 503"
            );
            None
        }
    };

    let dispatch = DispatchEngine::new(
        store.clone(),
        pricing.clone(),
        notifier.clone(),
        routing,
        config.dispatch_radius_km,
        config.dispatch_eta_matrix_limit,
    );
    let lifecycle = Lifecycle::new(
        store.clone(),
        notifier.clone(),
        dispatch.clone(),
        pricing.clone(),
    );
    let payments = Payments::new(
        store.clone(),
        pricing.clone(),
        notifier.clone(),
        gateway,
    );

    let state = Arc::new(AppState {
        store,
        pricing,
        notifier,
        lifecycle,
        dispatch,
        payments,
    });

    let app = Router::new()
        .merge(handlers::routes().with_state(state))
        .layer(TraceLayer::new_for_http())
        .layer(config.cors_layer());

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = sig_down::shutdown_token()?;
    let graceful = async move { shutdown.cancelled().await };
    axum::serve(listener, app).with_graceful_shutdown(graceful).await?;

    Ok(())
}
