//! Process configuration.
//!
//! Everything is supplied through the environment (or matching CLI flags),
//! with `.env` loaded at startup. Gateway credentials are optional at boot:
//! when absent, gateway-dependent endpoints answer 503 instead of preventing
//! the dispatch core from serving.

use axum::http::{HeaderValue, Method};
use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;
use tower_http::cors::{self, CorsLayer};

/// Runtime configuration for the dispatch core.
#[derive(Parser, Debug, Clone)]
#[command(name = "resq-core")]
#[command(about = "Roadside-assistance dispatch and payment core")]
pub struct Config {
    /// Bind address.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Bind port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Maximum size of the shared connection pool.
    #[arg(long, env = "DB_POOL_SIZE", default_value_t = 100)]
    pub db_pool_size: u32,

    /// Razorpay key id. Required in production.
    #[arg(long, env = "RAZORPAY_KEY_ID")]
    pub razorpay_key_id: Option<String>,

    /// Razorpay key secret. Required in production.
    #[arg(long, env = "RAZORPAY_KEY_SECRET")]
    pub razorpay_key_secret: Option<String>,

    /// Razorpay webhook signing secret. Required in production.
    #[arg(long, env = "RAZORPAY_WEBHOOK_SECRET")]
    pub razorpay_webhook_secret: Option<String>,

    /// Base URL of the routing (ETA) service. Without it, dispatch ranking
    /// uses the Haversine fallback only.
    #[arg(long, env = "ROUTING_SERVICE_URL")]
    pub routing_service_url: Option<String>,

    /// How many top candidates receive routed ETA enrichment.
    #[arg(long, env = "DISPATCH_ETA_MATRIX_LIMIT", default_value_t = 25)]
    pub dispatch_eta_matrix_limit: usize,

    /// Global dispatch radius cap in kilometers.
    #[arg(long, env = "DISPATCH_RADIUS_KM", default_value_t = 50.0)]
    pub dispatch_radius_km: f64,

    /// TTL of the cached platform pricing configuration.
    #[arg(long, env = "PRICING_CACHE_TTL_SECS", default_value_t = 30)]
    pub pricing_cache_ttl_secs: u64,

    /// Comma-separated CORS allow-list. Empty means allow any origin
    /// (development only).
    #[arg(long, env = "CORS_ALLOWED_ORIGINS")]
    pub cors_allowed_origins: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        Config::parse()
    }

    pub fn pricing_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.pricing_cache_ttl_secs)
    }

    /// Builds the CORS layer from the allow-list.
    pub fn cors_layer(&self) -> CorsLayer {
        let layer = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::PATCH])
            .allow_headers(cors::Any);
        match self.allowed_origins() {
            Some(origins) => layer.allow_origin(origins),
            None => layer.allow_origin(cors::Any),
        }
    }

    fn allowed_origins(&self) -> Option<Vec<HeaderValue>> {
        let raw = self.cors_allowed_origins.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        let origins: Vec<HeaderValue> = raw
            .split(',')
            .filter_map(|origin| {
                let origin = origin.trim();
                match origin.parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!(origin, "Ignoring unparsable CORS origin");
                        None
                    }
                }
            })
            .collect();
        if origins.is_empty() { None } else { Some(origins) }
    }
}
