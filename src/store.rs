//! PostgreSQL access: pool construction, schema bootstrap, and the shared
//! read queries used across the engine.
//!
//! Transactional writes (offer racing, lifecycle transitions, payment
//! finalization) live next to the operations that own them; this module owns
//! the pool and the projections everything else reads through.

use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::instrument;

use crate::pricing::{PricingConfig, SubscriptionPlan, WelcomeCoupon};
use crate::types::{DispatchOffer, ServiceRequest, Technician, TechnicianDue, User};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS technicians (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    phone TEXT,
    email TEXT,
    approval_status TEXT NOT NULL DEFAULT 'pending',
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    is_available BOOLEAN NOT NULL DEFAULT TRUE,
    lat DOUBLE PRECISION,
    lng DOUBLE PRECISION,
    service_area_range_km INTEGER NOT NULL DEFAULT 10,
    service_type TEXT,
    specialties JSONB NOT NULL DEFAULT 'null'::jsonb,
    vehicle_types JSONB NOT NULL DEFAULT 'null'::jsonb,
    pricing JSONB NOT NULL DEFAULT 'null'::jsonb,
    service_costs JSONB NOT NULL DEFAULT 'null'::jsonb,
    jobs_completed BIGINT NOT NULL DEFAULT 0,
    total_earnings DECIMAL(14,2) NOT NULL DEFAULT 0,
    rating DECIMAL(4,2) NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS service_requests (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users(id),
    technician_id BIGINT REFERENCES technicians(id),
    service_type TEXT NOT NULL,
    vehicle_type TEXT NOT NULL,
    address TEXT NOT NULL,
    lat DOUBLE PRECISION,
    lng DOUBLE PRECISION,
    contact_name TEXT,
    contact_phone TEXT,
    amount DECIMAL(12,2),
    service_charge DECIMAL(12,2),
    applied_coupon_code TEXT,
    coupon_discount_percent DECIMAL(6,4),
    coupon_discount_amount DECIMAL(12,2),
    payment_status TEXT NOT NULL DEFAULT 'pending',
    payment_method TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    cancelled_at TIMESTAMPTZ,
    cancellation_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_service_requests_user ON service_requests(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_service_requests_status ON service_requests(status);
CREATE INDEX IF NOT EXISTS idx_service_requests_technician ON service_requests(technician_id);

CREATE TABLE IF NOT EXISTS dispatch_offers (
    id BIGSERIAL PRIMARY KEY,
    service_request_id BIGINT NOT NULL REFERENCES service_requests(id),
    technician_id BIGINT NOT NULL REFERENCES technicians(id),
    status TEXT NOT NULL DEFAULT 'pending',
    sent_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dispatch_offers_request ON dispatch_offers(service_request_id);
CREATE INDEX IF NOT EXISTS idx_dispatch_offers_technician ON dispatch_offers(technician_id, status);

CREATE TABLE IF NOT EXISTS payments (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users(id),
    service_request_id BIGINT NOT NULL REFERENCES service_requests(id),
    payment_method TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING',
    amount DECIMAL(12,2) NOT NULL DEFAULT 0,
    platform_fee DECIMAL(12,2) NOT NULL DEFAULT 0,
    technician_amount DECIMAL(12,2) NOT NULL DEFAULT 0,
    is_settled BOOLEAN NOT NULL DEFAULT FALSE,
    razorpay_order_id TEXT,
    razorpay_payment_id TEXT,
    razorpay_signature TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_payments_order ON payments(razorpay_order_id);
CREATE INDEX IF NOT EXISTS idx_payments_request ON payments(service_request_id);

CREATE TABLE IF NOT EXISTS invoices (
    id BIGSERIAL PRIMARY KEY,
    service_request_id BIGINT NOT NULL REFERENCES service_requests(id),
    user_id BIGINT NOT NULL REFERENCES users(id),
    technician_id BIGINT REFERENCES technicians(id),
    base_amount DECIMAL(12,2) NOT NULL DEFAULT 0,
    platform_fee DECIMAL(12,2) NOT NULL DEFAULT 0,
    gst DECIMAL(12,2) NOT NULL DEFAULT 0,
    total_amount DECIMAL(12,2) NOT NULL DEFAULT 0,
    razorpay_order_id TEXT,
    razorpay_payment_id TEXT,
    pdf BYTEA,
    status TEXT NOT NULL DEFAULT 'GENERATED',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_invoices_order ON invoices(razorpay_order_id);
CREATE INDEX IF NOT EXISTS idx_invoices_payment ON invoices(razorpay_payment_id);

CREATE TABLE IF NOT EXISTS technician_dues (
    id BIGSERIAL PRIMARY KEY,
    technician_id BIGINT NOT NULL REFERENCES technicians(id),
    service_request_id BIGINT NOT NULL REFERENCES service_requests(id),
    amount DECIMAL(12,2) NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_technician_dues_technician ON technician_dues(technician_id, status);

CREATE TABLE IF NOT EXISTS platform_pricing_config (
    id BIGINT PRIMARY KEY,
    currency TEXT NOT NULL DEFAULT 'INR',
    platform_fee_percent DECIMAL(6,4) NOT NULL DEFAULT 0.10,
    welcome_coupon_code TEXT NOT NULL DEFAULT '',
    welcome_coupon_percent DECIMAL(6,4) NOT NULL DEFAULT 0,
    welcome_coupon_max_uses INTEGER NOT NULL DEFAULT 0,
    welcome_coupon_active BOOLEAN NOT NULL DEFAULT FALSE,
    booking_fee DECIMAL(12,2) NOT NULL DEFAULT 0,
    registration_fee DECIMAL(12,2) NOT NULL DEFAULT 0,
    pay_now_discount_percent DECIMAL(6,4) NOT NULL DEFAULT 0,
    default_service_amount DECIMAL(12,2) NOT NULL DEFAULT 500,
    service_base_prices JSONB NOT NULL DEFAULT '{}'::jsonb,
    subscription_plans JSONB NOT NULL DEFAULT '[]'::jsonb,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

/// Shared handle to the relational store.
///
/// Cheap to clone; all clones share one bounded connection pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connects the bounded pool. Transactions hold one connection for their
    /// lifetime and release it on commit or rollback.
    #[instrument(skip_all, err)]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Store { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the schema when absent. Idempotent.
    #[instrument(skip_all, err)]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    pub async fn user(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn technician(&self, id: i64) -> Result<Option<Technician>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM technicians WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Loads the full technician roster for candidate analysis.
    ///
    /// Eligibility filtering is brute-force over this set by design; the
    /// roster is small enough that no spatial index is warranted.
    pub async fn technicians_all(&self) -> Result<Vec<Technician>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM technicians ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn service_request(&self, id: i64) -> Result<Option<ServiceRequest>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM service_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn offers_for_request(
        &self,
        request_id: i64,
    ) -> Result<Vec<DispatchOffer>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM dispatch_offers WHERE service_request_id = $1 ORDER BY sent_at",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn pending_dues_for_technician(
        &self,
        technician_id: i64,
    ) -> Result<Vec<TechnicianDue>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM technician_dues
             WHERE technician_id = $1 AND status = 'pending'
             ORDER BY created_at",
        )
        .bind(technician_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Reads the pricing configuration row, if one exists.
    pub async fn load_pricing_config(&self) -> Result<Option<PricingConfig>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM platform_pricing_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let matrix_raw: Value = row.try_get("service_base_prices")?;
        let service_base_prices =
            serde_json::from_value(matrix_raw).map_err(|e| sqlx::Error::ColumnDecode {
                index: "service_base_prices".to_string(),
                source: Box::new(e),
            })?;
        let plans_raw: Value = row.try_get("subscription_plans")?;
        let subscription_plans: Vec<SubscriptionPlan> =
            serde_json::from_value(plans_raw).map_err(|e| sqlx::Error::ColumnDecode {
                index: "subscription_plans".to_string(),
                source: Box::new(e),
            })?;

        Ok(Some(PricingConfig {
            currency: row.try_get("currency")?,
            platform_fee_percent: row.try_get("platform_fee_percent")?,
            welcome_coupon: WelcomeCoupon {
                code: row.try_get("welcome_coupon_code")?,
                discount_percent: row.try_get("welcome_coupon_percent")?,
                max_uses_per_user: row.try_get("welcome_coupon_max_uses")?,
                active: row.try_get("welcome_coupon_active")?,
            },
            booking_fee: row.try_get("booking_fee")?,
            registration_fee: row.try_get("registration_fee")?,
            pay_now_discount_percent: row.try_get("pay_now_discount_percent")?,
            default_service_amount: row.try_get("default_service_amount")?,
            service_base_prices,
            subscription_plans,
        }))
    }

    /// Inserts the default configuration row if the table is still empty.
    pub async fn seed_pricing_config(&self, config: &PricingConfig) -> Result<(), sqlx::Error> {
        let matrix = serde_json::to_value(&config.service_base_prices)
            .unwrap_or_else(|_| Value::Object(Default::default()));
        let plans = serde_json::to_value(&config.subscription_plans)
            .unwrap_or_else(|_| Value::Array(Default::default()));
        sqlx::query(
            "INSERT INTO platform_pricing_config (
                id, currency, platform_fee_percent,
                welcome_coupon_code, welcome_coupon_percent,
                welcome_coupon_max_uses, welcome_coupon_active,
                booking_fee, registration_fee, pay_now_discount_percent,
                default_service_amount, service_base_prices, subscription_plans
             ) VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&config.currency)
        .bind(config.platform_fee_percent)
        .bind(&config.welcome_coupon.code)
        .bind(config.welcome_coupon.discount_percent)
        .bind(config.welcome_coupon.max_uses_per_user)
        .bind(config.welcome_coupon.active)
        .bind(config.booking_fee)
        .bind(config.registration_fee)
        .bind(config.pay_now_discount_percent)
        .bind(config.default_service_amount)
        .bind(matrix)
        .bind(plans)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
