//! Platform-wide pricing configuration with a TTL-cached accessor.
//!
//! The configuration is a singleton database row. Reads go through
//! [`PlatformPricing`], which caches a deep copy for a short TTL and seeds a
//! default row on first access when the backing table is empty. Admin edits
//! call [`PlatformPricing::invalidate`] so the next read refetches.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::instrument;

use crate::store::Store;

/// Rounds a monetary value to two decimal places, half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// The welcome coupon offered to new customers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WelcomeCoupon {
    pub code: String,
    pub discount_percent: Decimal,
    pub max_uses_per_user: i32,
    pub active: bool,
}

impl WelcomeCoupon {
    /// Whether the coupon can be applied by anyone at all.
    pub fn is_globally_active(&self) -> bool {
        self.active
            && !self.code.trim().is_empty()
            && self.discount_percent > Decimal::ZERO
            && self.max_uses_per_user > 0
    }
}

/// One entry of the subscription catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionPlan {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    pub duration_days: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The platform pricing configuration singleton.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PricingConfig {
    pub currency: String,
    pub platform_fee_percent: Decimal,
    pub welcome_coupon: WelcomeCoupon,
    pub booking_fee: Decimal,
    pub registration_fee: Decimal,
    pub pay_now_discount_percent: Decimal,
    pub default_service_amount: Decimal,
    /// domain slug -> vehicle slug -> base amount
    pub service_base_prices: BTreeMap<String, BTreeMap<String, Decimal>>,
    pub subscription_plans: Vec<SubscriptionPlan>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let mut matrix = BTreeMap::new();
        let rows: [(&str, [(&str, i64); 4]); 9] = [
            ("towing", [("car", 999), ("bike", 599), ("commercial", 1999), ("ev", 1199)]),
            ("flat-tire", [("car", 399), ("bike", 199), ("commercial", 799), ("ev", 449)]),
            ("battery", [("car", 499), ("bike", 299), ("commercial", 899), ("ev", 649)]),
            ("mechanical", [("car", 599), ("bike", 349), ("commercial", 1199), ("ev", 699)]),
            ("fuel", [("car", 349), ("bike", 249), ("commercial", 599), ("ev", 349)]),
            ("lockout", [("car", 449), ("bike", 249), ("commercial", 699), ("ev", 499)]),
            ("winching", [("car", 899), ("bike", 499), ("commercial", 1799), ("ev", 999)]),
            ("ev-charging", [("car", 549), ("bike", 349), ("commercial", 899), ("ev", 549)]),
            ("other", [("car", 499), ("bike", 299), ("commercial", 999), ("ev", 549)]),
        ];
        for (domain, prices) in rows {
            let row = prices
                .into_iter()
                .map(|(vehicle, amount)| (vehicle.to_string(), Decimal::from(amount)))
                .collect();
            matrix.insert(domain.to_string(), row);
        }
        PricingConfig {
            currency: "INR".to_string(),
            platform_fee_percent: Decimal::new(10, 2),
            welcome_coupon: WelcomeCoupon {
                code: "RESQ10".to_string(),
                discount_percent: Decimal::new(10, 2),
                max_uses_per_user: 2,
                active: true,
            },
            booking_fee: Decimal::from(49),
            registration_fee: Decimal::from(999),
            pay_now_discount_percent: Decimal::new(5, 2),
            default_service_amount: Decimal::from(500),
            service_base_prices: matrix,
            subscription_plans: vec![
                SubscriptionPlan {
                    id: "basic-monthly".to_string(),
                    name: "Basic".to_string(),
                    price: Decimal::from(199),
                    duration_days: 30,
                    description: None,
                },
                SubscriptionPlan {
                    id: "plus-yearly".to_string(),
                    name: "Plus".to_string(),
                    price: Decimal::from(1499),
                    duration_days: 365,
                    description: None,
                },
            ],
        }
    }
}

/// The platform fee breakdown for one payment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAmounts {
    pub currency: String,
    pub base_amount: Decimal,
    pub platform_fee_percent: Decimal,
    pub original_platform_fee: Decimal,
    pub discount_amount: Decimal,
    pub platform_fee: Decimal,
    pub total_amount: Decimal,
}

/// Computes the fee breakdown for a base amount.
///
/// The discount applies to the platform fee, never the base. An explicit
/// discount amount overrides the percent form; the resulting fee is floored
/// at zero. All intermediate values are rounded half-away-from-zero to two
/// decimal places.
pub fn compute_payment_amounts(
    base_amount: Decimal,
    config: &PricingConfig,
    discount_percent: Option<Decimal>,
    discount_amount: Option<Decimal>,
) -> PaymentAmounts {
    let base = round_money(base_amount);
    let original_platform_fee = round_money(base * config.platform_fee_percent);
    let discount = match discount_amount {
        Some(amount) => round_money(amount),
        None => match discount_percent {
            Some(percent) => round_money(original_platform_fee * percent),
            None => Decimal::ZERO,
        },
    };
    let platform_fee = round_money((original_platform_fee - discount).max(Decimal::ZERO));
    let total_amount = round_money(base + platform_fee);
    PaymentAmounts {
        currency: config.currency.clone(),
        base_amount: base,
        platform_fee_percent: config.platform_fee_percent,
        original_platform_fee,
        discount_amount: discount,
        platform_fee,
        total_amount,
    }
}

/// Looks up the service-matrix base amount for a (domain, vehicle) pair.
///
/// Falls back to the `other` domain row, then to the platform default.
pub fn service_matrix_amount(domain: &str, vehicle: &str, config: &PricingConfig) -> Decimal {
    let lookup = |row: &BTreeMap<String, Decimal>| row.get(vehicle).copied();
    config
        .service_base_prices
        .get(domain)
        .and_then(lookup)
        .or_else(|| config.service_base_prices.get("other").and_then(lookup))
        .unwrap_or(config.default_service_amount)
}

struct CacheEntry {
    loaded_at: Instant,
    config: PricingConfig,
}

/// TTL-cached accessor for the pricing configuration singleton.
///
/// Callers always receive an owned deep copy, so nothing downstream can
/// mutate the cached state.
#[derive(Clone)]
pub struct PlatformPricing {
    store: Store,
    ttl: Duration,
    cached: Arc<RwLock<Option<CacheEntry>>>,
}

impl PlatformPricing {
    pub fn new(store: Store, ttl: Duration) -> Self {
        PlatformPricing {
            store,
            ttl,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    /// Returns the current configuration, from cache when fresh.
    pub async fn get(&self) -> Result<PricingConfig, sqlx::Error> {
        self.get_with(false).await
    }

    #[instrument(skip_all, err)]
    pub async fn get_with(&self, force_refresh: bool) -> Result<PricingConfig, sqlx::Error> {
        if !force_refresh {
            let guard = self.cached.read().await;
            if let Some(entry) = guard.as_ref()
                && entry.loaded_at.elapsed() < self.ttl
            {
                return Ok(entry.config.clone());
            }
        }

        let mut guard = self.cached.write().await;
        // Another task may have refreshed while we waited for the lock.
        if !force_refresh
            && let Some(entry) = guard.as_ref()
            && entry.loaded_at.elapsed() < self.ttl
        {
            return Ok(entry.config.clone());
        }

        let config = self.load_or_seed().await?;
        *guard = Some(CacheEntry {
            loaded_at: Instant::now(),
            config: config.clone(),
        });
        Ok(config)
    }

    /// Drops the cached copy; the next read refetches from the store.
    pub async fn invalidate(&self) {
        let mut guard = self.cached.write().await;
        *guard = None;
    }

    async fn load_or_seed(&self) -> Result<PricingConfig, sqlx::Error> {
        match self.store.load_pricing_config().await? {
            Some(config) => Ok(config),
            None => {
                let config = PricingConfig::default();
                self.store.seed_pricing_config(&config).await?;
                tracing::info!("Seeded default platform pricing configuration");
                Ok(config)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_half_away_from_zero() {
        let cases = [
            ("2.005", "2.01"),
            ("2.004", "2.00"),
            ("-2.005", "-2.01"),
            ("49.995", "50.00"),
        ];
        for (input, expected) in cases {
            let input: Decimal = input.parse().unwrap();
            let expected: Decimal = expected.parse().unwrap();
            assert_eq!(round_money(input), expected, "rounding {input}");
        }
    }

    #[test]
    fn test_fee_breakdown_without_discount() {
        let config = PricingConfig::default();
        let amounts = compute_payment_amounts(Decimal::from(500), &config, None, None);
        assert_eq!(amounts.original_platform_fee, Decimal::from(50));
        assert_eq!(amounts.discount_amount, Decimal::ZERO);
        assert_eq!(amounts.platform_fee, Decimal::from(50));
        assert_eq!(amounts.total_amount, Decimal::from(550));
        assert_eq!(amounts.currency, "INR");
    }

    #[test]
    fn test_fee_breakdown_with_percent_discount() {
        // First-use coupon seed: base 500, fee 10%, coupon 10% of the fee.
        let config = PricingConfig::default();
        let amounts = compute_payment_amounts(
            Decimal::from(500),
            &config,
            Some(Decimal::new(10, 2)),
            None,
        );
        assert_eq!(amounts.original_platform_fee, Decimal::from(50));
        assert_eq!(amounts.discount_amount, Decimal::from(5));
        assert_eq!(amounts.platform_fee, Decimal::from(45));
        assert_eq!(amounts.total_amount, Decimal::from(545));
    }

    #[test]
    fn test_explicit_discount_amount_overrides_percent() {
        let config = PricingConfig::default();
        let amounts = compute_payment_amounts(
            Decimal::from(500),
            &config,
            Some(Decimal::new(10, 2)),
            Some(Decimal::from(20)),
        );
        assert_eq!(amounts.discount_amount, Decimal::from(20));
        assert_eq!(amounts.platform_fee, Decimal::from(30));
        assert_eq!(amounts.total_amount, Decimal::from(530));
    }

    #[test]
    fn test_discount_never_drives_fee_negative() {
        let config = PricingConfig::default();
        let amounts = compute_payment_amounts(
            Decimal::from(100),
            &config,
            None,
            Some(Decimal::from(500)),
        );
        assert_eq!(amounts.platform_fee, Decimal::ZERO);
        assert_eq!(amounts.total_amount, Decimal::from(100));
    }

    #[test]
    fn test_service_matrix_lookup_chain() {
        let config = PricingConfig::default();
        assert_eq!(
            service_matrix_amount("towing", "car", &config),
            Decimal::from(999)
        );
        // Unknown domain falls back to the "other" row.
        assert_eq!(
            service_matrix_amount("helicopter-rescue", "bike", &config),
            Decimal::from(299)
        );
        // Unknown vehicle in both rows falls back to the default amount.
        assert_eq!(
            service_matrix_amount("towing", "hovercraft", &config),
            config.default_service_amount
        );
    }

    #[test]
    fn test_welcome_coupon_activation_gate() {
        let mut coupon = PricingConfig::default().welcome_coupon;
        assert!(coupon.is_globally_active());
        coupon.active = false;
        assert!(!coupon.is_globally_active());
        coupon.active = true;
        coupon.max_uses_per_user = 0;
        assert!(!coupon.is_globally_active());
        coupon.max_uses_per_user = 2;
        coupon.discount_percent = Decimal::ZERO;
        assert!(!coupon.is_globally_active());
    }
}
