//! Pricing: the platform-wide configuration cache and the per-request
//! amount resolution chain.
//!
//! A request's base amount is resolved in priority order: the assigned
//! technician's own pricing structures, any positive amount already stored on
//! the request, then the platform's service-price matrix.

mod config;
mod resolver;

pub use config::{
    PaymentAmounts, PlatformPricing, PricingConfig, SubscriptionPlan, WelcomeCoupon,
    compute_payment_amounts, round_money, service_matrix_amount,
};
pub use resolver::technician_quoted_amount;

use rust_decimal::Decimal;

use crate::normalize::split_service_type;
use crate::types::{ServiceRequest, Technician};

/// Resolves the base amount for a request.
///
/// Falls through technician pricing, the stored request amount, and finally
/// the platform service matrix; the matrix lookup always yields a value, so
/// this function is total.
pub fn resolve_base_amount(
    request: &ServiceRequest,
    technician: Option<&Technician>,
    config: &PricingConfig,
) -> Decimal {
    let (vehicle, domain) = split_service_type(&request.service_type);

    if let Some(technician) = technician
        && let Some(domain) = domain.known()
        && let Some(amount) = technician_quoted_amount(technician, domain, vehicle.known())
    {
        return amount;
    }

    if let Some(amount) = positive(request.amount) {
        return amount;
    }
    if let Some(amount) = positive(request.service_charge) {
        return amount;
    }

    service_matrix_amount(domain.as_slug(), vehicle.as_slug(), config)
}

fn positive(amount: Option<Decimal>) -> Option<Decimal> {
    amount.filter(|a| a.is_sign_positive() && !a.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApprovalStatus, RequestPaymentStatus, RequestStatus};
    use chrono::Utc;

    fn request(amount: Option<Decimal>) -> ServiceRequest {
        let now = Utc::now();
        ServiceRequest {
            id: 1,
            user_id: 1,
            technician_id: None,
            service_type: "car-towing".to_string(),
            vehicle_type: "car".to_string(),
            address: "MG Road".to_string(),
            lat: Some(11.0),
            lng: Some(76.9),
            contact_name: None,
            contact_phone: None,
            amount,
            service_charge: None,
            applied_coupon_code: None,
            coupon_discount_percent: None,
            coupon_discount_amount: None,
            payment_status: RequestPaymentStatus::Pending,
            payment_method: None,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        }
    }

    fn technician(pricing: serde_json::Value) -> Technician {
        Technician {
            id: 2,
            name: "Ravi".to_string(),
            phone: None,
            email: None,
            approval_status: ApprovalStatus::Approved,
            is_active: true,
            is_available: true,
            lat: Some(11.01),
            lng: Some(76.92),
            service_area_range_km: 20,
            service_type: Some("towing".to_string()),
            specialties: serde_json::Value::Null,
            vehicle_types: serde_json::json!(["car"]),
            pricing,
            service_costs: serde_json::Value::Null,
            jobs_completed: 0,
            total_earnings: Decimal::ZERO,
            rating: Decimal::ZERO,
        }
    }

    #[test]
    fn test_technician_pricing_wins() {
        let config = PricingConfig::default();
        let technician = technician(serde_json::json!({
            "towing": {"car": {"base_charge": 750}}
        }));
        let amount = resolve_base_amount(&request(Some(Decimal::from(500))), Some(&technician), &config);
        assert_eq!(amount, Decimal::from(750));
    }

    #[test]
    fn test_request_amount_next() {
        let config = PricingConfig::default();
        let technician = technician(serde_json::json!({"lockout": {"price": 300}}));
        let amount = resolve_base_amount(&request(Some(Decimal::from(500))), Some(&technician), &config);
        assert_eq!(amount, Decimal::from(500));
    }

    #[test]
    fn test_matrix_fallback_last() {
        let config = PricingConfig::default();
        let amount = resolve_base_amount(&request(None), None, &config);
        assert_eq!(
            amount,
            service_matrix_amount("towing", "car", &config),
        );
    }

    #[test]
    fn test_zero_request_amount_is_ignored() {
        let config = PricingConfig::default();
        let amount = resolve_base_amount(&request(Some(Decimal::ZERO)), None, &config);
        assert_eq!(amount, service_matrix_amount("towing", "car", &config));
    }
}
