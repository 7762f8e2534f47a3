//! Welcome-coupon evaluation.
//!
//! The coupon is capped per user: completed (paid) services and live
//! reservations on other open requests both consume uses. The decision here
//! is pure; callers supply the counts.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::pricing::WelcomeCoupon;

/// Observed coupon consumption for one user, relative to one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct CouponUsage {
    /// Other requests by this user that reached a paid state.
    pub completed_services: i64,
    /// Other open, non-cancelled requests that reserved this coupon.
    pub reserved_elsewhere: i64,
    /// Whether the request under evaluation already reserved the coupon.
    pub request_has_reservation: bool,
}

impl CouponUsage {
    pub fn remaining_uses(&self, coupon: &WelcomeCoupon) -> i64 {
        (coupon.max_uses_per_user as i64 - self.completed_services - self.reserved_elsewhere)
            .max(0)
    }
}

/// Outcome of evaluating a coupon for a quote or order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum CouponDecision {
    /// No code provided and nothing already reserved.
    NotRequested,
    Applied {
        code: String,
        discount_percent: Decimal,
        remaining_uses: i64,
    },
    Refused {
        reason: String,
    },
}

impl CouponDecision {
    pub fn discount_percent(&self) -> Option<Decimal> {
        match self {
            CouponDecision::Applied {
                discount_percent, ..
            } => Some(*discount_percent),
            _ => None,
        }
    }

    pub fn refusal_reason(&self) -> Option<&str> {
        match self {
            CouponDecision::Refused { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Evaluates the welcome coupon for a request.
///
/// With no code provided, an existing reservation on the request is kept
/// (when `preserve_existing_applied` is set and the coupon is still active).
/// A provided code must match the configured one, the coupon must be active,
/// and the user must have uses left unless this request already holds one.
pub fn evaluate_welcome_coupon(
    coupon: &WelcomeCoupon,
    provided_code: Option<&str>,
    usage: &CouponUsage,
    preserve_existing_applied: bool,
) -> CouponDecision {
    let provided = provided_code.map(str::trim).filter(|code| !code.is_empty());

    let Some(code) = provided else {
        if preserve_existing_applied
            && usage.request_has_reservation
            && coupon.is_globally_active()
        {
            return CouponDecision::Applied {
                code: coupon.code.clone(),
                discount_percent: coupon.discount_percent,
                remaining_uses: usage.remaining_uses(coupon),
            };
        }
        return CouponDecision::NotRequested;
    };

    if !code.eq_ignore_ascii_case(&coupon.code) {
        return CouponDecision::Refused {
            reason: "Invalid coupon code.".to_string(),
        };
    }
    if !coupon.is_globally_active() {
        return CouponDecision::Refused {
            reason: "This coupon is currently inactive.".to_string(),
        };
    }
    if !usage.request_has_reservation && usage.remaining_uses(coupon) == 0 {
        return CouponDecision::Refused {
            reason: format!(
                "Coupon is valid only for your first {} paid services.",
                coupon.max_uses_per_user
            ),
        };
    }
    CouponDecision::Applied {
        code: coupon.code.clone(),
        discount_percent: coupon.discount_percent,
        remaining_uses: usage.remaining_uses(coupon),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coupon() -> WelcomeCoupon {
        WelcomeCoupon {
            code: "RESQ10".to_string(),
            discount_percent: Decimal::new(10, 2),
            max_uses_per_user: 2,
            active: true,
        }
    }

    fn fresh_user() -> CouponUsage {
        CouponUsage::default()
    }

    #[test]
    fn test_first_use_applies() {
        let decision = evaluate_welcome_coupon(&coupon(), Some("RESQ10"), &fresh_user(), true);
        assert_eq!(
            decision,
            CouponDecision::Applied {
                code: "RESQ10".to_string(),
                discount_percent: Decimal::new(10, 2),
                remaining_uses: 2,
            }
        );
    }

    #[test]
    fn test_wrong_code_refused() {
        let decision = evaluate_welcome_coupon(&coupon(), Some("OTHER5"), &fresh_user(), true);
        assert_eq!(decision.refusal_reason(), Some("Invalid coupon code."));
    }

    #[test]
    fn test_inactive_coupon_refused() {
        let mut inactive = coupon();
        inactive.active = false;
        let decision = evaluate_welcome_coupon(&inactive, Some("RESQ10"), &fresh_user(), true);
        assert_eq!(
            decision.refusal_reason(),
            Some("This coupon is currently inactive.")
        );
    }

    #[test]
    fn test_cap_counts_completed_and_reserved() {
        // One paid service and one live reservation exhaust a cap of two.
        let usage = CouponUsage {
            completed_services: 1,
            reserved_elsewhere: 1,
            request_has_reservation: false,
        };
        let decision = evaluate_welcome_coupon(&coupon(), Some("RESQ10"), &usage, true);
        assert_eq!(
            decision.refusal_reason(),
            Some("Coupon is valid only for your first 2 paid services.")
        );
    }

    #[test]
    fn test_one_use_left_after_one_paid_service() {
        let usage = CouponUsage {
            completed_services: 1,
            reserved_elsewhere: 0,
            request_has_reservation: false,
        };
        let decision = evaluate_welcome_coupon(&coupon(), Some("RESQ10"), &usage, true);
        assert_eq!(
            decision,
            CouponDecision::Applied {
                code: "RESQ10".to_string(),
                discount_percent: Decimal::new(10, 2),
                remaining_uses: 1,
            }
        );
    }

    #[test]
    fn test_own_reservation_survives_exhausted_cap() {
        // The request already holds the coupon; re-evaluating must not refuse
        // it just because other requests consumed the remaining uses.
        let usage = CouponUsage {
            completed_services: 2,
            reserved_elsewhere: 0,
            request_has_reservation: true,
        };
        let decision = evaluate_welcome_coupon(&coupon(), Some("RESQ10"), &usage, true);
        assert!(matches!(decision, CouponDecision::Applied { .. }));
    }

    #[test]
    fn test_no_code_preserves_existing_reservation() {
        let usage = CouponUsage {
            completed_services: 0,
            reserved_elsewhere: 0,
            request_has_reservation: true,
        };
        let decision = evaluate_welcome_coupon(&coupon(), None, &usage, true);
        assert!(matches!(decision, CouponDecision::Applied { .. }));

        let decision = evaluate_welcome_coupon(&coupon(), None, &usage, false);
        assert_eq!(decision, CouponDecision::NotRequested);
    }

    #[test]
    fn test_no_code_no_reservation_is_not_requested() {
        let decision = evaluate_welcome_coupon(&coupon(), None, &fresh_user(), true);
        assert_eq!(decision, CouponDecision::NotRequested);
    }
}
