//! Extraction of amounts from free-form technician pricing structures.
//!
//! Technician profiles carry heterogeneous JSON under `pricing` and
//! `service_costs`: maps keyed by service names, arrays of entries, nested
//! vehicle sub-maps, stringified numbers with currency symbols. The walk here
//! views every node through the tagged [`PricingNode`] classification and
//! never trusts the source shape.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use crate::normalize::{
    CanonicalDomain, CanonicalVehicle, ServiceDomain, VehicleFamily, canonicalize_service_domain,
    canonicalize_vehicle_type,
};
use crate::types::Technician;

/// Maximum nesting depth the walk will follow.
const MAX_DEPTH: usize = 8;

/// Keys that directly carry a price, in preference order.
const PRICE_KEYS: [&str; 8] = [
    "base_charge",
    "service_charge",
    "price",
    "amount",
    "cost",
    "charge",
    "base_price",
    "rate",
];

/// Keys that carry descriptive metadata, never prices.
const METADATA_KEYS: [&str; 12] = [
    "description",
    "notes",
    "note",
    "work_included",
    "free_distance",
    "unit",
    "currency",
    "label",
    "title",
    "duration",
    "eta",
    "terms",
];

/// Fields of an array entry that may name the service it prices.
const ENTRY_NAME_KEYS: [&str; 4] = ["service", "service_type", "name", "type"];

/// A typed view over one node of a pricing structure.
enum PricingNode<'a> {
    /// A usable positive amount.
    Amount(Decimal),
    /// A nested map of keys to price data.
    Branch(&'a serde_json::Map<String, Value>),
    /// A list of pricing entries.
    List(&'a Vec<Value>),
    /// Nothing extractable (null, bool, negative, non-numeric text).
    Leaf,
}

static NON_NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d.\-]+").expect("valid regex"));

impl<'a> PricingNode<'a> {
    fn classify(value: &'a Value) -> PricingNode<'a> {
        match value {
            Value::Number(n) => match Decimal::from_str(&n.to_string()) {
                Ok(amount) if amount > Decimal::ZERO => PricingNode::Amount(amount),
                _ => PricingNode::Leaf,
            },
            Value::String(text) => {
                // Strings like "₹1,200" or "350.00" carry amounts; anything
                // that cleans down to an empty or non-positive value does not.
                let cleaned = NON_NUMERIC.replace_all(text, "").to_string();
                match Decimal::from_str(&cleaned) {
                    Ok(amount) if amount > Decimal::ZERO => PricingNode::Amount(amount),
                    _ => PricingNode::Leaf,
                }
            }
            Value::Object(map) => PricingNode::Branch(map),
            Value::Array(entries) => PricingNode::List(entries),
            _ => PricingNode::Leaf,
        }
    }
}

/// Resolves a technician's own quote for a service domain, preferring a
/// vehicle-family-matched price when the structure distinguishes vehicles.
///
/// Checks `pricing` first, then `service_costs`. Returns `None` when no
/// positive amount can be derived; the caller then falls back to the request
/// amount or the platform matrix.
pub fn technician_quoted_amount(
    technician: &Technician,
    domain: ServiceDomain,
    vehicle: Option<VehicleFamily>,
) -> Option<Decimal> {
    find_domain_amount(&technician.pricing, domain, vehicle, 0)
        .or_else(|| find_domain_amount(&technician.service_costs, domain, vehicle, 0))
}

/// Locates the subtree priced for `domain` and extracts an amount from it.
fn find_domain_amount(
    value: &Value,
    domain: ServiceDomain,
    vehicle: Option<VehicleFamily>,
    depth: usize,
) -> Option<Decimal> {
    if depth > MAX_DEPTH {
        return None;
    }
    match PricingNode::classify(value) {
        PricingNode::Branch(map) => {
            for (key, entry) in map {
                if is_metadata_key(key) {
                    continue;
                }
                if matches_domain(key, domain) {
                    if let Some(amount) = extract_amount(entry, vehicle, depth + 1) {
                        return Some(amount);
                    }
                }
            }
            // No directly keyed entry: descend into nested containers.
            for (key, entry) in map {
                if is_metadata_key(key) {
                    continue;
                }
                if let Some(amount) = find_domain_amount(entry, domain, vehicle, depth + 1) {
                    return Some(amount);
                }
            }
            None
        }
        PricingNode::List(entries) => {
            for entry in entries {
                if let Value::Object(map) = entry {
                    let named_for_domain = ENTRY_NAME_KEYS.iter().any(|key| {
                        matches!(map.get(*key), Some(Value::String(name)) if matches_domain(name, domain))
                    });
                    if named_for_domain {
                        if let Some(amount) = extract_amount(entry, vehicle, depth + 1) {
                            return Some(amount);
                        }
                    }
                }
            }
            for entry in entries {
                if let Some(amount) = find_domain_amount(entry, domain, vehicle, depth + 1) {
                    return Some(amount);
                }
            }
            None
        }
        _ => None,
    }
}

/// Extracts a price from a subtree already scoped to the right domain.
///
/// Preference order: a vehicle-family-matched node, then the generic price
/// keys, then any nested non-metadata amount.
fn extract_amount(value: &Value, vehicle: Option<VehicleFamily>, depth: usize) -> Option<Decimal> {
    if depth > MAX_DEPTH {
        return None;
    }
    match PricingNode::classify(value) {
        PricingNode::Amount(amount) => Some(amount),
        PricingNode::Branch(map) => {
            if let Some(vehicle) = vehicle {
                for (key, entry) in map {
                    if matches_vehicle(key, vehicle)
                        && let Some(amount) = extract_amount(entry, Some(vehicle), depth + 1)
                    {
                        return Some(amount);
                    }
                }
            }
            for price_key in PRICE_KEYS {
                if let Some(entry) = map.get(price_key)
                    && let PricingNode::Amount(amount) = PricingNode::classify(entry)
                {
                    return Some(amount);
                }
            }
            for (key, entry) in map {
                if is_metadata_key(key) || key_is_vehicle(key) {
                    continue;
                }
                if let Some(amount) = extract_amount(entry, vehicle, depth + 1) {
                    return Some(amount);
                }
            }
            None
        }
        PricingNode::List(entries) => entries
            .iter()
            .find_map(|entry| extract_amount(entry, vehicle, depth + 1)),
        PricingNode::Leaf => None,
    }
}

fn is_metadata_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    METADATA_KEYS.iter().any(|m| lowered == *m)
}

fn matches_domain(key: &str, domain: ServiceDomain) -> bool {
    matches!(canonicalize_service_domain(key), CanonicalDomain::Known(found) if found == domain)
}

fn matches_vehicle(key: &str, vehicle: VehicleFamily) -> bool {
    matches!(canonicalize_vehicle_type(key), CanonicalVehicle::Known(found) if found == vehicle)
}

fn key_is_vehicle(key: &str) -> bool {
    matches!(canonicalize_vehicle_type(key), CanonicalVehicle::Known(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ApprovalStatus;
    use serde_json::json;

    fn technician(pricing: Value, service_costs: Value) -> Technician {
        Technician {
            id: 2,
            name: "Ravi".to_string(),
            phone: None,
            email: None,
            approval_status: ApprovalStatus::Approved,
            is_active: true,
            is_available: true,
            lat: None,
            lng: None,
            service_area_range_km: 10,
            service_type: None,
            specialties: Value::Null,
            vehicle_types: Value::Null,
            pricing,
            service_costs,
            jobs_completed: 0,
            total_earnings: Decimal::ZERO,
            rating: Decimal::ZERO,
        }
    }

    #[test]
    fn test_vehicle_scoped_price_preferred() {
        let technician = technician(
            json!({
                "towing": {
                    "description": "flatbed up to 3t",
                    "car": {"base_charge": 800},
                    "bike": {"base_charge": 400},
                    "price": 650
                }
            }),
            Value::Null,
        );
        assert_eq!(
            technician_quoted_amount(&technician, ServiceDomain::Towing, Some(VehicleFamily::Car)),
            Some(Decimal::from(800))
        );
        assert_eq!(
            technician_quoted_amount(&technician, ServiceDomain::Towing, Some(VehicleFamily::Bike)),
            Some(Decimal::from(400))
        );
        // Unlisted family falls back to the generic price key.
        assert_eq!(
            technician_quoted_amount(&technician, ServiceDomain::Towing, Some(VehicleFamily::Ev)),
            Some(Decimal::from(650))
        );
    }

    #[test]
    fn test_domain_aliases_in_keys() {
        let technician = technician(
            json!({"Jump Start": {"price": "₹350"}}),
            Value::Null,
        );
        assert_eq!(
            technician_quoted_amount(&technician, ServiceDomain::Battery, None),
            Some(Decimal::from(350))
        );
    }

    #[test]
    fn test_array_entries_with_name_fields() {
        let technician = technician(
            Value::Null,
            json!([
                {"service": "flat tyre", "amount": 250, "notes": "tube extra"},
                {"service": "towing", "amount": 900}
            ]),
        );
        assert_eq!(
            technician_quoted_amount(&technician, ServiceDomain::FlatTire, None),
            Some(Decimal::from(250))
        );
        assert_eq!(
            technician_quoted_amount(&technician, ServiceDomain::Towing, None),
            Some(Decimal::from(900))
        );
    }

    #[test]
    fn test_metadata_keys_are_skipped() {
        let technician = technician(
            json!({
                "towing": {
                    "free_distance": 5,
                    "work_included": "loading",
                    "base_charge": 700
                }
            }),
            Value::Null,
        );
        assert_eq!(
            technician_quoted_amount(&technician, ServiceDomain::Towing, None),
            Some(Decimal::from(700))
        );
    }

    #[test]
    fn test_missing_domain_returns_none() {
        let technician = technician(json!({"lockout": {"price": 300}}), Value::Null);
        assert_eq!(
            technician_quoted_amount(&technician, ServiceDomain::Fuel, None),
            None
        );
    }

    #[test]
    fn test_depth_bound() {
        // Deeper than the walk limit: the amount must not be found.
        let mut node = json!({"base_charge": 500});
        for _ in 0..10 {
            node = json!({"nested": node});
        }
        let technician = technician(json!({"towing": node}), Value::Null);
        assert_eq!(
            technician_quoted_amount(&technician, ServiceDomain::Towing, None),
            None
        );
    }

    #[test]
    fn test_non_positive_amounts_rejected() {
        let technician = technician(
            json!({"towing": {"price": 0, "amount": -50, "cost": "N/A"}}),
            Value::Null,
        );
        assert_eq!(
            technician_quoted_amount(&technician, ServiceDomain::Towing, None),
            None
        );
    }
}
