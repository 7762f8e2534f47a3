//! Canonicalization of free-form service and vehicle descriptions.
//!
//! User and technician profiles arrive with arbitrary strings ("Jump Start",
//! "flat tyre", "2 wheeler") that must be reduced to a closed vocabulary
//! before any dispatch decision is made. Every downstream comparison operates
//! on the canonical forms produced here; raw input strings never reach the
//! matching logic.
//!
//! Canonical service domains: towing, flat-tire, battery, mechanical, fuel,
//! lockout, winching, ev-charging, other. Canonical vehicle families: car,
//! bike, commercial, ev.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Display;

/// A member of the closed service-domain vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceDomain {
    Towing,
    FlatTire,
    Battery,
    Mechanical,
    Fuel,
    Lockout,
    Winching,
    EvCharging,
    Other,
}

impl ServiceDomain {
    pub const ALL: [ServiceDomain; 9] = [
        ServiceDomain::Towing,
        ServiceDomain::FlatTire,
        ServiceDomain::Battery,
        ServiceDomain::Mechanical,
        ServiceDomain::Fuel,
        ServiceDomain::Lockout,
        ServiceDomain::Winching,
        ServiceDomain::EvCharging,
        ServiceDomain::Other,
    ];

    pub fn as_slug(&self) -> &'static str {
        match self {
            ServiceDomain::Towing => "towing",
            ServiceDomain::FlatTire => "flat-tire",
            ServiceDomain::Battery => "battery",
            ServiceDomain::Mechanical => "mechanical",
            ServiceDomain::Fuel => "fuel",
            ServiceDomain::Lockout => "lockout",
            ServiceDomain::Winching => "winching",
            ServiceDomain::EvCharging => "ev-charging",
            ServiceDomain::Other => "other",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.as_slug() == slug)
    }
}

impl Display for ServiceDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_slug())
    }
}

/// A member of the closed vehicle-family vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleFamily {
    Car,
    Bike,
    Commercial,
    Ev,
}

impl VehicleFamily {
    pub const ALL: [VehicleFamily; 4] = [
        VehicleFamily::Car,
        VehicleFamily::Bike,
        VehicleFamily::Commercial,
        VehicleFamily::Ev,
    ];

    pub fn as_slug(&self) -> &'static str {
        match self {
            VehicleFamily::Car => "car",
            VehicleFamily::Bike => "bike",
            VehicleFamily::Commercial => "commercial",
            VehicleFamily::Ev => "ev",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_slug() == slug)
    }
}

impl Display for VehicleFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_slug())
    }
}

/// Outcome of canonicalizing a free-form service description.
///
/// Unmapped inputs fail soft: they keep a kebab-cased form of the normalized
/// text, which later dispatch stages reject with an `invalid_service_domain`
/// verdict instead of an upfront error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalDomain {
    Known(ServiceDomain),
    Unmapped(String),
}

impl CanonicalDomain {
    pub fn known(&self) -> Option<ServiceDomain> {
        match self {
            CanonicalDomain::Known(domain) => Some(*domain),
            CanonicalDomain::Unmapped(_) => None,
        }
    }

    pub fn as_slug(&self) -> &str {
        match self {
            CanonicalDomain::Known(domain) => domain.as_slug(),
            CanonicalDomain::Unmapped(slug) => slug,
        }
    }
}

impl Display for CanonicalDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_slug())
    }
}

/// Outcome of canonicalizing a free-form vehicle description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalVehicle {
    Known(VehicleFamily),
    Unmapped(String),
}

impl CanonicalVehicle {
    pub fn known(&self) -> Option<VehicleFamily> {
        match self {
            CanonicalVehicle::Known(family) => Some(*family),
            CanonicalVehicle::Unmapped(_) => None,
        }
    }

    pub fn as_slug(&self) -> &str {
        match self {
            CanonicalVehicle::Known(family) => family.as_slug(),
            CanonicalVehicle::Unmapped(slug) => slug,
        }
    }
}

impl Display for CanonicalVehicle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_slug())
    }
}

const SERVICE_ALIASES: [(ServiceDomain, &[&str]); 9] = [
    (
        ServiceDomain::Towing,
        &[
            "tow",
            "towing",
            "tow truck",
            "towing service",
            "flatbed",
            "flatbed towing",
            "vehicle towing",
            "accident towing",
            "recovery",
        ],
    ),
    (
        ServiceDomain::FlatTire,
        &[
            "flat",
            "flat tire",
            "flat tyre",
            "tire",
            "tyre",
            "puncture",
            "tire change",
            "tyre change",
            "tyre puncture",
            "wheel change",
            "stepney",
        ],
    ),
    (
        ServiceDomain::Battery,
        &[
            "battery",
            "jump",
            "jump start",
            "jumpstart",
            "dead battery",
            "battery jump start",
            "battery replacement",
            "battery boost",
        ],
    ),
    (
        ServiceDomain::Mechanical,
        &[
            "mechanical",
            "mechanic",
            "repair",
            "breakdown",
            "engine repair",
            "on site repair",
            "onsite repair",
            "minor repair",
            "general repair",
        ],
    ),
    (
        ServiceDomain::Fuel,
        &[
            "fuel",
            "fuel delivery",
            "petrol",
            "diesel",
            "out of fuel",
            "fuel refill",
            "emergency fuel",
        ],
    ),
    (
        ServiceDomain::Lockout,
        &[
            "lockout",
            "lock out",
            "locked out",
            "keys locked",
            "key lockout",
            "unlock",
            "car unlock",
            "key recovery",
        ],
    ),
    (
        ServiceDomain::Winching,
        &[
            "winching",
            "winch",
            "winch out",
            "ditch",
            "ditch pull",
            "stuck vehicle",
            "mud recovery",
            "off road recovery",
        ],
    ),
    (
        ServiceDomain::EvCharging,
        &[
            "ev",
            "ev charging",
            "ev charge",
            "charging",
            "mobile charging",
            "electric charging",
            "electric vehicle charging",
            "portable charging",
        ],
    ),
    (
        ServiceDomain::Other,
        &["other", "misc", "general", "assistance", "roadside assistance"],
    ),
];

const VEHICLE_ALIASES: [(VehicleFamily, &[&str]); 4] = [
    (
        VehicleFamily::Car,
        &[
            "car",
            "sedan",
            "hatchback",
            "suv",
            "auto",
            "4 wheeler",
            "four wheeler",
            "passenger car",
        ],
    ),
    (
        VehicleFamily::Bike,
        &[
            "bike",
            "motorcycle",
            "motorbike",
            "scooter",
            "moped",
            "2 wheeler",
            "two wheeler",
        ],
    ),
    (
        VehicleFamily::Commercial,
        &[
            "commercial",
            "truck",
            "bus",
            "van",
            "lorry",
            "tempo",
            "heavy vehicle",
            "6 wheeler",
            "commercial vehicle",
        ],
    ),
    (
        VehicleFamily::Ev,
        &["ev", "electric", "electric vehicle", "electric car", "hybrid"],
    ),
];

/// Lowercases the input and strips it to space-separated alphanumeric tokens.
fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = true;
    for ch in input.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

fn kebab_case(normalized: &str) -> String {
    normalized.replace(' ', "-")
}

/// Ordered alias matching: exact equality of normalized forms, then phrase
/// containment for aliases of at least 4 characters, then a two-token overlap
/// between multi-token inputs and multi-token aliases.
fn match_alias<T: Copy>(normalized: &str, table: &[(T, &[&str])]) -> Option<T> {
    if normalized.is_empty() {
        return None;
    }
    for (canonical, aliases) in table {
        for alias in aliases.iter() {
            if normalize_text(alias) == normalized {
                return Some(*canonical);
            }
        }
    }
    for (canonical, aliases) in table {
        for alias in aliases.iter() {
            let alias_norm = normalize_text(alias);
            if alias_norm.len() >= 4 && normalized.contains(&alias_norm) {
                return Some(*canonical);
            }
        }
    }
    let input_tokens: BTreeSet<&str> = normalized.split(' ').collect();
    if input_tokens.len() >= 2 {
        for (canonical, aliases) in table {
            for alias in aliases.iter() {
                let alias_norm = normalize_text(alias);
                let alias_tokens: BTreeSet<&str> = alias_norm.split(' ').collect();
                if alias_tokens.len() >= 2
                    && input_tokens.intersection(&alias_tokens).count() >= 2
                {
                    return Some(*canonical);
                }
            }
        }
    }
    None
}

/// Canonicalizes a free-form service description into a [`CanonicalDomain`].
pub fn canonicalize_service_domain(input: &str) -> CanonicalDomain {
    let normalized = normalize_text(input);
    if let Some(domain) = ServiceDomain::from_slug(&kebab_case(&normalized)) {
        return CanonicalDomain::Known(domain);
    }
    match match_alias(&normalized, &SERVICE_ALIASES) {
        Some(domain) => CanonicalDomain::Known(domain),
        None => CanonicalDomain::Unmapped(kebab_case(&normalized)),
    }
}

/// Canonicalizes a free-form vehicle description into a [`CanonicalVehicle`].
pub fn canonicalize_vehicle_type(input: &str) -> CanonicalVehicle {
    let normalized = normalize_text(input);
    if let Some(family) = VehicleFamily::from_slug(&kebab_case(&normalized)) {
        return CanonicalVehicle::Known(family);
    }
    match match_alias(&normalized, &VEHICLE_ALIASES) {
        Some(family) => CanonicalVehicle::Known(family),
        None => CanonicalVehicle::Unmapped(kebab_case(&normalized)),
    }
}

/// Builds the canonical `{vehicle}-{domain}` request service type.
pub fn canonical_service_type(vehicle: &CanonicalVehicle, domain: &CanonicalDomain) -> String {
    format!("{}-{}", vehicle.as_slug(), domain.as_slug())
}

/// Splits a stored `{vehicle}-{domain}` service type back into its parts.
///
/// The vehicle family is always a single token, so everything after the first
/// dash belongs to the domain ("car-flat-tire" is car + flat-tire).
pub fn split_service_type(service_type: &str) -> (CanonicalVehicle, CanonicalDomain) {
    match service_type.split_once('-') {
        Some((vehicle, domain)) => (
            canonicalize_vehicle_type(vehicle),
            canonicalize_service_domain(domain),
        ),
        None => (
            CanonicalVehicle::Unmapped(kebab_case(&normalize_text(service_type))),
            canonicalize_service_domain(service_type),
        ),
    }
}

/// Parses a technician's supported-vehicle profile into a set of families.
///
/// Profiles are heterogeneous JSON: a list of names, a map of boolean flags,
/// or a JSON document re-encoded as a string. Unknown entries are dropped.
pub fn parse_vehicle_types(value: &serde_json::Value) -> BTreeSet<VehicleFamily> {
    let mut families = BTreeSet::new();
    collect_vehicle_types(value, &mut families);
    families
}

fn collect_vehicle_types(value: &serde_json::Value, out: &mut BTreeSet<VehicleFamily>) {
    match value {
        serde_json::Value::Array(entries) => {
            for entry in entries {
                collect_vehicle_types(entry, out);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, flag) in map {
                let enabled = match flag {
                    serde_json::Value::Bool(b) => *b,
                    serde_json::Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
                    serde_json::Value::String(s) => {
                        matches!(s.as_str(), "true" | "yes" | "1")
                    }
                    _ => false,
                };
                if enabled
                    && let CanonicalVehicle::Known(family) = canonicalize_vehicle_type(key)
                {
                    out.insert(family);
                }
            }
        }
        serde_json::Value::String(text) => {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) {
                if !parsed.is_string() {
                    collect_vehicle_types(&parsed, out);
                    return;
                }
            }
            for part in text.split(',') {
                if let CanonicalVehicle::Known(family) = canonicalize_vehicle_type(part) {
                    out.insert(family);
                }
            }
        }
        _ => {}
    }
}

/// Extracts service domains from a technician's cost structure.
///
/// Cost structures key entries by a service name, either directly
/// (`{"towing": {...}}`) or as an array of entries carrying a name-like
/// field. Only canonically known domains are returned.
pub fn service_domains_from_costs(value: &serde_json::Value) -> BTreeSet<ServiceDomain> {
    let mut domains = BTreeSet::new();
    collect_cost_domains(value, &mut domains, 0);
    domains
}

const NAME_KEYS: [&str; 4] = ["service", "service_type", "name", "type"];

fn collect_cost_domains(
    value: &serde_json::Value,
    out: &mut BTreeSet<ServiceDomain>,
    depth: usize,
) {
    if depth > 2 {
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map {
                if let CanonicalDomain::Known(domain) = canonicalize_service_domain(key) {
                    out.insert(domain);
                } else {
                    collect_cost_domains(entry, out, depth + 1);
                }
            }
        }
        serde_json::Value::Array(entries) => {
            for entry in entries {
                if let serde_json::Value::Object(map) = entry {
                    for name_key in NAME_KEYS {
                        if let Some(serde_json::Value::String(name)) = map.get(name_key)
                            && let CanonicalDomain::Known(domain) =
                                canonicalize_service_domain(name)
                        {
                            out.insert(domain);
                        }
                    }
                }
                collect_cost_domains(entry, out, depth + 1);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_canonical_forms() {
        for domain in ServiceDomain::ALL {
            assert_eq!(
                canonicalize_service_domain(domain.as_slug()),
                CanonicalDomain::Known(domain)
            );
        }
        for family in VehicleFamily::ALL {
            assert_eq!(
                canonicalize_vehicle_type(family.as_slug()),
                CanonicalVehicle::Known(family)
            );
        }
    }

    #[test]
    fn test_alias_roundtrip_matches_canonical() {
        for (domain, aliases) in SERVICE_ALIASES {
            for alias in aliases {
                assert_eq!(
                    canonicalize_service_domain(alias),
                    canonicalize_service_domain(domain.as_slug()),
                    "alias {alias:?} should canonicalize like {domain}"
                );
            }
        }
        for (family, aliases) in VEHICLE_ALIASES {
            for alias in aliases {
                assert_eq!(
                    canonicalize_vehicle_type(alias),
                    canonicalize_vehicle_type(family.as_slug()),
                    "alias {alias:?} should canonicalize like {family}"
                );
            }
        }
    }

    #[test]
    fn test_case_and_punctuation_insensitive() {
        assert_eq!(
            canonicalize_service_domain("Flat   Tyre!"),
            CanonicalDomain::Known(ServiceDomain::FlatTire)
        );
        assert_eq!(
            canonicalize_service_domain("JUMP-START"),
            CanonicalDomain::Known(ServiceDomain::Battery)
        );
        assert_eq!(
            canonicalize_vehicle_type("Two-Wheeler"),
            CanonicalVehicle::Known(VehicleFamily::Bike)
        );
    }

    #[test]
    fn test_phrase_containment() {
        assert_eq!(
            canonicalize_service_domain("urgent flatbed needed now"),
            CanonicalDomain::Known(ServiceDomain::Towing)
        );
        assert_eq!(
            canonicalize_service_domain("my battery died on the highway"),
            CanonicalDomain::Known(ServiceDomain::Battery)
        );
    }

    #[test]
    fn test_short_alias_requires_exact_match() {
        // "ev" is below the 4-char containment threshold: only exact matches.
        assert_eq!(
            canonicalize_vehicle_type("ev"),
            CanonicalVehicle::Known(VehicleFamily::Ev)
        );
        assert_eq!(
            canonicalize_vehicle_type("evening pickup"),
            CanonicalVehicle::Unmapped("evening-pickup".to_string())
        );
    }

    #[test]
    fn test_token_overlap() {
        assert_eq!(
            canonicalize_service_domain("vehicle stuck help"),
            CanonicalDomain::Known(ServiceDomain::Winching)
        );
    }

    #[test]
    fn test_unmapped_falls_back_to_kebab() {
        assert_eq!(
            canonicalize_service_domain("Helicopter Rescue!!"),
            CanonicalDomain::Unmapped("helicopter-rescue".to_string())
        );
    }

    #[test]
    fn test_service_type_roundtrip() {
        let vehicle = canonicalize_vehicle_type("car");
        let domain = canonicalize_service_domain("flat tyre");
        let service_type = canonical_service_type(&vehicle, &domain);
        assert_eq!(service_type, "car-flat-tire");

        let (vehicle_back, domain_back) = split_service_type(&service_type);
        assert_eq!(vehicle_back.known(), Some(VehicleFamily::Car));
        assert_eq!(domain_back.known(), Some(ServiceDomain::FlatTire));
    }

    #[test]
    fn test_parse_vehicle_types_list() {
        let parsed = parse_vehicle_types(&json!(["Car", "motorcycle", "spaceship"]));
        assert_eq!(
            parsed.into_iter().collect::<Vec<_>>(),
            vec![VehicleFamily::Car, VehicleFamily::Bike]
        );
    }

    #[test]
    fn test_parse_vehicle_types_flag_map() {
        let parsed = parse_vehicle_types(&json!({"car": true, "bike": false, "truck": "yes"}));
        assert_eq!(
            parsed.into_iter().collect::<Vec<_>>(),
            vec![VehicleFamily::Car, VehicleFamily::Commercial]
        );
    }

    #[test]
    fn test_parse_vehicle_types_json_string() {
        let parsed = parse_vehicle_types(&json!("[\"suv\", \"scooter\"]"));
        assert_eq!(
            parsed.into_iter().collect::<Vec<_>>(),
            vec![VehicleFamily::Car, VehicleFamily::Bike]
        );
        let parsed = parse_vehicle_types(&json!("car, bus"));
        assert_eq!(
            parsed.into_iter().collect::<Vec<_>>(),
            vec![VehicleFamily::Car, VehicleFamily::Commercial]
        );
    }

    #[test]
    fn test_service_domains_from_costs() {
        let costs = json!({
            "towing": {"base_charge": 500},
            "Jump Start": {"price": 300},
            "concierge": {"price": 1000}
        });
        let domains = service_domains_from_costs(&costs);
        assert_eq!(
            domains.into_iter().collect::<Vec<_>>(),
            vec![ServiceDomain::Towing, ServiceDomain::Battery]
        );

        let costs = json!([
            {"service": "flat tyre", "amount": 250},
            {"name": "fuel delivery", "amount": 150}
        ]);
        let domains = service_domains_from_costs(&costs);
        assert_eq!(
            domains.into_iter().collect::<Vec<_>>(),
            vec![ServiceDomain::FlatTire, ServiceDomain::Fuel]
        );
    }
}
