//! The dispatch engine: candidate analysis, ETA ranking, offer fan-out, and
//! atomic acceptance.
//!
//! Acceptance is the critical section of the whole system. The race between
//! N offered technicians is decided by a row-level lock on the request row,
//! gated on `status = 'pending'`: exactly one `accept_job` transaction sees
//! the pending row, everyone else finds nothing to lock and loses cleanly.
//! Push notifications are emitted only after the deciding transaction
//! commits, so any technician observing a push will find the offer or
//! assignment in the database.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fmt::Display;
use tracing::instrument;

use crate::error::ApiError;
use crate::geo;
use crate::normalize::split_service_type;
use crate::notifier::Notifier;
use crate::pricing::{PlatformPricing, resolve_base_amount};
use crate::routing::RoutingClient;
use crate::store::Store;
use crate::types::{
    ApprovalStatus, RequestView, ServiceRequest, Technician,
};

/// Offers expire (client-side) this many seconds after dispatch.
pub const OFFER_TTL_SECONDS: i64 = 20;

/// Why a technician was excluded from a dispatch round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InvalidJobLocation,
    NotApproved,
    Inactive,
    Unavailable,
    MissingLocation,
    ServiceProfileMissing,
    ServiceMismatch,
    VehicleProfileMissing,
    VehicleMismatch,
    OutOfRange,
    InvalidServiceDomain,
    InvalidVehicleType,
}

impl Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

/// The criteria a dispatch round evaluated against.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchCriteria {
    pub service_domain: String,
    pub vehicle_family: String,
    pub radius_km: f64,
}

/// Per-technician eligibility verdict.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnicianAnalysis {
    pub technician_id: i64,
    pub eligible: bool,
    pub reasons: Vec<RejectionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

/// Result of analyzing the full roster against one request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchAnalysis {
    pub criteria: DispatchCriteria,
    pub analysis: Vec<TechnicianAnalysis>,
    pub reason_counts: BTreeMap<RejectionReason, usize>,
}

/// An eligible technician, ranked for dispatch.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub technician: Technician,
    pub distance_km: f64,
    pub eta_seconds: f64,
    /// Whether the ETA came from the routing service rather than the
    /// Haversine fallback.
    pub routed: bool,
}

/// Outcome of an acceptance attempt.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<RequestView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AcceptOutcome {
    fn lost() -> Self {
        AcceptOutcome {
            success: false,
            job: None,
            reason: Some("Job already taken or cancelled".to_string()),
        }
    }
}

/// Produces an eligibility verdict for every technician in the roster.
///
/// `radius_km` is the global cap; each technician is limited to
/// `min(service_area_range_km, radius_km)`, where a zero on either side
/// means unlimited.
pub fn analyze_technicians(
    request: &ServiceRequest,
    technicians: &[Technician],
    radius_km: f64,
) -> DispatchAnalysis {
    let (vehicle, domain) = split_service_type(&request.service_type);
    let job_location = request.coordinates();

    let criteria = DispatchCriteria {
        service_domain: domain.as_slug().to_string(),
        vehicle_family: vehicle.as_slug().to_string(),
        radius_km,
    };

    let mut analysis = Vec::with_capacity(technicians.len());
    let mut reason_counts: BTreeMap<RejectionReason, usize> = BTreeMap::new();

    for technician in technicians {
        let mut reasons = Vec::new();
        if job_location.is_none() {
            reasons.push(RejectionReason::InvalidJobLocation);
        }
        if domain.known().is_none() {
            reasons.push(RejectionReason::InvalidServiceDomain);
        }
        if vehicle.known().is_none() {
            reasons.push(RejectionReason::InvalidVehicleType);
        }
        if technician.approval_status != ApprovalStatus::Approved {
            reasons.push(RejectionReason::NotApproved);
        }
        if !technician.is_active {
            reasons.push(RejectionReason::Inactive);
        }
        if !technician.is_available {
            reasons.push(RejectionReason::Unavailable);
        }
        let technician_location = technician.coordinates();
        if technician_location.is_none() {
            reasons.push(RejectionReason::MissingLocation);
        }

        if !technician.has_service_profile() {
            reasons.push(RejectionReason::ServiceProfileMissing);
        } else if let Some(wanted) = domain.known()
            && !technician.service_domains().contains(&wanted)
        {
            reasons.push(RejectionReason::ServiceMismatch);
        }

        if !technician.has_vehicle_profile() {
            reasons.push(RejectionReason::VehicleProfileMissing);
        } else if let Some(wanted) = vehicle.known()
            && !technician.vehicle_families().contains(&wanted)
        {
            reasons.push(RejectionReason::VehicleMismatch);
        }

        let distance_km = match (job_location, technician_location) {
            (Some(job), Some(tech)) => Some(geo::haversine_km(tech, job)),
            _ => None,
        };
        if let Some(distance) = distance_km
            && let Some(limit) = effective_radius(technician.service_area_range_km, radius_km)
            && distance > limit
        {
            reasons.push(RejectionReason::OutOfRange);
        }

        for reason in &reasons {
            *reason_counts.entry(*reason).or_default() += 1;
        }
        analysis.push(TechnicianAnalysis {
            technician_id: technician.id,
            eligible: reasons.is_empty(),
            reasons,
            distance_km,
        });
    }

    DispatchAnalysis {
        criteria,
        analysis,
        reason_counts,
    }
}

/// Combines the technician's own range with the global cap. Zero means
/// unlimited on either side; `None` means no distance restriction at all.
fn effective_radius(technician_range_km: i32, global_radius_km: f64) -> Option<f64> {
    let technician = (technician_range_km > 0).then_some(technician_range_km as f64);
    let global = (global_radius_km > 0.0).then_some(global_radius_km);
    match (technician, global) {
        (Some(t), Some(g)) => Some(t.min(g)),
        (Some(t), None) => Some(t),
        (None, Some(g)) => Some(g),
        (None, None) => None,
    }
}

#[derive(Clone)]
pub struct DispatchEngine {
    store: Store,
    pricing: PlatformPricing,
    notifier: Notifier,
    routing: Option<RoutingClient>,
    radius_km: f64,
    eta_matrix_limit: usize,
}

impl DispatchEngine {
    pub fn new(
        store: Store,
        pricing: PlatformPricing,
        notifier: Notifier,
        routing: Option<RoutingClient>,
        radius_km: f64,
        eta_matrix_limit: usize,
    ) -> Self {
        DispatchEngine {
            store,
            pricing,
            notifier,
            routing,
            radius_km,
            eta_matrix_limit,
        }
    }

    /// Analyzes the full roster against a request.
    #[instrument(skip_all, fields(request_id = request.id), err)]
    pub async fn analyze(
        &self,
        request: &ServiceRequest,
        radius_km: Option<f64>,
    ) -> Result<DispatchAnalysis, ApiError> {
        let technicians = self.store.technicians_all().await?;
        Ok(analyze_technicians(
            request,
            &technicians,
            radius_km.unwrap_or(self.radius_km),
        ))
    }

    /// Finds eligible technicians ranked by ETA.
    ///
    /// The nearest candidates (by Haversine) are enriched with routed ETAs,
    /// bounded by the configured matrix limit; any routing failure keeps the
    /// straight-line fallback for that candidate.
    #[instrument(skip_all, fields(request_id = request.id), err)]
    pub async fn find_top_technicians(
        &self,
        request: &ServiceRequest,
        radius_km: Option<f64>,
        exclude_technician: Option<i64>,
    ) -> Result<Vec<Candidate>, ApiError> {
        let technicians = self.store.technicians_all().await?;
        let analysis = analyze_technicians(
            request,
            &technicians,
            radius_km.unwrap_or(self.radius_km),
        );

        let eligible: HashSet<i64> = analysis
            .analysis
            .iter()
            .filter(|a| a.eligible)
            .map(|a| a.technician_id)
            .collect();
        let distances: BTreeMap<i64, f64> = analysis
            .analysis
            .iter()
            .filter_map(|a| a.distance_km.map(|d| (a.technician_id, d)))
            .collect();

        let mut candidates: Vec<Candidate> = technicians
            .into_iter()
            .filter(|t| eligible.contains(&t.id) && Some(t.id) != exclude_technician)
            .map(|technician| {
                let distance_km = distances.get(&technician.id).copied().unwrap_or(f64::MAX);
                Candidate {
                    distance_km,
                    eta_seconds: geo::fallback_eta_seconds(distance_km),
                    routed: false,
                    technician,
                }
            })
            .collect();
        candidates.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));

        if let (Some(routing), Some(job_location)) = (&self.routing, request.coordinates()) {
            let limit = self.eta_matrix_limit.min(candidates.len());
            let lookups = candidates[..limit].iter().map(|candidate| {
                let technician_location = candidate.technician.coordinates();
                async move {
                    match technician_location {
                        Some(from) => routing.eta(from, job_location).await.ok(),
                        None => None,
                    }
                }
            });
            let etas = join_all(lookups).await;
            for (candidate, eta) in candidates[..limit].iter_mut().zip(etas) {
                if let Some(eta) = eta {
                    candidate.distance_km = eta.distance_km;
                    candidate.eta_seconds = eta.duration_seconds;
                    candidate.routed = true;
                }
            }
        }

        candidates.sort_by(|a, b| a.eta_seconds.total_cmp(&b.eta_seconds));
        Ok(candidates)
    }

    /// Creates pending offers for every candidate not already offered this
    /// request, then notifies each of them.
    ///
    /// All offer rows are committed before the first push is emitted.
    #[instrument(skip_all, fields(request_id = request.id), err)]
    pub async fn dispatch_job(
        &self,
        request: &ServiceRequest,
        candidates: &[Candidate],
    ) -> Result<usize, ApiError> {
        let already_offered: HashSet<i64> = self
            .store
            .offers_for_request(request.id)
            .await?
            .iter()
            .map(|offer| offer.technician_id)
            .collect();
        let fresh: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| !already_offered.contains(&c.technician.id))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut tx = self.store.pool().begin().await?;
        for candidate in &fresh {
            sqlx::query(
                "INSERT INTO dispatch_offers
                     (service_request_id, technician_id, status, sent_at, expires_at)
                 VALUES ($1, $2, 'pending', NOW(), NOW() + make_interval(secs => $3))",
            )
            .bind(request.id)
            .bind(candidate.technician.id)
            .bind(OFFER_TTL_SECONDS as f64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let config = self.pricing.get().await?;
        for candidate in &fresh {
            let amount = resolve_base_amount(request, Some(&candidate.technician), &config);
            let payload = json!({
                "requestId": request.id,
                "serviceType": request.service_type,
                "vehicleType": request.vehicle_type,
                "address": request.address,
                "lat": request.lat,
                "lng": request.lng,
                "amount": amount,
                "distanceKm": candidate.distance_km,
                "etaSeconds": candidate.eta_seconds,
                "expiresIn": OFFER_TTL_SECONDS,
            });
            self.notifier
                .notify_technician(candidate.technician.id, "job_offer", payload);
            self.notifier.notify_technician(
                candidate.technician.id,
                "job:list_update",
                json!({ "requestId": request.id }),
            );
        }
        tracing::info!(
            request_id = request.id,
            offers = fresh.len(),
            "Dispatched offers"
        );
        Ok(fresh.len())
    }

    /// Atomically assigns the request to the accepting technician.
    ///
    /// Exactly one concurrent caller can win: the request row is locked
    /// `FOR UPDATE` gated on `status = 'pending'`, so every later caller
    /// sees no row and returns the losing outcome.
    #[instrument(skip_all, fields(request_id, technician_id), err)]
    pub async fn accept_job(
        &self,
        technician_id: i64,
        request_id: i64,
    ) -> Result<AcceptOutcome, ApiError> {
        let config = self.pricing.get().await?;

        let mut tx = self.store.pool().begin().await?;

        let request: Option<ServiceRequest> = sqlx::query_as(
            "SELECT * FROM service_requests WHERE id = $1 AND status = 'pending' FOR UPDATE",
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(request) = request else {
            tx.commit().await?;
            return Ok(AcceptOutcome::lost());
        };

        let technician: Option<Technician> =
            sqlx::query_as("SELECT * FROM technicians WHERE id = $1 FOR UPDATE")
                .bind(technician_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(technician) = technician else {
            tx.rollback().await?;
            return Err(ApiError::NotFound("technician"));
        };

        let amount = resolve_base_amount(&request, Some(&technician), &config);

        sqlx::query(
            "UPDATE service_requests
             SET technician_id = $2, status = 'assigned', amount = $3, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(request_id)
        .bind(technician_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        let accepted: Option<(i64,)> = sqlx::query_as(
            "UPDATE dispatch_offers SET status = 'accepted'
             WHERE service_request_id = $1 AND technician_id = $2
             RETURNING id",
        )
        .bind(request_id)
        .bind(technician_id)
        .fetch_optional(&mut *tx)
        .await?;
        if accepted.is_none() {
            // Acceptance without a prior offer (e.g. direct assignment):
            // record it so the accepted offer stays the single audit row.
            sqlx::query(
                "INSERT INTO dispatch_offers
                     (service_request_id, technician_id, status, sent_at, expires_at)
                 VALUES ($1, $2, 'accepted', NOW(), NOW())",
            )
            .bind(request_id)
            .bind(technician_id)
            .execute(&mut *tx)
            .await?;
        }

        let revoked: Vec<(i64,)> = sqlx::query_as(
            "UPDATE dispatch_offers SET status = 'rejected'
             WHERE service_request_id = $1 AND technician_id <> $2 AND status = 'pending'
             RETURNING technician_id",
        )
        .bind(request_id)
        .bind(technician_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("UPDATE technicians SET is_available = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(technician_id)
            .execute(&mut *tx)
            .await?;

        let updated: ServiceRequest = sqlx::query_as("SELECT * FROM service_requests WHERE id = $1")
            .bind(request_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        for (loser_id,) in &revoked {
            self.notifier.notify_technician(
                *loser_id,
                "job:revoked",
                json!({ "requestId": request_id }),
            );
        }

        let view = RequestView::from(&updated);
        let job_payload = json!({
            "requestId": updated.id,
            "serviceType": updated.service_type,
            "vehicleType": updated.vehicle_type,
            "address": updated.address,
            "lat": updated.lat,
            "lng": updated.lng,
            "amount": updated.amount,
            "contactName": updated.contact_name,
            "contactPhone": updated.contact_phone,
        });
        self.notifier
            .notify_technician(technician_id, "job_assigned", job_payload.clone());
        self.notifier
            .notify_technician(technician_id, "job:assigned", job_payload);
        self.notifier.notify_request_watchers(
            request_id,
            &format!("job_update_{request_id}"),
            json!({
                "requestId": request_id,
                "status": updated.status,
                "technicianId": technician_id,
                "technicianName": technician.name,
            }),
        );

        tracing::info!(request_id, technician_id, "Job accepted");
        Ok(AcceptOutcome {
            success: true,
            job: Some(view),
            reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RequestPaymentStatus, RequestStatus};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn request(lat: Option<f64>, lng: Option<f64>, service_type: &str) -> ServiceRequest {
        let now = Utc::now();
        ServiceRequest {
            id: 1,
            user_id: 1,
            technician_id: None,
            service_type: service_type.to_string(),
            vehicle_type: "car".to_string(),
            address: "MG Road".to_string(),
            lat,
            lng,
            contact_name: None,
            contact_phone: None,
            amount: None,
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

    fn technician(id: i64) -> Technician {
        Technician {
            id,
            name: format!("tech-{id}"),
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
            pricing: serde_json::Value::Null,
            service_costs: serde_json::Value::Null,
            jobs_completed: 0,
            total_earnings: Decimal::ZERO,
            rating: Decimal::ZERO,
        }
    }

    fn reasons_for(analysis: &DispatchAnalysis, technician_id: i64) -> &[RejectionReason] {
        &analysis
            .analysis
            .iter()
            .find(|a| a.technician_id == technician_id)
            .unwrap()
            .reasons
    }

    #[test]
    fn test_happy_path_eligibility() {
        let request = request(Some(11.0), Some(76.9), "car-towing");
        let analysis = analyze_technicians(&request, &[technician(2)], 50.0);
        let verdict = &analysis.analysis[0];
        assert!(verdict.eligible, "reasons: {:?}", verdict.reasons);
        assert!(verdict.distance_km.unwrap() < 3.0);
        assert!(analysis.reason_counts.is_empty());
        assert_eq!(analysis.criteria.service_domain, "towing");
        assert_eq!(analysis.criteria.vehicle_family, "car");
    }

    #[test]
    fn test_gate_reasons() {
        let request = request(Some(11.0), Some(76.9), "car-towing");

        let mut pending = technician(3);
        pending.approval_status = ApprovalStatus::Pending;
        let mut inactive = technician(4);
        inactive.is_active = false;
        let mut busy = technician(5);
        busy.is_available = false;
        let mut unlocated = technician(6);
        unlocated.lat = None;
        unlocated.lng = None;

        let analysis =
            analyze_technicians(&request, &[pending, inactive, busy, unlocated], 50.0);
        assert_eq!(reasons_for(&analysis, 3), &[RejectionReason::NotApproved]);
        assert_eq!(reasons_for(&analysis, 4), &[RejectionReason::Inactive]);
        assert_eq!(reasons_for(&analysis, 5), &[RejectionReason::Unavailable]);
        assert_eq!(
            reasons_for(&analysis, 6),
            &[RejectionReason::MissingLocation]
        );
        assert_eq!(
            analysis.reason_counts[&RejectionReason::NotApproved],
            1
        );
    }

    #[test]
    fn test_profile_mismatch_reasons() {
        let request = request(Some(11.0), Some(76.9), "car-towing");

        let mut wrong_service = technician(7);
        wrong_service.service_type = Some("lockout".to_string());
        let mut no_service = technician(8);
        no_service.service_type = None;
        let mut wrong_vehicle = technician(9);
        wrong_vehicle.vehicle_types = serde_json::json!(["bike"]);
        let mut no_vehicle = technician(10);
        no_vehicle.vehicle_types = serde_json::Value::Null;

        let analysis = analyze_technicians(
            &request,
            &[wrong_service, no_service, wrong_vehicle, no_vehicle],
            50.0,
        );
        assert_eq!(
            reasons_for(&analysis, 7),
            &[RejectionReason::ServiceMismatch]
        );
        assert_eq!(
            reasons_for(&analysis, 8),
            &[RejectionReason::ServiceProfileMissing]
        );
        assert_eq!(
            reasons_for(&analysis, 9),
            &[RejectionReason::VehicleMismatch]
        );
        assert_eq!(
            reasons_for(&analysis, 10),
            &[RejectionReason::VehicleProfileMissing]
        );
    }

    #[test]
    fn test_out_of_range_uses_min_of_ranges() {
        // Roughly 15.7 km north of the job site.
        let request = request(Some(11.0), Some(76.9), "car-towing");
        let mut far = technician(11);
        far.lat = Some(11.1414);
        far.lng = Some(76.9);

        // Technician range 20 km, global 50 km: inside.
        let analysis = analyze_technicians(&request, std::slice::from_ref(&far), 50.0);
        assert!(analysis.analysis[0].eligible);

        // Global cap 10 km beats the technician's own 20 km.
        let analysis = analyze_technicians(&request, std::slice::from_ref(&far), 10.0);
        assert_eq!(
            reasons_for(&analysis, 11),
            &[RejectionReason::OutOfRange]
        );

        // Technician range 0 means unlimited; only the global cap applies.
        far.service_area_range_km = 0;
        let analysis = analyze_technicians(&request, std::slice::from_ref(&far), 50.0);
        assert!(analysis.analysis[0].eligible);
    }

    #[test]
    fn test_invalid_request_side_inputs() {
        let no_location = request(None, None, "car-towing");
        let analysis = analyze_technicians(&no_location, &[technician(2)], 50.0);
        assert!(
            reasons_for(&analysis, 2).contains(&RejectionReason::InvalidJobLocation)
        );
        // Without job coordinates no distance exists, so range is not judged.
        assert!(!reasons_for(&analysis, 2).contains(&RejectionReason::OutOfRange));

        let odd_service = request(Some(11.0), Some(76.9), "car-helicopter-rescue");
        let analysis = analyze_technicians(&odd_service, &[technician(2)], 50.0);
        assert!(
            reasons_for(&analysis, 2).contains(&RejectionReason::InvalidServiceDomain)
        );

        let odd_vehicle = request(Some(11.0), Some(76.9), "hovercraft-towing");
        let analysis = analyze_technicians(&odd_vehicle, &[technician(2)], 50.0);
        assert!(
            reasons_for(&analysis, 2).contains(&RejectionReason::InvalidVehicleType)
        );
    }

    #[test]
    fn test_effective_radius() {
        assert_eq!(effective_radius(20, 50.0), Some(20.0));
        assert_eq!(effective_radius(20, 10.0), Some(10.0));
        assert_eq!(effective_radius(0, 50.0), Some(50.0));
        assert_eq!(effective_radius(0, 0.0), None);
    }

    #[test]
    fn test_rejection_reason_wire_format() {
        assert_eq!(
            RejectionReason::ServiceProfileMissing.to_string(),
            "service_profile_missing"
        );
        assert_eq!(
            serde_json::to_value(RejectionReason::OutOfRange).unwrap(),
            serde_json::json!("out_of_range")
        );
    }

    // Exercises the acceptance race against a real database. Run with:
    //   DATABASE_URL=postgres://... cargo test -- --ignored
    #[tokio::test]
    #[ignore = "requires a PostgreSQL instance via DATABASE_URL"]
    async fn test_accept_exclusivity_under_contention() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = Store::connect(&url, 20).await.unwrap();
        store.migrate().await.unwrap();
        let pricing = PlatformPricing::new(store.clone(), std::time::Duration::from_secs(30));
        let engine = DispatchEngine::new(
            store.clone(),
            pricing,
            Notifier::new(),
            None,
            50.0,
            25,
        );

        let (user_id,): (i64,) =
            sqlx::query_as("INSERT INTO users (name) VALUES ('race-user') RETURNING id")
                .fetch_one(store.pool())
                .await
                .unwrap();
        let mut technician_ids = Vec::new();
        for n in 0..4 {
            let (id,): (i64,) = sqlx::query_as(
                "INSERT INTO technicians
                     (name, approval_status, is_active, is_available, lat, lng,
                      service_area_range_km, service_type, vehicle_types)
                 VALUES ($1, 'approved', TRUE, TRUE, 11.01, 76.92, 20, 'towing',
                         '[\"car\"]'::jsonb)
                 RETURNING id",
            )
            .bind(format!("race-tech-{n}"))
            .fetch_one(store.pool())
            .await
            .unwrap();
            technician_ids.push(id);
        }
        let (request_id,): (i64,) = sqlx::query_as(
            "INSERT INTO service_requests
                 (user_id, service_type, vehicle_type, address, lat, lng)
             VALUES ($1, 'car-towing', 'car', 'MG Road', 11.0, 76.9)
             RETURNING id",
        )
        .bind(user_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
        for technician_id in &technician_ids {
            sqlx::query(
                "INSERT INTO dispatch_offers
                     (service_request_id, technician_id, expires_at)
                 VALUES ($1, $2, NOW() + INTERVAL '20 seconds')",
            )
            .bind(request_id)
            .bind(technician_id)
            .execute(store.pool())
            .await
            .unwrap();
        }

        let handles: Vec<_> = technician_ids
            .iter()
            .map(|&technician_id| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.accept_job(technician_id, request_id).await })
            })
            .collect();
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        let winners = outcomes.iter().filter(|o| o.success).count();
        assert_eq!(winners, 1, "exactly one acceptance must win");
        for loser in outcomes.iter().filter(|o| !o.success) {
            assert_eq!(
                loser.reason.as_deref(),
                Some("Job already taken or cancelled")
            );
        }

        let (accepted_count, accepted_technician): (i64, Option<i64>) = {
            let row: (i64, Option<i64>) = sqlx::query_as(
                "SELECT COUNT(*), MAX(technician_id) FROM dispatch_offers
                 WHERE service_request_id = $1 AND status = 'accepted'",
            )
            .bind(request_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
            row
        };
        assert_eq!(accepted_count, 1, "exactly one offer may be accepted");

        let request = store.service_request(request_id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Assigned);
        assert_eq!(request.technician_id, accepted_technician);
    }
}
