//! The service-request state machine.
//!
//! ```text
//! pending -> assigned -> accepted -> on-the-way -> arrived -> in-progress
//!                                                         -> payment_pending -> paid
//! ```
//!
//! `cancelled` is reachable by the owning user from the early states through
//! the general status PATCH, and from every non-paid state through the
//! explicit cancel operation. A technician-side `rejected` triggers
//! reassignment to the next-best candidate or demotion back to `pending`.
//! All transitions serialize against acceptance through the same row lock.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::dispatch::DispatchEngine;
use crate::error::ApiError;
use crate::normalize::{canonical_service_type, canonicalize_service_domain, canonicalize_vehicle_type};
use crate::notifier::Notifier;
use crate::pricing::{PlatformPricing, resolve_base_amount};
use crate::store::Store;
use crate::types::{RequestStatus, ServiceRequest, Technician};

/// Window within which a same-service booking by the same user is a duplicate.
const DUPLICATE_WINDOW_MINUTES: i32 = 5;

/// Who is driving a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusActor {
    User,
    Technician,
}

/// Which cancellation gate applies.
///
/// The general PATCH blocks cancellation once the technician has arrived;
/// the explicit cancel operation allows it at any state short of `paid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelGate {
    Patch,
    Explicit,
}

/// Input for creating a service request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRequest {
    pub user_id: i64,
    pub service_type: String,
    pub vehicle_type: String,
    pub address: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
}

/// Position of a status in the technician-driven forward chain.
fn chain_index(status: RequestStatus) -> Option<u8> {
    match status {
        RequestStatus::Assigned => Some(0),
        RequestStatus::Accepted => Some(1),
        RequestStatus::OnTheWay => Some(2),
        RequestStatus::Arrived => Some(3),
        RequestStatus::InProgress => Some(4),
        RequestStatus::PaymentPending => Some(5),
        _ => None,
    }
}

/// Whether entering this status starts the job clock.
fn marks_started(status: RequestStatus) -> bool {
    matches!(status, RequestStatus::OnTheWay | RequestStatus::InProgress)
}

/// Whether entering this status completes the job and frees the technician.
fn marks_completed(status: RequestStatus) -> bool {
    status == RequestStatus::PaymentPending
}

/// States from which the general PATCH refuses a user cancellation.
fn patch_cancel_blocked(status: RequestStatus) -> bool {
    matches!(
        status,
        RequestStatus::Arrived
            | RequestStatus::InProgress
            | RequestStatus::PaymentPending
            | RequestStatus::Paid
            | RequestStatus::Cancelled
            | RequestStatus::Rejected
    )
}

/// States from which the explicit cancel operation refuses.
fn explicit_cancel_blocked(status: RequestStatus) -> bool {
    matches!(status, RequestStatus::Paid | RequestStatus::Cancelled)
}

/// Validates a technician-driven transition from `current` to `target`.
fn technician_transition_allowed(
    current: RequestStatus,
    target: RequestStatus,
) -> Result<(), ApiError> {
    if target == RequestStatus::Rejected {
        return if matches!(current, RequestStatus::Assigned | RequestStatus::Accepted) {
            Ok(())
        } else {
            Err(ApiError::conflict(format!(
                "Cannot reject a job that is already {current}"
            )))
        };
    }
    let Some(target_index) = chain_index(target) else {
        return Err(ApiError::validation(format!(
            "Technicians cannot set status {target}"
        )));
    };
    match chain_index(current) {
        Some(current_index) if target_index > current_index => Ok(()),
        Some(_) => Err(ApiError::conflict(format!(
            "Cannot move from {current} to {target}"
        ))),
        None => Err(ApiError::conflict(format!(
            "Job is {current}, not in an active state"
        ))),
    }
}

#[derive(Clone)]
pub struct Lifecycle {
    store: Store,
    notifier: Notifier,
    dispatch: DispatchEngine,
    pricing: PlatformPricing,
}

impl Lifecycle {
    pub fn new(
        store: Store,
        notifier: Notifier,
        dispatch: DispatchEngine,
        pricing: PlatformPricing,
    ) -> Self {
        Lifecycle {
            store,
            notifier,
            dispatch,
            pricing,
        }
    }

    /// Creates a request in `pending` and fans out the first dispatch round.
    ///
    /// A same-service booking by the same user within the duplicate window
    /// is refused with the existing request id.
    #[instrument(skip_all, fields(user_id = input.user_id), err)]
    pub async fn create_request(&self, input: NewRequest) -> Result<ServiceRequest, ApiError> {
        if input.address.trim().is_empty() {
            return Err(ApiError::validation("Address is required"));
        }
        if input.service_type.trim().is_empty() {
            return Err(ApiError::validation("Service type is required"));
        }
        let user = self
            .store
            .user(input.user_id)
            .await?
            .ok_or(ApiError::NotFound("user"))?;

        let domain = canonicalize_service_domain(&input.service_type);
        let vehicle = canonicalize_vehicle_type(&input.vehicle_type);
        let service_type = canonical_service_type(&vehicle, &domain);

        let duplicate: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM service_requests
             WHERE user_id = $1
               AND service_type = $2
               AND status IN ('pending', 'assigned', 'accepted')
               AND created_at > NOW() - make_interval(mins => $3)
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(user.id)
        .bind(&service_type)
        .bind(DUPLICATE_WINDOW_MINUTES)
        .fetch_optional(self.store.pool())
        .await?;
        if let Some((existing_id,)) = duplicate {
            return Err(ApiError::Conflict {
                reason: "A matching request is already in progress".to_string(),
                existing_request_id: Some(existing_id),
            });
        }

        let request: ServiceRequest = sqlx::query_as(
            "INSERT INTO service_requests
                 (user_id, service_type, vehicle_type, address, lat, lng,
                  contact_name, contact_phone, amount, status, payment_status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 'pending')
             RETURNING *",
        )
        .bind(user.id)
        .bind(&service_type)
        .bind(vehicle.as_slug())
        .bind(input.address.trim())
        .bind(input.lat)
        .bind(input.lng)
        .bind(input.contact_name.as_deref())
        .bind(input.contact_phone.as_deref())
        .bind(input.amount)
        .fetch_one(self.store.pool())
        .await?;

        tracing::info!(request_id = request.id, %service_type, "Request created");

        // The request exists regardless of whether this first dispatch round
        // succeeds; a failed round is retried through the dispatch endpoint.
        if let Err(error) = self.run_dispatch_round(&request, None).await {
            tracing::warn!(request_id = request.id, ?error, "Initial dispatch failed");
        }

        Ok(request)
    }

    /// Runs one dispatch round: rank candidates, create offers, notify.
    pub async fn run_dispatch_round(
        &self,
        request: &ServiceRequest,
        exclude_technician: Option<i64>,
    ) -> Result<usize, ApiError> {
        let candidates = self
            .dispatch
            .find_top_technicians(request, None, exclude_technician)
            .await?;
        if candidates.is_empty() {
            tracing::info!(request_id = request.id, "No eligible technicians");
            return Ok(0);
        }
        self.dispatch.dispatch_job(request, &candidates).await
    }

    /// Applies a status transition submitted by one of the two parties.
    #[instrument(skip_all, fields(request_id, ?actor), err)]
    pub async fn update_status(
        &self,
        request_id: i64,
        actor: StatusActor,
        raw_status: &str,
        cancellation_reason: Option<String>,
    ) -> Result<ServiceRequest, ApiError> {
        let target = RequestStatus::from_submission(raw_status)
            .map_err(|e| ApiError::validation(e.to_string()))?;

        match actor {
            StatusActor::User => {
                if target != RequestStatus::Cancelled {
                    return Err(ApiError::validation(
                        "Users may only cancel a request through status updates",
                    ));
                }
                self.cancel_request(request_id, CancelGate::Patch, cancellation_reason)
                    .await
            }
            StatusActor::Technician => {
                self.apply_technician_status(request_id, target).await
            }
        }
    }

    /// Cancels a request on behalf of the owning user.
    #[instrument(skip_all, fields(request_id, ?gate), err)]
    pub async fn cancel_request(
        &self,
        request_id: i64,
        gate: CancelGate,
        reason: Option<String>,
    ) -> Result<ServiceRequest, ApiError> {
        let mut tx = self.store.pool().begin().await?;
        let request: Option<ServiceRequest> =
            sqlx::query_as("SELECT * FROM service_requests WHERE id = $1 FOR UPDATE")
                .bind(request_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(request) = request else {
            return Err(ApiError::NotFound("request"));
        };

        let blocked = match gate {
            CancelGate::Patch => patch_cancel_blocked(request.status),
            CancelGate::Explicit => explicit_cancel_blocked(request.status),
        };
        if blocked {
            return Err(ApiError::conflict(format!(
                "Cannot cancel a request that is {}",
                request.status
            )));
        }

        let updated: ServiceRequest = sqlx::query_as(
            "UPDATE service_requests
             SET status = 'cancelled', technician_id = NULL,
                 cancelled_at = NOW(), cancellation_reason = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(request_id)
        .bind(reason.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        if let Some(technician_id) = request.technician_id {
            sqlx::query(
                "UPDATE technicians SET is_available = TRUE, updated_at = NOW() WHERE id = $1",
            )
            .bind(technician_id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "UPDATE dispatch_offers SET status = 'expired'
             WHERE service_request_id = $1 AND status = 'pending'",
        )
        .bind(request_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let payload = json!({
            "requestId": request_id,
            "status": RequestStatus::Cancelled,
            "reason": updated.cancellation_reason,
        });
        self.notifier
            .notify_user(updated.user_id, "job:status_update", payload.clone());
        if let Some(technician_id) = request.technician_id {
            self.notifier
                .notify_technician(technician_id, "job:status_update", payload);
        }

        tracing::info!(request_id, "Request cancelled");
        Ok(updated)
    }

    async fn apply_technician_status(
        &self,
        request_id: i64,
        target: RequestStatus,
    ) -> Result<ServiceRequest, ApiError> {
        let mut tx = self.store.pool().begin().await?;
        let request: Option<ServiceRequest> =
            sqlx::query_as("SELECT * FROM service_requests WHERE id = $1 FOR UPDATE")
                .bind(request_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(request) = request else {
            return Err(ApiError::NotFound("request"));
        };

        // A completion report against an already-paid request changes nothing.
        if target == RequestStatus::PaymentPending && request.status == RequestStatus::Paid {
            tx.commit().await?;
            return Ok(request);
        }

        technician_transition_allowed(request.status, target)?;

        if target == RequestStatus::Rejected {
            return self.reject_and_reassign(tx, request).await;
        }

        let updated: ServiceRequest = sqlx::query_as(
            "UPDATE service_requests
             SET status = $2,
                 updated_at = NOW(),
                 started_at = CASE WHEN $3 AND started_at IS NULL THEN NOW() ELSE started_at END,
                 completed_at = CASE WHEN $4 AND completed_at IS NULL THEN NOW() ELSE completed_at END
             WHERE id = $1
             RETURNING *",
        )
        .bind(request_id)
        .bind(target.as_str())
        .bind(marks_started(target))
        .bind(marks_completed(target))
        .fetch_one(&mut *tx)
        .await?;

        if marks_completed(target)
            && let Some(technician_id) = updated.technician_id
        {
            sqlx::query(
                "UPDATE technicians SET is_available = TRUE, updated_at = NOW() WHERE id = $1",
            )
            .bind(technician_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let payload = json!({ "requestId": request_id, "status": target });
        self.notifier
            .notify_user(updated.user_id, "job:status_update", payload.clone());
        if let Some(technician_id) = updated.technician_id {
            self.notifier
                .notify_technician(technician_id, "job:status_update", payload);
        }
        tracing::info!(request_id, status = %target, "Status updated");
        Ok(updated)
    }

    /// Handles a technician rejection: release the rejecting technician,
    /// then hand the job to the next-best match or demote it to `pending`
    /// for a fresh dispatch round.
    async fn reject_and_reassign(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        request: ServiceRequest,
    ) -> Result<ServiceRequest, ApiError> {
        let rejecting_technician = request.technician_id;
        sqlx::query(
            "UPDATE service_requests
             SET status = 'rejected', updated_at = NOW()
             WHERE id = $1",
        )
        .bind(request.id)
        .execute(&mut *tx)
        .await?;
        if let Some(technician_id) = rejecting_technician {
            sqlx::query(
                "UPDATE technicians SET is_available = TRUE, updated_at = NOW() WHERE id = $1",
            )
            .bind(technician_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE dispatch_offers SET status = 'rejected'
                 WHERE service_request_id = $1 AND technician_id = $2",
            )
            .bind(request.id)
            .bind(technician_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let candidates = self
            .dispatch
            .find_top_technicians(&request, None, rejecting_technician)
            .await?;

        match candidates.first() {
            Some(next) => {
                let updated = self.assign_to(&request, &next.technician).await?;
                tracing::info!(
                    request_id = request.id,
                    technician_id = next.technician.id,
                    "Reassigned after rejection"
                );
                Ok(updated)
            }
            None => {
                let demoted: Option<ServiceRequest> = sqlx::query_as(
                    "UPDATE service_requests
                     SET status = 'pending', technician_id = NULL, updated_at = NOW()
                     WHERE id = $1 AND status = 'rejected'
                     RETURNING *",
                )
                .bind(request.id)
                .fetch_optional(self.store.pool())
                .await?;
                let Some(updated) = demoted else {
                    // The user cancelled while we searched; nothing to demote.
                    return self
                        .store
                        .service_request(request.id)
                        .await?
                        .ok_or(ApiError::NotFound("request"));
                };
                tracing::info!(request_id = request.id, "No replacement, back to pending");
                if let Err(error) = self.run_dispatch_round(&updated, rejecting_technician).await {
                    tracing::warn!(request_id = request.id, ?error, "Redispatch failed");
                }
                self.notifier.notify_user(
                    updated.user_id,
                    "job:status_update",
                    json!({ "requestId": updated.id, "status": RequestStatus::Pending }),
                );
                Ok(updated)
            }
        }
    }

    /// Directly assigns a request to a technician (reassignment path).
    async fn assign_to(
        &self,
        request: &ServiceRequest,
        technician: &Technician,
    ) -> Result<ServiceRequest, ApiError> {
        let config = self.pricing.get().await?;
        let amount = resolve_base_amount(request, Some(technician), &config);
        let assigned: Option<ServiceRequest> = sqlx::query_as(
            "UPDATE service_requests
             SET technician_id = $2, status = 'assigned', amount = $3, updated_at = NOW()
             WHERE id = $1 AND status = 'rejected'
             RETURNING *",
        )
        .bind(request.id)
        .bind(technician.id)
        .bind(amount)
        .fetch_optional(self.store.pool())
        .await?;
        let Some(updated) = assigned else {
            // The user cancelled while we searched; keep whatever stands.
            return self
                .store
                .service_request(request.id)
                .await?
                .ok_or(ApiError::NotFound("request"));
        };

        let payload = json!({
            "requestId": updated.id,
            "serviceType": updated.service_type,
            "vehicleType": updated.vehicle_type,
            "address": updated.address,
            "lat": updated.lat,
            "lng": updated.lng,
            "amount": updated.amount,
        });
        self.notifier
            .notify_technician(technician.id, "job:assigned", payload);
        self.notifier.notify_user(
            updated.user_id,
            "job:status_update",
            json!({
                "requestId": updated.id,
                "status": updated.status,
                "technicianId": technician.id,
            }),
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_cancel_gate() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Assigned,
            RequestStatus::Accepted,
            RequestStatus::OnTheWay,
        ] {
            assert!(!patch_cancel_blocked(status), "{status} should be cancellable");
        }
        for status in [
            RequestStatus::Arrived,
            RequestStatus::InProgress,
            RequestStatus::PaymentPending,
            RequestStatus::Paid,
            RequestStatus::Cancelled,
        ] {
            assert!(patch_cancel_blocked(status), "{status} should be blocked");
        }
    }

    #[test]
    fn test_explicit_cancel_gate_is_wider() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Assigned,
            RequestStatus::Accepted,
            RequestStatus::OnTheWay,
            RequestStatus::Arrived,
            RequestStatus::InProgress,
            RequestStatus::PaymentPending,
        ] {
            assert!(!explicit_cancel_blocked(status), "{status} should be cancellable");
        }
        assert!(explicit_cancel_blocked(RequestStatus::Paid));
        assert!(explicit_cancel_blocked(RequestStatus::Cancelled));
    }

    #[test]
    fn test_forward_chain_transitions() {
        assert!(
            technician_transition_allowed(RequestStatus::Assigned, RequestStatus::Accepted)
                .is_ok()
        );
        assert!(
            technician_transition_allowed(RequestStatus::Accepted, RequestStatus::OnTheWay)
                .is_ok()
        );
        assert!(
            technician_transition_allowed(RequestStatus::OnTheWay, RequestStatus::Arrived).is_ok()
        );
        assert!(
            technician_transition_allowed(RequestStatus::Arrived, RequestStatus::InProgress)
                .is_ok()
        );
        assert!(
            technician_transition_allowed(
                RequestStatus::InProgress,
                RequestStatus::PaymentPending
            )
            .is_ok()
        );
        // Skipping forward is permitted, moving backwards is not.
        assert!(
            technician_transition_allowed(RequestStatus::Assigned, RequestStatus::InProgress)
                .is_ok()
        );
        assert!(
            technician_transition_allowed(RequestStatus::Arrived, RequestStatus::Accepted)
                .is_err()
        );
        assert!(
            technician_transition_allowed(RequestStatus::Arrived, RequestStatus::Arrived).is_err()
        );
    }

    #[test]
    fn test_rejection_only_from_early_states() {
        assert!(
            technician_transition_allowed(RequestStatus::Assigned, RequestStatus::Rejected)
                .is_ok()
        );
        assert!(
            technician_transition_allowed(RequestStatus::Accepted, RequestStatus::Rejected)
                .is_ok()
        );
        assert!(
            technician_transition_allowed(RequestStatus::InProgress, RequestStatus::Rejected)
                .is_err()
        );
        assert!(
            technician_transition_allowed(RequestStatus::Paid, RequestStatus::Rejected).is_err()
        );
    }

    #[test]
    fn test_technicians_cannot_set_foreign_states() {
        for target in [
            RequestStatus::Pending,
            RequestStatus::Paid,
            RequestStatus::Cancelled,
        ] {
            assert!(
                technician_transition_allowed(RequestStatus::Assigned, target).is_err(),
                "{target} must be refused"
            );
        }
    }

    #[test]
    fn test_pending_job_is_not_transitionable() {
        assert!(
            technician_transition_allowed(RequestStatus::Pending, RequestStatus::Accepted)
                .is_err()
        );
    }

    #[test]
    fn test_clock_markers() {
        assert!(marks_started(RequestStatus::OnTheWay));
        assert!(marks_started(RequestStatus::InProgress));
        assert!(!marks_started(RequestStatus::Arrived));
        assert!(!marks_started(RequestStatus::Accepted));
        assert!(marks_completed(RequestStatus::PaymentPending));
        assert!(!marks_completed(RequestStatus::InProgress));
    }
}
