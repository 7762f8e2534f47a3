//! HTTP endpoints of the dispatch and payment core.
//!
//! Authentication and role checks happen in middleware outside this crate;
//! handlers receive already-authorized identities in paths and bodies. Every
//! response body is JSON except the server-sent event streams.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::instrument;

use crate::dispatch::DispatchEngine;
use crate::error::ApiError;
use crate::lifecycle::{CancelGate, Lifecycle, NewRequest, StatusActor};
use crate::notifier::{Notifier, PushEvent};
use crate::payment::Payments;
use crate::pricing::PlatformPricing;
use crate::store::Store;
use crate::types::{RequestStatus, RequestView};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub pricing: PlatformPricing,
    pub notifier: Notifier,
    pub lifecycle: Lifecycle,
    pub dispatch: DispatchEngine,
    pub payments: Payments,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/requests", post(post_request))
        .route("/requests/{id}", get(get_request))
        .route("/requests/{id}/status", patch(patch_request_status))
        .route("/requests/{id}/cancel", post(post_cancel_request))
        .route("/requests/{id}/accept", post(post_accept_request))
        .route("/requests/{id}/dispatch", post(post_redispatch))
        .route("/requests/{id}/analysis", get(get_dispatch_analysis))
        .route("/payments/quote", post(post_quote))
        .route("/payments/order", post(post_order))
        .route("/payments/confirm", post(post_confirm))
        .route("/payments/cash", post(post_cash))
        .route("/payments/webhook", post(post_webhook))
        .route("/pricing/invalidate", post(post_pricing_invalidate))
        .route("/technicians/{id}/location", patch(patch_technician_location))
        .route(
            "/technicians/{id}/availability",
            patch(patch_technician_availability),
        )
        .route("/technicians/{id}/dues", get(get_technician_dues))
        .route("/technicians/{id}/dues/settle", post(post_settle_dues))
        .route("/events/users/{id}", get(get_user_events))
        .route("/events/technicians/{id}", get(get_technician_events))
        .route("/events/requests/{id}", get(get_request_events))
}

#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

#[instrument(skip_all)]
async fn get_health(State(app): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    app.store.ping().await?;
    Ok(Json(json!({ "status": "ok", "database": "reachable" })))
}

#[instrument(skip_all)]
async fn post_request(
    State(app): State<Arc<AppState>>,
    Json(body): Json<NewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = app.lifecycle.create_request(body).await?;
    Ok((StatusCode::CREATED, Json(RequestView::from(&request))))
}

#[instrument(skip_all, fields(request_id = id))]
async fn get_request(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let request = app
        .store
        .service_request(id)
        .await?
        .ok_or(ApiError::NotFound("request"))?;
    Ok(Json(RequestView::from(&request)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdateBody {
    role: StatusActor,
    status: String,
    #[serde(default)]
    cancellation_reason: Option<String>,
}

#[instrument(skip_all, fields(request_id = id))]
async fn patch_request_status(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<StatusUpdateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = app
        .lifecycle
        .update_status(id, body.role, &body.status, body.cancellation_reason)
        .await?;
    Ok(Json(RequestView::from(&request)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

#[instrument(skip_all, fields(request_id = id))]
async fn post_cancel_request(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<CancelBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = app
        .lifecycle
        .cancel_request(id, CancelGate::Explicit, body.reason)
        .await?;
    Ok(Json(RequestView::from(&request)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptBody {
    technician_id: i64,
}

#[instrument(skip_all, fields(request_id = id, technician_id = body.technician_id))]
async fn post_accept_request(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<AcceptBody>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = app.dispatch.accept_job(body.technician_id, id).await?;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(outcome)))
}

#[instrument(skip_all, fields(request_id = id))]
async fn post_redispatch(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let request = app
        .store
        .service_request(id)
        .await?
        .ok_or(ApiError::NotFound("request"))?;
    if request.status != RequestStatus::Pending {
        return Err(ApiError::conflict(format!(
            "Only pending requests can be redispatched, this one is {}",
            request.status
        )));
    }
    let offers = app.lifecycle.run_dispatch_round(&request, None).await?;
    Ok(Json(json!({ "requestId": id, "offersCreated": offers })))
}

/// Eligibility diagnostics: the per-technician verdicts and reason counts
/// the dispatch engine would apply to this request right now.
#[instrument(skip_all, fields(request_id = id))]
async fn get_dispatch_analysis(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let request = app
        .store
        .service_request(id)
        .await?
        .ok_or(ApiError::NotFound("request"))?;
    let analysis = app.dispatch.analyze(&request, None).await?;
    Ok(Json(analysis))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteBody {
    request_id: i64,
    #[serde(default)]
    coupon_code: Option<String>,
}

#[instrument(skip_all, fields(request_id = body.request_id))]
async fn post_quote(
    State(app): State<Arc<AppState>>,
    Json(body): Json<QuoteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let quote = app
        .payments
        .quote(body.request_id, body.coupon_code.as_deref())
        .await?;
    Ok(Json(quote))
}

#[instrument(skip_all, fields(request_id = body.request_id))]
async fn post_order(
    State(app): State<Arc<AppState>>,
    Json(body): Json<QuoteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let created = app
        .payments
        .create_order(body.request_id, body.coupon_code.as_deref())
        .await?;
    Ok(Json(created))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmBody {
    razorpay_order_id: String,
    razorpay_payment_id: String,
    razorpay_signature: String,
    #[serde(default)]
    request_id: Option<i64>,
}

#[instrument(skip_all)]
async fn post_confirm(
    State(app): State<Arc<AppState>>,
    Json(body): Json<ConfirmBody>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = app
        .payments
        .confirm(
            &body.razorpay_order_id,
            &body.razorpay_payment_id,
            &body.razorpay_signature,
            body.request_id,
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CashBody {
    request_id: i64,
}

#[instrument(skip_all, fields(request_id = body.request_id))]
async fn post_cash(
    State(app): State<Arc<AppState>>,
    Json(body): Json<CashBody>,
) -> Result<impl IntoResponse, ApiError> {
    let (request, amounts) = app.payments.cash_payment(body.request_id).await?;
    Ok(Json(json!({
        "success": true,
        "request": RequestView::from(&request),
        "breakdown": amounts,
    })))
}

#[instrument(skip_all)]
async fn post_webhook(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get("x-razorpay-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::validation("Missing webhook signature header"))?;
    let outcome = app.payments.webhook(&body, signature).await?;
    Ok(Json(outcome))
}

#[instrument(skip_all)]
async fn post_pricing_invalidate(
    State(app): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    app.pricing.invalidate().await;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationBody {
    lat: f64,
    lng: f64,
}

/// Updates a technician's position and forwards it to the customer watching
/// their active job.
#[instrument(skip_all, fields(technician_id = id))]
async fn patch_technician_location(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<LocationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = sqlx::query(
        "UPDATE technicians SET lat = $2, lng = $3, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(body.lat)
    .bind(body.lng)
    .execute(app.store.pool())
    .await?;
    if updated.rows_affected() == 0 {
        return Err(ApiError::NotFound("technician"));
    }

    let active: Option<(i64, i64)> = sqlx::query_as(
        "SELECT id, user_id FROM service_requests
         WHERE technician_id = $1
           AND status IN ('assigned', 'accepted', 'on-the-way', 'arrived', 'in-progress')
         ORDER BY updated_at DESC
         LIMIT 1",
    )
    .bind(id)
    .fetch_optional(app.store.pool())
    .await?;

    if let Some((request_id, user_id)) = active {
        let payload = json!({
            "requestId": request_id,
            "technicianId": id,
            "lat": body.lat,
            "lng": body.lng,
        });
        app.notifier
            .notify_request_watchers(request_id, "location_update", payload.clone());
        app.notifier
            .notify_user(user_id, "technician:location_update", payload);
    }
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailabilityBody {
    is_available: bool,
}

#[instrument(skip_all, fields(technician_id = id))]
async fn patch_technician_availability(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<AvailabilityBody>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = sqlx::query(
        "UPDATE technicians SET is_available = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(body.is_available)
    .execute(app.store.pool())
    .await?;
    if updated.rows_affected() == 0 {
        return Err(ApiError::NotFound("technician"));
    }

    let payload = json!({ "technicianId": id, "isAvailable": body.is_available });
    app.notifier
        .notify_technician(id, "technician:status_update", payload.clone());
    app.notifier.broadcast("technician:status_update", payload);
    Ok(Json(json!({ "success": true })))
}

#[instrument(skip_all, fields(technician_id = id))]
async fn get_technician_dues(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let dues = app.store.pending_dues_for_technician(id).await?;
    Ok(Json(dues))
}

#[instrument(skip_all, fields(technician_id = id))]
async fn post_settle_dues(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let settled = app.payments.settle_dues(id).await?;
    Ok(Json(settled))
}

/// Bridges a room subscription into a server-sent event stream with
/// heartbeats to keep NAT paths open.
fn room_stream(
    rx: broadcast::Receiver<PushEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(push) => match Event::default().event(&push.event).json_data(&push.payload) {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(error) => {
                        tracing::warn!(?error, "Dropping unserializable push event");
                        continue;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Subscriber lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[instrument(skip_all, fields(user_id = id))]
async fn get_user_events(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    room_stream(app.notifier.join_user(id))
}

#[instrument(skip_all, fields(technician_id = id))]
async fn get_technician_events(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    room_stream(app.notifier.join_technician(id))
}

#[instrument(skip_all, fields(request_id = id))]
async fn get_request_events(
    State(app): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    room_stream(app.notifier.join_request(id))
}
