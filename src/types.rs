//! Domain model for the dispatch and payment core.
//!
//! The key entities are [`ServiceRequest`], [`Technician`], [`DispatchOffer`],
//! [`Payment`], [`Invoice`] and [`TechnicianDue`]. Status fields are closed
//! enums persisted as their exact wire strings; free-form technician profile
//! data (pricing, specialties, supported vehicles) stays as JSON and is
//! canonicalized on read by the [`crate::normalize`] module.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::PgRow;
use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use crate::geo::Coordinates;
use crate::normalize::{
    CanonicalDomain, ServiceDomain, VehicleFamily, canonicalize_service_domain,
    parse_vehicle_types, service_domains_from_costs,
};

/// Error raised when a persisted status string is not a member of its
/// closed vocabulary.
#[derive(Debug, thiserror::Error)]
#[error("Unknown {kind} value: {value}")]
pub struct StatusParseError {
    pub kind: &'static str,
    pub value: String,
}

impl StatusParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        StatusParseError {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lifecycle state of a service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "assigned")]
    Assigned,
    #[serde(rename = "accepted")]
    Accepted,
    #[serde(rename = "on-the-way")]
    OnTheWay,
    #[serde(rename = "arrived")]
    Arrived,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "payment_pending")]
    PaymentPending,
    #[serde(rename = "paid")]
    Paid,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "rejected")]
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Assigned => "assigned",
            RequestStatus::Accepted => "accepted",
            RequestStatus::OnTheWay => "on-the-way",
            RequestStatus::Arrived => "arrived",
            RequestStatus::InProgress => "in-progress",
            RequestStatus::PaymentPending => "payment_pending",
            RequestStatus::Paid => "paid",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Rejected => "rejected",
        }
    }

    /// Whether the request can never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Paid | RequestStatus::Cancelled | RequestStatus::Rejected
        )
    }

    /// Normalizes a client-submitted status, accepting the historical aliases
    /// (`on_the_way`, `on the way`, `en_route`, `in_progress`) and mapping the
    /// technician-side `completed` onto `payment_pending`.
    pub fn from_submission(raw: &str) -> Result<Self, StatusParseError> {
        let lowered = raw.trim().to_lowercase();
        let normalized = lowered.replace([' ', '_'], "-");
        let status = match normalized.as_str() {
            "on-the-way" | "en-route" | "enroute" => RequestStatus::OnTheWay,
            "in-progress" => RequestStatus::InProgress,
            "completed" | "payment-pending" => RequestStatus::PaymentPending,
            other => RequestStatus::from_str(other)
                .or_else(|_| RequestStatus::from_str(&lowered))
                .map_err(|_| StatusParseError::new("request status", raw))?,
        };
        Ok(status)
    }
}

impl Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "assigned" => Ok(RequestStatus::Assigned),
            "accepted" => Ok(RequestStatus::Accepted),
            "on-the-way" => Ok(RequestStatus::OnTheWay),
            "arrived" => Ok(RequestStatus::Arrived),
            "in-progress" => Ok(RequestStatus::InProgress),
            "payment_pending" => Ok(RequestStatus::PaymentPending),
            "paid" => Ok(RequestStatus::Paid),
            "cancelled" => Ok(RequestStatus::Cancelled),
            "rejected" => Ok(RequestStatus::Rejected),
            other => Err(StatusParseError::new("request status", other)),
        }
    }
}

/// Payment state carried on the request row itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPaymentStatus {
    Pending,
    Completed,
}

impl RequestPaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPaymentStatus::Pending => "pending",
            RequestPaymentStatus::Completed => "completed",
        }
    }
}

impl FromStr for RequestPaymentStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestPaymentStatus::Pending),
            "completed" => Ok(RequestPaymentStatus::Completed),
            other => Err(StatusParseError::new("request payment status", other)),
        }
    }
}

/// How a finalized payment was collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Razorpay,
    Cash,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Razorpay => "razorpay",
            PaymentMethod::Cash => "cash",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "razorpay" => Ok(PaymentMethod::Razorpay),
            "cash" => Ok(PaymentMethod::Cash),
            other => Err(StatusParseError::new("payment method", other)),
        }
    }
}

/// State of a payment row. The wire strings are inherited from the gateway
/// integration: gateway-side phases are uppercase, final states lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentRowStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl PaymentRowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentRowStatus::Pending => "PENDING",
            PaymentRowStatus::Processing => "PROCESSING",
            PaymentRowStatus::Completed => "completed",
            PaymentRowStatus::Failed => "failed",
        }
    }
}

impl FromStr for PaymentRowStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentRowStatus::Pending),
            "PROCESSING" => Ok(PaymentRowStatus::Processing),
            "completed" => Ok(PaymentRowStatus::Completed),
            "failed" => Ok(PaymentRowStatus::Failed),
            other => Err(StatusParseError::new("payment status", other)),
        }
    }
}

/// State of a dispatch offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl OfferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferStatus::Pending => "pending",
            OfferStatus::Accepted => "accepted",
            OfferStatus::Rejected => "rejected",
            OfferStatus::Expired => "expired",
        }
    }
}

impl FromStr for OfferStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OfferStatus::Pending),
            "accepted" => Ok(OfferStatus::Accepted),
            "rejected" => Ok(OfferStatus::Rejected),
            "expired" => Ok(OfferStatus::Expired),
            other => Err(StatusParseError::new("offer status", other)),
        }
    }
}

/// Admin review state of a technician.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(StatusParseError::new("approval status", other)),
        }
    }
}

/// Delivery state of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    #[serde(rename = "GENERATED")]
    Generated,
    #[serde(rename = "EMAILED")]
    Emailed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Generated => "GENERATED",
            InvoiceStatus::Emailed => "EMAILED",
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GENERATED" => Ok(InvoiceStatus::Generated),
            "EMAILED" => Ok(InvoiceStatus::Emailed),
            other => Err(StatusParseError::new("invoice status", other)),
        }
    }
}

/// Settlement state of a cash due owed by a technician.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DueStatus {
    Pending,
    Paid,
}

impl DueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DueStatus::Pending => "pending",
            DueStatus::Paid => "paid",
        }
    }
}

impl FromStr for DueStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DueStatus::Pending),
            "paid" => Ok(DueStatus::Paid),
            other => Err(StatusParseError::new("due status", other)),
        }
    }
}

fn decode_status<T: FromStr<Err = StatusParseError>>(
    row: &PgRow,
    column: &'static str,
) -> Result<T, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn decode_status_opt<T: FromStr<Err = StatusParseError>>(
    row: &PgRow,
    column: &'static str,
) -> Result<Option<T>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| {
        s.parse::<T>().map_err(|e| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
    })
    .transpose()
}

/// A customer account, projected to what the payment pipeline needs.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl sqlx::FromRow<'_, PgRow> for User {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(User {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
        })
    }
}

/// A field technician with their free-form service profile.
#[derive(Debug, Clone)]
pub struct Technician {
    pub id: i64,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub approval_status: ApprovalStatus,
    pub is_active: bool,
    pub is_available: bool,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub service_area_range_km: i32,
    pub service_type: Option<String>,
    pub specialties: serde_json::Value,
    pub vehicle_types: serde_json::Value,
    pub pricing: serde_json::Value,
    pub service_costs: serde_json::Value,
    pub jobs_completed: i64,
    pub total_earnings: Decimal,
    pub rating: Decimal,
}

impl Technician {
    pub fn coordinates(&self) -> Option<Coordinates> {
        Coordinates::from_parts(self.lat, self.lng)
    }

    /// Whether the profile declares anything dispatchable at all.
    pub fn has_service_profile(&self) -> bool {
        self.service_type
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
            || !self.specialty_names().is_empty()
            || !self.service_costs.is_null()
            || !self.pricing.is_null()
    }

    fn specialty_names(&self) -> Vec<String> {
        match &self.specialties {
            serde_json::Value::Array(entries) => entries
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            serde_json::Value::String(s) if !s.trim().is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// All canonical service domains the technician covers: the primary
    /// service type, declared specialties, and domains named in the cost
    /// structures.
    pub fn service_domains(&self) -> BTreeSet<ServiceDomain> {
        let mut domains = BTreeSet::new();
        if let Some(primary) = &self.service_type
            && let CanonicalDomain::Known(domain) = canonicalize_service_domain(primary)
        {
            domains.insert(domain);
        }
        for specialty in self.specialty_names() {
            if let CanonicalDomain::Known(domain) = canonicalize_service_domain(&specialty) {
                domains.insert(domain);
            }
        }
        domains.extend(service_domains_from_costs(&self.pricing));
        domains.extend(service_domains_from_costs(&self.service_costs));
        domains
    }

    pub fn has_vehicle_profile(&self) -> bool {
        match &self.vehicle_types {
            serde_json::Value::Null => false,
            serde_json::Value::Array(entries) => !entries.is_empty(),
            serde_json::Value::Object(map) => !map.is_empty(),
            serde_json::Value::String(s) => !s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn vehicle_families(&self) -> BTreeSet<VehicleFamily> {
        parse_vehicle_types(&self.vehicle_types)
    }
}

impl sqlx::FromRow<'_, PgRow> for Technician {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Technician {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            phone: row.try_get("phone")?,
            email: row.try_get("email")?,
            approval_status: decode_status(row, "approval_status")?,
            is_active: row.try_get("is_active")?,
            is_available: row.try_get("is_available")?,
            lat: row.try_get("lat")?,
            lng: row.try_get("lng")?,
            service_area_range_km: row.try_get("service_area_range_km")?,
            service_type: row.try_get("service_type")?,
            specialties: row.try_get("specialties")?,
            vehicle_types: row.try_get("vehicle_types")?,
            pricing: row.try_get("pricing")?,
            service_costs: row.try_get("service_costs")?,
            jobs_completed: row.try_get("jobs_completed")?,
            total_earnings: row.try_get("total_earnings")?,
            rating: row.try_get("rating")?,
        })
    }
}

/// A customer's service request, the root aggregate of the state machine.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub id: i64,
    pub user_id: i64,
    pub technician_id: Option<i64>,
    pub service_type: String,
    pub vehicle_type: String,
    pub address: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub amount: Option<Decimal>,
    pub service_charge: Option<Decimal>,
    pub applied_coupon_code: Option<String>,
    pub coupon_discount_percent: Option<Decimal>,
    pub coupon_discount_amount: Option<Decimal>,
    pub payment_status: RequestPaymentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl ServiceRequest {
    pub fn coordinates(&self) -> Option<Coordinates> {
        Coordinates::from_parts(self.lat, self.lng)
    }

    pub fn is_paid(&self) -> bool {
        self.status == RequestStatus::Paid
            || self.payment_status == RequestPaymentStatus::Completed
    }
}

impl sqlx::FromRow<'_, PgRow> for ServiceRequest {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(ServiceRequest {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            technician_id: row.try_get("technician_id")?,
            service_type: row.try_get("service_type")?,
            vehicle_type: row.try_get("vehicle_type")?,
            address: row.try_get("address")?,
            lat: row.try_get("lat")?,
            lng: row.try_get("lng")?,
            contact_name: row.try_get("contact_name")?,
            contact_phone: row.try_get("contact_phone")?,
            amount: row.try_get("amount")?,
            service_charge: row.try_get("service_charge")?,
            applied_coupon_code: row.try_get("applied_coupon_code")?,
            coupon_discount_percent: row.try_get("coupon_discount_percent")?,
            coupon_discount_amount: row.try_get("coupon_discount_amount")?,
            payment_status: decode_status(row, "payment_status")?,
            payment_method: decode_status_opt(row, "payment_method")?,
            status: decode_status(row, "status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
            cancellation_reason: row.try_get("cancellation_reason")?,
        })
    }
}

/// A time-bounded invitation for one technician to take one request.
#[derive(Debug, Clone)]
pub struct DispatchOffer {
    pub id: i64,
    pub service_request_id: i64,
    pub technician_id: i64,
    pub status: OfferStatus,
    pub sent_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, PgRow> for DispatchOffer {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(DispatchOffer {
            id: row.try_get("id")?,
            service_request_id: row.try_get("service_request_id")?,
            technician_id: row.try_get("technician_id")?,
            status: decode_status(row, "status")?,
            sent_at: row.try_get("sent_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

/// A payment attempt or settlement against a request.
#[derive(Debug, Clone)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub service_request_id: i64,
    pub payment_method: Option<PaymentMethod>,
    pub status: PaymentRowStatus,
    pub amount: Decimal,
    pub platform_fee: Decimal,
    pub technician_amount: Decimal,
    pub is_settled: bool,
    pub razorpay_order_id: Option<String>,
    pub razorpay_payment_id: Option<String>,
    pub razorpay_signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, PgRow> for Payment {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Payment {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            service_request_id: row.try_get("service_request_id")?,
            payment_method: decode_status_opt(row, "payment_method")?,
            status: decode_status(row, "status")?,
            amount: row.try_get("amount")?,
            platform_fee: row.try_get("platform_fee")?,
            technician_amount: row.try_get("technician_amount")?,
            is_settled: row.try_get("is_settled")?,
            razorpay_order_id: row.try_get("razorpay_order_id")?,
            razorpay_payment_id: row.try_get("razorpay_payment_id")?,
            razorpay_signature: row.try_get("razorpay_signature")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// The customer-facing invoice generated at payment finalization.
#[derive(Debug, Clone)]
pub struct Invoice {
    pub id: i64,
    pub service_request_id: i64,
    pub user_id: i64,
    pub technician_id: Option<i64>,
    pub base_amount: Decimal,
    pub platform_fee: Decimal,
    pub gst: Decimal,
    pub total_amount: Decimal,
    pub razorpay_order_id: Option<String>,
    pub razorpay_payment_id: Option<String>,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, PgRow> for Invoice {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Invoice {
            id: row.try_get("id")?,
            service_request_id: row.try_get("service_request_id")?,
            user_id: row.try_get("user_id")?,
            technician_id: row.try_get("technician_id")?,
            base_amount: row.try_get("base_amount")?,
            platform_fee: row.try_get("platform_fee")?,
            gst: row.try_get("gst")?,
            total_amount: row.try_get("total_amount")?,
            razorpay_order_id: row.try_get("razorpay_order_id")?,
            razorpay_payment_id: row.try_get("razorpay_payment_id")?,
            status: decode_status(row, "status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A platform fee owed by a technician for a cash-settled job.
#[derive(Debug, Clone, Serialize)]
pub struct TechnicianDue {
    pub id: i64,
    pub technician_id: i64,
    pub service_request_id: i64,
    pub amount: Decimal,
    pub status: DueStatus,
    pub created_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, PgRow> for TechnicianDue {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(TechnicianDue {
            id: row.try_get("id")?,
            technician_id: row.try_get("technician_id")?,
            service_request_id: row.try_get("service_request_id")?,
            amount: row.try_get("amount")?,
            status: decode_status(row, "status")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Customer-facing projection of a request, used in API responses and push
/// payloads. Reconnecting clients reconcile their state from this view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    pub id: i64,
    pub user_id: i64,
    pub technician_id: Option<i64>,
    pub service_type: String,
    pub vehicle_type: String,
    pub address: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub amount: Option<Decimal>,
    pub applied_coupon_code: Option<String>,
    pub status: RequestStatus,
    pub payment_status: RequestPaymentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl From<&ServiceRequest> for RequestView {
    fn from(request: &ServiceRequest) -> Self {
        RequestView {
            id: request.id,
            user_id: request.user_id,
            technician_id: request.technician_id,
            service_type: request.service_type.clone(),
            vehicle_type: request.vehicle_type.clone(),
            address: request.address.clone(),
            lat: request.lat,
            lng: request.lng,
            amount: request.amount,
            applied_coupon_code: request.applied_coupon_code.clone(),
            status: request.status,
            payment_status: request.payment_status,
            payment_method: request.payment_method,
            created_at: request.created_at,
            updated_at: request.updated_at,
            started_at: request.started_at,
            completed_at: request.completed_at,
            cancelled_at: request.cancelled_at,
            cancellation_reason: request.cancellation_reason.clone(),
        }
    }
}
