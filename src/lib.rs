//! Server-side core of the ResQ roadside-assistance marketplace.
//!
//! Customers create service requests, the dispatch engine races offers among
//! eligible nearby technicians, the single winner is assigned atomically,
//! both parties drive the job state machine forward, and payment finalization
//! closes the job with an invoice and ledger entries.
//!
//! # Modules
//!
//! - [`normalize`] — Canonical service-domain and vehicle-family vocabulary
//!   over free-form input.
//! - [`pricing`] — TTL-cached platform pricing configuration and per-request
//!   amount resolution.
//! - [`geo`] / [`routing`] — Haversine geometry and routed ETA enrichment.
//! - [`notifier`] — Room-based best-effort push fan-out over server-sent
//!   events.
//! - [`dispatch`] — Candidate analysis, offer fan-out, and the atomic
//!   acceptance race.
//! - [`lifecycle`] — The request state machine: creation, transitions,
//!   cancellation, reassignment.
//! - [`payment`] — The idempotent quote → order → verify → capture →
//!   invoice → ledger pipeline, cash settlement, and webhook handling.
//! - [`store`] — PostgreSQL pool, schema bootstrap, shared reads.
//! - [`handlers`] — The HTTP surface.
//!
//! Correctness lives in the database: pushes are hints, and every
//! client-visible transition is resolvable by a fresh read of its request.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod geo;
pub mod handlers;
pub mod lifecycle;
pub mod normalize;
pub mod notifier;
pub mod payment;
pub mod pricing;
pub mod routing;
pub mod sig_down;
pub mod store;
pub mod telemetry;
pub mod types;
