//! Road-distance and ETA enrichment via the external routing service.
//!
//! Failures here are always transient from the engine's perspective: any
//! error degrades to the Haversine-derived fallback and never surfaces to
//! the caller.

use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;

use crate::geo::Coordinates;

/// How long a routing lookup may take before the fallback wins.
const ROUTING_TIMEOUT: Duration = Duration::from_secs(3);

/// A routed travel estimate between two points.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RouteEta {
    pub distance_km: f64,
    pub duration_seconds: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Routing request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Thin client for the routing service's ETA endpoint.
#[derive(Clone)]
pub struct RoutingClient {
    http: reqwest::Client,
    base_url: String,
}

impl RoutingClient {
    pub fn new(base_url: String) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(ROUTING_TIMEOUT)
            .build()?;
        Ok(RoutingClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetches the routed estimate from technician position to job site.
    #[instrument(skip_all, err(level = "debug"))]
    pub async fn eta(&self, from: Coordinates, to: Coordinates) -> Result<RouteEta, RoutingError> {
        let url = format!("{}/eta", self.base_url);
        let response = self
            .http
            .get(url)
            .query(&[
                ("from_lat", from.lat),
                ("from_lng", from.lng),
                ("to_lat", to.lat),
                ("to_lng", to.lng),
            ])
            .send()
            .await?
            .error_for_status()?;
        let eta = response.json::<RouteEta>().await?;
        Ok(eta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eta_response_shape() {
        let eta: RouteEta =
            serde_json::from_str(r#"{"distance_km": 3.4, "duration_seconds": 520.0}"#).unwrap();
        assert_eq!(
            eta,
            RouteEta {
                distance_km: 3.4,
                duration_seconds: 520.0
            }
        );
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = RoutingClient::new("http://osrm.internal/".to_string()).unwrap();
        assert_eq!(client.base_url, "http://osrm.internal");
    }
}
