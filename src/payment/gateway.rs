//! Razorpay gateway client: order creation and both signature protocols.
//!
//! Two HMAC-SHA256 schemes are in play. The client callback signs
//! `"{order_id}|{payment_id}"` with the API key secret; the webhook signs the
//! raw request body with a dedicated webhook secret. Both comparisons go
//! through the MAC's own constant-time verification, never string equality.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;
use std::time::Duration;
use tracing::instrument;

use crate::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://api.razorpay.com/v1";
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// An order as returned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Authenticated client for the payment gateway.
#[derive(Clone)]
pub struct RazorpayGateway {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
    webhook_secret: Option<String>,
}

impl RazorpayGateway {
    pub fn new(
        key_id: String,
        key_secret: String,
        webhook_secret: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()?;
        Ok(RazorpayGateway {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            key_id,
            key_secret,
            webhook_secret,
        })
    }

    /// Creates a capture-on-payment order for an amount in minor units.
    #[instrument(skip_all, fields(amount_minor, receipt), err)]
    pub async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
        notes: Value,
    ) -> Result<GatewayOrder, ApiError> {
        let body = json!({
            "amount": amount_minor,
            "currency": currency,
            "receipt": receipt,
            "payment_capture": 1,
            "notes": notes,
        });
        let response = self
            .http
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Gateway(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::warn!(%status, detail, "Gateway order creation failed");
            return Err(ApiError::Gateway(format!(
                "order creation returned {status}"
            )));
        }
        response
            .json::<GatewayOrder>()
            .await
            .map_err(|e| ApiError::Gateway(e.to_string()))
    }

    /// Hex signature for the client callback: `HMAC(order_id|payment_id)`.
    pub fn callback_signature(&self, order_id: &str, payment_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.key_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(order_id.as_bytes());
        mac.update(b"|");
        mac.update(payment_id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verifies a client-supplied callback signature in constant time.
    pub fn verify_callback_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        provided: &str,
    ) -> bool {
        let Ok(provided) = hex::decode(provided.trim()) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(self.key_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(order_id.as_bytes());
        mac.update(b"|");
        mac.update(payment_id.as_bytes());
        mac.verify_slice(&provided).is_ok()
    }

    /// Verifies a webhook signature over the raw body in constant time.
    ///
    /// Returns `None` when no webhook secret is configured, which callers
    /// surface as the gateway being unconfigured rather than a bad signature.
    pub fn verify_webhook_signature(&self, raw_body: &[u8], provided: &str) -> Option<bool> {
        let secret = self.webhook_secret.as_deref()?;
        let Ok(provided) = hex::decode(provided.trim()) else {
            return Some(false);
        };
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(raw_body);
        Some(mac.verify_slice(&provided).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> RazorpayGateway {
        RazorpayGateway::new(
            "rzp_test_key".to_string(),
            "key_secret_1".to_string(),
            Some("webhook_secret_1".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_callback_signature_roundtrip() {
        let gateway = gateway();
        let signature = gateway.callback_signature("order_abc", "pay_xyz");
        assert_eq!(signature.len(), 64);
        assert!(gateway.verify_callback_signature("order_abc", "pay_xyz", &signature));
    }

    #[test]
    fn test_callback_signature_rejects_tampering() {
        let gateway = gateway();
        let signature = gateway.callback_signature("order_abc", "pay_xyz");
        assert!(!gateway.verify_callback_signature("order_abc", "pay_other", &signature));
        assert!(!gateway.verify_callback_signature("order_other", "pay_xyz", &signature));
        assert!(!gateway.verify_callback_signature("order_abc", "pay_xyz", "deadbeef"));
        assert!(!gateway.verify_callback_signature("order_abc", "pay_xyz", "not-hex!"));
    }

    #[test]
    fn test_callback_signature_depends_on_separator() {
        // "a|bc" and "ab|c" must not collide.
        let gateway = gateway();
        let one = gateway.callback_signature("a", "bc");
        let two = gateway.callback_signature("ab", "c");
        assert_ne!(one, two);
    }

    #[test]
    fn test_webhook_signature_roundtrip() {
        let gateway = gateway();
        let body = br#"{"event":"payment.captured"}"#;
        let mut mac = HmacSha256::new_from_slice(b"webhook_secret_1").unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert_eq!(gateway.verify_webhook_signature(body, &signature), Some(true));
        assert_eq!(
            gateway.verify_webhook_signature(b"tampered body", &signature),
            Some(false)
        );
    }

    #[test]
    fn test_webhook_signature_requires_secret() {
        let gateway = RazorpayGateway::new(
            "rzp_test_key".to_string(),
            "key_secret_1".to_string(),
            None,
        )
        .unwrap();
        assert_eq!(gateway.verify_webhook_signature(b"{}", "00"), None);
    }
}
