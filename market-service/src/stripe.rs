use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const API_BASE: &str = "https://api.stripe.com/v1";

/// Signed payloads older than this are rejected as replays.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request to payment provider failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("payment provider rejected the request ({status}): {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature header is missing the {0} element")]
    MissingElement(&'static str),
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("no signature matched the payload")]
    Mismatch,
    #[error("event payload did not parse: {0}")]
    Payload(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub status: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct IntentMetadata {
    pub order_id: Uuid,
    pub user_id: Uuid,
}

/// Verified webhook event, reduced to the fields reconciliation needs.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    pub object: WebhookObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookObject {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl WebhookEvent {
    /// The payment-intent id the event refers to. `payment_intent.*` events
    /// carry it as the object id; `charge.*` events reference it indirectly.
    pub fn intent_id(&self) -> Option<&str> {
        if self.kind.starts_with("payment_intent.") {
            Some(&self.data.object.id)
        } else {
            self.data.object.payment_intent.as_deref()
        }
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: IntentMetadata,
    ) -> Result<PaymentIntent, ProviderError>;

    async fn create_refund(
        &self,
        intent_id: &str,
        amount_minor: Option<i64>,
    ) -> Result<Refund, ProviderError>;

    fn verify_and_parse(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, SignatureError>;
}

pub struct StripeClient {
    http: Client,
    secret_key: String,
    webhook_secret: String,
}

impl StripeClient {
    pub fn new(secret_key: String, webhook_secret: String) -> Self {
        Self {
            http: Client::new(),
            secret_key,
            webhook_secret,
        }
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .post(format!("{}{}", API_BASE, path))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message });
        }
        Ok(response.json::<T>().await?)
    }

    /// Checks a `t=<unix>,v1=<hex hmac>` header against the raw payload.
    /// The signed message is `"{t}.{payload}"`, keyed with the endpoint
    /// secret; comparison is constant-time via the MAC itself.
    fn verify_signature(
        &self,
        payload: &[u8],
        signature_header: &str,
        now_ts: i64,
    ) -> Result<(), SignatureError> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for element in signature_header.split(',') {
            let (key, value) = element
                .trim()
                .split_once('=')
                .ok_or(SignatureError::Malformed)?;
            match key {
                "t" => {
                    timestamp =
                        Some(value.parse::<i64>().map_err(|_| SignatureError::Malformed)?)
                }
                "v1" => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MissingElement("t"))?;
        if candidates.is_empty() {
            return Err(SignatureError::MissingElement("v1"));
        }
        if (now_ts - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(SignatureError::Expired);
        }

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| SignatureError::Malformed)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        for candidate in candidates {
            let Ok(bytes) = hex::decode(candidate) else {
                continue;
            };
            if mac.clone().verify_slice(&bytes).is_ok() {
                return Ok(());
            }
        }
        Err(SignatureError::Mismatch)
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: IntentMetadata,
    ) -> Result<PaymentIntent, ProviderError> {
        let form = vec![
            ("amount".to_string(), amount_minor.to_string()),
            ("currency".to_string(), currency.to_string()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
            (
                "metadata[order_id]".to_string(),
                metadata.order_id.to_string(),
            ),
            (
                "metadata[user_id]".to_string(),
                metadata.user_id.to_string(),
            ),
        ];
        self.post_form("/payment_intents", &form).await
    }

    async fn create_refund(
        &self,
        intent_id: &str,
        amount_minor: Option<i64>,
    ) -> Result<Refund, ProviderError> {
        let mut form = vec![("payment_intent".to_string(), intent_id.to_string())];
        if let Some(minor) = amount_minor {
            form.push(("amount".to_string(), minor.to_string()));
        }
        self.post_form("/refunds", &form).await
    }

    fn verify_and_parse(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, SignatureError> {
        self.verify_signature(payload, signature_header, chrono::Utc::now().timestamp())?;
        serde_json::from_slice(payload).map_err(|e| SignatureError::Payload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";
    const NOW: i64 = 1_700_000_000;

    fn test_client() -> StripeClient {
        StripeClient::new("sk_test_xxx".to_string(), SECRET.to_string())
    }

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_is_accepted() {
        let client = test_client();
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let header = format!("t={},v1={}", NOW, sign(payload, SECRET, NOW));
        assert_eq!(client.verify_signature(payload, &header, NOW), Ok(()));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let client = test_client();
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let header = format!("t={},v1={}", NOW, sign(payload, "wrong_secret", NOW));
        assert_eq!(
            client.verify_signature(payload, &header, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let client = test_client();
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let tampered = br#"{"type":"payment_intent.succeeded","amount":0}"#;
        let header = format!("t={},v1={}", NOW, sign(payload, SECRET, NOW));
        assert_eq!(
            client.verify_signature(tampered, &header, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let client = test_client();
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let old = NOW - SIGNATURE_TOLERANCE_SECS - 1;
        let header = format!("t={},v1={}", old, sign(payload, SECRET, old));
        assert_eq!(
            client.verify_signature(payload, &header, NOW),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn second_candidate_signature_may_match() {
        // Key rotation sends several v1 entries; any single match passes.
        let client = test_client();
        let payload = br#"{"type":"charge.refunded"}"#;
        let header = format!(
            "t={},v1={},v1={}",
            NOW,
            sign(payload, "rotated_out", NOW),
            sign(payload, SECRET, NOW)
        );
        assert_eq!(client.verify_signature(payload, &header, NOW), Ok(()));
    }

    #[test]
    fn missing_timestamp_errors() {
        let client = test_client();
        let payload = b"{}";
        assert_eq!(
            client.verify_signature(payload, "v1=abcdef", NOW),
            Err(SignatureError::MissingElement("t"))
        );
    }

    #[test]
    fn missing_signature_errors() {
        let client = test_client();
        let payload = b"{}";
        assert_eq!(
            client.verify_signature(payload, &format!("t={}", NOW), NOW),
            Err(SignatureError::MissingElement("v1"))
        );
    }

    #[test]
    fn malformed_header_errors() {
        let client = test_client();
        assert_eq!(
            client.verify_signature(b"{}", "garbage", NOW),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            client.verify_signature(b"{}", "t=notanumber,v1=aa", NOW),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn intent_events_parse_with_metadata() {
        let payload = br#"{
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": "pi_123",
                    "metadata": {"order_id": "b3b7f3b0-0000-0000-0000-000000000001"}
                }
            }
        }"#;
        let event: WebhookEvent = serde_json::from_slice(payload).expect("event");
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.kind, "payment_intent.succeeded");
        assert_eq!(event.intent_id(), Some("pi_123"));
        assert_eq!(
            event.data.object.metadata.get("order_id").map(String::as_str),
            Some("b3b7f3b0-0000-0000-0000-000000000001")
        );
    }

    #[test]
    fn charge_events_reference_the_intent_indirectly() {
        let payload = br#"{
            "id": "evt_2",
            "type": "charge.refunded",
            "data": {"object": {"id": "ch_9", "payment_intent": "pi_123"}}
        }"#;
        let event: WebhookEvent = serde_json::from_slice(payload).expect("event");
        assert_eq!(event.intent_id(), Some("pi_123"));

        let payload = br#"{
            "id": "evt_3",
            "type": "charge.refunded",
            "data": {"object": {"id": "ch_9"}}
        }"#;
        let event: WebhookEvent = serde_json::from_slice(payload).expect("event");
        assert_eq!(event.intent_id(), None);
    }
}
