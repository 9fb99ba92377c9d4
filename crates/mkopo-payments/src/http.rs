//! HTTP client for the payment gateway.

use std::sync::Arc;

use async_trait::async_trait;
use mkopo_core::{ApiEnvelope, BearerSource, Config, StaticBearer};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::GatewayError;
use crate::gateway::{Acceptance, InitiateRequest, PaymentGateway, PinConfirmation, StatusReport};

/// HTTP client for the gateway's `/payments` endpoints.
#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
    bearer: Arc<dyn BearerSource>,
}

/// The gateway nests transaction payloads under `transaction`; some
/// deployments return them flat.
#[derive(Deserialize)]
#[serde(untagged)]
enum Nested<T> {
    Wrapped { transaction: T },
    Bare(T),
}

impl<T> Nested<T> {
    fn into_inner(self) -> T {
        match self {
            Self::Wrapped { transaction } | Self::Bare(transaction) => transaction,
        }
    }
}

impl GatewayClient {
    /// Create a client for the given base URL.
    ///
    /// `base_url` should be like `http://localhost:5000/api` (no trailing slash).
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer: Arc::new(StaticBearer::default()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            ..Self::new(config.gateway_base_url.clone())
        })
    }

    pub fn with_bearer(mut self, bearer: Arc<dyn BearerSource>) -> Self {
        self.bearer = bearer;
        self
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, GatewayError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| GatewayError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| GatewayError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, GatewayError> {
        let req = match self.bearer.bearer() {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Server {
                status: status.as_u16(),
                body: envelope_message(&body).unwrap_or(body),
            });
        }
        let bytes = resp.bytes().await?;
        let envelope: ApiEnvelope<T> = serde_json::from_slice(&bytes)?;
        envelope.into_result().map_err(GatewayError::Rejected)
    }
}

/// Pull `message` out of an error body shaped like the success envelope.
fn envelope_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
    }
    serde_json::from_str::<ErrorBody>(body).ok()?.message
}

#[async_trait]
impl PaymentGateway for GatewayClient {
    async fn initiate(&self, request: &InitiateRequest) -> Result<Acceptance, GatewayError> {
        let url = self.endpoint(&["payments", "initiate"])?;
        info!(
            customer_id = %request.customer_id,
            amount = request.amount,
            alternative = request.is_alternative_number,
            "submitting payment request"
        );
        let accepted: Nested<Acceptance> =
            self.send(self.client.post(url).json(request)).await?;
        let accepted = accepted.into_inner();
        info!(transaction_id = %accepted.transaction_id, "payment request accepted");
        Ok(accepted)
    }

    async fn status(&self, transaction_id: &str) -> Result<StatusReport, GatewayError> {
        let url = self.endpoint(&["payments", "status", transaction_id])?;
        let report: Nested<StatusReport> = self.send(self.client.get(url)).await?;
        let report = report.into_inner();
        debug!(transaction_id, status = ?report.status, "polled payment status");
        Ok(report)
    }

    async fn process_pin(
        &self,
        transaction_id: &str,
        pin: &str,
    ) -> Result<PinConfirmation, GatewayError> {
        let url = self.endpoint(&["payments", "process-pin"])?;
        info!(transaction_id, "relaying manual PIN");
        let body = serde_json::json!({ "transactionId": transaction_id, "pin": pin });
        let mut confirmation: PinConfirmation =
            self.send(self.client.post(url).json(&body)).await?;
        // A successful envelope is the confirmation.
        confirmation.success = true;
        Ok(confirmation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mkopo_core::PaymentStatus;

    #[test]
    fn client_trims_trailing_slash() {
        let client = GatewayClient::new("http://localhost:5000/api/".into());
        assert_eq!(client.base_url, "http://localhost:5000/api");
    }

    #[test]
    fn transaction_id_is_encoded_in_the_path() {
        let client = GatewayClient::new("http://localhost:5000/api".into());
        let url = client.endpoint(&["payments", "status", "TX 1/2"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:5000/api/payments/status/TX%201%2F2");
    }

    #[test]
    fn initiate_response_envelope() {
        let json = r#"{
            "success": true,
            "data": { "transaction": { "transactionId": "TX-1", "status": "PENDING" } }
        }"#;
        let env: ApiEnvelope<Nested<Acceptance>> = serde_json::from_str(json).unwrap();
        let accepted = env.into_result().unwrap().into_inner();
        assert_eq!(accepted.transaction_id, "TX-1");
        assert_eq!(accepted.status, Some(PaymentStatus::Pending));
    }

    #[test]
    fn status_response_flat_or_nested() {
        let nested = r#"{"success":true,"data":{"transaction":{"status":"success","mpesaReceiptNumber":"R1"}}}"#;
        let flat = r#"{"success":true,"data":{"status":"failed","errorMessage":"Declined"}}"#;

        let a: ApiEnvelope<Nested<StatusReport>> = serde_json::from_str(nested).unwrap();
        let a = a.into_result().unwrap().into_inner();
        assert_eq!(a.status, Some(PaymentStatus::Success));
        assert_eq!(a.receipt.as_deref(), Some("R1"));

        let b: ApiEnvelope<Nested<StatusReport>> = serde_json::from_str(flat).unwrap();
        let b = b.into_result().unwrap().into_inner();
        assert_eq!(b.status, Some(PaymentStatus::Failed));
        assert_eq!(b.error_message.as_deref(), Some("Declined"));
    }

    #[test]
    fn rejected_envelope_keeps_message() {
        let json = r#"{"success":false,"message":"Invalid phone number"}"#;
        let env: ApiEnvelope<Nested<Acceptance>> = serde_json::from_str(json).unwrap();
        assert_eq!(env.into_result().err().as_deref(), Some("Invalid phone number"));
    }

    #[test]
    fn error_body_message() {
        assert_eq!(
            envelope_message(r#"{"success":false,"message":"Daily limit exceeded"}"#).as_deref(),
            Some("Daily limit exceeded")
        );
        assert_eq!(envelope_message("<html>"), None);
    }
}
