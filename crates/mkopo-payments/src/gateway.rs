//! Payment gateway contract and wire types.

use async_trait::async_trait;
use mkopo_core::status::{self, FailureReason, PaymentStatus};
use serde::{Deserialize, Serialize};

use crate::GatewayError;

/// Push-payment operations the orchestrator consumes.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// `POST /payments/initiate`.
    async fn initiate(&self, request: &InitiateRequest) -> Result<Acceptance, GatewayError>;

    /// `GET /payments/status/{transactionId}`.
    async fn status(&self, transaction_id: &str) -> Result<StatusReport, GatewayError>;

    /// `POST /payments/process-pin`.
    async fn process_pin(
        &self,
        transaction_id: &str,
        pin: &str,
    ) -> Result<PinConfirmation, GatewayError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub phone_number: String,
    pub amount: f64,
    pub customer_id: String,
    pub description: String,
    pub is_alternative_number: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<String>,
}

/// The gateway's answer to an accepted submission.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acceptance {
    #[serde(alias = "checkoutId", alias = "_id")]
    pub transaction_id: String,
    #[serde(default, deserialize_with = "status::lenient")]
    pub status: Option<PaymentStatus>,
}

/// Current state of a transaction at the gateway.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// `None` when the gateway sent a status the core does not recognise.
    #[serde(default, deserialize_with = "status::lenient")]
    pub status: Option<PaymentStatus>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, alias = "mpesaReceiptNumber")]
    pub receipt: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl StatusReport {
    pub fn with_status(status: PaymentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(PaymentStatus::is_terminal)
    }

    pub fn failure(&self) -> Option<FailureReason> {
        self.failure_reason.as_deref().map(FailureReason::parse)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct PinConfirmation {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub receipt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiate_request_wire_shape() {
        let req = InitiateRequest {
            phone_number: "254712345678".into(),
            amount: 1500.0,
            customer_id: "c1".into(),
            description: "Loan repayment for John Kamau".into(),
            is_alternative_number: false,
            original_phone_number: None,
            initiated_by: Some("agent1".into()),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["phoneNumber"], "254712345678");
        assert_eq!(json["customerId"], "c1");
        assert_eq!(json["isAlternativeNumber"], false);
        assert!(json.get("originalPhoneNumber").is_none());
    }

    #[test]
    fn acceptance_accepts_checkout_id() {
        let a: Acceptance =
            serde_json::from_str(r#"{"checkoutId":"ws_CO_1","status":"pending"}"#).unwrap();
        assert_eq!(a.transaction_id, "ws_CO_1");
        assert_eq!(a.status, Some(PaymentStatus::Pending));
    }

    #[test]
    fn status_report_normalises() {
        let r: StatusReport = serde_json::from_str(
            r#"{"status":"Failed","errorMessage":"Insufficient balance","failureReason":"INSUFFICIENT_FUNDS"}"#,
        )
        .unwrap();
        assert_eq!(r.status, Some(PaymentStatus::Failed));
        assert!(r.is_terminal());
        assert_eq!(r.failure(), Some(FailureReason::InsufficientFunds));
    }

    #[test]
    fn unknown_status_is_not_terminal() {
        let r: StatusReport = serde_json::from_str(r#"{"status":"queued"}"#).unwrap();
        assert_eq!(r.status, None);
        assert!(!r.is_terminal());
    }
}
