//! Push-payment request model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::{FailureReason, PaymentStatus};
use crate::validate::AmountPolicy;

/// What the operator asked to collect, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDraft {
    pub customer_id: String,
    pub phone_number: String,
    /// Used instead of `phone_number` when present.
    #[serde(default)]
    pub alternative_phone_number: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub initiated_by: Option<String>,
    #[serde(default)]
    pub amount_policy: AmountPolicy,
}

impl PaymentDraft {
    pub fn new(customer_id: impl Into<String>, phone_number: impl Into<String>, amount: f64) -> Self {
        Self {
            customer_id: customer_id.into(),
            phone_number: phone_number.into(),
            alternative_phone_number: None,
            amount,
            description: None,
            initiated_by: None,
            amount_policy: AmountPolicy::Reject,
        }
    }

    pub fn with_alternative_phone(mut self, phone: impl Into<String>) -> Self {
        self.alternative_phone_number = Some(phone.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_amount_policy(mut self, policy: AmountPolicy) -> Self {
        self.amount_policy = policy;
        self
    }

    /// The number the prompt is actually sent to.
    pub fn target_phone(&self) -> &str {
        self.alternative_phone_number
            .as_deref()
            .unwrap_or(&self.phone_number)
    }
}

/// A push-payment request the gateway has accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// Gateway-assigned id; `None` until accepted.
    pub id: Option<String>,
    pub customer_id: String,
    pub phone_number: String,
    /// The customer's number on record when an alternative was used.
    pub original_phone_number: Option<String>,
    pub amount: f64,
    /// Requested amount when the policy clamped it to the ceiling.
    pub clamped_from: Option<f64>,
    pub status: PaymentStatus,
    pub initiated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
    /// Free-text gateway message accompanying a failure.
    pub error_message: Option<String>,
    pub receipt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("request already resolved as {0}")]
    AlreadyTerminal(PaymentStatus),
    #[error("cannot move back to {0}")]
    NotForward(PaymentStatus),
}

impl PaymentRequest {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Advance the status. Terminal states are immutable and INITIATED cannot
    /// be re-entered from PENDING.
    pub fn advance(&mut self, next: PaymentStatus, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.status));
        }
        if next == PaymentStatus::Initiated && self.status == PaymentStatus::Pending {
            return Err(TransitionError::NotForward(next));
        }
        self.status = next;
        if next.is_terminal() {
            self.resolved_at = Some(at);
        }
        Ok(())
    }

    /// Record a FAILED outcome with its reason.
    pub fn fail(
        &mut self,
        reason: Option<FailureReason>,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.advance(PaymentStatus::Failed, at)?;
        self.failure_reason = reason.or(Some(FailureReason::Other));
        self.error_message = message;
        Ok(())
    }
}
