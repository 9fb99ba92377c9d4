use std::time::Duration;

use mkopo_core::{PaymentStatus, ValidationError};
use thiserror::Error;

/// Failures talking to the payment gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[cfg(feature = "http")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The gateway answered and said no.
    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl GatewayError {
    /// True when the gateway never gave a business answer: transport
    /// failures and 5xx responses.
    pub fn is_network(&self) -> bool {
        match self {
            #[cfg(feature = "http")]
            Self::Http(_) => true,
            Self::Unavailable(_) => true,
            Self::Server { status, .. } => *status >= 500,
            Self::Json(_) | Self::Rejected(_) | Self::InvalidUrl(_) => false,
        }
    }

    /// Operator-facing message: the server's own words where it gave some.
    pub fn message(&self) -> String {
        match self {
            Self::Rejected(msg) => msg.clone(),
            Self::Server { body, .. } if !body.is_empty() => body.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors reported to callers of the payment orchestrator.
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Bad phone, amount or PIN. Nothing was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("customer {customer_id} already has a {status} transaction")]
    DuplicateActiveTransaction {
        customer_id: String,
        status: PaymentStatus,
    },

    /// The gateway refused the submission.
    #[error("payment request rejected: {message}")]
    GatewayRejected { message: String },

    /// The submission never reached a gateway decision.
    #[error("payment gateway unreachable: {message}")]
    GatewayUnavailable { message: String },

    /// Polling gave up without a terminal status from the gateway.
    #[error("no final status for {request_id} after {elapsed:?} ({ticks} polls)")]
    PollTimeout {
        request_id: String,
        ticks: u32,
        elapsed: Duration,
    },

    #[error("PIN not accepted: {message}")]
    PinRejected { message: String },

    #[error("unknown payment request {0}")]
    UnknownRequest(String),

    #[error("payment request already resolved as {0}")]
    AlreadyResolved(PaymentStatus),

    #[error("stopped observing payment request {0}")]
    Abandoned(String),
}

impl PaymentError {
    /// Whether the operator may simply resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GatewayRejected { .. } | Self::GatewayUnavailable { .. } | Self::PinRejected { .. }
        )
    }
}
