//! Closed status enumerations for push-payment transactions.
//!
//! The gateway and the Record Store report statuses as loosely-typed strings
//! (`"success"`, `"SUCCESS"`, `"Success"`, and a few legacy aliases from the
//! console). Everything inside the core compares [`PaymentStatus`] values; raw
//! strings are parsed once, at the boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lifecycle status of a push-payment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentStatus {
    Initiated,
    Pending,
    Success,
    Failed,
    Expired,
    Cancelled,
}

impl PaymentStatus {
    /// Parse a status string from an external service.
    ///
    /// Comparison is case-insensitive. The console's legacy vocabulary is
    /// accepted too: `initiating` → INITIATED, `completed` → SUCCESS,
    /// `timeout` → EXPIRED.
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim().to_ascii_lowercase();
        let status = match s.as_str() {
            "initiated" | "initiating" => Self::Initiated,
            "pending" => Self::Pending,
            "success" | "completed" => Self::Success,
            "failed" => Self::Failed,
            "expired" | "timeout" => Self::Expired,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => return None,
        };
        Some(status)
    }

    /// Canonical upper-case wire form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// SUCCESS, FAILED, EXPIRED and CANCELLED admit no further transition.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// INITIATED and PENDING block a new request for the same customer.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Initiated | Self::Pending)
    }

    /// Operator-facing label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Initiated => "Initiated",
            Self::Pending => "Pending",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Expired => "Expired",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown payment status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl Serialize for PaymentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PaymentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Deserialize an optional status leniently: missing, null or unrecognised
/// values become `None` instead of failing the whole record.
pub fn lenient<'de, D>(deserializer: D) -> Result<Option<PaymentStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(PaymentStatus::parse))
}

/// Why a payment ended in FAILED, as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    InsufficientFunds,
    TechnicalError,
    WrongPin,
    UserCancelled,
    NetworkError,
    Expired,
    #[serde(other)]
    Other,
}

impl FailureReason {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INSUFFICIENT_FUNDS" => Self::InsufficientFunds,
            "TECHNICAL_ERROR" => Self::TechnicalError,
            "WRONG_PIN" => Self::WrongPin,
            "USER_CANCELLED" => Self::UserCancelled,
            "NETWORK_ERROR" => Self::NetworkError,
            "EXPIRED" => Self::Expired,
            _ => Self::Other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::InsufficientFunds => "Insufficient Funds",
            Self::TechnicalError => "Technical Error",
            Self::WrongPin => "Wrong PIN",
            Self::UserCancelled => "User Cancelled",
            Self::NetworkError => "Network Error",
            Self::Expired => "Expired",
            Self::Other => "Other",
        }
    }
}
