//! Input validation for push-payment requests.
//!
//! Pure functions only. Everything here runs before any network call, so a
//! [`ValidationError`] always means nothing was sent to the gateway.
//!
//! # Phone numbers
//!
//! The gateway accepts Kenyan MSISDNs in the canonical 12-digit form
//! `2547XXXXXXXX`. [`normalize_phone`] rewrites the common local spellings
//! (`07…`, `7…`, `+254…`) into that form; [`validate_phone`] only accepts the
//! canonical form.
//!
//! # Amounts
//!
//! Amounts are capped by the daily transfer ceiling. Exceeding it is an error
//! unless the caller explicitly opts into [`AmountPolicy::ClampToCeiling`], in
//! which case [`apply_amount_policy`] reports the adjustment so it can be shown
//! to the operator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Daily transfer ceiling for a single push-payment.
pub const DAILY_TRANSFER_CEILING: f64 = 496_500.0;

const PHONE_LEN: usize = 12;
const PHONE_PREFIX: &str = "254";
const PIN_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("invalid phone number {0:?}: expected 12 digits starting with 254")]
    InvalidPhone(String),

    #[error("amount must be a positive number")]
    AmountTooSmall,

    #[error("amount {amount} exceeds the daily limit of {ceiling}")]
    AmountTooLarge { amount: f64, ceiling: f64 },

    #[error("PIN must be exactly 4 digits")]
    InvalidPin,

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// What to do with an amount above the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountPolicy {
    /// Reject the request with [`ValidationError::AmountTooLarge`].
    #[default]
    Reject,
    /// Collect the ceiling instead and report the adjustment.
    ClampToCeiling,
}

/// Result of applying an [`AmountPolicy`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckedAmount {
    pub amount: f64,
    /// The amount the operator asked for, when it was clamped.
    pub clamped_from: Option<f64>,
}

/// Accept exactly 12 ASCII digits beginning with `254`.
pub fn validate_phone(value: &str) -> Result<(), ValidationError> {
    let ok = value.len() == PHONE_LEN
        && value.starts_with(PHONE_PREFIX)
        && value.bytes().all(|b| b.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidPhone(value.to_string()))
    }
}

/// Rewrite common local spellings of a Kenyan number into `254XXXXXXXXX`.
///
/// Non-digits are stripped first. `0712345678` and `712345678` gain the
/// country code; anything else is returned digits-only and left for
/// [`validate_phone`] to judge.
pub fn normalize_phone(value: &str) -> String {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if let Some(rest) = digits.strip_prefix('0') {
        if rest.len() == 9 {
            return format!("{PHONE_PREFIX}{rest}");
        }
    }
    if digits.len() == 9 && digits.starts_with('7') {
        return format!("{PHONE_PREFIX}{digits}");
    }
    digits
}

/// Check an amount against the ceiling. Non-finite and non-positive amounts
/// are too small.
pub fn validate_amount(value: f64, ceiling: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ValidationError::AmountTooSmall);
    }
    if value > ceiling {
        return Err(ValidationError::AmountTooLarge {
            amount: value,
            ceiling,
        });
    }
    Ok(())
}

/// Validate an amount and apply `policy` when it exceeds the ceiling.
pub fn apply_amount_policy(
    value: f64,
    ceiling: f64,
    policy: AmountPolicy,
) -> Result<CheckedAmount, ValidationError> {
    match (validate_amount(value, ceiling), policy) {
        (Ok(()), _) => Ok(CheckedAmount {
            amount: value,
            clamped_from: None,
        }),
        (Err(ValidationError::AmountTooLarge { .. }), AmountPolicy::ClampToCeiling) => {
            Ok(CheckedAmount {
                amount: ceiling,
                clamped_from: Some(value),
            })
        }
        (Err(e), _) => Err(e),
    }
}

/// A manually relayed PIN is exactly four ASCII digits.
pub fn validate_pin(pin: &str) -> Result<(), ValidationError> {
    if pin.len() == PIN_LEN && pin.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ValidationError::InvalidPin)
    }
}

/// Trim `value` and reject it if nothing is left.
pub fn non_empty<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ValidationError::Empty(field))
    } else {
        Ok(trimmed)
    }
}
