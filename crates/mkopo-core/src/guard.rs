//! Transaction guard: "at most one non-terminal payment per customer".
//!
//! A pure projection over the most recently fetched transaction list. It does
//! not fetch anything; callers re-evaluate it every time the list refreshes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{self, PaymentStatus};

/// A transaction as listed by the Record Store.
///
/// `status` is normalised on the way in; a status string the core does not
/// recognise deserialises to `None` and never counts as active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default, alias = "_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default, deserialize_with = "status::lenient")]
    pub status: Option<PaymentStatus>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub mpesa_receipt_number: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn is_active(&self) -> bool {
        self.status.is_some_and(PaymentStatus::is_active)
    }
}

/// True iff any transaction is INITIATED or PENDING.
pub fn has_active_transaction(transactions: &[Transaction]) -> bool {
    transactions.iter().any(Transaction::is_active)
}

/// Status of the first active transaction, for display.
pub fn active_status(transactions: &[Transaction]) -> Option<PaymentStatus> {
    transactions
        .iter()
        .find(|tx| tx.is_active())
        .and_then(|tx| tx.status)
}
