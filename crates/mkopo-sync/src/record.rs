//! Record Store contract and wire types.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mkopo_core::annotation::DEFAULT_COMMENT_TYPE;
use mkopo_core::{Annotation, AnnotationId, SyncState, Transaction};
use serde::{Deserialize, Serialize};

use crate::SyncError;

/// Record Store operations the core consumes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Most recent transactions for a customer, newest first.
    async fn list_transactions(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>, SyncError>;

    /// Canonical (synced) annotations for a customer.
    async fn list_comments(&self, customer_id: &str) -> Result<Vec<Annotation>, SyncError>;

    /// Write an annotation; returns the server-issued record.
    async fn create_comment(
        &self,
        customer_id: &str,
        draft: &CommentDraft,
    ) -> Result<Annotation, SyncError>;

    async fn list_promises(&self, customer_id: &str, limit: usize)
    -> Result<Vec<Promise>, SyncError>;

    async fn create_promise(&self, draft: &PromiseDraft) -> Result<Promise, SyncError>;

    async fn update_promise_status(
        &self,
        promise_id: &str,
        status: PromiseStatus,
    ) -> Result<Promise, SyncError>;
}

/// Body of `POST /customers/{id}/comments`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentDraft {
    pub comment: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub customer_name: String,
}

impl From<&Annotation> for CommentDraft {
    fn from(a: &Annotation) -> Self {
        Self {
            comment: a.body.clone(),
            kind: a.kind.clone(),
            customer_name: a.customer_name.clone().unwrap_or_default(),
        }
    }
}

/// A comment as the Record Store returns it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteComment {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub comment: String,
    #[serde(default)]
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
}

impl RemoteComment {
    /// Convert to a SYNCED annotation. `customer_id` fills in when the server
    /// omits it.
    pub fn into_annotation(self, customer_id: &str) -> Annotation {
        Annotation {
            id: AnnotationId::Server(self.id),
            customer_id: self.customer_id.unwrap_or_else(|| customer_id.to_string()),
            body: self.comment,
            author: self.author.unwrap_or_else(|| "Agent".to_string()),
            created_at: self.created_at,
            sync_state: SyncState::Synced,
            kind: self.kind.unwrap_or_else(|| DEFAULT_COMMENT_TYPE.to_string()),
            customer_name: self.customer_name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromiseStatus {
    Pending,
    Fulfilled,
    Broken,
    Rescheduled,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromiseType {
    FullPayment,
    PartialPayment,
}

/// A customer's promise to pay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Promise {
    #[serde(alias = "_id")]
    pub promise_id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub promise_amount: f64,
    /// As sent by the server: a date or a full timestamp.
    pub promise_date: String,
    pub promise_type: PromiseType,
    pub status: PromiseStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Body of `POST /promises`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromiseDraft {
    pub customer_id: String,
    pub promise_amount: f64,
    pub promise_date: NaiveDate,
    pub promise_type: PromiseType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PromiseDraft {
    /// Promise amounts must be positive and finite.
    pub fn validate(&self) -> Result<(), mkopo_core::ValidationError> {
        mkopo_core::validate::non_empty(&self.customer_id, "customer id")?;
        if !self.promise_amount.is_finite() || self.promise_amount <= 0.0 {
            return Err(mkopo_core::ValidationError::AmountTooSmall);
        }
        Ok(())
    }
}
