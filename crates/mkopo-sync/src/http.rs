//! HTTP client for the Record Store's customer, transaction, comment and
//! promise endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use mkopo_core::{Annotation, ApiEnvelope, BearerSource, Config, StaticBearer, Transaction};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::record::{
    CommentDraft, Promise, PromiseDraft, PromiseStatus, RecordStore, RemoteComment,
};
use crate::SyncError;

/// HTTP client for the Record Store REST API.
#[derive(Clone)]
pub struct RecordStoreClient {
    client: reqwest::Client,
    base_url: String,
    bearer: Arc<dyn BearerSource>,
}

#[derive(Deserialize)]
struct CommentList {
    #[serde(default)]
    comments: Vec<RemoteComment>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CreatedComment {
    Wrapped { comment: RemoteComment },
    Bare(RemoteComment),
}

#[derive(Deserialize)]
struct PromiseList {
    #[serde(default)]
    promises: Vec<Promise>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OnePromise {
    Wrapped { promise: Promise },
    Bare(Promise),
}

impl OnePromise {
    fn into_inner(self) -> Promise {
        match self {
            Self::Wrapped { promise } | Self::Bare(promise) => promise,
        }
    }
}

impl RecordStoreClient {
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

    /// Build from shared configuration, applying the request timeout.
    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            ..Self::new(config.record_store_base_url.clone())
        })
    }

    pub fn with_bearer(mut self, bearer: Arc<dyn BearerSource>) -> Self {
        self.bearer = bearer;
        self
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, SyncError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| SyncError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| SyncError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.bearer.bearer() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, SyncError> {
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Server {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp.bytes().await?;
        let envelope: ApiEnvelope<T> = serde_json::from_slice(&bytes)?;
        envelope.into_result().map_err(SyncError::Rejected)
    }
}

#[async_trait]
impl RecordStore for RecordStoreClient {
    async fn list_transactions(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>, SyncError> {
        let url = self.endpoint(&["transactions"])?;
        let limit = limit.to_string();
        let req = self.client.get(url).query(&[
            ("customerId", customer_id),
            ("limit", limit.as_str()),
            ("sort", "-createdAt"),
        ]);
        let transactions: Vec<Transaction> = self.send(req).await?;
        info!(customer_id, count = transactions.len(), "fetched transactions");
        Ok(transactions)
    }

    async fn list_comments(&self, customer_id: &str) -> Result<Vec<Annotation>, SyncError> {
        let url = self.endpoint(&["customers", customer_id, "comments"])?;
        let list: CommentList = self.send(self.client.get(url)).await?;
        info!(customer_id, count = list.comments.len(), "fetched comments");
        Ok(list
            .comments
            .into_iter()
            .map(|c| c.into_annotation(customer_id))
            .collect())
    }

    async fn create_comment(
        &self,
        customer_id: &str,
        draft: &CommentDraft,
    ) -> Result<Annotation, SyncError> {
        let url = self.endpoint(&["customers", customer_id, "comments"])?;
        info!(url = %url, "posting comment");
        let created: CreatedComment = self.send(self.client.post(url).json(draft)).await?;
        let remote = match created {
            CreatedComment::Wrapped { comment } | CreatedComment::Bare(comment) => comment,
        };
        Ok(remote.into_annotation(customer_id))
    }

    async fn list_promises(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<Promise>, SyncError> {
        let url = self.endpoint(&["promises", "customer", customer_id])?;
        let req = self.client.get(url).query(&[("limit", limit)]);
        let list: PromiseList = self.send(req).await?;
        Ok(list.promises)
    }

    async fn create_promise(&self, draft: &PromiseDraft) -> Result<Promise, SyncError> {
        draft
            .validate()
            .map_err(|e| SyncError::Rejected(e.to_string()))?;
        let url = self.endpoint(&["promises"])?;
        info!(customer_id = %draft.customer_id, amount = draft.promise_amount, "creating promise");
        let created: OnePromise = self.send(self.client.post(url).json(draft)).await?;
        Ok(created.into_inner())
    }

    async fn update_promise_status(
        &self,
        promise_id: &str,
        status: PromiseStatus,
    ) -> Result<Promise, SyncError> {
        let url = self.endpoint(&["promises", promise_id, "status"])?;
        info!(promise_id, ?status, "updating promise status");
        let body = serde_json::json!({ "status": status });
        let updated: OnePromise = self.send(self.client.patch(url).json(&body)).await?;
        Ok(updated.into_inner())
    }
}
