//! Operator annotations (customer comments).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Comment category sent to the Record Store.
pub const DEFAULT_COMMENT_TYPE: &str = "follow_up";

/// Identity of an annotation.
///
/// Server ids and client-minted ids live in separate variants, so a local id
/// can never be mistaken for (or collide with) a server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationId {
    Server(String),
    Local(Uuid),
}

impl AnnotationId {
    /// Mint a fresh local id. Collision-free across concurrent callers.
    pub fn mint_local() -> Self {
        Self::Local(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for AnnotationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => f.write_str(id),
            Self::Local(id) => write!(f, "local:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Synced,
    /// Held in the local cache because the remote write failed.
    PendingLocal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: AnnotationId,
    pub customer_id: String,
    pub body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub sync_state: SyncState,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub customer_name: Option<String>,
}

fn default_kind() -> String {
    DEFAULT_COMMENT_TYPE.to_string()
}

impl Annotation {
    /// A freshly materialised, not-yet-confirmed annotation.
    ///
    /// `body` is expected to be trimmed and non-empty already.
    pub fn optimistic(
        customer_id: impl Into<String>,
        body: impl Into<String>,
        author: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AnnotationId::mint_local(),
            customer_id: customer_id.into(),
            body: body.into(),
            author: author.into(),
            created_at,
            sync_state: SyncState::PendingLocal,
            kind: default_kind(),
            customer_name: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.sync_state == SyncState::PendingLocal
    }
}

/// Merge synced and locally-held annotations for display, newest first.
///
/// Entries appearing in both lists (same id) are kept once, preferring the
/// synced copy.
pub fn merge_view(synced: Vec<Annotation>, pending: Vec<Annotation>) -> Vec<Annotation> {
    let mut merged = synced;
    for p in pending {
        if !merged.iter().any(|a| a.id == p.id) {
            merged.push(p);
        }
    }
    sort_newest_first(&mut merged);
    merged
}

/// Sort by `created_at` descending; ties keep their relative order.
pub fn sort_newest_first(annotations: &mut [Annotation]) {
    annotations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
