//! Annotation sync: optimistic write, local fallback, eventual reconciliation.
//!
//! # Write protocol
//!
//! Each annotation moves through a small state machine:
//!
//! ```text
//! Materialized ──remote ok──▶ Synced
//!      │
//!      └──remote failed──▶ HeldLocally ──reconcile ok──▶ Synced
//! ```
//!
//! [`AnnotationSyncEngine::save`] materialises a PENDING_LOCAL annotation and
//! returns it at once; the remote write runs on a background task. If that
//! write fails the annotation is appended to the customer's cache partition
//! (`customer_comments_{id}`). [`AnnotationSyncEngine::reconcile`] later
//! replays held entries in creation order and drops each one from the
//! partition as soon as the Record Store confirms it.
//!
//! # Partition ownership
//!
//! A customer's partition is touched only by the background write of `save`
//! and by `reconcile`, and both hold that customer's partition lock for the
//! whole read-modify-write. Different customers never contend.
//!
//! # Bounded cache
//!
//! A partition keeps at most `cap` entries. Past the cap the oldest entries
//! are evicted; evicting an unsynced entry loses it for good. Each loss is
//! logged and reported as an [`EvictionLoss`] on the write outcome, never as
//! an error.
//!
//! # Confirmed but still cached
//!
//! If the Record Store confirms an entry but the partition cannot be
//! rewritten, the entry's local id is remembered in memory and the entry is
//! skipped on every later read until a rewrite succeeds.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use mkopo_core::annotation::sort_newest_first;
use mkopo_core::validate::non_empty;
use mkopo_core::{Annotation, AnnotationId, Config, merge_view};
use mkopo_store::{KvCache, comments_key, load_json, store_json, synced_comments_key};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::record::{CommentDraft, RecordStore};
use crate::AnnotationError;

/// Default per-customer cache bound.
pub const DEFAULT_CACHE_CAP: usize = 50;

/// How a background write ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The Record Store accepted the write; `annotation` carries the server id
    /// and replaces the optimistic entry identified by `local_id`.
    Synced {
        local_id: AnnotationId,
        annotation: Annotation,
    },
    /// The remote write failed; the annotation is held in the local cache.
    /// `evicted` lists older unsynced entries pushed out to make room.
    SavedLocally {
        annotation: Annotation,
        evicted: Vec<EvictionLoss>,
    },
    /// Neither the Record Store nor the local cache accepted the annotation.
    Unpersisted { annotation: Annotation, reason: String },
}

/// An annotation accepted by [`AnnotationSyncEngine::save`] whose remote write
/// may still be in flight.
#[derive(Debug)]
pub struct PendingWrite {
    pub annotation: Annotation,
    completion: JoinHandle<WriteOutcome>,
}

impl PendingWrite {
    /// Wait for the background write to finish.
    pub async fn outcome(self) -> Result<WriteOutcome, AnnotationError> {
        self.completion
            .await
            .map_err(|e| AnnotationError::Task(e.to_string()))
    }
}

/// Result of one [`AnnotationSyncEngine::reconcile`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Server-issued annotations for the entries that synced, in replay order.
    pub synced: Vec<Annotation>,
    /// Entries still held locally.
    pub remaining: usize,
}

/// Merged read view for one customer.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationView {
    /// SYNCED and PENDING_LOCAL annotations, newest first.
    pub annotations: Vec<Annotation>,
    /// True when the Record Store was unreachable and the synced part came
    /// from the last cached snapshot.
    pub from_snapshot: bool,
}

/// An unsynced annotation dropped by cache eviction.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionLoss {
    pub customer_id: String,
    pub annotation: Annotation,
}

struct Inner<S, C> {
    store: S,
    cache: C,
    cap: usize,
    partitions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Local ids the Record Store confirmed whose partition rewrite failed.
    confirmed: Mutex<HashMap<String, HashSet<AnnotationId>>>,
}

/// Optimistic-write / local-fallback / reconcile engine for annotations.
pub struct AnnotationSyncEngine<S, C> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for AnnotationSyncEngine<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, C> AnnotationSyncEngine<S, C>
where
    S: RecordStore + 'static,
    C: KvCache + 'static,
{
    pub fn new(store: S, cache: C) -> Self {
        Self::with_cap(store, cache, DEFAULT_CACHE_CAP)
    }

    /// Uses `comment_cache_cap` from the shared configuration.
    pub fn from_config(store: S, cache: C, config: &Config) -> Self {
        Self::with_cap(store, cache, config.comment_cache_cap)
    }

    /// `cap` is clamped to at least one entry.
    pub fn with_cap(store: S, cache: C, cap: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                cap: cap.max(1),
                partitions: Mutex::new(HashMap::new()),
                confirmed: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn cache(&self) -> &C {
        &self.inner.cache
    }

    /// Materialise an annotation and start writing it in the background.
    ///
    /// Returns immediately with a PENDING_LOCAL annotation. Must be called from
    /// within a Tokio runtime.
    pub fn save(
        &self,
        customer_id: &str,
        body: &str,
        author: &str,
    ) -> Result<PendingWrite, AnnotationError> {
        self.save_with(customer_id, body, author, None)
    }

    /// [`save`](Self::save) with the customer's display name attached to the
    /// remote write.
    pub fn save_with(
        &self,
        customer_id: &str,
        body: &str,
        author: &str,
        customer_name: Option<String>,
    ) -> Result<PendingWrite, AnnotationError> {
        let customer_id = non_empty(customer_id, "customer id")?;
        let body = non_empty(body, "comment body")?;
        let author = match author.trim() {
            "" => "Agent",
            a => a,
        };

        let mut annotation = Annotation::optimistic(customer_id, body, author, Utc::now());
        annotation.customer_name = customer_name;

        let engine = self.clone();
        let pending = annotation.clone();
        let completion = tokio::spawn(async move { engine.write_through(pending).await });
        Ok(PendingWrite {
            annotation,
            completion,
        })
    }

    async fn write_through(&self, annotation: Annotation) -> WriteOutcome {
        let customer_id = annotation.customer_id.clone();
        let lock = self.partition(&customer_id);
        let _guard = lock.lock().await;

        let draft = CommentDraft::from(&annotation);
        match self.inner.store.create_comment(&customer_id, &draft).await {
            Ok(server) => {
                if let Err(e) = self.forget_local(&customer_id, &annotation.id).await {
                    warn!(customer_id = %customer_id, error = %e, "could not clear local entry");
                    self.mark_confirmed(&customer_id, annotation.id.clone());
                }
                if let Err(e) = self.remember_synced(&customer_id, vec![server.clone()]).await {
                    warn!(customer_id = %customer_id, error = %e, "could not update synced snapshot");
                }
                info!(customer_id = %customer_id, id = %server.id, "annotation synced");
                WriteOutcome::Synced {
                    local_id: annotation.id,
                    annotation: server,
                }
            }
            Err(remote) => {
                warn!(
                    customer_id = %customer_id,
                    id = %annotation.id,
                    error = %remote,
                    "remote write failed, holding annotation locally"
                );
                match self.hold_locally(annotation.clone()).await {
                    Ok(evicted) => WriteOutcome::SavedLocally {
                        annotation,
                        evicted,
                    },
                    Err(cache) => {
                        error!(
                            customer_id = %customer_id,
                            id = %annotation.id,
                            error = %cache,
                            "annotation could not be held locally"
                        );
                        WriteOutcome::Unpersisted {
                            annotation,
                            reason: cache.to_string(),
                        }
                    }
                }
            }
        }
    }

    /// Replay every locally-held annotation for `customer_id`, oldest first.
    ///
    /// Stops at the first failure so later entries never overtake an earlier
    /// one; whatever did not sync stays PENDING_LOCAL. Each confirmed entry is
    /// removed from the partition before the next is attempted, so repeated
    /// calls never replay it. A failed partition rewrite does not abort the
    /// pass: the confirmed entry is skipped from then on.
    pub async fn reconcile(&self, customer_id: &str) -> Result<ReconcileReport, AnnotationError> {
        let lock = self.partition(customer_id);
        let _guard = lock.lock().await;

        let mut held = self.load_held(customer_id).await?;
        if held.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let mut synced = Vec::new();
        while let Some(entry) = held.first() {
            let draft = CommentDraft::from(entry);
            match self.inner.store.create_comment(customer_id, &draft).await {
                Ok(server) => {
                    let done = held.remove(0);
                    if let Err(e) = self.save_held(customer_id, &held).await {
                        error!(
                            customer_id,
                            id = %done.id,
                            error = %e,
                            "synced entry could not be cleared from the cache"
                        );
                        self.mark_confirmed(customer_id, done.id);
                    }
                    synced.push(server);
                }
                Err(e) => {
                    warn!(customer_id, error = %e, remaining = held.len(), "reconcile halted");
                    break;
                }
            }
        }

        if !synced.is_empty() {
            info!(customer_id, count = synced.len(), "reconciled local annotations");
            let refreshed = match self.inner.store.list_comments(customer_id).await {
                Ok(canonical) => self.replace_synced(customer_id, canonical).await,
                Err(e) => {
                    warn!(customer_id, error = %e, "refresh after reconcile failed");
                    self.remember_synced(customer_id, synced.clone()).await
                }
            };
            if let Err(e) = refreshed {
                warn!(customer_id, error = %e, "could not update synced snapshot");
            }
        }

        Ok(ReconcileReport {
            synced,
            remaining: held.len(),
        })
    }

    /// Merged SYNCED + PENDING_LOCAL view, newest first.
    ///
    /// Falls back to the last synced snapshot when the Record Store is
    /// unreachable. A failure to refresh the snapshot is logged and does not
    /// affect the returned view.
    pub async fn list(&self, customer_id: &str) -> Result<AnnotationView, AnnotationError> {
        let held = self.load_held(customer_id).await?;
        let (synced, from_snapshot) = match self.inner.store.list_comments(customer_id).await {
            Ok(canonical) => {
                if let Err(e) = self.replace_synced(customer_id, canonical.clone()).await {
                    warn!(customer_id, error = %e, "could not update synced snapshot");
                }
                (canonical, false)
            }
            Err(e) => {
                warn!(customer_id, error = %e, "record store unavailable, using cached comments");
                let snapshot: Vec<Annotation> =
                    load_json(&self.inner.cache, &synced_comments_key(customer_id))
                        .await?
                        .unwrap_or_default();
                (snapshot, true)
            }
        };
        Ok(AnnotationView {
            annotations: merge_view(synced, held),
            from_snapshot,
        })
    }

    /// Locally-held annotations for `customer_id`, oldest first.
    pub async fn pending(&self, customer_id: &str) -> Result<Vec<Annotation>, AnnotationError> {
        self.load_held(customer_id).await
    }

    fn partition(&self, customer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self
            .inner
            .partitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(map.entry(customer_id.to_string()).or_default())
    }

    fn confirmed(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashSet<AnnotationId>>> {
        self.inner
            .confirmed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_confirmed(&self, customer_id: &str, id: AnnotationId) {
        self.confirmed()
            .entry(customer_id.to_string())
            .or_default()
            .insert(id);
    }

    /// Held entries, oldest first, minus any the Record Store already has.
    async fn load_held(&self, customer_id: &str) -> Result<Vec<Annotation>, AnnotationError> {
        let mut held: Vec<Annotation> = load_json(&self.inner.cache, &comments_key(customer_id))
            .await?
            .unwrap_or_default();
        if let Some(done) = self.confirmed().get(customer_id) {
            held.retain(|a| !done.contains(&a.id));
        }
        held.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(held)
    }

    /// Rewrite the partition. `held` must come from [`load_held`](Self::load_held),
    /// so a successful write also clears the customer's confirmed ids.
    async fn save_held(&self, customer_id: &str, held: &[Annotation]) -> Result<(), AnnotationError> {
        let key = comments_key(customer_id);
        if held.is_empty() {
            self.inner.cache.remove(&key).await?;
        } else {
            store_json(&self.inner.cache, &key, held).await?;
        }
        self.confirmed().remove(customer_id);
        Ok(())
    }

    async fn hold_locally(&self, annotation: Annotation) -> Result<Vec<EvictionLoss>, AnnotationError> {
        let customer_id = annotation.customer_id.clone();
        let mut held = self.load_held(&customer_id).await?;
        held.retain(|a| a.id != annotation.id);
        held.push(annotation);
        held.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut losses = Vec::new();
        if held.len() > self.inner.cap {
            let overflow = held.len() - self.inner.cap;
            for evicted in held.drain(..overflow) {
                let loss = EvictionLoss {
                    customer_id: customer_id.clone(),
                    annotation: evicted,
                };
                warn!(
                    customer_id = %loss.customer_id,
                    id = %loss.annotation.id,
                    created_at = %loss.annotation.created_at,
                    "cache eviction dropped an unsynced annotation"
                );
                losses.push(loss);
            }
        }
        self.save_held(&customer_id, &held).await?;
        Ok(losses)
    }

    async fn forget_local(&self, customer_id: &str, id: &AnnotationId) -> Result<(), AnnotationError> {
        let mut held = self.load_held(customer_id).await?;
        let before = held.len();
        held.retain(|a| &a.id != id);
        if held.len() != before {
            self.save_held(customer_id, &held).await?;
        }
        Ok(())
    }

    async fn replace_synced(
        &self,
        customer_id: &str,
        mut canonical: Vec<Annotation>,
    ) -> Result<(), AnnotationError> {
        sort_newest_first(&mut canonical);
        canonical.truncate(self.inner.cap);
        store_json(&self.inner.cache, &synced_comments_key(customer_id), &canonical).await?;
        Ok(())
    }

    async fn remember_synced(
        &self,
        customer_id: &str,
        fresh: Vec<Annotation>,
    ) -> Result<(), AnnotationError> {
        let snapshot: Vec<Annotation> =
            load_json(&self.inner.cache, &synced_comments_key(customer_id))
                .await?
                .unwrap_or_default();
        self.replace_synced(customer_id, merge_view(fresh, snapshot)).await
    }
}
