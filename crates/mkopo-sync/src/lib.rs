//! Record Store access and offline-resilient annotation sync.

mod annotations;
mod error;
mod record;

#[cfg(feature = "http")]
pub mod http;

pub use annotations::{
    AnnotationSyncEngine, AnnotationView, EvictionLoss, PendingWrite, ReconcileReport,
    WriteOutcome,
};
pub use error::{AnnotationError, SyncError};
pub use record::{
    CommentDraft, Promise, PromiseDraft, PromiseStatus, PromiseType, RecordStore, RemoteComment,
};

#[cfg(feature = "http")]
pub use http::RecordStoreClient;
