pub mod annotation;
pub mod api;
pub mod config;
pub mod guard;
pub mod payment;
pub mod status;
pub mod validate;

pub use annotation::{Annotation, AnnotationId, SyncState, merge_view};
pub use api::{ApiEnvelope, BearerSource, StaticBearer};
pub use config::{Config, ConfigError};
pub use guard::{Transaction, active_status, has_active_transaction};
pub use payment::{PaymentDraft, PaymentRequest, TransitionError};
pub use status::{FailureReason, PaymentStatus};
pub use validate::{AmountPolicy, ValidationError, validate_amount, validate_phone, validate_pin};
