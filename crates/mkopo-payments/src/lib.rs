//! Push-payment initiation, status polling and resolution.

mod error;
mod gateway;
mod orchestrator;
mod poller;
mod watcher;

#[cfg(feature = "http")]
pub mod http;

pub use error::{GatewayError, PaymentError};
pub use gateway::{Acceptance, InitiateRequest, PaymentGateway, PinConfirmation, StatusReport};
pub use orchestrator::{
    ExpirySource, OrchestratorSettings, PaymentEvent, PaymentOrchestrator, PaymentPhase,
    Resolution,
};
pub use poller::{MIN_INTERVAL, PollEvent, PollSettings, Poller};
pub use watcher::{TransactionWatcher, WatchSettings};

#[cfg(feature = "http")]
pub use http::GatewayClient;
