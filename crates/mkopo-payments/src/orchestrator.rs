//! Payment orchestration: initiate, poll, resolve.
//!
//! Each accepted request gets its own [`Poller`]. Poll results are applied to
//! the request under the orchestrator's book lock, and only while the request
//! is still [`PaymentPhase::Polling`]. That single check gives both
//! guarantees callers rely on:
//!
//! - a resolved request never changes again, whatever later polls report;
//! - once [`PaymentOrchestrator::cancel`] returns, a response still in flight
//!   for that request is dropped on arrival.
//!
//! Lock order is poller gate, then book. Nothing holds the book lock while
//! stopping a poller.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use mkopo_core::validate::{self, DAILY_TRANSFER_CEILING};
use mkopo_core::{
    Config, FailureReason, PaymentDraft, PaymentRequest, PaymentStatus, Transaction,
    active_status, has_active_transaction,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::gateway::{InitiateRequest, PaymentGateway, StatusReport};
use crate::poller::{PollEvent, PollSettings, Poller};
use crate::{GatewayError, PaymentError};

const EVENT_CAPACITY: usize = 64;
const DEFAULT_DESCRIPTION: &str = "Loan repayment";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorSettings {
    pub poll: PollSettings,
    pub ceiling: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll: PollSettings::default(),
            ceiling: DAILY_TRANSFER_CEILING,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll: PollSettings::from_config(config),
            ceiling: config.daily_ceiling,
        }
    }
}

/// Who decided a request had expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirySource {
    /// The gateway reported EXPIRED.
    Gateway,
    /// Polling ran out of time without a terminal status.
    PollTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Success,
    Failed,
    Expired(ExpirySource),
    Cancelled,
}

/// Where an accepted request stands, locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentPhase {
    Polling,
    Resolved(Resolution),
    /// Observation was cancelled; the gateway may still settle the payment.
    Abandoned,
}

/// Published on [`PaymentOrchestrator::subscribe`].
#[derive(Debug, Clone)]
pub enum PaymentEvent {
    Accepted(PaymentRequest),
    Resolved {
        request: PaymentRequest,
        resolution: Resolution,
        ticks: u32,
    },
    Abandoned {
        request_id: String,
    },
    SubmitFailed {
        customer_id: String,
        message: String,
    },
}

struct Tracked {
    request: PaymentRequest,
    phase: watch::Sender<PaymentPhase>,
    poller: Option<Poller>,
    ticks: u32,
    timed_out_after: Option<Duration>,
}

impl Tracked {
    fn phase(&self) -> PaymentPhase {
        *self.phase.borrow()
    }

    fn is_polling(&self) -> bool {
        self.phase() == PaymentPhase::Polling
    }

    /// Record the outcome and hand back the poller for disposal.
    fn settle(&mut self, resolution: Resolution) -> Option<Poller> {
        self.phase.send_replace(PaymentPhase::Resolved(resolution));
        self.poller.take()
    }

    fn resolved_event(&self, resolution: Resolution) -> PaymentEvent {
        PaymentEvent::Resolved {
            request: self.request.clone(),
            resolution,
            ticks: self.ticks,
        }
    }
}

#[derive(Default)]
struct Book {
    requests: HashMap<String, Tracked>,
    /// Customers with a submission awaiting the gateway's answer.
    submitting: HashSet<String>,
    /// Latest transaction list seen per customer.
    observed: HashMap<String, Vec<Transaction>>,
}

impl Book {
    /// Status that blocks a new request for `customer_id`, if any.
    fn active_status(&self, customer_id: &str) -> Option<PaymentStatus> {
        if self.submitting.contains(customer_id) {
            return Some(PaymentStatus::Initiated);
        }
        // Abandoned requests still block until the gateway's final status
        // is observed or the caller forgets them.
        let tracked = self
            .requests
            .values()
            .filter(|t| t.request.customer_id == customer_id)
            .map(|t| t.request.status)
            .find(|s| s.is_active());
        tracked.or_else(|| {
            self.observed
                .get(customer_id)
                .and_then(|list| active_status(list))
        })
    }

    /// Drop requests for `customer_id` that can no longer block anyone.
    fn prune_settled(&mut self, customer_id: &str) -> usize {
        let before = self.requests.len();
        self.requests.retain(|_, t| {
            t.request.customer_id != customer_id || t.is_polling() || t.request.status.is_active()
        });
        before - self.requests.len()
    }

    /// Settle abandoned requests whose final status shows up in `list`.
    fn settle_abandoned(&mut self, list: &[Transaction], at: chrono::DateTime<Utc>) {
        for tx in list {
            let Some(status) = tx.status.filter(|s| s.is_terminal()) else {
                continue;
            };
            let ids = [tx.transaction_id.as_deref(), tx.id.as_deref()];
            for id in ids.into_iter().flatten() {
                let Some(tracked) = self.requests.get_mut(id) else {
                    continue;
                };
                if tracked.phase() != PaymentPhase::Abandoned || !tracked.request.status.is_active() {
                    continue;
                }
                if tracked.request.advance(status, at).is_ok() {
                    tracked.request.receipt = tx.mpesa_receipt_number.clone();
                    info!(request_id = id, status = %status, "abandoned request settled by gateway");
                }
            }
        }
    }
}

struct Inner<G> {
    gateway: Arc<G>,
    settings: OrchestratorSettings,
    book: Mutex<Book>,
    events: broadcast::Sender<PaymentEvent>,
}

impl<G> Inner<G> {
    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: PaymentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Apply one poll result to `request_id`. Ignored unless still polling.
    fn apply_poll(&self, request_id: &str, event: PollEvent<StatusReport>) {
        let mut book = self.book();
        let Some(tracked) = book.requests.get_mut(request_id) else {
            return;
        };
        if !tracked.is_polling() {
            debug!(request_id, "ignoring poll result for settled request");
            return;
        }

        let now = Utc::now();
        let resolution = match event {
            PollEvent::Observed { tick, value } => {
                tracked.ticks = tick;
                apply_report(&mut tracked.request, value, now)
            }
            PollEvent::Finished { tick, value } => {
                tracked.ticks = tick;
                apply_report(&mut tracked.request, value, now)
            }
            PollEvent::TimedOut { ticks, elapsed } => {
                tracked.ticks = ticks;
                tracked.timed_out_after = Some(elapsed);
                if tracked.request.advance(PaymentStatus::Expired, now).is_ok() {
                    tracked.request.failure_reason = Some(FailureReason::Expired);
                }
                warn!(request_id, ticks, ?elapsed, "no final status before poll timeout");
                Some(Resolution::Expired(ExpirySource::PollTimeout))
            }
        };
        let Some(resolution) = resolution else {
            return;
        };

        // Dropping our own poller here only aborts its task.
        let _poller = tracked.settle(resolution);
        let event = tracked.resolved_event(resolution);
        info!(
            request_id,
            customer_id = %tracked.request.customer_id,
            status = %tracked.request.status,
            ticks = tracked.ticks,
            "payment request resolved"
        );
        drop(book);
        self.emit(event);
    }
}

/// Fold a gateway status report into `request`. Returns the resolution when
/// the report is terminal.
fn apply_report(
    request: &mut PaymentRequest,
    report: StatusReport,
    at: chrono::DateTime<Utc>,
) -> Option<Resolution> {
    let status = report.status?;
    match status {
        PaymentStatus::Initiated | PaymentStatus::Pending => {
            // A late INITIATED after PENDING is not a step forward.
            let _ = request.advance(status, at);
            None
        }
        PaymentStatus::Success => {
            request.advance(status, at).ok()?;
            request.receipt = report.receipt;
            Some(Resolution::Success)
        }
        PaymentStatus::Failed => {
            let reason = report.failure();
            request.fail(reason, report.error_message, at).ok()?;
            Some(Resolution::Failed)
        }
        PaymentStatus::Expired => {
            request.advance(status, at).ok()?;
            request.failure_reason = Some(FailureReason::Expired);
            Some(Resolution::Expired(ExpirySource::Gateway))
        }
        PaymentStatus::Cancelled => {
            request.advance(status, at).ok()?;
            request.error_message = report.error_message;
            Some(Resolution::Cancelled)
        }
    }
}

/// Releases a customer's submission slot when the submission ends, however
/// it ends.
struct Submission<'a, G> {
    inner: &'a Inner<G>,
    customer_id: String,
}

impl<G> Drop for Submission<'_, G> {
    fn drop(&mut self) {
        self.inner.book().submitting.remove(&self.customer_id);
    }
}

/// Drives push-payment requests from submission to a final status.
pub struct PaymentOrchestrator<G> {
    inner: Arc<Inner<G>>,
}

impl<G> Clone for PaymentOrchestrator<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: PaymentGateway + 'static> PaymentOrchestrator<G> {
    pub fn new(gateway: Arc<G>, settings: OrchestratorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                gateway,
                settings,
                book: Mutex::new(Book::default()),
                events,
            }),
        }
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.inner.gateway
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PaymentEvent> {
        self.inner.events.subscribe()
    }

    /// Validate, check the guard, and submit to the gateway.
    ///
    /// On acceptance the returned request is PENDING and a poller is running
    /// for it. On any error no poller is started.
    pub async fn initiate(&self, draft: PaymentDraft) -> Result<PaymentRequest, PaymentError> {
        let customer_id = validate::non_empty(&draft.customer_id, "customer id")?.to_string();
        let alternative = draft.alternative_phone_number.is_some();
        let phone = validate::normalize_phone(draft.target_phone());
        validate::validate_phone(&phone)?;
        let original_phone = alternative.then(|| validate::normalize_phone(&draft.phone_number));
        let checked =
            validate::apply_amount_policy(draft.amount, self.inner.settings.ceiling, draft.amount_policy)?;
        if let Some(requested) = checked.clamped_from {
            info!(customer_id = %customer_id, requested, amount = checked.amount, "amount clamped to ceiling");
        }

        let _submission = {
            let mut book = self.inner.book();
            if let Some(status) = book.active_status(&customer_id) {
                return Err(PaymentError::DuplicateActiveTransaction {
                    customer_id,
                    status,
                });
            }
            book.submitting.insert(customer_id.clone());
            Submission {
                inner: self.inner.as_ref(),
                customer_id: customer_id.clone(),
            }
        };

        let submit = InitiateRequest {
            phone_number: phone.clone(),
            amount: checked.amount,
            customer_id: customer_id.clone(),
            description: draft
                .description
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            is_alternative_number: alternative,
            original_phone_number: original_phone.clone(),
            initiated_by: draft.initiated_by,
        };

        let accepted = match self.inner.gateway.initiate(&submit).await {
            Ok(accepted) => accepted,
            Err(e) => {
                let err = submit_error(e);
                warn!(customer_id = %customer_id, error = %err, "payment submission failed");
                self.inner.emit(PaymentEvent::SubmitFailed {
                    customer_id,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        let now = Utc::now();
        let request_id = accepted.transaction_id;
        let mut request = PaymentRequest {
            id: Some(request_id.clone()),
            customer_id,
            phone_number: phone,
            original_phone_number: original_phone,
            amount: checked.amount,
            clamped_from: checked.clamped_from,
            status: PaymentStatus::Initiated,
            initiated_at: now,
            resolved_at: None,
            failure_reason: None,
            error_message: None,
            receipt: None,
        };
        request
            .advance(PaymentStatus::Pending, now)
            .map_err(|e| PaymentError::GatewayRejected {
                message: e.to_string(),
            })?;

        {
            let mut book = self.inner.book();
            let pruned = book.prune_settled(&request.customer_id);
            if pruned > 0 {
                debug!(customer_id = %request.customer_id, pruned, "dropped settled requests");
            }
            let poller = self.spawn_poller(request_id.clone());
            let (phase, _) = watch::channel(PaymentPhase::Polling);
            book.requests.insert(
                request_id.clone(),
                Tracked {
                    request: request.clone(),
                    phase,
                    poller: Some(poller),
                    ticks: 0,
                    timed_out_after: None,
                },
            );
        }
        info!(
            request_id = %request_id,
            customer_id = %request.customer_id,
            gateway_status = ?accepted.status,
            amount = request.amount,
            "payment request accepted, polling"
        );
        self.inner.emit(PaymentEvent::Accepted(request.clone()));
        Ok(request)
    }

    fn spawn_poller(&self, request_id: String) -> Poller {
        let gateway = Arc::clone(&self.inner.gateway);
        let probe_id = request_id.clone();
        let probe = move |tick: u32| {
            let gateway = Arc::clone(&gateway);
            let request_id = probe_id.clone();
            async move {
                match gateway.status(&request_id).await {
                    Ok(report) => Some(report),
                    Err(e) => {
                        debug!(request_id = %request_id, tick, error = %e, "status poll failed");
                        None
                    }
                }
            }
            .boxed()
        };

        let inner: Weak<Inner<G>> = Arc::downgrade(&self.inner);
        let sink = move |event: PollEvent<StatusReport>| {
            if let Some(inner) = inner.upgrade() {
                inner.apply_poll(&request_id, event);
            }
        };

        Poller::spawn(self.inner.settings.poll, probe, StatusReport::is_terminal, sink)
    }

    /// Stop observing a request. The gateway is not asked to cancel anything.
    ///
    /// Cancelling a request that already settled, or was already abandoned,
    /// changes nothing.
    pub fn cancel(&self, request_id: &str) -> Result<(), PaymentError> {
        let poller = {
            let mut book = self.inner.book();
            let tracked = book
                .requests
                .get_mut(request_id)
                .ok_or_else(|| PaymentError::UnknownRequest(request_id.to_string()))?;
            if !tracked.is_polling() {
                return Ok(());
            }
            tracked.phase.send_replace(PaymentPhase::Abandoned);
            tracked.poller.take()
        };
        if let Some(poller) = poller {
            poller.stop();
        }
        info!(request_id, "stopped observing payment request");
        self.inner.emit(PaymentEvent::Abandoned {
            request_id: request_id.to_string(),
        });
        Ok(())
    }

    /// Resolve a request with a PIN the operator relayed out of band.
    pub async fn submit_manual_pin(
        &self,
        request_id: &str,
        pin: &str,
    ) -> Result<PaymentRequest, PaymentError> {
        validate::validate_pin(pin)?;
        self.ensure_polling(request_id)?;

        let confirmation = match self.inner.gateway.process_pin(request_id, pin).await {
            Ok(c) if c.success => c,
            Ok(_) => {
                return Err(PaymentError::PinRejected {
                    message: "gateway did not confirm the PIN".to_string(),
                });
            }
            Err(e) if e.is_network() => {
                return Err(PaymentError::GatewayUnavailable {
                    message: e.message(),
                });
            }
            Err(e) => {
                return Err(PaymentError::PinRejected {
                    message: e.message(),
                });
            }
        };

        let (poller, request, event) = {
            let mut book = self.inner.book();
            let tracked = book
                .requests
                .get_mut(request_id)
                .ok_or_else(|| PaymentError::UnknownRequest(request_id.to_string()))?;
            match tracked.phase() {
                PaymentPhase::Polling => {}
                // The poller saw the same outcome first.
                PaymentPhase::Resolved(Resolution::Success) => return Ok(tracked.request.clone()),
                PaymentPhase::Resolved(_) => {
                    return Err(PaymentError::AlreadyResolved(tracked.request.status));
                }
                PaymentPhase::Abandoned => {
                    return Err(PaymentError::Abandoned(request_id.to_string()));
                }
            }
            tracked
                .request
                .advance(PaymentStatus::Success, Utc::now())
                .map_err(|_| PaymentError::AlreadyResolved(tracked.request.status))?;
            tracked.request.receipt = confirmation.receipt;
            let poller = tracked.settle(Resolution::Success);
            let event = tracked.resolved_event(Resolution::Success);
            (poller, tracked.request.clone(), event)
        };
        if let Some(poller) = poller {
            poller.stop();
        }
        info!(request_id, receipt = ?request.receipt, "payment confirmed by manual PIN");
        self.inner.emit(event);
        Ok(request)
    }

    fn ensure_polling(&self, request_id: &str) -> Result<(), PaymentError> {
        let book = self.inner.book();
        let tracked = book
            .requests
            .get(request_id)
            .ok_or_else(|| PaymentError::UnknownRequest(request_id.to_string()))?;
        match tracked.phase() {
            PaymentPhase::Polling => Ok(()),
            PaymentPhase::Resolved(_) => Err(PaymentError::AlreadyResolved(tracked.request.status)),
            PaymentPhase::Abandoned => Err(PaymentError::Abandoned(request_id.to_string())),
        }
    }

    /// Wait until the request leaves [`PaymentPhase::Polling`].
    ///
    /// A synthetic expiry comes back as [`PaymentError::PollTimeout`]; a
    /// gateway-reported one is an ordinary resolved request.
    pub async fn wait_for_resolution(&self, request_id: &str) -> Result<PaymentRequest, PaymentError> {
        let mut rx = {
            let book = self.inner.book();
            let tracked = book
                .requests
                .get(request_id)
                .ok_or_else(|| PaymentError::UnknownRequest(request_id.to_string()))?;
            tracked.phase.subscribe()
        };
        let phase = *rx
            .wait_for(|p| *p != PaymentPhase::Polling)
            .await
            .map_err(|_| PaymentError::Abandoned(request_id.to_string()))?;

        let book = self.inner.book();
        let tracked = book
            .requests
            .get(request_id)
            .ok_or_else(|| PaymentError::UnknownRequest(request_id.to_string()))?;
        match phase {
            PaymentPhase::Resolved(Resolution::Expired(ExpirySource::PollTimeout)) => {
                Err(PaymentError::PollTimeout {
                    request_id: request_id.to_string(),
                    ticks: tracked.ticks,
                    elapsed: tracked.timed_out_after.unwrap_or_default(),
                })
            }
            PaymentPhase::Resolved(_) => Ok(tracked.request.clone()),
            PaymentPhase::Abandoned | PaymentPhase::Polling => {
                Err(PaymentError::Abandoned(request_id.to_string()))
            }
        }
    }

    pub fn request(&self, request_id: &str) -> Option<PaymentRequest> {
        self.inner
            .book()
            .requests
            .get(request_id)
            .map(|t| t.request.clone())
    }

    pub fn phase(&self, request_id: &str) -> Option<PaymentPhase> {
        self.inner.book().requests.get(request_id).map(Tracked::phase)
    }

    /// Poll ticks that produced a status for this request.
    pub fn ticks(&self, request_id: &str) -> Option<u32> {
        self.inner.book().requests.get(request_id).map(|t| t.ticks)
    }

    /// Drop a settled or abandoned request from the book. Requests still
    /// polling stay.
    ///
    /// Forgetting an abandoned request that is still INITIATED or PENDING
    /// releases the customer for a new request. Settled requests for a
    /// customer are also dropped on that customer's next accepted request.
    pub fn forget(&self, request_id: &str) -> bool {
        let mut book = self.inner.book();
        match book.requests.get(request_id) {
            Some(t) if !t.is_polling() => book.requests.remove(request_id).is_some(),
            _ => false,
        }
    }

    /// Record the latest transaction list fetched for a customer. The guard
    /// is evaluated against it on every [`initiate`](Self::initiate).
    ///
    /// Abandoned requests that appear in the list with a final status are
    /// settled. A list with nothing active is not kept.
    pub fn observe_transactions(&self, customer_id: &str, transactions: Vec<Transaction>) {
        let mut book = self.inner.book();
        book.settle_abandoned(&transactions, Utc::now());
        if has_active_transaction(&transactions) {
            book.observed.insert(customer_id.to_string(), transactions);
        } else {
            book.observed.remove(customer_id);
        }
    }

    /// The status blocking a new request for `customer_id`, if any.
    pub fn active_status(&self, customer_id: &str) -> Option<PaymentStatus> {
        self.inner.book().active_status(customer_id)
    }

    pub fn has_active_transaction(&self, customer_id: &str) -> bool {
        self.active_status(customer_id).is_some()
    }
}

fn submit_error(e: GatewayError) -> PaymentError {
    if e.is_network() {
        PaymentError::GatewayUnavailable { message: e.message() }
    } else {
        PaymentError::GatewayRejected { message: e.message() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use mkopo_core::{AmountPolicy, ValidationError};
    use tokio::sync::Notify;

    use crate::gateway::{Acceptance, PinConfirmation};

    #[derive(Default)]
    struct FakeGateway {
        statuses: Mutex<VecDeque<Result<StatusReport, GatewayError>>>,
        initiate_failure: Mutex<Option<GatewayError>>,
        initiate_hold: Mutex<Option<Arc<Notify>>>,
        status_hold: Mutex<Option<Arc<Notify>>>,
        pin_receipt: Mutex<Option<String>>,
        submitted: Mutex<Vec<InitiateRequest>>,
        initiate_calls: AtomicU32,
        status_calls: AtomicU32,
    }

    impl FakeGateway {
        fn script(&self, reports: Vec<Result<StatusReport, GatewayError>>) {
            self.statuses.lock().unwrap().extend(reports);
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn initiate(&self, request: &InitiateRequest) -> Result<Acceptance, GatewayError> {
            let n = self.initiate_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let hold = self.initiate_hold.lock().unwrap().clone();
            if let Some(hold) = hold {
                hold.notified().await;
            }
            if let Some(err) = self.initiate_failure.lock().unwrap().take() {
                return Err(err);
            }
            self.submitted.lock().unwrap().push(request.clone());
            Ok(Acceptance {
                transaction_id: format!("TX-{n}"),
                status: Some(PaymentStatus::Pending),
            })
        }

        async fn status(&self, _transaction_id: &str) -> Result<StatusReport, GatewayError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let hold = self.status_hold.lock().unwrap().clone();
            if let Some(hold) = hold {
                hold.notified().await;
            }
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(StatusReport::with_status(PaymentStatus::Pending)))
        }

        async fn process_pin(
            &self,
            _transaction_id: &str,
            _pin: &str,
        ) -> Result<PinConfirmation, GatewayError> {
            match self.pin_receipt.lock().unwrap().clone() {
                Some(receipt) => Ok(PinConfirmation {
                    success: true,
                    receipt: Some(receipt),
                }),
                None => Err(GatewayError::Rejected("Wrong PIN".into())),
            }
        }
    }

    fn settings(max_secs: u64) -> OrchestratorSettings {
        OrchestratorSettings {
            poll: PollSettings::new(Duration::from_secs(5), Duration::from_secs(max_secs)),
            ceiling: DAILY_TRANSFER_CEILING,
        }
    }

    fn setup() -> (Arc<FakeGateway>, PaymentOrchestrator<FakeGateway>) {
        let gateway = Arc::new(FakeGateway::default());
        let orch = PaymentOrchestrator::new(Arc::clone(&gateway), settings(1800));
        (gateway, orch)
    }

    fn draft(customer_id: &str) -> PaymentDraft {
        PaymentDraft::new(customer_id, "254712345678", 1500.0)
    }

    fn report(status: PaymentStatus) -> Result<StatusReport, GatewayError> {
        Ok(StatusReport::with_status(status))
    }

    fn pending_tx(status: &str) -> Transaction {
        serde_json::from_value(serde_json::json!({ "_id": "t1", "status": status })).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn second_initiate_while_pending_is_rejected() {
        let (gateway, orch) = setup();
        let request = orch.initiate(draft("X")).await.unwrap();
        assert_eq!(request.status, PaymentStatus::Pending);
        assert_eq!(request.id.as_deref(), Some("TX-1"));

        let err = orch.initiate(draft("X")).await.unwrap_err();
        match err {
            PaymentError::DuplicateActiveTransaction { customer_id, status } => {
                assert_eq!(customer_id, "X");
                assert_eq!(status, PaymentStatus::Pending);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(gateway.initiate_calls.load(Ordering::SeqCst), 1);

        // Other customers are unaffected.
        orch.initiate(draft("Y")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_while_submission_in_flight() {
        let (gateway, orch) = setup();
        let hold = Arc::new(Notify::new());
        *gateway.initiate_hold.lock().unwrap() = Some(Arc::clone(&hold));

        let first = tokio::spawn({
            let orch = orch.clone();
            async move { orch.initiate(draft("X")).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = orch.initiate(draft("X")).await.unwrap_err();
        assert!(matches!(
            err,
            PaymentError::DuplicateActiveTransaction { status: PaymentStatus::Initiated, .. }
        ));

        hold.notify_one();
        let request = first.await.unwrap().unwrap();
        assert_eq!(request.status, PaymentStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_success_after_three_ticks() -> anyhow::Result<()> {
        let (gateway, orch) = setup();
        gateway.script(vec![
            report(PaymentStatus::Pending),
            report(PaymentStatus::Pending),
            Ok(StatusReport {
                status: Some(PaymentStatus::Success),
                receipt: Some("QK12AB34CD".into()),
                ..StatusReport::default()
            }),
        ]);
        let id = orch.initiate(draft("X")).await?.id.unwrap();

        let resolved = orch.wait_for_resolution(&id).await?;
        assert_eq!(resolved.status, PaymentStatus::Success);
        assert_eq!(resolved.receipt.as_deref(), Some("QK12AB34CD"));
        assert!(resolved.resolved_at.is_some());
        assert_eq!(orch.ticks(&id), Some(3));
        assert_eq!(orch.phase(&id), Some(PaymentPhase::Resolved(Resolution::Success)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 3);
        assert!(!orch.has_active_transaction("X"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn poll_timeout_is_a_synthetic_expiry() {
        let gateway = Arc::new(FakeGateway::default());
        let orch = PaymentOrchestrator::new(Arc::clone(&gateway), settings(20));
        let id = orch.initiate(draft("X")).await.unwrap().id.unwrap();

        let err = orch.wait_for_resolution(&id).await.unwrap_err();
        match err {
            PaymentError::PollTimeout { request_id, ticks, elapsed } => {
                assert_eq!(request_id, id);
                assert_eq!(ticks, 3);
                assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21));
            }
            other => panic!("expected poll timeout, got {other:?}"),
        }
        let request = orch.request(&id).unwrap();
        assert_eq!(request.status, PaymentStatus::Expired);
        assert_eq!(request.failure_reason, Some(FailureReason::Expired));
        assert_eq!(
            orch.phase(&id),
            Some(PaymentPhase::Resolved(Resolution::Expired(ExpirySource::PollTimeout)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_expiry_is_distinguished() {
        let (gateway, orch) = setup();
        gateway.script(vec![report(PaymentStatus::Expired)]);
        let id = orch.initiate(draft("X")).await.unwrap().id.unwrap();

        let request = orch.wait_for_resolution(&id).await.unwrap();
        assert_eq!(request.status, PaymentStatus::Expired);
        assert_eq!(
            orch.phase(&id),
            Some(PaymentPhase::Resolved(Resolution::Expired(ExpirySource::Gateway)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_ticks_are_swallowed() {
        let (gateway, orch) = setup();
        gateway.script(vec![
            Err(GatewayError::Unavailable("connection reset".into())),
            Err(GatewayError::Server { status: 503, body: String::new() }),
            report(PaymentStatus::Success),
        ]);
        let id = orch.initiate(draft("X")).await.unwrap().id.unwrap();

        let request = orch.wait_for_resolution(&id).await.unwrap();
        assert_eq!(request.status, PaymentStatus::Success);
        assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_records_reason_and_message() {
        let (gateway, orch) = setup();
        gateway.script(vec![Ok(StatusReport {
            status: Some(PaymentStatus::Failed),
            error_message: Some("Insufficient balance".into()),
            failure_reason: Some("INSUFFICIENT_FUNDS".into()),
            ..StatusReport::default()
        })]);
        let id = orch.initiate(draft("X")).await.unwrap().id.unwrap();

        let request = orch.wait_for_resolution(&id).await.unwrap();
        assert_eq!(request.status, PaymentStatus::Failed);
        assert_eq!(request.failure_reason, Some(FailureReason::InsufficientFunds));
        assert_eq!(request.error_message.as_deref(), Some("Insufficient balance"));
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_request_ignores_later_results() {
        let (gateway, orch) = setup();
        gateway.script(vec![report(PaymentStatus::Failed)]);
        let id = orch.initiate(draft("X")).await.unwrap().id.unwrap();
        orch.wait_for_resolution(&id).await.unwrap();
        let before = orch.request(&id).unwrap();

        orch.inner.apply_poll(
            &id,
            PollEvent::Finished {
                tick: 9,
                value: StatusReport::with_status(PaymentStatus::Success),
            },
        );
        orch.inner.apply_poll(&id, PollEvent::TimedOut { ticks: 10, elapsed: Duration::ZERO });

        assert_eq!(orch.request(&id).unwrap(), before);
        assert_eq!(orch.ticks(&id), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_in_flight_response() {
        let (gateway, orch) = setup();
        let hold = Arc::new(Notify::new());
        *gateway.status_hold.lock().unwrap() = Some(Arc::clone(&hold));
        gateway.script(vec![report(PaymentStatus::Success)]);
        let id = orch.initiate(draft("X")).await.unwrap().id.unwrap();

        // First tick fires and blocks inside the status call.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 1);

        orch.cancel(&id).unwrap();
        hold.notify_one();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let request = orch.request(&id).unwrap();
        assert_eq!(request.status, PaymentStatus::Pending);
        assert_eq!(orch.phase(&id), Some(PaymentPhase::Abandoned));
        assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            orch.wait_for_resolution(&id).await,
            Err(PaymentError::Abandoned(_))
        ));

        // Cancelling again is a no-op; unknown ids are reported.
        orch.cancel(&id).unwrap();
        assert!(matches!(orch.cancel("nope"), Err(PaymentError::UnknownRequest(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn submission_failures_are_retryable_and_release_the_guard() {
        let (gateway, orch) = setup();
        *gateway.initiate_failure.lock().unwrap() =
            Some(GatewayError::Unavailable("timed out".into()));
        let err = orch.initiate(draft("X")).await.unwrap_err();
        assert!(matches!(err, PaymentError::GatewayUnavailable { .. }));
        assert!(err.is_retryable());
        assert!(!orch.has_active_transaction("X"));

        *gateway.initiate_failure.lock().unwrap() =
            Some(GatewayError::Rejected("Invalid phone number".into()));
        match orch.initiate(draft("X")).await.unwrap_err() {
            PaymentError::GatewayRejected { message } => assert_eq!(message, "Invalid phone number"),
            other => panic!("expected rejection, got {other:?}"),
        }

        let request = orch.initiate(draft("X")).await.unwrap();
        assert_eq!(request.status, PaymentStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_runs_before_any_network_call() {
        let (gateway, orch) = setup();
        let err = orch
            .initiate(PaymentDraft::new("X", "254712345678", 600_000.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Validation(ValidationError::AmountTooLarge { .. })
        ));
        let err = orch
            .initiate(PaymentDraft::new("X", "12345", 100.0))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Validation(ValidationError::InvalidPhone(_))));
        assert_eq!(gateway.initiate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clamping_is_recorded_on_the_request() {
        let (gateway, orch) = setup();
        let request = orch
            .initiate(
                PaymentDraft::new("X", "254712345678", 600_000.0)
                    .with_amount_policy(AmountPolicy::ClampToCeiling),
            )
            .await
            .unwrap();
        assert_eq!(request.amount, DAILY_TRANSFER_CEILING);
        assert_eq!(request.clamped_from, Some(600_000.0));
        assert_eq!(gateway.submitted.lock().unwrap()[0].amount, DAILY_TRANSFER_CEILING);
    }

    #[tokio::test(start_paused = true)]
    async fn alternative_number_is_used_and_original_kept() {
        let (gateway, orch) = setup();
        let request = orch
            .initiate(draft("X").with_alternative_phone("0722000111"))
            .await
            .unwrap();
        assert_eq!(request.phone_number, "254722000111");
        assert_eq!(request.original_phone_number.as_deref(), Some("254712345678"));

        let submitted = gateway.submitted.lock().unwrap();
        assert!(submitted[0].is_alternative_number);
        assert_eq!(submitted[0].phone_number, "254722000111");
        assert_eq!(submitted[0].description, DEFAULT_DESCRIPTION);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_pin_resolves_without_polling() {
        let (gateway, orch) = setup();
        let id = orch.initiate(draft("X")).await.unwrap().id.unwrap();

        let err = orch.submit_manual_pin(&id, "12a4").await.unwrap_err();
        assert!(matches!(err, PaymentError::Validation(ValidationError::InvalidPin)));

        let err = orch.submit_manual_pin(&id, "1234").await.unwrap_err();
        assert!(matches!(err, PaymentError::PinRejected { .. }));
        assert_eq!(orch.phase(&id), Some(PaymentPhase::Polling));

        *gateway.pin_receipt.lock().unwrap() = Some("QK99ZZ".into());
        let request = orch.submit_manual_pin(&id, "1234").await.unwrap();
        assert_eq!(request.status, PaymentStatus::Success);
        assert_eq!(request.receipt.as_deref(), Some("QK99ZZ"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 0);
        assert_eq!(orch.request(&id).unwrap().status, PaymentStatus::Success);

        let err = orch.submit_manual_pin(&id, "1234").await.unwrap_err();
        assert!(matches!(err, PaymentError::AlreadyResolved(PaymentStatus::Success)));
    }

    #[tokio::test(start_paused = true)]
    async fn observed_transactions_feed_the_guard() {
        let (gateway, orch) = setup();
        orch.observe_transactions("X", vec![pending_tx("pending")]);
        assert_eq!(orch.active_status("X"), Some(PaymentStatus::Pending));

        let err = orch.initiate(draft("X")).await.unwrap_err();
        assert!(matches!(
            err,
            PaymentError::DuplicateActiveTransaction { status: PaymentStatus::Pending, .. }
        ));
        assert_eq!(gateway.initiate_calls.load(Ordering::SeqCst), 0);

        orch.observe_transactions("X", vec![pending_tx("Success")]);
        assert!(!orch.has_active_transaction("X"));
        orch.initiate(draft("X")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn events_follow_the_lifecycle() {
        let (gateway, orch) = setup();
        let mut events = orch.subscribe();
        gateway.script(vec![report(PaymentStatus::Success)]);
        let id = orch.initiate(draft("X")).await.unwrap().id.unwrap();

        match events.recv().await.unwrap() {
            PaymentEvent::Accepted(request) => assert_eq!(request.id.as_deref(), Some(id.as_str())),
            other => panic!("expected accepted, got {other:?}"),
        }
        match events.recv().await.unwrap() {
            PaymentEvent::Resolved { request, resolution, ticks } => {
                assert_eq!(request.status, PaymentStatus::Success);
                assert_eq!(resolution, Resolution::Success);
                assert_eq!(ticks, 1);
            }
            other => panic!("expected resolved, got {other:?}"),
        }
    }

    fn gateway_tx(id: &str, status: &str) -> Transaction {
        serde_json::from_value(serde_json::json!({
            "_id": "db-1",
            "transactionId": id,
            "status": status,
            "mpesaReceiptNumber": "QK55LATE"
        }))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_keeps_blocking_until_settled() {
        let (gateway, orch) = setup();
        let id = orch.initiate(draft("X")).await.unwrap().id.unwrap();
        orch.cancel(&id).unwrap();
        assert_eq!(orch.request(&id).unwrap().status, PaymentStatus::Pending);

        let err = orch.initiate(draft("X")).await.unwrap_err();
        assert!(matches!(
            err,
            PaymentError::DuplicateActiveTransaction { status: PaymentStatus::Pending, .. }
        ));
        assert_eq!(gateway.initiate_calls.load(Ordering::SeqCst), 1);

        // Still pending at the gateway: nothing changes.
        orch.observe_transactions("X", vec![gateway_tx(&id, "pending")]);
        assert_eq!(orch.active_status("X"), Some(PaymentStatus::Pending));

        orch.observe_transactions("X", vec![gateway_tx(&id, "success")]);
        let settled = orch.request(&id).unwrap();
        assert_eq!(settled.status, PaymentStatus::Success);
        assert_eq!(settled.receipt.as_deref(), Some("QK55LATE"));
        assert_eq!(orch.phase(&id), Some(PaymentPhase::Abandoned));
        assert!(!orch.has_active_transaction("X"));

        // The next accepted request drops the settled one.
        let next = orch.initiate(draft("X")).await.unwrap().id.unwrap();
        assert!(orch.request(&id).is_none());
        assert!(orch.request(&next).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn forgetting_an_abandoned_request_releases_the_customer() {
        let (_gateway, orch) = setup();
        let id = orch.initiate(draft("X")).await.unwrap().id.unwrap();
        orch.cancel(&id).unwrap();
        assert!(orch.has_active_transaction("X"));
        assert!(orch.forget(&id));
        orch.initiate(draft("X")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn settled_requests_are_pruned_per_customer() -> anyhow::Result<()> {
        let (gateway, orch) = setup();
        gateway.script(vec![report(PaymentStatus::Failed)]);
        let first = orch.initiate(draft("X")).await?.id.unwrap();
        orch.wait_for_resolution(&first).await?;
        let other = orch.initiate(draft("Y")).await?.id.unwrap();

        let second = orch.initiate(draft("X")).await?.id.unwrap();
        assert!(orch.request(&first).is_none());
        assert!(orch.request(&second).is_some());
        assert!(orch.request(&other).is_some());

        orch.observe_transactions("Z", vec![pending_tx("failed")]);
        assert!(orch.inner.book().observed.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn forget_only_drops_settled_requests() {
        let (gateway, orch) = setup();
        let id = orch.initiate(draft("X")).await.unwrap().id.unwrap();
        assert!(!orch.forget(&id));
        orch.cancel(&id).unwrap();
        assert!(orch.forget(&id));
        assert!(orch.request(&id).is_none());
        assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 0);
    }
}
