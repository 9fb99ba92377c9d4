//! Interval refresh of a customer's transaction list.
//!
//! The watcher keeps the orchestrator's guard view current while a customer
//! has a non-terminal transaction, and goes quiet once everything listed is
//! terminal.

use std::sync::Arc;

use futures::FutureExt;
use mkopo_core::{Config, Transaction, has_active_transaction};
use mkopo_sync::{RecordStore, SyncError};
use tracing::{debug, info};

use crate::gateway::PaymentGateway;
use crate::orchestrator::PaymentOrchestrator;
use crate::poller::{PollEvent, PollSettings, Poller};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchSettings {
    pub poll: PollSettings,
    /// How many recent transactions to fetch per refresh.
    pub limit: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll: PollSettings::default(),
            limit: 10,
        }
    }
}

impl WatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll: PollSettings::new(config.refresh_interval(), config.max_poll_duration()),
            limit: config.transaction_fetch_limit,
        }
    }
}

/// Refreshes one customer's transactions until none is active.
pub struct TransactionWatcher {
    customer_id: String,
    poller: Option<Poller>,
}

impl TransactionWatcher {
    /// Fetch the list once, hand it to the orchestrator, and keep refreshing
    /// while any transaction is INITIATED or PENDING.
    ///
    /// The first fetch is not retried: its error is returned and nothing is
    /// scheduled. Later refresh failures are skipped until the next interval.
    pub async fn start<S, G>(
        store: Arc<S>,
        orchestrator: PaymentOrchestrator<G>,
        customer_id: impl Into<String>,
        settings: WatchSettings,
    ) -> Result<Self, SyncError>
    where
        S: RecordStore + 'static,
        G: PaymentGateway + 'static,
    {
        let customer_id = customer_id.into();
        let initial = store.list_transactions(&customer_id, settings.limit).await?;
        let active = has_active_transaction(&initial);
        orchestrator.observe_transactions(&customer_id, initial);
        if !active {
            debug!(customer_id = %customer_id, "no active transactions, not watching");
            return Ok(Self {
                customer_id,
                poller: None,
            });
        }

        let probe_customer = customer_id.clone();
        let probe = move |tick: u32| {
            let store = Arc::clone(&store);
            let customer_id = probe_customer.clone();
            async move {
                match store.list_transactions(&customer_id, settings.limit).await {
                    Ok(list) => Some(list),
                    Err(e) => {
                        debug!(customer_id = %customer_id, tick, error = %e, "transaction refresh failed");
                        None
                    }
                }
            }
            .boxed()
        };

        let sink_customer = customer_id.clone();
        let sink = move |event: PollEvent<Vec<Transaction>>| match event {
            PollEvent::Observed { value, .. } => {
                orchestrator.observe_transactions(&sink_customer, value);
            }
            PollEvent::Finished { tick, value } => {
                info!(customer_id = %sink_customer, tick, "all transactions terminal, watcher stopped");
                orchestrator.observe_transactions(&sink_customer, value);
            }
            PollEvent::TimedOut { ticks, .. } => {
                info!(customer_id = %sink_customer, ticks, "transaction watcher timed out");
            }
        };

        let done = |list: &Vec<Transaction>| !has_active_transaction(list);
        info!(customer_id = %customer_id, "watching active transaction");
        Ok(Self {
            customer_id,
            poller: Some(Poller::spawn(settings.poll, probe, done, sink)),
        })
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    /// Still refreshing.
    pub fn is_watching(&self) -> bool {
        self.poller
            .as_ref()
            .is_some_and(|p| !p.is_finished() && !p.is_stopped())
    }

    pub fn stop(&self) {
        if let Some(poller) = &self.poller {
            poller.stop();
        }
    }
}
