//! Settlement reconciler.
//!
//! Every settlement observation, whether it comes from a push, a poll or
//! the expiry sweeper, enters through [`ReconcilerHandle`]. The handle routes
//! each observation to one mailbox worker chosen by the invoice id, so all
//! observations for one invoice are applied one after another in this
//! process. Row locks on the ticket and invoice extend that to other
//! processes sharing the ledger.
//!
//! [`Reconciler::apply`] loads the recorded state under lock, runs the pure
//! [`SettlementReducer`], executes the returned effects and commits, all in
//! one transaction.

use crate::allocator::InventoryAllocator;
use crate::config::ReconcilerConfig;
use crate::metrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use lnticket_core::ledger::Ledger;
use lnticket_core::reducer::Reducer;
use lnticket_core::settlement::{
    SettlementAnomaly, SettlementEffect, SettlementOutcome, SettlementPolicy, SettlementReducer,
    SettlementState,
};
use lnticket_core::types::{InvoiceId, Observation, Payment, PaymentId, PaymentStatus};
use lnticket_core::{Result, TicketingError};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Applies observations to the ledger through the settlement reducer.
pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    reducer: SettlementReducer,
    policy: SettlementPolicy,
}

impl Reconciler {
    /// Creates a new `Reconciler`
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, policy: SettlementPolicy) -> Self {
        Self {
            ledger,
            reducer: SettlementReducer::new(),
            policy,
        }
    }

    /// Apply one observation.
    ///
    /// Returns `None` when the invoice is unknown; the observation is logged
    /// and dropped. Conflicting observations are not errors: they come back
    /// as [`SettlementOutcome::Conflict`] after being logged and counted.
    ///
    /// # Errors
    ///
    /// Ledger errors. A [`TicketingError::Transient`] may be retried.
    #[tracing::instrument(
        skip(self, observation),
        fields(
            invoice_id = %observation.invoice_id,
            status = %observation.status,
            source = observation.source.as_str(),
        )
    )]
    pub async fn apply(&self, observation: Observation) -> Result<Option<SettlementOutcome>> {
        let Some(known) = self.ledger.get_invoice(observation.invoice_id).await? else {
            tracing::warn!("Observation for unknown invoice dropped");
            return Ok(None);
        };

        let mut tx = self.ledger.begin().await?;
        let ticket = tx
            .lock_ticket(known.ticket_id)
            .await?
            .ok_or(TicketingError::TicketNotFound(known.ticket_id))?;
        let invoice = tx
            .lock_invoice(known.id)
            .await?
            .ok_or(TicketingError::InvoiceNotFound(known.id))?;

        let mut state = SettlementState {
            invoice_id: invoice.id,
            ticket_id: ticket.id,
            amount: invoice.amount,
            invoice_status: invoice.status,
            ticket_status: ticket.status,
            is_current_invoice: ticket.invoice_id == Some(invoice.id),
            last_outcome: None,
        };
        let effects = self.reducer.reduce(&mut state, observation, &self.policy);

        let mut anomalies = Vec::new();
        for effect in effects {
            match effect {
                SettlementEffect::MarkInvoice { status, at } => {
                    tx.update_invoice_status(state.invoice_id, status, at).await?;
                }
                SettlementEffect::RecordPayment { amount, paid_at } => {
                    tx.insert_payment(&Payment {
                        id: PaymentId::new(),
                        invoice_id: state.invoice_id,
                        amount,
                        status: PaymentStatus::Settled,
                        paid_at,
                    })
                    .await?;
                }
                SettlementEffect::MarkTicket { status, at } => {
                    tx.update_ticket_status(state.ticket_id, status, at).await?;
                }
                SettlementEffect::ReleaseSlot { status, at } => {
                    InventoryAllocator::release_in_tx(tx.as_mut(), state.ticket_id, status, at)
                        .await?;
                }
                SettlementEffect::Anomaly(anomaly) => anomalies.push(anomaly),
            }
        }
        tx.commit().await?;

        for anomaly in &anomalies {
            report_anomaly(state.invoice_id, anomaly);
        }
        if let Some(SettlementOutcome::Transitioned { from, to }) = state.last_outcome {
            metrics::record_settlement(to.as_str());
            tracing::info!(%from, %to, ticket_id = %state.ticket_id, "Invoice settled");
        }
        Ok(state.last_outcome)
    }
}

fn report_anomaly(invoice_id: InvoiceId, anomaly: &SettlementAnomaly) {
    metrics::record_anomaly(anomaly.kind());
    match anomaly {
        SettlementAnomaly::Conflicting {
            recorded,
            observed,
            source,
        } => {
            let conflict = TicketingError::DuplicateOrConflictingSettlement {
                invoice_id,
                recorded: *recorded,
                observed: *observed,
            };
            tracing::warn!(source = source.as_str(), "{conflict}");
        }
        SettlementAnomaly::LateSettlement {
            recorded,
            ticket_status,
            source,
        } => {
            tracing::error!(
                invoice_id = %invoice_id,
                recorded = %recorded,
                ticket_status = %ticket_status,
                source = source.as_str(),
                "Payment received for an invoice whose slot is no longer held; manual attention required"
            );
        }
        SettlementAnomaly::Underpaid { expected, settled } => {
            tracing::error!(
                invoice_id = %invoice_id,
                expected = %expected,
                settled = %settled,
                "Invoice settled for less than its amount; left pending for manual attention"
            );
        }
    }
}

struct Envelope {
    observation: Observation,
    reply: Option<oneshot::Sender<Result<Option<SettlementOutcome>>>>,
}

/// Cloneable entry point to the mailbox workers.
#[derive(Clone)]
pub struct ReconcilerHandle {
    shards: Arc<[mpsc::Sender<Envelope>]>,
}

impl std::fmt::Debug for ReconcilerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerHandle")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl ReconcilerHandle {
    /// Spawn `config.shards` mailbox workers around `reconciler`.
    ///
    /// Workers stop when `shutdown` fires, after applying whatever was
    /// already queued. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(
        reconciler: Arc<Reconciler>,
        config: &ReconcilerConfig,
        shutdown: &broadcast::Sender<()>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let shard_count = config.shards.max(1);
        let mut senders = Vec::with_capacity(shard_count);
        let mut handles = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                shard,
                Arc::clone(&reconciler),
                RetryPolicy::with_max_retries(config.max_retries),
                rx,
                shutdown.subscribe(),
            )));
        }

        (
            Self {
                shards: senders.into(),
            },
            handles,
        )
    }

    fn shard_for(&self, invoice_id: InvoiceId) -> &mpsc::Sender<Envelope> {
        let mut hasher = DefaultHasher::new();
        invoice_id.hash(&mut hasher);
        let len = self.shards.len() as u64;
        let index = usize::try_from(hasher.finish() % len).unwrap_or(0);
        &self.shards[index]
    }

    /// Apply an observation and wait for the outcome.
    ///
    /// # Errors
    ///
    /// The error [`Reconciler::apply`] returned after retries, or
    /// [`TicketingError::Transient`] if the workers have stopped.
    pub async fn apply(&self, observation: Observation) -> Result<Option<SettlementOutcome>> {
        let (reply, outcome) = oneshot::channel();
        self.shard_for(observation.invoice_id)
            .send(Envelope {
                observation,
                reply: Some(reply),
            })
            .await
            .map_err(|_| mailbox_closed())?;
        outcome.await.map_err(|_| mailbox_closed())?
    }

    /// Queue an observation without waiting for it to be applied.
    ///
    /// # Errors
    ///
    /// [`TicketingError::Transient`] if the workers have stopped.
    pub async fn submit(&self, observation: Observation) -> Result<()> {
        self.shard_for(observation.invoice_id)
            .send(Envelope {
                observation,
                reply: None,
            })
            .await
            .map_err(|_| mailbox_closed())
    }
}

fn mailbox_closed() -> TicketingError {
    TicketingError::Transient("settlement mailbox closed".to_string())
}

async fn run_worker(
    shard: usize,
    reconciler: Arc<Reconciler>,
    retry: RetryPolicy,
    mut mailbox: mpsc::Receiver<Envelope>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::debug!(shard, "Settlement mailbox started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                mailbox.close();
                while let Some(envelope) = mailbox.recv().await {
                    process(&reconciler, &retry, envelope).await;
                }
                break;
            }
            envelope = mailbox.recv() => match envelope {
                Some(envelope) => process(&reconciler, &retry, envelope).await,
                None => break,
            },
        }
    }
    tracing::debug!(shard, "Settlement mailbox stopped");
}

async fn process(reconciler: &Reconciler, retry: &RetryPolicy, envelope: Envelope) {
    let Envelope { observation, reply } = envelope;
    let invoice_id = observation.invoice_id;

    let result = retry_with_predicate(
        retry.clone(),
        || reconciler.apply(observation.clone()),
        |err: &TicketingError| matches!(err, TicketingError::Transient(_)),
    )
    .await;

    if let Err(err) = &result {
        // The poller or the sweeper will observe this invoice again.
        tracing::error!(invoice_id = %invoice_id, error = %err, "Settlement not applied");
    }
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}
