//! Provider-side invoice/promise exchange for one paid session.
//!
//! The engine bills the consumer at a fixed cadence with invoices carrying
//! the cumulative agreement total, and accepts signed cumulative promises
//! in return. Only one invoice is outstanding at a time. A session is torn
//! down when the consumer sends an invalid promise, stops answering, lets
//! the unpaid amount grow past the configured ceiling, or can no longer be
//! reached.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use tollgate_core::config::PaymentsConfig;
use tollgate_core::events::{PromiseReceived, SessionEnded};
use tollgate_core::types::{
    AgreementId, Address, Amount, ChainId, ChannelKey, HermesId, Identity, Invoice, Promise,
};
use tollgate_core::{
    Event, EventBus, InvoiceEvent, InvoiceState, InvoiceStateMachine, InvoiceStore, PromiseStore,
};
use tollgate_crypto::{verify_promise, PublicKey};
use tollgate_settlement::HermesStatusChecker;

use crate::error::PaymentError;
use crate::peer::PeerChannel;
use crate::pricing::{Price, UsageMeter};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub invoice_frequency: Duration,
    pub promise_wait_timeout: Duration,
    pub max_missed_promises: u32,
    /// Ceiling on accrued but unpaid value, and on a single promise step.
    pub max_unpaid: Amount,
    pub shortfall_tolerance: Amount,
    pub max_send_attempts: u32,
    pub send_retry_delay: Duration,
    /// Transactor fee quoted on every invoice.
    pub transactor_fee: Amount,
    pub price: Price,
}

impl EngineConfig {
    pub fn from_payments(cfg: &PaymentsConfig) -> Self {
        Self {
            invoice_frequency: cfg.provider_invoice_frequency,
            promise_wait_timeout: cfg.promise_wait_timeout,
            max_missed_promises: cfg.max_missed_promises,
            max_unpaid: cfg.max_unpaid_invoice_value as Amount,
            shortfall_tolerance: cfg.shortfall_tolerance as Amount,
            max_send_attempts: cfg.max_invoice_send_attempts,
            send_retry_delay: cfg.invoice_send_retry_delay,
            transactor_fee: 0,
            price: Price::from_config(cfg),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_payments(&PaymentsConfig::default())
    }
}

/// Who is paying whom, and where.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub chain_id: ChainId,
    pub provider: Identity,
    pub hermes_id: HermesId,
    /// Provider channel the consumer's promises pay into.
    pub channel_id: Address,
    /// Key the consumer signs promises with.
    pub consumer_key: PublicKey,
}

impl SessionInfo {
    pub fn new(
        chain_id: ChainId,
        provider: Identity,
        hermes_id: HermesId,
        channel_id: Address,
        consumer_key: PublicKey,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::now_v7().to_string(),
            chain_id,
            provider,
            hermes_id,
            channel_id,
            consumer_key,
        }
    }

    pub fn channel_key(&self) -> ChannelKey {
        ChannelKey::new(self.chain_id, self.provider, self.hermes_id)
    }
}

/// Totals of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub accrued: Amount,
    pub paid: Amount,
    pub invoices_issued: u32,
}

pub struct PaymentEngine {
    config: EngineConfig,
    session: SessionInfo,
    peer: Arc<dyn PeerChannel>,
    meter: Arc<dyn UsageMeter>,
    invoices: Arc<dyn InvoiceStore>,
    promises: Arc<dyn PromiseStore>,
    hermes: Arc<HermesStatusChecker>,
    bus: EventBus,
    state: InvoiceState,
    state_tx: watch::Sender<InvoiceState>,
    agreement_id: AgreementId,
    outstanding: Option<Invoice>,
    last_promise: Option<Promise>,
    accrued: Amount,
    paid: Amount,
    missed: u32,
    invoices_issued: u32,
    started_at: Instant,
    invoice_sent_at: Option<Instant>,
}

impl PaymentEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        session: SessionInfo,
        peer: Arc<dyn PeerChannel>,
        meter: Arc<dyn UsageMeter>,
        invoices: Arc<dyn InvoiceStore>,
        promises: Arc<dyn PromiseStore>,
        hermes: Arc<HermesStatusChecker>,
        bus: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(InvoiceState::Idle);
        Self {
            config,
            session,
            peer,
            meter,
            invoices,
            promises,
            hermes,
            bus,
            state: InvoiceState::Idle,
            state_tx,
            agreement_id: rand::random(),
            outstanding: None,
            last_promise: None,
            accrued: 0,
            paid: 0,
            missed: 0,
            invoices_issued: 0,
            started_at: Instant::now(),
            invoice_sent_at: None,
        }
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn state(&self) -> InvoiceState {
        self.state
    }

    /// Agreement this session's promises are cumulative for.
    pub fn agreement_id(&self) -> AgreementId {
        self.agreement_id
    }

    /// Observe state changes while the engine runs.
    pub fn watch_state(&self) -> watch::Receiver<InvoiceState> {
        self.state_tx.subscribe()
    }

    /// Run the session until `shutdown` fires, the promise stream closes,
    /// or a fatal error occurs. The session is ended in every case.
    pub async fn run(
        mut self,
        mut promises: mpsc::Receiver<Promise>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionSummary, PaymentError> {
        tracing::info!(
            session = %self.session.session_id,
            provider = %self.session.provider,
            agreement = self.agreement_id,
            "payment session started"
        );
        self.started_at = Instant::now();
        let result = self.drive(&mut promises, &mut shutdown).await;
        if let Err(e) = &result {
            tracing::warn!(session = %self.session.session_id, error = %e, "payment session torn down");
        }
        self.end_session();
        result.map(|()| self.summary())
    }

    async fn drive(
        &mut self,
        promises: &mut mpsc::Receiver<Promise>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), PaymentError> {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.invoice_frequency,
            self.config.invoice_frequency,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let promise_deadline = self.promise_deadline();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                received = promises.recv() => match received {
                    Some(promise) => self.on_promise(promise)?,
                    None => return Ok(()),
                },
                _ = tokio::time::sleep_until(promise_deadline.unwrap_or_else(Instant::now)), if promise_deadline.is_some() => {
                    self.on_promise_timeout().await?;
                }
                _ = ticker.tick() => self.on_tick().await?,
            }
        }
    }

    fn promise_deadline(&self) -> Option<Instant> {
        if !self.state.has_outstanding_invoice() {
            return None;
        }
        self.invoice_sent_at
            .map(|sent| sent + self.config.promise_wait_timeout)
    }

    fn transition(&mut self, event: InvoiceEvent) -> Result<(), PaymentError> {
        self.state = InvoiceStateMachine::transition(self.state, event)?;
        self.state_tx.send_replace(self.state);
        Ok(())
    }

    async fn on_tick(&mut self) -> Result<(), PaymentError> {
        let elapsed = self.started_at.elapsed();
        let total = self.config.price.total(elapsed, self.meter.bytes_transferred());
        self.accrued = self.accrued.max(total);

        if self.state.has_outstanding_invoice() {
            let unpaid = self.accrued.saturating_sub(self.paid);
            if unpaid > self.config.max_unpaid {
                return Err(PaymentError::MaxUnpaidExceeded {
                    unpaid,
                    limit: self.config.max_unpaid,
                });
            }
            return Ok(());
        }

        if self.accrued <= self.paid {
            return Ok(());
        }

        match self
            .hermes
            .is_active(self.session.chain_id, self.session.hermes_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(hermes = %self.session.hermes_id, "hermes inactive, invoicing paused");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(hermes = %self.session.hermes_id, error = %e, "hermes status unknown, invoicing paused");
                return Ok(());
            }
        }

        self.issue_invoice().await
    }

    async fn issue_invoice(&mut self) -> Result<(), PaymentError> {
        let invoice = Invoice::new(
            self.agreement_id,
            self.accrued,
            self.config.transactor_fee,
            self.session.provider,
            self.session.chain_id,
        );
        self.invoices.store_invoice(&self.session.session_id, &invoice)?;
        self.transition(InvoiceEvent::Issued)?;
        self.outstanding = Some(invoice.clone());
        self.invoices_issued += 1;
        self.missed = 0;
        tracing::debug!(
            session = %self.session.session_id,
            total = %invoice.agreement_total,
            hash = %invoice.hash,
            "invoice issued"
        );
        self.deliver(&invoice).await
    }

    async fn deliver(&mut self, invoice: &Invoice) -> Result<(), PaymentError> {
        let attempts = self.config.max_send_attempts.max(1);
        let mut cause = String::new();
        for attempt in 1..=attempts {
            match self.peer.send_invoice(invoice).await {
                Ok(()) => {
                    self.transition(InvoiceEvent::Delivered)?;
                    self.invoice_sent_at = Some(Instant::now());
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "invoice delivery failed");
                    cause = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.send_retry_delay).await;
            }
        }
        Err(PaymentError::PeerUnreachable { attempts, cause })
    }

    async fn on_promise_timeout(&mut self) -> Result<(), PaymentError> {
        self.missed += 1;
        if self.missed >= self.config.max_missed_promises {
            return Err(PaymentError::PromiseTimeout { missed: self.missed });
        }
        let Some(invoice) = self.outstanding.clone() else {
            return Ok(());
        };
        tracing::debug!(missed = self.missed, hash = %invoice.hash, "no promise yet, resending invoice");
        self.deliver(&invoice).await
    }

    fn on_promise(&mut self, promise: Promise) -> Result<(), PaymentError> {
        if self.last_promise.as_ref() == Some(&promise) {
            tracing::debug!(amount = %promise.amount, "duplicate promise ignored");
            return Ok(());
        }
        let Some(invoice) = self.outstanding.clone() else {
            tracing::warn!(amount = %promise.amount, "promise without outstanding invoice ignored");
            return Ok(());
        };

        self.validate(&promise, &invoice)?;

        let key = self.session.channel_key();
        self.promises.store_promise(&key, self.agreement_id, &promise)?;
        self.paid = promise.amount;
        self.last_promise = Some(promise.clone());
        self.missed = 0;
        self.bus.publish(Event::PromiseReceived(PromiseReceived {
            key,
            agreement_id: self.agreement_id,
            promise: promise.clone(),
        }));

        if invoice.agreement_total.saturating_sub(promise.amount) <= self.config.shortfall_tolerance {
            self.transition(InvoiceEvent::Paid)?;
            self.outstanding = None;
            self.invoice_sent_at = None;
            self.invoices.remove_invoice(&self.session.session_id)?;
            tracing::debug!(amount = %promise.amount, "invoice paid");
        } else {
            self.invoice_sent_at = Some(Instant::now());
            tracing::debug!(
                amount = %promise.amount,
                total = %invoice.agreement_total,
                "partial payment accepted"
            );
        }
        Ok(())
    }

    fn validate(&self, promise: &Promise, invoice: &Invoice) -> Result<(), PaymentError> {
        if promise.hashlock != invoice.hash {
            return Err(PaymentError::InvalidPromise(
                "hashlock does not match the outstanding invoice".into(),
            ));
        }
        if promise.chain_id != self.session.chain_id {
            return Err(PaymentError::InvalidPromise(format!(
                "promise for chain {} in a session on chain {}",
                promise.chain_id, self.session.chain_id
            )));
        }
        if promise.channel_id != self.session.channel_id {
            return Err(PaymentError::InvalidPromise(format!(
                "promise pays channel {} instead of {}",
                promise.channel_id, self.session.channel_id
            )));
        }
        verify_promise(promise, &self.session.consumer_key)
            .map_err(|e| PaymentError::InvalidPromise(e.to_string()))?;

        let previous = self.paid;
        if promise.amount < previous {
            return Err(PaymentError::InvalidPromise(format!(
                "amount {} is lower than the accepted {}",
                promise.amount, previous
            )));
        }
        let step = promise.amount - previous;
        if step > self.config.max_unpaid {
            return Err(PaymentError::InvalidPromise(format!(
                "step {} exceeds the limit of {}",
                step, self.config.max_unpaid
            )));
        }
        Ok(())
    }

    fn end_session(&mut self) {
        if !self.state.is_final() {
            if let Err(e) = self.transition(InvoiceEvent::SessionEnded) {
                tracing::error!(error = %e, "failed to end invoice state");
            }
        }
        if let Err(e) = self.invoices.remove_invoice(&self.session.session_id) {
            tracing::error!(error = %e, "failed to drop stored invoice");
        }
        self.outstanding = None;
        self.bus.publish(Event::SessionEnded(SessionEnded {
            session_id: self.session.session_id.clone(),
            key: self.session.channel_key(),
        }));
        tracing::info!(
            session = %self.session.session_id,
            accrued = %self.accrued,
            paid = %self.paid,
            "payment session ended"
        );
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session.session_id.clone(),
            accrued: self.accrued,
            paid: self.paid,
            invoices_issued: self.invoices_issued,
        }
    }
}
