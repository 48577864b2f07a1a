//! Background coordinator turning accumulated promises into settlements.
//!
//! Every entry point (threshold, forced, asynchronous, beneficiary change)
//! runs the same pipeline: claim the channel slot, reconcile a transaction
//! left pending by an earlier attempt, re-read the channel, submit the
//! promised total, then poll the transaction until it confirms or the wait
//! budget runs out. At most one attempt owns a channel at a time; later
//! triggers are coalesced.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tollgate_core::config::PaymentsConfig;
use tollgate_core::events::SettlementCompleted;
use tollgate_core::types::{
    Address, Amount, BeneficiaryChangeState, BeneficiaryChangeStatus, ChannelKey, Identity,
    SettlementHistoryEntry, TxHash,
};
use tollgate_core::{
    Event, EventBus, SettlementEvent, SettlementState, SettlementStateMachine, Topic,
};

use crate::channels::HermesChannelRepository;
use crate::error::SettlementError;
use crate::history::SettlementHistory;
use crate::traits::{bounded, ChainReader, Transactor};
use crate::types::{SettlementRequest, TxStatus};

#[derive(Debug, Clone)]
pub struct SettlerConfig {
    /// Unsettled share of the balance that triggers automatic settlement.
    pub threshold: f64,
    /// Longest wait for a submitted transaction to confirm.
    pub max_wait: Duration,
    pub poll_interval: Duration,
    pub recheck_interval: Duration,
    pub beneficiary_timeout: Duration,
    pub bc_timeout: Duration,
}

impl SettlerConfig {
    pub fn from_payments(cfg: &PaymentsConfig) -> Self {
        Self {
            threshold: cfg.hermes_promise_settle_threshold,
            max_wait: cfg.settlement_timeout,
            poll_interval: cfg.confirmation_poll_interval,
            recheck_interval: cfg.settlement_recheck_interval,
            beneficiary_timeout: cfg.beneficiary_change_timeout,
            bc_timeout: cfg.bc_timeout,
        }
    }
}

impl Default for SettlerConfig {
    fn default() -> Self {
        Self::from_payments(&PaymentsConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettleMode {
    /// Threshold-driven; abandons when the threshold no longer holds.
    Automatic,
    Forced,
    Beneficiary(Address),
}

/// How the last settlement attempt on a channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementOutcome {
    pub state: SettlementState,
    pub tx_hash: Option<TxHash>,
    pub amount: Amount,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// A submitted settlement whose confirmation was not observed in time.
///
/// The next attempt on the channel polls it before looking at new work,
/// so a late confirmation still reaches the history.
#[derive(Debug, Clone)]
struct PendingSettlement {
    tx_hash: TxHash,
    /// Channel total the transaction settles up to.
    settled_total: Amount,
    /// Entry recorded once the chain confirms; fees and time are filled in then.
    entry: SettlementHistoryEntry,
}

#[derive(Debug)]
struct ChannelSlot {
    state: SettlementState,
    last_outcome: Option<SettlementOutcome>,
    pending: Option<PendingSettlement>,
}

impl Default for ChannelSlot {
    fn default() -> Self {
        Self {
            state: SettlementState::Idle,
            last_outcome: None,
            pending: None,
        }
    }
}

/// Ownership of one channel's slot for the duration of an attempt.
///
/// Dropping the guard mid-attempt (caller timeout, task abort) releases
/// the slot so the next trigger can retry. A transaction already submitted
/// is kept as pending.
struct InFlight<'a> {
    slots: &'a DashMap<ChannelKey, ChannelSlot>,
    key: ChannelKey,
    state: SettlementState,
    pending: Option<PendingSettlement>,
    released: bool,
}

impl<'a> InFlight<'a> {
    fn acquire(slots: &'a DashMap<ChannelKey, ChannelSlot>, key: ChannelKey) -> Result<Self, SettlementError> {
        let mut slot = slots.entry(key).or_default();
        let state = SettlementStateMachine::transition(slot.state, SettlementEvent::Trigger)
            .map_err(|_| SettlementError::AlreadyInFlight(key))?;
        slot.state = state;
        Ok(Self {
            slots,
            key,
            state,
            pending: None,
            released: false,
        })
    }

    fn advance(&mut self, event: SettlementEvent) -> Result<(), SettlementError> {
        self.state = SettlementStateMachine::transition(self.state, event)?;
        if let Some(mut slot) = self.slots.get_mut(&self.key) {
            slot.state = self.state;
        }
        Ok(())
    }

    /// The transaction was handed to the chain.
    fn submitted(&mut self, pending: PendingSettlement) -> Result<(), SettlementError> {
        self.advance(SettlementEvent::Submit)?;
        self.pending = Some(pending);
        Ok(())
    }

    /// Nothing to do; the slot goes back to `Idle` without an outcome.
    fn abandon(mut self) -> Result<(), SettlementError> {
        self.advance(SettlementEvent::Abandon)?;
        self.released = true;
        Ok(())
    }

    /// Nothing new to submit, but an earlier transaction was reconciled.
    fn reconciled(mut self, outcome: SettlementOutcome) -> Result<(), SettlementError> {
        self.advance(SettlementEvent::Abandon)?;
        if let Some(mut slot) = self.slots.get_mut(&self.key) {
            slot.last_outcome = Some(outcome);
        }
        self.released = true;
        Ok(())
    }

    /// Record the terminal outcome and release the slot. A transaction
    /// still held by the guard stays pending on the channel.
    fn finish(mut self, event: SettlementEvent, outcome: SettlementOutcome) -> Result<(), SettlementError> {
        self.advance(event)?;
        let idle = SettlementStateMachine::transition(self.state, SettlementEvent::Reset)?;
        if let Some(mut slot) = self.slots.get_mut(&self.key) {
            slot.state = idle;
            slot.last_outcome = Some(outcome);
            if let Some(pending) = self.pending.take() {
                slot.pending = Some(pending);
            }
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(channel = %self.key, state = %self.state, "settlement attempt interrupted");
        if let Some(mut slot) = self.slots.get_mut(&self.key) {
            slot.state = SettlementState::Idle;
            slot.last_outcome = Some(SettlementOutcome {
                state: if self.state == SettlementState::Submitted {
                    SettlementState::TimedOut
                } else {
                    SettlementState::Failed
                },
                tx_hash: self.pending.as_ref().map(|p| p.tx_hash),
                amount: self.pending.as_ref().map_or(0, |p| p.entry.amount),
                error: Some("settlement attempt interrupted".into()),
                finished_at: Utc::now(),
            });
            if let Some(pending) = self.pending.take() {
                slot.pending = Some(pending);
            }
        }
    }
}

pub struct HermesPromiseSettler {
    config: SettlerConfig,
    repository: Arc<HermesChannelRepository>,
    transactor: Arc<dyn Transactor>,
    reader: Arc<dyn ChainReader>,
    history: Arc<SettlementHistory>,
    bus: EventBus,
    slots: DashMap<ChannelKey, ChannelSlot>,
    beneficiary_changes: DashMap<Identity, BeneficiaryChangeStatus>,
    shutdown: watch::Receiver<bool>,
}

impl HermesPromiseSettler {
    pub fn new(
        config: SettlerConfig,
        repository: Arc<HermesChannelRepository>,
        transactor: Arc<dyn Transactor>,
        reader: Arc<dyn ChainReader>,
        history: Arc<SettlementHistory>,
        bus: EventBus,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            repository,
            transactor,
            reader,
            history,
            bus,
            slots: DashMap::new(),
            beneficiary_changes: DashMap::new(),
            shutdown,
        }
    }

    pub fn config(&self) -> &SettlerConfig {
        &self.config
    }

    /// Current slot state of `key`.
    pub fn state(&self, key: &ChannelKey) -> SettlementState {
        self.slots
            .get(key)
            .map(|s| s.state)
            .unwrap_or(SettlementState::Idle)
    }

    pub fn last_outcome(&self, key: &ChannelKey) -> Option<SettlementOutcome> {
        self.slots.get(key).and_then(|s| s.last_outcome.clone())
    }

    pub fn beneficiary_change_status(&self, identity: &Identity) -> Option<BeneficiaryChangeStatus> {
        self.beneficiary_changes.get(identity).map(|s| s.clone())
    }

    /// Transaction submitted on `key` whose confirmation is still unobserved.
    pub fn pending_settlement(&self, key: &ChannelKey) -> Option<TxHash> {
        self.slots.get(key).and_then(|s| s.pending.as_ref().map(|p| p.tx_hash))
    }

    fn pending_keys(&self) -> Vec<ChannelKey> {
        self.slots
            .iter()
            .filter(|s| s.pending.is_some())
            .map(|s| *s.key())
            .collect()
    }

    /// Settle `key` if its unsettled share reached the threshold.
    ///
    /// Returns `None` when nothing qualified or another attempt owns the
    /// channel.
    pub async fn maybe_settle(&self, key: ChannelKey) -> Result<Option<SettlementHistoryEntry>, SettlementError> {
        match self.run(key, SettleMode::Automatic, self.config.max_wait).await {
            Ok(entry) => Ok(Some(entry)),
            Err(SettlementError::NothingToSettle(_)) | Err(SettlementError::AlreadyInFlight(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Settle `key` regardless of the threshold, waiting at most `timeout`.
    pub async fn force_settle(
        &self,
        key: ChannelKey,
        timeout: Duration,
    ) -> Result<SettlementHistoryEntry, SettlementError> {
        match tokio::time::timeout(timeout, self.run(key, SettleMode::Forced, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(SettlementError::SettlementTimeout(timeout)),
        }
    }

    /// Start a forced settlement in the background.
    pub fn settle_async(self: &Arc<Self>, key: ChannelKey) -> JoinHandle<Result<SettlementHistoryEntry, SettlementError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.run(key, SettleMode::Forced, this.config.max_wait).await;
            if let Err(e) = &result {
                tracing::warn!(channel = %key, error = %e, "background settlement failed");
            }
            result
        })
    }

    /// Settle `key` and switch the payout address to `beneficiary`.
    ///
    /// The change is tracked as `Pending` until the chain reports the new
    /// beneficiary or `timeout` elapses.
    pub async fn settle_with_beneficiary(
        &self,
        key: ChannelKey,
        beneficiary: Address,
        timeout: Duration,
    ) -> Result<BeneficiaryChangeStatus, SettlementError> {
        self.beneficiary_changes
            .insert(key.identity, BeneficiaryChangeStatus::pending(beneficiary));
        tracing::info!(channel = %key, %beneficiary, "beneficiary change requested");

        if let Err(e) = self.run(key, SettleMode::Beneficiary(beneficiary), self.config.max_wait).await {
            self.set_beneficiary_status(key.identity, beneficiary, BeneficiaryChangeState::Failed, Some(e.to_string()));
            return Err(e);
        }

        let status = match self.wait_for_beneficiary(key, beneficiary, timeout).await {
            Ok(()) => self.set_beneficiary_status(key.identity, beneficiary, BeneficiaryChangeState::Completed, None),
            Err(e) => {
                tracing::warn!(channel = %key, error = %e, "beneficiary change not observed");
                self.set_beneficiary_status(key.identity, beneficiary, BeneficiaryChangeState::Failed, Some(e.to_string()))
            }
        };
        Ok(status)
    }

    fn set_beneficiary_status(
        &self,
        identity: Identity,
        beneficiary: Address,
        state: BeneficiaryChangeState,
        error: Option<String>,
    ) -> BeneficiaryChangeStatus {
        let status = BeneficiaryChangeStatus {
            state,
            beneficiary,
            error,
        };
        self.beneficiary_changes.insert(identity, status.clone());
        status
    }

    async fn wait_for_beneficiary(
        &self,
        key: ChannelKey,
        beneficiary: Address,
        timeout: Duration,
    ) -> Result<(), SettlementError> {
        let deadline = Instant::now() + timeout;
        loop {
            match bounded(
                self.config.bc_timeout,
                "beneficiary",
                self.reader.beneficiary(key.chain_id, key.identity),
            )
            .await
            {
                Ok(current) if current == beneficiary => return Ok(()),
                Ok(_) => {}
                Err(e) => tracing::debug!(channel = %key, error = %e, "beneficiary read failed"),
            }
            if Instant::now() >= deadline {
                return Err(SettlementError::SettlementTimeout(timeout));
            }
            tokio::time::sleep_until((Instant::now() + self.config.poll_interval).min(deadline)).await;
        }
    }

    async fn run(
        &self,
        key: ChannelKey,
        mode: SettleMode,
        max_wait: Duration,
    ) -> Result<SettlementHistoryEntry, SettlementError> {
        let mut guard = InFlight::acquire(&self.slots, key)?;
        tracing::debug!(channel = %key, ?mode, "settlement triggered");

        let mut reconciled = None;
        let earlier = self.slots.get(&key).and_then(|s| s.pending.clone());
        if let Some(pending) = earlier {
            let status = bounded(
                self.config.bc_timeout,
                "transaction status",
                self.reader.transaction_status(key.chain_id, pending.tx_hash),
            )
            .await;
            match status {
                Ok(TxStatus::Confirmed { fees }) => {
                    self.clear_pending(&key);
                    tracing::info!(channel = %key, tx = %pending.tx_hash, "late settlement confirmation");
                    reconciled = Some(self.complete(key, &pending, fees));
                }
                Ok(TxStatus::Pending) => {
                    self.clear_pending(&key);
                    tracing::debug!(channel = %key, tx = %pending.tx_hash, "still waiting on earlier settlement");
                    guard.submitted(pending.clone())?;
                    return self.await_settlement(guard, key, pending, max_wait).await;
                }
                Ok(TxStatus::Failed(cause)) => {
                    self.clear_pending(&key);
                    tracing::warn!(channel = %key, tx = %pending.tx_hash, %cause, "earlier settlement reverted");
                }
                Err(e) => {
                    guard.finish(
                        SettlementEvent::Fail,
                        self.outcome(SettlementState::Failed, Some(pending.tx_hash), pending.entry.amount, Some(&e)),
                    )?;
                    return Err(e);
                }
            }
        }

        let channel = match self.repository.force_refresh(&key).await {
            Ok(channel) => channel,
            Err(e) => {
                guard.finish(SettlementEvent::Fail, self.outcome(SettlementState::Failed, None, 0, Some(&e)))?;
                return Err(e);
            }
        };

        let unsettled = channel.unsettled();
        let qualifies = !channel.promises.is_empty()
            && match mode {
                SettleMode::Automatic => channel.needs_settling(self.config.threshold),
                SettleMode::Forced => unsettled > 0,
                SettleMode::Beneficiary(_) => true,
            };
        if !qualifies {
            return match reconciled {
                Some(entry) => {
                    guard.reconciled(self.outcome(
                        SettlementState::Confirmed,
                        Some(entry.tx_hash),
                        entry.amount,
                        None,
                    ))?;
                    match mode {
                        SettleMode::Beneficiary(_) => Err(SettlementError::NothingToSettle(key)),
                        _ => Ok(entry),
                    }
                }
                None => {
                    guard.abandon()?;
                    Err(SettlementError::NothingToSettle(key))
                }
            };
        }

        let total = channel.promised();
        let request = SettlementRequest {
            chain_id: key.chain_id,
            identity: key.identity,
            hermes_id: key.hermes_id,
            channel_id: channel.channel_id,
            amount: total,
            promises: channel.promises.values().cloned().collect(),
        };
        let submitted = match mode {
            SettleMode::Beneficiary(beneficiary) => {
                self.transactor.settle_with_beneficiary(&request, beneficiary).await
            }
            _ => self.transactor.settle(&request).await,
        };
        let tx_hash = match submitted {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                tracing::warn!(channel = %key, error = %e, "settlement submission failed");
                guard.finish(SettlementEvent::Fail, self.outcome(SettlementState::Failed, None, unsettled, Some(&e)))?;
                return Err(e);
            }
        };
        let pending = PendingSettlement {
            tx_hash,
            settled_total: total,
            entry: SettlementHistoryEntry {
                tx_hash,
                provider_id: key.identity,
                hermes_id: key.hermes_id,
                channel_address: channel.channel_id,
                beneficiary: match mode {
                    SettleMode::Beneficiary(beneficiary) => beneficiary,
                    _ => channel.beneficiary,
                },
                amount: unsettled,
                settled_at: Utc::now(),
                fees: 0,
            },
        };
        guard.submitted(pending.clone())?;
        tracing::info!(channel = %key, tx = %tx_hash, amount = %unsettled, "settlement submitted");

        self.await_settlement(guard, key, pending, max_wait).await
    }

    /// Wait for a submitted transaction and record it once confirmed.
    async fn await_settlement(
        &self,
        mut guard: InFlight<'_>,
        key: ChannelKey,
        pending: PendingSettlement,
        max_wait: Duration,
    ) -> Result<SettlementHistoryEntry, SettlementError> {
        let tx_hash = pending.tx_hash;
        let amount = pending.entry.amount;
        match self.wait_for_confirmation(key, tx_hash, max_wait).await {
            Ok(fees) => {
                guard.pending = None;
                let entry = self.complete(key, &pending, fees);
                guard.finish(
                    SettlementEvent::Confirm,
                    self.outcome(SettlementState::Confirmed, Some(tx_hash), amount, None),
                )?;
                tracing::info!(channel = %key, tx = %tx_hash, amount = %amount, fees = %fees, "settlement confirmed");
                Ok(entry)
            }
            Err(e) => {
                let (event, state) = match e {
                    SettlementError::SettlementTimeout(_) | SettlementError::Cancelled => {
                        (SettlementEvent::Timeout, SettlementState::TimedOut)
                    }
                    _ => {
                        guard.pending = None;
                        (SettlementEvent::Fail, SettlementState::Failed)
                    }
                };
                tracing::warn!(channel = %key, tx = %tx_hash, error = %e, "settlement not confirmed");
                guard.finish(event, self.outcome(state, Some(tx_hash), amount, Some(&e)))?;
                Err(e)
            }
        }
    }

    /// Record a confirmed transaction: history entry, channel snapshot, bus.
    fn complete(&self, key: ChannelKey, pending: &PendingSettlement, fees: Amount) -> SettlementHistoryEntry {
        let entry = SettlementHistoryEntry {
            settled_at: Utc::now(),
            fees,
            ..pending.entry.clone()
        };
        if entry.amount > 0 {
            if let Err(e) = self.history.append(entry.clone()) {
                tracing::error!(tx = %entry.tx_hash, error = %e, "failed to record settlement history");
            }
        }
        self.repository.apply_settlement(&key, pending.settled_total);
        self.bus.publish(Event::SettlementCompleted(SettlementCompleted {
            key,
            settled_total: pending.settled_total,
            entry: entry.clone(),
        }));
        entry
    }

    fn clear_pending(&self, key: &ChannelKey) {
        if let Some(mut slot) = self.slots.get_mut(key) {
            slot.pending = None;
        }
    }

    /// Poll `tx_hash` until it resolves, `max_wait` elapses, or shutdown.
    async fn wait_for_confirmation(
        &self,
        key: ChannelKey,
        tx_hash: TxHash,
        max_wait: Duration,
    ) -> Result<Amount, SettlementError> {
        let deadline = Instant::now() + max_wait;
        let mut shutdown = self.shutdown.clone();
        loop {
            match bounded(
                self.config.bc_timeout,
                "transaction status",
                self.reader.transaction_status(key.chain_id, tx_hash),
            )
            .await
            {
                Ok(TxStatus::Confirmed { fees }) => return Ok(fees),
                Ok(TxStatus::Failed(cause)) => return Err(SettlementError::SettlementSubmit(cause)),
                Ok(TxStatus::Pending) => {}
                Err(e) => tracing::debug!(tx = %tx_hash, error = %e, "transaction status read failed"),
            }

            if Instant::now() >= deadline {
                return Err(SettlementError::SettlementTimeout(max_wait));
            }
            let next_poll = (Instant::now() + self.config.poll_interval).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(next_poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(SettlementError::Cancelled);
                    }
                }
            }
        }
    }

    fn outcome(
        &self,
        state: SettlementState,
        tx_hash: Option<TxHash>,
        amount: Amount,
        error: Option<&SettlementError>,
    ) -> SettlementOutcome {
        SettlementOutcome {
            state,
            tx_hash,
            amount,
            error: error.map(|e| e.to_string()),
            finished_at: Utc::now(),
        }
    }

    /// Spawn an automatic attempt when the cached snapshot qualifies or an
    /// earlier transaction still awaits its confirmation.
    fn consider(self: &Arc<Self>, key: ChannelKey) {
        let qualifies = self
            .repository
            .cached(&key)
            .map(|ch| ch.needs_settling(self.config.threshold))
            .unwrap_or(false);
        let pending = self.pending_settlement(&key).is_some();
        if !(qualifies || pending) || self.state(&key).is_in_flight() {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.maybe_settle(key).await {
                tracing::warn!(channel = %key, error = %e, "automatic settlement failed");
            }
        });
    }

    /// Watch balance changes, session ends and the re-check tick until
    /// shutdown.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut events = self
            .bus
            .subscribe(&[Topic::ChannelBalanceChanged, Topic::SessionEnded]);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut recheck = tokio::time::interval(self.config.recheck_interval);
            recheck.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("promise settler shutting down");
                        break;
                    }
                    _ = recheck.tick() => {
                        let mut keys = self.repository.cached_keys();
                        for key in self.pending_keys() {
                            if !keys.contains(&key) {
                                keys.push(key);
                            }
                        }
                        for key in keys {
                            self.consider(key);
                        }
                    }
                    event = events.recv() => match event {
                        Some(Event::ChannelBalanceChanged(ev)) => self.consider(ev.key),
                        Some(Event::SessionEnded(ev)) => self.consider(ev.key),
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        })
    }
}
