use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tollgate_core::types::{
    Address, Amount, ChainId, HermesId, Identity, RegistrationStatus, TransactorFees, TxHash, H256,
};

use crate::error::SettlementError;
use crate::traits::{ChainReader, Transactor};
use crate::types::{HermesStatus, OnChainChannel, RegistrationRequest, SettlementRequest, TxStatus};

/// How submitted transactions resolve when polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationMode {
    /// Confirmed on the first status poll.
    Immediate,
    /// Pending for the given number of polls, then confirmed.
    AfterPolls(u32),
    /// Pending forever.
    Never,
    /// Reverted with the given reason.
    Fail(String),
}

#[derive(Debug, Clone)]
enum TxKind {
    Settle {
        hermes_id: HermesId,
        channel_id: Address,
        identity: Identity,
        amount: Amount,
        beneficiary: Option<Address>,
    },
    Register {
        identity: Identity,
        beneficiary: Address,
    },
}

#[derive(Debug, Clone)]
struct ChainTx {
    chain_id: ChainId,
    kind: TxKind,
    polls: u32,
    status: TxStatus,
}

/// In-memory chain implementing both [`Transactor`] and [`ChainReader`].
///
/// Channel balances, registrations, beneficiaries and hermes liveness live
/// in concurrent maps. Submitted transactions take effect once a status
/// poll resolves them according to the configured [`ConfirmationMode`].
/// Used by local nodes and by tests, which steer failures through the
/// setters.
pub struct InternalChain {
    channels: DashMap<(ChainId, Address), OnChainChannel>,
    registrations: DashMap<(ChainId, Identity), RegistrationStatus>,
    beneficiaries: DashMap<(ChainId, Identity), Address>,
    hermes: DashMap<(ChainId, HermesId), HermesStatus>,
    /// Funds each hermes can pay out; unlimited when absent.
    hermes_funds: DashMap<(ChainId, HermesId), Amount>,
    txs: DashMap<TxHash, ChainTx>,
    settlement_mode: Mutex<ConfirmationMode>,
    registration_mode: Mutex<ConfirmationMode>,
    fail_submissions: AtomicBool,
    fail_reads: AtomicBool,
    fees: TransactorFees,
    nonce: AtomicU64,
    settle_calls: AtomicU32,
    register_calls: AtomicU32,
}

impl InternalChain {
    pub fn new() -> Self {
        Self::with_fees(TransactorFees {
            registration: 0,
            settlement: 0,
            hermes: 0,
        })
    }

    pub fn with_fees(fees: TransactorFees) -> Self {
        Self {
            channels: DashMap::new(),
            registrations: DashMap::new(),
            beneficiaries: DashMap::new(),
            hermes: DashMap::new(),
            hermes_funds: DashMap::new(),
            txs: DashMap::new(),
            settlement_mode: Mutex::new(ConfirmationMode::Immediate),
            registration_mode: Mutex::new(ConfirmationMode::Immediate),
            fail_submissions: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fees,
            nonce: AtomicU64::new(0),
            settle_calls: AtomicU32::new(0),
            register_calls: AtomicU32::new(0),
        }
    }

    pub fn set_channel_balance(&self, chain_id: ChainId, channel_id: Address, balance: Amount) {
        self.channels.entry((chain_id, channel_id)).or_default().balance = balance;
    }

    pub fn set_registration_status(&self, chain_id: ChainId, identity: Identity, status: RegistrationStatus) {
        self.registrations.insert((chain_id, identity), status);
    }

    pub fn set_hermes_status(&self, chain_id: ChainId, hermes_id: HermesId, status: HermesStatus) {
        self.hermes.insert((chain_id, hermes_id), status);
    }

    pub fn set_hermes_funds(&self, chain_id: ChainId, hermes_id: HermesId, funds: Amount) {
        self.hermes_funds.insert((chain_id, hermes_id), funds);
    }

    pub fn set_settlement_mode(&self, mode: ConfirmationMode) {
        *self.settlement_mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    pub fn set_registration_mode(&self, mode: ConfirmationMode) {
        *self.registration_mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    /// Make every submission fail until reset.
    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::SeqCst);
    }

    /// Make every read fail until reset.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of settlement transactions submitted so far.
    pub fn settle_calls(&self) -> u32 {
        self.settle_calls.load(Ordering::SeqCst)
    }

    /// Number of registration transactions submitted so far.
    pub fn register_calls(&self) -> u32 {
        self.register_calls.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> Result<(), SettlementError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SettlementError::ChainRead("rpc unavailable".into()));
        }
        Ok(())
    }

    fn check_submissions(&self) -> Result<(), SettlementError> {
        if self.fail_submissions.load(Ordering::SeqCst) {
            return Err(SettlementError::SettlementSubmit("transaction rejected by rpc".into()));
        }
        Ok(())
    }

    fn next_tx_hash(&self, chain_id: ChainId) -> TxHash {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&chain_id.to_be_bytes());
        buf.extend_from_slice(&nonce.to_be_bytes());
        H256(tollgate_crypto::hash(&buf))
    }

    fn submit(&self, chain_id: ChainId, kind: TxKind) -> TxHash {
        let tx_hash = self.next_tx_hash(chain_id);
        self.txs.insert(
            tx_hash,
            ChainTx {
                chain_id,
                kind,
                polls: 0,
                status: TxStatus::Pending,
            },
        );
        tx_hash
    }

    fn submit_settlement(
        &self,
        request: &SettlementRequest,
        beneficiary: Option<Address>,
    ) -> Result<TxHash, SettlementError> {
        self.check_submissions()?;
        let settled = self
            .channels
            .get(&(request.chain_id, request.channel_id))
            .map(|c| c.settled)
            .unwrap_or(0);
        let amount = request.amount.saturating_sub(settled);
        if let Some(funds) = self.hermes_funds.get(&(request.chain_id, request.hermes_id)) {
            if amount > *funds {
                return Err(SettlementError::InsufficientBalance {
                    available: *funds,
                    required: amount,
                });
            }
        }

        self.settle_calls.fetch_add(1, Ordering::SeqCst);
        let tx_hash = self.submit(
            request.chain_id,
            TxKind::Settle {
                hermes_id: request.hermes_id,
                channel_id: request.channel_id,
                identity: request.identity,
                amount: request.amount,
                beneficiary,
            },
        );
        tracing::info!(
            chain_id = request.chain_id,
            channel = %request.channel_id,
            amount = %request.amount,
            tx = %tx_hash,
            "Internal settlement submitted"
        );
        Ok(tx_hash)
    }

    /// Advance a transaction by one poll and apply its effects on confirmation.
    fn poll_tx(&self, tx_hash: &TxHash) -> Option<TxStatus> {
        let mut tx = self.txs.get_mut(tx_hash)?;
        if tx.status != TxStatus::Pending {
            return Some(tx.status.clone());
        }

        tx.polls += 1;
        let mode = match tx.kind {
            TxKind::Settle { .. } => self.settlement_mode.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            TxKind::Register { .. } => {
                self.registration_mode.lock().unwrap_or_else(PoisonError::into_inner).clone()
            }
        };
        let resolved = match mode {
            ConfirmationMode::Immediate => Some(true),
            ConfirmationMode::AfterPolls(n) if tx.polls > n => Some(true),
            ConfirmationMode::AfterPolls(_) | ConfirmationMode::Never => None,
            ConfirmationMode::Fail(reason) => {
                tx.status = TxStatus::Failed(reason);
                Some(false)
            }
        };

        let chain_id = tx.chain_id;
        match (resolved, tx.kind.clone()) {
            (Some(true), TxKind::Settle { hermes_id, channel_id, identity, amount, beneficiary }) => {
                let mut channel = self.channels.entry((chain_id, channel_id)).or_default();
                let delta = amount.saturating_sub(channel.settled);
                channel.settled = channel.settled.max(amount);
                drop(channel);
                if let Some(mut funds) = self.hermes_funds.get_mut(&(chain_id, hermes_id)) {
                    *funds = funds.saturating_sub(delta);
                }
                if let Some(beneficiary) = beneficiary {
                    self.beneficiaries.insert((chain_id, identity), beneficiary);
                }
                tx.status = TxStatus::Confirmed {
                    fees: self.fees.settlement,
                };
            }
            (Some(true), TxKind::Register { identity, beneficiary }) => {
                self.registrations.insert((chain_id, identity), RegistrationStatus::Registered);
                self.beneficiaries.insert((chain_id, identity), beneficiary);
                tx.status = TxStatus::Confirmed {
                    fees: self.fees.registration,
                };
            }
            (Some(false), TxKind::Register { identity, .. }) => {
                self.registrations.insert((chain_id, identity), RegistrationStatus::RegistrationError);
            }
            _ => {}
        }
        Some(tx.status.clone())
    }
}

impl Default for InternalChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transactor for InternalChain {
    async fn register_identity(&self, request: &RegistrationRequest) -> Result<TxHash, SettlementError> {
        self.check_submissions()?;
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.registrations
            .insert((request.chain_id, request.identity), RegistrationStatus::InProgress);
        let tx_hash = self.submit(
            request.chain_id,
            TxKind::Register {
                identity: request.identity,
                beneficiary: request.beneficiary,
            },
        );
        tracing::info!(chain_id = request.chain_id, identity = %request.identity, tx = %tx_hash, "Internal registration submitted");
        Ok(tx_hash)
    }

    async fn settle(&self, request: &SettlementRequest) -> Result<TxHash, SettlementError> {
        self.submit_settlement(request, None)
    }

    async fn settle_with_beneficiary(
        &self,
        request: &SettlementRequest,
        beneficiary: Address,
    ) -> Result<TxHash, SettlementError> {
        self.submit_settlement(request, Some(beneficiary))
    }

    async fn fees(&self, _chain_id: ChainId) -> Result<TransactorFees, SettlementError> {
        self.check_reads()?;
        Ok(self.fees)
    }
}

#[async_trait]
impl ChainReader for InternalChain {
    async fn channel(&self, chain_id: ChainId, channel_id: Address) -> Result<OnChainChannel, SettlementError> {
        self.check_reads()?;
        Ok(self.channels.get(&(chain_id, channel_id)).map(|c| *c).unwrap_or_default())
    }

    async fn registration_status(
        &self,
        chain_id: ChainId,
        identity: Identity,
    ) -> Result<RegistrationStatus, SettlementError> {
        self.check_reads()?;
        let pending: Vec<TxHash> = self
            .txs
            .iter()
            .filter(|tx| {
                tx.chain_id == chain_id
                    && tx.status == TxStatus::Pending
                    && matches!(tx.kind, TxKind::Register { identity: id, .. } if id == identity)
            })
            .map(|tx| *tx.key())
            .collect();
        for tx_hash in pending {
            self.poll_tx(&tx_hash);
        }
        Ok(self
            .registrations
            .get(&(chain_id, identity))
            .map(|s| *s)
            .unwrap_or(RegistrationStatus::Unregistered))
    }

    async fn beneficiary(&self, chain_id: ChainId, identity: Identity) -> Result<Address, SettlementError> {
        self.check_reads()?;
        Ok(self
            .beneficiaries
            .get(&(chain_id, identity))
            .map(|b| *b)
            .unwrap_or_else(|| identity.address()))
    }

    async fn hermes_status(&self, chain_id: ChainId, hermes_id: HermesId) -> Result<HermesStatus, SettlementError> {
        self.check_reads()?;
        Ok(self.hermes.get(&(chain_id, hermes_id)).map(|s| *s).unwrap_or(HermesStatus {
            is_active: true,
            fee: self.fees.hermes,
        }))
    }

    async fn transaction_status(&self, _chain_id: ChainId, tx_hash: TxHash) -> Result<TxStatus, SettlementError> {
        self.check_reads()?;
        self.poll_tx(&tx_hash)
            .ok_or_else(|| SettlementError::ChainRead(format!("unknown transaction {}", tx_hash)))
    }
}
