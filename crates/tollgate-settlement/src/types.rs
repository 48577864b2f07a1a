use serde::{Deserialize, Serialize};

use tollgate_core::types::{
    Address, Amount, ChainId, HermesId, Identity, Promise,
};

/// Channel state as stored by the channel contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainChannel {
    /// Confirmed channel balance.
    pub balance: Amount,
    /// Cumulative promise amount already settled.
    pub settled: Amount,
}

/// Liveness of a hermes operator on one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HermesStatus {
    pub is_active: bool,
    /// Hermes fee in basis points.
    pub fee: u16,
}

/// Outcome of a submitted transaction as seen by the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed { fees: Amount },
    Failed(String),
}

/// Transaction payload for registering an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub chain_id: ChainId,
    pub identity: Identity,
    pub beneficiary: Address,
    pub stake: Amount,
    /// Registration fee quoted by the transactor.
    pub fee: Amount,
    pub referral_token: Option<String>,
}

/// Transaction payload for settling a channel up to its promised total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRequest {
    pub chain_id: ChainId,
    pub identity: Identity,
    pub hermes_id: HermesId,
    pub channel_id: Address,
    /// Cumulative channel amount the settlement brings `settled` up to.
    pub amount: Amount,
    /// Latest promise of every agreement backing `amount`.
    pub promises: Vec<Promise>,
}
