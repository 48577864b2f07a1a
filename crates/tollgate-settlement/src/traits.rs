use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use tollgate_core::types::{
    Address, ChainId, HermesId, Identity, RegistrationStatus, TransactorFees, TxHash,
};

use crate::error::SettlementError;
use crate::types::{HermesStatus, OnChainChannel, RegistrationRequest, SettlementRequest, TxStatus};

/// Submits transactions on behalf of identities.
///
/// Implementations hand the transaction to the chain and return its hash
/// without waiting for confirmation.
#[async_trait]
pub trait Transactor: Send + Sync {
    /// Submit an identity registration.
    async fn register_identity(&self, request: &RegistrationRequest) -> Result<TxHash, SettlementError>;

    /// Settle the promise in `request` into the channel.
    async fn settle(&self, request: &SettlementRequest) -> Result<TxHash, SettlementError>;

    /// Settle and switch the identity's payout address in one transaction.
    async fn settle_with_beneficiary(
        &self,
        request: &SettlementRequest,
        beneficiary: Address,
    ) -> Result<TxHash, SettlementError>;

    /// Current fees for registration and settlement on `chain_id`.
    async fn fees(&self, chain_id: ChainId) -> Result<TransactorFees, SettlementError>;
}

/// Read-only view of contract state.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn channel(&self, chain_id: ChainId, channel_id: Address) -> Result<OnChainChannel, SettlementError>;

    async fn registration_status(
        &self,
        chain_id: ChainId,
        identity: Identity,
    ) -> Result<RegistrationStatus, SettlementError>;

    async fn beneficiary(&self, chain_id: ChainId, identity: Identity) -> Result<Address, SettlementError>;

    async fn hermes_status(&self, chain_id: ChainId, hermes_id: HermesId) -> Result<HermesStatus, SettlementError>;

    async fn transaction_status(&self, chain_id: ChainId, tx_hash: TxHash) -> Result<TxStatus, SettlementError>;
}

/// Run a chain call with an upper bound on its duration.
///
/// Elapsing the bound yields [`SettlementError::ChainRead`].
pub async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, SettlementError>
where
    F: Future<Output = Result<T, SettlementError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SettlementError::ChainRead(format!(
            "{} timed out after {:?}",
            what, limit
        ))),
    }
}
